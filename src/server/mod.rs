//! HTTP side of the plugin: transport and served documents.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────┐     TaskQueue::post      ┌──────────────────────┐
//! │  rouille worker threads │  ── HttpRequest ──────▶  │  pump_events()       │
//! │  (http-max-threads)     │                          │  Context → Window    │
//! │                         │                          │                      │
//! │  blocks on response     │  ◀── HttpResponse ────   │  send_response()     │
//! └─────────────────────────┘     one-shot channel     └──────────────────────┘
//!              ▲                                                 │
//!              │                 FrameResponder                  │
//!              └───────────── (any thread, later) ◀──── handler ◀┘
//! ```
//!
//! # Dependencies
//!
//! - `rouille` - sync HTTP server with a bounded thread pool
//! - `crossbeam-channel` - one-shot response slots
//! - `serde_json` - page parameters embedded in the main page
//!
//! # Used by
//!
//! - `core::context` - starts/stops [`HttpServer`], receives [`HttpRequest`]
//! - `core::window` - answers requests, renders pages from [`html`]

pub mod html;
mod http;

pub use http::{HttpRequest, HttpRequestSink, HttpResponse, HttpServer, parse_query};
