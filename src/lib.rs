//! frameway - serve a running graphical program to browsers as image-based windows
//!
//! The host creates a [`Context`], starts it, registers windows with a
//! [`WindowEventHandler`] each and calls [`Context::pump_events`] whenever the
//! events-ready callback fires. Browsers open `http://ADDR/{handle}/`, receive
//! frames as PNG images and send input events back with each image request.

/// Log an unrecoverable API misuse and panic.
///
/// Release builds abort on panic, so a fatal error ends the process.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!("FATAL: {}", format_args!($($arg)*));
        panic!($($arg)*)
    }};
}

pub mod cli;
pub mod config;
pub mod core;
pub mod encode;
pub mod server;
pub mod utils;

pub use config::{Config, OptionDoc};
pub use crate::core::{Context, FrameResponder, WindowEventHandler};
pub use encode::Frame;
