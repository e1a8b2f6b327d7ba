//! HTTP transport built on rouille.
//!
//! # Purpose
//!
//! Accepts connections on the configured address with a bounded worker pool and
//! hands every request to the plugin context through the task queue. Worker
//! threads never touch session state: each request carries a one-shot response
//! channel, the worker posts it to the queue and blocks until the context (or a
//! frame responder on any thread) answers.
//!
//! # Key types
//!
//! - [`HttpRequest`] - transport-independent request with its response slot
//! - [`HttpResponse`] - status, content type, extra headers, body
//! - [`HttpServer`] - rouille server thread plus two-stage stop
//!
//! # Shutdown
//!
//! `shutdown()` stops the accept loop, answers new requests with 503, waits for
//! in-flight requests to be answered and only then reports completion. After
//! that no request can reach the context any more.

use anyhow::{Result, anyhow};
use crossbeam_channel::{Receiver, Sender, bounded};
use log::{debug, info, trace, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak, mpsc};
use std::thread;
use url::form_urlencoded;

use crate::core::task_queue::TaskQueue;

/// Response produced by the context or a window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=UTF-8",
            headers: Vec::new(),
            body: body.into().into_bytes(),
        }
    }

    pub fn html(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            content_type: "text/html; charset=UTF-8",
            headers: Vec::new(),
            body: body.into().into_bytes(),
        }
    }

    pub fn bytes(content_type: &'static str, body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type,
            headers: Vec::new(),
            body,
        }
    }

    /// Empty 200 answer for stale requests; the page script ignores it.
    pub fn empty() -> Self {
        Self::bytes("application/octet-stream", Vec::new())
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn into_rouille(self) -> rouille::Response {
        let mut response = rouille::Response::from_data(self.content_type, self.body)
            .with_status_code(self.status)
            .with_additional_header("Cache-Control", "no-store");
        for (name, value) in self.headers {
            response = response.with_additional_header(name, value);
        }
        response
    }
}

/// Request delivered to the context.
///
/// Consumed by exactly one `send_response`. Dropping it unanswered makes the
/// transport reply 500.
#[derive(Debug)]
pub struct HttpRequest {
    method: String,
    path: String,
    params: HashMap<String, String>,
    basic_auth: Option<String>,
    user_agent: String,
    responder: Sender<HttpResponse>,
}

impl HttpRequest {
    /// Create a request and the receiver its response will arrive on.
    pub fn new(
        method: impl Into<String>,
        path: impl Into<String>,
        query: &str,
        basic_auth: Option<String>,
    ) -> (Self, Receiver<HttpResponse>) {
        let (tx, rx) = bounded(1);
        let request = Self {
            method: method.into(),
            path: path.into(),
            params: parse_query(query),
            basic_auth,
            user_agent: String::new(),
            responder: tx,
        };
        (request, rx)
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Query/form parameter by name
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// `user:password` from the Authorization header, if any
    pub fn basic_auth_credentials(&self) -> Option<&str> {
        self.basic_auth.as_deref()
    }

    pub fn send_response(self, response: HttpResponse) {
        if self.responder.send(response).is_err() {
            debug!("Response for {} {} dropped, client gone", self.method, self.path);
        }
    }

    pub fn send_text(self, status: u16, body: impl Into<String>) {
        self.send_response(HttpResponse::text(status, body));
    }
}

/// Parse `a=1&b=x%2Fy` into a map; later duplicates win.
pub fn parse_query(query: &str) -> HashMap<String, String> {
    form_urlencoded::parse(query.as_bytes())
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect()
}

/// Receiver of requests that passed through the task queue.
pub trait HttpRequestSink: Send + Sync {
    /// Runs on the pumping thread.
    fn on_http_request(&self, request: HttpRequest);
}

/// In-flight accounting shared by worker threads and the shutdown thread
struct ServerShared {
    stopping: AtomicBool,
    in_flight: Mutex<usize>,
    idle: Condvar,
}

impl ServerShared {
    fn enter(&self) {
        *self.in_flight.lock().unwrap_or_else(|e| e.into_inner()) += 1;
    }

    fn leave(&self) {
        let mut count = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        *count -= 1;
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut count = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        while *count > 0 {
            count = self.idle.wait(count).unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// rouille HTTP server feeding the task queue
pub struct HttpServer {
    local_addr: SocketAddr,
    shared: Arc<ServerShared>,
    stop_tx: Option<mpsc::Sender<()>>,
    server_thread: Option<thread::JoinHandle<()>>,
}

impl HttpServer {
    /// Bind `addr` and start serving with at most `max_threads` workers.
    pub fn start(
        addr: SocketAddr,
        max_threads: usize,
        task_queue: Arc<TaskQueue>,
        sink: Weak<dyn HttpRequestSink>,
    ) -> Result<Self> {
        let shared = Arc::new(ServerShared {
            stopping: AtomicBool::new(false),
            in_flight: Mutex::new(0),
            idle: Condvar::new(),
        });

        let handler_shared = Arc::clone(&shared);
        let server = rouille::Server::new(addr, move |request| {
            Self::handle_request(request, &handler_shared, &task_queue, &sink)
        })
        .map_err(|e| anyhow!("Failed to bind HTTP server to {}: {}", addr, e))?
        .pool_size(max_threads);

        let local_addr = server.server_addr();
        let (server_thread, stop_tx) = server.stoppable();

        info!("HTTP server listening on http://{} ({} threads max)", local_addr, max_threads);

        Ok(Self {
            local_addr,
            shared,
            stop_tx: Some(stop_tx),
            server_thread: Some(server_thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn handle_request(
        request: &rouille::Request,
        shared: &Arc<ServerShared>,
        task_queue: &Arc<TaskQueue>,
        sink: &Weak<dyn HttpRequestSink>,
    ) -> rouille::Response {
        // Counted before the check so wait_idle() cannot miss this request
        shared.enter();
        if shared.stopping.load(Ordering::Acquire) {
            shared.leave();
            return HttpResponse::text(503, "Service Unavailable").into_rouille();
        }

        let basic_auth = rouille::input::basic_http_auth(request)
            .map(|auth| format!("{}:{}", auth.login, auth.password));
        let (http_request, response_rx) = HttpRequest::new(
            request.method(),
            request.url(),
            request.raw_query_string(),
            basic_auth,
        );
        let http_request =
            http_request.with_user_agent(request.header("User-Agent").unwrap_or_default());
        trace!("{} {} from {}", request.method(), request.url(), request.remote_addr());

        let sink = sink.clone();
        task_queue.post(move || match sink.upgrade() {
            Some(sink) => sink.on_http_request(http_request),
            None => warn!("HTTP request arrived after plugin context was dropped"),
        });

        let response = match response_rx.recv() {
            Ok(response) => response.into_rouille(),
            Err(_) => HttpResponse::text(500, "Internal Server Error").into_rouille(),
        };

        shared.leave();
        response
    }

    /// Stop accepting requests; `on_complete` runs on a helper thread once the
    /// server thread has exited and every in-flight request has been answered.
    pub fn shutdown<F>(&mut self, on_complete: F)
    where
        F: FnOnce() + Send + 'static,
    {
        info!("Shutting down HTTP server on {}", self.local_addr);
        self.shared.stopping.store(true, Ordering::Release);

        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        let server_thread = self.server_thread.take();
        let shared = Arc::clone(&self.shared);

        let spawned = thread::Builder::new()
            .name("frameway-http-shutdown".to_string())
            .spawn(move || {
                if let Some(handle) = server_thread {
                    let _ = handle.join();
                }
                shared.wait_idle();
                debug!("HTTP server stopped, no requests in flight");
                on_complete();
            });
        if let Err(e) = spawned {
            fatal!("Failed to spawn HTTP shutdown thread: {}", e);
        }
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        // Only reached without shutdown() when the context never finished
        // starting; stop the accept loop anyway.
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
    }
}
