//! Plugin context: lifecycle, API serialization and window registry.
//!
//! # Lifecycle
//!
//! ```text
//!  init()        start()                     shutdown complete
//! ───────▶ Pending ───────▶ Running ─────────────────────────▶ ShutdownComplete
//!                              │
//!                              │ shutdown():
//!                              │   None ─▶ WaitingOnTransport   (HTTP server stopping)
//!                              │        ─▶ WaitingOnTaskQueue   (queue draining)
//!                              ▼
//!                        on_shutdown_complete()
//! ```
//!
//! # Locking
//!
//! Every API call takes the [`ApiLock`]. Calls that need a running context
//! (everything except `start`) take a [`RunningApiLock`], which also checks the
//! lifecycle and holds the task queue's active lock, so queued tasks and API
//! calls never overlap. Task bodies (HTTP requests, window timers) therefore
//! run only inside `pump_events`, one at a time.
//!
//! Window handlers are invoked while the lock is held and must not call back
//! into the context.
//!
//! # Used by
//!
//! - host applications (see `main.rs`)

use anyhow::Result;
use log::{debug, info, trace, warn};
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use super::api_lock::ApiLock;
use super::task_queue::{ActiveTaskQueueLock, TaskQueue, TaskQueueEventHandler};
use super::window::{INACTIVITY_TIMEOUT, TimeoutCallback, Window};
use super::window_events::WindowEventHandler;
use crate::config::{Config, OptionDoc, option_docs};
use crate::server::{HttpRequest, HttpRequestSink, HttpResponse, HttpServer};
use crate::utils::secret::credentials_match;

/// Challenge sent with 401 answers
pub const AUTH_CHALLENGE: &str = r#"Basic realm="Restricted", charset="UTF-8""#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Pending,
    Running,
    ShutdownComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    None,
    WaitingOnTransport,
    WaitingOnTaskQueue,
}

type EventsReadyCallback = Arc<dyn Fn() + Send + Sync>;
type ShutdownCompleteCallback = Box<dyn FnOnce() + Send>;

struct ContextState {
    lifecycle: Lifecycle,
    shutdown_phase: ShutdownPhase,
    on_shutdown_complete: Option<ShutdownCompleteCallback>,
    task_queue: Option<Arc<TaskQueue>>,
    http_server: Option<HttpServer>,
    windows: HashMap<u64, Window>,
}

struct ContextInner {
    config: Config,
    window_inactivity_timeout: Duration,
    in_api_call: AtomicBool,
    /// Set once by `start`; read from any thread by queue notifications
    on_events_ready: OnceCell<EventsReadyCallback>,
    state: Mutex<ContextState>,
}

/// API lock plus running-state check plus the task queue active lock.
///
/// Field order matters: the active lock is released before the API lock.
struct RunningApiLock<'a> {
    task_queue: Arc<TaskQueue>,
    _active: ActiveTaskQueueLock,
    _api: ApiLock<'a>,
}

impl<'a> RunningApiLock<'a> {
    fn acquire(inner: &'a ContextInner) -> Self {
        let api = ApiLock::acquire(&inner.in_api_call);
        let task_queue = {
            let state = inner.lock_state();
            match state.lifecycle {
                Lifecycle::Pending => fatal!("Plugin API call on a context that has not been started"),
                Lifecycle::ShutdownComplete => {
                    fatal!("Plugin API call on a context that has already been shut down")
                }
                Lifecycle::Running => {}
            }
            match &state.task_queue {
                Some(queue) => Arc::clone(queue),
                None => fatal!("Running context has no task queue"),
            }
        };
        let active = task_queue.lock_active();

        Self {
            task_queue,
            _active: active,
            _api: api,
        }
    }
}

/// Plugin context exposed to the host application.
///
/// Not `Clone`; the host owns it and drives it through `start`, `pump_events`
/// and `shutdown`. Dropping a running context is fatal.
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Create a context from `(name, value)` option pairs.
    pub fn init<N, V>(options: impl IntoIterator<Item = (N, V)>) -> Result<Self>
    where
        N: AsRef<str>,
        V: AsRef<str>,
    {
        let config = Config::from_options(options)?;
        Ok(Self::from_config(config, INACTIVITY_TIMEOUT))
    }

    fn from_config(config: Config, window_inactivity_timeout: Duration) -> Self {
        debug!("Plugin context created: {:?}", config);
        Self {
            inner: Arc::new(ContextInner {
                config,
                window_inactivity_timeout,
                in_api_call: AtomicBool::new(false),
                on_events_ready: OnceCell::new(),
                state: Mutex::new(ContextState {
                    lifecycle: Lifecycle::Pending,
                    shutdown_phase: ShutdownPhase::None,
                    on_shutdown_complete: None,
                    task_queue: None,
                    http_server: None,
                    windows: HashMap::new(),
                }),
            }),
        }
    }

    /// Documentation for every accepted option
    pub fn option_docs() -> Vec<OptionDoc> {
        option_docs()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.lock_state().lifecycle
    }

    /// Current shutdown step; `None` unless a shutdown is in progress.
    pub fn shutdown_phase(&self) -> ShutdownPhase {
        self.inner.lock_state().shutdown_phase
    }

    /// Start the task queue and the HTTP server.
    ///
    /// `on_events_ready` may be called from any thread whenever
    /// `pump_events` should be called soon; it must not call the API itself.
    /// `on_shutdown_complete` is called once, from within `pump_events`,
    /// when shutdown has finished.
    pub fn start<E, S>(&self, on_events_ready: E, on_shutdown_complete: S)
    where
        E: Fn() + Send + Sync + 'static,
        S: FnOnce() + Send + 'static,
    {
        let _api = ApiLock::acquire(&self.inner.in_api_call);

        let task_queue = {
            let mut state = self.inner.lock_state();
            match state.lifecycle {
                Lifecycle::Running => fatal!("Starting a plugin context that is already running"),
                Lifecycle::ShutdownComplete => {
                    fatal!("Starting a plugin context that has already been shut down")
                }
                Lifecycle::Pending => {}
            }

            if self.inner.on_events_ready.set(Arc::new(on_events_ready)).is_err() {
                fatal!("Plugin context events-ready callback installed twice");
            }
            state.on_shutdown_complete = Some(Box::new(on_shutdown_complete));
            state.lifecycle = Lifecycle::Running;

            let handler: Weak<dyn TaskQueueEventHandler> = Arc::downgrade(&self.inner) as _;
            let queue = Arc::new(TaskQueue::new(handler));
            state.task_queue = Some(Arc::clone(&queue));
            queue
        };

        let _active = task_queue.lock_active();
        let sink: Weak<dyn HttpRequestSink> = Arc::downgrade(&self.inner) as _;
        let server = HttpServer::start(
            self.inner.config.http_listen_addr,
            self.inner.config.http_max_threads,
            Arc::clone(&task_queue),
            sink,
        );
        let server = match server {
            Ok(server) => server,
            Err(e) => fatal!("Starting HTTP server failed: {:#}", e),
        };

        self.inner.lock_state().http_server = Some(server);
        info!("Plugin context running");
    }

    /// Begin shutdown; completion is reported through `on_shutdown_complete`.
    pub fn shutdown(&self) {
        let _lock = RunningApiLock::acquire(&self.inner);

        let mut state = self.inner.lock_state();
        if state.shutdown_phase != ShutdownPhase::None {
            fatal!("Requested shutdown of a plugin context that is already shutting down");
        }
        info!("Plugin context shutting down");
        state.shutdown_phase = ShutdownPhase::WaitingOnTransport;

        let Some(task_queue) = state.task_queue.clone() else {
            fatal!("Running context has no task queue");
        };
        let weak = Arc::downgrade(&self.inner);
        let Some(server) = state.http_server.as_mut() else {
            fatal!("Running context has no HTTP server");
        };
        server.shutdown(move || {
            task_queue.post(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_http_server_shutdown_complete();
                }
            });
        });
    }

    /// Run every task that is currently queued.
    pub fn pump_events(&self) {
        let lock = RunningApiLock::acquire(&self.inner);
        lock.task_queue.run_tasks();
    }

    /// Register a window and return the path the browser should open.
    ///
    /// Fatal if `handle` is already in use by a live window.
    pub fn create_window(&self, handle: u64, handler: Arc<dyn WindowEventHandler>) -> String {
        let lock = RunningApiLock::acquire(&self.inner);

        let weak = Arc::downgrade(&self.inner);
        let on_timeout: TimeoutCallback = Arc::new(move |handle: u64, timer_id: u64| {
            if let Some(inner) = weak.upgrade() {
                inner.on_window_inactivity_timeout(handle, timer_id);
            }
        });

        let mut state = self.inner.lock_state();
        if state.windows.contains_key(&handle) {
            fatal!("Creating window with handle {} that is already in use", handle);
        }
        let window = Window::new(
            handle,
            handler,
            Arc::clone(&lock.task_queue),
            on_timeout,
            self.inner.window_inactivity_timeout,
        );
        let path = window.entry_path();
        state.windows.insert(handle, window);
        path
    }

    /// Close a live window; its handler gets `on_window_close`.
    ///
    /// Fatal if `handle` does not name a live window.
    pub fn close_window(&self, handle: u64) {
        let _lock = RunningApiLock::acquire(&self.inner);

        let window = self.inner.lock_state().windows.remove(&handle);
        match window {
            Some(mut window) => window.close(),
            None => fatal!("Closing window {} that does not exist", handle),
        }
    }

    /// Address the HTTP server is bound to; `None` once it has stopped.
    pub fn http_local_addr(&self) -> Option<SocketAddr> {
        let _lock = RunningApiLock::acquire(&self.inner);
        self.inner
            .lock_state()
            .http_server
            .as_ref()
            .map(HttpServer::local_addr)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let lifecycle = self.inner.lock_state().lifecycle;
        if lifecycle == Lifecycle::Running && !std::thread::panicking() {
            fatal!("Destroying a plugin context that is still running");
        }
    }
}

impl ContextInner {
    fn lock_state(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn on_http_server_shutdown_complete(&self) {
        let task_queue = {
            let mut state = self.lock_state();
            if state.shutdown_phase != ShutdownPhase::WaitingOnTransport {
                fatal!("HTTP server shutdown completed in unexpected phase {:?}", state.shutdown_phase);
            }
            state.shutdown_phase = ShutdownPhase::WaitingOnTaskQueue;
            state.http_server = None;
            state.task_queue.clone()
        };

        info!("HTTP server stopped, draining task queue");
        if let Some(task_queue) = task_queue {
            task_queue.shutdown();
        }
    }

    fn on_window_inactivity_timeout(&self, handle: u64, timer_id: u64) {
        let window = self.lock_state().windows.remove(&handle);
        let Some(mut window) = window else {
            trace!("Inactivity timer for window {} that is gone", handle);
            return;
        };
        if !window.on_inactivity_timeout(timer_id) {
            self.lock_state().windows.insert(handle, window);
        }
    }
}

impl TaskQueueEventHandler for ContextInner {
    fn on_task_queue_needs_run_tasks(&self) {
        if let Some(callback) = self.on_events_ready.get() {
            callback();
        }
    }

    fn on_task_queue_shutdown_complete(&self) {
        let (windows, callback) = {
            let mut state = self.lock_state();
            if state.shutdown_phase != ShutdownPhase::WaitingOnTaskQueue {
                fatal!("Task queue shutdown completed in unexpected phase {:?}", state.shutdown_phase);
            }
            state.lifecycle = Lifecycle::ShutdownComplete;
            state.shutdown_phase = ShutdownPhase::None;
            state.http_server = None;
            state.task_queue = None;
            (std::mem::take(&mut state.windows), state.on_shutdown_complete.take())
        };

        let mut windows: Vec<Window> = windows.into_values().collect();
        windows.sort_by_key(Window::handle);
        for window in &mut windows {
            window.close();
        }
        drop(windows);

        info!("Plugin context shutdown complete");
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl HttpRequestSink for ContextInner {
    fn on_http_request(&self, request: HttpRequest) {
        if let Some(expected) = &self.config.http_auth_credentials {
            if !credentials_match(request.basic_auth_credentials(), expected) {
                debug!("Unauthorized request for {}", request.path());
                request.send_response(
                    HttpResponse::text(401, "Unauthorized")
                        .with_header("WWW-Authenticate", AUTH_CHALLENGE),
                );
                return;
            }
        }

        let path = request.path().to_string();
        if path == "/" {
            let banner = format!(
                "frameway {}\nMethod: {}\nPath: {}\nUser agent: {}\n",
                env!("CARGO_PKG_VERSION"),
                request.method(),
                request.path(),
                request.user_agent()
            );
            request.send_text(200, banner);
            return;
        }

        let Some((handle, route)) = split_window_path(&path) else {
            request.send_text(404, "Not Found");
            return;
        };

        // Taken out of the registry while it runs so its handler is called
        // without the state mutex held
        let window = self.lock_state().windows.remove(&handle);
        let Some(mut window) = window else {
            debug!("Request for unknown window {}", handle);
            request.send_text(404, "Not Found");
            return;
        };

        window.handle_http_request(request, route);

        if window.is_closed() {
            debug!("Window {} removed", handle);
        } else if let Some(previous) = self.lock_state().windows.insert(handle, window) {
            warn!("Window {} registered twice", previous.handle());
        }
    }
}

/// Split `/{handle}/rest` into the handle and `/rest`.
fn split_window_path(path: &str) -> Option<(u64, &str)> {
    let path = path.strip_prefix('/')?;
    let slash = path.find('/')?;
    let handle = path[..slash].parse().ok()?;
    Some((handle, &path[slash..]))
}
