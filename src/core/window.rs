//! Per-window session protocol.
//!
//! # Request routing
//!
//! The context strips `/{handle}` and passes the rest of the path:
//!
//! | Rest           | Request                                   |
//! |----------------|-------------------------------------------|
//! | `/`            | pre-main page (no token, served once)     |
//! | `/{csrf}/`     | main page                                 |
//! | `/{csrf}/image`| frame + input events                      |
//! | `/{csrf}/prev` | history entry before main (Back button)   |
//! | `/{csrf}/next` | navigate forward                          |
//! | `/{csrf}/close`| client-initiated close                    |
//!
//! # Ordering
//!
//! HTTP gives no ordering or exactly-once guarantees, so:
//! - every main page load bumps `main_generation`; requests from older pages
//!   are answered empty and change nothing
//! - image requests must present a strictly higher `img` than any started
//!   fetch, so a late request never replaces a newer frame
//! - events carry absolute indices; indices below `applied_event_count` were
//!   already delivered and are skipped when a batch is resent; a batch that
//!   starts past it is dropped until the client resends the missing events
//!
//! # History flow
//!
//! `/` replaces itself with `prev`. The first `prev` visit only pushes the main
//! page, leaving `prev` behind it in the history. Every later `prev` visit is
//! the Back button: navigate(-1) and go forward to main again.

use log::{debug, info, trace, warn};
use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::task_queue::{DelayedTaskTag, TaskQueue};
use super::window_events::{FrameResponder, InputEvent, WindowEventHandler};
use crate::server::html::{self, MainPageParams};
use crate::server::{HttpRequest, HttpResponse};
use crate::utils::secret::{constant_time_eq, random_token};

/// Windows close themselves after this long without a state-changing request
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Minimum time between two accepted navigations
pub const NAVIGATE_MIN_INTERVAL: Duration = Duration::from_millis(200);

pub const MAX_WINDOW_DIMENSION: u32 = 16384;

/// Called (as a queued task) when an inactivity timer fires: `(handle, timer_id)`
pub type TimeoutCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// One browser-facing window.
///
/// Must be closed (by [`Window::close`] or a timeout) before it is dropped.
pub struct Window {
    handle: u64,
    handler: Arc<dyn WindowEventHandler>,
    closed: bool,
    csrf_token: String,

    pre_main_visited: bool,
    pre_prev_visited: bool,

    main_generation: u64,
    image_generation: u64,
    applied_event_count: u64,

    width: u32,
    height: u32,
    pressed_buttons: BTreeSet<u8>,
    held_keys: BTreeSet<i32>,
    mouse_pos: (i32, i32),
    last_navigate: Option<Instant>,

    task_queue: Arc<TaskQueue>,
    on_timeout: TimeoutCallback,
    inactivity_timeout: Duration,
    inactivity_timer: Option<DelayedTaskTag>,
    timer_id: u64,
}

impl Window {
    /// Create an open window and arm its inactivity timer.
    pub fn new(
        handle: u64,
        handler: Arc<dyn WindowEventHandler>,
        task_queue: Arc<TaskQueue>,
        on_timeout: TimeoutCallback,
        inactivity_timeout: Duration,
    ) -> Self {
        let mut window = Self {
            handle,
            handler,
            closed: false,
            csrf_token: random_token(),
            pre_main_visited: false,
            pre_prev_visited: false,
            main_generation: 0,
            image_generation: 0,
            applied_event_count: 0,
            width: 0,
            height: 0,
            pressed_buttons: BTreeSet::new(),
            held_keys: BTreeSet::new(),
            mouse_pos: (0, 0),
            last_navigate: None,
            task_queue,
            on_timeout,
            inactivity_timeout,
            inactivity_timer: None,
            timer_id: 0,
        };
        window.arm_inactivity_timer();
        info!("Window {} created", handle);
        window
    }

    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn csrf_token(&self) -> &str {
        &self.csrf_token
    }

    pub fn main_generation(&self) -> u64 {
        self.main_generation
    }

    pub fn image_generation(&self) -> u64 {
        self.image_generation
    }

    pub fn applied_event_count(&self) -> u64 {
        self.applied_event_count
    }

    /// Last viewport size reported by the page, (0, 0) before the first one
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Path of the first (tokenless) page load
    pub fn entry_path(&self) -> String {
        format!("/{}/", self.handle)
    }

    /// Close immediately, notifying the handler. Fatal if already closed.
    pub fn close(&mut self) {
        if self.closed {
            fatal!("Closing window {} that is already closed", self.handle);
        }
        info!("Closing window {}", self.handle);

        self.closed = true;
        self.inactivity_timer = None;
        self.handler.on_window_close(self.handle);
    }

    /// Inactivity timer `timer_id` fired. Closes the window unless the timer
    /// was superseded; returns true if the window closed.
    pub fn on_inactivity_timeout(&mut self, timer_id: u64) -> bool {
        if self.closed || timer_id != self.timer_id {
            trace!("Window {}: ignoring stale inactivity timer {}", self.handle, timer_id);
            return false;
        }
        info!("Window {} inactive for {:?}, closing", self.handle, self.inactivity_timeout);
        self.inactivity_timer = None;
        self.close();
        true
    }

    /// Answer a request whose path (after `/{handle}`) is `route`.
    pub fn handle_http_request(&mut self, request: HttpRequest, route: &str) {
        if self.closed {
            fatal!("Request routed to window {} after it was closed", self.handle);
        }

        let rest = route.strip_prefix('/').unwrap_or(route);
        if rest.is_empty() {
            self.handle_pre_main(request);
            return;
        }

        let (token, action) = match rest.split_once('/') {
            Some(parts) => parts,
            None => {
                request.send_text(404, "Not Found");
                return;
            }
        };

        if !constant_time_eq(token.as_bytes(), self.csrf_token.as_bytes()) {
            warn!("Window {}: request with invalid CSRF token rejected", self.handle);
            request.send_text(403, "Invalid CSRF token");
            return;
        }

        match action {
            "" => self.handle_main_page(request),
            "image" => self.handle_image(request),
            "prev" => self.handle_prev(request),
            "next" => self.handle_next(request),
            "close" => {
                info!("Window {} closed by client", self.handle);
                self.close();
                request.send_text(200, "Closed");
            }
            _ => request.send_text(404, "Not Found"),
        }
    }

    fn handle_pre_main(&mut self, request: HttpRequest) {
        if self.pre_main_visited {
            warn!("Window {}: repeated tokenless load rejected", self.handle);
            request.send_text(403, "Window already opened");
            return;
        }
        self.pre_main_visited = true;
        self.arm_inactivity_timer();
        request.send_response(HttpResponse::html(html::pre_main_page(&self.csrf_token)));
    }

    fn handle_main_page(&mut self, request: HttpRequest) {
        self.main_generation += 1;
        self.applied_event_count = 0;
        debug!(
            "Window {}: serving main page, generation {}",
            self.handle, self.main_generation
        );
        self.arm_inactivity_timer();

        let params = MainPageParams {
            main: self.main_generation,
            img: self.image_generation,
        };
        request.send_response(HttpResponse::html(html::main_page(&params)));
    }

    fn handle_image(&mut self, request: HttpRequest) {
        let (Some(main), Some(img), Some(start)) = (
            param::<u64>(&request, "main"),
            param::<u64>(&request, "img"),
            param::<u64>(&request, "start"),
        ) else {
            request.send_text(400, "Bad Request");
            return;
        };

        if main != self.main_generation {
            trace!(
                "Window {}: image request from stale page {} (current {})",
                self.handle, main, self.main_generation
            );
            request.send_response(HttpResponse::empty());
            return;
        }

        if let (Some(w), Some(h)) = (param::<u32>(&request, "w"), param::<u32>(&request, "h")) {
            self.update_size(w, h);
        }

        self.apply_events(start, request.param("events").unwrap_or(""));
        self.arm_inactivity_timer();

        if img <= self.image_generation {
            trace!(
                "Window {}: dropping out-of-order image request {} (current {})",
                self.handle, img, self.image_generation
            );
            request.send_response(HttpResponse::empty());
            return;
        }

        self.image_generation = img;
        self.handler
            .on_window_fetch_image(self.handle, FrameResponder::new(request));
    }

    fn handle_prev(&mut self, request: HttpRequest) {
        self.arm_inactivity_timer();
        if !self.pre_prev_visited {
            self.pre_prev_visited = true;
            request.send_response(HttpResponse::html(html::prev_first_visit_page()));
        } else {
            self.navigate(-1);
            request.send_response(HttpResponse::html(html::prev_return_page()));
        }
    }

    fn handle_next(&mut self, request: HttpRequest) {
        self.arm_inactivity_timer();
        if self.navigate(1) {
            request.send_text(200, "OK");
        } else {
            request.send_text(200, "IGNORED");
        }
    }

    /// Forward a navigation unless one was accepted very recently.
    fn navigate(&mut self, direction: i32) -> bool {
        let now = Instant::now();
        if let Some(last) = self.last_navigate {
            if now.duration_since(last) < NAVIGATE_MIN_INTERVAL {
                debug!("Window {}: navigation {} rate limited", self.handle, direction);
                return false;
            }
        }
        self.last_navigate = Some(now);
        self.handler.on_window_navigate(self.handle, direction);
        true
    }

    fn update_size(&mut self, width: u32, height: u32) {
        let width = width.clamp(1, MAX_WINDOW_DIMENSION);
        let height = height.clamp(1, MAX_WINDOW_DIMENSION);
        if (width, height) != (self.width, self.height) {
            self.width = width;
            self.height = height;
            self.handler.on_window_resize(self.handle, width, height);
        }
    }

    /// Apply the batch whose first event has index `start`, skipping indices
    /// that were already applied for this main generation.
    ///
    /// A batch starting past `applied_event_count` is ignored; the client
    /// resends from its last acknowledged index, so the events arrive in order.
    fn apply_events(&mut self, start: u64, batch: &str) {
        if start > self.applied_event_count {
            debug!(
                "Window {}: batch starts at event {} but only {} applied, waiting for resend",
                self.handle, start, self.applied_event_count
            );
            return;
        }

        for (offset, event) in InputEvent::parse_batch(batch).into_iter().enumerate() {
            let Some(index) = start.checked_add(offset as u64) else {
                warn!("Window {}: event index overflow, dropping rest of batch", self.handle);
                break;
            };
            if index < self.applied_event_count {
                continue;
            }
            match event {
                Some(event) => self.dispatch_event(event),
                None => debug!("Window {}: skipping malformed event #{}", self.handle, index),
            }
            self.applied_event_count = index.saturating_add(1);
        }
    }

    fn dispatch_event(&mut self, event: InputEvent) {
        let handle = self.handle;
        let handler = Arc::clone(&self.handler);

        match event {
            InputEvent::MouseDown { x, y, button } => {
                self.mouse_pos = (x, y);
                if self.pressed_buttons.insert(button) {
                    handler.on_window_mouse_down(handle, x, y, button);
                }
            }
            InputEvent::MouseUp { x, y, button } => {
                self.mouse_pos = (x, y);
                if self.pressed_buttons.remove(&button) {
                    handler.on_window_mouse_up(handle, x, y, button);
                }
            }
            InputEvent::MouseDoubleClick { x, y } => {
                self.mouse_pos = (x, y);
                handler.on_window_mouse_double_click(handle, x, y);
            }
            InputEvent::MouseWheel { x, y, delta } => {
                self.mouse_pos = (x, y);
                handler.on_window_mouse_wheel(handle, x, y, delta);
            }
            InputEvent::MouseMove { x, y } => {
                self.mouse_pos = (x, y);
                handler.on_window_mouse_move(handle, x, y);
            }
            InputEvent::MouseLeave { x, y } => {
                self.mouse_pos = (x, y);
                handler.on_window_mouse_leave(handle, x, y);
            }
            InputEvent::KeyDown { key } => {
                // Repeats of a held key are forwarded as autorepeat
                self.held_keys.insert(key);
                handler.on_window_key_down(handle, key);
            }
            InputEvent::KeyUp { key } => {
                if self.held_keys.remove(&key) {
                    handler.on_window_key_up(handle, key);
                }
            }
            InputEvent::FocusLoss => {
                for key in std::mem::take(&mut self.held_keys) {
                    handler.on_window_key_up(handle, key);
                }
                let (x, y) = self.mouse_pos;
                for button in std::mem::take(&mut self.pressed_buttons) {
                    handler.on_window_mouse_up(handle, x, y, button);
                }
                handler.on_window_lose_focus(handle);
            }
        }
    }

    /// Replace the pending inactivity timer with a fresh one.
    fn arm_inactivity_timer(&mut self) {
        self.timer_id += 1;
        let handle = self.handle;
        let timer_id = self.timer_id;
        let on_timeout = Arc::clone(&self.on_timeout);

        // Dropping the previous tag cancels it
        self.inactivity_timer = Some(
            self.task_queue
                .post_delayed(self.inactivity_timeout, move || on_timeout(handle, timer_id)),
        );
    }
}

impl Drop for Window {
    fn drop(&mut self) {
        if !self.closed && !std::thread::panicking() {
            fatal!("Destroying window {} that has not been closed", self.handle);
        }
    }
}

fn param<T: FromStr>(request: &HttpRequest, name: &str) -> Option<T> {
    request.param(name)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task_queue::TaskQueueEventHandler;
    use crate::encode::Frame;
    use std::sync::Mutex;
    use std::sync::Weak;

    struct NoopQueueHandler;

    impl TaskQueueEventHandler for NoopQueueHandler {
        fn on_task_queue_needs_run_tasks(&self) {}
        fn on_task_queue_shutdown_complete(&self) {}
    }

    /// Records every callback; answers image fetches immediately unless
    /// `defer_fetch` is set.
    #[derive(Default)]
    struct FakeHandler {
        calls: Mutex<Vec<String>>,
        defer_fetch: bool,
        deferred: Mutex<Vec<FrameResponder>>,
    }

    impl FakeHandler {
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn take_calls(&self) -> Vec<String> {
            std::mem::take(&mut *self.calls.lock().unwrap())
        }
    }

    impl WindowEventHandler for FakeHandler {
        fn on_window_close(&self, handle: u64) {
            self.record(format!("close {}", handle));
        }
        fn on_window_fetch_image(&self, _handle: u64, responder: FrameResponder) {
            self.record("fetch".to_string());
            if self.defer_fetch {
                self.deferred.lock().unwrap().push(responder);
            } else {
                responder.send_frame(&Frame::filled(1, 1, [0, 0, 0, 255]).unwrap());
            }
        }
        fn on_window_resize(&self, _handle: u64, width: u32, height: u32) {
            self.record(format!("resize {}x{}", width, height));
        }
        fn on_window_mouse_down(&self, _handle: u64, x: i32, y: i32, button: u8) {
            self.record(format!("mdn {} {} {}", x, y, button));
        }
        fn on_window_mouse_up(&self, _handle: u64, x: i32, y: i32, button: u8) {
            self.record(format!("mup {} {} {}", x, y, button));
        }
        fn on_window_mouse_move(&self, _handle: u64, x: i32, y: i32) {
            self.record(format!("mmo {} {}", x, y));
        }
        fn on_window_key_down(&self, _handle: u64, key: i32) {
            self.record(format!("kdn {}", key));
        }
        fn on_window_key_up(&self, _handle: u64, key: i32) {
            self.record(format!("kup {}", key));
        }
        fn on_window_lose_focus(&self, _handle: u64) {
            self.record("fout".to_string());
        }
        fn on_window_navigate(&self, _handle: u64, direction: i32) {
            self.record(format!("nav {}", direction));
        }
    }

    struct Fixture {
        handler: Arc<FakeHandler>,
        queue: Arc<TaskQueue>,
        timeouts: Arc<Mutex<Vec<(u64, u64)>>>,
        window: Window,
    }

    impl Fixture {
        fn new(handler: FakeHandler, inactivity_timeout: Duration) -> Self {
            let handler = Arc::new(handler);
            let queue_handler: Weak<dyn TaskQueueEventHandler> = Weak::<NoopQueueHandler>::new();
            let queue = Arc::new(TaskQueue::new(queue_handler));
            let timeouts = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&timeouts);
            let window = Window::new(
                7,
                Arc::clone(&handler) as Arc<dyn WindowEventHandler>,
                Arc::clone(&queue),
                Arc::new(move |handle: u64, timer_id: u64| sink.lock().unwrap().push((handle, timer_id))),
                inactivity_timeout,
            );
            Self { handler, queue, timeouts, window }
        }

        fn open() -> Self {
            let mut fixture = Self::new(FakeHandler::default(), INACTIVITY_TIMEOUT);
            fixture.main_page();
            fixture
        }

        fn request(&mut self, route: &str, query: &str) -> Option<HttpResponse> {
            let path = format!("/7{}", route);
            let (request, rx) = HttpRequest::new("GET", path, query, None);
            self.window.handle_http_request(request, route);
            rx.try_recv().ok()
        }

        fn main_page(&mut self) -> HttpResponse {
            let route = format!("/{}/", self.window.csrf_token().to_string());
            self.request(&route, "").unwrap()
        }

        fn image(&mut self, main: u64, img: u64, start: u64, events: &str) -> Option<HttpResponse> {
            let route = format!("/{}/image", self.window.csrf_token().to_string());
            let query = format!("main={}&img={}&start={}&events={}", main, img, start, events);
            self.request(&route, &query)
        }

        fn pump(&self) {
            let _active = self.queue.lock_active();
            self.queue.run_tasks();
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            if !self.window.is_closed() {
                self.window.close();
            }
        }
    }

    #[test]
    fn test_pre_main_served_once_without_token() {
        let mut f = Fixture::new(FakeHandler::default(), INACTIVITY_TIMEOUT);

        let first = f.request("/", "").unwrap();
        assert_eq!(first.status, 200);
        let body = String::from_utf8(first.body).unwrap();
        assert!(body.contains(f.window.csrf_token()));

        let second = f.request("/", "").unwrap();
        assert_eq!(second.status, 403);
    }

    #[test]
    fn test_main_page_bumps_generation_and_resets_events() {
        let mut f = Fixture::open();
        assert_eq!(f.window.main_generation(), 1);

        f.image(1, 1, 0, "KDN_1/KUP_1").unwrap();
        assert_eq!(f.window.applied_event_count(), 2);

        let page = f.main_page();
        assert_eq!(page.status, 200);
        let body = String::from_utf8(page.body).unwrap();
        assert!(body.contains(r#""main":2"#));
        assert!(body.contains(r#""img":1"#));
        assert_eq!(f.window.main_generation(), 2);
        assert_eq!(f.window.applied_event_count(), 0);
    }

    #[test]
    fn test_invalid_csrf_token_rejected_without_mutation() {
        let mut f = Fixture::open();
        let response = f.request("/not-the-token/", "").unwrap();
        assert_eq!(response.status, 403);
        assert_eq!(f.window.main_generation(), 1);

        let response = f.request("/not-the-token/image", "main=1&img=5&start=0&events=KDN_1").unwrap();
        assert_eq!(response.status, 403);
        assert_eq!(f.window.image_generation(), 0);
        assert_eq!(f.window.applied_event_count(), 0);
        assert!(!f.handler.calls().iter().any(|c| c == "kdn 1" || c == "fetch"));
    }

    #[test]
    fn test_unknown_action_and_missing_slash() {
        let mut f = Fixture::open();
        let token = f.window.csrf_token().to_string();
        assert_eq!(f.request(&format!("/{}/bogus", token), "").unwrap().status, 404);
        assert_eq!(f.request(&format!("/{}", token), "").unwrap().status, 404);
    }

    #[test]
    fn test_stale_main_generation_is_noop() {
        let mut f = Fixture::open();
        f.main_page();
        f.handler.take_calls();

        let response = f.image(1, 10, 0, "KDN_5").unwrap();
        assert_eq!(response.status, 200);
        assert!(response.body.is_empty());
        assert_eq!(f.window.image_generation(), 0);
        assert_eq!(f.window.applied_event_count(), 0);
        assert!(f.handler.calls().is_empty());
    }

    #[test]
    fn test_image_generation_must_increase() {
        let mut f = Fixture::open();

        let response = f.image(1, 3, 0, "").unwrap();
        assert_eq!(response.content_type, "image/png");
        assert_eq!(f.window.image_generation(), 3);

        for stale in [1, 2, 3] {
            let response = f.image(1, stale, 0, "").unwrap();
            assert!(response.body.is_empty());
            assert_eq!(f.window.image_generation(), 3);
        }

        f.image(1, 4, 0, "").unwrap();
        assert_eq!(f.window.image_generation(), 4);
        let fetches = f.handler.calls().iter().filter(|c| *c == "fetch").count();
        assert_eq!(fetches, 2);
    }

    #[test]
    fn test_stale_image_still_applies_events() {
        let mut f = Fixture::open();
        f.image(1, 5, 0, "").unwrap();
        f.handler.take_calls();

        let response = f.image(1, 2, 0, "KDN_9").unwrap();
        assert!(response.body.is_empty());
        assert_eq!(f.handler.calls(), vec!["kdn 9"]);
        assert_eq!(f.window.applied_event_count(), 1);
    }

    #[test]
    fn test_event_resend_is_idempotent() {
        let mut f = Fixture::open();
        f.handler.take_calls();

        f.image(1, 1, 0, "KDN_0/KDN_1/KDN_2/KDN_3/KDN_4").unwrap();
        assert_eq!(f.window.applied_event_count(), 5);

        f.image(1, 2, 0, "KDN_0/KDN_1/KDN_2/KDN_3/KDN_4/KDN_5/KDN_6/KDN_7").unwrap();
        assert_eq!(f.window.applied_event_count(), 8);

        let keys: Vec<String> = f
            .handler
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("kdn"))
            .collect();
        let expected: Vec<String> = (0..8).map(|k| format!("kdn {}", k)).collect();
        assert_eq!(keys, expected);
    }

    #[test]
    fn test_overlapping_batch_with_offset_start() {
        let mut f = Fixture::open();
        f.image(1, 1, 0, "KDN_0/KDN_1/KDN_2").unwrap();
        f.handler.take_calls();

        // Client dropped acked events and resends from index 2
        f.image(1, 2, 2, "KDN_2/KDN_3").unwrap();
        assert_eq!(f.window.applied_event_count(), 4);
        assert_eq!(f.handler.calls(), vec!["kdn 3", "fetch"]);
    }

    #[test]
    fn test_malformed_token_skipped_without_desync() {
        let mut f = Fixture::open();
        f.handler.take_calls();

        f.image(1, 1, 0, "KDN_1/BOGUS_1/MMO_1/KDN_2").unwrap();
        assert_eq!(f.window.applied_event_count(), 4);

        // Resend of the tail must not replay anything
        f.image(1, 2, 2, "MMO_1/KDN_2").unwrap();
        let keys: Vec<String> = f
            .handler
            .calls()
            .into_iter()
            .filter(|c| c != "fetch")
            .collect();
        assert_eq!(keys, vec!["kdn 1", "kdn 2"]);
    }

    #[test]
    fn test_batch_past_applied_count_waits_for_resend() {
        let mut f = Fixture::open();
        f.handler.take_calls();

        f.image(1, 1, 3, "KDN_3").unwrap();
        assert_eq!(f.window.applied_event_count(), 0);

        f.image(1, 2, 0, "KDN_0/KDN_1/KDN_2/KDN_3").unwrap();
        assert_eq!(f.window.applied_event_count(), 4);

        let keys: Vec<String> = f
            .handler
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("kdn"))
            .collect();
        assert_eq!(keys, vec!["kdn 0", "kdn 1", "kdn 2", "kdn 3"]);
    }

    #[test]
    fn test_huge_event_start_is_ignored() {
        let mut f = Fixture::open();
        f.handler.take_calls();

        let response = f.image(1, 1, u64::MAX, "KDN_1/KDN_2").unwrap();
        assert_eq!(response.content_type, "image/png");
        assert_eq!(f.window.applied_event_count(), 0);
        assert_eq!(f.handler.calls(), vec!["fetch"]);

        // The window keeps working afterwards
        f.image(1, 2, 0, "KDN_7").unwrap();
        assert_eq!(f.window.applied_event_count(), 1);
        assert!(f.handler.calls().contains(&"kdn 7".to_string()));
    }

    #[test]
    fn test_button_and_key_state_filtering() {
        let mut f = Fixture::open();
        f.handler.take_calls();

        f.image(1, 1, 0, "MUP_1_1_0/MDN_2_2_0/MDN_3_3_0/KUP_4/KDN_4/KDN_5/FOUT").unwrap();
        let calls: Vec<String> = f
            .handler
            .calls()
            .into_iter()
            .filter(|c| c != "fetch")
            .collect();
        assert_eq!(
            calls,
            vec!["mdn 2 2 0", "kdn 4", "kdn 5", "kup 4", "kup 5", "mup 3 3 0", "fout"]
        );
    }

    #[test]
    fn test_resize_reported_on_change_only() {
        let mut f = Fixture::open();
        let route = format!("/{}/image", f.window.csrf_token());
        f.handler.take_calls();

        f.request(&route, "main=1&img=1&start=0&events=&w=800&h=600").unwrap();
        f.request(&route, "main=1&img=2&start=0&events=&w=800&h=600").unwrap();
        f.request(&route, "main=1&img=3&start=0&events=&w=0&h=99999").unwrap();

        let resizes: Vec<String> = f
            .handler
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("resize"))
            .collect();
        assert_eq!(resizes, vec!["resize 800x600", "resize 1x16384"]);
        assert_eq!(f.window.size(), (1, MAX_WINDOW_DIMENSION));
    }

    #[test]
    fn test_bad_image_parameters() {
        let mut f = Fixture::open();
        let route = format!("/{}/image", f.window.csrf_token());
        let response = f.request(&route, "main=1&img=x&start=0").unwrap();
        assert_eq!(response.status, 400);
        assert_eq!(f.window.image_generation(), 0);
    }

    #[test]
    fn test_deferred_fetch_completes_later() {
        let handler = FakeHandler {
            defer_fetch: true,
            ..FakeHandler::default()
        };
        let mut f = Fixture::new(handler, INACTIVITY_TIMEOUT);
        f.main_page();

        let route = format!("/{}/image", f.window.csrf_token());
        let (request, rx) = HttpRequest::new("GET", "/7/x/image", "main=1&img=1&start=0", None);
        f.window.handle_http_request(request, &route);
        assert!(rx.try_recv().is_err());

        let responder = f.handler.deferred.lock().unwrap().pop().unwrap();
        std::thread::spawn(move || responder.send_unchanged()).join().unwrap();
        let response = rx.recv().unwrap();
        assert_eq!(response.status, 200);
    }

    #[test]
    fn test_history_flow_and_navigation_rate_limit() {
        let mut f = Fixture::new(FakeHandler::default(), INACTIVITY_TIMEOUT);
        let token = f.window.csrf_token().to_string();
        let prev = format!("/{}/prev", token);
        let next = format!("/{}/next", token);

        f.request("/", "").unwrap();
        // First prev visit only sets up the history
        f.request(&prev, "").unwrap();
        assert!(!f.handler.calls().iter().any(|c| c.starts_with("nav")));

        f.request(&prev, "").unwrap();
        let response = f.request(&next, "").unwrap();
        assert_eq!(response.body, b"IGNORED");

        std::thread::sleep(NAVIGATE_MIN_INTERVAL + Duration::from_millis(20));
        let response = f.request(&next, "").unwrap();
        assert_eq!(response.body, b"OK");

        let navs: Vec<String> = f
            .handler
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("nav"))
            .collect();
        assert_eq!(navs, vec!["nav -1", "nav 1"]);
    }

    #[test]
    fn test_client_close_notifies_once() {
        let mut f = Fixture::open();
        let route = format!("/{}/close", f.window.csrf_token());
        let response = f.request(&route, "").unwrap();
        assert_eq!(response.status, 200);
        assert!(f.window.is_closed());

        let closes = f.handler.calls().iter().filter(|c| *c == "close 7").count();
        assert_eq!(closes, 1);
    }

    #[test]
    #[should_panic(expected = "already closed")]
    fn test_double_close_is_fatal() {
        let mut f = Fixture::open();
        f.window.close();
        f.window.close();
    }

    #[test]
    fn test_inactivity_timeout_closes() {
        let mut f = Fixture::new(FakeHandler::default(), Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(60));
        f.pump();

        let fired = f.timeouts.lock().unwrap().clone();
        assert_eq!(fired.len(), 1);
        let (handle, timer_id) = fired[0];
        assert_eq!(handle, 7);

        assert!(f.window.on_inactivity_timeout(timer_id));
        assert!(f.window.is_closed());
        assert!(!f.window.on_inactivity_timeout(timer_id));
        let closes = f.handler.calls().iter().filter(|c| *c == "close 7").count();
        assert_eq!(closes, 1);
    }

    #[test]
    fn test_activity_supersedes_timer() {
        let mut f = Fixture::new(FakeHandler::default(), Duration::from_secs(60));
        let first_timer = f.window.timer_id;
        f.request("/", "").unwrap();
        assert_ne!(f.window.timer_id, first_timer);

        // A firing of the superseded timer changes nothing
        assert!(!f.window.on_inactivity_timeout(first_timer));
        assert!(!f.window.is_closed());
    }
}
