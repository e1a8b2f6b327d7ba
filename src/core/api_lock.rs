//! Call-serialization lock guarding the plugin API.
//!
//! Two independent checks, both fatal when violated:
//! - the per-context flag is flipped with a single atomic exchange, catching
//!   two API calls on the same context from different threads;
//! - a thread-local flag catches a thread re-entering the API (for example a
//!   host callback calling back into the plugin) regardless of context.
//!
//! The lock is released when the guard drops, so early returns and unwinding
//! never leave it held.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};

thread_local! {
    static IN_API_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// True while the current thread is inside a plugin API call.
pub fn in_api_thread() -> bool {
    IN_API_THREAD.with(|flag| flag.get())
}

/// Guard for one plugin API call.
pub struct ApiLock<'a> {
    in_api_call: &'a AtomicBool,
}

impl<'a> ApiLock<'a> {
    /// Acquire the API lock using the context's call-in-progress flag.
    pub fn acquire(in_api_call: &'a AtomicBool) -> Self {
        if in_api_call.swap(true, Ordering::AcqRel) {
            fatal!("Two API calls concerning the same context running concurrently");
        }

        if IN_API_THREAD.with(|flag| flag.replace(true)) {
            // Undo the exchange so the diagnostic is the only side effect
            in_api_call.store(false, Ordering::Release);
            fatal!("Plugin API call made while another API call is running in the same thread");
        }

        Self { in_api_call }
    }
}

impl Drop for ApiLock<'_> {
    fn drop(&mut self) {
        IN_API_THREAD.with(|flag| flag.set(false));
        let was_held = self.in_api_call.swap(false, Ordering::AcqRel);
        debug_assert!(was_held, "API lock released while not held");
    }
}
