//! Session engine: lifecycle, task queue and per-window protocol.
//!
//! # Key types
//!
//! - [`Context`] - plugin context driven by the host
//! - [`TaskQueue`] - single run-loop queue drained by `pump_events`
//! - [`Window`] - protocol state of one browser window
//! - [`WindowEventHandler`] - callbacks the host implements per window

pub mod api_lock;
pub mod context;
pub mod task_queue;
pub mod window;
pub mod window_events;

pub use context::{AUTH_CHALLENGE, Context, Lifecycle, ShutdownPhase};
pub use task_queue::{DelayedTaskTag, TaskQueue, TaskQueueEventHandler};
pub use window::Window;
pub use window_events::{FrameResponder, InputEvent, WindowEventHandler};
