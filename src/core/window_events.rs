//! Window capability interface and the input event token format.
//!
//! # Event tokens
//!
//! Image requests carry a batch of input events as `/`-separated tokens, each
//! `NAME` followed by `_`-separated integer arguments:
//!
//! | Token  | Arguments     | Event          |
//! |--------|---------------|----------------|
//! | `MDN`  | x y button    | mouse down     |
//! | `MUP`  | x y button    | mouse up       |
//! | `MDBL` | x y           | double click   |
//! | `MWH`  | x y delta     | wheel          |
//! | `MMO`  | x y           | mouse move     |
//! | `MOUT` | x y           | mouse leave    |
//! | `KDN`  | key           | key down       |
//! | `KUP`  | key           | key up         |
//! | `FOUT` |               | focus lost     |
//!
//! A token that does not parse is skipped on its own; it still occupies its
//! index in the batch so the following events stay aligned.

use crate::encode::{Frame, PNG_CONTENT_TYPE, encode_png};
use crate::server::{HttpRequest, HttpResponse};

/// Mouse buttons accepted in `MDN`/`MUP` tokens (left, middle, right)
pub const MAX_MOUSE_BUTTON: u8 = 2;

/// Callbacks from a window to the embedding application.
///
/// All methods are called while the plugin holds its API lock, so they must
/// not call back into the plugin API synchronously.
pub trait WindowEventHandler: Send + Sync {
    /// The window has closed; called exactly once, after which the window makes
    /// no further calls.
    fn on_window_close(&self, handle: u64);

    /// Produce a frame and complete `responder`, now or later from any thread.
    fn on_window_fetch_image(&self, handle: u64, responder: FrameResponder);

    fn on_window_resize(&self, _handle: u64, _width: u32, _height: u32) {}
    fn on_window_mouse_down(&self, _handle: u64, _x: i32, _y: i32, _button: u8) {}
    fn on_window_mouse_up(&self, _handle: u64, _x: i32, _y: i32, _button: u8) {}
    fn on_window_mouse_move(&self, _handle: u64, _x: i32, _y: i32) {}
    fn on_window_mouse_double_click(&self, _handle: u64, _x: i32, _y: i32) {}
    fn on_window_mouse_wheel(&self, _handle: u64, _x: i32, _y: i32, _delta: i32) {}
    fn on_window_mouse_leave(&self, _handle: u64, _x: i32, _y: i32) {}
    fn on_window_key_down(&self, _handle: u64, _key: i32) {}
    fn on_window_key_up(&self, _handle: u64, _key: i32) {}
    fn on_window_lose_focus(&self, _handle: u64) {}

    /// Browser history navigation: -1 back, +1 forward.
    fn on_window_navigate(&self, _handle: u64, _direction: i32) {}
}

/// Decoded input event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    MouseDown { x: i32, y: i32, button: u8 },
    MouseUp { x: i32, y: i32, button: u8 },
    MouseDoubleClick { x: i32, y: i32 },
    MouseWheel { x: i32, y: i32, delta: i32 },
    MouseMove { x: i32, y: i32 },
    MouseLeave { x: i32, y: i32 },
    KeyDown { key: i32 },
    KeyUp { key: i32 },
    FocusLoss,
}

impl InputEvent {
    /// Parse one token; `None` for unknown names or bad arguments.
    pub fn parse(token: &str) -> Option<Self> {
        let mut parts = token.split('_');
        let name = parts.next()?;
        let mut args = [0i32; 3];
        let mut count = 0;
        for part in parts {
            if count == args.len() {
                return None;
            }
            args[count] = part.parse().ok()?;
            count += 1;
        }
        let args = &args[..count];

        let button = |value: i32| u8::try_from(value).ok().filter(|b| *b <= MAX_MOUSE_BUTTON);

        let event = match (name, args) {
            ("MDN", &[x, y, b]) => InputEvent::MouseDown { x, y, button: button(b)? },
            ("MUP", &[x, y, b]) => InputEvent::MouseUp { x, y, button: button(b)? },
            ("MDBL", &[x, y]) => InputEvent::MouseDoubleClick { x, y },
            ("MWH", &[x, y, delta]) => InputEvent::MouseWheel { x, y, delta },
            ("MMO", &[x, y]) => InputEvent::MouseMove { x, y },
            ("MOUT", &[x, y]) => InputEvent::MouseLeave { x, y },
            ("KDN", &[key]) => InputEvent::KeyDown { key },
            ("KUP", &[key]) => InputEvent::KeyUp { key },
            ("FOUT", &[]) => InputEvent::FocusLoss,
            _ => return None,
        };
        Some(event)
    }

    /// Split a batch into per-index parse results. Empty batch → no events.
    pub fn parse_batch(batch: &str) -> Vec<Option<Self>> {
        if batch.is_empty() {
            return Vec::new();
        }
        batch.split('/').map(Self::parse).collect()
    }
}

/// Completes the HTTP response of one image request.
///
/// May be moved to and completed on any thread. Dropping it without sending
/// answers the request with 500.
#[derive(Debug)]
pub struct FrameResponder {
    request: HttpRequest,
}

impl FrameResponder {
    pub(crate) fn new(request: HttpRequest) -> Self {
        Self { request }
    }

    /// Encode `frame` as PNG and send it.
    pub fn send_frame(self, frame: &Frame) {
        match encode_png(frame) {
            Ok(png) => self
                .request
                .send_response(HttpResponse::bytes(PNG_CONTENT_TYPE, png)),
            Err(e) => {
                log::error!("Frame encoding failed: {}", e);
                self.request.send_text(500, "Frame encoding failed");
            }
        }
    }

    /// Answer with "no new frame"; the page keeps showing the previous one.
    pub fn send_unchanged(self) {
        self.request.send_response(HttpResponse::empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_kinds() {
        assert_eq!(
            InputEvent::parse("MDN_10_20_0"),
            Some(InputEvent::MouseDown { x: 10, y: 20, button: 0 })
        );
        assert_eq!(
            InputEvent::parse("MUP_-1_5_2"),
            Some(InputEvent::MouseUp { x: -1, y: 5, button: 2 })
        );
        assert_eq!(
            InputEvent::parse("MDBL_3_4"),
            Some(InputEvent::MouseDoubleClick { x: 3, y: 4 })
        );
        assert_eq!(
            InputEvent::parse("MWH_3_4_-120"),
            Some(InputEvent::MouseWheel { x: 3, y: 4, delta: -120 })
        );
        assert_eq!(InputEvent::parse("MMO_7_8"), Some(InputEvent::MouseMove { x: 7, y: 8 }));
        assert_eq!(InputEvent::parse("MOUT_0_0"), Some(InputEvent::MouseLeave { x: 0, y: 0 }));
        assert_eq!(InputEvent::parse("KDN_65"), Some(InputEvent::KeyDown { key: 65 }));
        assert_eq!(InputEvent::parse("KUP_65"), Some(InputEvent::KeyUp { key: 65 }));
        assert_eq!(InputEvent::parse("FOUT"), Some(InputEvent::FocusLoss));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for token in [
            "", "XYZ_1", "MDN_1_2", "MDN_1_2_0_9", "MMO_a_b", "MDN_1_2_3", "MDN_1_2_-1",
            "FOUT_1", "KDN", "KDN_", "mdn_1_2_0",
        ] {
            assert_eq!(InputEvent::parse(token), None, "{:?}", token);
        }
    }

    #[test]
    fn test_parse_batch_keeps_indices() {
        let batch = InputEvent::parse_batch("KDN_1/garbage/KUP_1");
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0], Some(InputEvent::KeyDown { key: 1 }));
        assert_eq!(batch[1], None);
        assert_eq!(batch[2], Some(InputEvent::KeyUp { key: 1 }));

        assert!(InputEvent::parse_batch("").is_empty());
    }

    #[test]
    fn test_frame_responder_sends_png() {
        let (request, rx) = HttpRequest::new("GET", "/1/t/image", "", None);
        let responder = FrameResponder::new(request);
        std::thread::spawn(move || {
            responder.send_frame(&Frame::filled(2, 2, [0, 0, 0, 255]).unwrap());
        });
        let response = rx.recv().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.content_type, PNG_CONTENT_TYPE);
        assert!(!response.body.is_empty());
    }
}
