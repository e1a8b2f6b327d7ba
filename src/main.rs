use frameway::cli::Args;
use frameway::config::option_docs;
use frameway::core::{Context, FrameResponder, Lifecycle, WindowEventHandler};
use frameway::encode::Frame;

use anyhow::{Context as _, Result};
use clap::Parser;
use crossbeam_channel::{Sender, unbounded};
use log::{debug, error, info, warn};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Largest frame the demo renders, per side
const MAX_RENDER_SIZE: u32 = 2048;
const DEFAULT_SIZE: (u32, u32) = (640, 480);

/// Messages driving the host loop
#[derive(Debug)]
enum HostMessage {
    EventsReady,
    ShutdownComplete,
    WindowClosed(u64),
    Quit,
}

/// What the test pattern shows
#[derive(Debug, Default)]
struct PatternState {
    width: u32,
    height: u32,
    mouse: (i32, i32),
    buttons_down: u32,
    last_key: Option<i32>,
    wheel: i32,
    frames: u64,
}

/// Window handler painting a test pattern that follows the mouse
struct DemoWindow {
    state: Mutex<PatternState>,
    host_tx: Sender<HostMessage>,
}

impl DemoWindow {
    fn new(host_tx: Sender<HostMessage>) -> Self {
        Self {
            state: Mutex::new(PatternState::default()),
            host_tx,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PatternState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn render(state: &mut PatternState) -> Result<Frame> {
        let (width, height) = match (state.width, state.height) {
            (0, _) | (_, 0) => DEFAULT_SIZE,
            (w, h) => (w.min(MAX_RENDER_SIZE), h.min(MAX_RENDER_SIZE)),
        };
        state.frames += 1;

        let (mx, my) = state.mouse;
        let key_bar = state.last_key.map_or(0, |k| k.unsigned_abs().saturating_mul(4).min(width));
        let shift = (state.frames as u32).wrapping_mul(3).wrapping_add(state.wheel as u32);
        let mut pixels = Vec::with_capacity(width as usize * height as usize * 4);

        for y in 0..height {
            for x in 0..width {
                let on_cursor = x as i32 == mx || y as i32 == my;
                let rgba = if on_cursor {
                    if state.buttons_down > 0 { [255, 40, 40, 255] } else { [255, 255, 255, 255] }
                } else if y < 8 && x < key_bar {
                    [40, 200, 90, 255]
                } else {
                    let r = ((x * 255) / width) as u8;
                    let g = ((y * 255) / height) as u8;
                    let b = (x.wrapping_add(y).wrapping_add(shift) % 256) as u8;
                    [r, g, b, 255]
                };
                pixels.extend_from_slice(&rgba);
            }
        }

        Frame::new(width, height, pixels)
    }
}

impl WindowEventHandler for DemoWindow {
    fn on_window_close(&self, handle: u64) {
        info!("Window {} closed", handle);
        let _ = self.host_tx.send(HostMessage::WindowClosed(handle));
    }

    fn on_window_fetch_image(&self, handle: u64, responder: FrameResponder) {
        let frame = Self::render(&mut self.state());
        match frame {
            Ok(frame) => responder.send_frame(&frame),
            Err(e) => {
                error!("Window {}: rendering failed: {}", handle, e);
                responder.send_unchanged();
            }
        }
    }

    fn on_window_resize(&self, handle: u64, width: u32, height: u32) {
        debug!("Window {} resized to {}x{}", handle, width, height);
        let mut state = self.state();
        state.width = width;
        state.height = height;
    }

    fn on_window_mouse_down(&self, _handle: u64, x: i32, y: i32, _button: u8) {
        let mut state = self.state();
        state.mouse = (x, y);
        state.buttons_down += 1;
    }

    fn on_window_mouse_up(&self, _handle: u64, x: i32, y: i32, _button: u8) {
        let mut state = self.state();
        state.mouse = (x, y);
        state.buttons_down = state.buttons_down.saturating_sub(1);
    }

    fn on_window_mouse_move(&self, _handle: u64, x: i32, y: i32) {
        self.state().mouse = (x, y);
    }

    fn on_window_mouse_wheel(&self, _handle: u64, _x: i32, _y: i32, delta: i32) {
        let mut state = self.state();
        state.wheel = state.wheel.wrapping_add(delta);
    }

    fn on_window_mouse_leave(&self, _handle: u64, _x: i32, _y: i32) {
        self.state().mouse = (-1, -1);
    }

    fn on_window_key_down(&self, _handle: u64, key: i32) {
        self.state().last_key = Some(key);
    }

    fn on_window_lose_focus(&self, handle: u64) {
        debug!("Window {} lost focus", handle);
        self.state().last_key = None;
    }

    fn on_window_navigate(&self, handle: u64, direction: i32) {
        info!("Window {} navigated {}", handle, if direction < 0 { "back" } else { "forward" });
    }
}

fn init_logging(args: &Args) -> Result<()> {
    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    if let Some(log_path_opt) = &args.log_file {
        let log_path = log_path_opt
            .clone()
            .unwrap_or_else(|| PathBuf::from("frameway.log"));
        let file = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create log file {}", log_path.display()))?;

        env_logger::Builder::new()
            .filter_level(log_level)
            .filter_module("tiny_http", log::LevelFilter::Warn)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();

        info!("Logging to file: {} (level: {:?})", log_path.display(), log_level);
    } else {
        // Respects RUST_LOG if set
        let default_level = match args.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };

        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .filter_module("tiny_http", log::LevelFilter::Warn)
            .format_timestamp_millis()
            .init();
    }
    Ok(())
}

fn print_option_docs() {
    for doc in option_docs() {
        println!("  -o {}={}", doc.name, doc.value_placeholder);
        println!("      {} ({})", doc.description, doc.default_note);
    }
}

/// Quit on `quit` or end of input
fn spawn_stdin_reader(host_tx: Sender<HostMessage>) -> Result<()> {
    std::thread::Builder::new()
        .name("frameway-stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) if line.trim() == "quit" => break,
                    Ok(_) => println!("Type 'quit' to shut down"),
                    Err(e) => {
                        warn!("Reading stdin failed: {}", e);
                        break;
                    }
                }
            }
            let _ = host_tx.send(HostMessage::Quit);
        })?;
    Ok(())
}

fn open_window(
    ctx: &Context,
    handle: u64,
    host_tx: &Sender<HostMessage>,
    base_url: &str,
) {
    let path = ctx.create_window(handle, Arc::new(DemoWindow::new(host_tx.clone())));
    println!("Window {}: {}{}", handle, base_url, path);
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.list_options {
        print_option_docs();
        return Ok(());
    }

    init_logging(&args)?;
    debug!("Command-line args: {:?}", args);

    let ctx = Context::init(args.options.iter().map(|(n, v)| (n.as_str(), v.as_str())))
        .context("Invalid plugin options")?;

    let (host_tx, host_rx) = unbounded();
    spawn_stdin_reader(host_tx.clone())?;

    let ready_tx = host_tx.clone();
    let done_tx = host_tx.clone();
    ctx.start(
        move || {
            let _ = ready_tx.send(HostMessage::EventsReady);
        },
        move || {
            let _ = done_tx.send(HostMessage::ShutdownComplete);
        },
    );

    let base_url = match ctx.http_local_addr() {
        Some(addr) => format!("http://{}", addr),
        None => String::from("http://<stopped>"),
    };
    let mut next_handle = 1;
    for _ in 0..args.windows.max(1) {
        open_window(&ctx, next_handle, &host_tx, &base_url);
        next_handle += 1;
    }

    let mut shutting_down = false;
    for message in host_rx.iter() {
        match message {
            HostMessage::EventsReady => {
                if ctx.lifecycle() == Lifecycle::Running {
                    ctx.pump_events();
                }
            }
            HostMessage::WindowClosed(handle) => {
                if !shutting_down && ctx.lifecycle() == Lifecycle::Running {
                    debug!("Replacing closed window {}", handle);
                    open_window(&ctx, next_handle, &host_tx, &base_url);
                    next_handle += 1;
                }
            }
            HostMessage::Quit => {
                if !shutting_down {
                    info!("Shutting down");
                    shutting_down = true;
                    ctx.shutdown();
                }
            }
            HostMessage::ShutdownComplete => break,
        }
    }

    info!("Shutdown complete");
    Ok(())
}
