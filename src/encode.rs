//! Frame encoding for image responses.
//!
//! The host hands over raw RGBA8 framebuffers; they are compressed to PNG with
//! the `image` crate right before being written to the HTTP response.

use anyhow::{Result, bail};
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};

/// Raw RGBA8 framebuffer produced by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Frame {
    /// Wrap tightly packed RGBA8 pixels (`width * height * 4` bytes).
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        if width == 0 || height == 0 {
            bail!("Frame dimensions must be nonzero, got {}x{}", width, height);
        }
        let expected = width as usize * height as usize * 4;
        if pixels.len() != expected {
            bail!(
                "Frame {}x{} needs {} bytes of RGBA data, got {}",
                width,
                height,
                expected,
                pixels.len()
            );
        }
        Ok(Self { width, height, pixels })
    }

    /// Solid color frame
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Result<Self> {
        let count = width as usize * height as usize;
        Self::new(width, height, rgba.repeat(count))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}

pub const PNG_CONTENT_TYPE: &str = "image/png";

/// Compress a frame to PNG.
pub fn encode_png(frame: &Frame) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    PngEncoder::new(&mut out).write_image(
        frame.pixels(),
        frame.width(),
        frame.height(),
        ExtendedColorType::Rgba8,
    )?;
    Ok(out)
}
