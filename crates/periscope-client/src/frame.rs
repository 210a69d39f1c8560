//! Decoded-frame handoff between the consumer and the renderer.

use std::sync::Arc;

use crate::stats::StageLatencies;

/// GL texture target of a hardware-decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextureTarget {
    #[default]
    Texture2d,
    ExternalOes,
}

/// Most recent decoded frame of one eye.
///
/// Either a GL texture handle (hardware decode) or an owned RGB buffer of
/// `width * height * 3` bytes (software decode). `has_texture` is the
/// authoritative discriminator; `texture_target` is auxiliary and may hold
/// a 2D fallback even for CPU-backed frames.
#[derive(Debug)]
pub struct EyeFrame {
    pub width: u32,
    pub height: u32,

    pub has_texture: bool,
    pub texture_id: u32,
    pub texture_target: TextureTarget,

    pub pixels: Vec<u8>,

    pub stats: Arc<StageLatencies>,
}

impl EyeFrame {
    /// Allocate a zeroed frame for the given resolution.
    pub fn new(width: u32, height: u32, stats: Arc<StageLatencies>) -> Self {
        Self {
            width,
            height,
            has_texture: false,
            texture_id: 0,
            texture_target: TextureTarget::default(),
            pixels: vec![0u8; (width * height * 3) as usize],
            stats,
        }
    }

    pub fn buffer_size(&self) -> usize {
        (self.width * self.height * 3) as usize
    }

    /// Reallocate for a new resolution, dropping any stale texture handle.
    pub fn reallocate(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.has_texture = false;
        self.texture_id = 0;
        self.texture_target = TextureTarget::default();
        self.pixels = vec![0u8; (width * height * 3) as usize];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_is_three_bytes_per_pixel() {
        let frame = EyeFrame::new(1920, 1080, Arc::new(StageLatencies::new()));
        assert_eq!(frame.pixels.len(), 1920 * 1080 * 3);
        assert_eq!(frame.buffer_size(), frame.pixels.len());
        assert!(!frame.has_texture);
    }

    #[test]
    fn reallocate_resets_the_texture_path() {
        let mut frame = EyeFrame::new(1920, 1080, Arc::new(StageLatencies::new()));
        frame.has_texture = true;
        frame.texture_id = 7;
        frame.texture_target = TextureTarget::ExternalOes;

        frame.reallocate(1280, 720);
        assert_eq!(frame.pixels.len(), 1280 * 720 * 3);
        assert!(!frame.has_texture);
        assert_eq!(frame.texture_id, 0);
        assert_eq!(frame.texture_target, TextureTarget::Texture2d);
    }
}
