// crates/scrycast-core/src/types.rs
//
// Plain data carried across the capture -> queue -> encode -> mux channels.
// No ffmpeg types here — crates downstream (scrycast-media) convert these
// into ffmpeg frames/packets at the boundary, keeping decoder/capture
// thread messages separate from any ffmpeg-specific representation.

use serde::{Deserialize, Serialize};

/// One captured video frame, already converted to the encoder's pixel
/// format by the time it reaches the queue: a contiguous planar YUV420P
/// buffer (Y plane, then U, then V, no per-row padding).
///
/// `data.len() == width * height * 3 / 2` always holds (§8 invariant).
#[derive(Clone)]
pub struct VideoFrame {
    pub frame_index: i64,
    pub width: u32,
    pub height: u32,
    pub timestamp_us: i64,
    pub data: Vec<u8>,
}

impl VideoFrame {
    pub fn expected_len(width: u32, height: u32) -> usize {
        (width as usize * height as usize * 3) / 2
    }
}

/// One captured audio buffer: interleaved float32 samples plus the running
/// sample count at which this buffer starts (`cumulative_samples`).
#[derive(Clone)]
pub struct AudioPacket {
    pub cumulative_samples: i64,
    pub samples_per_channel: usize,
    pub channels: u16,
    pub sample_rate: u32,
    pub timestamp_us: i64,
    pub is_silent: bool,
    /// Interleaved f32 samples, `samples_per_channel * channels` elements.
    pub samples: Vec<f32>,
}

impl AudioPacket {
    pub fn frame_count(&self) -> usize {
        self.samples_per_channel
    }
}

/// Logical stream a packet belongs to; maps to stream index 0 (video) or 1
/// (audio) on every sink's muxer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
}

/// A rational timebase, e.g. `{ num: 1, den: 90_000 }` for a 1/90000s unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timebase {
    pub num: i32,
    pub den: i32,
}

/// One encoded packet ready for mux fan-out, stamped with PTS/DTS in
/// `timebase` (the producing encoder's timebase — each sink rescales to its
/// own stream's timebase before writing).
#[derive(Clone)]
pub struct EncodedPacket {
    pub stream_kind: StreamKind,
    pub pts: i64,
    pub dts: i64,
    pub duration: i64,
    pub timebase: Timebase,
    pub is_keyframe: bool,
    pub data: std::sync::Arc<[u8]>,
}

/// A capture region in source-framebuffer pixel coordinates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CaptureRegion {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    /// Extra pixels to grow the region outward (clamped to source bounds)
    /// before cropping. Default 0 — opt-in slack for a region tracking a
    /// moving window.
    #[serde(default)]
    pub padding: u32,
}

impl CaptureRegion {
    /// Returns `(left, top, right, bottom)` after applying `padding` and
    /// clamping to `(source_width, source_height)`.
    pub fn padded_bounds(&self, source_width: u32, source_height: u32) -> (i32, i32, i32, i32) {
        let left = (self.x - self.padding as i32).max(0);
        let top = (self.y - self.padding as i32).max(0);
        let right = ((self.x + self.width as i32) + self.padding as i32).min(source_width as i32);
        let bottom =
            ((self.y + self.height as i32) + self.padding as i32).min(source_height as i32);
        (left, top, right, bottom)
    }

    /// Rejects negative origins and a right/bottom edge that doesn't extend
    /// past its left/top edge. Needs no source dimensions, so this is the
    /// part of validation a pipeline can run before any capture device is
    /// opened (`Pipeline::init`, Idle -> Initialized).
    pub fn validate_shape(&self) -> anyhow::Result<()> {
        if self.x < 0 || self.y < 0 {
            anyhow::bail!("capture region origin must be non-negative, got ({}, {})", self.x, self.y);
        }
        let right = self.x + self.width as i32;
        let bottom = self.y + self.height as i32;
        if right <= self.x || bottom <= self.y {
            anyhow::bail!("capture region has zero or negative extent");
        }
        Ok(())
    }

    /// Full validation against source bounds: `validate_shape` plus a check
    /// that the region doesn't extend past `(source_width, source_height)`.
    /// Only callable once a capture source exists to report its dimensions.
    pub fn validate(&self, source_width: u32, source_height: u32) -> anyhow::Result<()> {
        self.validate_shape()?;
        let right = self.x + self.width as i32;
        let bottom = self.y + self.height as i32;
        if right > source_width as i32 || bottom > source_height as i32 {
            anyhow::bail!(
                "capture region ({}, {}, {}, {}) exceeds source bounds {}x{}",
                self.x, self.y, right, bottom, source_width, source_height
            );
        }
        Ok(())
    }
}

/// Capture conversion fidelity, traded off against CPU cost on the capture
/// thread. Mirrors the three dispatch paths a DXGI-backed [`crate::config`]
/// capture mode may choose between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureQuality {
    Fast,
    Balanced,
    High,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_packet_frame_count() {
        let pkt = AudioPacket {
            cumulative_samples: 0,
            samples_per_channel: 1024,
            channels: 2,
            sample_rate: 44_100,
            timestamp_us: 0,
            is_silent: false,
            samples: vec![0.0; 2048],
        };
        assert_eq!(pkt.frame_count(), 1024);
    }

    #[test]
    fn video_frame_expected_len_matches_yuv420p() {
        assert_eq!(VideoFrame::expected_len(640, 480), 460_800);
    }

    #[test]
    fn region_validate_rejects_out_of_bounds() {
        let r = CaptureRegion { x: 0, y: 0, width: 4000, height: 4000, padding: 0 };
        assert!(r.validate(1920, 1080).is_err());
    }

    #[test]
    fn region_validate_accepts_full_frame() {
        let r = CaptureRegion { x: 0, y: 0, width: 1920, height: 1080, padding: 0 };
        assert!(r.validate(1920, 1080).is_ok());
    }

    #[test]
    fn validate_shape_rejects_negative_origin_without_source_dims() {
        let r = CaptureRegion { x: -1, y: 0, width: 10, height: 10, padding: 0 };
        assert!(r.validate_shape().is_err());
    }

    #[test]
    fn validate_shape_accepts_in_bounds_region_regardless_of_source_size() {
        let r = CaptureRegion { x: 0, y: 0, width: 4000, height: 4000, padding: 0 };
        assert!(r.validate_shape().is_ok());
    }

    #[test]
    fn padded_bounds_clamp_to_source() {
        let r = CaptureRegion { x: 0, y: 0, width: 100, height: 100, padding: 20 };
        assert_eq!(r.padded_bounds(1920, 1080), (0, 0, 120, 120));
    }
}
