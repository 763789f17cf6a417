// crates/scrycast-capture/src/source.rs
//
// Capability traits for the two capture providers. Concrete platform
// backends (windows/dxgi.rs, windows/wasapi.rs) implement these; the
// pipeline controller in scrycast-media only ever sees the trait objects.

use scrycast_core::{AudioPacket, CaptureQuality, CaptureRegion, Clock, VideoFrame};
use std::fmt;
use std::sync::Arc;

/// Number of consecutive device re-init failures after which a source gives
/// up and reports itself permanently lost (§4.2, §7.3).
pub const MAX_REINIT_ATTEMPTS: u32 = 3;

#[derive(Debug)]
pub enum CaptureError {
    /// Provider could not be opened at all — fails `init()` (§7.1/§7.2).
    DeviceInit(String),
    /// Reinitialized in place after transient loss; informational only.
    DeviceLostRecovered,
    /// Exhausted `MAX_REINIT_ATTEMPTS` consecutive reinit attempts.
    DeviceLostPermanent,
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::DeviceInit(msg) => write!(f, "device init failed: {msg}"),
            CaptureError::DeviceLostRecovered => write!(f, "device lost, recovered"),
            CaptureError::DeviceLostPermanent => {
                write!(f, "device lost permanently after {MAX_REINIT_ATTEMPTS} reinit attempts")
            }
        }
    }
}

impl std::error::Error for CaptureError {}

/// Configuration for a [`FrameSource`], independent of the platform backend.
#[derive(Debug, Clone)]
pub struct FrameSourceConfig {
    pub capture_full_screen: bool,
    pub region: Option<CaptureRegion>,
    pub target_width: u32,
    pub target_height: u32,
    pub maintain_aspect_ratio: bool,
    pub frame_rate: u32,
    pub quality: CaptureQuality,
}

/// Callback invoked from the capture thread for every produced video frame,
/// or with `Err` when the source hits a terminal condition.
pub type FrameCallback = Arc<dyn Fn(Result<VideoFrame, CaptureError>) + Send + Sync>;

/// Produces video frames from the desktop at (best-effort) `frame_rate`.
pub trait FrameSource: Send {
    /// Opens the capture provider. May fail with [`CaptureError::DeviceInit`].
    fn new(config: FrameSourceConfig) -> anyhow::Result<Self>
    where
        Self: Sized;

    /// Spawns the producer thread, which invokes `callback` for each frame
    /// (or on terminal failure) until [`stop`](Self::stop) is called. `clock`
    /// is the pipeline's single shared presentation clock (§3) — every frame
    /// is stamped from it, never from a source-local clock, so video and
    /// audio land on the same timeline.
    fn start(&mut self, clock: Arc<Clock>, callback: FrameCallback) -> anyhow::Result<()>;

    /// Signals the producer thread to stop and joins it. Must not call back
    /// into `callback` after returning.
    fn stop(&mut self);

    fn source_dimensions(&self) -> (u32, u32);
}

/// Configuration for an [`AudioSource`].
#[derive(Debug, Clone)]
pub struct AudioSourceConfig {
    pub sample_rate: u32,
    pub channels: u16,
}

pub type AudioCallback = Arc<dyn Fn(Result<AudioPacket, CaptureError>) + Send + Sync>;

/// Produces audio buffers from a loopback endpoint at the device's native
/// mix format (which may override the configured defaults — §4.3).
pub trait AudioSource: Send {
    fn new(config: AudioSourceConfig) -> anyhow::Result<Self>
    where
        Self: Sized;

    fn start(&mut self, clock: Arc<Clock>, callback: AudioCallback) -> anyhow::Result<()>;

    fn stop(&mut self);

    /// Recovers after a device-change notification without tearing down the
    /// whole pipeline.
    fn reinitialize(&mut self) -> anyhow::Result<()>;

    /// Native mix format actually negotiated with the endpoint.
    fn native_format(&self) -> (u32, u16);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_error_messages_are_descriptive() {
        let e = CaptureError::DeviceInit("no duplication output".into());
        assert!(e.to_string().contains("no duplication output"));
        assert!(CaptureError::DeviceLostPermanent
            .to_string()
            .contains(&MAX_REINIT_ATTEMPTS.to_string()));
    }
}
