// crates/scrycast-capture/src/lib.rs
//
// Capture-side pipeline stages (§4.2-§4.3): platform capture backends feed
// bounded queues, with pixel/sample conversion done inline on the capture
// thread before a frame/buffer ever reaches the queue.

pub mod convert;
pub mod queue;
pub mod source;

#[cfg(windows)]
pub mod windows;

pub use convert::{bgra_region_to_yuv420p, convert_to_f32, fit_target_dims, SampleFormat};
pub use queue::{BoundedQueue, AUDIO_QUEUE_CAPACITY, VIDEO_QUEUE_CAPACITY};
pub use source::{
    AudioCallback, AudioSource, AudioSourceConfig, CaptureError, FrameCallback, FrameSource,
    FrameSourceConfig, MAX_REINIT_ATTEMPTS,
};

#[cfg(windows)]
pub use windows::{DxgiFrameSource, WasapiAudioSource};
