// crates/scrycast-core/src/lib.rs
//
// Domain types, clock, config, and state machines shared by the capture,
// media, and server crates. No ffmpeg or platform-capture types live here —
// see scrycast-capture and scrycast-media for the code that bridges these
// plain types to ffmpeg-the-third and the Windows capture APIs.

pub mod clock;
pub mod config;
pub mod sink;
pub mod status;
pub mod types;

pub use clock::Clock;
pub use sink::{PipelineState, SinkState};
pub use status::PipelineStatus;
pub use types::{
    AudioPacket, CaptureQuality, CaptureRegion, EncodedPacket, StreamKind, Timebase, VideoFrame,
};
