// crates/scrycast-media/src/lib.rs

pub mod encoder;
pub mod hls;
pub mod muxer;

pub use encoder::{AudioEncoder, AudioEncoderConfig, PacketCallback, VideoEncoder, VideoEncoderConfig};
pub use hls::{HlsTranscodeConfig, HlsTranscoder};
pub use muxer::{ContainerMuxer, MuxFanout, Muxer, MuxerConfig, Sink, SinkKind};
