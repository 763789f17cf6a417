// crates/scrycast-capture/src/windows/mod.rs
//
// Windows-backed capture providers. Only compiled on `cfg(windows)` — on
// other platforms the crate still builds (queues, traits, tests) but offers
// no concrete FrameSource/AudioSource implementation.

pub mod dxgi;
pub mod wasapi;

pub use dxgi::DxgiFrameSource;
pub use wasapi::WasapiAudioSource;
