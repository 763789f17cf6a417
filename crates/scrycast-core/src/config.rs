// crates/scrycast-core/src/config.rs
//
// Layered configuration: defaults (below) <- optional `scrycast.toml` <-
// `SCRYCAST_*` environment overrides, via the `config` crate. Defaults mirror
// the upstream reference implementation's ScreenRecorderConfig / RTMPConfig /
// HLS config so a config-less run behaves the same way.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::types::{CaptureQuality, CaptureRegion};

/// Configuration for the single shared video/audio encoder pair. One
/// `Encoder` feeds `MuxFanout`, which writes to every live sink — there is
/// no per-sink encoder, so bitrate/preset/gop apply uniformly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordConfig {
    pub record_to_file: bool,
    pub output_directory: PathBuf,
    pub output_filename: String,

    pub capture_full_screen: bool,
    pub capture_region: Option<CaptureRegion>,
    pub maintain_aspect_ratio: bool,
    pub region_quality: CaptureQuality,

    /// Output dimensions; 0 means "same as captured source".
    pub width: u32,
    pub height: u32,

    pub video_codec_name: String,
    pub audio_codec_name: String,
    pub video_bitrate: u32,
    pub audio_bitrate: u32,
    pub video_preset: String,
    pub tune: String,
    pub gop_size: u32,
    pub max_b_frames: u32,
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_rate: u32,

    pub rtmp: RtmpConfig,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            record_to_file: true,
            output_directory: PathBuf::from("recording"),
            output_filename: "screen_record.mp4".to_string(),
            capture_full_screen: true,
            capture_region: None,
            maintain_aspect_ratio: true,
            region_quality: CaptureQuality::Balanced,
            width: 0,
            height: 0,
            video_codec_name: "libx264".to_string(),
            audio_codec_name: "aac".to_string(),
            video_bitrate: 1_000_000,
            audio_bitrate: 128_000,
            video_preset: "veryfast".to_string(),
            tune: "zerolatency".to_string(),
            gop_size: 10,
            max_b_frames: 0,
            sample_rate: 44_100,
            channels: 2,
            frame_rate: 30,
            rtmp: RtmpConfig::default(),
        }
    }
}

impl RecordConfig {
    /// Rejects config shape problems that need no live capture source:
    /// a configured region failing [`CaptureRegion::validate_shape`], or
    /// neither a file nor a network sink enabled. Run this in
    /// `Pipeline::init` (Idle -> Initialized), before any device opens.
    pub fn validate_shape(&self) -> anyhow::Result<()> {
        if let Some(region) = &self.capture_region {
            region.validate_shape()?;
        }
        if !self.record_to_file && !self.rtmp.enabled {
            anyhow::bail!("at least one of record_to_file or rtmp.enabled must be true");
        }
        Ok(())
    }

    /// Full validation once a capture source exists: `validate_shape` plus
    /// the region-vs-source-bounds check from [`CaptureRegion::validate`].
    pub fn validate(&self, source_width: u32, source_height: u32) -> anyhow::Result<()> {
        self.validate_shape()?;
        if let Some(region) = &self.capture_region {
            region.validate(source_width, source_height)?;
        }
        Ok(())
    }
}

/// Network-sink-specific settings. The encoder itself is configured once on
/// `RecordConfig` and shared across sinks — this only covers the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtmpConfig {
    pub enabled: bool,
    pub url: String,
    /// Probe timeout in seconds for the pre-flight connectivity check
    /// (`Muxer::probe`).
    pub probe_timeout_secs: u32,
    /// Read/write timeout in seconds for the live push transport.
    pub write_timeout_secs: u32,
}

impl Default for RtmpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "rtmp://localhost/live/stream".to_string(),
            probe_timeout_secs: 5,
            write_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HlsConfig {
    pub video_path: PathBuf,
    pub hls_dir: PathBuf,
    pub m3u8_filename: String,
    pub http_port: u16,
    pub segment_duration_secs: u32,
    pub video_bitrate: u32,
    pub audio_bitrate: u32,
    pub http_threads: usize,
    pub clean_old_segments: bool,
    pub force_reconvert: bool,
    pub check_hls_integrity: bool,
    pub max_reconvert_attempts: u32,
    pub supported_extensions: Vec<String>,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            video_path: PathBuf::from("local_video.mp4"),
            hls_dir: PathBuf::from("hls_stream"),
            m3u8_filename: "stream.m3u8".to_string(),
            http_port: 8080,
            segment_duration_secs: 10,
            video_bitrate: 1_000_000,
            audio_bitrate: 128_000,
            http_threads: 4,
            clean_old_segments: true,
            force_reconvert: false,
            check_hls_integrity: true,
            max_reconvert_attempts: 3,
            supported_extensions: [".mp4", ".avi", ".mov", ".mkv", ".flv", ".wmv", ".webm"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// Loads a `RecordConfig` from `path` (if it exists) layered with
/// `SCRYCAST_*` environment overrides (e.g. `SCRYCAST_RTMP__URL`), falling
/// back to defaults entirely when `path` is absent.
pub fn load_record_config(path: &std::path::Path) -> anyhow::Result<RecordConfig> {
    load_layered(path, "SCRYCAST")
}

/// Loads an `HlsConfig` the same way, under the `SCRYCAST_HLS` env prefix.
pub fn load_hls_config(path: &std::path::Path) -> anyhow::Result<HlsConfig> {
    load_layered(path, "SCRYCAST_HLS")
}

fn load_layered<T>(path: &std::path::Path, env_prefix: &str) -> anyhow::Result<T>
where
    T: Default + serde::Serialize + for<'de> serde::Deserialize<'de>,
{
    let defaults = T::default();
    let defaults_json = serde_json::to_value(&defaults)?;

    let mut builder = config::Config::builder()
        .add_source(config::Config::try_from(&defaults_json)?);

    if path.exists() {
        builder = builder.add_source(config::File::from(path));
    }

    builder = builder.add_source(
        config::Environment::with_prefix(env_prefix)
            .separator("__")
            .try_parsing(true),
    );

    let built = builder.build()?;
    Ok(built.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_values() {
        let cfg = RecordConfig::default();
        assert_eq!(cfg.sample_rate, 44_100);
        assert_eq!(cfg.channels, 2);
        assert_eq!(cfg.gop_size, 10);
        assert_eq!(cfg.rtmp.url, "rtmp://localhost/live/stream");
    }

    #[test]
    fn hls_defaults_match_reference_values() {
        let cfg = HlsConfig::default();
        assert_eq!(cfg.max_reconvert_attempts, 3);
        assert_eq!(cfg.supported_extensions.len(), 7);
        assert!(cfg.supported_extensions.contains(&".mp4".to_string()));
    }

    #[test]
    fn validate_rejects_no_sink_enabled() {
        let mut cfg = RecordConfig::default();
        cfg.record_to_file = false;
        cfg.rtmp.enabled = false;
        assert!(cfg.validate(1920, 1080).is_err());
    }

    #[test]
    fn load_missing_file_falls_back_to_defaults() {
        let cfg = load_record_config(std::path::Path::new("/nonexistent/scrycast.toml")).unwrap();
        assert_eq!(cfg.sample_rate, 44_100);
    }
}
