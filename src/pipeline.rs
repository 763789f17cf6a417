// src/pipeline.rs
//
// Pipeline controller (§4.8): owns the capture sources, the bounded
// video/audio queues, the shared encoder pair, and the sink fanout. `start`
// and `stop` implement the two sequences from §4.8 directly; everything in
// between is two drain threads pulling off the queues and handing encoded
// packets to `MuxFanout`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use scrycast_core::config::RecordConfig;
use scrycast_core::{Clock, PipelineState, PipelineStatus};

use scrycast_capture::{
    fit_target_dims, AudioSource, AudioSourceConfig, BoundedQueue, FrameSource, FrameSourceConfig,
    AUDIO_QUEUE_CAPACITY, VIDEO_QUEUE_CAPACITY,
};
use scrycast_media::{
    AudioEncoder, AudioEncoderConfig, MuxFanout, MuxerConfig, Sink, SinkKind, VideoEncoder,
    VideoEncoderConfig,
};

#[cfg(windows)]
use scrycast_capture::{DxgiFrameSource, WasapiAudioSource};

const QUEUE_POP_TIMEOUT: Duration = Duration::from_millis(200);

pub struct Pipeline {
    config: RecordConfig,
    state: PipelineState,
    status: Arc<PipelineStatus>,
    running: Arc<AtomicBool>,
    /// Single process-wide presentation clock (§3), shared by both capture
    /// threads so video and audio land on the same monotonic timeline.
    clock: Arc<Clock>,

    #[cfg(windows)]
    video_source: Option<DxgiFrameSource>,
    #[cfg(windows)]
    audio_source: Option<WasapiAudioSource>,

    video_drain: Option<JoinHandle<()>>,
    audio_drain: Option<JoinHandle<()>>,
    fanout: Option<Arc<MuxFanout>>,
}

impl Pipeline {
    pub fn new(config: RecordConfig) -> Self {
        Self {
            config,
            state: PipelineState::Idle,
            status: Arc::new(PipelineStatus::new()),
            running: Arc::new(AtomicBool::new(false)),
            clock: Arc::new(Clock::new()),
            #[cfg(windows)]
            video_source: None,
            #[cfg(windows)]
            audio_source: None,
            video_drain: None,
            audio_drain: None,
            fanout: None,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == PipelineState::Running
    }

    pub fn status(&self) -> Arc<PipelineStatus> {
        self.status.clone()
    }

    /// §4.8 Idle -> Initialized: validates everything that needs no live
    /// capture source (region shape, at least one sink enabled) before any
    /// device is opened. Scenario 4 / §7.1 require an invalid region like
    /// `{-1,0,10,10}` to fail here, not after a DXGI device is already up.
    pub fn init(&mut self) -> anyhow::Result<()> {
        if self.state == PipelineState::Initialized {
            return Ok(());
        }
        if !self.state.can_transition_to(PipelineState::Initialized) {
            anyhow::bail!("cannot initialize pipeline from state {:?}", self.state);
        }
        self.config.validate_shape()?;
        self.state = PipelineState::Initialized;
        Ok(())
    }

    /// §4.8 start sequence: probe the source, validate config against it,
    /// open encoders, write sink headers, then start the capture threads.
    #[cfg(windows)]
    pub fn start(&mut self) -> anyhow::Result<()> {
        if self.state == PipelineState::Running {
            return Ok(());
        }
        if self.state != PipelineState::Initialized {
            self.init()?;
        }

        let frame_source_config = FrameSourceConfig {
            capture_full_screen: self.config.capture_full_screen,
            region: self.config.capture_region,
            target_width: self.config.width,
            target_height: self.config.height,
            maintain_aspect_ratio: self.config.maintain_aspect_ratio,
            frame_rate: self.config.frame_rate,
            quality: self.config.region_quality,
        };
        let mut video_source = DxgiFrameSource::new(frame_source_config)?;
        let (source_w, source_h) = video_source.source_dimensions();
        self.config.validate(source_w, source_h)?;

        let (out_w, out_h) = effective_dimensions(&self.config, source_w, source_h);

        let mut audio_source = WasapiAudioSource::new(AudioSourceConfig {
            sample_rate: self.config.sample_rate,
            channels: self.config.channels,
        })?;
        let (native_rate, native_channels) = audio_source.native_format();

        let video_encoder = VideoEncoder::open(VideoEncoderConfig {
            codec_name: self.config.video_codec_name.clone(),
            width: out_w,
            height: out_h,
            frame_rate: self.config.frame_rate,
            bit_rate: self.config.video_bitrate,
            gop_size: self.config.gop_size,
            max_b_frames: self.config.max_b_frames,
            preset: self.config.video_preset.clone(),
            tune: self.config.tune.clone(),
        })?;
        let audio_encoder = AudioEncoder::open(AudioEncoderConfig {
            codec_name: self.config.audio_codec_name.clone(),
            sample_rate: native_rate,
            channels: native_channels,
            bit_rate: self.config.audio_bitrate,
        })?;
        let video_encoder = Arc::new(Mutex::new(video_encoder));
        let audio_encoder = Arc::new(Mutex::new(audio_encoder));

        let mut sinks = Vec::new();
        if self.config.record_to_file {
            let path = timestamped_path(&self.config.output_directory, &self.config.output_filename);
            std::fs::create_dir_all(&self.config.output_directory)?;
            sinks.push(Sink::new(
                "mp4",
                MuxerConfig {
                    kind: SinkKind::File,
                    destination: path.to_string_lossy().into_owned(),
                    ..MuxerConfig::default()
                },
            ));
        }
        if self.config.rtmp.enabled {
            sinks.push(Sink::new(
                "flv",
                MuxerConfig {
                    kind: SinkKind::Network,
                    destination: self.config.rtmp.url.clone(),
                    format_name: Some("flv".into()),
                    probe_timeout_secs: self.config.rtmp.probe_timeout_secs,
                    write_timeout_secs: self.config.rtmp.write_timeout_secs,
                    ..MuxerConfig::default()
                },
            ));
        }
        if sinks.is_empty() {
            anyhow::bail!("no sinks configured; enable record_to_file or rtmp.enabled");
        }

        for sink in &sinks {
            if sink.kind == SinkKind::Network {
                if let Err(e) = sink.muxer.probe() {
                    tracing::warn!(destination = %sink.destination, error = %e, "rtmp pre-flight probe failed");
                }
            }
        }

        let fanout = Arc::new(MuxFanout::new(sinks));
        {
            let video_enc = video_encoder.lock().unwrap();
            let audio_enc = audio_encoder.lock().unwrap();
            fanout.write_headers(Some(&video_enc), Some(&audio_enc))?;
        }
        fanout.begin_streaming();

        // §4.8 start sequence step 4: start the Clock before any capture
        // thread can produce a frame.
        self.clock.start_recording();

        let video_queue = Arc::new(BoundedQueue::new(VIDEO_QUEUE_CAPACITY));
        let audio_queue = Arc::new(BoundedQueue::new(AUDIO_QUEUE_CAPACITY));

        self.running.store(true, Ordering::SeqCst);

        let vq = video_queue.clone();
        let status = self.status.clone();
        video_source.start(self.clock.clone(), Arc::new(move |result| match result {
            Ok(frame) => {
                status.record_frame_captured();
                let before = vq.drop_count();
                vq.push(frame);
                if vq.drop_count() != before {
                    status.record_frame_dropped();
                }
            }
            Err(e) => tracing::warn!(error = %e, "video capture error"),
        }))?;

        let aq = audio_queue.clone();
        let status = self.status.clone();
        audio_source.start(self.clock.clone(), Arc::new(move |result| match result {
            Ok(packet) => {
                status.record_audio_captured();
                let before = aq.drop_count();
                aq.push(packet);
                if aq.drop_count() != before {
                    status.record_audio_dropped();
                }
            }
            Err(e) => tracing::warn!(error = %e, "audio capture error"),
        }))?;

        let video_drain = spawn_video_drain(video_queue, video_encoder, fanout.clone(), self.status.clone(), self.running.clone());
        let audio_drain = spawn_audio_drain(audio_queue, audio_encoder, fanout.clone(), self.status.clone(), self.running.clone());

        self.video_source = Some(video_source);
        self.audio_source = Some(audio_source);
        self.video_drain = Some(video_drain);
        self.audio_drain = Some(audio_drain);
        self.fanout = Some(fanout);
        self.state = PipelineState::Running;
        Ok(())
    }

    #[cfg(not(windows))]
    pub fn start(&mut self) -> anyhow::Result<()> {
        anyhow::bail!("live desktop capture is only implemented for the Windows DXGI/WASAPI backends")
    }

    /// §4.8 stop sequence: stop producers first (no more frames enter the
    /// queues), drain threads notice via `running` and exit after flushing
    /// the encoders, then every sink gets its trailer and is closed.
    #[cfg(windows)]
    pub fn stop(&mut self) {
        if self.state != PipelineState::Running {
            return;
        }
        self.state = PipelineState::Stopping;
        self.running.store(false, Ordering::SeqCst);

        if let Some(mut s) = self.video_source.take() {
            s.stop();
        }
        if let Some(mut s) = self.audio_source.take() {
            s.stop();
        }
        if let Some(h) = self.video_drain.take() {
            let _ = h.join();
        }
        if let Some(h) = self.audio_drain.take() {
            let _ = h.join();
        }
        if let Some(fanout) = self.fanout.take() {
            fanout.close_all();
        }
        self.clock.stop_recording();
        self.state = PipelineState::Stopped;
    }

    #[cfg(not(windows))]
    pub fn stop(&mut self) {
        self.state = PipelineState::Stopped;
    }
}

/// Dimensions the video encoder must be opened at so they agree with what
/// the capture backend's converter will actually produce. Uses the same
/// crop-then-fit math `DxgiFrameSource` feeds into `bgra_region_to_yuv420p`
/// (crop size from `capture_region.padded_bounds`, or the full source frame
/// when no region is configured) so this can never diverge from the dims
/// stamped on the frames the encoder will be asked to accept.
fn effective_dimensions(config: &RecordConfig, source_w: u32, source_h: u32) -> (u32, u32) {
    let (crop_w, crop_h) = match &config.capture_region {
        Some(region) => {
            let (left, top, right, bottom) = region.padded_bounds(source_w, source_h);
            ((right - left).max(1) as u32, (bottom - top).max(1) as u32)
        }
        None => (source_w, source_h),
    };
    fit_target_dims(crop_w, crop_h, config.width, config.height, config.maintain_aspect_ratio)
}

/// Inserts a `YYYYmmdd_HHMMSS` timestamp before the file extension so
/// consecutive recordings to the same directory never collide.
fn timestamped_path(dir: &Path, filename: &str) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let path = Path::new(filename);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("recording");
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("mp4");
    dir.join(format!("{stem}_{stamp}.{ext}"))
}

fn spawn_video_drain(
    queue: Arc<BoundedQueue<scrycast_core::VideoFrame>>,
    encoder: Arc<Mutex<VideoEncoder>>,
    fanout: Arc<MuxFanout>,
    status: Arc<PipelineStatus>,
    running: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while running.load(Ordering::SeqCst) {
            let Some(frame) = queue.pop(QUEUE_POP_TIMEOUT) else { continue };
            let mut enc = encoder.lock().unwrap();
            if let Err(e) = enc.submit(&frame) {
                tracing::error!(error = %e, "video encode submit failed");
                continue;
            }
            match enc.drain() {
                Ok(packets) => {
                    for pkt in &packets {
                        fanout.dispatch(pkt);
                    }
                    status.record_frame_encoded();
                }
                Err(e) => tracing::error!(error = %e, "video encode drain failed"),
            }
        }
        let mut enc = encoder.lock().unwrap();
        if let Ok(packets) = enc.flush() {
            for pkt in &packets {
                fanout.dispatch(pkt);
            }
        }
    })
}

fn spawn_audio_drain(
    queue: Arc<BoundedQueue<scrycast_core::AudioPacket>>,
    encoder: Arc<Mutex<AudioEncoder>>,
    fanout: Arc<MuxFanout>,
    status: Arc<PipelineStatus>,
    running: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while running.load(Ordering::SeqCst) {
            let Some(packet) = queue.pop(QUEUE_POP_TIMEOUT) else { continue };
            let mut enc = encoder.lock().unwrap();
            match enc.submit(&packet) {
                Ok(packets) => {
                    status.record_samples_encoded(packet.samples_per_channel as u64);
                    for pkt in &packets {
                        fanout.dispatch(pkt);
                    }
                }
                Err(e) => tracing::error!(error = %e, "audio encode submit failed"),
            }
        }
        let mut enc = encoder.lock().unwrap();
        if let Ok(packets) = enc.flush() {
            for pkt in &packets {
                fanout.dispatch(pkt);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_dimensions_passthrough_when_unset() {
        let mut cfg = RecordConfig::default();
        cfg.width = 0;
        cfg.height = 0;
        assert_eq!(effective_dimensions(&cfg, 1920, 1080), (1920, 1080));
    }

    #[test]
    fn effective_dimensions_preserves_aspect_ratio() {
        let mut cfg = RecordConfig::default();
        cfg.width = 960;
        cfg.height = 0;
        cfg.maintain_aspect_ratio = true;
        assert_eq!(effective_dimensions(&cfg, 1920, 1080), (960, 540));
    }

    #[test]
    fn effective_dimensions_uses_region_crop_not_source_size() {
        let mut cfg = RecordConfig::default();
        cfg.capture_region = Some(scrycast_core::CaptureRegion { x: 0, y: 0, width: 800, height: 600, padding: 0 });
        cfg.width = 0;
        cfg.height = 0;
        assert_eq!(effective_dimensions(&cfg, 1920, 1080), (800, 600));
    }

    #[test]
    fn timestamped_path_preserves_extension() {
        let path = timestamped_path(Path::new("out"), "screen_record.mp4");
        assert!(path.extension().unwrap() == "mp4");
        assert!(path.to_string_lossy().contains("screen_record_"));
    }

    #[test]
    fn init_rejects_invalid_region_before_any_device_opens() {
        let mut cfg = RecordConfig::default();
        cfg.record_to_file = true;
        cfg.capture_region = Some(scrycast_core::CaptureRegion { x: -1, y: 0, width: 10, height: 10, padding: 0 });
        let mut pipeline = Pipeline::new(cfg);
        assert!(pipeline.init().is_err());
        assert_eq!(pipeline.state(), PipelineState::Idle);
    }

    #[test]
    fn init_accepts_valid_config_and_transitions_to_initialized() {
        let mut cfg = RecordConfig::default();
        cfg.record_to_file = true;
        let mut pipeline = Pipeline::new(cfg);
        assert!(pipeline.init().is_ok());
        assert_eq!(pipeline.state(), PipelineState::Initialized);
    }
}
