// crates/scrycast-media/src/muxer.rs
//
// Muxer (§4.7), Sink (§3), and MuxFanout (§4.6). `ContainerMuxer` is the one
// concrete shape behind the `{open, write_header, write_packet,
// write_trailer, close}` contract shared by the file, network, and
// segmented (HLS) muxers — they differ only in the ffmpeg output format
// name and the options dictionary passed at header-write time: stream/
// codecpar wiring shared across all three, and an HLS-only option set
// (`hls_time`, `hls_list_size`, `hls_flags delete_segments`).
//
// Open question resolved (§9): the muxer's timebase is read back from each
// stream *after* `write_header` — some containers (notably MPEG-TS/HLS)
// rewrite it during header write, and rescaling against the pre-header
// value would silently desync every packet after the first.

use std::sync::Mutex;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::util::rational::Rational;
use ffmpeg::Packet;

use scrycast_core::{EncodedPacket, SinkState, StreamKind};

use crate::encoder::{AudioEncoder, VideoEncoder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    File,
    Network,
    Hls,
}

#[derive(Debug, Clone)]
pub struct MuxerConfig {
    pub kind: SinkKind,
    /// File path for `File`/`Hls`, URL for `Network`.
    pub destination: String,
    /// Explicit ffmpeg output format name. `None` infers from the
    /// destination's extension (file sink only).
    pub format_name: Option<String>,
    /// Probe timeout for `Muxer::probe` (supplemental §0 feature), seconds.
    pub probe_timeout_secs: u32,
    /// Read/write timeout for the live network transport, seconds.
    pub write_timeout_secs: u32,
    pub segment_duration_secs: u32,
    /// 0 = unbounded segment list (§4.7).
    pub segment_list_size: u32,
    pub delete_old_segments: bool,
}

impl Default for MuxerConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::File,
            destination: String::new(),
            format_name: None,
            probe_timeout_secs: 5,
            write_timeout_secs: 10,
            segment_duration_secs: 10,
            segment_list_size: 0,
            delete_old_segments: true,
        }
    }
}

/// Shared `{open, write_header, write_packet, write_trailer, close}`
/// contract (§4.7) for every output shape.
pub trait Muxer: Send {
    fn open(&mut self) -> anyhow::Result<()>;
    fn add_video_stream(&mut self, encoder: &VideoEncoder) -> anyhow::Result<()>;
    fn add_audio_stream(&mut self, encoder: &AudioEncoder) -> anyhow::Result<()>;
    fn write_header(&mut self) -> anyhow::Result<()>;
    fn write_packet(&mut self, pkt: &EncodedPacket) -> anyhow::Result<()>;
    fn write_trailer(&mut self) -> anyhow::Result<()>;
    fn close(&mut self);
    /// Short-lived connectivity probe (supplemental §0 feature, grounded on
    /// `OutputManager::testRTMPConnection`). No-op for non-network sinks.
    fn probe(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct ContainerMuxer {
    config: MuxerConfig,
    octx: Option<ffmpeg::format::context::Output>,
    video_idx: Option<usize>,
    audio_idx: Option<usize>,
    video_enc_tb: Option<Rational>,
    audio_enc_tb: Option<Rational>,
    video_ost_tb: Option<Rational>,
    audio_ost_tb: Option<Rational>,
}

impl ContainerMuxer {
    pub fn new(config: MuxerConfig) -> Self {
        Self {
            config,
            octx: None,
            video_idx: None,
            audio_idx: None,
            video_enc_tb: None,
            audio_enc_tb: None,
            video_ost_tb: None,
            audio_ost_tb: None,
        }
    }

    fn header_options(&self) -> ffmpeg::Dictionary {
        let mut opts = ffmpeg::Dictionary::new();
        match self.config.kind {
            SinkKind::Hls => {
                opts.set("hls_time", &self.config.segment_duration_secs.to_string());
                opts.set("hls_list_size", &self.config.segment_list_size.to_string());
                if self.config.delete_old_segments {
                    opts.set("hls_flags", "delete_segments");
                }
            }
            SinkKind::Network => {
                opts.set(
                    "rw_timeout",
                    &(self.config.write_timeout_secs as u64 * 1_000_000).to_string(),
                );
            }
            SinkKind::File => {}
        }
        opts
    }
}

impl Muxer for ContainerMuxer {
    fn open(&mut self) -> anyhow::Result<()> {
        let octx = match (self.config.kind, &self.config.format_name) {
            (SinkKind::File, None) => ffmpeg::format::output(&self.config.destination)?,
            (SinkKind::File, Some(fmt)) => ffmpeg::format::output_as(&self.config.destination, fmt)?,
            (SinkKind::Network, fmt) => {
                ffmpeg::format::output_as(&self.config.destination, fmt.as_deref().unwrap_or("flv"))?
            }
            (SinkKind::Hls, _) => ffmpeg::format::output_as(&self.config.destination, "hls")?,
        };
        self.octx = Some(octx);
        Ok(())
    }

    fn add_video_stream(&mut self, encoder: &VideoEncoder) -> anyhow::Result<()> {
        let octx = self.octx.as_mut().ok_or_else(|| anyhow::anyhow!("muxer not open"))?;
        let tb = Rational::new(encoder.timebase().num, encoder.timebase().den);
        let mut stream = octx.add_stream(encoder.codec())?;
        stream.set_time_base(tb);
        encoder.write_parameters_into(&mut stream)?;
        self.video_idx = Some(stream.index());
        self.video_enc_tb = Some(tb);
        Ok(())
    }

    fn add_audio_stream(&mut self, encoder: &AudioEncoder) -> anyhow::Result<()> {
        let octx = self.octx.as_mut().ok_or_else(|| anyhow::anyhow!("muxer not open"))?;
        let tb = Rational::new(encoder.timebase().num, encoder.timebase().den);
        let mut stream = octx.add_stream(encoder.codec())?;
        stream.set_time_base(tb);
        encoder.write_parameters_into(&mut stream)?;
        self.audio_idx = Some(stream.index());
        self.audio_enc_tb = Some(tb);
        Ok(())
    }

    fn write_header(&mut self) -> anyhow::Result<()> {
        let opts = self.header_options();
        let octx = self.octx.as_mut().ok_or_else(|| anyhow::anyhow!("muxer not open"))?;
        octx.write_header_with(opts)?;

        // Read back post-header timebases (open question, resolved above).
        if let Some(idx) = self.video_idx {
            self.video_ost_tb = Some(octx.stream(idx).expect("video stream exists").time_base());
        }
        if let Some(idx) = self.audio_idx {
            self.audio_ost_tb = Some(octx.stream(idx).expect("audio stream exists").time_base());
        }
        Ok(())
    }

    fn write_packet(&mut self, pkt: &EncodedPacket) -> anyhow::Result<()> {
        let octx = self.octx.as_mut().ok_or_else(|| anyhow::anyhow!("muxer not open"))?;

        let (stream_idx, enc_tb, ost_tb) = match pkt.stream_kind {
            StreamKind::Video => (
                self.video_idx.ok_or_else(|| anyhow::anyhow!("no video stream on this sink"))?,
                self.video_enc_tb.expect("video timebase set at add_video_stream"),
                self.video_ost_tb.expect("video ost timebase set at write_header"),
            ),
            StreamKind::Audio => (
                self.audio_idx.ok_or_else(|| anyhow::anyhow!("no audio stream on this sink"))?,
                self.audio_enc_tb.expect("audio timebase set at add_audio_stream"),
                self.audio_ost_tb.expect("audio ost timebase set at write_header"),
            ),
        };

        let mut ff_pkt = Packet::copy(&pkt.data);
        ff_pkt.set_stream(stream_idx);

        let no_pts = pkt.pts == ffmpeg::ffi::AV_NOPTS_VALUE;
        ff_pkt.set_pts(if no_pts { None } else { Some(pkt.pts) });
        // Tie-break (§4.6): when dts is absent, fall back to pts.
        let dts = if pkt.dts == ffmpeg::ffi::AV_NOPTS_VALUE { pkt.pts } else { pkt.dts };
        ff_pkt.set_dts(if dts == ffmpeg::ffi::AV_NOPTS_VALUE { None } else { Some(dts) });
        ff_pkt.set_duration(pkt.duration);
        if pkt.is_keyframe {
            ff_pkt.set_flags(ffmpeg::packet::Flags::KEY);
        }

        if !no_pts {
            ff_pkt.rescale_ts(enc_tb, ost_tb);
        }

        ff_pkt
            .write_interleaved(octx)
            .map_err(|e| anyhow::anyhow!("write packet to sink: {e}"))
    }

    fn write_trailer(&mut self) -> anyhow::Result<()> {
        let octx = self.octx.as_mut().ok_or_else(|| anyhow::anyhow!("muxer not open"))?;
        octx.write_trailer().map_err(|e| anyhow::anyhow!("write trailer: {e}"))
    }

    fn close(&mut self) {
        self.octx = None;
    }

    fn probe(&self) -> anyhow::Result<()> {
        if self.config.kind != SinkKind::Network {
            return Ok(());
        }
        let mut opts = ffmpeg::Dictionary::new();
        opts.set("rw_timeout", &(self.config.probe_timeout_secs as u64 * 1_000_000).to_string());
        ffmpeg::format::input_with(&self.config.destination, opts)
            .map(|_| ())
            .or_else(|_| {
                // Many RTMP ingest endpoints only accept a publish (output)
                // connection, not a probe read — an open-for-output retry is
                // the more representative connectivity check in that case.
                ffmpeg::format::output_as(&self.config.destination, "flv").map(|_| ())
            })
            .map_err(|e| anyhow::anyhow!("rtmp probe failed for '{}': {e}", self.config.destination))
    }
}

impl ContainerMuxer {
    /// Stream-copy path for an HLS input stream whose codec already matches
    /// the HLS-native target: copies codec parameters straight from the
    /// input stream rather than routing through an encoder.
    pub fn add_passthrough_stream(
        &mut self,
        ictx: &ffmpeg::format::context::Input,
        idx: usize,
    ) -> anyhow::Result<()> {
        let in_stream = ictx.stream(idx).ok_or_else(|| anyhow::anyhow!("input stream {idx} missing"))?;
        let medium = in_stream.parameters().medium();
        let in_tb = in_stream.time_base();
        let codec_id = in_stream.parameters().id();
        let codec = ffmpeg::codec::encoder::find(codec_id)
            .ok_or_else(|| anyhow::anyhow!("no encoder registered for passthrough codec {:?}", codec_id))?;

        let octx = self.octx.as_mut().ok_or_else(|| anyhow::anyhow!("muxer not open"))?;
        let mut stream = octx.add_stream(codec)?;
        unsafe {
            let ret = ffmpeg::ffi::avcodec_parameters_copy(
                (*stream.as_mut_ptr()).codecpar,
                in_stream.parameters().as_ptr(),
            );
            if ret < 0 {
                anyhow::bail!("avcodec_parameters_copy failed: {ret}");
            }
        }
        stream.set_time_base(in_tb);

        match medium {
            ffmpeg::media::Type::Video => {
                self.video_idx = Some(stream.index());
                self.video_enc_tb = Some(in_tb);
            }
            ffmpeg::media::Type::Audio => {
                self.audio_idx = Some(stream.index());
                self.audio_enc_tb = Some(in_tb);
            }
            _ => {}
        }
        Ok(())
    }
}

/// One mux output (§3 Sink): lifecycle state plus the concrete muxer.
pub struct Sink {
    pub kind: SinkKind,
    pub container_format: String,
    pub destination: String,
    pub state: SinkState,
    pub muxer: Box<dyn Muxer>,
}

impl Sink {
    pub fn new(container_format: impl Into<String>, config: MuxerConfig) -> Self {
        Self {
            kind: config.kind,
            container_format: container_format.into(),
            destination: config.destination.clone(),
            state: SinkState::Configured,
            muxer: Box::new(ContainerMuxer::new(config)),
        }
    }
}

/// Single-writer, multi-reader sink multiplexer (§4.6). Owns the full set
/// of sinks; one fine-grained mutex per sink, never a single fanout-wide
/// lock (§5).
pub struct MuxFanout {
    sinks: Vec<Mutex<Sink>>,
}

impl MuxFanout {
    pub fn new(sinks: Vec<Sink>) -> Self {
        Self { sinks: sinks.into_iter().map(Mutex::new).collect() }
    }

    /// Opens, adds streams, and writes the header for every sink. A sink
    /// whose header-write fails is demoted to `Failed` and excluded; if
    /// none remain live, returns an error (§4.8 step 3).
    pub fn write_headers(&self, video: Option<&VideoEncoder>, audio: Option<&AudioEncoder>) -> anyhow::Result<()> {
        for guard in &self.sinks {
            let mut sink = guard.lock().unwrap();
            let result = (|| -> anyhow::Result<()> {
                sink.muxer.open()?;
                if let Some(v) = video {
                    sink.muxer.add_video_stream(v)?;
                }
                if let Some(a) = audio {
                    sink.muxer.add_audio_stream(a)?;
                }
                sink.muxer.write_header()
            })();

            match result {
                Ok(()) => {
                    sink.state = SinkState::HeaderWritten;
                    tracing::info!(destination = %sink.destination, "sink header written");
                }
                Err(e) => {
                    sink.state = SinkState::Failed;
                    tracing::warn!(destination = %sink.destination, error = %e, "sink header write failed, demoted");
                }
            }
        }

        if self.live_sink_count() == 0 {
            anyhow::bail!("no sinks survived header write");
        }
        Ok(())
    }

    /// Transitions every `HeaderWritten` sink to `Streaming` (§3). Called
    /// once the pipeline actually starts producing packets.
    pub fn begin_streaming(&self) {
        for guard in &self.sinks {
            let mut sink = guard.lock().unwrap();
            if sink.state == SinkState::HeaderWritten {
                sink.state = SinkState::Streaming;
            }
        }
    }

    /// Dispatches one encoded packet to every live sink (§4.6). A
    /// recoverable per-sink write error demotes only that sink.
    pub fn dispatch(&self, pkt: &EncodedPacket) {
        for guard in &self.sinks {
            let mut sink = guard.lock().unwrap();
            if !sink.state.accepts_packets() {
                continue;
            }
            if let Err(e) = sink.muxer.write_packet(pkt) {
                sink.state = SinkState::Failed;
                tracing::warn!(destination = %sink.destination, error = %e, "sink write failed, demoted");
            }
        }
    }

    /// Writes the trailer for every sink that was `Streaming` (or still
    /// `HeaderWritten`), then closes its transport (§4.8 stop sequence).
    pub fn close_all(&self) {
        for guard in &self.sinks {
            let mut sink = guard.lock().unwrap();
            if matches!(sink.state, SinkState::Streaming | SinkState::HeaderWritten) {
                if let Err(e) = sink.muxer.write_trailer() {
                    tracing::warn!(destination = %sink.destination, error = %e, "trailer write failed");
                }
                sink.muxer.close();
                sink.state = SinkState::Closed;
            }
        }
    }

    pub fn live_sink_count(&self) -> usize {
        self.sinks
            .iter()
            .filter(|g| !g.lock().unwrap().state.is_terminal())
            .count()
    }

    pub fn all_terminal(&self) -> bool {
        self.sinks.iter().all(|g| g.lock().unwrap().state.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeMuxer {
        state_log: Vec<&'static str>,
        fail_write: bool,
    }

    impl Muxer for FakeMuxer {
        fn open(&mut self) -> anyhow::Result<()> {
            self.state_log.push("open");
            Ok(())
        }
        fn add_video_stream(&mut self, _encoder: &VideoEncoder) -> anyhow::Result<()> {
            Ok(())
        }
        fn add_audio_stream(&mut self, _encoder: &AudioEncoder) -> anyhow::Result<()> {
            Ok(())
        }
        fn write_header(&mut self) -> anyhow::Result<()> {
            self.state_log.push("header");
            Ok(())
        }
        fn write_packet(&mut self, _pkt: &EncodedPacket) -> anyhow::Result<()> {
            if self.fail_write {
                anyhow::bail!("simulated transport failure");
            }
            self.state_log.push("packet");
            Ok(())
        }
        fn write_trailer(&mut self) -> anyhow::Result<()> {
            self.state_log.push("trailer");
            Ok(())
        }
        fn close(&mut self) {
            self.state_log.push("close");
        }
    }

    fn fake_sink(fail_write: bool) -> Sink {
        Sink {
            kind: SinkKind::File,
            container_format: "mp4".into(),
            destination: "test.mp4".into(),
            state: SinkState::Configured,
            muxer: Box::new(FakeMuxer { state_log: Vec::new(), fail_write }),
        }
    }

    fn fake_packet() -> EncodedPacket {
        EncodedPacket {
            stream_kind: StreamKind::Video,
            pts: 0,
            dts: 0,
            duration: 1,
            timebase: scrycast_core::Timebase { num: 1, den: 30 },
            is_keyframe: true,
            data: std::sync::Arc::from(vec![0u8; 4].into_boxed_slice()),
        }
    }

    #[test]
    fn failed_write_demotes_only_that_sink() {
        let fanout = MuxFanout::new(vec![fake_sink(false), fake_sink(true)]);
        for s in &fanout.sinks {
            s.lock().unwrap().state = SinkState::Streaming;
        }
        fanout.dispatch(&fake_packet());
        assert_eq!(fanout.sinks[0].lock().unwrap().state, SinkState::Streaming);
        assert_eq!(fanout.sinks[1].lock().unwrap().state, SinkState::Failed);
    }

    #[test]
    fn live_sink_count_excludes_terminal() {
        let fanout = MuxFanout::new(vec![fake_sink(false), fake_sink(false)]);
        fanout.sinks[0].lock().unwrap().state = SinkState::Failed;
        assert_eq!(fanout.live_sink_count(), 1);
    }
}
