// crates/scrycast-media/src/encoder.rs
//
// VideoEncoder / AudioEncoder (§4.5): stateful transforms from raw
// scrycast-core frames to scrycast-core::EncodedPacket. Grounded on the
// teacher's encode.rs — same codec-context-independent-of-stream setup,
// same avcodec_parameters_from_context FFI bridge (Stream::codec() doesn't
// exist in this ffmpeg-the-third version), same AudioFifo shape for
// fixed-frame-size codecs.
//
// PTS strategy (§4.5, §9 open question resolved): video assigns
// `pts = frame_index++` in the frame-rate timebase; audio assigns
// `pts = cumulative_samples_encoded` in the sample-rate timebase. Both are
// rescaled to each sink's container timebase by the muxer, never here.

use std::sync::{Arc, Mutex};

use ffmpeg_the_third as ffmpeg;
use ffmpeg::codec::{self, Id as CodecId};
use ffmpeg::format::sample::Type as SampleType;
use ffmpeg::format::{Pixel, Sample};
use ffmpeg::util::channel_layout::ChannelLayout;
use ffmpeg::util::frame::audio::Audio as FfAudioFrame;
use ffmpeg::util::frame::video::Video as FfVideoFrame;
use ffmpeg::util::rational::Rational;
use ffmpeg::Packet;

use scrycast_core::{AudioPacket, EncodedPacket, StreamKind, Timebase, VideoFrame};

/// Invoked once per encoded packet. Registered only at wiring time; the
/// callback list is guarded by a mutex solely for registration (§4.5) —
/// `drain`/`flush` snapshot the list and invoke callbacks outside any lock.
pub type PacketCallback = Arc<dyn Fn(&EncodedPacket) + Send + Sync>;

#[derive(Default)]
struct CallbackList(Mutex<Vec<PacketCallback>>);

impl CallbackList {
    fn register(&self, cb: PacketCallback) {
        self.0.lock().unwrap().push(cb);
    }

    fn snapshot(&self) -> Vec<PacketCallback> {
        self.0.lock().unwrap().clone()
    }
}

fn invoke_all(callbacks: &[PacketCallback], pkt: &EncodedPacket) {
    for cb in callbacks {
        cb(pkt);
    }
}

#[derive(Debug, Clone)]
pub struct VideoEncoderConfig {
    pub codec_name: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub bit_rate: u32,
    pub gop_size: u32,
    pub max_b_frames: u32,
    pub preset: String,
    pub tune: String,
}

pub struct VideoEncoder {
    config: VideoEncoderConfig,
    codec: ffmpeg::codec::codec::Codec,
    encoder: ffmpeg::encoder::video::Video,
    frame_index: i64,
    callbacks: CallbackList,
    timebase: Timebase,
}

impl VideoEncoder {
    pub fn open(config: VideoEncoderConfig) -> anyhow::Result<Self> {
        let codec = codec::encoder::find_by_name(&config.codec_name)
            .or_else(|| codec::encoder::find(CodecId::H264))
            .ok_or_else(|| anyhow::anyhow!("video encoder '{}' not found", config.codec_name))?;
        let encoder = Self::build(&config, codec)?;
        Ok(Self {
            timebase: Timebase { num: 1, den: config.frame_rate.max(1) as i32 },
            config,
            codec,
            encoder,
            frame_index: 0,
            callbacks: CallbackList::default(),
        })
    }

    /// The ffmpeg codec this encoder was opened with — `Muxer::add_video_stream`
    /// needs it to call `add_stream`, since `Stream::codec()` doesn't exist in
    /// this ffmpeg-the-third version.
    pub fn codec(&self) -> ffmpeg::codec::codec::Codec {
        self.codec
    }

    fn build(
        config: &VideoEncoderConfig,
        codec: ffmpeg::codec::codec::Codec,
    ) -> anyhow::Result<ffmpeg::encoder::video::Video> {
        let ctx = codec::context::Context::new_with_codec(codec);
        let mut enc = ctx
            .encoder()
            .video()
            .map_err(|e| anyhow::anyhow!("create video encoder context: {e}"))?;

        enc.set_width(config.width);
        enc.set_height(config.height);
        enc.set_format(Pixel::YUV420P);
        enc.set_time_base(Rational::new(1, config.frame_rate.max(1) as i32));
        enc.set_frame_rate(Some(Rational::new(config.frame_rate.max(1) as i32, 1)));
        enc.set_bit_rate(config.bit_rate as usize);
        enc.set_gop(config.gop_size);
        enc.set_max_b_frames(config.max_b_frames as usize);

        let mut opts = ffmpeg::Dictionary::new();
        if !config.preset.is_empty() {
            opts.set("preset", &config.preset);
        }
        if !config.tune.is_empty() {
            opts.set("tune", &config.tune);
        }

        let mut opened = enc
            .open_as_with(codec, opts)
            .map_err(|e| anyhow::anyhow!("open video encoder '{}': {e}", config.codec_name))?;
        opened.set_aspect_ratio(Rational::new(1, 1));
        Ok(opened)
    }

    pub fn register_callback(&self, cb: PacketCallback) {
        self.callbacks.register(cb);
    }

    pub fn timebase(&self) -> Timebase {
        self.timebase
    }

    /// Copies the opened codec's parameters into `params` via the
    /// `avcodec_parameters_from_context`/`_copy` FFI bridge
    /// (`Stream::codec()` is unavailable in this ffmpeg binding).
    pub fn write_parameters_into(
        &self,
        stream: &mut ffmpeg::format::stream::StreamMut,
    ) -> anyhow::Result<()> {
        unsafe {
            let ret = ffmpeg::ffi::avcodec_parameters_from_context(
                (*stream.as_mut_ptr()).codecpar,
                self.encoder.as_ptr() as *mut ffmpeg::ffi::AVCodecContext,
            );
            if ret < 0 {
                anyhow::bail!("avcodec_parameters_from_context (video) failed: {ret}");
            }
        }
        Ok(())
    }

    /// Pushes one raw frame (§4.5 invariant: the encoder requires strictly
    /// monotonic frame_index input — assigned here, never by the caller).
    pub fn submit(&mut self, frame: &VideoFrame) -> Result<(), String> {
        if frame.data.len() != VideoFrame::expected_len(frame.width, frame.height) {
            return Err(format!(
                "video frame size mismatch: got {}, expected {}",
                frame.data.len(),
                VideoFrame::expected_len(frame.width, frame.height)
            ));
        }

        let mut ff_frame = FfVideoFrame::new(Pixel::YUV420P, frame.width, frame.height);
        let y_len = (frame.width * frame.height) as usize;
        let uv_len = y_len / 4;

        unsafe {
            copy_plane(ff_frame.data_mut(0), ff_frame.stride(0), &frame.data[..y_len], frame.width as usize, frame.height as usize);
            copy_plane(
                ff_frame.data_mut(1),
                ff_frame.stride(1),
                &frame.data[y_len..y_len + uv_len],
                frame.width as usize / 2,
                frame.height as usize / 2,
            );
            copy_plane(
                ff_frame.data_mut(2),
                ff_frame.stride(2),
                &frame.data[y_len + uv_len..],
                frame.width as usize / 2,
                frame.height as usize / 2,
            );
        }

        ff_frame.set_pts(Some(self.frame_index));
        self.frame_index += 1;

        self.encoder
            .send_frame(&ff_frame)
            .map_err(|e| format!("send video frame to encoder: {e}"))
    }

    /// Pulls all ready packets, invoking registered callbacks for each.
    pub fn drain(&mut self) -> Result<Vec<EncodedPacket>, String> {
        let callbacks = self.callbacks.snapshot();
        let mut out = Vec::new();
        let mut pkt = Packet::empty();
        while self.encoder.receive_packet(&mut pkt).is_ok() {
            let encoded = self.to_encoded_packet(&pkt);
            invoke_all(&callbacks, &encoded);
            out.push(encoded);
        }
        Ok(out)
    }

    /// EOF sentinel + drain to completion (§4.5, must precede trailer write).
    pub fn flush(&mut self) -> Result<Vec<EncodedPacket>, String> {
        // `again`/`eof` here are expected transients, handled by draining —
        // never surfaced (§7.4).
        let _ = self.encoder.send_eof();
        self.drain()
    }

    pub fn reinitialize(&mut self) -> anyhow::Result<()> {
        self.encoder = Self::build(&self.config, self.codec)?;
        self.frame_index = 0;
        Ok(())
    }

    fn to_encoded_packet(&self, pkt: &Packet) -> EncodedPacket {
        EncodedPacket {
            stream_kind: StreamKind::Video,
            pts: pkt.pts().unwrap_or(ffmpeg::ffi::AV_NOPTS_VALUE),
            dts: pkt.dts().unwrap_or_else(|| pkt.pts().unwrap_or(ffmpeg::ffi::AV_NOPTS_VALUE)),
            duration: pkt.duration(),
            timebase: self.timebase,
            is_keyframe: pkt.is_key(),
            data: pkt.data().unwrap_or(&[]).into(),
        }
    }
}

unsafe fn copy_plane(dst: &mut [u8], stride: usize, src: &[u8], width: usize, height: usize) {
    for row in 0..height {
        let s = row * width;
        let d = row * stride;
        dst[d..d + width].copy_from_slice(&src[s..s + width]);
    }
}

#[derive(Debug, Clone)]
pub struct AudioEncoderConfig {
    pub codec_name: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_rate: u32,
}

/// Accumulates interleaved f32 input into per-channel planes until a full
/// codec frame (`frame_size` samples/channel) is available. Generalizes the
/// teacher's stereo-only `AudioFifo` to an arbitrary channel count.
struct AudioFifo {
    channels: usize,
    planes: Vec<Vec<f32>>,
}

impl AudioFifo {
    fn new(channels: usize) -> Self {
        Self { channels, planes: vec![Vec::new(); channels.max(1)] }
    }

    fn len(&self) -> usize {
        self.planes.first().map(|p| p.len()).unwrap_or(0)
    }

    fn push_interleaved(&mut self, samples: &[f32]) {
        let ch = self.channels.max(1);
        for frame in samples.chunks_exact(ch) {
            for (c, &s) in frame.iter().enumerate() {
                self.planes[c].push(s);
            }
        }
    }

    fn pop_frame(&mut self, n: usize, pts: i64, rate: u32, layout: ChannelLayout) -> FfAudioFrame {
        let available = self.len().min(n);
        let mut frame = FfAudioFrame::new(Sample::F32(SampleType::Planar), n, layout);
        frame.set_rate(rate);
        frame.set_pts(Some(pts));

        for c in 0..self.channels.max(1) {
            unsafe {
                let dst_bytes = frame.data_mut(c);
                let dst = std::slice::from_raw_parts_mut(dst_bytes.as_mut_ptr() as *mut f32, n);
                dst[..available].copy_from_slice(&self.planes[c][..available]);
                if available < n {
                    dst[available..].fill(0.0);
                }
            }
            self.planes[c].drain(..available);
        }
        frame
    }
}

pub struct AudioEncoder {
    config: AudioEncoderConfig,
    codec: ffmpeg::codec::codec::Codec,
    encoder: ffmpeg::encoder::audio::Audio,
    frame_size: usize,
    fifo: AudioFifo,
    cumulative_samples: i64,
    callbacks: CallbackList,
    timebase: Timebase,
    layout: ChannelLayout,
}

impl AudioEncoder {
    pub fn open(config: AudioEncoderConfig) -> anyhow::Result<Self> {
        let layout = channel_layout_for(config.channels);
        let codec = codec::encoder::find_by_name(&config.codec_name)
            .or_else(|| codec::encoder::find(CodecId::AAC))
            .ok_or_else(|| anyhow::anyhow!("audio encoder '{}' not found", config.codec_name))?;
        let (encoder, frame_size) = Self::build(&config, codec, layout)?;
        Ok(Self {
            timebase: Timebase { num: 1, den: config.sample_rate.max(1) as i32 },
            fifo: AudioFifo::new(config.channels as usize),
            config,
            codec,
            encoder,
            frame_size,
            cumulative_samples: 0,
            callbacks: CallbackList::default(),
            layout,
        })
    }

    /// The ffmpeg codec this encoder was opened with — see `VideoEncoder::codec`.
    pub fn codec(&self) -> ffmpeg::codec::codec::Codec {
        self.codec
    }

    fn build(
        config: &AudioEncoderConfig,
        codec: ffmpeg::codec::codec::Codec,
        layout: ChannelLayout,
    ) -> anyhow::Result<(ffmpeg::encoder::audio::Audio, usize)> {
        let ctx = codec::context::Context::new_with_codec(codec);
        let mut enc = ctx
            .encoder()
            .audio()
            .map_err(|e| anyhow::anyhow!("create audio encoder context: {e}"))?;

        enc.set_rate(config.sample_rate as i32);
        enc.set_ch_layout(layout);
        enc.set_format(Sample::F32(SampleType::Planar));
        enc.set_bit_rate(config.bit_rate as usize);

        let opened = enc
            .open_as_with(codec, ffmpeg::Dictionary::new())
            .map_err(|e| anyhow::anyhow!("open audio encoder '{}': {e}", config.codec_name))?;

        let frame_size = (opened.frame_size() as usize).max(1024);
        Ok((opened, frame_size))
    }

    pub fn register_callback(&self, cb: PacketCallback) {
        self.callbacks.register(cb);
    }

    pub fn timebase(&self) -> Timebase {
        self.timebase
    }

    pub fn write_parameters_into(
        &self,
        stream: &mut ffmpeg::format::stream::StreamMut,
    ) -> anyhow::Result<()> {
        unsafe {
            let ret = ffmpeg::ffi::avcodec_parameters_from_context(
                (*stream.as_mut_ptr()).codecpar,
                self.encoder.as_ptr() as *mut ffmpeg::ffi::AVCodecContext,
            );
            if ret < 0 {
                anyhow::bail!("avcodec_parameters_from_context (audio) failed: {ret}");
            }
        }
        Ok(())
    }

    /// Pushes one raw packet. `pts = cumulative_samples_encoded` (§4.5, §9);
    /// advances by `samples_per_channel` once full codec frames are sent.
    pub fn submit(&mut self, packet: &AudioPacket) -> Result<Vec<EncodedPacket>, String> {
        self.fifo.push_interleaved(&packet.samples);
        self.drain_full_frames()
    }

    fn drain_full_frames(&mut self) -> Result<Vec<EncodedPacket>, String> {
        let callbacks = self.callbacks.snapshot();
        let mut out = Vec::new();
        while self.fifo.len() >= self.frame_size {
            let frame = self.fifo.pop_frame(
                self.frame_size,
                self.cumulative_samples,
                self.config.sample_rate,
                self.layout,
            );
            self.cumulative_samples += self.frame_size as i64;
            self.encoder
                .send_frame(&frame)
                .map_err(|e| format!("send audio frame to encoder: {e}"))?;
            self.drain_ready_packets(&callbacks, &mut out)?;
        }
        Ok(out)
    }

    fn drain_ready_packets(
        &mut self,
        callbacks: &[PacketCallback],
        out: &mut Vec<EncodedPacket>,
    ) -> Result<(), String> {
        let mut pkt = Packet::empty();
        while self.encoder.receive_packet(&mut pkt).is_ok() {
            let encoded = self.to_encoded_packet(&pkt);
            invoke_all(callbacks, &encoded);
            out.push(encoded);
        }
        Ok(())
    }

    /// Pulls any packets already produced without pushing new input.
    pub fn drain(&mut self) -> Result<Vec<EncodedPacket>, String> {
        let callbacks = self.callbacks.snapshot();
        let mut out = Vec::new();
        self.drain_ready_packets(&callbacks, &mut out)?;
        Ok(out)
    }

    /// Zero-pads and flushes the FIFO tail, then sends EOF and drains (§4.5).
    pub fn flush(&mut self) -> Result<Vec<EncodedPacket>, String> {
        let callbacks = self.callbacks.snapshot();
        let mut out = Vec::new();
        if self.fifo.len() > 0 {
            let n = self.fifo.len();
            let frame = self.fifo.pop_frame(n, self.cumulative_samples, self.config.sample_rate, self.layout);
            self.cumulative_samples += n as i64;
            if self.encoder.send_frame(&frame).is_ok() {
                self.drain_ready_packets(&callbacks, &mut out)?;
            }
        }
        let _ = self.encoder.send_eof();
        self.drain_ready_packets(&callbacks, &mut out)?;
        Ok(out)
    }

    pub fn reinitialize(&mut self) -> anyhow::Result<()> {
        let (encoder, frame_size) = Self::build(&self.config, self.codec, self.layout)?;
        self.encoder = encoder;
        self.frame_size = frame_size;
        self.cumulative_samples = 0;
        self.fifo = AudioFifo::new(self.config.channels as usize);
        Ok(())
    }

    fn to_encoded_packet(&self, pkt: &Packet) -> EncodedPacket {
        EncodedPacket {
            stream_kind: StreamKind::Audio,
            pts: pkt.pts().unwrap_or(ffmpeg::ffi::AV_NOPTS_VALUE),
            dts: pkt.dts().unwrap_or_else(|| pkt.pts().unwrap_or(ffmpeg::ffi::AV_NOPTS_VALUE)),
            duration: pkt.duration(),
            timebase: self.timebase,
            is_keyframe: pkt.is_key(),
            data: pkt.data().unwrap_or(&[]).into(),
        }
    }
}

fn channel_layout_for(channels: u16) -> ChannelLayout {
    match channels {
        1 => ChannelLayout::MONO,
        2 => ChannelLayout::STEREO,
        _ => ChannelLayout::default(channels as i32),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_fifo_accumulates_and_drains() {
        let mut fifo = AudioFifo::new(2);
        fifo.push_interleaved(&[0.1, 0.2, 0.3, 0.4]);
        assert_eq!(fifo.len(), 2);
        let frame = fifo.pop_frame(2, 0, 44_100, ChannelLayout::STEREO);
        assert_eq!(frame.samples(), 2);
        assert_eq!(fifo.len(), 0);
    }

    #[test]
    fn audio_fifo_zero_pads_short_tail() {
        let mut fifo = AudioFifo::new(1);
        fifo.push_interleaved(&[0.5]);
        let frame = fifo.pop_frame(4, 0, 44_100, ChannelLayout::MONO);
        assert_eq!(frame.samples(), 4);
    }

    #[test]
    fn channel_layout_matches_common_cases() {
        assert_eq!(channel_layout_for(1), ChannelLayout::MONO);
        assert_eq!(channel_layout_for(2), ChannelLayout::STEREO);
    }
}
