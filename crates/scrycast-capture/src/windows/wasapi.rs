// crates/scrycast-capture/src/windows/wasapi.rs
//
// WASAPI loopback audio capture: initialize_mta + DeviceEnumerator +
// get_default_device on the Render endpoint, then open it for Capture
// (loopback), event-driven via set_get_eventhandle/wait_for_event rather
// than polling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{error, info, warn};
use wasapi::{
    initialize_mta, AudioCaptureClient, AudioClient, Direction, DeviceEnumerator, SampleType,
    StreamMode, WaveFormat,
};

use scrycast_core::{AudioPacket, Clock};

use crate::convert::{convert_to_f32, SampleFormat};
use crate::source::{
    AudioCallback, AudioSource, AudioSourceConfig, CaptureError, MAX_REINIT_ATTEMPTS,
};

const EVENT_TIMEOUT_MS: u32 = 100;
const DRAIN_TIMEOUT_MS: u32 = 10;

struct WasapiState {
    audio_client: AudioClient,
    capture_client: AudioCaptureClient,
    block_align: u32,
    channels: u16,
    sample_rate: u32,
}

pub struct WasapiAudioSource {
    config: AudioSourceConfig,
    state: Option<WasapiState>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    native_channels: u16,
    native_sample_rate: u32,
}

impl WasapiAudioSource {
    fn open_device(config: &AudioSourceConfig) -> anyhow::Result<WasapiState> {
        initialize_mta()
            .ok()
            .map_err(|e| anyhow::anyhow!("COM initialization failed: {e:?}"))?;

        let enumerator = DeviceEnumerator::new()
            .map_err(|e| anyhow::anyhow!("device enumerator: {e:?}"))?;
        let device = enumerator
            .get_default_device(&Direction::Render)
            .map_err(|e| anyhow::anyhow!("no default render device: {e:?}"))?;

        let device_name = device.get_friendlyname().unwrap_or_else(|_| "unknown".into());
        info!(device = %device_name, "wasapi loopback endpoint");

        let mut audio_client = device
            .get_iaudioclient()
            .map_err(|e| anyhow::anyhow!("get IAudioClient: {e:?}"))?;

        let desired_format = WaveFormat::new(
            32,
            32,
            &SampleType::Float,
            config.sample_rate as usize,
            config.channels as usize,
            None,
        );
        let block_align = desired_format.get_blockalign();
        let channels = desired_format.get_nchannels();
        let sample_rate = desired_format.get_samplespersec();

        let (_default_period, min_period) = audio_client
            .get_device_period()
            .map_err(|e| anyhow::anyhow!("get device period: {e:?}"))?;

        let mode = StreamMode::EventsShared { autoconvert: true, buffer_duration_hns: min_period };

        // Opening a RENDER device for CAPTURE is what makes this loopback.
        audio_client
            .initialize_client(&desired_format, &Direction::Capture, &mode)
            .map_err(|e| anyhow::anyhow!("initialize loopback client: {e:?}"))?;

        let capture_client = audio_client
            .get_audiocaptureclient()
            .map_err(|e| anyhow::anyhow!("get capture client: {e:?}"))?;

        Ok(WasapiState { audio_client, capture_client, block_align, channels, sample_rate })
    }
}

impl AudioSource for WasapiAudioSource {
    fn new(config: AudioSourceConfig) -> anyhow::Result<Self> {
        let state = Self::open_device(&config)
            .map_err(|e| anyhow::anyhow!(CaptureError::DeviceInit(e.to_string())))?;
        let native_channels = state.channels;
        let native_sample_rate = state.sample_rate;
        Ok(Self {
            config,
            state: Some(state),
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
            native_channels,
            native_sample_rate,
        })
    }

    fn start(&mut self, clock: Arc<Clock>, callback: AudioCallback) -> anyhow::Result<()> {
        let mut state = self
            .state
            .take()
            .ok_or_else(|| anyhow::anyhow!("WasapiAudioSource::start called without an initialized device"))?;

        state
            .audio_client
            .start_stream()
            .map_err(|e| anyhow::anyhow!("start wasapi stream: {e:?}"))?;

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let config = self.config.clone();

        let handle = std::thread::spawn(move || {
            let event_handle = match state.audio_client.set_get_eventhandle() {
                Ok(h) => h,
                Err(e) => {
                    error!("wasapi event handle: {e:?}");
                    callback(Err(CaptureError::DeviceInit(e.to_string())));
                    return;
                }
            };

            let mut raw = std::collections::VecDeque::<u8>::with_capacity(
                state.block_align as usize * state.sample_rate as usize,
            );
            let mut cumulative_samples: i64 = 0;
            let mut reinit_failures = 0u32;

            while running.load(Ordering::SeqCst) {
                if event_handle.wait_for_event(EVENT_TIMEOUT_MS).is_err() {
                    continue;
                }

                match state.capture_client.read_from_device_to_deque(&mut raw) {
                    Ok(_) => {
                        reinit_failures = 0;
                        if raw.len() < state.block_align as usize {
                            continue;
                        }
                        // WASAPI is opened with a forced 32-bit-float
                        // `WaveFormat` and `autoconvert: true` (§4.3 "native
                        // mix format"), so the decode path is always
                        // IeeeFloat — routed through the same
                        // format-dispatching converter the PCM16/PCM32
                        // paths use, rather than a parallel ad-hoc decode.
                        let raw_bytes: Vec<u8> = raw.drain(..).collect();
                        let sample_count = raw_bytes.len() / 4;
                        let samples = convert_to_f32(&raw_bytes, SampleFormat::IeeeFloat, false, sample_count);

                        let channels = state.channels as usize;
                        let samples_per_channel = samples.len() / channels.max(1);
                        let is_silent = samples.iter().all(|&s| s == 0.0);

                        // §4.1: sample-count-driven ideal PTS, re-anchored to
                        // wall clock if it has drifted past the lip-sync
                        // tolerance (device jitter / underrun recovery).
                        let timestamp_us = clock.synced_audio_pts(cumulative_samples, state.sample_rate);
                        clock.update_last_audio_pts(timestamp_us);

                        let packet = AudioPacket {
                            cumulative_samples,
                            samples_per_channel,
                            channels: state.channels,
                            sample_rate: state.sample_rate,
                            timestamp_us,
                            is_silent,
                            samples,
                        };
                        cumulative_samples += samples_per_channel as i64;
                        callback(Ok(packet));
                    }
                    Err(e) => {
                        warn!("wasapi read failed: {e:?}, reinitializing");
                        reinit_failures += 1;
                        match WasapiAudioSource::open_device(&config) {
                            Ok(new_state) => {
                                let _ = new_state.audio_client.start_stream();
                                state = new_state;
                                callback(Err(CaptureError::DeviceLostRecovered));
                                reinit_failures = 0;
                            }
                            Err(init_err) => {
                                error!("wasapi reinit failed ({reinit_failures}/{MAX_REINIT_ATTEMPTS}): {init_err}");
                                if reinit_failures >= MAX_REINIT_ATTEMPTS {
                                    callback(Err(CaptureError::DeviceLostPermanent));
                                    break;
                                }
                                std::thread::sleep(Duration::from_millis(DRAIN_TIMEOUT_MS as u64));
                            }
                        }
                    }
                }
            }

            let _ = state.audio_client.stop_stream();
            info!("wasapi capture thread exiting");
        });

        self.handle = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    fn reinitialize(&mut self) -> anyhow::Result<()> {
        self.stop();
        let state = Self::open_device(&self.config)?;
        self.native_channels = state.channels;
        self.native_sample_rate = state.sample_rate;
        self.state = Some(state);
        Ok(())
    }

    fn native_format(&self) -> (u32, u16) {
        (self.native_sample_rate, self.native_channels)
    }
}

impl Drop for WasapiAudioSource {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ieee_float_decode_matches_negotiated_wasapi_format() {
        // WASAPI always negotiates 32-bit float (see `open_device`), so the
        // capture loop always decodes via `SampleFormat::IeeeFloat`.
        let raw = 0.5f32.to_le_bytes();
        let samples = convert_to_f32(&raw, SampleFormat::IeeeFloat, false, 1);
        assert_eq!(samples.len(), 1);
        assert!((samples[0] - 0.5).abs() < 0.0001);
    }
}
