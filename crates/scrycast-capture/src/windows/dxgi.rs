// crates/scrycast-capture/src/windows/dxgi.rs
//
// DXGI desktop duplication capture backend. Grounded on the reference
// implementation's capture loop: 100ms AcquireNextFrame timeout, device-loss
// detection and in-place reinit, region validation before any conversion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};
use windows::Win32::Foundation::{HANDLE, HWND};
use windows::Win32::Graphics::Direct3D::D3D_DRIVER_TYPE_HARDWARE;
use windows::Win32::Graphics::Direct3D11::{
    D3D11CreateDevice, ID3D11Device, ID3D11DeviceContext, ID3D11Texture2D,
    D3D11_CPU_ACCESS_READ, D3D11_CREATE_DEVICE_BGRA_SUPPORT, D3D11_MAP_READ,
    D3D11_SDK_VERSION, D3D11_TEXTURE2D_DESC, D3D11_USAGE_STAGING,
};
use windows::Win32::Graphics::Dxgi::Common::DXGI_FORMAT_B8G8R8A8_UNORM;
use windows::Win32::Graphics::Dxgi::{
    IDXGIAdapter, IDXGIDevice, IDXGIOutput1, IDXGIOutputDuplication, IDXGIResource, DXGI_ERROR_ACCESS_LOST,
    DXGI_ERROR_DEVICE_REMOVED, DXGI_ERROR_DEVICE_RESET, DXGI_ERROR_WAIT_TIMEOUT,
    DXGI_OUTDUPL_FRAME_INFO,
};

use scrycast_core::{CaptureQuality, Clock};

use crate::convert::bgra_region_to_yuv420p;
use crate::source::{CaptureError, FrameCallback, FrameSource, FrameSourceConfig, MAX_REINIT_ATTEMPTS};

const ACQUIRE_TIMEOUT_MS: u32 = 100;

struct DuplicationState {
    device: ID3D11Device,
    context: ID3D11DeviceContext,
    duplication: IDXGIOutputDuplication,
    source_width: u32,
    source_height: u32,
}

pub struct DxgiFrameSource {
    config: FrameSourceConfig,
    state: Option<DuplicationState>,
    source_width: u32,
    source_height: u32,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DxgiFrameSource {
    fn init_duplication() -> anyhow::Result<DuplicationState> {
        unsafe {
            let mut device: Option<ID3D11Device> = None;
            let mut context: Option<ID3D11DeviceContext> = None;
            D3D11CreateDevice(
                None,
                D3D_DRIVER_TYPE_HARDWARE,
                HWND::default(),
                D3D11_CREATE_DEVICE_BGRA_SUPPORT,
                None,
                D3D11_SDK_VERSION,
                Some(&mut device),
                None,
                Some(&mut context),
            )
            .map_err(|e| anyhow::anyhow!("D3D11CreateDevice failed: {e}"))?;

            let device = device.ok_or_else(|| anyhow::anyhow!("D3D11CreateDevice returned no device"))?;
            let context = context.ok_or_else(|| anyhow::anyhow!("D3D11CreateDevice returned no context"))?;

            let dxgi_device: IDXGIDevice = device.cast()?;
            let adapter: IDXGIAdapter = dxgi_device.GetAdapter()?;
            let output = adapter.EnumOutputs(0)?;
            let output1: IDXGIOutput1 = output.cast()?;
            let duplication = output1.DuplicateOutput(&device)?;

            let mut desc = Default::default();
            duplication.GetDesc(&mut desc);

            Ok(DuplicationState {
                device,
                context,
                duplication,
                source_width: desc.ModeDesc.Width,
                source_height: desc.ModeDesc.Height,
            })
        }
    }

    /// One capture tick: acquire a frame (bounded by [`ACQUIRE_TIMEOUT_MS`]),
    /// map it to CPU, crop/convert, and hand the result to `callback`.
    /// Returns `Ok(true)` if a frame was produced, `Ok(false)` on a harmless
    /// timeout, `Err` on device loss.
    fn capture_tick(
        state: &DuplicationState,
        config: &FrameSourceConfig,
        frame_index: &mut i64,
        clock: &Clock,
        callback: &FrameCallback,
    ) -> windows::core::Result<bool> {
        let mut frame_info = DXGI_OUTDUPL_FRAME_INFO::default();
        let mut resource: Option<IDXGIResource> = None;

        let acquire = unsafe {
            state
                .duplication
                .AcquireNextFrame(ACQUIRE_TIMEOUT_MS, &mut frame_info, &mut resource)
        };

        match acquire {
            Err(e) if e.code() == DXGI_ERROR_WAIT_TIMEOUT => return Ok(false),
            Err(e) => return Err(e),
            Ok(()) => {}
        }

        let resource = resource.expect("AcquireNextFrame succeeded without a resource");
        let result = Self::process_frame(state, config, &resource, frame_index, clock, callback);
        unsafe {
            let _ = state.duplication.ReleaseFrame();
        }
        result.map(|_| true)
    }

    fn process_frame(
        state: &DuplicationState,
        config: &FrameSourceConfig,
        resource: &IDXGIResource,
        frame_index: &mut i64,
        clock: &Clock,
        callback: &FrameCallback,
    ) -> windows::core::Result<()> {
        unsafe {
            let acquired: ID3D11Texture2D = resource.cast()?;
            let mut desc = D3D11_TEXTURE2D_DESC::default();
            acquired.GetDesc(&mut desc);

            let mut staging_desc = desc;
            staging_desc.Usage = D3D11_USAGE_STAGING;
            staging_desc.BindFlags = 0;
            staging_desc.CPUAccessFlags = D3D11_CPU_ACCESS_READ.0 as u32;
            staging_desc.MiscFlags = 0;
            staging_desc.Format = DXGI_FORMAT_B8G8R8A8_UNORM;

            let mut staging: Option<ID3D11Texture2D> = None;
            state.device.CreateTexture2D(&staging_desc, None, Some(&mut staging))?;
            let staging = staging.expect("CreateTexture2D succeeded without a texture");

            state.context.CopyResource(&staging, &acquired);

            let mapped = state.context.Map(&staging, 0, D3D11_MAP_READ, 0)?;
            let src_stride = mapped.RowPitch as usize;
            let src_len = src_stride * desc.Height as usize;
            let src = std::slice::from_raw_parts(mapped.pData as *const u8, src_len);

            let crop = match &config.region {
                Some(region) => {
                    if let Err(e) = region.validate(state.source_width, state.source_height) {
                        state.context.Unmap(&staging, 0);
                        error!("capture region invalid: {e}");
                        return Err(windows::core::Error::from(
                            windows::Win32::Foundation::E_INVALIDARG,
                        ));
                    }
                    let (left, top, right, bottom) = region.padded_bounds(state.source_width, state.source_height);
                    (left, top, right, bottom)
                }
                None => (0, 0, desc.Width as i32, desc.Height as i32),
            };

            // `out_w`/`out_h` are the dims the converter actually filled the
            // buffer at (§8 invariant `data.len() == w*h*3/2`) — stamped on
            // the frame as-is rather than recomputed independently, so they
            // can never diverge from the buffer `bgra_region_to_yuv420p`
            // produced.
            let (yuv, out_w, out_h) = bgra_region_to_yuv420p(
                src,
                src_stride,
                crop,
                config.target_width,
                config.target_height,
                config.maintain_aspect_ratio,
                config.quality,
            );

            state.context.Unmap(&staging, 0);

            // §4.1: frame-index-driven ideal PTS, clamped to never regress
            // behind the last value handed out by this clock.
            let timestamp_us = clock.synced_video_pts(*frame_index, config.frame_rate);
            clock.update_last_video_pts(timestamp_us);

            let frame = scrycast_core::VideoFrame {
                frame_index: *frame_index,
                width: out_w,
                height: out_h,
                timestamp_us,
                data: yuv,
            };
            *frame_index += 1;
            callback(Ok(frame));
        }
        Ok(())
    }
}

impl FrameSource for DxgiFrameSource {
    fn new(config: FrameSourceConfig) -> anyhow::Result<Self> {
        let state = Self::init_duplication()
            .map_err(|e| anyhow::anyhow!(CaptureError::DeviceInit(e.to_string())))?;
        Ok(Self {
            source_width: state.source_width,
            source_height: state.source_height,
            config,
            state: Some(state),
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        })
    }

    fn start(&mut self, clock: Arc<Clock>, callback: FrameCallback) -> anyhow::Result<()> {
        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let config = self.config.clone();
        let mut state = self
            .state
            .take()
            .ok_or_else(|| anyhow::anyhow!("DxgiFrameSource::start called without an initialized device"))?;

        let handle = std::thread::spawn(move || {
            let tick = Duration::from_secs_f64(1.0 / config.frame_rate.max(1) as f64);
            let mut frame_index: i64 = 0;
            let mut reinit_failures = 0u32;

            while running.load(Ordering::SeqCst) {
                let loop_start = Instant::now();

                match Self::capture_tick(&state, &config, &mut frame_index, &clock, &callback) {
                    Ok(_) => reinit_failures = 0,
                    Err(e)
                        if e.code() == DXGI_ERROR_DEVICE_REMOVED
                            || e.code() == DXGI_ERROR_DEVICE_RESET
                            || e.code() == DXGI_ERROR_ACCESS_LOST =>
                    {
                        warn!("dxgi device lost ({e}), reinitializing");
                        match DxgiFrameSource::init_duplication() {
                            Ok(new_state) => {
                                state = new_state;
                                callback(Err(CaptureError::DeviceLostRecovered));
                                reinit_failures = 0;
                            }
                            Err(init_err) => {
                                reinit_failures += 1;
                                error!("dxgi reinit failed ({reinit_failures}/{MAX_REINIT_ATTEMPTS}): {init_err}");
                                if reinit_failures >= MAX_REINIT_ATTEMPTS {
                                    callback(Err(CaptureError::DeviceLostPermanent));
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("dxgi capture error: {e}");
                    }
                }

                let elapsed = loop_start.elapsed();
                if elapsed < tick {
                    std::thread::sleep(tick - elapsed);
                }
            }
            info!("dxgi capture thread exiting");
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

    fn source_dimensions(&self) -> (u32, u32) {
        (self.source_width, self.source_height)
    }
}

impl Drop for DxgiFrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}
