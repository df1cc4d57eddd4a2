//! Full-desktop grab through DXGI Desktop Duplication.
//!
//! This is the preferred capture path: the compositor hands over a GPU
//! texture of the whole monitor, which is copied into a CPU-readable
//! staging texture once per tick.
//!
//! Duplication only yields a frame when the desktop changes; an idle
//! tick surfaces as `Timeout`. Losing the duplication (secure desktop,
//! display mode change) re-creates it on the next tick.
//!
//! On platforms other than Windows the type exists but [`DxgiCapturer::open`]
//! always fails, which routes capture selection to the fallback device.

use crate::capture::FrameGrabber;
use crate::error::CastError;
use crate::types::RawScreenFrame;

/// DXGI-based desktop capturer.
///
/// Each call to [`grab`](FrameGrabber::grab) runs
/// `AcquireNextFrame`, copies the desktop texture to the staging
/// texture, maps it and copies the rows into a `Vec<u8>`.
///
/// COM handles are not `Send`; the capturer must be opened on the
/// thread that uses it.
#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
pub struct DxgiCapturer {
    width: u32,
    height: u32,
    monitor_index: u32,
    /// How long `AcquireNextFrame` may block.
    timeout_ms: u32,
    /// Set while the duplication is lost and not yet re-created.
    lost: bool,

    #[cfg(target_os = "windows")]
    context: windows::Win32::Graphics::Direct3D11::ID3D11DeviceContext,
    #[cfg(target_os = "windows")]
    duplication: windows::Win32::Graphics::Dxgi::IDXGIOutputDuplication,
    #[cfg(target_os = "windows")]
    staging_texture: windows::Win32::Graphics::Direct3D11::ID3D11Texture2D,
}

impl FrameGrabber for DxgiCapturer {
    fn name(&self) -> &'static str {
        "dxgi-desktop-duplication"
    }

    fn grab(&mut self) -> Result<RawScreenFrame, CastError> {
        self.capture_frame()
    }
}

// ── Windows implementation ───────────────────────────────────────

#[cfg(target_os = "windows")]
mod platform {
    use std::time::Duration;

    use tracing::{debug, info, warn};

    use super::*;
    use crate::types::PixelFormat;
    use windows::{
        core::Interface,
        Win32::Graphics::{
            Direct3D::D3D_DRIVER_TYPE_HARDWARE,
            Direct3D11::*,
            Dxgi::{Common::*, *},
        },
    };

    impl DxgiCapturer {
        /// Duplicate monitor `monitor_index` (0 = primary).
        pub fn open(monitor_index: u32, timeout_ms: u32) -> Result<Self, CastError> {
            unsafe { Self::init_dxgi(monitor_index, timeout_ms) }
        }

        unsafe fn init_dxgi(monitor_index: u32, timeout_ms: u32) -> Result<Self, CastError> {
            let unavailable = |what: &str, e: windows::core::Error| {
                CastError::CaptureUnavailable(format!("{what} failed: {e}"))
            };

            let mut device = None;
            let mut context = None;
            unsafe {
                D3D11CreateDevice(
                    None,
                    D3D_DRIVER_TYPE_HARDWARE,
                    None,
                    D3D11_CREATE_DEVICE_BGRA_SUPPORT,
                    None,
                    D3D11_SDK_VERSION,
                    Some(&mut device),
                    None,
                    Some(&mut context),
                )
                .map_err(|e| unavailable("D3D11CreateDevice", e))?;
            }

            let device: ID3D11Device = device
                .ok_or_else(|| CastError::CaptureUnavailable("D3D11 device is None".into()))?;
            let context = context
                .ok_or_else(|| CastError::CaptureUnavailable("D3D11 context is None".into()))?;

            // Device → Adapter → Output.
            let dxgi_device: IDXGIDevice =
                device.cast().map_err(|e| unavailable("cast to IDXGIDevice", e))?;
            let adapter = unsafe { dxgi_device.GetAdapter() }
                .map_err(|e| unavailable("GetAdapter", e))?;
            let output: IDXGIOutput = unsafe { adapter.EnumOutputs(monitor_index) }
                .map_err(|e| unavailable("EnumOutputs", e))?;

            let output1: IDXGIOutput1 =
                output.cast().map_err(|e| unavailable("cast to IDXGIOutput1", e))?;
            let duplication = unsafe { output1.DuplicateOutput(&device) }
                .map_err(|e| unavailable("DuplicateOutput", e))?;

            let dup_desc = unsafe { duplication.GetDesc() };
            let width = dup_desc.ModeDesc.Width;
            let height = dup_desc.ModeDesc.Height;

            let staging_desc = D3D11_TEXTURE2D_DESC {
                Width: width,
                Height: height,
                MipLevels: 1,
                ArraySize: 1,
                Format: DXGI_FORMAT_B8G8R8A8_UNORM,
                SampleDesc: DXGI_SAMPLE_DESC {
                    Count: 1,
                    Quality: 0,
                },
                Usage: D3D11_USAGE_STAGING,
                BindFlags: 0,
                CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
                MiscFlags: 0,
            };

            let mut staging_texture = None;
            unsafe {
                device
                    .CreateTexture2D(&staging_desc, None, Some(&mut staging_texture))
                    .map_err(|e| unavailable("CreateTexture2D", e))?;
            }
            let staging_texture = staging_texture
                .ok_or_else(|| CastError::CaptureUnavailable("staging texture is None".into()))?;

            Ok(Self {
                width,
                height,
                monitor_index,
                timeout_ms,
                lost: false,
                context,
                duplication,
                staging_texture,
            })
        }

        pub(super) fn capture_frame(&mut self) -> Result<RawScreenFrame, CastError> {
            unsafe { self.capture_inner() }
        }

        unsafe fn capture_inner(&mut self) -> Result<RawScreenFrame, CastError> {
            let mut frame_info = DXGI_OUTDUPL_FRAME_INFO::default();
            let mut resource = None;

            match unsafe {
                self.duplication
                    .AcquireNextFrame(self.timeout_ms, &mut frame_info, &mut resource)
            } {
                Ok(()) => {}
                Err(e) if e.code() == DXGI_ERROR_WAIT_TIMEOUT => {
                    return Err(CastError::Timeout(Duration::from_millis(
                        self.timeout_ms as u64,
                    )));
                }
                Err(e) if e.code() == DXGI_ERROR_ACCESS_LOST => {
                    return Err(self.reduplicate(&e));
                }
                Err(e) => {
                    return Err(CastError::Capture(format!("AcquireNextFrame failed: {e}")));
                }
            }

            let resource =
                resource.ok_or_else(|| CastError::Capture("acquired resource is None".into()))?;

            let texture: ID3D11Texture2D = resource.cast().map_err(|e| {
                let _ = unsafe { self.duplication.ReleaseFrame() };
                CastError::Capture(format!("cast to ID3D11Texture2D failed: {e}"))
            })?;

            unsafe { self.context.CopyResource(&self.staging_texture, &texture) };

            // Hand the frame back to the compositor before the CPU copy.
            let _ = unsafe { self.duplication.ReleaseFrame() };

            let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
            unsafe {
                self.context
                    .Map(&self.staging_texture, 0, D3D11_MAP_READ, 0, Some(&mut mapped))
                    .map_err(|e| CastError::Capture(format!("Map failed: {e}")))?;
            }

            let stride = mapped.RowPitch;
            let total_bytes = stride as usize * self.height as usize;
            let src =
                unsafe { std::slice::from_raw_parts(mapped.pData as *const u8, total_bytes) };
            let data = src.to_vec();

            unsafe { self.context.Unmap(&self.staging_texture, 0) };

            Ok(RawScreenFrame {
                width: self.width,
                height: self.height,
                stride,
                format: PixelFormat::Bgra8,
                data,
            })
        }

        /// Replace a lost duplication with a fresh one on the same monitor.
        ///
        /// Returns the error to report for this tick; the next tick
        /// acquires from the new duplication, or retries if this failed.
        fn reduplicate(&mut self, cause: &windows::core::Error) -> CastError {
            if !self.lost {
                warn!("desktop duplication lost ({cause}); re-creating");
            }
            match unsafe { Self::init_dxgi(self.monitor_index, self.timeout_ms) } {
                Ok(fresh) => {
                    info!("desktop duplication re-created ({}x{})", fresh.width, fresh.height);
                    *self = fresh;
                    CastError::Timeout(Duration::from_millis(self.timeout_ms as u64))
                }
                Err(e) => {
                    debug!("re-creating desktop duplication failed: {e}");
                    self.lost = true;
                    CastError::Capture(format!("desktop duplication lost: {e}"))
                }
            }
        }
    }
}

// ── Non-Windows stub ─────────────────────────────────────────────

#[cfg(not(target_os = "windows"))]
impl DxgiCapturer {
    /// DXGI is only available on Windows.
    pub fn open(_monitor_index: u32, _timeout_ms: u32) -> Result<Self, CastError> {
        Err(CastError::CaptureUnavailable(
            "DXGI Desktop Duplication is only available on Windows".into(),
        ))
    }

    fn capture_frame(&mut self) -> Result<RawScreenFrame, CastError> {
        Err(CastError::Capture("not supported on this platform".into()))
    }
}

#[cfg(all(test, not(target_os = "windows")))]
mod tests {
    use super::*;

    #[test]
    fn open_fails_off_windows() {
        let err = DxgiCapturer::open(0, 100).err().unwrap();
        assert!(matches!(err, CastError::CaptureUnavailable(_)));
    }
}
