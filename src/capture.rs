//! Camera frame sources.
//!
//! `CameraSource` hides the device behind one of two backends:
//!
//! - a synthetic source for `stub://` device paths, which generates a
//!   deterministic scene with periodic motion (used by tests and for
//!   running the daemon without hardware),
//! - a V4L2 source for real `/dev/video*` devices (feature `capture-v4l2`).
//!
//! Open failures surface as [`EngineError::Device`]; the owning pipeline
//! marks itself failed rather than taking down sibling cameras.

use chrono::Local;

use crate::error::EngineError;
use crate::frame::Frame;

/// Configuration for a camera source.
#[derive(Clone, Debug)]
pub struct CameraConfig {
    /// Device path (e.g. "/dev/video0") or "stub://<name>".
    pub device: String,
    /// Target frame rate; the capture loop paces itself to this.
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "stub://camera".to_string(),
            target_fps: 10,
            width: 320,
            height: 240,
        }
    }
}

/// Camera frame source.
pub struct CameraSource {
    backend: CameraBackend,
}

enum CameraBackend {
    Synthetic(SyntheticCameraSource),
    #[cfg(feature = "capture-v4l2")]
    V4l2(v4l2::DeviceCameraSource),
}

impl CameraSource {
    pub fn new(config: CameraConfig) -> Result<Self, EngineError> {
        if config.device.starts_with("stub://") {
            Ok(Self {
                backend: CameraBackend::Synthetic(SyntheticCameraSource::new(config)),
            })
        } else {
            #[cfg(feature = "capture-v4l2")]
            {
                Ok(Self {
                    backend: CameraBackend::V4l2(v4l2::DeviceCameraSource::new(config)?),
                })
            }
            #[cfg(not(feature = "capture-v4l2"))]
            {
                Err(EngineError::Device(format!(
                    "device {} requires the capture-v4l2 feature",
                    config.device
                )))
            }
        }
    }

    /// Open and configure the device.
    pub fn connect(&mut self) -> Result<(), EngineError> {
        match &mut self.backend {
            CameraBackend::Synthetic(source) => source.connect(),
            #[cfg(feature = "capture-v4l2")]
            CameraBackend::V4l2(source) => source.connect(),
        }
    }

    /// Capture the next frame, blocking on the device read.
    pub fn next_frame(&mut self) -> Result<Frame, EngineError> {
        match &mut self.backend {
            CameraBackend::Synthetic(source) => source.next_frame(),
            #[cfg(feature = "capture-v4l2")]
            CameraBackend::V4l2(source) => source.next_frame(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        match &self.backend {
            CameraBackend::Synthetic(source) => source.is_healthy(),
            #[cfg(feature = "capture-v4l2")]
            CameraBackend::V4l2(source) => source.is_healthy(),
        }
    }

    pub fn stats(&self) -> CameraStats {
        match &self.backend {
            CameraBackend::Synthetic(source) => source.stats(),
            #[cfg(feature = "capture-v4l2")]
            CameraBackend::V4l2(source) => source.stats(),
        }
    }
}

/// Statistics for a camera source.
#[derive(Clone, Debug)]
pub struct CameraStats {
    pub frames_captured: u64,
    pub device: String,
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests and hardware-free runs
// ----------------------------------------------------------------------------

/// Frames per phase of the synthetic scene: the intruder block appears for
/// one phase, disappears for the next.
const SYNTHETIC_PHASE_FRAMES: u64 = 25;

struct SyntheticCameraSource {
    config: CameraConfig,
    frame_count: u64,
}

impl SyntheticCameraSource {
    fn new(config: CameraConfig) -> Self {
        Self {
            config,
            frame_count: 0,
        }
    }

    fn connect(&mut self) -> Result<(), EngineError> {
        log::info!(
            "CameraSource: connected to {} (synthetic)",
            self.config.device
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame, EngineError> {
        self.frame_count += 1;
        let pixels = self.generate_scene();
        Ok(Frame::new(
            pixels,
            self.config.width,
            self.config.height,
            Local::now(),
        ))
    }

    /// Generate a static dim scene with an "intruder" block that toggles
    /// in and out every [`SYNTHETIC_PHASE_FRAMES`] frames, giving the
    /// motion detector something real to find on phase transitions.
    fn generate_scene(&self) -> Vec<u8> {
        let width = self.config.width;
        let height = self.config.height;
        let mut pixels = vec![0u8; (width * height * 3) as usize];

        for y in 0..height {
            for x in 0..width {
                let idx = ((y * width + x) * 3) as usize;
                // Flat background with a mild horizontal gradient.
                let base = 24 + ((x * 32) / width.max(1)) as u8;
                pixels[idx] = base;
                pixels[idx + 1] = base;
                pixels[idx + 2] = base;
            }
        }

        let intruder_visible = (self.frame_count / SYNTHETIC_PHASE_FRAMES) % 2 == 1;
        if intruder_visible {
            let block = (width.min(height) / 5).max(8);
            let x0 = width / 3;
            let y0 = height / 3;
            for y in y0..(y0 + block).min(height) {
                for x in x0..(x0 + block).min(width) {
                    let idx = ((y * width + x) * 3) as usize;
                    pixels[idx] = 40;
                    pixels[idx + 1] = 40;
                    pixels[idx + 2] = 230;
                }
            }
        }

        pixels
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn stats(&self) -> CameraStats {
        CameraStats {
            frames_captured: self.frame_count,
            device: self.config.device.clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// Production V4L2 source
// ----------------------------------------------------------------------------

#[cfg(feature = "capture-v4l2")]
mod v4l2 {
    use std::time::{Duration, Instant};

    use chrono::Local;
    use ouroboros::self_referencing;

    use super::{CameraConfig, CameraStats};
    use crate::error::EngineError;
    use crate::frame::Frame;

    pub(super) struct DeviceCameraSource {
        config: CameraConfig,
        state: Option<DeviceState>,
        frame_count: u64,
        last_frame_at: Option<Instant>,
        last_error: Option<String>,
        active_width: u32,
        active_height: u32,
    }

    #[self_referencing]
    struct DeviceState {
        device: v4l::Device,
        #[borrows(mut device)]
        #[covariant]
        stream: v4l::prelude::MmapStream<'this, v4l::Device>,
    }

    impl DeviceCameraSource {
        pub(super) fn new(config: CameraConfig) -> Result<Self, EngineError> {
            Ok(Self {
                active_width: config.width,
                active_height: config.height,
                config,
                state: None,
                frame_count: 0,
                last_frame_at: None,
                last_error: None,
            })
        }

        pub(super) fn connect(&mut self) -> Result<(), EngineError> {
            use v4l::buffer::Type;
            use v4l::video::Capture;

            let mut device = v4l::Device::with_path(&self.config.device).map_err(|e| {
                EngineError::Device(format!("open v4l2 device {}: {}", self.config.device, e))
            })?;

            let mut format = device
                .format()
                .map_err(|e| EngineError::Device(format!("read v4l2 format: {}", e)))?;
            format.width = self.config.width;
            format.height = self.config.height;
            format.fourcc = v4l::FourCC::new(b"BGR3");

            let format = match device.set_format(&format) {
                Ok(format) => format,
                Err(err) => {
                    log::warn!(
                        "CameraSource: failed to set format on {}: {}",
                        self.config.device,
                        err
                    );
                    device
                        .format()
                        .map_err(|e| EngineError::Device(format!("read v4l2 format: {}", e)))?
                }
            };

            if self.config.target_fps > 0 {
                let params = v4l::video::capture::Parameters::with_fps(self.config.target_fps);
                if let Err(err) = device.set_params(&params) {
                    log::warn!(
                        "CameraSource: failed to set fps on {}: {}",
                        self.config.device,
                        err
                    );
                }
            }

            self.active_width = format.width;
            self.active_height = format.height;
            self.last_error = None;

            let state = DeviceStateBuilder {
                device,
                stream_builder: |device| {
                    v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4).map_err(
                        |err| EngineError::Device(format!("create v4l2 buffer stream: {}", err)),
                    )
                },
            }
            .try_build()?;
            self.state = Some(state);

            log::info!(
                "CameraSource: connected to {} ({}x{})",
                self.config.device,
                self.active_width,
                self.active_height
            );
            Ok(())
        }

        pub(super) fn next_frame(&mut self) -> Result<Frame, EngineError> {
            use v4l::io::traits::CaptureStream;

            let state = self
                .state
                .as_mut()
                .ok_or_else(|| EngineError::Device("v4l2 device not connected".to_string()))?;
            let data = match state.with_mut(|fields| fields.stream.next()) {
                Ok((buf, _meta)) => buf.to_vec(),
                Err(err) => {
                    self.last_error = Some(err.to_string());
                    return Err(EngineError::Device(format!("capture v4l2 frame: {}", err)));
                }
            };

            self.frame_count += 1;
            self.last_frame_at = Some(Instant::now());

            Ok(Frame::new(
                data,
                self.active_width,
                self.active_height,
                Local::now(),
            ))
        }

        pub(super) fn is_healthy(&self) -> bool {
            if self.last_error.is_some() {
                return false;
            }
            let Some(last_frame_at) = self.last_frame_at else {
                return true;
            };
            last_frame_at.elapsed() <= self.health_grace()
        }

        pub(super) fn stats(&self) -> CameraStats {
            CameraStats {
                frames_captured: self.frame_count,
                device: self.config.device.clone(),
            }
        }

        fn health_grace(&self) -> Duration {
            let base_ms = if self.config.target_fps == 0 {
                2_000
            } else {
                (1000 / self.config.target_fps).saturating_mul(6)
            };
            Duration::from_millis(base_ms.max(2_000) as u64)
        }
    }
}
