//! Audio capture with volume-threshold events.
//!
//! `AudioSource` selects a capture device by probing candidates (preferred
//! name first, then the system default, then none at all) and runs a
//! capture loop that reads fixed-size chunks, computes their mean absolute
//! amplitude, and invokes registered listeners whenever the amplitude
//! clears the configured threshold. The pipeline uses those callbacks as a
//! volume-triggered snapshot path, independent of motion detection.
//!
//! Device failure always degrades to "no audio" - it never stops the
//! owning pipeline from starting. `stub://` device names select a
//! synthetic backend that replays a scripted amplitude sequence; real
//! input devices need the `audio-cpal` feature.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Callback invoked with the chunk amplitude (in i16 sample units).
pub type VolumeListener = Box<dyn Fn(f32) + Send + 'static>;

/// Configuration for an audio source.
#[derive(Clone, Debug)]
pub struct AudioConfig {
    /// Preferred device name, or "stub://<name>" for the synthetic
    /// backend. `None` asks for the system default.
    pub device: Option<String>,
    pub sample_rate: u32,
    pub chunk_frames: usize,
    /// Mean-absolute-amplitude cutoff for listener events.
    pub threshold: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: 44_100,
            chunk_frames: 512,
            threshold: 1000.0,
        }
    }
}

impl From<&crate::config::AudioSettings> for AudioConfig {
    fn from(settings: &crate::config::AudioSettings) -> Self {
        Self {
            device: settings.device.clone(),
            sample_rate: settings.sample_rate,
            chunk_frames: settings.chunk_frames,
            threshold: settings.threshold,
        }
    }
}

enum SelectedDevice {
    Synthetic { name: String, script: Vec<f32> },
    #[cfg(feature = "audio-cpal")]
    Input { name: String },
    None,
}

/// Audio input with amplitude-threshold listeners.
pub struct AudioSource {
    config: AudioConfig,
    device: SelectedDevice,
    listeners: Arc<Mutex<Vec<VolumeListener>>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AudioSource {
    /// Select a device and prepare the source. Never fails: when nothing
    /// usable is found the source opens disabled.
    pub fn open(config: AudioConfig) -> Self {
        let device = select_device(&config);
        match &device {
            SelectedDevice::Synthetic { name, .. } => {
                log::info!("audio source initialized with device: {} (synthetic)", name)
            }
            #[cfg(feature = "audio-cpal")]
            SelectedDevice::Input { name } => {
                log::info!("audio source initialized with device: {}", name)
            }
            SelectedDevice::None => log::warn!("no usable audio input, audio disabled"),
        }

        Self {
            config,
            device,
            listeners: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Replace the synthetic amplitude script (ignored for real devices).
    pub fn with_script(mut self, amplitudes: Vec<f32>) -> Self {
        if let SelectedDevice::Synthetic { script, .. } = &mut self.device {
            *script = amplitudes;
        }
        self
    }

    /// The active device name, if any.
    pub fn device_name(&self) -> Option<&str> {
        match &self.device {
            SelectedDevice::Synthetic { name, .. } => Some(name),
            #[cfg(feature = "audio-cpal")]
            SelectedDevice::Input { name } => Some(name),
            SelectedDevice::None => None,
        }
    }

    /// Device identifier to hand to the clip encoder, or `None` when the
    /// clip should be video-only (disabled or synthetic audio).
    pub fn encoder_device(&self) -> Option<&str> {
        match &self.device {
            #[cfg(feature = "audio-cpal")]
            SelectedDevice::Input { name } => Some(name),
            _ => None,
        }
    }

    /// Register a listener. Listeners run on the capture thread.
    pub fn add_listener(&self, listener: VolumeListener) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(listener);
        }
    }

    /// Spawn the capture loop. A no-op when no device is available or the
    /// loop is already running.
    pub fn start(&mut self) {
        if self.handle.is_some() || self.running.load(Ordering::SeqCst) {
            return;
        }
        if matches!(self.device, SelectedDevice::None) {
            log::info!("no audio input initialized, skipping audio capture");
            return;
        }

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let listeners = self.listeners.clone();
        let threshold = self.config.threshold;
        // One scripted amplitude stands in for one captured chunk.
        let chunk_pause = Duration::from_millis(
            (self.config.chunk_frames as u64 * 1000 / self.config.sample_rate.max(1) as u64).max(1),
        );

        match &self.device {
            SelectedDevice::Synthetic { script, .. } => {
                let script = script.clone();
                self.handle = Some(thread::spawn(move || {
                    for amplitude in script {
                        if !running.load(Ordering::SeqCst) {
                            break;
                        }
                        if amplitude >= threshold {
                            fire(&listeners, amplitude);
                        }
                        thread::sleep(chunk_pause);
                    }
                    running.store(false, Ordering::SeqCst);
                }));
            }
            #[cfg(feature = "audio-cpal")]
            SelectedDevice::Input { name } => {
                let name = name.clone();
                self.handle = Some(thread::spawn(move || {
                    if let Err(e) = cpal_capture::run(&name, threshold, &running, &listeners) {
                        log::error!("audio capture stopped: {}", e);
                    }
                    running.store(false, Ordering::SeqCst);
                }));
            }
            SelectedDevice::None => unreachable!("checked above"),
        }
    }

    /// Signal the capture loop to stop and join it - unless called from
    /// the capture thread itself, which would self-join and deadlock.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if thread::current().id() == handle.thread().id() {
                log::warn!("audio stop requested from the capture thread, not joining");
                return;
            }
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

fn fire(listeners: &Arc<Mutex<Vec<VolumeListener>>>, amplitude: f32) {
    log::debug!("audio event triggered, volume {:.0}", amplitude);
    if let Ok(listeners) = listeners.lock() {
        for listener in listeners.iter() {
            listener(amplitude);
        }
    }
}

fn select_device(config: &AudioConfig) -> SelectedDevice {
    if let Some(name) = &config.device {
        if name.starts_with("stub://") {
            return SelectedDevice::Synthetic {
                name: name.clone(),
                script: Vec::new(),
            };
        }
    }

    #[cfg(feature = "audio-cpal")]
    {
        let usable = cpal_capture::list_usable_devices();
        if let Some(preferred) = &config.device {
            if usable.iter().any(|n| n == preferred) {
                return SelectedDevice::Input {
                    name: preferred.clone(),
                };
            }
            log::warn!(
                "preferred audio device '{}' unavailable, falling back to default",
                preferred
            );
        }
        if let Some(name) = cpal_capture::default_device_name() {
            return SelectedDevice::Input { name };
        }
    }

    #[cfg(not(feature = "audio-cpal"))]
    if let Some(name) = &config.device {
        log::warn!(
            "audio device '{}' requires the audio-cpal feature, audio disabled",
            name
        );
    }

    SelectedDevice::None
}

// ----------------------------------------------------------------------------
// cpal capture backend
// ----------------------------------------------------------------------------

#[cfg(feature = "audio-cpal")]
mod cpal_capture {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use anyhow::{anyhow, Result};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

    use super::{fire, VolumeListener};

    /// Enumerate devices that actually open: each candidate is probed for
    /// a usable input configuration before being listed.
    pub(super) fn list_usable_devices() -> Vec<String> {
        let host = cpal::default_host();
        let mut usable = Vec::new();
        let Ok(devices) = host.input_devices() else {
            return usable;
        };
        for device in devices {
            let Ok(name) = device.name() else { continue };
            if device.default_input_config().is_ok() {
                usable.push(name);
            }
        }
        usable
    }

    pub(super) fn default_device_name() -> Option<String> {
        let host = cpal::default_host();
        let device = host.default_input_device()?;
        device.default_input_config().ok()?;
        device.name().ok()
    }

    pub(super) fn run(
        name: &str,
        threshold: f32,
        running: &Arc<AtomicBool>,
        listeners: &Arc<Mutex<Vec<VolumeListener>>>,
    ) -> Result<()> {
        let host = cpal::default_host();
        let device = host
            .input_devices()
            .map_err(|e| anyhow!("enumerate audio devices: {}", e))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .or_else(|| host.default_input_device())
            .ok_or_else(|| anyhow!("audio device '{}' disappeared", name))?;

        let config = device
            .default_input_config()
            .map_err(|e| anyhow!("audio input config: {}", e))?;
        let sample_format = config.sample_format();
        let err_fn = |err| log::error!("audio stream error: {}", err);

        let stream = match sample_format {
            cpal::SampleFormat::I16 => {
                let listeners = listeners.clone();
                device.build_input_stream(
                    &config.into(),
                    move |data: &[i16], _: &_| {
                        let amplitude = mean_abs_i16(data);
                        if amplitude >= threshold {
                            fire(&listeners, amplitude);
                        }
                    },
                    err_fn,
                    None,
                )?
            }
            cpal::SampleFormat::F32 => {
                let listeners = listeners.clone();
                device.build_input_stream(
                    &config.into(),
                    move |data: &[f32], _: &_| {
                        let amplitude = mean_abs_f32(data);
                        if amplitude >= threshold {
                            fire(&listeners, amplitude);
                        }
                    },
                    err_fn,
                    None,
                )?
            }
            other => return Err(anyhow!("unsupported sample format {:?}", other)),
        };

        stream.play()?;
        log::info!("audio capture started on '{}'", name);

        while running.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(50));
        }

        drop(stream);
        log::info!("audio capture stopped on '{}'", name);
        Ok(())
    }

    fn mean_abs_i16(data: &[i16]) -> f32 {
        if data.is_empty() {
            return 0.0;
        }
        let sum: f64 = data.iter().map(|&s| (s as f64).abs()).sum();
        (sum / data.len() as f64) as f32
    }

    /// Scaled into i16 units so one threshold works for both formats.
    fn mean_abs_f32(data: &[f32]) -> f32 {
        if data.is_empty() {
            return 0.0;
        }
        let sum: f64 = data.iter().map(|&s| (s as f64).abs()).sum();
        ((sum / data.len() as f64) * 32_768.0) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn stub_config() -> AudioConfig {
        AudioConfig {
            device: Some("stub://webcam-mic".to_string()),
            ..AudioConfig::default()
        }
    }

    #[test]
    fn synthetic_device_is_selected_by_name() {
        let source = AudioSource::open(stub_config());
        assert_eq!(source.device_name(), Some("stub://webcam-mic"));
        // Synthetic audio never feeds the encoder.
        assert!(source.encoder_device().is_none());
    }

    #[test]
    fn listeners_fire_only_above_the_threshold() {
        let mut source =
            AudioSource::open(stub_config()).with_script(vec![100.0, 2_000.0, 50.0, 3_000.0]);

        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        source.add_listener(Box::new(move |volume| {
            assert!(volume >= 1000.0);
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        source.start();
        let deadline = Instant::now() + Duration::from_secs(2);
        while source.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        source.stop();

        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stop_without_start_is_harmless() {
        let mut source = AudioSource::open(stub_config());
        source.stop();
        source.stop();
        assert!(!source.is_running());
    }

    #[cfg(not(feature = "audio-cpal"))]
    #[test]
    fn real_devices_degrade_to_disabled_without_the_feature() {
        let config = AudioConfig {
            device: Some("sysdefault:CARD=webcam".to_string()),
            ..AudioConfig::default()
        };
        let mut source = AudioSource::open(config);
        assert!(source.device_name().is_none());
        source.start();
        assert!(!source.is_running());
    }
}
