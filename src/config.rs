use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_DB_PATH: &str = "sentry.db";
const DEFAULT_MEDIA_DIR: &str = "media";
const DEFAULT_CAMERA_DEVICE: &str = "stub://front_door";
const DEFAULT_CAMERA_FPS: u32 = 10;
const DEFAULT_CAMERA_WIDTH: u32 = 320;
const DEFAULT_CAMERA_HEIGHT: u32 = 240;
const DEFAULT_MOTION_THRESHOLD: u8 = 25;
const DEFAULT_MOTION_MIN_AREA: u32 = 500;
const DEFAULT_MOTION_FRAME_SKIP: u32 = 1;
const DEFAULT_GALLERY_DIR: &str = "known_faces";
const DEFAULT_FACE_BACKEND: &str = "stub";
const DEFAULT_FACE_MIN_CONFIDENCE: f32 = 0.95;
const DEFAULT_FACE_DISTANCE_THRESHOLD: f32 = 5.0;
const DEFAULT_RECOGNITION_QUEUE_CAP: usize = 32;
const DEFAULT_CLASSIFIER_BACKEND: &str = "stub";
const DEFAULT_CLASSIFY_INTERVAL: u32 = 10;
const DEFAULT_CLASSIFY_WINDOW: usize = 10;
const DEFAULT_ALERT_INTERVAL_SECS: u64 = 30;
const DEFAULT_SNAPSHOT_CAP: usize = 10;
const DEFAULT_SENDMAIL_COMMAND: &str = "sendmail";
const DEFAULT_CLIP_INTERVAL_SECS: u64 = 60;
const DEFAULT_CLIP_FPS: u32 = 20;
const DEFAULT_STABILIZE_POLL_MS: u64 = 250;
const DEFAULT_STABILIZE_TIMEOUT_SECS: u64 = 15;
const DEFAULT_THUMBNAIL_OFFSET_MS: u64 = 500;
const DEFAULT_AUDIO_THRESHOLD: f32 = 1000.0;
const DEFAULT_AUDIO_SAMPLE_RATE: u32 = 44_100;
const DEFAULT_AUDIO_CHUNK: usize = 512;

#[derive(Debug, Deserialize, Default)]
struct EngineConfigFile {
    db_path: Option<String>,
    media_dir: Option<PathBuf>,
    dashboard_url: Option<String>,
    buffer_mode: Option<String>,
    camera: Option<CameraConfigFile>,
    motion: Option<MotionConfigFile>,
    recognition: Option<RecognitionConfigFile>,
    classifier: Option<ClassifierConfigFile>,
    alerts: Option<AlertConfigFile>,
    clip: Option<ClipConfigFile>,
    audio: Option<AudioConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    device: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct MotionConfigFile {
    threshold: Option<u8>,
    min_area: Option<u32>,
    frame_skip: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct RecognitionConfigFile {
    gallery_dir: Option<PathBuf>,
    backend: Option<String>,
    min_confidence: Option<f32>,
    distance_threshold: Option<f32>,
    queue_cap: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct ClassifierConfigFile {
    backend: Option<String>,
    interval: Option<u32>,
    window: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct AlertConfigFile {
    interval_secs: Option<u64>,
    snapshot_cap: Option<usize>,
    mail_to: Option<String>,
    mail_from: Option<String>,
    sendmail_command: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ClipConfigFile {
    interval_secs: Option<u64>,
    fps: Option<u32>,
    stabilize_poll_ms: Option<u64>,
    stabilize_timeout_secs: Option<u64>,
    thumbnail_offset_ms: Option<u64>,
    ffmpeg_command: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct AudioConfigFile {
    enabled: Option<bool>,
    device: Option<String>,
    sample_rate: Option<u32>,
    chunk_frames: Option<usize>,
    threshold: Option<f32>,
}

/// Running-buffer policy: append only motion frames (default), or every
/// captured frame regardless of motion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferMode {
    MotionGated,
    Continuous,
}

impl BufferMode {
    fn parse(value: &str) -> Result<Self> {
        match value {
            "motion-gated" => Ok(BufferMode::MotionGated),
            "continuous" => Ok(BufferMode::Continuous),
            other => Err(anyhow!(
                "buffer_mode must be 'motion-gated' or 'continuous', got '{}'",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub db_path: String,
    pub media_dir: PathBuf,
    pub dashboard_url: Option<String>,
    pub buffer_mode: BufferMode,
    pub camera: CameraSettings,
    pub motion: MotionSettings,
    pub recognition: RecognitionSettings,
    pub classifier: ClassifierSettings,
    pub alerts: AlertSettings,
    pub clip: ClipSettings,
    pub audio: AudioSettings,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub device: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct MotionSettings {
    pub threshold: u8,
    pub min_area: u32,
    pub frame_skip: u32,
}

#[derive(Debug, Clone)]
pub struct RecognitionSettings {
    pub gallery_dir: PathBuf,
    pub backend: String,
    pub min_confidence: f32,
    pub distance_threshold: f32,
    pub queue_cap: usize,
}

#[derive(Debug, Clone)]
pub struct ClassifierSettings {
    pub backend: String,
    /// Classify every Nth motion frame; 0 disables classification.
    pub interval: u32,
    pub window: usize,
}

#[derive(Debug, Clone)]
pub struct AlertSettings {
    pub interval: Duration,
    pub snapshot_cap: usize,
    pub mail_to: Option<String>,
    pub mail_from: String,
    pub sendmail_command: String,
}

#[derive(Debug, Clone)]
pub struct ClipSettings {
    pub interval: Duration,
    pub fps: u32,
    pub stabilize_poll: Duration,
    pub stabilize_timeout: Duration,
    pub thumbnail_offset: Duration,
    pub ffmpeg_command: String,
}

#[derive(Debug, Clone)]
pub struct AudioSettings {
    pub enabled: bool,
    pub device: Option<String>,
    pub sample_rate: u32,
    pub chunk_frames: usize,
    pub threshold: f32,
}

impl EngineConfig {
    /// Load from the file named by `SENTRY_CONFIG` (JSON), apply `SENTRY_*`
    /// env overrides, then validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SENTRY_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Load from an explicit path (or pure defaults when `None`).
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => EngineConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: EngineConfigFile) -> Result<Self> {
        let camera = file.camera.unwrap_or_default();
        let motion = file.motion.unwrap_or_default();
        let recognition = file.recognition.unwrap_or_default();
        let classifier = file.classifier.unwrap_or_default();
        let alerts = file.alerts.unwrap_or_default();
        let clip = file.clip.unwrap_or_default();
        let audio = file.audio.unwrap_or_default();

        let buffer_mode = match file.buffer_mode.as_deref() {
            Some(mode) => BufferMode::parse(mode)?,
            None => BufferMode::MotionGated,
        };

        Ok(Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            media_dir: file
                .media_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MEDIA_DIR)),
            dashboard_url: file.dashboard_url,
            buffer_mode,
            camera: CameraSettings {
                device: camera
                    .device
                    .unwrap_or_else(|| DEFAULT_CAMERA_DEVICE.to_string()),
                target_fps: camera.target_fps.unwrap_or(DEFAULT_CAMERA_FPS),
                width: camera.width.unwrap_or(DEFAULT_CAMERA_WIDTH),
                height: camera.height.unwrap_or(DEFAULT_CAMERA_HEIGHT),
            },
            motion: MotionSettings {
                threshold: motion.threshold.unwrap_or(DEFAULT_MOTION_THRESHOLD),
                min_area: motion.min_area.unwrap_or(DEFAULT_MOTION_MIN_AREA),
                frame_skip: motion.frame_skip.unwrap_or(DEFAULT_MOTION_FRAME_SKIP),
            },
            recognition: RecognitionSettings {
                gallery_dir: recognition
                    .gallery_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_GALLERY_DIR)),
                backend: recognition
                    .backend
                    .unwrap_or_else(|| DEFAULT_FACE_BACKEND.to_string()),
                min_confidence: recognition
                    .min_confidence
                    .unwrap_or(DEFAULT_FACE_MIN_CONFIDENCE),
                distance_threshold: recognition
                    .distance_threshold
                    .unwrap_or(DEFAULT_FACE_DISTANCE_THRESHOLD),
                queue_cap: recognition.queue_cap.unwrap_or(DEFAULT_RECOGNITION_QUEUE_CAP),
            },
            classifier: ClassifierSettings {
                backend: classifier
                    .backend
                    .unwrap_or_else(|| DEFAULT_CLASSIFIER_BACKEND.to_string()),
                interval: classifier.interval.unwrap_or(DEFAULT_CLASSIFY_INTERVAL),
                window: classifier.window.unwrap_or(DEFAULT_CLASSIFY_WINDOW),
            },
            alerts: AlertSettings {
                interval: Duration::from_secs(
                    alerts.interval_secs.unwrap_or(DEFAULT_ALERT_INTERVAL_SECS),
                ),
                snapshot_cap: alerts.snapshot_cap.unwrap_or(DEFAULT_SNAPSHOT_CAP),
                mail_to: alerts.mail_to,
                mail_from: alerts
                    .mail_from
                    .unwrap_or_else(|| "sentry@localhost".to_string()),
                sendmail_command: alerts
                    .sendmail_command
                    .unwrap_or_else(|| DEFAULT_SENDMAIL_COMMAND.to_string()),
            },
            clip: ClipSettings {
                interval: Duration::from_secs(
                    clip.interval_secs.unwrap_or(DEFAULT_CLIP_INTERVAL_SECS),
                ),
                fps: clip.fps.unwrap_or(DEFAULT_CLIP_FPS),
                stabilize_poll: Duration::from_millis(
                    clip.stabilize_poll_ms.unwrap_or(DEFAULT_STABILIZE_POLL_MS),
                ),
                stabilize_timeout: Duration::from_secs(
                    clip.stabilize_timeout_secs
                        .unwrap_or(DEFAULT_STABILIZE_TIMEOUT_SECS),
                ),
                thumbnail_offset: Duration::from_millis(
                    clip.thumbnail_offset_ms.unwrap_or(DEFAULT_THUMBNAIL_OFFSET_MS),
                ),
                ffmpeg_command: clip.ffmpeg_command.unwrap_or_else(|| "ffmpeg".to_string()),
            },
            audio: AudioSettings {
                enabled: audio.enabled.unwrap_or(false),
                device: audio.device,
                sample_rate: audio.sample_rate.unwrap_or(DEFAULT_AUDIO_SAMPLE_RATE),
                chunk_frames: audio.chunk_frames.unwrap_or(DEFAULT_AUDIO_CHUNK),
                threshold: audio.threshold.unwrap_or(DEFAULT_AUDIO_THRESHOLD),
            },
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("SENTRY_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(dir) = std::env::var("SENTRY_MEDIA_DIR") {
            if !dir.trim().is_empty() {
                self.media_dir = PathBuf::from(dir);
            }
        }
        if let Ok(device) = std::env::var("SENTRY_CAMERA_DEVICE") {
            if !device.trim().is_empty() {
                self.camera.device = device;
            }
        }
        if let Ok(dir) = std::env::var("SENTRY_GALLERY_DIR") {
            if !dir.trim().is_empty() {
                self.recognition.gallery_dir = PathBuf::from(dir);
            }
        }
        if let Ok(url) = std::env::var("SENTRY_DASHBOARD_URL") {
            if !url.trim().is_empty() {
                self.dashboard_url = Some(url);
            }
        }
        if let Ok(mode) = std::env::var("SENTRY_BUFFER_MODE") {
            if !mode.trim().is_empty() {
                self.buffer_mode = BufferMode::parse(mode.trim())?;
            }
        }
        if let Ok(secs) = std::env::var("SENTRY_ALERT_INTERVAL_SECS") {
            let secs: u64 = secs
                .parse()
                .map_err(|_| anyhow!("SENTRY_ALERT_INTERVAL_SECS must be an integer"))?;
            self.alerts.interval = Duration::from_secs(secs);
        }
        if let Ok(secs) = std::env::var("SENTRY_CLIP_INTERVAL_SECS") {
            let secs: u64 = secs
                .parse()
                .map_err(|_| anyhow!("SENTRY_CLIP_INTERVAL_SECS must be an integer"))?;
            self.clip.interval = Duration::from_secs(secs);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.camera.target_fps == 0 {
            return Err(anyhow!("camera.target_fps must be greater than zero"));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!("camera resolution must be non-zero"));
        }
        if self.motion.frame_skip == 0 {
            return Err(anyhow!("motion.frame_skip must be at least 1"));
        }
        if self.recognition.distance_threshold <= 0.0 {
            return Err(anyhow!("recognition.distance_threshold must be positive"));
        }
        if self.recognition.queue_cap == 0 {
            return Err(anyhow!("recognition.queue_cap must be at least 1"));
        }
        if self.alerts.interval.as_secs() == 0 {
            return Err(anyhow!("alerts.interval_secs must be greater than zero"));
        }
        if self.alerts.snapshot_cap == 0 {
            return Err(anyhow!("alerts.snapshot_cap must be at least 1"));
        }
        if self.clip.fps == 0 {
            return Err(anyhow!("clip.fps must be greater than zero"));
        }
        if self.clip.interval.as_secs() == 0 {
            return Err(anyhow!("clip.interval_secs must be greater than zero"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<EngineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
