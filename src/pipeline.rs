//! Camera pipeline orchestration.
//!
//! One [`CameraPipeline`] per device wires the capture loop to motion
//! detection, buffering, background recognition, periodic clip assembly,
//! and rate-limited alerting, and renders the annotated preview frame on
//! demand. A [`PipelineRegistry`] owns every pipeline in the hosting
//! process and tears them down explicitly - no lifecycle ever rides on
//! drop timing.
//!
//! Locking discipline: one coarse mutex guards the cross-thread state
//! (latest frame, face set, all three buffers). Critical sections only
//! copy data in or out; detection, encoding, and transport all run outside
//! the lock. The motion detector, classifier, gate, and notifier each sit
//! behind their own mutex and are never locked while the shared lock is
//! held.

use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::json;

use crate::alert::{AlertGate, AlertNotifier, MailTransport, SendmailTransport};
use crate::audio::{AudioConfig, AudioSource};
use crate::capture::{CameraConfig, CameraSource};
use crate::clip::{ClipAssembler, ClipConfig};
use crate::config::{BufferMode, EngineConfig};
use crate::dashboard::DashboardClient;
use crate::detect::{
    BackendRegistry, DetectedFace, FaceMatcher, Gallery, MotionConfig, MotionDetector,
    ObjectClassifier, UNCLASSIFIED_LABEL,
};
use crate::error::EngineError;
use crate::frame::{BoundedFrameQueue, Frame};
use crate::overlay;
use crate::repository::{Repository, SqliteRepository};

const WORKER_IDLE_SLEEP: Duration = Duration::from_millis(10);
const CLIP_TICK_SLICE: Duration = Duration::from_millis(200);
const CAPTURE_RETRY_SLEEP: Duration = Duration::from_millis(250);

/// Everything a pipeline needs beyond its configuration. Production code
/// gets the standard wiring from [`PipelineDeps::from_config`]; tests
/// inject in-memory doubles.
pub struct PipelineDeps {
    pub registry: BackendRegistry,
    pub repository: Arc<Mutex<dyn Repository>>,
    pub transport: Box<dyn MailTransport>,
    pub dashboard: Arc<DashboardClient>,
}

impl PipelineDeps {
    pub fn from_config(config: &EngineConfig) -> anyhow::Result<Self> {
        let repository = SqliteRepository::open(&config.db_path, &config.media_dir)?;
        Ok(Self {
            registry: BackendRegistry::with_builtins(),
            repository: Arc::new(Mutex::new(repository)),
            transport: Box::new(SendmailTransport::new(
                config.alerts.sendmail_command.as_str(),
            )),
            dashboard: Arc::new(DashboardClient::new(config.dashboard_url.clone())),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PipelineState {
    Capturing,
    /// Terminal: the device never opened. `get_frame` returns no frame.
    Failed,
}

/// Cross-thread state behind the pipeline's single coarse lock.
struct SharedState {
    latest_frame: Option<Frame>,
    detected_faces: Vec<DetectedFace>,
    recognition_queue: BoundedFrameQueue,
    snapshots: BoundedFrameQueue,
    running_buffer: Vec<Frame>,
}

pub struct CameraPipeline {
    device: String,
    state: PipelineState,
    shared: Arc<Mutex<SharedState>>,
    detector: Mutex<MotionDetector>,
    classifier: Option<Mutex<ObjectClassifier>>,
    matcher: Arc<FaceMatcher>,
    notifier: Arc<Mutex<AlertNotifier>>,
    repository: Arc<Mutex<dyn Repository>>,
    dashboard: Arc<DashboardClient>,
    audio: Option<AudioSource>,
    alert_gate: Mutex<AlertGate>,
    motion_frames: AtomicU64,
    classify_interval: u32,
    buffer_mode: BufferMode,
    stop: Arc<AtomicBool>,
    capture_handle: Option<JoinHandle<()>>,
    worker_handle: Option<JoinHandle<()>>,
    clip_handle: Option<JoinHandle<()>>,
}

impl CameraPipeline {
    /// Build and start a pipeline for the configured camera.
    ///
    /// Configuration problems (unknown backend, missing gallery) fail the
    /// call. A camera that will not open does NOT: the pipeline comes up
    /// in the failed state so sibling cameras keep running, and every
    /// `get_frame` on it reports no frame.
    pub fn start(config: &EngineConfig, deps: PipelineDeps) -> Result<Self, EngineError> {
        let face_backend = deps
            .registry
            .face(&config.recognition.backend)
            .map_err(|e| EngineError::Configuration(e.to_string()))?;
        let gallery = Gallery::load_dir(
            &config.recognition.gallery_dir,
            &face_backend,
            config.recognition.min_confidence,
        )?;
        let matcher = Arc::new(FaceMatcher::new(
            face_backend,
            gallery,
            config.recognition.min_confidence,
            config.recognition.distance_threshold,
        ));

        let classifier = if config.classifier.interval > 0 {
            let backend = deps
                .registry
                .classifier(&config.classifier.backend)
                .map_err(|e| EngineError::Configuration(e.to_string()))?;
            Some(Mutex::new(ObjectClassifier::new(
                backend,
                config.classifier.window,
            )))
        } else {
            None
        };

        let notifier = Arc::new(Mutex::new(AlertNotifier::new(
            config.alerts.mail_from.as_str(),
            config.alerts.mail_to.clone(),
            "Motion Detection Alert Snapshot",
            deps.transport,
        )));

        let shared = Arc::new(Mutex::new(SharedState {
            latest_frame: None,
            detected_faces: Vec::new(),
            recognition_queue: BoundedFrameQueue::new(config.recognition.queue_cap),
            snapshots: BoundedFrameQueue::new(config.alerts.snapshot_cap),
            running_buffer: Vec::new(),
        }));

        let mut pipeline = Self {
            device: config.camera.device.clone(),
            state: PipelineState::Failed,
            shared,
            detector: Mutex::new(MotionDetector::new(MotionConfig::from(&config.motion))),
            classifier,
            matcher,
            notifier,
            repository: deps.repository,
            dashboard: deps.dashboard,
            audio: None,
            alert_gate: Mutex::new(AlertGate::new(config.alerts.interval)),
            motion_frames: AtomicU64::new(0),
            classify_interval: config.classifier.interval,
            buffer_mode: config.buffer_mode,
            stop: Arc::new(AtomicBool::new(false)),
            capture_handle: None,
            worker_handle: None,
            clip_handle: None,
        };

        let mut source = match CameraSource::new(CameraConfig {
            device: config.camera.device.clone(),
            target_fps: config.camera.target_fps,
            width: config.camera.width,
            height: config.camera.height,
        }) {
            Ok(source) => source,
            Err(e) => {
                log::error!("could not open video device {}: {}", config.camera.device, e);
                return Ok(pipeline);
            }
        };
        if let Err(e) = source.connect() {
            log::error!("could not open video device {}: {}", config.camera.device, e);
            return Ok(pipeline);
        }
        pipeline.state = PipelineState::Capturing;

        pipeline.start_audio(config);
        pipeline.spawn_capture_loop(source, config);
        pipeline.spawn_recognition_worker();
        pipeline.spawn_clip_timer(config);

        log::info!("pipeline capturing on {}", pipeline.device);
        Ok(pipeline)
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn is_capturing(&self) -> bool {
        self.state == PipelineState::Capturing
    }

    fn start_audio(&mut self, config: &EngineConfig) {
        if !config.audio.enabled {
            return;
        }
        let mut audio = AudioSource::open(AudioConfig::from(&config.audio));

        // Volume spikes capture a snapshot of the latest frame, a trigger
        // path independent of and concurrent with motion detection.
        let shared = self.shared.clone();
        let notifier = self.notifier.clone();
        audio.add_listener(Box::new(move |volume| {
            let captured = match shared.lock() {
                Ok(mut state) => match state.latest_frame.clone() {
                    Some(frame) => {
                        state.snapshots.push(frame);
                        true
                    }
                    None => false,
                },
                Err(_) => false,
            };
            if captured {
                if let Ok(mut notifier) = notifier.lock() {
                    notifier.log_event(&format!("Audio level spike (volume {:.0})", volume));
                }
            }
        }));
        audio.start();
        self.audio = Some(audio);
    }

    fn spawn_capture_loop(&mut self, mut source: CameraSource, config: &EngineConfig) {
        let shared = self.shared.clone();
        let stop = self.stop.clone();
        let width = config.camera.width;
        let height = config.camera.height;
        let frame_pause = Duration::from_millis(1000 / config.camera.target_fps.max(1) as u64);

        self.capture_handle = Some(thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                match source.next_frame() {
                    Ok(frame) => {
                        let frame = frame.resized(width, height);
                        if let Ok(mut state) = shared.lock() {
                            // Single-slot overwrite: the preview only ever
                            // wants the newest frame.
                            state.latest_frame = Some(frame);
                        }
                    }
                    Err(e) => {
                        log::error!("failed to grab frame: {}", e);
                        thread::sleep(CAPTURE_RETRY_SLEEP);
                        continue;
                    }
                }
                thread::sleep(frame_pause);
            }
            log::info!("capture loop exiting");
            // `source` drops here, releasing the device.
        }));
    }

    fn spawn_recognition_worker(&mut self) {
        let shared = self.shared.clone();
        let matcher = self.matcher.clone();
        let repository = self.repository.clone();
        let notifier = self.notifier.clone();
        let dashboard = self.dashboard.clone();
        let stop = self.stop.clone();

        self.worker_handle = Some(thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                let frame = shared
                    .lock()
                    .ok()
                    .and_then(|mut state| state.recognition_queue.pop_oldest());
                let Some(frame) = frame else {
                    thread::sleep(WORKER_IDLE_SLEEP);
                    continue;
                };

                let faces = matcher.recognize(&frame, &repository);

                // Publish the full set atomically; readers see either the
                // old or the new set, never a mix.
                if let Ok(mut state) = shared.lock() {
                    state.detected_faces = faces.clone();
                }
                if let Ok(mut notifier) = notifier.lock() {
                    notifier.set_detected_faces(faces.clone());
                }
                for face in &faces {
                    dashboard.send_log(
                        "recognition",
                        &format!("recognized {}", face.label),
                        Some(json!({ "distance": face.distance })),
                    );
                }
            }
        }));
    }

    fn spawn_clip_timer(&mut self, config: &EngineConfig) {
        let shared = self.shared.clone();
        let repository = self.repository.clone();
        let notifier = self.notifier.clone();
        let dashboard = self.dashboard.clone();
        let stop = self.stop.clone();
        let interval = config.clip.interval;
        let assembler = ClipAssembler::new(ClipConfig {
            output_dir: config.media_dir.join("event_clips"),
            width: config.camera.width,
            height: config.camera.height,
            fps: config.clip.fps,
            stabilize_poll: config.clip.stabilize_poll,
            stabilize_timeout: config.clip.stabilize_timeout,
            thumbnail_offset: config.clip.thumbnail_offset,
            ffmpeg_command: config.clip.ffmpeg_command.clone(),
        });
        let audio_device = self
            .audio
            .as_ref()
            .and_then(|audio| audio.encoder_device().map(String::from));

        self.clip_handle = Some(thread::spawn(move || {
            let mut last_tick = Instant::now();
            loop {
                if stop.load(Ordering::SeqCst) {
                    return;
                }
                if last_tick.elapsed() < interval {
                    thread::sleep(CLIP_TICK_SLICE);
                    continue;
                }
                last_tick = Instant::now();

                // Swap the running buffer out atomically; new frames
                // accumulate for the next window while this one encodes.
                let frames = shared
                    .lock()
                    .map(|mut state| mem::take(&mut state.running_buffer))
                    .unwrap_or_default();
                if frames.is_empty() {
                    continue;
                }

                match assembler.assemble(&frames, audio_device.as_deref()) {
                    Ok(artifact) => {
                        if let Ok(mut repo) = repository.lock() {
                            if let Err(e) = repo.save_event(
                                "periodic",
                                "periodic buffer save",
                                Some(&artifact.video_path),
                                Some(&artifact.thumbnail_path),
                            ) {
                                log::warn!("failed to persist clip event: {}", e);
                            }
                        }
                        dashboard.send_video(
                            &artifact.video_path,
                            "periodic clip",
                            Some(&artifact.thumbnail_path),
                        );
                        if let Ok(mut notifier) = notifier.lock() {
                            notifier.set_clip(artifact.video_path.clone());
                        }
                        log::info!(
                            "clip assembled: {} ({:.1}s)",
                            artifact.video_path.display(),
                            artifact.duration.as_secs_f32()
                        );
                    }
                    // The buffer was cleared by the swap either way; a
                    // failed cycle never stops the timer.
                    Err(e) => {
                        log::error!("clip assembly failed: {}", e);
                        dashboard.send_log("clip_error", &e.to_string(), None);
                    }
                }
            }
        }));
    }

    /// Render the current preview frame as JPEG.
    ///
    /// Runs motion detection on the latest captured frame, feeds the
    /// buffers and the alert path on motion, overlays face boxes and the
    /// timestamp, and returns the encoded frame. Returns `None` when the
    /// pipeline failed to open or no frame has been captured yet.
    pub fn get_frame(&self) -> Option<Vec<u8>> {
        if self.state != PipelineState::Capturing {
            return None;
        }
        let frame = self.shared.lock().ok()?.latest_frame.clone()?;

        let motion = match self.detector.lock() {
            Ok(mut detector) => detector.detect(&frame),
            Err(_) => return overlay::encode_jpeg(&frame).ok(),
        };

        let mut render = frame.clone();
        if motion.detected {
            if let Some(region) = motion.region {
                overlay::draw_box(&mut render, &region, overlay::MOTION_COLOR);
                overlay::draw_label(
                    &mut render,
                    region.x,
                    region.y - 10,
                    "Movement Detected",
                    overlay::MOTION_COLOR,
                );

                {
                    let mut state = self.shared.lock().ok()?;
                    // Recognition sees the clean frame; snapshot and clip
                    // buffers keep the annotated copy.
                    state.recognition_queue.push(frame.clone());
                    state.snapshots.push(render.clone());
                    if self.buffer_mode == BufferMode::MotionGated {
                        state.running_buffer.push(render.clone());
                    }
                }

                self.dashboard.send_log(
                    "motion",
                    "movement detected",
                    Some(json!({
                        "box": [region.x, region.y, region.width, region.height]
                    })),
                );

                self.maybe_classify(&frame);

                let fire = self
                    .alert_gate
                    .lock()
                    .map(|mut gate| gate.should_fire(Instant::now()))
                    .unwrap_or(false);
                if fire {
                    self.trigger_alert();
                }
            }
        }

        if self.buffer_mode == BufferMode::Continuous {
            if let Ok(mut state) = self.shared.lock() {
                state.running_buffer.push(render.clone());
            }
        }

        let faces = self.shared.lock().ok()?.detected_faces.clone();
        for face in &faces {
            overlay::draw_box(&mut render, &face.region, overlay::FACE_COLOR);
            overlay::draw_label(
                &mut render,
                face.region.x,
                face.region.y - 10,
                &face.label,
                overlay::FACE_COLOR,
            );
        }
        overlay::draw_timestamp(&mut render, frame.captured_at());

        match overlay::encode_jpeg(&render) {
            Ok(jpeg) => Some(jpeg),
            Err(e) => {
                // Degrade to the plain frame rather than dropping the stream.
                log::warn!("preview overlay encode failed: {}", e);
                overlay::encode_jpeg(&frame).ok()
            }
        }
    }

    /// Classify every Nth motion frame and log the smoothed verdict.
    fn maybe_classify(&self, frame: &Frame) {
        let Some(classifier) = &self.classifier else {
            return;
        };
        let nth = self.motion_frames.fetch_add(1, Ordering::SeqCst) + 1;
        if self.classify_interval == 0 || nth % self.classify_interval as u64 != 0 {
            return;
        }

        let label = match classifier.lock() {
            Ok(mut classifier) => classifier.classify(frame),
            Err(_) => return,
        };
        if label != UNCLASSIFIED_LABEL {
            if let Ok(mut notifier) = self.notifier.lock() {
                notifier.log_event(&format!("Classified moving object: {}", label));
            }
            self.dashboard.send_log("classification", &label, None);
        }
    }

    /// Queue an alert dispatch on its own short-lived thread so slow mail
    /// transport never blocks frame serving.
    fn trigger_alert(&self) {
        let snapshots = match self.shared.lock() {
            Ok(state) => state.snapshots.snapshot(),
            Err(_) => return,
        };
        if let Ok(mut notifier) = self.notifier.lock() {
            notifier.log_event("Movement detected");
            notifier.set_snapshots(snapshots);
        }

        let notifier = self.notifier.clone();
        let shared = self.shared.clone();
        let repository = self.repository.clone();
        let dashboard = self.dashboard.clone();
        thread::spawn(move || {
            let outcome = match notifier.lock() {
                Ok(mut notifier) => notifier.dispatch(),
                Err(_) => return,
            };
            match outcome {
                Ok(true) => {
                    // The pipeline's snapshot buffer resets together with
                    // the notifier's state.
                    if let Ok(mut state) = shared.lock() {
                        state.snapshots.clear();
                    }
                    if let Ok(mut repo) = repository.lock() {
                        let _ = repo.save_event("alert", "movement alert dispatched", None, None);
                    }
                    dashboard.send_log("alert", "movement alert dispatched", None);
                }
                Ok(false) => {}
                Err(e) => log::warn!("alert dispatch failed: {}", e),
            }
        });
    }

    /// Cancel the clip timer, stop the worker loops, and release the
    /// device and audio handles. Deterministic: every loop is signalled
    /// and joined; in-flight alert dispatches are not waited for.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for handle in [
            self.capture_handle.take(),
            self.worker_handle.take(),
            self.clip_handle.take(),
        ]
        .into_iter()
        .flatten()
        {
            let _ = handle.join();
        }
        if let Some(audio) = &mut self.audio {
            audio.stop();
        }
        log::info!("pipeline {} shut down", self.device);
    }
}

// ----------------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------------

/// Explicit owner of every active pipeline in the hosting process. Created
/// at process start, handed to whatever exposes the streaming endpoint,
/// torn down explicitly on shutdown.
pub struct PipelineRegistry {
    pipelines: HashMap<String, CameraPipeline>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self {
            pipelines: HashMap::new(),
        }
    }

    /// Start and register a pipeline for the configured device. Re-adding
    /// an existing device is a no-op.
    pub fn add(&mut self, config: &EngineConfig, deps: PipelineDeps) -> Result<(), EngineError> {
        let device = config.camera.device.clone();
        if self.pipelines.contains_key(&device) {
            log::info!("camera {} already registered", device);
            return Ok(());
        }
        let pipeline = CameraPipeline::start(config, deps)?;
        self.pipelines.insert(device, pipeline);
        Ok(())
    }

    pub fn get(&self, device: &str) -> Option<&CameraPipeline> {
        self.pipelines.get(device)
    }

    /// Preview frame for a device, if it is registered and capturing.
    pub fn get_frame(&self, device: &str) -> Option<Vec<u8>> {
        match self.pipelines.get(device) {
            Some(pipeline) => pipeline.get_frame(),
            None => {
                log::error!("camera {} not found", device);
                None
            }
        }
    }

    pub fn devices(&self) -> Vec<String> {
        self.pipelines.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    /// Stop and remove one pipeline.
    pub fn remove(&mut self, device: &str) {
        match self.pipelines.remove(device) {
            Some(mut pipeline) => pipeline.shutdown(),
            None => log::error!("camera {} not found", device),
        }
    }

    /// Deterministically shut down every pipeline.
    pub fn shutdown(&mut self) {
        for (_, mut pipeline) in self.pipelines.drain() {
            pipeline.shutdown();
        }
    }
}

impl Default for PipelineRegistry {
    fn default() -> Self {
        Self::new()
    }
}
