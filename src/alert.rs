//! Rate-limited, multi-channel alert dispatch.
//!
//! `AlertNotifier` accumulates log lines, snapshot frames, the currently
//! detected faces, and an optional clip path, then composes everything
//! into one multipart message and hands it to a [`MailTransport`]. On a
//! successful send the accumulated state is drained atomically; on any
//! transport error it is left untouched so the next eligible window
//! retries with the accumulated data.
//!
//! Rate limiting is the *caller's* job: the pipeline consults an
//! [`AlertGate`] and only invokes dispatch when the interval has elapsed,
//! stamping the gate on invocation rather than on success - a failing
//! transport must not cause an alert storm.

use std::io::Write as _;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Local;

use crate::detect::DetectedFace;
use crate::error::EngineError;
use crate::frame::Frame;

/// Exactly this many representative snapshots go out with every alert.
const ALERT_ATTACHMENT_COUNT: usize = 2;

const MIME_BOUNDARY: &str = "sentry-alert-boundary";

// ----------------------------------------------------------------------------
// Rate limiting
// ----------------------------------------------------------------------------

/// Caller-side rate limiter for alert dispatch.
pub struct AlertGate {
    interval: Duration,
    last_fired: Option<Instant>,
}

impl AlertGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_fired: None,
        }
    }

    /// True when enough time has passed since the previous firing. The
    /// gate is stamped on invocation, not on dispatch success.
    pub fn should_fire(&mut self, now: Instant) -> bool {
        let fire = match self.last_fired {
            None => true,
            Some(prev) => now.duration_since(prev) >= self.interval,
        };
        if fire {
            self.last_fired = Some(now);
        }
        fire
    }
}

// ----------------------------------------------------------------------------
// Message + transport
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct Attachment {
    pub filename: String,
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

/// A composed alert ready for the mail transport collaborator.
#[derive(Clone, Debug)]
pub struct AlertMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<Attachment>,
}

impl AlertMessage {
    /// Render as an RFC 2045 multipart/mixed message.
    pub fn to_mime(&self) -> Vec<u8> {
        let mut out = String::new();
        out.push_str(&format!("From: {}\r\n", self.from));
        out.push_str(&format!("To: {}\r\n", self.to));
        out.push_str(&format!("Subject: {}\r\n", self.subject));
        out.push_str("MIME-Version: 1.0\r\n");
        out.push_str(&format!(
            "Content-Type: multipart/mixed; boundary=\"{}\"\r\n\r\n",
            MIME_BOUNDARY
        ));

        out.push_str(&format!("--{}\r\n", MIME_BOUNDARY));
        out.push_str("Content-Type: text/plain; charset=utf-8\r\n\r\n");
        out.push_str(&self.body);
        out.push_str("\r\n");

        for attachment in &self.attachments {
            out.push_str(&format!("--{}\r\n", MIME_BOUNDARY));
            out.push_str(&format!(
                "Content-Type: {}; name=\"{}\"\r\n",
                attachment.content_type, attachment.filename
            ));
            out.push_str("Content-Transfer-Encoding: base64\r\n");
            out.push_str(&format!(
                "Content-Disposition: attachment; filename=\"{}\"\r\n\r\n",
                attachment.filename
            ));
            let encoded = BASE64.encode(&attachment.bytes);
            for chunk in encoded.as_bytes().chunks(76) {
                out.push_str(std::str::from_utf8(chunk).unwrap_or_default());
                out.push_str("\r\n");
            }
        }
        out.push_str(&format!("--{}--\r\n", MIME_BOUNDARY));
        out.into_bytes()
    }
}

/// Mail transport collaborator: accepts one composed message, sends it
/// synchronously. The notifier's dispatch task wraps the call.
pub trait MailTransport: Send {
    fn send(&mut self, message: &AlertMessage) -> Result<(), EngineError>;
}

/// Pipes the rendered message into a sendmail-compatible command.
pub struct SendmailTransport {
    command: String,
}

impl SendmailTransport {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl MailTransport for SendmailTransport {
    fn send(&mut self, message: &AlertMessage) -> Result<(), EngineError> {
        let mut child = Command::new(&self.command)
            .arg("-t")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| EngineError::Dispatch(format!("spawn {}: {}", self.command, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&message.to_mime())
                .map_err(|e| EngineError::Dispatch(format!("write message: {}", e)))?;
        }

        let status = child
            .wait()
            .map_err(|e| EngineError::Dispatch(format!("wait for {}: {}", self.command, e)))?;
        if !status.success() {
            return Err(EngineError::Dispatch(format!(
                "{} exited with {:?}",
                self.command,
                status.code()
            )));
        }
        Ok(())
    }
}

/// Test transport capturing every sent message, with a switchable failure
/// mode for retry-path coverage.
pub struct InMemoryTransport {
    outbox: Arc<Mutex<Vec<AlertMessage>>>,
    failing: Arc<AtomicBool>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self {
            outbox: Arc::new(Mutex::new(Vec::new())),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle for inspecting sent messages after the transport is boxed.
    pub fn outbox(&self) -> Arc<Mutex<Vec<AlertMessage>>> {
        self.outbox.clone()
    }

    /// Handle for toggling transport failure.
    pub fn failure_flag(&self) -> Arc<AtomicBool> {
        self.failing.clone()
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MailTransport for InMemoryTransport {
    fn send(&mut self, message: &AlertMessage) -> Result<(), EngineError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EngineError::Dispatch("simulated transport failure".into()));
        }
        self.outbox
            .lock()
            .map_err(|_| EngineError::Dispatch("outbox lock poisoned".into()))?
            .push(message.clone());
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Notifier
// ----------------------------------------------------------------------------

/// Accumulates alert state and dispatches composed messages.
pub struct AlertNotifier {
    from: String,
    to: Option<String>,
    subject: String,
    transport: Box<dyn MailTransport>,
    alert_log: Vec<String>,
    snapshots: Vec<Frame>,
    detected_faces: Vec<DetectedFace>,
    clip_path: Option<PathBuf>,
}

impl AlertNotifier {
    pub fn new(
        from: impl Into<String>,
        to: Option<String>,
        subject: impl Into<String>,
        transport: Box<dyn MailTransport>,
    ) -> Self {
        Self {
            from: from.into(),
            to,
            subject: subject.into(),
            transport,
            alert_log: Vec::new(),
            snapshots: Vec::new(),
            detected_faces: Vec::new(),
            clip_path: None,
        }
    }

    /// Append a timestamped line to the alert log.
    pub fn log_event(&mut self, event: &str) {
        let line = format!("[{}] {}", crate::log_stamp(Local::now()), event);
        log::debug!("alert log: {}", line);
        self.alert_log.push(line);
    }

    /// Replace the detected-face set included in the next message.
    pub fn set_detected_faces(&mut self, faces: Vec<DetectedFace>) {
        self.detected_faces = faces;
    }

    /// Attach a clip to the next message.
    pub fn set_clip(&mut self, path: PathBuf) {
        self.clip_path = Some(path);
    }

    /// Replace the snapshot frames attached to the next message.
    pub fn set_snapshots(&mut self, frames: Vec<Frame>) {
        self.snapshots = frames;
    }

    pub fn pending_events(&self) -> usize {
        self.alert_log.len()
    }

    /// Compose and send the accumulated alert.
    ///
    /// Returns `Ok(true)` when a message went out (state drained),
    /// `Ok(false)` when there was nothing sendable (empty log, no frames,
    /// or no recipient), and `Err` on transport failure (state preserved).
    pub fn dispatch(&mut self) -> Result<bool, EngineError> {
        if self.alert_log.is_empty() {
            return Ok(false);
        }

        let Some(to) = self.to.clone() else {
            // No recipient configured: the alert channel acts as a sink so
            // the log cannot grow without bound.
            for line in self.alert_log.drain(..) {
                log::info!("alert (mail disabled): {}", line);
            }
            self.snapshots.clear();
            self.clip_path = None;
            return Ok(false);
        };

        if self.snapshots.is_empty() {
            log::warn!("no snapshot frames available, alert not sent");
            return Ok(false);
        }

        let mut body = self.alert_log.join("\n");
        if !self.detected_faces.is_empty() {
            body.push_str("\n\nDetected Faces:\n");
            for (i, face) in self.detected_faces.iter().enumerate() {
                body.push_str(&format!("Person {}: {}\n", i + 1, face.label));
            }
        }

        let mut attachments = Vec::new();
        let selected = representative_frames(&self.snapshots, ALERT_ATTACHMENT_COUNT);
        for (i, frame) in selected.iter().enumerate() {
            let jpeg = crate::overlay::encode_jpeg(frame)
                .map_err(|e| EngineError::Dispatch(format!("snapshot encode: {}", e)))?;
            attachments.push(Attachment {
                filename: format!("event_{}.jpg", i + 1),
                content_type: "image/jpeg",
                bytes: jpeg,
            });
        }

        if let Some(clip) = &self.clip_path {
            match std::fs::read(clip) {
                Ok(bytes) => attachments.push(Attachment {
                    filename: clip
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "clip.mp4".to_string()),
                    content_type: "application/octet-stream",
                    bytes,
                }),
                Err(e) => log::warn!("clip {} not attachable: {}", clip.display(), e),
            }
        }

        let message = AlertMessage {
            from: self.from.clone(),
            to,
            subject: self.subject.clone(),
            body,
            attachments,
        };
        self.transport.send(&message)?;

        self.alert_log.clear();
        self.snapshots.clear();
        self.clip_path = None;
        log::info!("alert dispatched");
        Ok(true)
    }
}

/// Evenly-spaced sample of `count` frames. A single frame is duplicated so
/// every alert carries the same number of attachments.
fn representative_frames(frames: &[Frame], count: usize) -> Vec<Frame> {
    if frames.len() == 1 {
        return vec![frames[0].clone(), frames[0].clone()];
    }
    if frames.len() <= count {
        return frames.to_vec();
    }
    let interval = frames.len() / count;
    (0..count).map(|i| frames[i * interval].clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{solid_frame, BoundingBox};

    fn notifier_with_transport() -> (AlertNotifier, Arc<Mutex<Vec<AlertMessage>>>, Arc<AtomicBool>)
    {
        let transport = InMemoryTransport::new();
        let outbox = transport.outbox();
        let failing = transport.failure_flag();
        let notifier = AlertNotifier::new(
            "sentry@localhost",
            Some("owner@example.com".to_string()),
            "Motion Detection Alert Snapshot",
            Box::new(transport),
        );
        (notifier, outbox, failing)
    }

    #[test]
    fn empty_log_is_a_no_op() {
        let (mut notifier, outbox, _) = notifier_with_transport();
        notifier.set_snapshots(vec![solid_frame(8, 8, [1, 1, 1])]);
        assert!(!notifier.dispatch().unwrap());
        assert!(outbox.lock().unwrap().is_empty());
    }

    #[test]
    fn single_snapshot_is_duplicated_into_two_attachments() {
        let (mut notifier, outbox, _) = notifier_with_transport();
        notifier.log_event("Movement detected");
        notifier.set_snapshots(vec![solid_frame(8, 8, [1, 1, 1])]);

        assert!(notifier.dispatch().unwrap());

        let outbox = outbox.lock().unwrap();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].attachments.len(), 2);
        assert_eq!(outbox[0].attachments[0].bytes, outbox[0].attachments[1].bytes);
        assert!(outbox[0].body.contains("Movement detected"));
    }

    #[test]
    fn no_snapshots_means_no_send_and_untouched_state() {
        let (mut notifier, outbox, _) = notifier_with_transport();
        notifier.log_event("Movement detected");

        assert!(!notifier.dispatch().unwrap());
        assert!(outbox.lock().unwrap().is_empty());
        assert_eq!(notifier.pending_events(), 1);
    }

    #[test]
    fn transport_failure_preserves_state_for_retry() {
        let (mut notifier, outbox, failing) = notifier_with_transport();
        notifier.log_event("Movement detected");
        notifier.set_snapshots(vec![solid_frame(8, 8, [1, 1, 1])]);

        failing.store(true, Ordering::SeqCst);
        assert!(notifier.dispatch().is_err());
        assert_eq!(notifier.pending_events(), 1);
        assert!(outbox.lock().unwrap().is_empty());

        // Next window: more data accumulated, transport recovered.
        failing.store(false, Ordering::SeqCst);
        notifier.log_event("Movement detected");
        assert!(notifier.dispatch().unwrap());
        assert_eq!(notifier.pending_events(), 0);

        let outbox = outbox.lock().unwrap();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].body.matches("Movement detected").count(), 2);
    }

    #[test]
    fn detected_faces_are_listed_in_the_body() {
        let (mut notifier, outbox, _) = notifier_with_transport();
        notifier.log_event("Movement detected");
        notifier.set_snapshots(vec![solid_frame(8, 8, [1, 1, 1])]);
        notifier.set_detected_faces(vec![DetectedFace {
            region: BoundingBox::new(0, 0, 4, 4),
            label: "alice".to_string(),
            distance: 0.4,
        }]);

        notifier.dispatch().unwrap();
        let outbox = outbox.lock().unwrap();
        assert!(outbox[0].body.contains("Detected Faces:"));
        assert!(outbox[0].body.contains("Person 1: alice"));
    }

    #[test]
    fn clip_rides_along_as_a_binary_attachment() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("event_1.mp4");
        std::fs::write(&clip, b"clip-bytes").unwrap();

        let (mut notifier, outbox, _) = notifier_with_transport();
        notifier.log_event("Movement detected");
        notifier.set_snapshots(vec![solid_frame(8, 8, [1, 1, 1])]);
        notifier.set_clip(clip);

        notifier.dispatch().unwrap();
        let outbox = outbox.lock().unwrap();
        assert_eq!(outbox[0].attachments.len(), 3);
        let video = &outbox[0].attachments[2];
        assert_eq!(video.content_type, "application/octet-stream");
        assert_eq!(video.filename, "event_1.mp4");
        assert_eq!(video.bytes, b"clip-bytes");
    }

    #[test]
    fn sampling_is_evenly_spaced() {
        let frames: Vec<Frame> = (0..10u8).map(|i| solid_frame(2, 2, [i, 0, 0])).collect();
        let picked = representative_frames(&frames, 2);
        assert_eq!(picked.len(), 2);
        assert_eq!(picked[0].pixel(0, 0)[0], 0);
        assert_eq!(picked[1].pixel(0, 0)[0], 5);
    }

    #[test]
    fn mime_rendering_is_structurally_sound() {
        let message = AlertMessage {
            from: "sentry@localhost".to_string(),
            to: "owner@example.com".to_string(),
            subject: "Motion Detection Alert Snapshot".to_string(),
            body: "hello".to_string(),
            attachments: vec![Attachment {
                filename: "event_1.jpg".to_string(),
                content_type: "image/jpeg",
                bytes: vec![0xFF, 0xD8, 0xFF, 0xD9],
            }],
        };
        let mime = String::from_utf8(message.to_mime()).unwrap();
        assert!(mime.contains("Subject: Motion Detection Alert Snapshot"));
        assert!(mime.contains("multipart/mixed"));
        assert!(mime.contains("Content-Transfer-Encoding: base64"));
        assert!(mime.contains(&BASE64.encode([0xFFu8, 0xD8, 0xFF, 0xD9])));
        assert!(mime.ends_with(&format!("--{}--\r\n", MIME_BOUNDARY)));
    }

    #[test]
    fn gate_enforces_the_alert_interval() {
        let interval = Duration::from_secs(30);
        let t0 = Instant::now();

        // Two motion events one second apart: one firing.
        let mut gate = AlertGate::new(interval);
        assert!(gate.should_fire(t0));
        assert!(!gate.should_fire(t0 + Duration::from_secs(1)));

        // Spaced past the interval: two firings.
        let mut gate = AlertGate::new(interval);
        assert!(gate.should_fire(t0));
        assert!(gate.should_fire(t0 + Duration::from_secs(31)));
    }
}
