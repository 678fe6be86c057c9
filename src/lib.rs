//! sentry-engine
//!
//! This crate implements the real-time engine behind a camera-monitoring
//! product: it continuously reads frames from a camera device, detects
//! motion, opportunistically recognizes known faces, classifies moving
//! objects, assembles rolling video clips, and raises rate-limited alerts,
//! all while keeping the live JPEG preview stream responsive.
//!
//! # Architecture
//!
//! One [`CameraPipeline`] per camera device, fully independent of its
//! siblings, owned by a [`PipelineRegistry`]. Each pipeline runs:
//!
//! - a dedicated capture thread filling a single latest-frame slot,
//! - a background recognition worker draining a bounded queue,
//! - a recurring clip-assembly timer driving an external encoder process,
//! - short-lived dispatch threads so slow mail transport never blocks
//!   frame serving.
//!
//! All cross-thread state sits behind one coarse mutex per pipeline;
//! critical sections are copy-in/copy-out only.
//!
//! # Module Structure
//!
//! - `capture`: camera frame sources (V4L2 devices, synthetic stubs)
//! - `detect`: motion detection, face matching, object classification
//! - `frame`: frame types and bounded buffers
//! - `clip`: encoder-process clip assembly
//! - `alert`: rate-limited multi-channel alert dispatch
//! - `audio`: audio capture with volume-threshold events
//! - `repository` / `dashboard`: persistence and remote-log collaborators

use chrono::{DateTime, Local};

pub mod alert;
pub mod audio;
pub mod capture;
pub mod clip;
pub mod config;
pub mod dashboard;
pub mod detect;
pub mod error;
pub mod frame;
pub mod overlay;
pub mod pipeline;
pub mod repository;

pub use alert::{
    AlertGate, AlertMessage, AlertNotifier, InMemoryTransport, MailTransport, SendmailTransport,
};
pub use audio::{AudioConfig, AudioSource};
pub use capture::{CameraConfig, CameraSource};
pub use clip::{ClipArtifact, ClipAssembler, ClipConfig};
pub use config::EngineConfig;
pub use dashboard::DashboardClient;
pub use detect::{
    BackendRegistry, Classification, Classifier, DetectedFace, FaceBackend, FaceMatcher,
    FaceRegion, Gallery, MotionDetector, MotionEvent, ObjectClassifier,
};
pub use error::{ClipAssemblyError, EngineError};
pub use frame::{BoundedFrameQueue, BoundingBox, Frame};
pub use pipeline::{CameraPipeline, PipelineDeps, PipelineRegistry};
pub use repository::{InMemoryRepository, Repository, SqliteRepository};

/// Wall-clock timestamp for log lines and overlays ("2026-08-06 14:03:21").
pub fn log_stamp(at: DateTime<Local>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Filesystem-safe timestamp for artifact names ("20260806_140321").
pub fn file_stamp(at: DateTime<Local>) -> String {
    at.format("%Y%m%d_%H%M%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn stamps_are_stable() {
        let at = Local.with_ymd_and_hms(2026, 8, 6, 14, 3, 21).unwrap();
        assert_eq!(log_stamp(at), "2026-08-06 14:03:21");
        assert_eq!(file_stamp(at), "20260806_140321");
    }
}
