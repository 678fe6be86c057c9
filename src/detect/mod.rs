mod backend;
mod backends;
mod classify;
mod face;
mod motion;
mod registry;

pub use backend::{Classification, Classifier, FaceBackend, FaceRegion};
pub use backends::{StubClassifier, StubFaceBackend};
pub use classify::{ObjectClassifier, UNCLASSIFIED_LABEL};
pub use face::{DetectedFace, FaceMatcher, Gallery, GalleryEntry, UNKNOWN_LABEL};
pub use motion::{MotionConfig, MotionDetector, MotionEvent};
pub use registry::BackendRegistry;

#[cfg(feature = "backend-tract")]
pub use backends::TractClassifier;
