use anyhow::Result;

use crate::frame::BoundingBox;

/// A face region proposed by a detection backend, in the coordinate space
/// of the pixels it was given.
#[derive(Clone, Debug)]
pub struct FaceRegion {
    pub region: BoundingBox,
    pub confidence: f32,
}

/// A single object-classification prediction.
#[derive(Clone, Debug)]
pub struct Classification {
    pub label: String,
    pub confidence: f32,
}

/// Face detection + feature extraction capability.
///
/// Backends are opaque scoring functions: pixels in, regions and feature
/// vectors out. Model choice is a configuration-time strategy selected by
/// name from the [`super::BackendRegistry`]; swapping backends must never
/// require touching pipeline logic.
///
/// Implementations must treat pixel slices as read-only and ephemeral.
pub trait FaceBackend: Send {
    /// Backend identifier used for registry lookup.
    fn name(&self) -> &'static str;

    /// Propose face regions within a BGR24 buffer.
    fn detect_regions(&mut self, pixels: &[u8], width: u32, height: u32)
        -> Result<Vec<FaceRegion>>;

    /// Side length of the square BGR24 crop `extract_features` expects.
    fn input_size(&self) -> u32;

    /// Compute a feature vector from a normalized face crop of
    /// `input_size` x `input_size` pixels.
    fn extract_features(&mut self, crop: &[u8], side: u32) -> Result<Vec<f32>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Object classification capability.
pub trait Classifier: Send {
    /// Backend identifier used for registry lookup.
    fn name(&self) -> &'static str;

    /// Score object labels for a BGR24 buffer. An empty result means no
    /// confident prediction for this frame.
    fn classify(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Classification>>;
}
