use anyhow::Result;

use crate::detect::backend::{Classification, Classifier, FaceBackend, FaceRegion};
use crate::frame::BoundingBox;

const STUB_FACE_INPUT: u32 = 64;
const STUB_FEATURE_LEN: usize = 128;
const STUB_BRIGHT_CELL: u32 = 180;

/// Stub face backend for testing and hardware-free runs.
///
/// "Faces" are bright square regions: the frame is scanned as a coarse
/// grid and any cell whose mean luminance clears a cutoff is reported,
/// with confidence proportional to brightness. Features are a 128-bin
/// block-luminance signature of the crop, so visually similar crops land
/// close together in feature space.
pub struct StubFaceBackend;

impl StubFaceBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for StubFaceBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn luma(px: &[u8]) -> u32 {
    // BT.601 over BGR.
    (299 * px[2] as u32 + 587 * px[1] as u32 + 114 * px[0] as u32) / 1000
}

impl FaceBackend for StubFaceBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect_regions(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<FaceRegion>> {
        let cell = (width.min(height) / 4).max(8);
        let mut regions = Vec::new();

        let mut cy = 0;
        while cy + cell <= height {
            let mut cx = 0;
            while cx + cell <= width {
                let mut sum: u64 = 0;
                for y in cy..(cy + cell) {
                    for x in cx..(cx + cell) {
                        let idx = ((y * width + x) * 3) as usize;
                        sum += luma(&pixels[idx..idx + 3]) as u64;
                    }
                }
                let mean = (sum / (cell as u64 * cell as u64)) as u32;
                if mean >= STUB_BRIGHT_CELL {
                    regions.push(FaceRegion {
                        region: BoundingBox::new(cx as i32, cy as i32, cell, cell),
                        confidence: (mean.min(255) as f32) / 255.0,
                    });
                }
                cx += cell;
            }
            cy += cell;
        }

        Ok(regions)
    }

    fn input_size(&self) -> u32 {
        STUB_FACE_INPUT
    }

    fn extract_features(&mut self, crop: &[u8], side: u32) -> Result<Vec<f32>> {
        // 8x16 grid over the crop, mean luminance per cell, normalized.
        let cols = 8u32;
        let rows = (STUB_FEATURE_LEN as u32) / cols;
        let cell_w = (side / cols).max(1);
        let cell_h = (side / rows).max(1);

        let mut features = Vec::with_capacity(STUB_FEATURE_LEN);
        for row in 0..rows {
            for col in 0..cols {
                let mut sum: u64 = 0;
                let mut count: u64 = 0;
                for y in (row * cell_h)..((row + 1) * cell_h).min(side) {
                    for x in (col * cell_w)..((col + 1) * cell_w).min(side) {
                        let idx = ((y * side + x) * 3) as usize;
                        if idx + 2 < crop.len() {
                            sum += luma(&crop[idx..idx + 3]) as u64;
                            count += 1;
                        }
                    }
                }
                let mean = if count > 0 { sum / count } else { 0 };
                features.push(mean as f32 / 255.0);
            }
        }

        Ok(features)
    }
}

/// Stub object classifier: reports a generic "object" when the frame shows
/// enough luminance variance to suggest structure, nothing otherwise.
pub struct StubClassifier {
    variance_cutoff: f32,
}

impl StubClassifier {
    pub fn new() -> Self {
        Self {
            variance_cutoff: 400.0,
        }
    }
}

impl Default for StubClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier for StubClassifier {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn classify(&mut self, pixels: &[u8], _width: u32, _height: u32) -> Result<Vec<Classification>> {
        let count = (pixels.len() / 3).max(1) as f32;
        let mut sum = 0.0f32;
        for px in pixels.chunks_exact(3) {
            sum += luma(px) as f32;
        }
        let mean = sum / count;

        let mut variance = 0.0f32;
        for px in pixels.chunks_exact(3) {
            let d = luma(px) as f32 - mean;
            variance += d * d;
        }
        variance /= count;

        if variance >= self.variance_cutoff {
            Ok(vec![Classification {
                label: "object".to_string(),
                confidence: (variance / (self.variance_cutoff * 4.0)).min(1.0),
            }])
        } else {
            Ok(Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(width: u32, height: u32, value: u8) -> Vec<u8> {
        vec![value; (width * height * 3) as usize]
    }

    #[test]
    fn bright_block_is_detected_as_region() {
        let mut backend = StubFaceBackend::new();
        let width = 64u32;
        let height = 64u32;
        let mut pixels = flat(width, height, 20);
        // Fill the top-left 16x16 cell with bright pixels.
        for y in 0..16u32 {
            for x in 0..16u32 {
                let idx = ((y * width + x) * 3) as usize;
                pixels[idx] = 250;
                pixels[idx + 1] = 250;
                pixels[idx + 2] = 250;
            }
        }

        let regions = backend.detect_regions(&pixels, width, height).unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].region.x, 0);
        assert_eq!(regions[0].region.y, 0);
        assert!(regions[0].confidence > 0.9);
    }

    #[test]
    fn dark_scene_has_no_regions() {
        let mut backend = StubFaceBackend::new();
        let pixels = flat(64, 64, 20);
        assert!(backend.detect_regions(&pixels, 64, 64).unwrap().is_empty());
    }

    #[test]
    fn features_separate_dark_from_bright_crops() {
        let mut backend = StubFaceBackend::new();
        let side = backend.input_size();
        let dark = backend.extract_features(&flat(side, side, 10), side).unwrap();
        let bright = backend
            .extract_features(&flat(side, side, 240), side)
            .unwrap();

        assert_eq!(dark.len(), 128);
        assert_eq!(bright.len(), 128);
        let dist: f32 = dark
            .iter()
            .zip(&bright)
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            .sqrt();
        assert!(dist > 5.0);

        // Same crop twice: identical features.
        let again = backend.extract_features(&flat(side, side, 10), side).unwrap();
        assert_eq!(dark, again);
    }

    #[test]
    fn classifier_reports_structure_only() {
        let mut classifier = StubClassifier::new();
        assert!(classifier.classify(&flat(32, 32, 50), 32, 32).unwrap().is_empty());

        let mut structured = flat(32, 32, 0);
        for (i, b) in structured.iter_mut().enumerate() {
            if (i / 96) % 2 == 0 {
                *b = 255;
            }
        }
        let predictions = classifier.classify(&structured, 32, 32).unwrap();
        assert_eq!(predictions.len(), 1);
        assert_eq!(predictions[0].label, "object");
    }
}
