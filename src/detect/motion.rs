//! Frame-differencing motion detector.
//!
//! The detector keeps a rolling greyscale reference of the previous
//! processed frame (not a fixed background model). Each processed call:
//!
//! 1. converts the frame to greyscale and applies a 21x21 smoothing blur
//!    to suppress sensor noise,
//! 2. takes the absolute difference against the stored reference and
//!    replaces the reference with the new frame,
//! 3. thresholds the difference into a binary mask and dilates it to merge
//!    fragmented regions,
//! 4. scans for connected regions in row-major order and reports the
//!    bounding box of the first one whose pixel area clears the floor.
//!
//! Only one region is reported per call even when several exist. Frames
//! must be well-formed; the detector never fails on valid input.

use crate::frame::{BoundingBox, Frame};

/// Per-frame motion verdict.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MotionEvent {
    pub detected: bool,
    /// Valid only when `detected`.
    pub region: Option<BoundingBox>,
}

impl MotionEvent {
    pub fn none() -> Self {
        Self {
            detected: false,
            region: None,
        }
    }

    fn at(region: BoundingBox) -> Self {
        Self {
            detected: true,
            region: Some(region),
        }
    }
}

/// Tunables for [`MotionDetector`].
#[derive(Clone, Debug)]
pub struct MotionConfig {
    /// Binary cutoff applied to the blurred difference image.
    pub threshold: u8,
    /// Minimum connected-region pixel area that counts as motion.
    pub min_area: u32,
    /// Process every Nth call; skipped calls report no motion and leave
    /// the reference frame untouched. 1 processes everything.
    pub frame_skip: u32,
    /// Blur window half-width (10 gives the 21x21 smoothing window).
    pub blur_radius: u32,
    /// 3x3 dilation passes over the thresholded mask.
    pub dilate_iterations: u32,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            threshold: 25,
            min_area: 500,
            frame_skip: 1,
            blur_radius: 10,
            dilate_iterations: 2,
        }
    }
}

impl From<&crate::config::MotionSettings> for MotionConfig {
    fn from(settings: &crate::config::MotionSettings) -> Self {
        Self {
            threshold: settings.threshold,
            min_area: settings.min_area,
            frame_skip: settings.frame_skip,
            ..Self::default()
        }
    }
}

struct GrayFrame {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

/// Stateful frame-differencing motion detector.
pub struct MotionDetector {
    config: MotionConfig,
    reference: Option<GrayFrame>,
    calls: u64,
}

impl MotionDetector {
    pub fn new(config: MotionConfig) -> Self {
        Self {
            config,
            reference: None,
            calls: 0,
        }
    }

    /// Run detection on one frame. See the module docs for the algorithm.
    pub fn detect(&mut self, frame: &Frame) -> MotionEvent {
        self.calls += 1;
        if self.config.frame_skip > 1 && self.calls % self.config.frame_skip as u64 != 0 {
            return MotionEvent::none();
        }

        let gray = blur(&to_gray(frame), self.config.blur_radius);

        let reference = match self.reference.take() {
            Some(prev) if prev.width == gray.width && prev.height == gray.height => prev,
            // First processed call (or a resolution change): the new frame
            // becomes the reference and nothing can be compared yet.
            _ => {
                self.reference = Some(gray);
                return MotionEvent::none();
            }
        };

        let mut mask = difference_mask(&reference, &gray, self.config.threshold);
        self.reference = Some(gray);

        for _ in 0..self.config.dilate_iterations {
            dilate(&mut mask);
        }

        match first_region_over(&mut mask, self.config.min_area) {
            Some(region) => MotionEvent::at(region),
            None => MotionEvent::none(),
        }
    }
}

fn to_gray(frame: &Frame) -> GrayFrame {
    let data = frame
        .data()
        .chunks_exact(3)
        .map(|px| {
            // BT.601 luma over BGR channel order.
            let b = px[0] as u32;
            let g = px[1] as u32;
            let r = px[2] as u32;
            ((299 * r + 587 * g + 114 * b) / 1000) as u8
        })
        .collect();
    GrayFrame {
        data,
        width: frame.width(),
        height: frame.height(),
    }
}

/// Separable mean blur with a (2r+1)-wide window, clamped at the edges.
fn blur(gray: &GrayFrame, radius: u32) -> GrayFrame {
    if radius == 0 {
        return GrayFrame {
            data: gray.data.clone(),
            width: gray.width,
            height: gray.height,
        };
    }
    let horizontal = blur_axis(&gray.data, gray.width as usize, gray.height as usize, radius, true);
    let data = blur_axis(&horizontal, gray.width as usize, gray.height as usize, radius, false);
    GrayFrame {
        data,
        width: gray.width,
        height: gray.height,
    }
}

fn blur_axis(src: &[u8], width: usize, height: usize, radius: u32, horizontal: bool) -> Vec<u8> {
    let r = radius as isize;
    let (lanes, lane_len) = if horizontal {
        (height, width)
    } else {
        (width, height)
    };
    let mut out = vec![0u8; src.len()];

    let index = |lane: usize, pos: usize| {
        if horizontal {
            lane * width + pos
        } else {
            pos * width + lane
        }
    };

    for lane in 0..lanes {
        let mut sum: u32 = 0;
        let mut count: u32 = 0;
        let initial = (lane_len as isize).min(r + 1);
        for pos in 0..initial {
            sum += src[index(lane, pos as usize)] as u32;
            count += 1;
        }
        for pos in 0..lane_len {
            out[index(lane, pos)] = (sum / count) as u8;

            let incoming = pos as isize + r + 1;
            if incoming < lane_len as isize {
                sum += src[index(lane, incoming as usize)] as u32;
                count += 1;
            }
            let outgoing = pos as isize - r;
            if outgoing >= 0 {
                sum -= src[index(lane, outgoing as usize)] as u32;
                count -= 1;
            }
        }
    }

    out
}

fn difference_mask(a: &GrayFrame, b: &GrayFrame, threshold: u8) -> Mask {
    let data = a
        .data
        .iter()
        .zip(&b.data)
        .map(|(&x, &y)| u8::from(x.abs_diff(y) > threshold))
        .collect();
    Mask {
        data,
        width: b.width as usize,
        height: b.height as usize,
    }
}

struct Mask {
    data: Vec<u8>,
    width: usize,
    height: usize,
}

/// One 3x3 binary dilation pass.
fn dilate(mask: &mut Mask) {
    let src = mask.data.clone();
    for y in 0..mask.height {
        for x in 0..mask.width {
            if src[y * mask.width + x] != 0 {
                continue;
            }
            let y0 = y.saturating_sub(1);
            let y1 = (y + 1).min(mask.height - 1);
            let x0 = x.saturating_sub(1);
            let x1 = (x + 1).min(mask.width - 1);
            'probe: for ny in y0..=y1 {
                for nx in x0..=x1 {
                    if src[ny * mask.width + nx] != 0 {
                        mask.data[y * mask.width + x] = 1;
                        break 'probe;
                    }
                }
            }
        }
    }
}

/// Row-major scan for the first connected region whose pixel area clears
/// `min_area`. Consumed pixels are zeroed so each region is visited once.
fn first_region_over(mask: &mut Mask, min_area: u32) -> Option<BoundingBox> {
    let width = mask.width;
    let height = mask.height;
    let mut stack = Vec::new();

    for start in 0..mask.data.len() {
        if mask.data[start] == 0 {
            continue;
        }

        let mut area: u32 = 0;
        let (mut min_x, mut min_y) = (width, height);
        let (mut max_x, mut max_y) = (0usize, 0usize);

        stack.clear();
        stack.push(start);
        mask.data[start] = 0;

        while let Some(idx) = stack.pop() {
            let x = idx % width;
            let y = idx / width;
            area += 1;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);

            let y0 = y.saturating_sub(1);
            let y1 = (y + 1).min(height - 1);
            let x0 = x.saturating_sub(1);
            let x1 = (x + 1).min(width - 1);
            for ny in y0..=y1 {
                for nx in x0..=x1 {
                    let nidx = ny * width + nx;
                    if mask.data[nidx] != 0 {
                        mask.data[nidx] = 0;
                        stack.push(nidx);
                    }
                }
            }
        }

        if area >= min_area {
            return Some(BoundingBox::new(
                min_x as i32,
                min_y as i32,
                (max_x - min_x + 1) as u32,
                (max_y - min_y + 1) as u32,
            ));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::solid_frame;
    use chrono::Local;

    fn frame_with_block(
        width: u32,
        height: u32,
        background: u8,
        block: u8,
        x0: u32,
        y0: u32,
        side: u32,
    ) -> Frame {
        let mut data = vec![background; (width * height * 3) as usize];
        for y in y0..(y0 + side) {
            for x in x0..(x0 + side) {
                let idx = ((y * width + x) * 3) as usize;
                data[idx] = block;
                data[idx + 1] = block;
                data[idx + 2] = block;
            }
        }
        Frame::new(data, width, height, Local::now())
    }

    #[test]
    fn first_call_stores_reference_and_reports_nothing() {
        let mut detector = MotionDetector::new(MotionConfig::default());
        let event = detector.detect(&solid_frame(64, 64, [20, 20, 20]));
        assert!(!event.detected);
        assert!(event.region.is_none());
    }

    #[test]
    fn identical_consecutive_frames_are_idle() {
        let mut detector = MotionDetector::new(MotionConfig::default());
        let frame = solid_frame(64, 64, [90, 90, 90]);
        detector.detect(&frame);
        let event = detector.detect(&frame);
        assert!(!event.detected);
    }

    #[test]
    fn regions_below_the_area_floor_are_ignored() {
        // Blur disabled so region sizes are exact: a 10x10 change grows to
        // 14x14 = 196 px after two dilations, still under the 500 floor.
        let config = MotionConfig {
            blur_radius: 0,
            ..MotionConfig::default()
        };
        let mut detector = MotionDetector::new(config);

        detector.detect(&solid_frame(128, 128, [20, 20, 20]));
        let small = frame_with_block(128, 128, 20, 220, 50, 50, 10);
        assert!(!detector.detect(&small).detected);

        // A 30x30 change (34x34 = 1156 px dilated) clears the floor.
        let large = frame_with_block(128, 128, 20, 220, 50, 50, 30);
        let event = detector.detect(&large);
        assert!(event.detected);
    }

    #[test]
    fn skipped_calls_leave_the_reference_untouched() {
        let config = MotionConfig {
            frame_skip: 2,
            ..MotionConfig::default()
        };
        let mut detector = MotionDetector::new(config);
        let quiet = solid_frame(96, 96, [20, 20, 20]);
        let busy = frame_with_block(96, 96, 20, 220, 20, 20, 40);

        // Call 1 is skipped, call 2 stores the reference.
        assert!(!detector.detect(&quiet).detected);
        assert!(!detector.detect(&quiet).detected);
        // Call 3 is skipped even though the scene changed.
        assert!(!detector.detect(&busy).detected);
        // Call 4 compares against the call-2 reference and fires.
        assert!(detector.detect(&busy).detected);
    }

    #[test]
    fn sharp_regional_change_is_boxed_near_its_location() {
        let mut detector = MotionDetector::new(MotionConfig::default());

        // 50x50 change centered at (100, 100): rows/cols [75, 125).
        let background = solid_frame(320, 240, [20, 20, 20]);
        let changed = frame_with_block(320, 240, 20, 220, 75, 75, 50);

        assert!(!detector.detect(&background).detected);

        let appear = detector.detect(&changed);
        assert!(appear.detected);
        let region = appear.region.expect("motion region");
        assert!(region.x <= 75 && region.x >= 50, "x = {}", region.x);
        assert!(region.y <= 75 && region.y >= 50, "y = {}", region.y);
        assert!(region.x + region.width as i32 >= 125);
        assert!(region.x + region.width as i32 <= 150);
        assert!(region.y + region.height as i32 >= 125);
        assert!(region.y + region.height as i32 <= 150);

        // The reference rolls forward, so reverting the scene is itself a
        // sharp change and registers motion in the same region.
        let revert = detector.detect(&background);
        assert!(revert.detected);

        // With the scene settled, the next frame is idle again.
        assert!(!detector.detect(&background).detected);
    }
}
