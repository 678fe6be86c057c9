//! Frame types and shared buffers.
//!
//! - `Frame`: immutable-once-produced BGR24 pixel buffer plus capture time.
//!   Produced by the capture loop and *copied* into every downstream buffer
//!   so no consumer ever observes a torn write.
//! - `BoundedFrameQueue`: capped FIFO used for the recognition queue and
//!   the alert snapshot buffer. Overflow evicts the oldest entry, trading
//!   completeness for bounded memory and staleness.
//!
//! The running buffer for clip assembly is a plain `Vec<Frame>` inside the
//! pipeline's shared state; it is unbounded within a clip window and
//! swapped wholesale at each clip tick.

use std::collections::VecDeque;

use chrono::{DateTime, Local};

/// Axis-aligned region within a frame. `x`/`y` are signed because detector
/// backends can report boxes that start above or left of the frame edge;
/// consumers clamp before cropping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// True when the box lies entirely inside a `width`x`height` frame.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.x >= 0
            && self.y >= 0
            && (self.x as i64 + self.width as i64) <= width as i64
            && (self.y as i64 + self.height as i64) <= height as i64
    }

    /// Scale all coordinates by an integer factor (used to map boxes found
    /// on a downscaled detection frame back to full resolution).
    pub fn scaled(&self, factor: u32) -> Self {
        Self {
            x: self.x * factor as i32,
            y: self.y * factor as i32,
            width: self.width * factor,
            height: self.height * factor,
        }
    }
}

/// A single captured video frame: packed BGR24 rows plus capture time.
#[derive(Clone, Debug)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    captured_at: DateTime<Local>,
}

impl Frame {
    /// Wrap raw BGR24 bytes. Callers must supply exactly
    /// `width * height * 3` bytes; anything else is a programming error on
    /// the capture side, not a recoverable condition.
    pub fn new(data: Vec<u8>, width: u32, height: u32, captured_at: DateTime<Local>) -> Self {
        debug_assert_eq!(data.len(), (width * height * 3) as usize);
        Self {
            data,
            width,
            height,
            captured_at,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn captured_at(&self) -> DateTime<Local> {
        self.captured_at
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// BGR triple at (x, y). Caller guarantees bounds.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let idx = ((y * self.width + x) * 3) as usize;
        [self.data[idx], self.data[idx + 1], self.data[idx + 2]]
    }

    /// Nearest-neighbor resize. Used by the capture loop to normalize
    /// device output and by the face matcher for half-resolution detection.
    pub fn resized(&self, width: u32, height: u32) -> Frame {
        if width == self.width && height == self.height {
            return self.clone();
        }
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            let src_y = (y as u64 * self.height as u64 / height as u64) as u32;
            for x in 0..width {
                let src_x = (x as u64 * self.width as u64 / width as u64) as u32;
                let px = self.pixel(src_x, src_y);
                data.extend_from_slice(&px);
            }
        }
        Frame::new(data, width, height, self.captured_at)
    }

    /// Copy out a sub-region. The box must fit within the frame.
    pub fn cropped(&self, region: &BoundingBox) -> Frame {
        debug_assert!(region.fits_within(self.width, self.height));
        let mut data = Vec::with_capacity((region.width * region.height * 3) as usize);
        for y in 0..region.height {
            let src_y = region.y as u32 + y;
            let start = ((src_y * self.width + region.x as u32) * 3) as usize;
            let end = start + (region.width * 3) as usize;
            data.extend_from_slice(&self.data[start..end]);
        }
        Frame::new(data, region.width, region.height, self.captured_at)
    }
}

/// Bounded FIFO of frames. Pushing past capacity evicts the oldest entry.
pub struct BoundedFrameQueue {
    buf: VecDeque<Frame>,
    cap: usize,
}

impl BoundedFrameQueue {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(cap),
            cap: cap.max(1),
        }
    }

    /// Append a frame, evicting the oldest when full.
    pub fn push(&mut self, frame: Frame) {
        while self.buf.len() >= self.cap {
            self.buf.pop_front();
        }
        self.buf.push_back(frame);
    }

    /// Remove and return the oldest frame.
    pub fn pop_oldest(&mut self) -> Option<Frame> {
        self.buf.pop_front()
    }

    /// Clone the current contents, oldest first. Callers take this snapshot
    /// under the pipeline lock and do their processing outside it.
    pub fn snapshot(&self) -> Vec<Frame> {
        self.buf.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }
}

/// Uniform-color frame for tests across the crate.
#[cfg(test)]
pub(crate) fn solid_frame(width: u32, height: u32, bgr: [u8; 3]) -> Frame {
    let mut data = Vec::with_capacity((width * height * 3) as usize);
    for _ in 0..(width * height) {
        data.extend_from_slice(&bgr);
    }
    Frame::new(data, width, height, Local::now())
}
