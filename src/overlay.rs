//! Preview-frame annotation.
//!
//! Draws the motion/face boxes, their labels, and the wall-clock timestamp
//! onto a BGR frame, then encodes the result as JPEG for the live stream.
//! Text uses a built-in 5x7 glyph set (uppercase, digits, and the
//! punctuation timestamps need); characters outside the set advance the
//! cursor without drawing.

use anyhow::Result;
use chrono::{DateTime, Local};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use crate::frame::{BoundingBox, Frame};

pub const MOTION_COLOR: [u8; 3] = [0, 0, 255]; // red in BGR
pub const FACE_COLOR: [u8; 3] = [0, 255, 0]; // green
pub const TIMESTAMP_COLOR: [u8; 3] = [255, 255, 255];

const GLYPH_WIDTH: usize = 5;
const GLYPH_HEIGHT: usize = 7;
const GLYPH_ADVANCE: i32 = 6;
const JPEG_QUALITY: u8 = 80;

/// Draw a one-pixel rectangle outline, clipped to the frame.
pub fn draw_box(frame: &mut Frame, region: &BoundingBox, color: [u8; 3]) {
    let x0 = region.x;
    let y0 = region.y;
    let x1 = region.x + region.width as i32 - 1;
    let y1 = region.y + region.height as i32 - 1;

    for x in x0..=x1 {
        put_pixel(frame, x, y0, color);
        put_pixel(frame, x, y1, color);
    }
    for y in y0..=y1 {
        put_pixel(frame, x0, y, color);
        put_pixel(frame, x1, y, color);
    }
}

/// Draw a text line with its top-left corner at (x, y). Lowercase input is
/// rendered with the uppercase glyphs.
pub fn draw_label(frame: &mut Frame, x: i32, y: i32, text: &str, color: [u8; 3]) {
    let mut cursor = x;
    for ch in text.chars() {
        if let Some(glyph) = glyph_for(ch.to_ascii_uppercase()) {
            for (col, bits) in glyph.iter().enumerate() {
                for row in 0..GLYPH_HEIGHT {
                    if bits & (1 << row) != 0 {
                        put_pixel(frame, cursor + col as i32, y + row as i32, color);
                    }
                }
            }
        }
        cursor += GLYPH_ADVANCE;
    }
}

/// Timestamp line in the bottom-left corner.
pub fn draw_timestamp(frame: &mut Frame, at: DateTime<Local>) {
    let text = crate::log_stamp(at);
    let y = frame.height() as i32 - GLYPH_HEIGHT as i32 - 3;
    draw_label(frame, 10, y, &text, TIMESTAMP_COLOR);
}

/// Encode a BGR frame as JPEG.
pub fn encode_jpeg(frame: &Frame) -> Result<Vec<u8>> {
    let mut rgb = Vec::with_capacity(frame.data().len());
    for px in frame.data().chunks_exact(3) {
        rgb.extend_from_slice(&[px[2], px[1], px[0]]);
    }

    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
    encoder.encode(&rgb, frame.width(), frame.height(), ExtendedColorType::Rgb8)?;
    Ok(out)
}

fn put_pixel(frame: &mut Frame, x: i32, y: i32, color: [u8; 3]) {
    if x < 0 || y < 0 || x >= frame.width() as i32 || y >= frame.height() as i32 {
        return;
    }
    let width = frame.width();
    let idx = ((y as u32 * width + x as u32) * 3) as usize;
    frame.data_mut()[idx..idx + 3].copy_from_slice(&color);
}

/// Column-major 5x7 glyphs, bit 0 at the top row.
fn glyph_for(ch: char) -> Option<[u8; GLYPH_WIDTH]> {
    let glyph = match ch {
        ' ' => [0x00, 0x00, 0x00, 0x00, 0x00],
        '-' => [0x08, 0x08, 0x08, 0x08, 0x08],
        '.' => [0x00, 0x60, 0x60, 0x00, 0x00],
        '/' => [0x20, 0x10, 0x08, 0x04, 0x02],
        ':' => [0x00, 0x36, 0x36, 0x00, 0x00],
        '_' => [0x40, 0x40, 0x40, 0x40, 0x40],
        '0' => [0x3E, 0x51, 0x49, 0x45, 0x3E],
        '1' => [0x00, 0x42, 0x7F, 0x40, 0x00],
        '2' => [0x42, 0x61, 0x51, 0x49, 0x46],
        '3' => [0x21, 0x41, 0x45, 0x4B, 0x31],
        '4' => [0x18, 0x14, 0x12, 0x7F, 0x10],
        '5' => [0x27, 0x45, 0x45, 0x45, 0x39],
        '6' => [0x3C, 0x4A, 0x49, 0x49, 0x30],
        '7' => [0x01, 0x71, 0x09, 0x05, 0x03],
        '8' => [0x36, 0x49, 0x49, 0x49, 0x36],
        '9' => [0x06, 0x49, 0x49, 0x29, 0x1E],
        'A' => [0x7E, 0x11, 0x11, 0x11, 0x7E],
        'B' => [0x7F, 0x49, 0x49, 0x49, 0x36],
        'C' => [0x3E, 0x41, 0x41, 0x41, 0x22],
        'D' => [0x7F, 0x41, 0x41, 0x22, 0x1C],
        'E' => [0x7F, 0x49, 0x49, 0x49, 0x41],
        'F' => [0x7F, 0x09, 0x09, 0x09, 0x01],
        'G' => [0x3E, 0x41, 0x49, 0x49, 0x7A],
        'H' => [0x7F, 0x08, 0x08, 0x08, 0x7F],
        'I' => [0x00, 0x41, 0x7F, 0x41, 0x00],
        'J' => [0x20, 0x40, 0x41, 0x3F, 0x01],
        'K' => [0x7F, 0x08, 0x14, 0x22, 0x41],
        'L' => [0x7F, 0x40, 0x40, 0x40, 0x40],
        'M' => [0x7F, 0x02, 0x0C, 0x02, 0x7F],
        'N' => [0x7F, 0x04, 0x08, 0x10, 0x7F],
        'O' => [0x3E, 0x41, 0x41, 0x41, 0x3E],
        'P' => [0x7F, 0x09, 0x09, 0x09, 0x06],
        'Q' => [0x3E, 0x41, 0x51, 0x21, 0x5E],
        'R' => [0x7F, 0x09, 0x19, 0x29, 0x46],
        'S' => [0x46, 0x49, 0x49, 0x49, 0x31],
        'T' => [0x01, 0x01, 0x7F, 0x01, 0x01],
        'U' => [0x3F, 0x40, 0x40, 0x40, 0x3F],
        'V' => [0x1F, 0x20, 0x40, 0x20, 0x1F],
        'W' => [0x3F, 0x40, 0x38, 0x40, 0x3F],
        'X' => [0x63, 0x14, 0x08, 0x14, 0x63],
        'Y' => [0x07, 0x08, 0x70, 0x08, 0x07],
        'Z' => [0x61, 0x51, 0x49, 0x45, 0x43],
        _ => return None,
    };
    Some(glyph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::solid_frame;

    #[test]
    fn box_outline_lands_on_the_border_pixels() {
        let mut frame = solid_frame(32, 32, [0, 0, 0]);
        draw_box(&mut frame, &BoundingBox::new(4, 4, 10, 10), MOTION_COLOR);

        assert_eq!(frame.pixel(4, 4), MOTION_COLOR);
        assert_eq!(frame.pixel(13, 4), MOTION_COLOR);
        assert_eq!(frame.pixel(4, 13), MOTION_COLOR);
        assert_eq!(frame.pixel(13, 13), MOTION_COLOR);
        // Interior stays untouched.
        assert_eq!(frame.pixel(8, 8), [0, 0, 0]);
    }

    #[test]
    fn boxes_are_clipped_at_frame_edges() {
        let mut frame = solid_frame(16, 16, [0, 0, 0]);
        draw_box(&mut frame, &BoundingBox::new(-4, -4, 30, 30), FACE_COLOR);
        assert_eq!(frame.pixel(0, 0), [0, 0, 0]);
    }

    #[test]
    fn labels_paint_some_pixels() {
        let mut frame = solid_frame(64, 16, [0, 0, 0]);
        draw_label(&mut frame, 2, 2, "A1", TIMESTAMP_COLOR);
        let painted = frame
            .data()
            .chunks_exact(3)
            .filter(|px| px[0] == 255)
            .count();
        assert!(painted > 10);
    }

    #[test]
    fn jpeg_output_carries_the_magic_bytes() {
        let frame = solid_frame(32, 24, [10, 20, 30]);
        let jpeg = encode_jpeg(&frame).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
    }
}
