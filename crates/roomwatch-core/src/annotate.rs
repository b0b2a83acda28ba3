//! Box overlays for the preview frame.

use image::{Rgb, RgbImage};

use crate::types::{BoundingBox, MatchResult};

pub const KNOWN_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const INTRUDER_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

const OUTLINE: u32 = 2;
const LABEL_STRIP: u32 = 20;

/// Copy of `frame` with a box around every matched face: green for known
/// people, red for intruders, with a filled strip along the bottom edge.
pub fn annotate(frame: &RgbImage, results: &[MatchResult]) -> RgbImage {
    let mut out = frame.clone();
    for result in results {
        let color = if result.is_intruder() {
            INTRUDER_COLOR
        } else {
            KNOWN_COLOR
        };
        draw_box(&mut out, &result.detection.bbox, color);
    }
    out
}

/// Pixel rectangle `[left, right) x [top, bottom)` clipped to the image.
fn clip(image: &RgbImage, bbox: &BoundingBox) -> Option<(u32, u32, u32, u32)> {
    let (w, h) = (image.width() as f32, image.height() as f32);
    let left = bbox.x.clamp(0.0, w) as u32;
    let top = bbox.y.clamp(0.0, h) as u32;
    let right = bbox.right().clamp(0.0, w) as u32;
    let bottom = bbox.bottom().clamp(0.0, h) as u32;
    (left < right && top < bottom).then_some((left, top, right, bottom))
}

fn fill(image: &mut RgbImage, (left, top, right, bottom): (u32, u32, u32, u32), color: Rgb<u8>) {
    for y in top..bottom {
        for x in left..right {
            image.put_pixel(x, y, color);
        }
    }
}

fn draw_box(image: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>) {
    let Some((left, top, right, bottom)) = clip(image, bbox) else {
        return;
    };
    let t = OUTLINE.min(right - left).min(bottom - top);

    fill(image, (left, top, right, top + t), color);
    fill(image, (left, bottom - t, right, bottom), color);
    fill(image, (left, top, left + t, bottom), color);
    fill(image, (right - t, top, right, bottom), color);

    let strip_top = bottom.saturating_sub(LABEL_STRIP).max(top);
    fill(image, (left, strip_top, right, bottom), color);
}
