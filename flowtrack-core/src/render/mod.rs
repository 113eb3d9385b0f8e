//! render — debug overlay for the display collaborator
//!
//! Draws bounding boxes and track polylines onto an RGB canvas in-place.
//! Hidden entities get their own color so occlusion handling is visible
//! at a glance.  Label text layout is left to the display layer; the
//! views carry the strings.

use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;

use crate::engine::TrackView;

/// Visible entity boxes.
const BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
/// Hidden (occluded, propagated-only) entity boxes.
const HIDDEN_BOX_COLOR: Rgb<u8> = Rgb([255, 160, 0]);
/// Track polylines.
const TRACK_COLOR: Rgb<u8> = Rgb([100, 255, 100]);

/// Draw every view's box and track polyline onto `canvas` in-place.
pub fn draw_overlay(canvas: &mut RgbImage, views: &[TrackView<'_>]) {
    for view in views {
        let width = view.bbox.width().max(1.0) as u32;
        let height = view.bbox.height().max(1.0) as u32;
        let rect = Rect::at(view.bbox.x1 as i32, view.bbox.y1 as i32).of_size(width, height);
        let color = if view.hidden {
            HIDDEN_BOX_COLOR
        } else {
            BOX_COLOR
        };
        draw_hollow_rect_mut(canvas, rect, color);

        for pair in view.track.windows(2) {
            draw_line_segment_mut(
                canvas,
                (pair[0].x, pair[0].y),
                (pair[1].x, pair[1].y),
                TRACK_COLOR,
            );
        }
    }
}
