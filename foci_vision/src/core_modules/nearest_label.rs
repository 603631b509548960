// THEORY:
// The nearest-label search answers "which nucleus is this stray spot closest to?"
// without computing any distance transform. It inspects square windows centred on
// the query point, growing the half-side by one pixel per step, and stops at the
// first window that contains any label.
//
// The result is the *largest* label value inside that window, not the most frequent
// or the geometrically closest one. This coarse tie-break is part of the contract:
// changing it would reassign spots that sit between two nuclei.

use crate::core_modules::label_volume::Point2D;
use ndarray::{ArrayView2, s};

/// Finds the largest label in the smallest window around `point` that has any label.
///
/// The half-side starts at 1 and grows while it stays below `max_radius`. Windows are
/// clipped to the plane. `None` means no label was found within the radius and the
/// caller must leave the spot unassigned.
pub fn nearest_label(plane: ArrayView2<u32>, point: Point2D, max_radius: usize) -> Option<u32> {
    let (width, height) = plane.dim();
    if width == 0 || height == 0 {
        return None;
    }

    let mut half_side = 1;
    while half_side < max_radius {
        let x0 = point.x.saturating_sub(half_side);
        let x1 = (point.x + half_side).min(width - 1);
        let y0 = point.y.saturating_sub(half_side);
        let y1 = (point.y + half_side).min(height - 1);

        if x0 <= x1 && y0 <= y1 {
            let best = plane
                .slice(s![x0..=x1, y0..=y1])
                .iter()
                .copied()
                .max()
                .unwrap_or(0);
            if best != 0 {
                return Some(best);
            }
        }
        half_side += 1;
    }

    None
}
