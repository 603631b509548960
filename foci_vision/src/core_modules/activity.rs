// THEORY:
// The activity classifier is a read-only view over a spot track. It answers, per
// frame and per nucleus, "is this nucleus currently transcribing?" and packages the
// answer in three forms:
// 1.  A state volume (0 background, 1 idle nucleus, 2 nucleus hosting its spot).
// 2.  A false-colour composite for display collaborators. The colour policy is fixed:
//     red marks a nucleus under its assigned spot, blue marks a nucleus with no spot
//     assigned in that frame, green marks the spot footprint itself.
// 3.  The active-nucleus count per frame.
//
// Nothing here mutates the track; recompute the report whenever the track changes.

use crate::core_modules::label_volume::{Connectivity, label_components};
use crate::error::{Result, ensure_shape};
use image::{Rgb, RgbImage};
use ndarray::{Array2, Array3, Array4, ArrayView3, Axis, Zip};
use std::collections::BTreeSet;

/// Nucleus pixel with no spot assigned in this frame.
pub const NUCLEUS_IDLE: u8 = 1;
/// Nucleus pixel whose assigned spot is present in this frame.
pub const NUCLEUS_ACTIVE: u8 = 2;

const RED: usize = 0;
const GREEN: usize = 1;
const BLUE: usize = 2;

#[derive(Debug, Clone)]
pub struct ActivityReport {
    /// `(t, x, y)` nucleus state: 0, `NUCLEUS_IDLE` or `NUCLEUS_ACTIVE`.
    pub nuclei_state: Array3<u8>,
    /// `(t, x, y, channel)` RGB composite, each channel 0 or 255.
    pub composite: Array4<u8>,
    /// Number of active nuclei in every frame.
    pub active_counts: Vec<usize>,
}

impl ActivityReport {
    /// The composite as one `RgbImage` per frame (image width is the `y` axis).
    pub fn composite_frames(&self) -> Vec<RgbImage> {
        self.composite
            .axis_iter(Axis(0))
            .map(|frame| {
                let (width_x, height_y, _) = frame.dim();
                RgbImage::from_fn(height_y as u32, width_x as u32, |col, row| {
                    let (x, y) = (row as usize, col as usize);
                    Rgb([frame[[x, y, RED]], frame[[x, y, GREEN]], frame[[x, y, BLUE]]])
                })
            })
            .collect()
    }
}

/// Classifies every nucleus pixel as idle or active and derives the composite.
pub fn classify_activity(spot_track: ArrayView3<u32>, nuclei: ArrayView3<u32>) -> Result<ActivityReport> {
    ensure_shape("spot track", nuclei.shape(), spot_track.shape())?;

    let (t_tot, width, height) = nuclei.dim();
    let mut nuclei_state = nuclei.mapv(|v| u8::from(v != 0));

    // --- 1. Spot Presence ---
    // A nucleus is active in every frame where a spot carrying its ID exists.
    for t in 0..t_tot {
        let present: BTreeSet<u32> = spot_track
            .index_axis(Axis(0), t)
            .iter()
            .filter(|&&v| v != 0)
            .copied()
            .collect();
        if present.is_empty() {
            continue;
        }
        Zip::from(nuclei_state.index_axis_mut(Axis(0), t))
            .and(nuclei.index_axis(Axis(0), t))
            .for_each(|state, &nucleus| {
                if nucleus != 0 && present.contains(&nucleus) {
                    *state = NUCLEUS_ACTIVE;
                }
            });
    }

    // --- 2. Composite ---
    let mut composite = Array4::<u8>::zeros((t_tot, width, height, 3));
    for ((t, x, y), &state) in nuclei_state.indexed_iter() {
        if state == NUCLEUS_ACTIVE {
            composite[[t, x, y, RED]] = 255;
        } else if state == NUCLEUS_IDLE {
            composite[[t, x, y, BLUE]] = 255;
        }
        if spot_track[[t, x, y]] != 0 {
            composite[[t, x, y, GREEN]] = 255;
        }
    }

    // --- 3. Active Counts ---
    let active_counts = (0..t_tot)
        .map(|t| {
            let mut active = Array2::<u32>::zeros((width, height));
            Zip::from(&mut active)
                .and(nuclei_state.index_axis(Axis(0), t))
                .and(nuclei.index_axis(Axis(0), t))
                .for_each(|a, &state, &nucleus| {
                    if state == NUCLEUS_ACTIVE {
                        *a = nucleus;
                    }
                });
            label_components(active.view(), Connectivity::Four).1 as usize
        })
        .collect();

    Ok(ActivityReport {
        nuclei_state,
        composite,
        active_counts,
    })
}

/// Display volume for reviewing filter results: `sign(track) + removal + 3 * sign(nuclei)`.
///
/// Values: 1 kept spot, 2 spot marked for removal, 3 bare nucleus, 4 and 5 the same
/// spot states on top of a nucleus.
pub fn filter_preview(spot_track: ArrayView3<u32>, removal: ArrayView3<u8>, nuclei: ArrayView3<u32>) -> Result<Array3<u8>> {
    ensure_shape("spot track", nuclei.shape(), spot_track.shape())?;
    ensure_shape("removal mask", nuclei.shape(), removal.shape())?;

    let mut preview = Array3::<u8>::zeros(nuclei.raw_dim());
    Zip::from(&mut preview)
        .and(&spot_track)
        .and(&removal)
        .and(&nuclei)
        .for_each(|p, &spot, &rm, &nucleus| {
            *p = u8::from(spot != 0) + u8::from(rm != 0) + 3 * u8::from(nucleus != 0);
        });
    Ok(preview)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::label_volume::LabelVolume;

    fn scene() -> (LabelVolume, LabelVolume) {
        let mut nuclei = LabelVolume::zeros((2, 10, 10));
        let mut spots = LabelVolume::zeros((2, 10, 10));
        for t in 0..2 {
            for x in 0..4 {
                for y in 0..4 {
                    nuclei[[t, x, y]] = 1;
                    nuclei[[t, x + 5, y + 5]] = 2;
                }
            }
        }
        spots[[0, 1, 1]] = 1;
        spots[[1, 6, 6]] = 2;
        spots[[1, 2, 2]] = 1;
        (nuclei, spots)
    }

    #[test]
    fn nuclei_with_spots_are_active() {
        let (nuclei, spots) = scene();
        let report = classify_activity(spots.view(), nuclei.view()).expect("classify");
        assert_eq!(report.nuclei_state[[0, 0, 0]], NUCLEUS_ACTIVE);
        assert_eq!(report.nuclei_state[[0, 6, 6]], NUCLEUS_IDLE);
        assert_eq!(report.nuclei_state[[1, 6, 6]], NUCLEUS_ACTIVE);
        assert_eq!(report.nuclei_state[[1, 4, 4]], 0);
        assert_eq!(report.active_counts, vec![1, 2]);
    }

    #[test]
    fn composite_follows_colour_policy() {
        let (nuclei, spots) = scene();
        let report = classify_activity(spots.view(), nuclei.view()).expect("classify");
        assert_eq!(report.composite[[0, 1, 1, RED]], 255);
        assert_eq!(report.composite[[0, 1, 1, GREEN]], 255);
        assert_eq!(report.composite[[0, 7, 7, BLUE]], 255);
        assert_eq!(report.composite[[0, 7, 7, RED]], 0);

        let frames = report.composite_frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].get_pixel(1, 1), &Rgb([255, 255, 0]));
        assert_eq!(frames[0].get_pixel(7, 7), &Rgb([0, 0, 255]));
    }

    #[test]
    fn preview_encodes_removal() {
        let (nuclei, spots) = scene();
        let mut removal = Array3::<u8>::zeros(nuclei.raw_dim());
        removal[[1, 2, 2]] = 1;
        let preview = filter_preview(spots.view(), removal.view(), nuclei.view()).expect("preview");
        assert_eq!(preview[[1, 2, 2]], 5);
        assert_eq!(preview[[1, 6, 6]], 4);
        assert_eq!(preview[[1, 0, 0]], 3);
        assert_eq!(preview[[1, 9, 0]], 0);
    }
}
