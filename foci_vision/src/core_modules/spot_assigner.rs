// THEORY:
// The spot assigner solves the data association problem of this engine: it turns raw
// per-frame spot detections into a spot track whose labels are nucleus IDs. Because
// the nucleus IDs are already stable across time, a spot inherits temporal identity
// for free once it is paired with its nucleus.
//
// The association runs in two passes per frame:
// 1.  **Overlap Pass**: Every connected spot component is stamped with the largest
//     nucleus label found under its footprint.
// 2.  **Proximity Pass**: Components that overlap no nucleus ("leftovers") are
//     relabelled and matched through the nearest-label search from their rounded
//     centroid. A failed search leaves the component out of the track for good.

use crate::core_modules::label_volume::{Connectivity, LabelVolume, label_components, regions};
use crate::core_modules::nearest_label::nearest_label;
use crate::core_modules::progress::ProgressObserver;
use crate::error::{Result, ensure_shape};
use ndarray::{Array2, ArrayView2, ArrayView3, Axis, Zip};
use tracing::{debug, info};

/// Builds the spot track from nucleus tracks and raw spot detections.
///
/// `max_distance` bounds the nearest-label search for spots lying outside every
/// nucleus. Both volumes must share the same `(t, x, y)` shape.
pub fn assign_spots(
    nuclei: ArrayView3<u32>,
    spot_mask: ArrayView3<u32>,
    max_distance: usize,
    observer: &dyn ProgressObserver,
) -> Result<LabelVolume> {
    ensure_shape("spot mask", nuclei.shape(), spot_mask.shape())?;

    let t_tot = nuclei.len_of(Axis(0));
    let total_ticks = 3 * t_tot;
    let mut spot_track = LabelVolume::zeros(nuclei.raw_dim());

    // --- 1. Component Labelling ---
    let mut spot_labels = Vec::with_capacity(t_tot);
    for (t, frame) in spot_mask.axis_iter(Axis(0)).enumerate() {
        spot_labels.push(label_components(frame, Connectivity::Eight).0);
        observer.on_progress(t + 1, total_ticks);
    }

    // --- 2. Overlap Pass ---
    for t in 0..t_tot {
        let nuclei_frame = nuclei.index_axis(Axis(0), t);
        let mut track_frame = spot_track.index_axis_mut(Axis(0), t);
        for region in regions(spot_labels[t].view()) {
            let majority = region
                .pixels
                .iter()
                .map(|p| nuclei_frame[[p.x, p.y]])
                .max()
                .unwrap_or(0);
            if majority == 0 {
                continue;
            }
            for p in &region.pixels {
                track_frame[[p.x, p.y]] = majority;
            }
        }
        observer.on_progress(t_tot + t + 1, total_ticks);
    }

    // --- 3. Proximity Pass ---
    let mut unassigned = 0usize;
    for t in 0..t_tot {
        let nuclei_frame = nuclei.index_axis(Axis(0), t);
        let leftover = leftover_plane(spot_mask.index_axis(Axis(0), t), spot_track.index_axis(Axis(0), t));
        let (leftover_labels, _) = label_components(leftover.view(), Connectivity::Eight);

        let mut track_frame = spot_track.index_axis_mut(Axis(0), t);
        for region in regions(leftover_labels.view()) {
            match nearest_label(nuclei_frame, region.centroid(), max_distance) {
                Some(nucleus) => {
                    for p in &region.pixels {
                        track_frame[[p.x, p.y]] = nucleus;
                    }
                }
                None => unassigned += 1,
            }
        }
        observer.on_progress(2 * t_tot + t + 1, total_ticks);
    }

    if unassigned > 0 {
        debug!(unassigned, "spot components left without a nucleus");
    }
    info!(frames = t_tot, "spot assignment complete");
    Ok(spot_track)
}

/// Spot pixels that received no nucleus in the overlap pass.
fn leftover_plane(mask: ArrayView2<u32>, track: ArrayView2<u32>) -> Array2<u32> {
    let mut leftover = Array2::<u32>::zeros(mask.raw_dim());
    Zip::from(&mut leftover)
        .and(&mask)
        .and(&track)
        .for_each(|l, &m, &tr| *l = u32::from(m != 0 && tr == 0));
    leftover
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::label_volume::unique_labels;
    use crate::core_modules::progress::NoProgress;

    fn square(volume: &mut LabelVolume, t: usize, x: usize, y: usize, side: usize, value: u32) {
        for dx in 0..side {
            for dy in 0..side {
                volume[[t, x + dx, y + dy]] = value;
            }
        }
    }

    #[test]
    fn overlapping_spot_takes_max_nucleus_label() {
        let mut nuclei = LabelVolume::zeros((1, 20, 20));
        square(&mut nuclei, 0, 2, 2, 6, 4);
        square(&mut nuclei, 0, 2, 8, 6, 9);
        let mut spots = LabelVolume::zeros((1, 20, 20));
        // Straddles both nuclei.
        square(&mut spots, 0, 4, 6, 3, 1);

        let track = assign_spots(nuclei.view(), spots.view(), 5, &NoProgress).expect("assignment");
        assert_eq!(track[[0, 4, 6]], 9);
        assert_eq!(track[[0, 6, 8]], 9);
        assert_eq!(unique_labels(track.view()), vec![9]);
    }

    #[test]
    fn stray_spot_is_matched_to_nearby_nucleus() {
        let mut nuclei = LabelVolume::zeros((2, 20, 20));
        square(&mut nuclei, 1, 2, 2, 4, 6);
        let mut spots = LabelVolume::zeros((2, 20, 20));
        spots[[1, 7, 3]] = 1;

        let track = assign_spots(nuclei.view(), spots.view(), 5, &NoProgress).expect("assignment");
        assert_eq!(track[[1, 7, 3]], 6);
    }

    #[test]
    fn distant_spot_stays_unassigned() {
        let mut nuclei = LabelVolume::zeros((1, 30, 30));
        square(&mut nuclei, 0, 0, 0, 3, 2);
        let mut spots = LabelVolume::zeros((1, 30, 30));
        square(&mut spots, 0, 20, 20, 2, 1);

        let track = assign_spots(nuclei.view(), spots.view(), 5, &NoProgress).expect("assignment");
        assert!(track.iter().all(|&v| v == 0));
    }

    #[test]
    fn every_track_label_exists_in_nuclei_at_same_frame() {
        let mut nuclei = LabelVolume::zeros((3, 24, 24));
        let mut spots = LabelVolume::zeros((3, 24, 24));
        for t in 0..3 {
            square(&mut nuclei, t, 1, 1, 8, 3);
            square(&mut nuclei, t, 12, 12, 8, 5 + t as u32);
            square(&mut spots, t, 3, 3, 2, 1);
            square(&mut spots, t, 10, 14, 1, 1);
            square(&mut spots, t, 22, 0, 2, 1);
        }

        let track = assign_spots(nuclei.view(), spots.view(), 4, &NoProgress).expect("assignment");
        for t in 0..3 {
            let present = unique_labels(nuclei.slice(ndarray::s![t..t + 1, .., ..]));
            for &v in track.index_axis(Axis(0), t).iter().filter(|&&v| v != 0) {
                assert!(present.contains(&v), "label {v} missing from nuclei at frame {t}");
            }
        }
    }

    #[test]
    fn rejects_mismatched_shapes() {
        let nuclei = LabelVolume::zeros((2, 4, 4));
        let spots = LabelVolume::zeros((2, 4, 5));
        assert!(assign_spots(nuclei.view(), spots.view(), 5, &NoProgress).is_err());
    }
}
