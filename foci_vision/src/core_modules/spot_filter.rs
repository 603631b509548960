// THEORY:
// The spot filter engine removes two kinds of artefacts from a spot track. It never
// edits the track itself: each filter proposes a removal mask and the caller decides
// how to combine and apply them.
//
// 1.  **One Spot Per Nucleus**: A nucleus should carry a single focus. When the pixels
//     carrying one tracked ID form a region whose convex hull is much larger than the
//     region itself (solidity = hull area / area above a threshold), the region is
//     really several blobs merged under one ID. Only its largest connected piece is
//     kept.
// 2.  **Isolated Activations**: A spot that shows up in a single frame surrounded by
//     silence is detection noise. The time axis is cut into three slots, each with its
//     own isolation width `w`, and every centre of the pattern `[0]*w + [1] + [0]*w`
//     is flagged. Slots are padded with silence on both sides and never look into each
//     other, which keeps a second pass over the filtered track empty.

use crate::core_modules::convex_hull::convex_hull_area;
use crate::core_modules::label_volume::{
    Connectivity, LabelVolume, RemovalMask, activity_profile, label_components, regions, unique_labels,
};
use crate::core_modules::progress::ProgressObserver;
use crate::error::{PipelineError, Result, ensure_shape};
use crate::parallel_pipeline::{ChunkWorkerPool, concatenate_frames};
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis, Zip, s};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One of the three time ranges of the isolated-activation filter.
///
/// A slot only sees its own frames. Both of its edges read as `isolation_width` silent
/// frames, whether the edge is a movie boundary or a neighbouring slot, so the
/// position of the slot among the three plays no part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSlot {
    /// First frame of the slot.
    pub start: usize,
    /// One past the last frame; `None` runs to the end of the movie.
    #[serde(default)]
    pub end: Option<usize>,
    /// Silent frames required on each side of a lone activation. 0 disables the slot.
    pub isolation_width: usize,
}

impl FilterSlot {
    pub const DISABLED: FilterSlot = FilterSlot {
        start: 0,
        end: Some(0),
        isolation_width: 0,
    };

    fn is_enabled(&self) -> bool {
        self.isolation_width > 0 && self.end.is_none_or(|end| end > self.start)
    }
}

/// A slot clipped to the movie length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedSlot {
    pub start: usize,
    pub end: usize,
    pub isolation_width: usize,
}

/// The three slots of the isolated-activation filter, in time order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterSlots(pub [FilterSlot; 3]);

impl Default for FilterSlots {
    fn default() -> Self {
        Self::spanning(2)
    }
}

impl FilterSlots {
    /// A single slot covering every frame; the other two disabled.
    pub fn spanning(isolation_width: usize) -> Self {
        FilterSlots([
            FilterSlot {
                start: 0,
                end: None,
                isolation_width,
            },
            FilterSlot::DISABLED,
            FilterSlot::DISABLED,
        ])
    }

    /// Enabled slots must be ordered and must not overlap.
    pub fn validate(&self) -> Result<()> {
        let mut previous_end: Option<Option<usize>> = None;
        for (i, slot) in self.0.iter().enumerate().filter(|(_, slot)| slot.is_enabled()) {
            match previous_end {
                Some(None) => {
                    return Err(PipelineError::invalid_config(format!(
                        "isolation slot {} starts after an open-ended slot",
                        i + 1
                    )));
                }
                Some(Some(end)) if slot.start < end => {
                    return Err(PipelineError::invalid_config(format!(
                        "isolation slot {} starts at frame {} before the previous slot ends at {}",
                        i + 1,
                        slot.start,
                        end
                    )));
                }
                _ => {}
            }
            previous_end = Some(slot.end);
        }
        Ok(())
    }

    /// Clips the enabled slots to `total_frames`, dropping the ones left empty.
    pub fn resolve(&self, total_frames: usize) -> Vec<ResolvedSlot> {
        self.0
            .iter()
            .filter(|slot| slot.is_enabled())
            .filter_map(|slot| {
                let end = slot.end.unwrap_or(total_frames);
                if end > total_frames {
                    warn!(end, total_frames, "isolation slot clipped to movie length");
                }
                let end = end.min(total_frames);
                (slot.start < end).then_some(ResolvedSlot {
                    start: slot.start,
                    end,
                    isolation_width: slot.isolation_width,
                })
            })
            .collect()
    }
}

// --- One Spot Per Nucleus ---

/// Removal mask for one frame: pieces of low-solidity regions other than the largest.
pub fn split_spot_frame(frame: ArrayView2<u32>, solidity_threshold: f64) -> Array2<u8> {
    let mut removal = Array2::<u8>::zeros(frame.raw_dim());

    for region in regions(frame) {
        let solidity = convex_hull_area(&region.pixels) as f64 / region.area() as f64;
        if solidity <= solidity_threshold {
            continue;
        }

        let (min, max) = region.bounding_box;
        let mut local = Array2::<u32>::zeros((max.x - min.x + 1, max.y - min.y + 1));
        for p in &region.pixels {
            local[[p.x - min.x, p.y - min.y]] = 1;
        }
        let (pieces, n) = label_components(local.view(), Connectivity::Eight);
        if n <= 1 {
            continue;
        }

        let mut areas = vec![0usize; n as usize + 1];
        for &piece in pieces.iter() {
            areas[piece as usize] += 1;
        }
        // First piece in scan order wins ties.
        let mut keeper = 1;
        for piece in 2..=n as usize {
            if areas[piece] > areas[keeper] {
                keeper = piece;
            }
        }

        for ((lx, ly), &piece) in pieces.indexed_iter() {
            if piece != 0 && piece as usize != keeper {
                removal[[lx + min.x, ly + min.y]] = 1;
            }
        }
        debug!(label = region.label, solidity, pieces = n, "split spot region");
    }

    removal
}

/// Sequential one-spot-per-nucleus filter over every frame.
pub fn one_spot_per_nucleus(track: ArrayView3<u32>, solidity_threshold: f64) -> RemovalMask {
    let mut mask = RemovalMask::zeros(track.raw_dim());
    for (t, frame) in track.axis_iter(Axis(0)).enumerate() {
        mask.index_axis_mut(Axis(0), t)
            .assign(&split_spot_frame(frame, solidity_threshold));
    }
    mask
}

/// The one-spot-per-nucleus filter run on contiguous frame chunks of the pool.
pub async fn one_spot_per_nucleus_parallel(
    pool: &ChunkWorkerPool,
    track: Arc<LabelVolume>,
    solidity_threshold: f64,
    observer: Arc<dyn ProgressObserver>,
) -> Result<RemovalMask> {
    let dim = track.dim();
    let chunks = pool
        .map_chunks(
            dim.0,
            move |frames| one_spot_per_nucleus(track.slice(s![frames, .., ..]), solidity_threshold),
            observer,
        )
        .await?;
    let mask = concatenate_frames(&chunks, dim)?;
    info!(removed = mask.iter().filter(|&&v| v != 0).count(), "one-spot-per-nucleus filter complete");
    Ok(mask)
}

// --- Isolated Activations ---

/// Frames of `profile` that are isolated activations under `slots`.
///
/// Each slot `[start, end)` of width `w` is scanned on its own: the profile over the
/// slot is padded with `w` silent frames on both sides, so activity in a neighbouring
/// slot never shields or exposes a frame of this one.
pub fn isolated_frames(profile: &[u8], slots: &[ResolvedSlot]) -> Vec<usize> {
    let mut flagged = Vec::new();

    for slot in slots {
        let w = slot.isolation_width;
        let inside = &profile[slot.start.min(profile.len())..slot.end.min(profile.len())];
        let sequence: Vec<u8> = std::iter::repeat_n(0, w)
            .chain(inside.iter().copied())
            .chain(std::iter::repeat_n(0, w))
            .collect();

        let pattern_len = 2 * w + 1;
        for (offset, window) in sequence.windows(pattern_len).enumerate() {
            if window[w] != 0 && window[..w].iter().all(|&v| v == 0) && window[w + 1..].iter().all(|&v| v == 0) {
                flagged.push(slot.start + offset);
            }
        }
    }

    flagged.sort_unstable();
    flagged.dedup();
    flagged
}

/// Removal mask of every isolated activation of every spot ID.
pub fn remove_isolated(track: ArrayView3<u32>, slots: &FilterSlots, observer: &dyn ProgressObserver) -> Result<RemovalMask> {
    slots.validate()?;
    let t_tot = track.len_of(Axis(0));
    let resolved = slots.resolve(t_tot);
    let ids = unique_labels(track);

    let mut mask = RemovalMask::zeros(track.raw_dim());
    let mut removed_frames = 0usize;
    for (count, &id) in ids.iter().enumerate() {
        let profile = activity_profile(track, id);
        for t in isolated_frames(&profile, &resolved) {
            Zip::from(mask.index_axis_mut(Axis(0), t))
                .and(track.index_axis(Axis(0), t))
                .for_each(|m, &v| {
                    if v == id {
                        *m = 1;
                    }
                });
            removed_frames += 1;
        }
        observer.on_progress(count + 1, ids.len());
    }

    info!(spots = ids.len(), removed_frames, "isolated-activation filter complete");
    Ok(mask)
}

// --- Mask Algebra ---

/// `sign(a + b)`.
pub fn union_masks(a: ArrayView3<u8>, b: ArrayView3<u8>) -> Result<RemovalMask> {
    ensure_shape("removal mask", a.shape(), b.shape())?;
    let mut union = RemovalMask::zeros(a.raw_dim());
    Zip::from(&mut union)
        .and(&a)
        .and(&b)
        .for_each(|u, &x, &y| *u = u8::from(x != 0 || y != 0));
    Ok(union)
}

/// `track * (1 - mask)`.
pub fn apply_removal(track: ArrayView3<u32>, mask: ArrayView3<u8>) -> Result<LabelVolume> {
    ensure_shape("removal mask", track.shape(), mask.shape())?;
    let mut kept = track.to_owned();
    Zip::from(&mut kept).and(&mask).for_each(|v, &m| {
        if m != 0 {
            *v = 0;
        }
    });
    Ok(kept)
}

/// Zeroes the removed pixels of a per-pixel intensity or volume map.
pub fn apply_removal_f64(values: ArrayView3<f64>, mask: ArrayView3<u8>) -> Result<Array3<f64>> {
    ensure_shape("removal mask", values.shape(), mask.shape())?;
    let mut kept = values.to_owned();
    Zip::from(&mut kept).and(&mask).for_each(|v, &m| {
        if m != 0 {
            *v = 0.0;
        }
    });
    Ok(kept)
}
