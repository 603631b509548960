// THEORY:
// The background estimator turns the projected spot intensity into a background
// corrected measurement. Every frame is handled on its own:
// 1.  **Cage Painting**: The cages of all spots present in the frame are painted into
//     one label volume (see `cage`).
// 2.  **Cage Statistics**: For each cage label, the raw voxels under its remaining
//     shell that are non-zero form the background sample. Mean and population standard
//     deviation are taken over that sample.
// 3.  **Correction**: `corrected = raw - mean * volume`, where `raw` and `volume` are the
//     sums of the per-pixel intensity and volume maps under the spot. The derived
//     concentration is `corrected / volume`.
//
// A spot whose cage was fully erased or sampled only zeros has no background; all of
// its derived metrics are 0 for that frame. Frames are independent, so the time axis is
// split into chunks on the worker pool and the per-chunk columns are written back in
// chunk order.

use crate::core_modules::cage::{CageGeometry, build_cage_volume};
use crate::core_modules::label_volume::{LabelVolume, regions, unique_labels};
use crate::core_modules::progress::ProgressObserver;
use crate::error::{PipelineError, Result, ensure_shape};
use crate::parallel_pipeline::ChunkWorkerPool;
use ndarray::{Array2, Array3, Array4, ArrayView3, ArrayView4, Axis, Zip, s};
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, info};

/// Per-spot, per-frame measurements. Every array is `(spot, frame)`, rows follow
/// `spot_ids`.
#[derive(Debug, Clone, PartialEq)]
pub struct IntensityTable {
    pub spot_ids: Vec<u32>,
    pub background_mean: Array2<f64>,
    pub background_std: Array2<f64>,
    /// z plane the cage was centred on.
    pub z_centre: Array2<f64>,
    /// Sum of the per-pixel intensity map under the spot.
    pub raw_intensity: Array2<f64>,
    /// Sum of the per-pixel volume map under the spot.
    pub spot_volume: Array2<f64>,
    pub corrected: Array2<f64>,
    pub concentration: Array2<f64>,
    /// `raw / mean`.
    pub ratio: Array2<f64>,
    /// `ratio / volume`.
    pub ratio_per_volume: Array2<f64>,
}

impl IntensityTable {
    /// An all-zero table. `spot_ids` is sorted and deduplicated so rows can be looked up.
    pub fn zeros(mut spot_ids: Vec<u32>, frames: usize) -> Self {
        spot_ids.sort_unstable();
        spot_ids.dedup();
        let dim = (spot_ids.len(), frames);
        Self {
            spot_ids,
            background_mean: Array2::zeros(dim),
            background_std: Array2::zeros(dim),
            z_centre: Array2::zeros(dim),
            raw_intensity: Array2::zeros(dim),
            spot_volume: Array2::zeros(dim),
            corrected: Array2::zeros(dim),
            concentration: Array2::zeros(dim),
            ratio: Array2::zeros(dim),
            ratio_per_volume: Array2::zeros(dim),
        }
    }

    pub fn frames(&self) -> usize {
        self.corrected.len_of(Axis(1))
    }

    /// Row index of `id`, if the spot is in the table.
    pub fn row_of(&self, id: u32) -> Option<usize> {
        self.spot_ids.binary_search(&id).ok()
    }

    fn metrics(&self) -> [&Array2<f64>; 9] {
        [
            &self.background_mean,
            &self.background_std,
            &self.z_centre,
            &self.raw_intensity,
            &self.spot_volume,
            &self.corrected,
            &self.concentration,
            &self.ratio,
            &self.ratio_per_volume,
        ]
    }

    fn metrics_mut(&mut self) -> [&mut Array2<f64>; 9] {
        [
            &mut self.background_mean,
            &mut self.background_std,
            &mut self.z_centre,
            &mut self.raw_intensity,
            &mut self.spot_volume,
            &mut self.corrected,
            &mut self.concentration,
            &mut self.ratio,
            &mut self.ratio_per_volume,
        ]
    }

    /// Copies the columns of `chunk` into `frames`.
    fn assign_frames(&mut self, frames: Range<usize>, chunk: &IntensityTable) -> Result<()> {
        if chunk.frames() != frames.len() || chunk.spot_ids != self.spot_ids {
            return Err(PipelineError::Worker(format!(
                "background chunk for frames {frames:?} has {} columns and {} spots",
                chunk.frames(),
                chunk.spot_ids.len()
            )));
        }
        for (full, part) in self.metrics_mut().into_iter().zip(chunk.metrics()) {
            full.slice_mut(s![.., frames.clone()]).assign(part);
        }
        Ok(())
    }
}

/// `num / den`, or 0 when the quotient is not finite.
fn safe_div(num: f64, den: f64) -> f64 {
    let q = num / den;
    if q.is_finite() { q } else { 0.0 }
}

/// Mean and population standard deviation, `(0, 0)` for an empty sample.
fn sample_stats(sample: &[f64]) -> (f64, f64) {
    let count = sample.len() as f64;
    if count < 1.0 {
        return (0.0, 0.0);
    }
    let mean = sample.iter().sum::<f64>() / count;
    let variance = sample.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count;
    (mean, variance.sqrt())
}

/// Measures every spot of `spot_ids` over the frames of the given slices.
///
/// `raw` is `(t, z, x, y)`; `ints`, `vols` and `track` are `(t, x, y)` over the same
/// frames. Column `i` of the result is frame `i` of the slices; rows follow the
/// sorted, deduplicated `spot_ids`.
pub fn estimate_frames(
    raw: ArrayView4<f64>,
    ints: ArrayView3<f64>,
    vols: ArrayView3<f64>,
    track: ArrayView3<u32>,
    spot_ids: &[u32],
    geometry: &CageGeometry,
) -> IntensityTable {
    let t_tot = track.len_of(Axis(0));
    let mut table = IntensityTable::zeros(spot_ids.to_vec(), t_tot);

    for t in 0..t_tot {
        let raw_frame = raw.index_axis(Axis(0), t);
        let track_frame = track.index_axis(Axis(0), t);
        let spots = regions(track_frame);
        if spots.is_empty() {
            continue;
        }

        // --- 1. Cage Painting ---
        let cage = build_cage_volume(raw_frame, &spots, geometry);

        // --- 2. Cage Statistics ---
        let mut samples: BTreeMap<u32, Vec<f64>> = BTreeMap::new();
        Zip::from(&cage.labels).and(&raw_frame).for_each(|&label, &v| {
            if label != 0 && v != 0.0 {
                samples.entry(label).or_default().push(v);
            }
        });

        // --- 3. Correction ---
        let ints_frame = ints.index_axis(Axis(0), t);
        let vols_frame = vols.index_axis(Axis(0), t);
        for (region, (label, centre)) in spots.iter().zip(&cage.centres) {
            let Some(row) = table.row_of(*label) else {
                continue;
            };
            let raw_sum: f64 = region.pixels.iter().map(|p| ints_frame[[p.x, p.y]]).sum();
            let volume: f64 = region.pixels.iter().map(|p| vols_frame[[p.x, p.y]]).sum();
            table.z_centre[[row, t]] = centre.z as f64;
            table.raw_intensity[[row, t]] = raw_sum;
            table.spot_volume[[row, t]] = volume;

            let Some(sample) = samples.get(&region.label) else {
                debug!(frame = t, spot = *label, "empty background cage");
                continue;
            };
            let (mean, std) = sample_stats(sample);
            let corrected = raw_sum - mean * volume;
            let ratio = safe_div(raw_sum, mean);
            table.background_mean[[row, t]] = mean;
            table.background_std[[row, t]] = std;
            table.corrected[[row, t]] = if corrected.is_finite() { corrected } else { 0.0 };
            table.concentration[[row, t]] = safe_div(corrected, volume);
            table.ratio[[row, t]] = ratio;
            table.ratio_per_volume[[row, t]] = safe_div(ratio, volume);
        }
    }

    table
}

/// Runs the background estimation over frame chunks of a worker pool.
#[derive(Debug, Clone)]
pub struct BackgroundEstimator {
    pool: ChunkWorkerPool,
    geometry: CageGeometry,
}

impl BackgroundEstimator {
    pub fn new(pool: ChunkWorkerPool, geometry: CageGeometry) -> Self {
        Self { pool, geometry }
    }

    /// Measures every spot ID of `track` in every frame.
    pub async fn estimate(
        &self,
        raw: Arc<Array4<f64>>,
        ints: Arc<Array3<f64>>,
        vols: Arc<Array3<f64>>,
        track: Arc<LabelVolume>,
        observer: Arc<dyn ProgressObserver>,
    ) -> Result<IntensityTable> {
        self.geometry.validate()?;
        let (t_tot, _z, x_tot, y_tot) = raw.dim();
        ensure_shape("raw volume (t, x, y)", track.shape(), &[t_tot, x_tot, y_tot])?;
        ensure_shape("spot intensity", track.shape(), ints.shape())?;
        ensure_shape("spot volume", track.shape(), vols.shape())?;

        let spot_ids = Arc::new(unique_labels(track.view()));
        let geometry = self.geometry;
        let job_ids = Arc::clone(&spot_ids);
        let chunks = self
            .pool
            .map_chunks(
                t_tot,
                move |frames: Range<usize>| {
                    estimate_frames(
                        raw.slice(s![frames.clone(), .., .., ..]),
                        ints.slice(s![frames.clone(), .., ..]),
                        vols.slice(s![frames.clone(), .., ..]),
                        track.slice(s![frames, .., ..]),
                        &job_ids,
                        &geometry,
                    )
                },
                observer,
            )
            .await?;

        let mut table = IntensityTable::zeros(spot_ids.to_vec(), t_tot);
        for chunk in &chunks {
            table.assign_frames(chunk.frames.clone(), &chunk.output)?;
        }
        info!(spots = table.spot_ids.len(), frames = t_tot, "background estimation complete");
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::progress::NoProgress;
    use approx::assert_relative_eq;

    const B: f64 = 10.0;

    /// One 2x2 spot with label 3 in every frame, a bright voxel column at z = 4.
    fn scene(frames: usize, background: f64) -> (Array4<f64>, Array3<f64>, Array3<f64>, LabelVolume) {
        let mut raw = Array4::<f64>::from_elem((frames, 12, 24, 24), background);
        let mut ints = Array3::<f64>::zeros((frames, 24, 24));
        let mut vols = Array3::<f64>::zeros((frames, 24, 24));
        let mut track = LabelVolume::zeros((frames, 24, 24));
        for t in 0..frames {
            for x in 10..12 {
                for y in 10..12 {
                    track[[t, x, y]] = 3;
                    ints[[t, x, y]] = 50.0 + t as f64;
                    vols[[t, x, y]] = 3.0;
                    raw[[t, 4, x, y]] = 100.0;
                }
            }
        }
        (raw, ints, vols, track)
    }

    #[test]
    fn uniform_background_is_subtracted() {
        let (raw, ints, vols, track) = scene(1, B);
        let table = estimate_frames(raw.view(), ints.view(), vols.view(), track.view(), &[3], &CageGeometry::default());

        assert_eq!(table.z_centre[[0, 0]], 4.0);
        assert_relative_eq!(table.background_mean[[0, 0]], B);
        assert_relative_eq!(table.background_std[[0, 0]], 0.0);
        assert_relative_eq!(table.raw_intensity[[0, 0]], 200.0);
        assert_relative_eq!(table.spot_volume[[0, 0]], 12.0);
        assert_relative_eq!(table.corrected[[0, 0]], 200.0 - B * 12.0, epsilon = 1e-9);
        assert_relative_eq!(table.concentration[[0, 0]], 80.0 / 12.0, epsilon = 1e-9);
        assert_relative_eq!(table.ratio[[0, 0]], 20.0, epsilon = 1e-9);
        assert_relative_eq!(table.ratio_per_volume[[0, 0]], 20.0 / 12.0, epsilon = 1e-9);
    }

    #[test]
    fn empty_cage_yields_zero() {
        // Only the spot core is bright; every shell voxel reads 0.
        let (raw, ints, vols, track) = scene(1, 0.0);
        let table = estimate_frames(raw.view(), ints.view(), vols.view(), track.view(), &[3], &CageGeometry::default());

        assert_eq!(table.background_mean[[0, 0]], 0.0);
        assert_eq!(table.corrected[[0, 0]], 0.0);
        assert_eq!(table.concentration[[0, 0]], 0.0);
        assert_eq!(table.ratio[[0, 0]], 0.0);
        assert!(table.metrics().iter().all(|m| m.iter().all(|v| v.is_finite())));
    }

    #[test]
    fn zero_volume_concentration_is_zero() {
        let (raw, ints, mut vols, track) = scene(1, B);
        vols.fill(0.0);
        let table = estimate_frames(raw.view(), ints.view(), vols.view(), track.view(), &[3], &CageGeometry::default());
        assert_relative_eq!(table.corrected[[0, 0]], 200.0);
        assert_eq!(table.concentration[[0, 0]], 0.0);
        assert_eq!(table.ratio_per_volume[[0, 0]], 0.0);
    }

    #[test]
    fn absent_spot_frames_stay_zero() {
        let (raw, ints, vols, mut track) = scene(3, B);
        track.index_axis_mut(Axis(0), 1).fill(0);
        let table = estimate_frames(raw.view(), ints.view(), vols.view(), track.view(), &[3], &CageGeometry::default());
        assert!(table.corrected[[0, 0]] > 0.0);
        assert_eq!(table.corrected[[0, 1]], 0.0);
        assert_eq!(table.raw_intensity[[0, 1]], 0.0);
        assert!(table.corrected[[0, 2]] > 0.0);
    }

    #[test]
    fn unsorted_ids_still_find_their_rows() {
        let (raw, ints, vols, track) = scene(1, B);
        let table = estimate_frames(raw.view(), ints.view(), vols.view(), track.view(), &[9, 3, 1, 3], &CageGeometry::default());
        assert_eq!(table.spot_ids, vec![1, 3, 9]);
        assert_eq!(table.row_of(3), Some(1));
        assert_relative_eq!(table.corrected[[1, 0]], 200.0 - B * 12.0, epsilon = 1e-9);
        assert_eq!(table.corrected[[0, 0]], 0.0);
        assert_eq!(table.corrected[[2, 0]], 0.0);
    }

    #[tokio::test]
    async fn chunked_estimate_matches_sequential() {
        let (raw, ints, vols, track) = scene(9, B);
        let sequential = estimate_frames(raw.view(), ints.view(), vols.view(), track.view(), &[3], &CageGeometry::default());

        let estimator = BackgroundEstimator::new(ChunkWorkerPool::new(Some(4)), CageGeometry::default());
        let parallel = estimator
            .estimate(Arc::new(raw), Arc::new(ints), Arc::new(vols), Arc::new(track), Arc::new(NoProgress))
            .await
            .expect("estimate");
        assert_eq!(parallel, sequential);
        assert_relative_eq!(parallel.corrected[[0, 8]], 8.0 * 4.0 + 200.0 - B * 12.0, epsilon = 1e-9);
    }

    #[tokio::test]
    async fn mismatched_raw_volume_is_rejected() {
        let (raw, ints, vols, track) = scene(2, B);
        let short = raw.slice(s![.., .., ..20, ..]).to_owned();
        let estimator = BackgroundEstimator::new(ChunkWorkerPool::new(Some(2)), CageGeometry::default());
        let err = estimator
            .estimate(Arc::new(short), Arc::new(ints), Arc::new(vols), Arc::new(track), Arc::new(NoProgress))
            .await;
        assert!(matches!(err, Err(PipelineError::ShapeMismatch { .. })));
    }
}
