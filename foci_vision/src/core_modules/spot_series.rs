//! Per-spot time series read straight off a spot track.
//!
//! These are the raw measurements the analysis keeps next to the burst
//! statistics: the summed intensity of every tracked spot in every frame and the
//! path of its centroid across the movie.

use crate::core_modules::label_volume::{Point2D, regions, unique_labels};
use crate::error::{Result, ensure_shape};
use ndarray::{Array2, ArrayView1, ArrayView3, Axis, Zip};

/// One row per spot ID, one column per frame.
#[derive(Debug, Clone, PartialEq)]
pub struct SpotSeries {
    pub spot_ids: Vec<u32>,
    pub values: Array2<f64>,
}

impl SpotSeries {
    pub fn row(&self, id: u32) -> Option<ArrayView1<'_, f64>> {
        let row = self.spot_ids.binary_search(&id).ok()?;
        Some(self.values.row(row))
    }
}

/// The centroid of one spot in every frame, `None` where it is absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trajectory {
    pub spot_id: u32,
    pub positions: Vec<Option<Point2D>>,
}

/// `sum over (x, y) of per_pixel * (track == id)` for every spot ID of `track`.
pub fn intensity_series(track: ArrayView3<u32>, per_pixel: ArrayView3<f64>) -> Result<SpotSeries> {
    ensure_shape("per-pixel map", track.shape(), per_pixel.shape())?;
    let spot_ids = unique_labels(track);
    let t_tot = track.len_of(Axis(0));
    let mut values = Array2::<f64>::zeros((spot_ids.len(), t_tot));

    for t in 0..t_tot {
        let mut column = values.column_mut(t);
        Zip::from(track.index_axis(Axis(0), t))
            .and(per_pixel.index_axis(Axis(0), t))
            .for_each(|&id, &v| {
                if id == 0 {
                    return;
                }
                if let Ok(row) = spot_ids.binary_search(&id) {
                    column[row] += v;
                }
            });
    }

    Ok(SpotSeries { spot_ids, values })
}

/// Rounded centroid of every spot ID of `track` in every frame.
pub fn centroid_trajectories(track: ArrayView3<u32>) -> Vec<Trajectory> {
    let spot_ids = unique_labels(track);
    let t_tot = track.len_of(Axis(0));
    let mut trajectories: Vec<Trajectory> = spot_ids
        .iter()
        .map(|&spot_id| Trajectory {
            spot_id,
            positions: vec![None; t_tot],
        })
        .collect();

    for (t, frame) in track.axis_iter(Axis(0)).enumerate() {
        for region in regions(frame) {
            if let Ok(row) = spot_ids.binary_search(&region.label) {
                trajectories[row].positions[t] = Some(region.centroid());
            }
        }
    }
    trajectories
}
