// THEORY:
// Transcription at a locus switches on and off. Once the intensity of a tracked spot
// is known in every frame, its activity is simply "intensity is non-zero", and the
// dynamics fall out of a run-length encoding of that activity:
// 1.  **Bursts**: maximal runs of active frames. Each burst carries its duration, its
//     peak and integrated intensity, and the integrated intensity divided by the
//     integrated spot volume over the same frames.
// 2.  **Off Intervals**: maximal runs of silent frames. A silent run starting at frame 0
//     is not an interval between bursts (nothing was on before it) and is dropped.
//     A trailing silent run is kept.
//
// The table form is fixed-width so that every spot fits the same layout: the widest
// burst list sets the width and shorter lists are padded with zeros.

use crate::core_modules::spot_series::{SpotSeries, intensity_series};
use crate::error::{PipelineError, Result, ensure_shape};
use ndarray::{Array2, ArrayView3};
use std::ops::Range;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub struct Burst {
    /// First frame of the burst.
    pub start: usize,
    pub duration: usize,
    pub max_amplitude: f64,
    pub integrated_amplitude: f64,
    /// `integrated_amplitude` over the summed spot volume, 0 when the volume is 0.
    pub average_amplitude: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpotBursts {
    pub spot_id: u32,
    pub bursts: Vec<Burst>,
    /// Silent runs as frame ranges, the leading one excluded.
    pub off_intervals: Vec<Range<usize>>,
}

impl SpotBursts {
    pub fn off_durations(&self) -> Vec<usize> {
        self.off_intervals.iter().map(|r| r.len()).collect()
    }
}

/// Maximal runs of active and of silent frames, in order.
fn runs(active: &[bool]) -> (Vec<Range<usize>>, Vec<Range<usize>>) {
    let mut on = Vec::new();
    let mut off = Vec::new();
    let mut start = 0;
    for i in 1..=active.len() {
        if i == active.len() || active[i] != active[start] {
            if active[start] {
                on.push(start..i);
            } else {
                off.push(start..i);
            }
            start = i;
        }
    }
    (on, off)
}

/// Bursts and off intervals of one spot from its intensity and volume series.
pub fn spot_bursts(spot_id: u32, intensity: &[f64], volume: &[f64]) -> SpotBursts {
    let active: Vec<bool> = intensity.iter().map(|&v| v != 0.0).collect();
    let (on, mut off) = runs(&active);
    if off.first().is_some_and(|r| r.start == 0) {
        off.remove(0);
    }

    let bursts = on
        .into_iter()
        .map(|frames| {
            let values = &intensity[frames.clone()];
            let integrated: f64 = values.iter().sum();
            let burst_volume: f64 = frames.clone().filter_map(|t| volume.get(t)).sum();
            let average = integrated / burst_volume;
            Burst {
                start: frames.start,
                duration: frames.len(),
                max_amplitude: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                integrated_amplitude: integrated,
                average_amplitude: if average.is_finite() { average } else { 0.0 },
            }
        })
        .collect();

    SpotBursts {
        spot_id,
        bursts,
        off_intervals: off,
    }
}

/// Burst statistics of every spot.
#[derive(Debug, Clone, PartialEq)]
pub struct BurstTable {
    pub spots: Vec<SpotBursts>,
}

impl BurstTable {
    /// Largest burst count over all spots.
    pub fn width(&self) -> usize {
        self.spots.iter().map(|s| s.bursts.len()).max().unwrap_or(0)
    }

    /// One row per spot:
    /// `[id, n_bursts, durations, max, integrated, average, n_off, off_durations]`,
    /// every list padded with zeros to `width()`. The row length is `3 + 5 * width()`.
    pub fn to_array(&self) -> Array2<f64> {
        let w = self.width();
        let mut table = Array2::<f64>::zeros((self.spots.len(), 3 + 5 * w));
        for (row, spot) in self.spots.iter().enumerate() {
            table[[row, 0]] = spot.spot_id as f64;
            table[[row, 1]] = spot.bursts.len() as f64;
            for (k, burst) in spot.bursts.iter().enumerate() {
                table[[row, 2 + k]] = burst.duration as f64;
                table[[row, 2 + w + k]] = burst.max_amplitude;
                table[[row, 2 + 2 * w + k]] = burst.integrated_amplitude;
                table[[row, 2 + 3 * w + k]] = burst.average_amplitude;
            }
            table[[row, 2 + 4 * w]] = spot.off_intervals.len() as f64;
            for (k, interval) in spot.off_intervals.iter().take(w).enumerate() {
                table[[row, 3 + 4 * w + k]] = interval.len() as f64;
            }
        }
        table
    }
}

/// Burst statistics from per-spot intensity and volume series sharing the same rows.
pub fn burst_statistics(intensity: &SpotSeries, volume: &SpotSeries) -> Result<BurstTable> {
    if intensity.spot_ids != volume.spot_ids {
        return Err(PipelineError::invalid_config(
            "intensity and volume series must list the same spot IDs",
        ));
    }
    ensure_shape("volume series", intensity.values.shape(), volume.values.shape())?;

    let spots: Vec<SpotBursts> = intensity
        .spot_ids
        .iter()
        .enumerate()
        .map(|(row, &id)| {
            let i = intensity.values.row(row).to_vec();
            let v = volume.values.row(row).to_vec();
            spot_bursts(id, &i, &v)
        })
        .collect();

    let table = BurstTable { spots };
    info!(spots = table.spots.len(), width = table.width(), "burst statistics complete");
    Ok(table)
}

/// Burst statistics from per-pixel intensity and volume maps under a spot track.
pub fn extract_bursts(intensity: ArrayView3<f64>, volume: ArrayView3<f64>, track: ArrayView3<u32>) -> Result<BurstTable> {
    let intensity = intensity_series(track, intensity)?;
    let volume = intensity_series(track, volume)?;
    burst_statistics(&intensity, &volume)
}
