// THEORY:
// The `pipeline` module is the top-level API of the engine. It runs the full
// post-processing of one movie in a fixed order:
// 1.  Assign raw spot detections to nuclei, giving the spot track.
// 2.  Propose the one-spot-per-nucleus removal mask (optional).
// 3.  Propose the isolated-activation mask on the track with mask 1 already removed,
//     so that a frame emptied by the split filter cannot shield a neighbour.
// 4.  Union both masks and apply them to the track and to the per-pixel maps.
// 5.  Classify nucleus activity on the filtered track.
// 6.  Estimate background-corrected intensities on the worker pool.
// 7.  Derive burst statistics from the corrected intensity and the spot volume.
//
// Inputs are checked once here; a shape mismatch stops the run before any work.

use crate::core_modules::activity::{ActivityReport, classify_activity, filter_preview};
use crate::core_modules::background::{BackgroundEstimator, IntensityTable};
use crate::core_modules::bursts::{BurstTable, burst_statistics};
use crate::core_modules::cage::CageGeometry;
use crate::core_modules::label_volume::{LabelVolume, RemovalMask};
use crate::core_modules::progress::{NoProgress, ProgressObserver};
use crate::core_modules::spot_assigner::assign_spots;
use crate::core_modules::spot_filter::{
    FilterSlots, apply_removal, apply_removal_f64, one_spot_per_nucleus_parallel, remove_isolated, union_masks,
};
use crate::core_modules::spot_series::{SpotSeries, Trajectory, centroid_trajectories, intensity_series};
use crate::error::{PipelineError, Result, ensure_shape};
use crate::parallel_pipeline::ChunkWorkerPool;
use ndarray::{Array3, Array4};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Configuration for the SpotPipeline, allowing for tunable behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Largest half-side of the square searched around a spot lying outside every nucleus.
    pub spot_nucleus_max_distance: usize,
    pub one_spot_per_nucleus: bool,
    /// Hull area over region area above which a region is split.
    pub solidity_threshold: f64,
    pub isolation_slots: FilterSlots,
    pub cage: CageGeometry,
    /// Cap on the worker pool; `None` uses the core count up to 16.
    pub max_workers: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            spot_nucleus_max_distance: 5,
            one_spot_per_nucleus: true,
            solidity_threshold: 2.0,
            isolation_slots: FilterSlots::default(),
            cage: CageGeometry::default(),
            max_workers: None,
        }
    }
}

impl PipelineConfig {
    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.spot_nucleus_max_distance == 0 {
            return Err(PipelineError::invalid_config("spot_nucleus_max_distance must be at least 1"));
        }
        if !self.solidity_threshold.is_finite() || self.solidity_threshold <= 0.0 {
            return Err(PipelineError::invalid_config(format!(
                "solidity_threshold must be a positive number, got {}",
                self.solidity_threshold
            )));
        }
        if self.max_workers == Some(0) {
            return Err(PipelineError::invalid_config("max_workers must be at least 1"));
        }
        self.isolation_slots.validate()?;
        self.cage.validate()
    }
}

/// The volumes of one movie. Shared with the workers, never modified.
#[derive(Debug, Clone)]
pub struct PipelineInputs {
    /// `(t, x, y)` tracked nuclei.
    pub nuclei: Arc<LabelVolume>,
    /// `(t, x, y)` raw spot detections, any non-zero pixel is spot.
    pub spot_mask: Arc<LabelVolume>,
    /// `(t, z, x, y)` raw intensity of the spot channel.
    pub raw: Arc<Array4<f64>>,
    /// `(t, x, y)` projected spot intensity.
    pub spot_intensity: Arc<Array3<f64>>,
    /// `(t, x, y)` spot volume in voxels.
    pub spot_volume: Arc<Array3<f64>>,
}

impl PipelineInputs {
    pub fn new(
        nuclei: LabelVolume,
        spot_mask: LabelVolume,
        raw: Array4<f64>,
        spot_intensity: Array3<f64>,
        spot_volume: Array3<f64>,
    ) -> Self {
        Self {
            nuclei: Arc::new(nuclei),
            spot_mask: Arc::new(spot_mask),
            raw: Arc::new(raw),
            spot_intensity: Arc::new(spot_intensity),
            spot_volume: Arc::new(spot_volume),
        }
    }

    /// Every volume must match the nuclei on `(t, x, y)`.
    pub fn validate(&self) -> Result<()> {
        let expected = self.nuclei.shape();
        let (t_tot, _z, x_tot, y_tot) = self.raw.dim();
        ensure_shape("spot mask", expected, self.spot_mask.shape())?;
        ensure_shape("raw volume (t, x, y)", expected, &[t_tot, x_tot, y_tot])?;
        ensure_shape("spot intensity", expected, self.spot_intensity.shape())?;
        ensure_shape("spot volume", expected, self.spot_volume.shape())
    }
}

/// Everything a run produces.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    /// The assigned track before filtering.
    pub spot_track: LabelVolume,
    /// The assigned track with the union mask applied.
    pub filtered_track: LabelVolume,
    pub one_spot_mask: RemovalMask,
    pub isolated_mask: RemovalMask,
    pub removal_mask: RemovalMask,
    /// `sign(track) + removal + 3 * sign(nuclei)` over the unfiltered track.
    pub filter_preview: Array3<u8>,
    /// Activity on the filtered track.
    pub activity: ActivityReport,
    pub intensity: IntensityTable,
    pub bursts: BurstTable,
    /// Summed per-pixel intensity under each filtered spot.
    pub raw_series: SpotSeries,
    pub trajectories: Vec<Trajectory>,
}

/// The main, top-level struct for the engine.
pub struct SpotPipeline {
    config: PipelineConfig,
    pool: ChunkWorkerPool,
    observer: Arc<dyn ProgressObserver>,
}

impl SpotPipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let pool = ChunkWorkerPool::new(config.max_workers);
        Ok(Self {
            config,
            pool,
            observer: Arc::new(NoProgress),
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run(&self, inputs: &PipelineInputs) -> Result<PipelineOutput> {
        inputs.validate()?;
        let dim = inputs.nuclei.dim();
        info!(frames = dim.0, width = dim.1, height = dim.2, workers = self.pool.workers(), "pipeline start");

        // --- 1. Assignment ---
        let spot_track = assign_spots(
            inputs.nuclei.view(),
            inputs.spot_mask.view(),
            self.config.spot_nucleus_max_distance,
            self.observer.as_ref(),
        )?;

        // --- 2. Filters ---
        let one_spot_mask = if self.config.one_spot_per_nucleus {
            one_spot_per_nucleus_parallel(
                &self.pool,
                Arc::new(spot_track.clone()),
                self.config.solidity_threshold,
                Arc::clone(&self.observer),
            )
            .await?
        } else {
            RemovalMask::zeros(dim)
        };
        let without_split = apply_removal(spot_track.view(), one_spot_mask.view())?;
        let isolated_mask = remove_isolated(without_split.view(), &self.config.isolation_slots, self.observer.as_ref())?;
        let removal_mask = union_masks(one_spot_mask.view(), isolated_mask.view())?;
        let filtered_track = apply_removal(spot_track.view(), removal_mask.view())?;
        let filter_preview = filter_preview(spot_track.view(), removal_mask.view(), inputs.nuclei.view())?;

        // --- 3. Activity ---
        let activity = classify_activity(filtered_track.view(), inputs.nuclei.view())?;

        // --- 4. Background ---
        let spot_intensity = apply_removal_f64(inputs.spot_intensity.view(), removal_mask.view())?;
        let spot_volume = apply_removal_f64(inputs.spot_volume.view(), removal_mask.view())?;
        let raw_series = intensity_series(filtered_track.view(), spot_intensity.view())?;
        let estimator = BackgroundEstimator::new(self.pool.clone(), self.config.cage);
        let filtered = Arc::new(filtered_track);
        let intensity = estimator
            .estimate(
                Arc::clone(&inputs.raw),
                Arc::new(spot_intensity),
                Arc::new(spot_volume),
                Arc::clone(&filtered),
                Arc::clone(&self.observer),
            )
            .await?;

        // --- 5. Bursts ---
        let corrected = SpotSeries {
            spot_ids: intensity.spot_ids.clone(),
            values: intensity.corrected.clone(),
        };
        let volume = SpotSeries {
            spot_ids: intensity.spot_ids.clone(),
            values: intensity.spot_volume.clone(),
        };
        let bursts = burst_statistics(&corrected, &volume)?;

        let filtered_track = Arc::try_unwrap(filtered).unwrap_or_else(|shared| (*shared).clone());
        let trajectories = centroid_trajectories(filtered_track.view());
        info!(
            spots = intensity.spot_ids.len(),
            removed_pixels = removal_mask.iter().filter(|&&v| v != 0).count(),
            "pipeline complete"
        );

        Ok(PipelineOutput {
            spot_track,
            filtered_track,
            one_spot_mask,
            isolated_mask,
            removal_mask,
            filter_preview,
            activity,
            intensity,
            bursts,
            raw_series,
            trajectories,
        })
    }
}
