// THEORY:
// This file is the main entry point for the `foci_vision` library crate. It turns
// the raw outputs of a time-lapse microscopy segmentation (tracked nuclei and
// per-frame spot detections) into per-nucleus transcription measurements.
//
// The primary export is `SpotPipeline` with its `PipelineConfig`, `PipelineInputs`
// and `PipelineOutput`. The individual stages under `core_modules` stay public so
// that a collaborator can rerun a single stage (for instance the filters with new
// slot parameters) without going through the whole pipeline. File formats, report
// writing and interactive review are left to those collaborators.

pub mod core_modules;
pub mod error;
pub mod parallel_pipeline;
pub mod pipeline;

pub use error::{PipelineError, Result};
pub use pipeline::{PipelineConfig, PipelineInputs, PipelineOutput, SpotPipeline};
