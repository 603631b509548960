// Algorithmic building blocks, one file per component. `pipeline` wires them together.

pub mod activity;
pub mod background;
pub mod bursts;
pub mod cage;
pub mod convex_hull;
pub mod label_volume;
pub mod nearest_label;
pub mod progress;
pub mod spot_assigner;
pub mod spot_filter;
pub mod spot_series;
