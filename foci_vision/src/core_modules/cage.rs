// THEORY:
// A cage is the sampling region used to measure the local background around a spot:
// an axis-aligned 3D box centred on the spot with a smaller concentric box carved out
// of it. The carved-out core holds the spot's own signal, the shell around it holds
// the nucleoplasm the spot sits in.
//
// All cages of a frame are painted into one label volume in two passes:
// 1.  **Shells**: every spot paints its outer box with its label, in label order. Where
//     two outer boxes overlap the later spot wins; nearby spots lose part of their
//     shell to each other, which is accepted as an approximation.
// 2.  **Cores**: every spot then clears its inner box. No cage voxel is left inside any
//     spot's core, so a spot's own signal never lands in a neighbour's background.

use crate::core_modules::label_volume::{Point3D, Region};
use crate::error::{PipelineError, Result};
use ndarray::{Array3, ArrayView3, s};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Half-extents `(z, x, y)` of the two boxes of a cage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CageGeometry {
    pub outer: [usize; 3],
    pub inner: [usize; 3],
}

impl Default for CageGeometry {
    fn default() -> Self {
        // z is sampled more finely than x and y, hence the thinner shell.
        Self {
            outer: [5, 9, 9],
            inner: [3, 7, 7],
        }
    }
}

impl CageGeometry {
    pub fn validate(&self) -> Result<()> {
        if self.inner.iter().zip(&self.outer).any(|(inner, outer)| inner >= outer) {
            return Err(PipelineError::invalid_config(format!(
                "inner cage {:?} must be smaller than outer cage {:?} on every axis",
                self.inner, self.outer
            )));
        }
        Ok(())
    }
}

/// An axis-aligned box clipped to a frame, as half-open ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClippedBox {
    pub z: Range<usize>,
    pub x: Range<usize>,
    pub y: Range<usize>,
}

impl ClippedBox {
    pub fn around(centre: Point3D, half: [usize; 3], dims: (usize, usize, usize)) -> Self {
        let axis = |c: usize, h: usize, len: usize| c.saturating_sub(h)..(c + h + 1).min(len);
        Self {
            z: axis(centre.z, half[0], dims.0),
            x: axis(centre.x, half[1], dims.1),
            y: axis(centre.y, half[2], dims.2),
        }
    }

    pub fn volume(&self) -> usize {
        self.z.len() * self.x.len() * self.y.len()
    }
}

/// The painted cages of one frame.
#[derive(Debug, Clone)]
pub struct CageVolume {
    /// `(z, x, y)` labels: a spot's label on its remaining shell voxels, 0 elsewhere.
    pub labels: Array3<u32>,
    /// The 3D centre used for each spot, in painting order.
    pub centres: Vec<(u32, Point3D)>,
}

/// Rounded 2D centroid of `region` with `z` at the brightest plane under it.
pub fn spot_centre_3d(raw_frame: ArrayView3<f64>, region: &Region) -> Point3D {
    let centroid = region.centroid();
    let column = raw_frame.slice(s![.., centroid.x, centroid.y]);
    let mut z = 0;
    let mut best = f64::NEG_INFINITY;
    for (i, &v) in column.iter().enumerate() {
        if v > best {
            best = v;
            z = i;
        }
    }
    Point3D {
        z,
        x: centroid.x,
        y: centroid.y,
    }
}

/// Paints the cages of `spots` (in the given order) over a `(z, x, y)` raw frame.
pub fn build_cage_volume(raw_frame: ArrayView3<f64>, spots: &[Region], geometry: &CageGeometry) -> CageVolume {
    let dims = raw_frame.dim();
    let mut labels = Array3::<u32>::zeros(dims);
    let mut centres = Vec::with_capacity(spots.len());

    // --- 1. Shells ---
    for region in spots {
        let centre = spot_centre_3d(raw_frame, region);
        let outer = ClippedBox::around(centre, geometry.outer, dims);
        labels
            .slice_mut(s![outer.z, outer.x, outer.y])
            .fill(region.label);
        centres.push((region.label, centre));
    }

    // --- 2. Cores ---
    for &(_, centre) in &centres {
        let inner = ClippedBox::around(centre, geometry.inner, dims);
        labels.slice_mut(s![inner.z, inner.x, inner.y]).fill(0);
    }

    CageVolume { labels, centres }
}
