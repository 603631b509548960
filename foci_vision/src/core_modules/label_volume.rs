// THEORY:
// The `label_volume` module holds the data model shared by every other layer.
// A label volume is a time-ordered stack of 2D integer planes indexed `(t, x, y)`
// where 0 is background and every positive value names a region. The same
// representation carries the raw spot detections, the upstream nucleus tracks
// and the spot tracks this engine produces.
//
// Key architectural principles:
// 1.  **Region Growing**: Connected components are found by seeding at the first
//     unvisited pixel in raster order and growing through neighbours that share
//     the seed's value. IDs are therefore handed out in scan order, which makes
//     every downstream tie-break deterministic.
// 2.  **Dumb Data Containers**: `Region`, `Point2D` and `Point3D` only hold data and
//     summarise themselves (area, bounding box, centroid). They know nothing
//     about nuclei, tracks or time.
// 3.  **Views In, Owned Out**: Every function borrows `ndarray` views and returns
//     owned arrays, so callers can pass slices of larger volumes without copying.

use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis};
use std::collections::{BTreeMap, BTreeSet};

/// A `(t, x, y)` stack of label planes.
pub type LabelVolume = Array3<u32>;
/// A `(t, x, y)` stack of 0/1 flags marking pixels to remove.
pub type RemovalMask = Array3<u8>;
/// Per-frame presence (0/1) of one spot ID.
pub type ActivityProfile = Vec<u8>;

/// Integer pixel coordinate inside a single plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Point2D {
    pub x: usize,
    pub y: usize,
}

/// Integer voxel coordinate inside a single 3D frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Point3D {
    pub z: usize,
    pub x: usize,
    pub y: usize,
}

/// Neighbourhood used when growing a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    /// Edge neighbours only.
    Four,
    /// Edge and corner neighbours.
    Eight,
}

impl Connectivity {
    fn offsets(self) -> &'static [(isize, isize)] {
        match self {
            Connectivity::Four => &[(0, 1), (0, -1), (1, 0), (-1, 0)],
            Connectivity::Eight => &[
                (-1, -1),
                (-1, 0),
                (-1, 1),
                (0, -1),
                (0, 1),
                (1, -1),
                (1, 0),
                (1, 1),
            ],
        }
    }
}

/// All the pixels carrying one label in one plane.
#[derive(Debug, Clone)]
pub struct Region {
    /// The label value shared by every pixel of the region.
    pub label: u32,
    /// Member pixels in raster order.
    pub pixels: Vec<Point2D>,
    /// Inclusive top-left and bottom-right corners.
    pub bounding_box: (Point2D, Point2D),
}

impl Region {
    fn from_pixels(label: u32, pixels: Vec<Point2D>) -> Self {
        let mut min = Point2D { x: usize::MAX, y: usize::MAX };
        let mut max = Point2D { x: 0, y: 0 };
        for p in &pixels {
            min.x = min.x.min(p.x);
            min.y = min.y.min(p.y);
            max.x = max.x.max(p.x);
            max.y = max.y.max(p.y);
        }
        Self {
            label,
            pixels,
            bounding_box: (min, max),
        }
    }

    pub fn area(&self) -> usize {
        self.pixels.len()
    }

    /// Mean member coordinate rounded to the nearest pixel.
    pub fn centroid(&self) -> Point2D {
        if self.pixels.is_empty() {
            return Point2D { x: 0, y: 0 };
        }
        let n = self.pixels.len() as f64;
        let (sx, sy) = self
            .pixels
            .iter()
            .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x as f64, sy + p.y as f64));
        Point2D {
            x: (sx / n).round() as usize,
            y: (sy / n).round() as usize,
        }
    }
}

/// Labels the connected components of a plane.
///
/// Neighbouring non-zero pixels join when they carry the same value, so a binary
/// mask yields its plain components and a label image keeps touching labels
/// apart. Returns the relabelled plane and the number of components.
pub fn label_components(frame: ArrayView2<u32>, connectivity: Connectivity) -> (Array2<u32>, u32) {
    let (width, height) = frame.dim();
    let mut labels = Array2::<u32>::zeros((width, height));
    let mut next_label = 0u32;
    let mut stack: Vec<(usize, usize)> = Vec::new();

    for x in 0..width {
        for y in 0..height {
            let value = frame[[x, y]];
            if value == 0 || labels[[x, y]] != 0 {
                continue;
            }

            next_label += 1;
            labels[[x, y]] = next_label;
            stack.push((x, y));

            while let Some((cx, cy)) = stack.pop() {
                for (dx, dy) in connectivity.offsets() {
                    let nx = cx as isize + dx;
                    let ny = cy as isize + dy;
                    if nx < 0 || ny < 0 || nx >= width as isize || ny >= height as isize {
                        continue;
                    }
                    let (nx, ny) = (nx as usize, ny as usize);
                    if labels[[nx, ny]] == 0 && frame[[nx, ny]] == value {
                        labels[[nx, ny]] = next_label;
                        stack.push((nx, ny));
                    }
                }
            }
        }
    }

    (labels, next_label)
}

/// Groups the pixels of a plane by label, sorted by label value.
pub fn regions(frame: ArrayView2<u32>) -> Vec<Region> {
    let mut members: BTreeMap<u32, Vec<Point2D>> = BTreeMap::new();
    for ((x, y), &label) in frame.indexed_iter() {
        if label != 0 {
            members.entry(label).or_default().push(Point2D { x, y });
        }
    }
    members
        .into_iter()
        .map(|(label, pixels)| Region::from_pixels(label, pixels))
        .collect()
}

/// Sorted distinct non-zero labels of a whole volume.
pub fn unique_labels(volume: ArrayView3<u32>) -> Vec<u32> {
    volume
        .iter()
        .filter(|&&v| v != 0)
        .copied()
        .collect::<BTreeSet<u32>>()
        .into_iter()
        .collect()
}

/// The 0/1 presence of `id` in every frame of `track`.
pub fn activity_profile(track: ArrayView3<u32>, id: u32) -> ActivityProfile {
    track
        .axis_iter(Axis(0))
        .map(|frame| u8::from(frame.iter().any(|&v| v == id)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn labels_follow_raster_order() {
        let frame = array![[0, 1, 0, 0], [0, 0, 0, 1], [1, 0, 0, 1]];
        let (labels, n) = label_components(frame.view(), Connectivity::Four);
        assert_eq!(n, 3);
        assert_eq!(labels[[0, 1]], 1);
        assert_eq!(labels[[1, 3]], 2);
        assert_eq!(labels[[2, 3]], 2);
        assert_eq!(labels[[2, 0]], 3);
    }

    #[test]
    fn diagonal_pixels_join_only_with_eight_connectivity() {
        let frame = array![[1, 0], [0, 1]];
        assert_eq!(label_components(frame.view(), Connectivity::Four).1, 2);
        assert_eq!(label_components(frame.view(), Connectivity::Eight).1, 1);
    }

    #[test]
    fn touching_labels_stay_separate() {
        let frame = array![[4, 4, 7], [4, 7, 7]];
        let (_, n) = label_components(frame.view(), Connectivity::Four);
        assert_eq!(n, 2);
    }

    #[test]
    fn regions_group_disconnected_pixels_of_one_label() {
        let frame = array![[3, 0, 3], [0, 0, 0], [0, 5, 0]];
        let found = regions(frame.view());
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].label, 3);
        assert_eq!(found[0].area(), 2);
        assert_eq!(found[0].centroid(), Point2D { x: 0, y: 1 });
        assert_eq!(found[0].bounding_box.1, Point2D { x: 0, y: 2 });
        assert_eq!(found[1].label, 5);
    }

    #[test]
    fn profile_marks_frames_containing_the_id() {
        let mut track = LabelVolume::zeros((4, 2, 2));
        track[[1, 0, 0]] = 9;
        track[[3, 1, 1]] = 9;
        track[[2, 1, 1]] = 2;
        assert_eq!(activity_profile(track.view(), 9), vec![0, 1, 0, 1]);
        assert_eq!(unique_labels(track.view()), vec![2, 9]);
    }
}
