//! Convex-hull area of a pixel region, used for the solidity test.
//!
//! Each pixel contributes the four points of its diamond (centre ± 0.5 along
//! each axis). The hull area is the number of pixels of the bounding box whose
//! centre lies inside the hull of those points.

use crate::core_modules::label_volume::Point2D;

const EPS: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq)]
struct P {
    x: f64,
    y: f64,
}

fn cross(o: P, a: P, b: P) -> f64 {
    (a.x - o.x) * (b.y - o.y) - (a.y - o.y) * (b.x - o.x)
}

/// Andrew's monotone chain; returns the hull counter-clockwise without repeats.
fn hull(mut points: Vec<P>) -> Vec<P> {
    points.sort_by(|a, b| a.x.total_cmp(&b.x).then(a.y.total_cmp(&b.y)));
    points.dedup();
    if points.len() < 3 {
        return points;
    }

    let mut lower: Vec<P> = Vec::new();
    for &p in &points {
        while lower.len() >= 2 && cross(lower[lower.len() - 2], lower[lower.len() - 1], p) <= 0.0 {
            lower.pop();
        }
        lower.push(p);
    }
    let mut upper: Vec<P> = Vec::new();
    for &p in points.iter().rev() {
        while upper.len() >= 2 && cross(upper[upper.len() - 2], upper[upper.len() - 1], p) <= 0.0 {
            upper.pop();
        }
        upper.push(p);
    }
    lower.pop();
    upper.pop();
    lower.extend(upper);
    lower
}

fn contains(polygon: &[P], p: P) -> bool {
    let n = polygon.len();
    (0..n).all(|i| cross(polygon[i], polygon[(i + 1) % n], p) >= -EPS)
}

/// Pixel count of the filled convex hull of `pixels`.
pub fn convex_hull_area(pixels: &[Point2D]) -> usize {
    if pixels.is_empty() {
        return 0;
    }

    let mut points = Vec::with_capacity(pixels.len() * 4);
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (usize::MAX, usize::MAX, 0, 0);
    for px in pixels {
        let (x, y) = (px.x as f64, px.y as f64);
        points.push(P { x: x - 0.5, y });
        points.push(P { x: x + 0.5, y });
        points.push(P { x, y: y - 0.5 });
        points.push(P { x, y: y + 0.5 });
        min_x = min_x.min(px.x);
        min_y = min_y.min(px.y);
        max_x = max_x.max(px.x);
        max_y = max_y.max(px.y);
    }

    let polygon = hull(points);
    let mut area = 0;
    for x in min_x..=max_x {
        for y in min_y..=max_y {
            if contains(&polygon, P { x: x as f64, y: y as f64 }) {
                area += 1;
            }
        }
    }
    area
}
