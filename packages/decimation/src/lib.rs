#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Point-set decimation.
//!
//! Each algorithm reduces a set of [`DataPoint`]s to at most `target_count`
//! points. Inputs already within budget are returned untouched.
//!
//! - [`random`]: shuffle and truncate. No bias, no guarantees.
//! - [`spatial`]: grid the bounding box and keep the most accurate points
//!   from every occupied cell.
//! - [`temporal`]: sample evenly along the date axis.

use std::collections::BTreeMap;

use occurrence_map_occurrence_models::{DataPoint, DecimationAlgorithm};
use rand::seq::SliceRandom;

/// Reduces `points` to at most `target_count` using `algorithm`.
#[must_use]
pub fn decimate(
    points: Vec<DataPoint>,
    target_count: usize,
    algorithm: DecimationAlgorithm,
) -> Vec<DataPoint> {
    let input_len = points.len();
    let output = match algorithm {
        DecimationAlgorithm::Random => random(points, target_count),
        DecimationAlgorithm::Spatial => spatial(points, target_count),
        DecimationAlgorithm::Temporal => temporal(points, target_count),
    };
    log::debug!(
        "{algorithm} decimation: {input_len} -> {} points (target {target_count})",
        output.len()
    );
    output
}

/// Shuffles the points and keeps the first `target_count`.
#[must_use]
pub fn random(mut points: Vec<DataPoint>, target_count: usize) -> Vec<DataPoint> {
    if points.len() <= target_count {
        return points;
    }

    let mut rng = rand::rng();
    points.shuffle(&mut rng);
    points.truncate(target_count);
    points
}

/// Side length of the square grid used by [`spatial`]: `⌈√target_count⌉`.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn grid_size(target_count: usize) -> usize {
    let mut size = (target_count as f64).sqrt().ceil() as usize;
    // Float rounding can be off by one for large inputs.
    while size.saturating_mul(size) < target_count {
        size += 1;
    }
    while size > 1 && (size - 1) * (size - 1) >= target_count {
        size -= 1;
    }
    size.max(1)
}

/// Keeps the most accurate points from every occupied grid cell.
///
/// The bounding box of the input is split into a `g × g` grid with
/// `g = ⌈√target_count⌉`. Each occupied cell contributes its
/// `⌊target_count / occupied⌋` most accurate points; any remaining budget
/// is filled from the most accurate points not yet chosen. When there are
/// more occupied cells than budget, each cell's single best point competes
/// on accuracy. Ties keep input order, and the output keeps input order.
#[must_use]
pub fn spatial(points: Vec<DataPoint>, target_count: usize) -> Vec<DataPoint> {
    let n = points.len();
    if n <= target_count {
        return points;
    }
    if target_count == 0 {
        return Vec::new();
    }

    let grid = grid_size(target_count);
    let cells = assign_cells(&points, grid);
    let occupied = cells.len();
    let per_cell = target_count / occupied;

    let by_accuracy = |a: &usize, b: &usize| points[*a].accuracy.total_cmp(&points[*b].accuracy);

    let mut selected = vec![false; n];

    if per_cell == 0 {
        // Cell bests are collected in input order so the stable sort breaks
        // accuracy ties by position.
        let mut bests: Vec<usize> = cells.values().map(|members| members[0]).collect();
        bests.sort_unstable();
        bests.sort_by(by_accuracy);
        for i in bests.into_iter().take(target_count) {
            selected[i] = true;
        }
    } else {
        let mut count = 0;
        for members in cells.values() {
            for &i in members.iter().take(per_cell) {
                selected[i] = true;
                count += 1;
            }
        }

        if count < target_count {
            let mut rest: Vec<usize> = (0..n).filter(|i| !selected[*i]).collect();
            rest.sort_by(by_accuracy);
            for i in rest.into_iter().take(target_count - count) {
                selected[i] = true;
            }
        }
    }

    points
        .into_iter()
        .zip(selected)
        .filter_map(|(point, keep)| keep.then_some(point))
        .collect()
}

/// Buckets point indices by grid cell, each bucket sorted by ascending
/// accuracy (stable).
fn assign_cells(points: &[DataPoint], grid: usize) -> BTreeMap<(usize, usize), Vec<usize>> {
    let (mut min_lat, mut max_lat) = (f64::INFINITY, f64::NEG_INFINITY);
    let (mut min_lon, mut max_lon) = (f64::INFINITY, f64::NEG_INFINITY);
    for p in points {
        min_lat = min_lat.min(p.latitude);
        max_lat = max_lat.max(p.latitude);
        min_lon = min_lon.min(p.longitude);
        max_lon = max_lon.max(p.longitude);
    }

    let mut cells: BTreeMap<(usize, usize), Vec<usize>> = BTreeMap::new();
    for (i, p) in points.iter().enumerate() {
        let row = axis_index(p.latitude, min_lat, max_lat - min_lat, grid);
        let col = axis_index(p.longitude, min_lon, max_lon - min_lon, grid);
        cells.entry((row, col)).or_default().push(i);
    }

    for members in cells.values_mut() {
        members.sort_by(|a, b| points[*a].accuracy.total_cmp(&points[*b].accuracy));
    }

    cells
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn axis_index(value: f64, min: f64, span: f64, grid: usize) -> usize {
    if span <= 0.0 {
        return 0;
    }
    let idx = ((value - min) / span * grid as f64).floor();
    (idx.max(0.0) as usize).min(grid - 1)
}

/// Samples evenly along the date axis.
///
/// Points are sorted by date (stable) and `target_count` indices are taken
/// at a uniform stride. With two or more picks the stride is
/// `(n - 1) / (target_count - 1)`, so the earliest and latest points are
/// always kept. Output is date-ascending.
#[must_use]
pub fn temporal(mut points: Vec<DataPoint>, target_count: usize) -> Vec<DataPoint> {
    let n = points.len();
    if n <= target_count {
        return points;
    }
    if target_count == 0 {
        return Vec::new();
    }

    points.sort_by_key(|p| p.date);

    if target_count == 1 {
        points.truncate(1);
        return points;
    }

    let mut picks = (0..target_count)
        .map(|i| i * (n - 1) / (target_count - 1))
        .peekable();

    points
        .into_iter()
        .enumerate()
        .filter_map(|(i, point)| {
            if picks.peek() == Some(&i) {
                picks.next();
                Some(point)
            } else {
                None
            }
        })
        .collect()
}
