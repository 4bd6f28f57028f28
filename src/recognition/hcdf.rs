//! Harmonic change detection.
//!
//! Chroma columns are projected onto a 6-D tonal centroid space (circles of
//! fifths, minor thirds and major thirds). Large jumps between nearby frames
//! mark likely chord changes.

use std::f64::consts::PI;
use std::sync::LazyLock;

use crate::pipeline::ChromaMatrix;

/// Radii of the fifths, minor-thirds and major-thirds circles.
const RADII: [f64; 3] = [1.0, 1.0, 0.5];

static CENTROID_MATRIX: LazyLock<[[f64; 12]; 6]> = LazyLock::new(|| {
    let angles = [7.0 * PI / 6.0, 3.0 * PI / 2.0, 2.0 * PI / 3.0];
    let mut m = [[0.0; 12]; 6];
    for (circle, (&angle, &radius)) in angles.iter().zip(&RADII).enumerate() {
        for l in 0..12 {
            m[2 * circle][l] = radius * (l as f64 * angle).sin();
            m[2 * circle + 1][l] = radius * (l as f64 * angle).cos();
        }
    }
    m
});

/// Tonal centroid of one chroma column, L1-normalised. Silent columns map to
/// the origin.
pub fn tonal_centroid(column: &[f32]) -> [f64; 6] {
    let l1: f64 = column.iter().map(|v| v.abs() as f64).sum();
    let mut out = [0.0; 6];
    if l1 <= 0.0 {
        return out;
    }
    for (row, slot) in CENTROID_MATRIX.iter().zip(out.iter_mut()) {
        *slot = row
            .iter()
            .zip(column)
            .map(|(m, &c)| m * c as f64 / l1)
            .sum();
    }
    out
}

/// Euclidean distance between the centroids of frames `t` and `t + 2`, for
/// every `t`. Shorter than the input by two frames.
pub fn hcdf(chroma: &ChromaMatrix) -> Vec<f64> {
    let centroids: Vec<[f64; 6]> = chroma
        .columns()
        .into_iter()
        .map(|col| tonal_centroid(&col.to_vec()))
        .collect();

    centroids
        .iter()
        .zip(centroids.iter().skip(2))
        .map(|(a, b)| {
            a.iter()
                .zip(b)
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f64>()
                .sqrt()
        })
        .collect()
}

/// The `count` strongest local maxima of the detection function, as
/// (time, strength) pairs sorted by time.
///
/// `boundaries` are the segment edges of the chroma the function was computed
/// on; value `i` sits at the centre segment `i + 1`, reported at its start.
pub fn strongest_changes(values: &[f64], boundaries: &[f64], count: usize) -> Vec<(f64, f64)> {
    let mut peaks: Vec<(f64, f64)> = (0..values.len())
        .filter(|&i| {
            let left = if i > 0 { values[i - 1] } else { f64::NEG_INFINITY };
            let right = values.get(i + 1).copied().unwrap_or(f64::NEG_INFINITY);
            values[i] > 0.0 && values[i] >= left && values[i] > right
        })
        .filter_map(|i| boundaries.get(i + 1).map(|&t| (t, values[i])))
        .collect();

    peaks.sort_by(|a, b| b.1.total_cmp(&a.1));
    peaks.truncate(count);
    peaks.sort_by(|a, b| a.0.total_cmp(&b.0));
    peaks
}
