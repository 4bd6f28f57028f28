use ndarray::{Array2, Axis};
use rayon::prelude::*;

use super::{median, ChromaMatrix, ChromaStage, PipelineError, Result};
use crate::music::PitchClass;

/// Folds constant-Q bins onto pitch classes, then denoises.
///
/// Denoising is a nearest-neighbour median filter across time (each column is
/// replaced by the per-bin median of its most cosine-similar columns, but never
/// raised above its own values) followed by a median filter along time.
#[derive(Debug, Clone)]
pub struct FilteredChroma {
    min_freq: f64,
    bins_per_octave: usize,
    median_width: usize,
    nn_filter: bool,
}

impl FilteredChroma {
    pub fn new(min_freq: f64, bins_per_octave: usize, median_width: usize, nn_filter: bool) -> Self {
        Self {
            min_freq,
            bins_per_octave,
            median_width,
            nn_filter,
        }
    }

    /// Pitch class of the centre frequency of spectral bin `k`.
    fn pitch_class_of_bin(&self, k: usize) -> usize {
        let freq = self.min_freq * 2f64.powf(k as f64 / self.bins_per_octave as f64);
        let semitones = 12.0 * (freq / PitchClass::C.frequency(0)).log2();
        (semitones.round() as i64).rem_euclid(12) as usize
    }
}

impl ChromaStage for FilteredChroma {
    fn fold(&self, spectrum: &Array2<f32>) -> Result<ChromaMatrix> {
        let (n_bins, n_frames) = spectrum.dim();
        if n_bins == 0 || n_frames == 0 {
            return Err(PipelineError::Shape(format!(
                "cannot fold an empty spectrum {:?}",
                spectrum.dim()
            )));
        }

        let mut chroma = Array2::<f32>::zeros((12, n_frames));
        for (k, row) in spectrum.axis_iter(Axis(0)).enumerate() {
            let pc = self.pitch_class_of_bin(k);
            let mut target = chroma.row_mut(pc);
            target += &row;
        }
        normalize_columns(&mut chroma);

        if self.nn_filter {
            let filtered = nn_median_filter(&chroma);
            chroma.zip_mut_with(&filtered, |c, &f| *c = c.min(f));
        }

        Ok(median_filter_time(&chroma, self.median_width))
    }
}

/// Scale each column so its largest value is 1. Silent columns stay zero.
pub fn normalize_columns(chroma: &mut Array2<f32>) {
    for mut column in chroma.axis_iter_mut(Axis(1)) {
        let peak = column.iter().copied().fold(0.0f32, f32::max);
        if peak > 0.0 {
            column /= peak;
        }
    }
}

/// Number of neighbours used by the nearest-neighbour filter.
pub fn neighbour_count(n_frames: usize) -> usize {
    let k = 2 * (n_frames as f64).sqrt().ceil() as usize;
    k.min(n_frames.saturating_sub(1))
}

/// Replace each column with the per-bin median of its `k` most cosine-similar
/// other columns. With fewer than two columns the input is returned as is.
pub fn nn_median_filter(chroma: &Array2<f32>) -> Array2<f32> {
    let (n_rows, n_frames) = chroma.dim();
    let k = neighbour_count(n_frames);
    if k == 0 {
        return chroma.clone();
    }

    let unit: Vec<Vec<f32>> = chroma
        .axis_iter(Axis(1))
        .map(|col| {
            let norm = col.iter().map(|v| v * v).sum::<f32>().sqrt();
            if norm > 0.0 {
                col.iter().map(|v| v / norm).collect()
            } else {
                vec![0.0; n_rows]
            }
        })
        .collect();

    let columns: Vec<Vec<f32>> = (0..n_frames)
        .into_par_iter()
        .map(|i| {
            let mut similar: Vec<(f32, usize)> = (0..n_frames)
                .filter(|&j| j != i)
                .map(|j| {
                    let sim: f32 = unit[i].iter().zip(&unit[j]).map(|(a, b)| a * b).sum();
                    (sim, j)
                })
                .collect();
            // most similar first, earlier frames win ties
            similar.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
            similar.truncate(k);

            let mut values = Vec::with_capacity(k);
            (0..n_rows)
                .map(|r| {
                    values.clear();
                    values.extend(similar.iter().map(|&(_, j)| chroma[[r, j]]));
                    median(&mut values)
                })
                .collect()
        })
        .collect();

    let mut out = Array2::<f32>::zeros((n_rows, n_frames));
    for (t, column) in columns.into_iter().enumerate() {
        for (r, value) in column.into_iter().enumerate() {
            out[[r, t]] = value;
        }
    }
    out
}

/// Index into `0..n` with half-sample symmetric reflection at both ends.
fn reflect(index: isize, n: usize) -> usize {
    let n = n as isize;
    let mut i = index;
    loop {
        if i < 0 {
            i = -i - 1;
        } else if i >= n {
            i = 2 * n - i - 1;
        } else {
            return i as usize;
        }
    }
}

/// Median filter along the time axis with reflect padding. A width of 0 or 1
/// leaves the input unchanged.
pub fn median_filter_time(chroma: &Array2<f32>, width: usize) -> Array2<f32> {
    if width <= 1 {
        return chroma.clone();
    }
    let (n_rows, n_frames) = chroma.dim();
    let half = (width / 2) as isize;
    let mut out = Array2::<f32>::zeros((n_rows, n_frames));
    let mut window = Vec::with_capacity(width);
    for r in 0..n_rows {
        for t in 0..n_frames {
            window.clear();
            for offset in -half..=half {
                window.push(chroma[[r, reflect(t as isize + offset, n_frames)]]);
            }
            out[[r, t]] = median(&mut window);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_bins_fold_to_pitch_classes() {
        let stage = FilteredChroma::new(110.0, 12, 9, true);
        // 110 Hz is an A
        assert_eq!(stage.pitch_class_of_bin(0), 9);
        assert_eq!(stage.pitch_class_of_bin(3), 0);
        assert_eq!(stage.pitch_class_of_bin(12), 9);

        let wide = FilteredChroma::new(110.0, 24, 9, true);
        assert_eq!(wide.pitch_class_of_bin(2), 10);
    }

    #[test]
    fn test_fold_shape_and_normalisation() {
        let stage = FilteredChroma::new(110.0, 12, 1, false);
        let mut spectrum = Array2::<f32>::zeros((24, 3));
        spectrum[[0, 0]] = 2.0; // A
        spectrum[[12, 0]] = 2.0; // A, next octave
        spectrum[[3, 0]] = 1.0; // C
        let chroma = stage.fold(&spectrum).unwrap();
        assert_eq!(chroma.dim(), (12, 3));
        assert!((chroma[[9, 0]] - 1.0).abs() < 1e-6);
        assert!((chroma[[0, 0]] - 0.25).abs() < 1e-6);
        // silent frames stay silent
        assert!(chroma.column(1).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_neighbour_count() {
        assert_eq!(neighbour_count(1), 0);
        assert_eq!(neighbour_count(2), 1);
        assert_eq!(neighbour_count(100), 20);
        assert_eq!(neighbour_count(101), 22);
    }

    #[test]
    fn test_nn_filter_suppresses_outlier() {
        let mut chroma = Array2::<f32>::zeros((12, 10));
        for t in 0..10 {
            chroma[[0, t]] = 1.0;
        }
        chroma[[6, 5]] = 1.0;
        let filtered = nn_median_filter(&chroma);
        assert!(filtered[[6, 5]] < 1e-6);
        assert!((filtered[[0, 5]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_median_filter_time_reflects() {
        let chroma = array![[1.0f32, 5.0, 1.0, 1.0, 9.0]];
        let out = median_filter_time(&chroma, 3);
        assert_eq!(out.row(0).to_vec(), vec![1.0, 1.0, 1.0, 1.0, 9.0]);
        assert_eq!(median_filter_time(&chroma, 1), chroma);
    }

    #[test]
    fn test_reflect_index() {
        assert_eq!(reflect(-1, 5), 0);
        assert_eq!(reflect(-2, 5), 1);
        assert_eq!(reflect(5, 5), 4);
        assert_eq!(reflect(6, 5), 3);
        assert_eq!(reflect(-3, 1), 0);
    }
}
