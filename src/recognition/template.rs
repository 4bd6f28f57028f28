use std::sync::Arc;

use super::{check_rows, column_array, ChordRecognizer, RecognitionError, Result};
use crate::config::RecognitionConfig;
use crate::music::Chord;
use crate::pipeline::ChromaMatrix;
use crate::template::{TemplateBank, TemplateCache};

/// Template matching with a median gate.
///
/// A column is scored against all 48 templates. If the median score lies
/// strictly between the two thresholds the best template wins, otherwise the
/// column is "no chord". Equal best scores go to the template that comes
/// first in bank order.
#[derive(Debug, Clone)]
pub struct TemplateRecognizer {
    bank: Arc<TemplateBank>,
    bottom_threshold: f64,
    upper_threshold: f64,
}

impl TemplateRecognizer {
    pub fn new(alpha: f64, depth: usize, bottom_threshold: f64, upper_threshold: f64) -> Result<Self> {
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(RecognitionError::InvalidArgument(format!(
                "alpha must be in (0, 1], got {}",
                alpha
            )));
        }
        if depth == 0 {
            return Err(RecognitionError::InvalidArgument(
                "harmonic depth must be at least 1".into(),
            ));
        }
        if !(bottom_threshold < upper_threshold) {
            return Err(RecognitionError::InvalidArgument(format!(
                "bottom threshold {} must be below upper threshold {}",
                bottom_threshold, upper_threshold
            )));
        }
        Ok(Self {
            bank: TemplateCache::global().get(alpha, depth),
            bottom_threshold,
            upper_threshold,
        })
    }

    pub fn from_config(config: &RecognitionConfig) -> Result<Self> {
        Self::new(
            config.alpha,
            config.depth,
            config.bottom_threshold,
            config.upper_threshold,
        )
    }

    pub fn bank(&self) -> &TemplateBank {
        &self.bank
    }

    /// Chord for a single 12-bin column.
    pub fn predict_column(&self, column: &[f32; 12]) -> Chord {
        let scores: Vec<f64> = self.bank.templates().iter().map(|t| t.score(column)).collect();

        let med = median(&scores);
        if !(self.bottom_threshold < med && med < self.upper_threshold) {
            return Chord::NoChord;
        }

        let mut best = 0;
        for (i, &s) in scores.iter().enumerate().skip(1) {
            if s > scores[best] {
                best = i;
            }
        }
        self.bank.templates()[best].chord()
    }
}

impl ChordRecognizer for TemplateRecognizer {
    fn predict(&self, chroma: &ChromaMatrix) -> Result<Vec<Chord>> {
        check_rows(chroma)?;
        Ok((0..chroma.ncols())
            .map(|t| self.predict_column(&column_array(chroma, t)))
            .collect())
    }
}

/// Median of the scores; the mean of the middle pair for even counts.
fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}
