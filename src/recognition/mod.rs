pub mod hcdf;
pub mod learn;
pub mod template;

use thiserror::Error;

use crate::music::Chord;
use crate::pipeline::ChromaMatrix;

pub use learn::{Classifier, LearnedRecognizer, NearestCentroid, SupervisedVectors, SvmClassifier};
pub use template::TemplateRecognizer;

#[derive(Error, Debug, PartialEq)]
pub enum RecognitionError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Illegal state: {0}")]
    IllegalState(String),
    #[error("Training failed: {0}")]
    Training(String),
}

pub type Result<T> = std::result::Result<T, RecognitionError>;

/// Maps each chroma column to a chord.
pub trait ChordRecognizer: Send + Sync {
    fn predict(&self, chroma: &ChromaMatrix) -> Result<Vec<Chord>>;
}

/// Reject chroma matrices that do not have one row per pitch class.
pub(crate) fn check_rows(chroma: &ChromaMatrix) -> Result<()> {
    if chroma.nrows() != 12 {
        return Err(RecognitionError::InvalidArgument(format!(
            "chroma must have 12 rows, got {}",
            chroma.nrows()
        )));
    }
    Ok(())
}

/// Copy column `t` of a 12-row chroma matrix into a fixed array.
pub(crate) fn column_array(chroma: &ChromaMatrix, t: usize) -> [f32; 12] {
    let mut out = [0.0f32; 12];
    for (slot, &v) in out.iter_mut().zip(chroma.column(t).iter()) {
        *slot = v;
    }
    out
}
