pub mod cache;
pub mod chroma;
pub mod load;
pub mod segment;
pub mod spectral;

use std::path::Path;
use std::sync::Arc;

use ndarray::Array2;
use thiserror::Error;

use crate::config::{AppConfig, ChromaKind, LoaderKind, SegmentationKind, SpectralKind};
use cache::SampleCache;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Pipeline stage not configured: {0}")]
    MissingStage(&'static str),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Shape error: {0}")]
    Shape(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Pitch-class energies, shape (12, frames).
pub type ChromaMatrix = Array2<f32>;

/// Chroma plus optional segment boundary times in seconds.
pub type Segmented = (ChromaMatrix, Option<Vec<f64>>);

/// Decodes a file into mono samples at a fixed rate.
pub trait LoadStage: Send + Sync {
    fn load(&self, path: &Path) -> Result<Arc<Vec<f32>>>;
}

/// Turns samples into a magnitude spectrogram, shape (bins, frames).
pub trait SpectralStage: Send + Sync {
    fn transform(&self, samples: &[f32]) -> Result<Array2<f32>>;
}

/// Folds a spectrogram onto the 12 pitch classes.
pub trait ChromaStage: Send + Sync {
    fn fold(&self, spectrum: &Array2<f32>) -> Result<ChromaMatrix>;
}

/// Groups chroma frames into segments.
pub trait SegmentStage: Send + Sync {
    fn segment(&self, samples: &[f32], chroma: ChromaMatrix) -> Result<Segmented>;
}

/// Load, spectral, chroma and segmentation stages run in sequence.
pub struct AudioPipeline {
    load: Box<dyn LoadStage>,
    spectral: Box<dyn SpectralStage>,
    chroma: Box<dyn ChromaStage>,
    segment: Box<dyn SegmentStage>,
}

impl AudioPipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Run every stage on one file. Any stage failure aborts the run.
    pub fn process(&self, path: &Path) -> Result<Segmented> {
        let name = path.file_name().and_then(|f| f.to_str()).unwrap_or("?");

        let samples = self.load.load(path)?;
        log::debug!("{}: loaded {} samples", name, samples.len());

        let spectrum = self.spectral.transform(&samples)?;
        log::debug!("{}: spectrum {:?}", name, spectrum.dim());

        let chroma = self.chroma.fold(&spectrum)?;
        if chroma.nrows() != 12 {
            return Err(PipelineError::Shape(format!(
                "chroma stage produced {} rows",
                chroma.nrows()
            )));
        }

        let (chroma, boundaries) = self.segment.segment(&samples, chroma)?;
        log::debug!(
            "{}: {} segments{}",
            name,
            chroma.ncols(),
            if boundaries.is_some() { " (beat-synchronous)" } else { "" }
        );
        Ok((chroma, boundaries))
    }
}

/// Assembles an [`AudioPipeline`]; every stage must be set before `build`.
#[derive(Default)]
pub struct PipelineBuilder {
    load: Option<Box<dyn LoadStage>>,
    spectral: Option<Box<dyn SpectralStage>>,
    chroma: Option<Box<dyn ChromaStage>>,
    segment: Option<Box<dyn SegmentStage>>,
}

impl PipelineBuilder {
    pub fn load(mut self, stage: impl LoadStage + 'static) -> Self {
        self.load = Some(Box::new(stage));
        self
    }

    pub fn spectral(mut self, stage: impl SpectralStage + 'static) -> Self {
        self.spectral = Some(Box::new(stage));
        self
    }

    pub fn chroma(mut self, stage: impl ChromaStage + 'static) -> Self {
        self.chroma = Some(Box::new(stage));
        self
    }

    pub fn segment(mut self, stage: impl SegmentStage + 'static) -> Self {
        self.segment = Some(Box::new(stage));
        self
    }

    /// Pick concrete stages from the configuration.
    pub fn from_config(config: &AppConfig, cache: Arc<SampleCache>) -> Result<Self> {
        let audio = &config.audio;
        let spec = &config.spectral;

        let builder = match audio.loader {
            LoaderKind::Decode => Self::default().load(load::DecodeLoader::new(
                audio.sample_rate,
                audio.harmonic_only,
                cache,
            )),
        };

        let builder = match spec.kind {
            SpectralKind::ConstantQ => builder.spectral(spectral::ConstantQ::new(
                spectral::CqtParams {
                    sample_rate: audio.sample_rate,
                    hop_length: spec.hop_length,
                    min_freq: spec.min_freq,
                    bins_per_octave: spec.bins_per_octave,
                    n_bins: spec.n_bins,
                },
            )?),
        };

        let builder = match config.chroma.kind {
            ChromaKind::Filtered => builder.chroma(chroma::FilteredChroma::new(
                spec.min_freq,
                spec.bins_per_octave,
                config.chroma.median_width,
                config.chroma.nn_filter,
            )),
        };

        let seg = &config.segmentation;
        let builder = match seg.kind {
            SegmentationKind::BeatSync => builder.segment(segment::BeatSync::new(
                audio.sample_rate,
                spec.hop_length,
                seg.min_bpm,
                seg.max_bpm,
            )),
            SegmentationKind::Passthrough => builder.segment(segment::Passthrough),
        };

        Ok(builder)
    }

    pub fn build(self) -> Result<AudioPipeline> {
        Ok(AudioPipeline {
            load: self.load.ok_or(PipelineError::MissingStage("load"))?,
            spectral: self.spectral.ok_or(PipelineError::MissingStage("spectral"))?,
            chroma: self.chroma.ok_or(PipelineError::MissingStage("chroma"))?,
            segment: self.segment.ok_or(PipelineError::MissingStage("segment"))?,
        })
    }
}

/// Median of a non-empty slice; the mean of the two middle values for even
/// lengths. Reorders the slice.
pub(crate) fn median(values: &mut [f32]) -> f32 {
    let n = values.len();
    if n == 0 {
        return 0.0;
    }
    let mid = n / 2;
    let (lower, upper, _) = values.select_nth_unstable_by(mid, f32::total_cmp);
    let upper = *upper;
    if n % 2 == 1 {
        upper
    } else {
        let lower_max = lower.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        (lower_max + upper) / 2.0
    }
}
