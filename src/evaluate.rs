use std::path::{Path, PathBuf};
use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use thiserror::Error;
use walkdir::WalkDir;

use crate::annotation::{parse_annotation, AnnotationError};
use crate::config::{AppConfig, ConfigError};
use crate::music::Chord;
use crate::pipeline::cache::SampleCache;
use crate::pipeline::segment::frame_boundaries;
use crate::pipeline::{AudioPipeline, ChromaMatrix, PipelineBuilder, PipelineError};
use crate::recognition::{column_array, ChordRecognizer, RecognitionError, SupervisedVectors};
use crate::scoring::score;
use crate::timeline::{make_timeline, ChordTimeline, TimelineError};
use crate::SUPPORTED_EXTENSIONS;

#[derive(Error, Debug)]
pub enum EvaluateError {
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("Recognition error: {0}")]
    Recognition(#[from] RecognitionError),
    #[error("Annotation error: {0}")]
    Annotation(#[from] AnnotationError),
    #[error("Timeline error: {0}")]
    Timeline(#[from] TimelineError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

pub type Result<T> = std::result::Result<T, EvaluateError>;

/// An audio file and its reference annotation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pair {
    pub audio: PathBuf,
    pub annotation: PathBuf,
}

/// Find every supported audio file under `dirs` that has a sibling `.lab`.
pub fn discover_pairs(dirs: &[PathBuf]) -> Vec<Pair> {
    let mut pairs = Vec::new();
    for dir in dirs {
        for entry in WalkDir::new(dir).follow_links(true).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_lowercase();
            if !SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
                continue;
            }
            let annotation = path.with_extension("lab");
            if annotation.is_file() {
                pairs.push(Pair {
                    audio: path.to_path_buf(),
                    annotation,
                });
            } else {
                log::debug!("No annotation for {}, skipping", path.display());
            }
        }
    }
    pairs.sort();
    pairs.dedup();
    pairs
}

/// A pipeline plus the frame geometry needed to place its output in time.
pub struct Estimator {
    pipeline: AudioPipeline,
    hop_length: usize,
    sample_rate: u32,
}

impl Estimator {
    pub fn new(pipeline: AudioPipeline, hop_length: usize, sample_rate: u32) -> Self {
        Self {
            pipeline,
            hop_length,
            sample_rate,
        }
    }

    /// Validate the configuration and build the configured pipeline.
    pub fn from_config(config: &AppConfig, cache: Arc<SampleCache>) -> Result<Self> {
        config.validate()?;
        let pipeline = PipelineBuilder::from_config(config, cache)?.build()?;
        Ok(Self::new(
            pipeline,
            config.spectral.hop_length,
            config.audio.sample_rate,
        ))
    }

    /// Chroma and segment boundaries for one file. Unsegmented output gets one
    /// boundary per frame edge.
    pub fn features(&self, audio: &Path) -> Result<(ChromaMatrix, Vec<f64>)> {
        let (chroma, boundaries) = self.pipeline.process(audio)?;
        let boundaries = boundaries
            .unwrap_or_else(|| frame_boundaries(chroma.ncols(), self.hop_length, self.sample_rate));
        Ok((chroma, boundaries))
    }

    /// Predicted chord timeline for one file.
    pub fn predict(&self, audio: &Path, recognizer: &dyn ChordRecognizer) -> Result<ChordTimeline> {
        let (chroma, boundaries) = self.features(audio)?;
        let chords = recognizer.predict(&chroma)?;
        Ok(make_timeline(&boundaries, &chords)?)
    }

    /// Label each segment's chroma with the reference chord at its midpoint.
    /// Segments whose reference label is not a known chord are skipped.
    pub fn collect_supervised(&self, audio: &Path, annotation: &ChordTimeline) -> Result<SupervisedVectors> {
        let (chroma, boundaries) = self.features(audio)?;
        let mut data = SupervisedVectors::new();
        for (t, edge) in boundaries.windows(2).enumerate().take(chroma.ncols()) {
            let mid = (edge[0] + edge[1]) / 2.0;
            match annotation.label_at(mid).and_then(Chord::parse) {
                Some(chord) => data.push(column_array(&chroma, t), chord),
                None => log::trace!("{}: no usable label at {:.2}s", audio.display(), mid),
            }
        }
        Ok(data)
    }
}

/// Score of one evaluated file.
#[derive(Debug, Clone, Serialize)]
pub struct FileScore {
    pub audio: PathBuf,
    pub score: f64,
    pub segments: usize,
}

#[derive(Debug, Default, Serialize)]
pub struct EvaluationReport {
    pub files: Vec<FileScore>,
    pub failed: u64,
}

impl EvaluationReport {
    /// Mean score over successfully evaluated files, 0 when there are none.
    pub fn mean(&self) -> f64 {
        if self.files.is_empty() {
            return 0.0;
        }
        self.files.iter().map(|f| f.score).sum::<f64>() / self.files.len() as f64
    }
}

fn progress_bar(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}

/// Run `task` over `pairs` on a pool of `jobs` threads, in chunks of
/// `jobs * 2`. Failed pairs are logged and counted, not returned.
fn run_parallel<T, F>(pairs: &[Pair], jobs: usize, task: F) -> Result<(Vec<T>, u64)>
where
    T: Send,
    F: Fn(&Pair) -> Result<T> + Sync,
{
    let jobs = jobs.max(1);
    let pool = rayon::ThreadPoolBuilder::new().num_threads(jobs).build()?;
    let pb = progress_bar(pairs.len());

    let mut done = Vec::with_capacity(pairs.len());
    let mut failed: u64 = 0;

    for chunk in pairs.chunks(jobs * 2) {
        let results: Vec<_> = pool.install(|| {
            use rayon::prelude::*;
            chunk
                .par_iter()
                .map(|pair| {
                    let result = task(pair);
                    pb.inc(1);
                    result
                })
                .collect()
        });

        for (pair, result) in chunk.iter().zip(results) {
            match result {
                Ok(value) => done.push(value),
                Err(e) => {
                    log::warn!("Failed on {}: {}", pair.audio.display(), e);
                    failed += 1;
                }
            }
        }
        pb.set_message(format!("{} done, {} failed", done.len(), failed));
    }

    pb.finish_with_message(format!("Done: {} ok, {} failed", done.len(), failed));
    Ok((done, failed))
}

/// Predict and score every pair in parallel.
pub fn evaluate_pairs(
    estimator: &Estimator,
    recognizer: &dyn ChordRecognizer,
    pairs: &[Pair],
    jobs: usize,
) -> Result<EvaluationReport> {
    if pairs.is_empty() {
        log::info!("No annotated audio files to evaluate");
        return Ok(EvaluationReport::default());
    }
    log::info!("Evaluating {} files with {} workers", pairs.len(), jobs);

    let (scored, failed) = run_parallel(pairs, jobs, |pair| {
        let reference = parse_annotation(&pair.annotation)?;
        let predicted = estimator.predict(&pair.audio, recognizer)?;
        Ok(FileScore {
            audio: pair.audio.clone(),
            score: score(&predicted, &reference),
            segments: predicted.len(),
        })
    })?;

    let report = EvaluationReport {
        files: scored,
        failed,
    };
    log::info!(
        "Evaluated {} files ({} failed), mean score {:.4}",
        report.files.len(),
        report.failed,
        report.mean()
    );
    Ok(report)
}

/// Gather labelled chroma from every pair in parallel.
pub fn collect_training(estimator: &Estimator, pairs: &[Pair], jobs: usize) -> Result<(SupervisedVectors, u64)> {
    let (collected, failed) = run_parallel(pairs, jobs, |pair| {
        let reference = parse_annotation(&pair.annotation)?;
        estimator.collect_supervised(&pair.audio, &reference)
    })?;

    let mut data = SupervisedVectors::new();
    for part in collected {
        data.extend(part);
    }
    log::info!("Collected {} training vectors ({} files failed)", data.len(), failed);
    Ok((data, failed))
}
