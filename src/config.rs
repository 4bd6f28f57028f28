use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Application configuration loaded from TOML config file.
/// Every section is optional; missing keys fall back to defaults.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Number of parallel workers. 0 = auto-detect (cores / 2, min 1).
    pub workers: usize,
    pub audio: AudioConfig,
    pub spectral: SpectralConfig,
    pub chroma: ChromaConfig,
    pub segmentation: SegmentationConfig,
    pub recognition: RecognitionConfig,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoaderKind {
    #[default]
    Decode,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SpectralKind {
    #[default]
    ConstantQ,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChromaKind {
    #[default]
    Filtered,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SegmentationKind {
    #[default]
    BeatSync,
    Passthrough,
}

/// Decoding and sample cache settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    /// Every file is resampled to this rate.
    pub sample_rate: u32,
    /// Keep only the harmonic component (median-filter HPSS).
    pub harmonic_only: bool,
    /// Decoded files kept in memory. 0 disables the cache.
    pub cache_capacity: usize,
    pub loader: LoaderKind,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            harmonic_only: false,
            cache_capacity: 64,
            loader: LoaderKind::Decode,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SpectralConfig {
    pub kind: SpectralKind,
    pub hop_length: usize,
    /// Centre frequency of the lowest bin, in Hz.
    pub min_freq: f64,
    pub bins_per_octave: usize,
    pub n_bins: usize,
}

impl Default for SpectralConfig {
    fn default() -> Self {
        Self {
            kind: SpectralKind::ConstantQ,
            hop_length: 512,
            min_freq: 110.0,
            bins_per_octave: 12,
            n_bins: 84,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ChromaConfig {
    pub kind: ChromaKind,
    /// Width of the time-axis median filter (odd).
    pub median_width: usize,
    /// Apply the nearest-neighbour median filter.
    pub nn_filter: bool,
}

impl Default for ChromaConfig {
    fn default() -> Self {
        Self {
            kind: ChromaKind::Filtered,
            median_width: 9,
            nn_filter: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SegmentationConfig {
    pub kind: SegmentationKind,
    /// Tempo search range for beat tracking.
    pub min_bpm: f32,
    pub max_bpm: f32,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            kind: SegmentationKind::BeatSync,
            min_bpm: 60.0,
            max_bpm: 200.0,
        }
    }
}

/// Template model and median gate.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RecognitionConfig {
    /// Harmonic decay, in (0, 1].
    pub alpha: f64,
    /// Number of partials per note.
    pub depth: usize,
    pub bottom_threshold: f64,
    pub upper_threshold: f64,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            alpha: crate::template::DEFAULT_ALPHA,
            depth: crate::template::DEFAULT_DEPTH,
            bottom_threshold: 0.0,
            upper_threshold: 2.0,
        }
    }
}

impl AppConfig {
    /// Load config from `~/.config/chordify/config.toml`.
    /// Returns default config if file doesn't exist.
    /// Logs a warning if the file exists but can't be parsed.
    pub fn load() -> Self {
        let config_path = Self::config_path();
        match config_path {
            Some(path) if path.exists() => match Self::load_from(&path) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    log::warn!("{}. Using defaults.", e);
                    Self::default()
                }
            },
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    /// Load config from an explicit path. Unlike [`AppConfig::load`], a
    /// missing or unparsable file is an error.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Check every setting before any pipeline runs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| -> Result<(), ConfigError> { Err(ConfigError::Invalid(msg)) };
        let rec = &self.recognition;
        let spec = &self.spectral;
        let seg = &self.segmentation;

        if !(rec.alpha > 0.0 && rec.alpha <= 1.0) {
            return invalid(format!("recognition.alpha must be in (0, 1], got {}", rec.alpha));
        }
        if rec.depth == 0 {
            return invalid("recognition.depth must be at least 1".into());
        }
        if !(rec.bottom_threshold < rec.upper_threshold) {
            return invalid(format!(
                "recognition.bottom_threshold ({}) must be below upper_threshold ({})",
                rec.bottom_threshold, rec.upper_threshold
            ));
        }
        if self.audio.sample_rate == 0 {
            return invalid("audio.sample_rate must be positive".into());
        }
        if spec.hop_length == 0 || spec.n_bins == 0 {
            return invalid("spectral.hop_length and spectral.n_bins must be positive".into());
        }
        if spec.bins_per_octave == 0 || spec.bins_per_octave % 12 != 0 {
            return invalid(format!(
                "spectral.bins_per_octave must be a positive multiple of 12, got {}",
                spec.bins_per_octave
            ));
        }
        if !(spec.min_freq > 0.0) {
            return invalid(format!("spectral.min_freq must be positive, got {}", spec.min_freq));
        }
        let top = spec.min_freq * 2f64.powf((spec.n_bins - 1) as f64 / spec.bins_per_octave as f64);
        let nyquist = self.audio.sample_rate as f64 / 2.0;
        if top >= nyquist {
            return invalid(format!(
                "highest spectral bin ({:.1} Hz) must be below Nyquist ({:.1} Hz)",
                top, nyquist
            ));
        }
        if !(seg.min_bpm > 0.0 && seg.min_bpm < seg.max_bpm) {
            return invalid(format!(
                "segmentation tempo range {}..{} BPM is empty",
                seg.min_bpm, seg.max_bpm
            ));
        }
        if self.chroma.median_width % 2 == 0 {
            return invalid(format!(
                "chroma.median_width must be odd, got {}",
                self.chroma.median_width
            ));
        }
        Ok(())
    }

    /// Resolve worker count: 0 → auto-detect (cores / 2, min 1).
    pub fn resolve_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2);
            (cores / 2).max(1)
        }
    }

    /// Get the config file path.
    pub fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}
