use std::path::Path;
use std::sync::Arc;

use ndarray::Array2;
use rustfft::num_complex::Complex32;

use super::cache::SampleCache;
use super::spectral::{istft, stft};
use super::{median, LoadStage, PipelineError, Result};

/// STFT size and hop used for harmonic/percussive separation.
const HPSS_N_FFT: usize = 2048;
const HPSS_HOP: usize = 512;
/// Median filter length along time (harmonic) and frequency (percussive).
const HPSS_KERNEL: usize = 31;

/// Interleaved samples as they come out of a decoder.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: usize,
}

/// Decode a WAV or FLAC file into interleaved `f32` samples in [-1, 1].
pub fn decode_file(path: &Path) -> Result<DecodedAudio> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    match ext.as_str() {
        "wav" => decode_wav(path),
        "flac" => decode_flac(path),
        _ => Err(PipelineError::UnsupportedFormat(path.display().to_string())),
    }
}

fn decode_wav(path: &Path) -> Result<DecodedAudio> {
    let reader = hound::WavReader::open(path)
        .map_err(|e| PipelineError::Decode(format!("WAV open error: {}", e)))?;
    let spec = reader.spec();
    let sample_err = |e: hound::Error| PipelineError::Decode(format!("WAV sample error: {}", e));

    let samples = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 8) => reader
            .into_samples::<i8>()
            .map(|s| s.map(|s| s as f32 / 128.0).map_err(sample_err))
            .collect::<Result<Vec<f32>>>()?,
        (hound::SampleFormat::Int, 16) => reader
            .into_samples::<i16>()
            .map(|s| s.map(|s| s as f32 / 32_768.0).map_err(sample_err))
            .collect::<Result<Vec<f32>>>()?,
        (hound::SampleFormat::Int, 24) => reader
            .into_samples::<i32>()
            .map(|s| s.map(|s| s as f32 / 8_388_608.0).map_err(sample_err))
            .collect::<Result<Vec<f32>>>()?,
        (hound::SampleFormat::Int, 32) => reader
            .into_samples::<i32>()
            .map(|s| s.map(|s| s as f32 / 2_147_483_648.0).map_err(sample_err))
            .collect::<Result<Vec<f32>>>()?,
        (hound::SampleFormat::Float, 32) => reader
            .into_samples::<f32>()
            .map(|s| s.map_err(sample_err))
            .collect::<Result<Vec<f32>>>()?,
        (fmt, bits) => {
            return Err(PipelineError::UnsupportedFormat(format!(
                "WAV {:?} {}-bit",
                fmt, bits
            )));
        }
    };

    Ok(DecodedAudio {
        samples,
        sample_rate: spec.sample_rate,
        channels: spec.channels as usize,
    })
}

fn decode_flac(path: &Path) -> Result<DecodedAudio> {
    let mut reader = claxon::FlacReader::open(path)
        .map_err(|e| PipelineError::Decode(format!("FLAC open error: {}", e)))?;
    let info = reader.streaminfo();
    let scale = (1u64 << (info.bits_per_sample - 1)) as f32;

    let samples = reader
        .samples()
        .map(|s| {
            s.map(|s| s as f32 / scale)
                .map_err(|e| PipelineError::Decode(format!("FLAC sample error: {}", e)))
        })
        .collect::<Result<Vec<f32>>>()?;

    Ok(DecodedAudio {
        samples,
        sample_rate: info.sample_rate,
        channels: info.channels as usize,
    })
}

/// Average interleaved channels down to mono.
pub fn downmix(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Linear-interpolation resampling.
pub fn resample(samples: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = from as f64 / to as f64;
    let out_len = ((samples.len() as f64) / ratio).round().max(1.0) as usize;
    let last = samples.len() - 1;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = (pos.floor() as usize).min(last);
            let frac = (pos - idx as f64) as f32;
            let next = samples[(idx + 1).min(last)];
            samples[idx] + (next - samples[idx]) * frac
        })
        .collect()
}

/// Keep only the harmonic part of the signal.
///
/// Median filtering the magnitude spectrogram along time gives the harmonic
/// estimate, along frequency the percussive one. A soft mask built from the
/// two is applied to the STFT before resynthesis.
pub fn harmonic_component(samples: &[f32]) -> Vec<f32> {
    if samples.is_empty() {
        return Vec::new();
    }
    let mut spec = stft(samples, HPSS_N_FFT, HPSS_HOP);
    let mag = spec.mapv(|c| c.norm());
    let harmonic = median_filter_axis(&mag, HPSS_KERNEL, true);
    let percussive = median_filter_axis(&mag, HPSS_KERNEL, false);

    ndarray::Zip::from(&mut spec)
        .and(&harmonic)
        .and(&percussive)
        .for_each(|s: &mut Complex32, &h, &p| {
            let (h2, p2) = (h * h, p * p);
            let mask = if h2 + p2 > 0.0 { h2 / (h2 + p2) } else { 0.0 };
            *s *= mask;
        });

    istft(&spec, HPSS_N_FFT, HPSS_HOP, samples.len())
}

/// Median filter with a window truncated at the edges.
fn median_filter_axis(mag: &Array2<f32>, kernel: usize, along_time: bool) -> Array2<f32> {
    let (n_freq, n_time) = mag.dim();
    let half = kernel / 2;
    let mut out = Array2::<f32>::zeros((n_freq, n_time));
    let mut window = Vec::with_capacity(kernel);
    for f in 0..n_freq {
        for t in 0..n_time {
            window.clear();
            if along_time {
                let end = (t + half + 1).min(n_time);
                window.extend((t.saturating_sub(half)..end).map(|i| mag[[f, i]]));
            } else {
                let end = (f + half + 1).min(n_freq);
                window.extend((f.saturating_sub(half)..end).map(|i| mag[[i, t]]));
            }
            out[[f, t]] = median(&mut window);
        }
    }
    out
}

/// Decodes WAV/FLAC files into mono samples at a fixed rate, memoised per
/// canonical path.
pub struct DecodeLoader {
    sample_rate: u32,
    harmonic_only: bool,
    cache: Arc<SampleCache>,
}

impl DecodeLoader {
    pub fn new(sample_rate: u32, harmonic_only: bool, cache: Arc<SampleCache>) -> Self {
        Self {
            sample_rate,
            harmonic_only,
            cache,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn decode(&self, path: &Path) -> Result<Vec<f32>> {
        let audio = decode_file(path)?;
        if audio.channels == 0 || audio.sample_rate == 0 {
            return Err(PipelineError::Decode(format!(
                "{}: no channels or zero sample rate",
                path.display()
            )));
        }
        let mono = downmix(&audio.samples, audio.channels);
        let mono = resample(&mono, audio.sample_rate, self.sample_rate);
        if self.harmonic_only {
            log::debug!("Separating harmonic component of {}", path.display());
            Ok(harmonic_component(&mono))
        } else {
            Ok(mono)
        }
    }
}

impl LoadStage for DecodeLoader {
    fn load(&self, path: &Path) -> Result<Arc<Vec<f32>>> {
        let canonical = std::fs::canonicalize(path)?;
        self.cache
            .get_or_try_insert(&canonical, || self.decode(&canonical))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn write_wav(path: &Path, sr: u32, channels: u16, frames: &[f32]) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: sr,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for &s in frames {
            writer.write_sample((s * 32767.0) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_downmix_averages_channels() {
        assert_eq!(downmix(&[1.0, 0.0, 0.5, 0.5], 2), vec![0.5, 0.5]);
        assert_eq!(downmix(&[0.25, 0.5], 1), vec![0.25, 0.5]);
    }

    #[test]
    fn test_resample_length_and_values() {
        let ramp: Vec<f32> = (0..100).map(|i| i as f32).collect();
        let half = resample(&ramp, 200, 100);
        assert_eq!(half.len(), 50);
        assert!((half[10] - 20.0).abs() < 1e-5);
        let double = resample(&ramp, 100, 200);
        assert_eq!(double.len(), 200);
        assert!((double[3] - 1.5).abs() < 1e-5);
        assert_eq!(resample(&ramp, 100, 100), ramp);
    }

    #[test]
    fn test_load_wav_stereo_resampled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let interleaved: Vec<f32> = (0..8000).flat_map(|_| [0.5f32, -0.5]).collect();
        write_wav(&path, 8000, 2, &interleaved);

        let loader = DecodeLoader::new(16000, false, SampleCache::shared(4));
        let samples = loader.load(&path).unwrap();
        assert_eq!(samples.len(), 16000);
        assert!(samples.iter().all(|s| s.abs() < 1e-3));
    }

    #[test]
    fn test_load_is_memoised() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wav");
        write_wav(&path, 8000, 1, &[0.1; 800]);

        let cache = SampleCache::shared(4);
        let loader = DecodeLoader::new(8000, false, Arc::clone(&cache));
        let first = loader.load(&path).unwrap();
        // a relative spelling of the same file resolves to the same entry
        let dotted = dir.path().join(".").join("a.wav");
        let second = loader.load(&dotted).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);

        cache.clear();
        let third = loader.load(&path).unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(*first, *third);
    }

    #[test]
    fn test_unsupported_and_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let mp3 = dir.path().join("x.mp3");
        std::fs::write(&mp3, b"not audio").unwrap();
        assert!(matches!(
            decode_file(&mp3),
            Err(PipelineError::UnsupportedFormat(_))
        ));

        let loader = DecodeLoader::new(8000, false, SampleCache::shared(1));
        assert!(matches!(
            loader.load(&dir.path().join("missing.wav")),
            Err(PipelineError::Io(_))
        ));

        let bogus = dir.path().join("bogus.wav");
        std::fs::write(&bogus, b"RIFF....").unwrap();
        assert!(matches!(loader.load(&bogus), Err(PipelineError::Decode(_))));
    }

    #[test]
    fn test_harmonic_component_keeps_tone() {
        let sr = 8000.0;
        let tone: Vec<f32> = (0..16000)
            .map(|i| 0.5 * (2.0 * PI * 440.0 * i as f32 / sr).sin())
            .collect();
        let harmonic = harmonic_component(&tone);
        assert_eq!(harmonic.len(), tone.len());
        let energy = |x: &[f32]| x[4000..12000].iter().map(|v| v * v).sum::<f32>();
        assert!(energy(&harmonic) > 0.8 * energy(&tone));
    }
}
