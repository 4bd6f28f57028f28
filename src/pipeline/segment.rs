use ndarray::{Array2, Axis};

use super::spectral::stft;
use super::{median, ChromaMatrix, PipelineError, Result, SegmentStage, Segmented};

/// FFT size for the onset envelope.
const ONSET_N_FFT: usize = 2048;

/// How strongly the beat tracker prefers the estimated period.
const TIGHTNESS: f32 = 100.0;

/// Leaves chroma frames as they are and reports no boundaries.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl SegmentStage for Passthrough {
    fn segment(&self, _samples: &[f32], chroma: ChromaMatrix) -> Result<Segmented> {
        Ok((chroma, None))
    }
}

/// Aggregates chroma between tracked beats.
#[derive(Debug, Clone)]
pub struct BeatSync {
    sample_rate: u32,
    hop_length: usize,
    min_bpm: f32,
    max_bpm: f32,
}

impl BeatSync {
    pub fn new(sample_rate: u32, hop_length: usize, min_bpm: f32, max_bpm: f32) -> Self {
        Self {
            sample_rate,
            hop_length,
            min_bpm,
            max_bpm,
        }
    }

    fn frame_duration(&self) -> f32 {
        self.hop_length as f32 / self.sample_rate as f32
    }

    /// Beat positions in frames, sorted.
    pub fn track(&self, samples: &[f32]) -> Vec<usize> {
        let envelope = onset_envelope(samples, self.hop_length);
        match estimate_tempo(&envelope, self.frame_duration(), self.min_bpm, self.max_bpm) {
            Some(bpm) => {
                log::debug!("Estimated tempo {:.1} BPM", bpm);
                let period = 60.0 / (bpm * self.frame_duration());
                track_beats(&envelope, period)
            }
            None => {
                log::debug!("No tempo found, using a single segment");
                Vec::new()
            }
        }
    }
}

impl SegmentStage for BeatSync {
    fn segment(&self, samples: &[f32], chroma: ChromaMatrix) -> Result<Segmented> {
        let n_frames = chroma.ncols();
        if n_frames == 0 {
            return Err(PipelineError::Shape("no chroma frames to segment".into()));
        }
        let bounds = fix_frames(&self.track(samples), n_frames);
        let synced = sync_median(&chroma, &bounds);
        let times = bounds
            .iter()
            .map(|&f| f as f64 * self.hop_length as f64 / self.sample_rate as f64)
            .collect();
        Ok((synced, Some(times)))
    }
}

/// Half-wave rectified spectral flux of the log magnitude, one value per
/// centred frame.
pub fn onset_envelope(samples: &[f32], hop_length: usize) -> Vec<f32> {
    let spec = stft(samples, ONSET_N_FFT, hop_length);
    let log_mag = spec.mapv(|c| (1.0 + 100.0 * c.norm()).ln());
    let (n_bins, n_frames) = log_mag.dim();

    let mut envelope = vec![0.0f32; n_frames];
    for t in 1..n_frames {
        let mut flux = 0.0;
        for f in 0..n_bins {
            let diff = log_mag[[f, t]] - log_mag[[f, t - 1]];
            if diff > 0.0 {
                flux += diff;
            }
        }
        envelope[t] = flux / n_bins as f32;
    }
    envelope
}

/// Tempo in BPM from the autocorrelation peak of the onset envelope within
/// `[min_bpm, max_bpm]`.
pub fn estimate_tempo(envelope: &[f32], frame_duration: f32, min_bpm: f32, max_bpm: f32) -> Option<f32> {
    if envelope.len() < 4 || frame_duration <= 0.0 {
        return None;
    }

    let min_lag = ((60.0 / (max_bpm * frame_duration)).floor() as usize).max(1);
    let max_lag = ((60.0 / (min_bpm * frame_duration)).ceil() as usize).min(envelope.len() - 1);
    if min_lag > max_lag {
        return None;
    }

    let mean = envelope.iter().sum::<f32>() / envelope.len() as f32;
    let centered: Vec<f32> = envelope.iter().map(|&x| x - mean).collect();
    let energy: f32 = centered.iter().map(|&x| x * x).sum();
    if energy < 1e-10 {
        return None;
    }

    let n = centered.len();
    let mut best_lag = min_lag;
    let mut best_corr = f32::NEG_INFINITY;
    for lag in min_lag..=max_lag {
        let corr: f32 = centered[..n - lag]
            .iter()
            .zip(&centered[lag..])
            .map(|(&a, &b)| a * b)
            .sum::<f32>()
            / energy;
        if corr > best_corr {
            best_corr = corr;
            best_lag = lag;
        }
    }

    if best_corr <= 0.0 {
        return None;
    }
    Some(60.0 / (best_lag as f32 * frame_duration))
}

/// Dynamic-programming beat tracker.
///
/// Each frame scores its smoothed onset strength plus the best predecessor
/// one period back, penalised by the squared log deviation from `period`.
/// The best-scoring frame in the final period is traced back.
pub fn track_beats(envelope: &[f32], period: f32) -> Vec<usize> {
    let n = envelope.len();
    if n == 0 || period < 1.0 {
        return Vec::new();
    }

    let mean = envelope.iter().sum::<f32>() / n as f32;
    let std = (envelope.iter().map(|&x| (x - mean).powi(2)).sum::<f32>() / n as f32).sqrt();
    if std <= 0.0 {
        return Vec::new();
    }
    let normalized: Vec<f32> = envelope.iter().map(|&x| x / std).collect();

    // gaussian smoothing around the beat period
    let half = period.round() as isize;
    let kernel: Vec<f32> = (-half..=half)
        .map(|i| (-0.5 * (i as f32 * 32.0 / period).powi(2)).exp())
        .collect();
    let local: Vec<f32> = (0..n as isize)
        .map(|t| {
            kernel
                .iter()
                .enumerate()
                .filter_map(|(j, &w)| {
                    let idx = t + j as isize - half;
                    usize::try_from(idx).ok().and_then(|i| normalized.get(i)).map(|&x| x * w)
                })
                .sum()
        })
        .collect();

    let mut cumulative = vec![0.0f32; n];
    let mut backlink: Vec<Option<usize>> = vec![None; n];
    let window_start = (2.0 * period).round() as usize;
    let window_end = ((period / 2.0).round() as usize).max(1);

    for t in 0..n {
        let lo = t.saturating_sub(window_start);
        let hi = t.saturating_sub(window_end);
        let mut best: Option<(usize, f32)> = None;
        if t >= window_end {
            for prev in lo..=hi {
                let gap = (t - prev) as f32 / period;
                let score = cumulative[prev] - TIGHTNESS * gap.ln().powi(2);
                if best.is_none_or(|(_, s)| score > s) {
                    best = Some((prev, score));
                }
            }
        }
        match best {
            Some((prev, score)) if score > 0.0 => {
                cumulative[t] = local[t] + score;
                backlink[t] = Some(prev);
            }
            _ => cumulative[t] = local[t],
        }
    }

    let tail_start = n.saturating_sub(period.round() as usize);
    let mut current = (tail_start..n).fold(tail_start, |best, t| {
        if cumulative[t] > cumulative[best] { t } else { best }
    });

    let mut beats = vec![current];
    while let Some(prev) = backlink[current] {
        beats.push(prev);
        current = prev;
    }
    beats.reverse();
    beats
}

/// Clip beat frames to `[0, n_frames]`, add both ends, sort and dedupe.
pub fn fix_frames(frames: &[usize], n_frames: usize) -> Vec<usize> {
    let mut bounds: Vec<usize> = frames.iter().map(|&f| f.min(n_frames)).collect();
    bounds.push(0);
    bounds.push(n_frames);
    bounds.sort_unstable();
    bounds.dedup();
    bounds
}

/// Per-row median of the chroma columns between consecutive boundaries.
pub fn sync_median(chroma: &Array2<f32>, bounds: &[usize]) -> ChromaMatrix {
    let n_rows = chroma.nrows();
    let n_segments = bounds.len().saturating_sub(1);
    let mut out = Array2::<f32>::zeros((n_rows, n_segments));
    let mut values = Vec::new();
    for (s, pair) in bounds.windows(2).enumerate() {
        let segment = chroma.slice_axis(Axis(1), (pair[0]..pair[1]).into());
        for r in 0..n_rows {
            values.clear();
            values.extend(segment.row(r).iter().copied());
            out[[r, s]] = median(&mut values);
        }
    }
    out
}

/// Boundaries for unsegmented chroma: one per frame edge, in seconds.
pub fn frame_boundaries(n_frames: usize, hop_length: usize, sample_rate: u32) -> Vec<f64> {
    (0..=n_frames)
        .map(|f| f as f64 * hop_length as f64 / sample_rate as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    /// Clicks every `interval` samples.
    fn click_track(interval: usize, len: usize) -> Vec<f32> {
        let mut samples = vec![0.0f32; len];
        for start in (0..len).step_by(interval) {
            for s in samples.iter_mut().skip(start).take(64) {
                *s = 0.8;
            }
        }
        samples
    }

    #[test]
    fn test_fix_frames() {
        assert_eq!(fix_frames(&[5, 3, 3, 40], 20), vec![0, 3, 5, 20]);
        assert_eq!(fix_frames(&[], 7), vec![0, 7]);
        assert_eq!(fix_frames(&[0, 7], 7), vec![0, 7]);
    }

    #[test]
    fn test_sync_median() {
        let chroma = array![[1.0f32, 3.0, 2.0, 10.0], [0.0, 0.0, 1.0, 1.0]];
        let out = sync_median(&chroma, &[0, 3, 4]);
        assert_eq!(out, array![[2.0f32, 10.0], [0.0, 1.0]]);
    }

    #[test]
    fn test_passthrough() {
        let chroma = Array2::<f32>::ones((12, 4));
        let (out, bounds) = Passthrough.segment(&[], chroma.clone()).unwrap();
        assert_eq!(out, chroma);
        assert!(bounds.is_none());
    }

    #[test]
    fn test_tempo_of_click_track() {
        // a click every 22 hops, about 117.5 BPM at 22050 Hz
        let sr: usize = 22050;
        let hop: usize = 512;
        let samples = click_track(22 * hop, sr * 8);
        let envelope = onset_envelope(&samples, hop);
        let bpm = estimate_tempo(&envelope, hop as f32 / sr as f32, 60.0, 200.0).unwrap();
        assert!((bpm - 117.45).abs() < 3.0, "bpm {}", bpm);
    }

    #[test]
    fn test_silence_has_no_tempo() {
        let envelope = vec![0.0f32; 200];
        assert!(estimate_tempo(&envelope, 0.023, 60.0, 200.0).is_none());
        assert!(track_beats(&envelope, 20.0).is_empty());
    }

    #[test]
    fn test_beats_follow_clicks() {
        let sr: usize = 22050;
        let hop: usize = 512;
        let samples = click_track(22 * hop, sr * 8);
        let stage = BeatSync::new(sr as u32, hop, 60.0, 200.0);
        let beats = stage.track(&samples);
        assert!(beats.len() >= 10, "found {} beats", beats.len());
        let gaps: Vec<usize> = beats.windows(2).map(|w| w[1] - w[0]).collect();
        let mean_gap = gaps.iter().sum::<usize>() as f32 / gaps.len() as f32;
        assert!((mean_gap - 22.0).abs() < 1.0, "mean gap {}", mean_gap);
    }

    #[test]
    fn test_segment_outputs_align() {
        let sr: usize = 22050;
        let hop: usize = 512;
        let samples = click_track(22 * hop, sr * 4);
        let n_frames = 1 + samples.len() / hop;
        let chroma = Array2::<f32>::ones((12, n_frames));
        let stage = BeatSync::new(sr as u32, hop, 60.0, 200.0);
        let (synced, bounds) = stage.segment(&samples, chroma).unwrap();
        let bounds = bounds.unwrap();
        assert_eq!(synced.ncols() + 1, bounds.len());
        assert_eq!(bounds[0], 0.0);
        let last = n_frames as f64 * hop as f64 / sr as f64;
        assert!((bounds[bounds.len() - 1] - last).abs() < 1e-9);
        assert!(bounds.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_frame_boundaries() {
        let b = frame_boundaries(2, 512, 512);
        assert_eq!(b, vec![0.0, 1.0, 2.0]);
    }
}
