use std::fmt::Display;

use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum TimelineError {
    #[error("Invalid interval start: {0}")]
    InvalidStart(f64),
    #[error("Invalid interval stop: {0}")]
    InvalidStop(f64),
    #[error("Interval start {start} is not before stop {stop}")]
    EmptyInterval { start: f64, stop: f64 },
    #[error("Interval label must not be empty")]
    EmptyLabel,
    #[error("Start {start} precedes previous start {previous}")]
    StartOutOfOrder { start: f64, previous: f64 },
    #[error("Stop {stop} precedes previous stop {previous}")]
    StopOutOfOrder { stop: f64, previous: f64 },
    #[error("Expected {expected} labels for {boundaries} boundaries, got {actual}")]
    LengthMismatch {
        boundaries: usize,
        expected: usize,
        actual: usize,
    },
}

pub type Result<T> = std::result::Result<T, TimelineError>;

/// One labelled span of a timeline, in seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct Interval {
    pub start: f64,
    pub stop: f64,
    pub label: String,
}

impl Interval {
    pub fn duration(&self) -> f64 {
        self.stop - self.start
    }
}

/// Ordered, labelled time intervals. Starts and stops never decrease.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChordTimeline {
    intervals: Vec<Interval>,
}

impl ChordTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an interval after validating bounds and ordering.
    pub fn append(&mut self, start: f64, stop: f64, label: impl Into<String>) -> Result<()> {
        let label = label.into();
        if !start.is_finite() || start < 0.0 {
            return Err(TimelineError::InvalidStart(start));
        }
        if !stop.is_finite() || stop <= 0.0 {
            return Err(TimelineError::InvalidStop(stop));
        }
        if start >= stop {
            return Err(TimelineError::EmptyInterval { start, stop });
        }
        if label.is_empty() {
            return Err(TimelineError::EmptyLabel);
        }
        if let Some(last) = self.intervals.last() {
            // appends are monotonic, so the last interval holds the maxima
            if start < last.start {
                return Err(TimelineError::StartOutOfOrder {
                    start,
                    previous: last.start,
                });
            }
            if stop < last.stop {
                return Err(TimelineError::StopOutOfOrder {
                    stop,
                    previous: last.stop,
                });
            }
        }
        self.intervals.push(Interval { start, stop, label });
        Ok(())
    }

    /// Stop time of the final interval, 0 when empty.
    pub fn duration(&self) -> f64 {
        self.intervals.last().map(|i| i.stop).unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Interval> {
        self.intervals.iter()
    }

    /// Label of the interval covering time `t`, if any.
    pub fn label_at(&self, t: f64) -> Option<&str> {
        self.intervals
            .iter()
            .find(|i| i.start <= t && t < i.stop)
            .map(|i| i.label.as_str())
    }

    /// Merge adjacent intervals that carry the same label.
    pub fn merged(&self) -> ChordTimeline {
        let mut out: Vec<Interval> = Vec::with_capacity(self.intervals.len());
        for interval in &self.intervals {
            match out.last_mut() {
                Some(prev) if prev.label == interval.label && prev.stop == interval.start => {
                    prev.stop = interval.stop;
                }
                _ => out.push(interval.clone()),
            }
        }
        ChordTimeline { intervals: out }
    }
}

impl<'a> IntoIterator for &'a ChordTimeline {
    type Item = &'a Interval;
    type IntoIter = std::slice::Iter<'a, Interval>;

    fn into_iter(self) -> Self::IntoIter {
        self.intervals.iter()
    }
}

/// Build a timeline from segment boundaries and one label per segment.
pub fn make_timeline<L: Display>(boundaries: &[f64], labels: &[L]) -> Result<ChordTimeline> {
    let expected = boundaries.len().saturating_sub(1);
    if labels.len() != expected {
        return Err(TimelineError::LengthMismatch {
            boundaries: boundaries.len(),
            expected,
            actual: labels.len(),
        });
    }
    let mut timeline = ChordTimeline::new();
    for (window, label) in boundaries.windows(2).zip(labels) {
        timeline.append(window[0], window[1], label.to_string())?;
    }
    Ok(timeline)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_duration() {
        let mut t = ChordTimeline::new();
        t.append(0.0, 1.5, "C").unwrap();
        t.append(1.5, 3.0, "G").unwrap();
        assert_eq!(t.len(), 2);
        assert!((t.duration() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_append_rejections() {
        let mut t = ChordTimeline::new();
        assert_eq!(t.append(-1.0, 1.0, "C"), Err(TimelineError::InvalidStart(-1.0)));
        assert_eq!(t.append(0.0, 0.0, "C"), Err(TimelineError::InvalidStop(0.0)));
        assert!(matches!(t.append(2.0, 1.0, "C"), Err(TimelineError::EmptyInterval { .. })));
        assert_eq!(t.append(0.0, 1.0, ""), Err(TimelineError::EmptyLabel));
        assert!(matches!(t.append(f64::NAN, 1.0, "C"), Err(TimelineError::InvalidStart(_))));
        assert!(t.is_empty());
    }

    #[test]
    fn test_append_ordering() {
        let mut t = ChordTimeline::new();
        t.append(1.0, 2.0, "C").unwrap();
        assert!(matches!(
            t.append(0.5, 3.0, "G"),
            Err(TimelineError::StartOutOfOrder { .. })
        ));
        assert!(matches!(
            t.append(1.2, 1.8, "G"),
            Err(TimelineError::StopOutOfOrder { .. })
        ));
        // overlapping but monotonic spans are allowed
        t.append(1.5, 2.5, "G").unwrap();
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn test_make_timeline() {
        let t = make_timeline(&[0.0, 1.0, 2.0, 3.0], &["C", "G", "A:min"]).unwrap();
        let triples: Vec<(f64, f64, &str)> =
            t.iter().map(|i| (i.start, i.stop, i.label.as_str())).collect();
        assert_eq!(
            triples,
            vec![(0.0, 1.0, "C"), (1.0, 2.0, "G"), (2.0, 3.0, "A:min")]
        );
    }

    #[test]
    fn test_make_timeline_length_mismatch() {
        let err = make_timeline(&[0.0, 1.0, 2.0], &["C"]).unwrap_err();
        assert_eq!(
            err,
            TimelineError::LengthMismatch {
                boundaries: 3,
                expected: 2,
                actual: 1
            }
        );
        assert!(make_timeline::<&str>(&[], &[]).unwrap().is_empty());
    }

    #[test]
    fn test_label_at_and_merge() {
        let t = make_timeline(&[0.0, 1.0, 2.0, 3.0], &["C", "C", "G"]).unwrap();
        assert_eq!(t.label_at(1.5), Some("C"));
        assert_eq!(t.label_at(3.0), None);
        let m = t.merged();
        assert_eq!(m.len(), 2);
        assert!((m.intervals()[0].stop - 2.0).abs() < 1e-12);
    }
}
