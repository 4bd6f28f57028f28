use std::io::Write;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::music::{canonical_labels, PitchClass};
use crate::timeline::{ChordTimeline, TimelineError};

#[derive(Error, Debug)]
pub enum AnnotationError {
    #[error("Unsupported annotation format: {0}")]
    UnsupportedFormat(String),
    #[error("Malformed row at line {line}: {reason}")]
    Malformed { line: usize, reason: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Timeline error: {0}")]
    Timeline(#[from] TimelineError),
}

pub type Result<T> = std::result::Result<T, AnnotationError>;

/// Whitespace separates fields. Labels may contain commas (`D:(1,4)`).
static FIELD_SEP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Leading note name of a chord label: a letter and an optional accidental.
static ROOT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-G][#b]?").unwrap());

/// Canonical triad labels, longest first so prefix matching picks the most specific.
static CANONICAL: LazyLock<Vec<String>> = LazyLock::new(|| {
    let mut labels = canonical_labels();
    labels.sort_by_key(|l| std::cmp::Reverse(l.len()));
    labels
});

/// Collapse a richer chord label onto the longest canonical triad name that
/// prefixes it (`C:min7` -> `C:min`). Flat roots are respelled as sharps
/// first (`Bb:min7` -> `A#:min`). Labels with no such prefix are kept.
pub fn normalize_label(label: &str) -> String {
    let spelled = respell_root(label);
    CANONICAL
        .iter()
        .find(|c| spelled.starts_with(c.as_str()))
        .cloned()
        .unwrap_or_else(|| label.to_string())
}

/// Rewrite the root of `label` with the canonical sharp spelling.
fn respell_root(label: &str) -> String {
    let Some(root) = ROOT_RE.find(label) else {
        return label.to_string();
    };
    match PitchClass::parse(root.as_str()) {
        Some(pc) => format!("{}{}", pc.name(), &label[root.end()..]),
        None => label.to_string(),
    }
}

/// A reader for one annotation file format.
pub trait AnnotationParser: Send + Sync {
    /// Whether this parser handles the given file.
    fn accepts(&self, path: &Path) -> bool;

    fn parse(&self, path: &Path) -> Result<ChordTimeline>;
}

/// Three-column `start stop label` files (`.lab`).
#[derive(Debug, Default, Clone, Copy)]
pub struct LabParser;

impl LabParser {
    /// Parse `.lab` content already in memory.
    pub fn parse_str(&self, contents: &str) -> Result<ChordTimeline> {
        let mut timeline = ChordTimeline::new();
        for (idx, raw) in contents.lines().enumerate() {
            let line = idx + 1;
            let row = raw.trim();
            if row.is_empty() || row.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = FIELD_SEP_RE.split(row).collect();
            if fields.len() != 3 {
                return Err(AnnotationError::Malformed {
                    line,
                    reason: format!("expected 3 fields, found {}", fields.len()),
                });
            }
            let start = parse_time(fields[0], line)?;
            let stop = parse_time(fields[1], line)?;
            timeline.append(start, stop, normalize_label(fields[2]))?;
        }
        Ok(timeline)
    }
}

fn parse_time(field: &str, line: usize) -> Result<f64> {
    field.parse::<f64>().map_err(|e| AnnotationError::Malformed {
        line,
        reason: format!("bad time '{}': {}", field, e),
    })
}

impl AnnotationParser for LabParser {
    fn accepts(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("lab"))
    }

    fn parse(&self, path: &Path) -> Result<ChordTimeline> {
        let contents = std::fs::read_to_string(path)?;
        self.parse_str(&contents)
    }
}

/// Registered annotation parsers, tried in order.
pub fn parsers() -> Vec<Box<dyn AnnotationParser>> {
    vec![Box::new(LabParser)]
}

/// Parse an annotation file with the first parser that accepts it.
pub fn parse_annotation(path: &Path) -> Result<ChordTimeline> {
    let parser = parsers()
        .into_iter()
        .find(|p| p.accepts(path))
        .ok_or_else(|| AnnotationError::UnsupportedFormat(path.display().to_string()))?;
    log::debug!("Parsing annotation {}", path.display());
    parser.parse(path)
}

/// Write a timeline as `.lab` rows.
pub fn write_lab<W: Write>(timeline: &ChordTimeline, mut writer: W) -> std::io::Result<()> {
    for interval in timeline {
        writeln!(
            writer,
            "{:.6} {:.6} {}",
            interval.start, interval.stop, interval.label
        )?;
    }
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_label() {
        assert_eq!(normalize_label("C:min7"), "C:min");
        assert_eq!(normalize_label("C#:min"), "C#:min");
        assert_eq!(normalize_label("C#:maj7"), "C#");
        assert_eq!(normalize_label("G:dim7"), "G:dim");
        assert_eq!(normalize_label("A"), "A");
        assert_eq!(normalize_label("N"), "N");
        assert_eq!(normalize_label("X"), "X");
    }

    #[test]
    fn test_normalize_flat_roots() {
        assert_eq!(normalize_label("Bb:min7"), "A#:min");
        assert_eq!(normalize_label("Eb"), "D#");
        assert_eq!(normalize_label("Eb:min"), "D#:min");
        assert_eq!(normalize_label("Ab:min"), "G#:min");
        assert_eq!(normalize_label("Db:maj7"), "C#");
        assert_eq!(normalize_label("Cb"), "B");
        assert_eq!(normalize_label("Bb/5"), "A#");
        // the natural B keeps its spelling
        assert_eq!(normalize_label("B:min"), "B:min");
    }

    #[test]
    fn test_parse_lab_labels_with_commas() {
        let t = LabParser
            .parse_str("0.0 1.0 C\n1.0 2.0 D:(1,4)\n2.0 3.0 C:(1,b3,5)\n")
            .unwrap();
        let labels: Vec<&str> = t.iter().map(|i| i.label.as_str()).collect();
        assert_eq!(labels, vec!["C", "D", "C"]);

        // commas are not field separators
        let err = LabParser.parse_str("0.0,1.0,C\n").unwrap_err();
        assert!(matches!(err, AnnotationError::Malformed { line: 1, .. }));
    }

    #[test]
    fn test_parse_lab_rows() {
        let content = "0.0 1.5 C\n\n# comment\n1.5 3.0 A:min7\n3.0\t4.25  G:sus4\n";
        let t = LabParser.parse_str(content).unwrap();
        let labels: Vec<&str> = t.iter().map(|i| i.label.as_str()).collect();
        assert_eq!(labels, vec!["C", "A:min", "G"]);
        assert!((t.duration() - 4.25).abs() < 1e-12);
    }

    #[test]
    fn test_parse_lab_malformed() {
        let err = LabParser.parse_str("0.0 1.0 C\n1.0 2.0\n").unwrap_err();
        assert!(matches!(err, AnnotationError::Malformed { line: 2, .. }));
        let err = LabParser.parse_str("zero 1.0 C\n").unwrap_err();
        assert!(matches!(err, AnnotationError::Malformed { line: 1, .. }));
    }

    #[test]
    fn test_parse_lab_rejects_bad_interval() {
        let err = LabParser.parse_str("1.0 0.5 C\n").unwrap_err();
        assert!(matches!(err, AnnotationError::Timeline(_)));
    }

    #[test]
    fn test_dispatch_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let lab = dir.path().join("song.lab");
        std::fs::write(&lab, "0 2 D:min\n2 4 N\n").unwrap();
        let t = parse_annotation(&lab).unwrap();
        assert_eq!(t.len(), 2);

        let csv = dir.path().join("song.csv");
        std::fs::write(&csv, "0 2 D:min\n").unwrap();
        assert!(matches!(
            parse_annotation(&csv),
            Err(AnnotationError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_write_then_parse() {
        let t = crate::timeline::make_timeline(&[0.0, 0.5, 1.25], &["E", "B:min"]).unwrap();
        let mut buf = Vec::new();
        write_lab(&t, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text, "0.000000 0.500000 E\n0.500000 1.250000 B:min\n");
        assert_eq!(LabParser.parse_str(&text).unwrap(), t);
    }
}
