//! Pitch classes, triad qualities and chord labels.

use std::fmt;

/// The twelve equal-tempered pitch classes, C = 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PitchClass {
    C,
    Cs,
    D,
    Ds,
    E,
    F,
    Fs,
    G,
    Gs,
    A,
    As,
    B,
}

/// Reference frequencies at octave 0 (C0 .. B0), in Hz.
const OCTAVE_ZERO_HZ: [f64; 12] = [
    16.35159883,
    17.32391444,
    18.35404799,
    19.44543648,
    20.60172231,
    21.82676446,
    23.12465142,
    24.49971475,
    25.9565436,
    27.50,
    29.13523509,
    30.86770633,
];

const NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Highest octave used when building the chromatic table for harmonic lookup.
const MAX_TABLE_OCTAVE: i32 = 7;

impl PitchClass {
    pub const ALL: [PitchClass; 12] = [
        PitchClass::C,
        PitchClass::Cs,
        PitchClass::D,
        PitchClass::Ds,
        PitchClass::E,
        PitchClass::F,
        PitchClass::Fs,
        PitchClass::G,
        PitchClass::Gs,
        PitchClass::A,
        PitchClass::As,
        PitchClass::B,
    ];

    /// Look up a pitch class by index. Anything outside 0..=11 (including the
    /// `-1` "unknown" sentinel used by annotation tools) yields `None`.
    pub fn from_index(index: i32) -> Option<Self> {
        usize::try_from(index)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        NAMES[self.index()]
    }

    /// Frequency of this pitch class in the given octave (octave 0 = C0..B0).
    pub fn frequency(self, octave: i32) -> f64 {
        OCTAVE_ZERO_HZ[self.index()] * 2f64.powi(octave)
    }

    /// Move up by `semitones`, wrapping around the octave.
    pub fn transpose(self, semitones: usize) -> Self {
        Self::ALL[(self.index() + semitones) % 12]
    }

    /// Parse a note name such as `C`, `F#` or `Bb` (flats are mapped onto the
    /// sharp spelling).
    pub fn parse(name: &str) -> Option<Self> {
        let mut chars = name.chars();
        let letter = chars.next()?;
        let base: usize = match letter {
            'C' => 0,
            'D' => 2,
            'E' => 4,
            'F' => 5,
            'G' => 7,
            'A' => 9,
            'B' => 11,
            _ => return None,
        };
        let index = match chars.as_str() {
            "" => base,
            "#" => base + 1,
            "b" => base + 11,
            _ => return None,
        };
        Some(Self::ALL[index % 12])
    }
}

impl fmt::Display for PitchClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Map the first `depth` partials of `root` (fundamental in `start_octave`)
/// onto the nearest equal-tempered pitch class.
///
/// The chromatic lookup table starts at C of `start_octave` and stops at the
/// first frequency above the highest partial. Equidistant partials resolve to
/// the lower table entry.
pub fn harmonics(root: PitchClass, start_octave: i32, depth: usize) -> Vec<PitchClass> {
    let fundamental = root.frequency(start_octave);
    let partials: Vec<f64> = (1..=depth).map(|i| fundamental * i as f64).collect();
    let highest = partials.iter().copied().fold(0.0, f64::max);

    let mut table = Vec::new();
    'octaves: for octave in start_octave..=MAX_TABLE_OCTAVE {
        for pc in PitchClass::ALL {
            let freq = pc.frequency(octave);
            table.push(freq);
            if freq > highest {
                break 'octaves;
            }
        }
    }

    partials
        .iter()
        .map(|&partial| {
            let mut best = 0;
            let mut best_diff = f64::INFINITY;
            for (i, &freq) in table.iter().enumerate() {
                let diff = (freq - partial).abs();
                // strict comparison keeps the lower entry on ties
                if diff < best_diff {
                    best_diff = diff;
                    best = i;
                }
            }
            PitchClass::ALL[best % 12]
        })
        .collect()
}

/// Triad qualities recognised by the template model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChordQuality {
    Major,
    Minor,
    Augmented,
    Diminished,
}

impl ChordQuality {
    /// Enumeration order used for template banks and tie-breaking.
    pub const ALL: [ChordQuality; 4] = [
        ChordQuality::Major,
        ChordQuality::Minor,
        ChordQuality::Augmented,
        ChordQuality::Diminished,
    ];

    /// Semitone offset of the third above the root.
    pub fn third(self) -> usize {
        match self {
            ChordQuality::Minor | ChordQuality::Diminished => 3,
            ChordQuality::Major | ChordQuality::Augmented => 4,
        }
    }

    /// Semitone offset of the fifth above the root.
    pub fn fifth(self) -> usize {
        match self {
            ChordQuality::Major | ChordQuality::Minor => 7,
            ChordQuality::Diminished => 6,
            ChordQuality::Augmented => 8,
        }
    }

    /// Label suffix in Harte-style notation (`""`, `":min"`, ...).
    pub fn suffix(self) -> &'static str {
        match self {
            ChordQuality::Major => "",
            ChordQuality::Minor => ":min",
            ChordQuality::Augmented => ":aug",
            ChordQuality::Diminished => ":dim",
        }
    }
}

/// A recognised chord: a triad, or the "no chord" symbol `N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Chord {
    Triad {
        root: PitchClass,
        quality: ChordQuality,
    },
    NoChord,
}

impl Chord {
    pub fn triad(root: PitchClass, quality: ChordQuality) -> Self {
        Chord::Triad { root, quality }
    }

    pub fn is_no_chord(&self) -> bool {
        matches!(self, Chord::NoChord)
    }

    /// The pitch classes sounding in this chord (empty for `N`).
    pub fn notes(&self) -> Vec<PitchClass> {
        match *self {
            Chord::Triad { root, quality } => vec![
                root,
                root.transpose(quality.third()),
                root.transpose(quality.fifth()),
            ],
            Chord::NoChord => Vec::new(),
        }
    }

    /// Parse one of the canonical labels produced by `Display`.
    pub fn parse(label: &str) -> Option<Self> {
        if label == "N" {
            return Some(Chord::NoChord);
        }
        let (root, suffix) = match label.find(':') {
            Some(i) => (&label[..i], &label[i..]),
            None => (label, ""),
        };
        let root = PitchClass::parse(root)?;
        let quality = ChordQuality::ALL
            .into_iter()
            .find(|q| q.suffix() == suffix)?;
        Some(Chord::triad(root, quality))
    }
}

impl fmt::Display for Chord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chord::Triad { root, quality } => write!(f, "{}{}", root, quality.suffix()),
            Chord::NoChord => f.write_str("N"),
        }
    }
}

/// Canonical labels of all 48 triads, in template enumeration order.
pub fn canonical_labels() -> Vec<String> {
    ChordQuality::ALL
        .iter()
        .flat_map(|&q| PitchClass::ALL.iter().map(move |&r| Chord::triad(r, q).to_string()))
        .collect()
}
