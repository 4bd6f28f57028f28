//! Harmonic energy chord templates.
//!
//! Each triad is modelled as the sum of the harmonic series of its three
//! notes, with the i-th partial weighted by `alpha^i`. The resulting 12-bin
//! vectors are what chroma columns get matched against.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use crate::music::{harmonics, Chord, ChordQuality, PitchClass};

pub const DEFAULT_ALPHA: f64 = 0.5;
pub const DEFAULT_DEPTH: usize = 8;

/// Octave of the fundamental used when mapping partials to pitch classes.
pub const START_OCTAVE: i32 = 2;

/// Energy contributed by a single note of a chord, aligned so bin 0 is C.
///
/// Bin 0 of the unrotated vector collects the octave partials of `root`, the
/// third and fifth bins (as given by `quality`) collect partials landing on
/// those degrees, and the minor/major seventh bins are always filled.
pub fn note_energy(root: PitchClass, quality: ChordQuality, alpha: f64, depth: usize) -> [f64; 12] {
    let series = harmonics(root, START_OCTAVE, depth);
    let base = root.index();

    // Weighted sum over partials whose pitch class sits `offset` above the root.
    let weighted = |offset: usize, from: usize| -> f64 {
        let target = (base + offset) % 12;
        series
            .iter()
            .enumerate()
            .skip(from)
            .filter(|(_, pc)| pc.index() == target)
            .map(|(i, _)| alpha.powi(i as i32))
            .sum()
    };

    let mut energy = [0.0; 12];
    energy[0] = 1.0 + weighted(0, 1);
    energy[quality.third()] = weighted(quality.third(), 1);
    energy[quality.fifth()] = weighted(quality.fifth(), 1);
    energy[10] = weighted(10, 0);
    energy[11] = weighted(11, 0);

    energy.rotate_right(base);
    energy
}

/// Template vector of a triad: the note energies of root, third and fifth.
pub fn triad_energy(quality: ChordQuality, root: PitchClass, alpha: f64, depth: usize) -> [f64; 12] {
    let mut energy = [0.0; 12];
    for note in [root, root.transpose(quality.third()), root.transpose(quality.fifth())] {
        for (acc, e) in energy.iter_mut().zip(note_energy(note, quality, alpha, depth)) {
            *acc += e;
        }
    }
    energy
}

impl Chord {
    /// Template energy of this chord. "No chord" has no energy anywhere.
    pub fn energy(&self, alpha: f64, depth: usize) -> [f64; 12] {
        match *self {
            Chord::Triad { root, quality } => triad_energy(quality, root, alpha, depth),
            Chord::NoChord => [0.0; 12],
        }
    }
}

/// A precomputed triad template. Identity is (quality, root).
#[derive(Debug, Clone)]
pub struct ChordTemplate {
    pub quality: ChordQuality,
    pub root: PitchClass,
    pub alpha: f64,
    pub depth: usize,
    vector: [f64; 12],
}

impl ChordTemplate {
    pub fn new(quality: ChordQuality, root: PitchClass, alpha: f64, depth: usize) -> Self {
        Self {
            quality,
            root,
            alpha,
            depth,
            vector: triad_energy(quality, root, alpha, depth),
        }
    }

    pub fn vector(&self) -> &[f64; 12] {
        &self.vector
    }

    pub fn chord(&self) -> Chord {
        Chord::triad(self.root, self.quality)
    }

    /// Dot product against a chroma column.
    pub fn score(&self, column: &[f32]) -> f64 {
        self.vector
            .iter()
            .zip(column)
            .map(|(t, &c)| t * c as f64)
            .sum()
    }
}

impl PartialEq for ChordTemplate {
    fn eq(&self, other: &Self) -> bool {
        self.quality == other.quality && self.root == other.root
    }
}

impl Eq for ChordTemplate {}

impl Hash for ChordTemplate {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.quality.hash(state);
        self.root.hash(state);
    }
}

/// All 48 triad templates for one (alpha, depth), qualities outermost.
#[derive(Debug, Clone)]
pub struct TemplateBank {
    alpha: f64,
    depth: usize,
    templates: Vec<ChordTemplate>,
}

impl TemplateBank {
    pub fn new(alpha: f64, depth: usize) -> Self {
        let templates = ChordQuality::ALL
            .iter()
            .flat_map(|&quality| {
                PitchClass::ALL
                    .iter()
                    .map(move |&root| ChordTemplate::new(quality, root, alpha, depth))
            })
            .collect();
        Self {
            alpha,
            depth,
            templates,
        }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn templates(&self) -> &[ChordTemplate] {
        &self.templates
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn get(&self, root: PitchClass, quality: ChordQuality) -> Option<&ChordTemplate> {
        self.templates
            .iter()
            .find(|t| t.root == root && t.quality == quality)
    }
}

/// Shared banks keyed by (alpha, depth).
#[derive(Debug, Default)]
pub struct TemplateCache {
    banks: Mutex<HashMap<(u64, usize), Arc<TemplateBank>>>,
}

impl TemplateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide cache instance.
    pub fn global() -> &'static TemplateCache {
        static CACHE: OnceLock<TemplateCache> = OnceLock::new();
        CACHE.get_or_init(TemplateCache::new)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(u64, usize), Arc<TemplateBank>>> {
        match self.banks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Fetch the bank for these parameters, building it on first use.
    pub fn get(&self, alpha: f64, depth: usize) -> Arc<TemplateBank> {
        let key = (alpha.to_bits(), depth);
        self.lock()
            .entry(key)
            .or_insert_with(|| {
                log::debug!("Building template bank (alpha={}, depth={})", alpha, depth);
                Arc::new(TemplateBank::new(alpha, depth))
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_vec_close(actual: &[f64; 12], expected: &[f64; 12]) {
        for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
            assert!((a - e).abs() < 1e-6, "bin {}: {} != {}", i, a, e);
        }
    }

    #[test]
    fn test_c_major_template() {
        let v = triad_energy(ChordQuality::Major, PitchClass::C, 0.5, 8);
        assert_vec_close(
            &v,
            &[
                1.6328125, 0.0, 0.296875, 0.0, 1.6953125, 0.015625, 0.0, 1.9140625, 0.0625, 0.0,
                0.015625, 0.34375,
            ],
        );
    }

    #[test]
    fn test_c_minor_template() {
        let v = triad_energy(ChordQuality::Minor, PitchClass::C, 0.5, 8);
        assert_vec_close(
            &v,
            &[
                1.6328125, 0.015625, 0.28125, 1.6328125, 0.0, 0.015625, 0.0, 1.9140625, 0.0, 0.0,
                0.296875, 0.0,
            ],
        );
    }

    #[test]
    fn test_augmented_and_diminished_templates() {
        let aug = triad_energy(ChordQuality::Augmented, PitchClass::C, 0.5, 8);
        assert_vec_close(
            &aug,
            &[
                1.6953125, 0.0, 0.015625, 0.0, 1.6953125, 0.0, 0.015625, 0.0, 1.6953125, 0.0,
                0.015625, 0.0,
            ],
        );
        let dim = triad_energy(ChordQuality::Diminished, PitchClass::C, 0.5, 8);
        assert_vec_close(
            &dim,
            &[
                1.6328125, 0.015625, 0.0, 1.6328125, 0.015625, 0.0, 1.6328125, 0.0, 0.0, 0.0,
                0.015625, 0.0,
            ],
        );
    }

    #[test]
    fn test_note_energy_root_bin() {
        // octave partials 2, 4 and 8 reinforce the root
        let v = note_energy(PitchClass::C, ChordQuality::Major, 0.5, 8);
        assert!((v[0] - (1.0 + 0.5 + 0.125 + 0.0078125)).abs() < 1e-12);
        assert!((v[7] - (0.25 + 0.03125)).abs() < 1e-12);
        assert!((v[4] - 0.0625).abs() < 1e-12);
    }

    #[test]
    fn test_depth_one_is_root_only() {
        let v = note_energy(PitchClass::D, ChordQuality::Minor, 0.5, 1);
        let mut expected = [0.0; 12];
        expected[2] = 1.0;
        assert_vec_close(&v, &expected);
    }

    #[test]
    fn test_shift_invariance() {
        for quality in ChordQuality::ALL {
            let base = triad_energy(quality, PitchClass::C, 0.5, 8);
            for root in PitchClass::ALL {
                let mut expected = base;
                expected.rotate_right(root.index());
                assert_vec_close(&triad_energy(quality, root, 0.5, 8), &expected);
            }
        }
    }

    #[test]
    fn test_no_chord_energy_is_zero() {
        assert_eq!(Chord::NoChord.energy(0.5, 8), [0.0; 12]);
    }

    #[test]
    fn test_bank_order() {
        let bank = TemplateBank::new(DEFAULT_ALPHA, DEFAULT_DEPTH);
        assert_eq!(bank.len(), 48);
        let labels: Vec<String> = bank.templates().iter().map(|t| t.chord().to_string()).collect();
        assert_eq!(labels, crate::music::canonical_labels());
    }

    #[test]
    fn test_template_identity_ignores_parameters() {
        let a = ChordTemplate::new(ChordQuality::Major, PitchClass::G, 0.5, 8);
        let b = ChordTemplate::new(ChordQuality::Major, PitchClass::G, 0.9, 3);
        assert_eq!(a, b);
        assert_ne!(a, ChordTemplate::new(ChordQuality::Minor, PitchClass::G, 0.5, 8));
    }

    #[test]
    fn test_cache_reuses_banks() {
        let cache = TemplateCache::new();
        let a = cache.get(0.5, 8);
        let b = cache.get(0.5, 8);
        assert!(Arc::ptr_eq(&a, &b));
        let c = cache.get(0.6, 8);
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_cache_survives_poisoned_lock() {
        let cache = Arc::new(TemplateCache::new());
        cache.get(0.5, 8);
        let poisoner = Arc::clone(&cache);
        let result = std::thread::spawn(move || {
            let _guard = poisoner.banks.lock().unwrap();
            panic!("poison the cache lock");
        })
        .join();
        assert!(result.is_err());
        assert!(cache.banks.is_poisoned());

        assert_eq!(cache.len(), 1);
        assert!(!cache.is_empty());
        cache.get(0.6, 8);
        assert_eq!(cache.len(), 2);
    }
}
