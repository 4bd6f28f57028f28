//! Supervised chord recognition.
//!
//! Chroma vectors labelled from reference annotations train a [`Classifier`];
//! a [`LearnedRecognizer`] wraps it behind the [`ChordRecognizer`] interface.

use linfa::dataset::{Dataset, Pr};
use linfa::traits::{Fit, Predict};
use linfa_svm::Svm;
use ndarray::{Array1, Array2, Axis};

use super::{check_rows, column_array, ChordRecognizer, RecognitionError, Result};
use crate::music::Chord;
use crate::pipeline::ChromaMatrix;

/// Chroma vectors paired with their reference chords.
#[derive(Debug, Clone, Default)]
pub struct SupervisedVectors {
    vectors: Vec<[f32; 12]>,
    labels: Vec<Chord>,
}

impl SupervisedVectors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, vector: [f32; 12], label: Chord) {
        self.vectors.push(vector);
        self.labels.push(label);
    }

    pub fn extend(&mut self, other: SupervisedVectors) {
        self.vectors.extend(other.vectors);
        self.labels.extend(other.labels);
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[f32; 12], Chord)> {
        self.vectors.iter().zip(self.labels.iter().copied())
    }

    /// Distinct labels in first-seen order.
    pub fn classes(&self) -> Vec<Chord> {
        let mut seen = Vec::new();
        for label in &self.labels {
            if !seen.contains(label) {
                seen.push(*label);
            }
        }
        seen
    }
}

/// A trainable vector classifier.
pub trait Classifier: Send + Sync {
    fn fit(&mut self, data: &SupervisedVectors) -> Result<()>;

    fn predict(&self, vector: &[f32; 12]) -> Chord;
}

/// Assigns the label of the closest class mean (Euclidean distance).
#[derive(Debug, Clone, Default)]
pub struct NearestCentroid {
    centroids: Vec<(Chord, [f32; 12])>,
}

impl NearestCentroid {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn centroids(&self) -> &[(Chord, [f32; 12])] {
        &self.centroids
    }
}

impl Classifier for NearestCentroid {
    fn fit(&mut self, data: &SupervisedVectors) -> Result<()> {
        if data.is_empty() {
            return Err(RecognitionError::InvalidArgument(
                "cannot fit on an empty training set".into(),
            ));
        }
        let classes = data.classes();
        let mut sums = vec![[0.0f64; 12]; classes.len()];
        let mut counts = vec![0usize; classes.len()];

        for (vector, label) in data.iter() {
            // classes() holds every label in data
            let Some(idx) = classes.iter().position(|c| *c == label) else {
                continue;
            };
            for (acc, &v) in sums[idx].iter_mut().zip(vector) {
                *acc += v as f64;
            }
            counts[idx] += 1;
        }

        self.centroids = classes
            .into_iter()
            .zip(sums.iter().zip(&counts))
            .map(|(label, (sum, &count))| {
                let mut mean = [0.0f32; 12];
                for (m, &s) in mean.iter_mut().zip(sum) {
                    *m = (s / count as f64) as f32;
                }
                (label, mean)
            })
            .collect();
        log::debug!("Fitted {} centroids on {} vectors", self.centroids.len(), data.len());
        Ok(())
    }

    fn predict(&self, vector: &[f32; 12]) -> Chord {
        let mut best: Option<(Chord, f32)> = None;
        for (label, centroid) in &self.centroids {
            let dist: f32 = centroid
                .iter()
                .zip(vector)
                .map(|(c, v)| (c - v) * (c - v))
                .sum();
            if best.is_none_or(|(_, d)| dist < d) {
                best = Some((*label, dist));
            }
        }
        best.map(|(label, _)| label).unwrap_or(Chord::NoChord)
    }
}

/// Penalty values tried when fitting an [`SvmClassifier`].
pub const DEFAULT_C_GRID: [f64; 2] = [1.0, 50.0];

/// Every fifth training vector is held out to pick the penalty.
const HOLDOUT_STRIDE: usize = 5;

/// One-vs-rest RBF support vector machines with Platt-scaled outputs.
///
/// `fit` picks the penalty from the grid by accuracy on a held-out fifth of
/// the data, then refits on everything. The kernel width follows the data
/// variance: `eps = n_features * var(x)`.
pub struct SvmClassifier {
    c_grid: Vec<f64>,
    classes: Vec<Chord>,
    models: Vec<Svm<f64, Pr>>,
    selected_c: Option<f64>,
}

impl SvmClassifier {
    pub fn new() -> Self {
        Self {
            c_grid: DEFAULT_C_GRID.to_vec(),
            classes: Vec::new(),
            models: Vec::new(),
            selected_c: None,
        }
    }

    /// Use a custom penalty grid. Every value must be positive and finite.
    pub fn with_c_grid(grid: &[f64]) -> Result<Self> {
        if grid.is_empty() || grid.iter().any(|c| !c.is_finite() || *c <= 0.0) {
            return Err(RecognitionError::InvalidArgument(format!(
                "SVM penalty grid must be non-empty and positive, got {:?}",
                grid
            )));
        }
        Ok(Self {
            c_grid: grid.to_vec(),
            ..Self::new()
        })
    }

    /// Penalty chosen by the last `fit`.
    pub fn selected_c(&self) -> Option<f64> {
        self.selected_c
    }

    fn predict_row(models: &[Svm<f64, Pr>], classes: &[Chord], row: Array2<f64>) -> Chord {
        if models.is_empty() {
            return classes.first().copied().unwrap_or(Chord::NoChord);
        }
        let mut best: Option<(usize, f32)> = None;
        for (class, model) in models.iter().enumerate() {
            let probs: Array1<Pr> = Predict::predict(model, &row);
            let p = probs.iter().next().map(|p| **p).unwrap_or(0.0);
            if best.is_none_or(|(_, b)| p > b) {
                best = Some((class, p));
            }
        }
        best.and_then(|(class, _)| classes.get(class).copied())
            .unwrap_or(Chord::NoChord)
    }
}

impl Default for SvmClassifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Kernel width matching a `1 / (n_features * var)` gamma.
fn kernel_eps(records: &Array2<f64>) -> f64 {
    let n = records.len() as f64;
    if n == 0.0 {
        return 1.0;
    }
    let mean = records.sum() / n;
    let var = records.mapv(|x| (x - mean) * (x - mean)).sum() / n;
    let eps = records.ncols() as f64 * var;
    if eps > 0.0 { eps } else { 1.0 }
}

fn fit_one_vs_rest(
    records: &Array2<f64>,
    targets: &[usize],
    n_classes: usize,
    c: f64,
    eps: f64,
) -> Result<Vec<Svm<f64, Pr>>> {
    if n_classes < 2 {
        return Ok(Vec::new());
    }
    (0..n_classes)
        .map(|class| {
            let binary: Array1<bool> = targets.iter().map(|&t| t == class).collect();
            let dataset = Dataset::new(records.clone(), binary);
            let params = Svm::<f64, Pr>::params()
                .pos_neg_weights(c, c)
                .gaussian_kernel(eps);
            Fit::fit(&params, &dataset)
                .map_err(|e| RecognitionError::Training(format!("SVM (C={}): {}", c, e)))
        })
        .collect()
}

fn to_records(vectors: &[&[f32; 12]]) -> Array2<f64> {
    let mut records = Array2::<f64>::zeros((vectors.len(), 12));
    for (mut row, v) in records.rows_mut().into_iter().zip(vectors) {
        for (slot, &x) in row.iter_mut().zip(v.iter()) {
            *slot = x as f64;
        }
    }
    records
}

impl Classifier for SvmClassifier {
    fn fit(&mut self, data: &SupervisedVectors) -> Result<()> {
        if data.is_empty() {
            return Err(RecognitionError::InvalidArgument(
                "cannot fit on an empty training set".into(),
            ));
        }
        let classes = data.classes();
        let mut vectors = Vec::with_capacity(data.len());
        let mut targets = Vec::with_capacity(data.len());
        for (vector, label) in data.iter() {
            let Some(idx) = classes.iter().position(|c| *c == label) else {
                continue;
            };
            vectors.push(vector);
            targets.push(idx);
        }

        let (train, holdout): (Vec<usize>, Vec<usize>) =
            (0..vectors.len()).partition(|i| i % HOLDOUT_STRIDE != HOLDOUT_STRIDE - 1);
        let train_covers_all = (0..classes.len()).all(|c| train.iter().any(|&i| targets[i] == c));

        let mut chosen = self.c_grid[0];
        if self.c_grid.len() > 1 && !holdout.is_empty() && train_covers_all && classes.len() > 1 {
            let pick = |idx: &[usize]| -> (Array2<f64>, Vec<usize>) {
                let rows: Vec<&[f32; 12]> = idx.iter().map(|&i| vectors[i]).collect();
                (to_records(&rows), idx.iter().map(|&i| targets[i]).collect())
            };
            let (train_x, train_y) = pick(&train);
            let (hold_x, hold_y) = pick(&holdout);
            let eps = kernel_eps(&train_x);

            let mut best_accuracy = f64::NEG_INFINITY;
            for &c in &self.c_grid {
                let models = fit_one_vs_rest(&train_x, &train_y, classes.len(), c, eps)?;
                let mut correct = 0usize;
                for (row, &y) in hold_x.rows().into_iter().zip(&hold_y) {
                    let row = row.insert_axis(Axis(0)).to_owned();
                    if Self::predict_row(&models, &classes, row) == classes[y] {
                        correct += 1;
                    }
                }
                let accuracy = correct as f64 / hold_y.len() as f64;
                log::debug!("SVM C={}: held-out accuracy {:.3}", c, accuracy);
                if accuracy > best_accuracy {
                    best_accuracy = accuracy;
                    chosen = c;
                }
            }
        }

        let records = to_records(&vectors);
        let eps = kernel_eps(&records);
        self.models = fit_one_vs_rest(&records, &targets, classes.len(), chosen, eps)?;
        self.classes = classes;
        self.selected_c = Some(chosen);
        log::debug!(
            "Fitted {} SVMs on {} vectors (C={})",
            self.models.len(),
            data.len(),
            chosen
        );
        Ok(())
    }

    fn predict(&self, vector: &[f32; 12]) -> Chord {
        let row = to_records(&[vector]);
        Self::predict_row(&self.models, &self.classes, row)
    }
}

/// Recognizer backed by a trained classifier. Unusable until [`learn`] runs.
///
/// [`learn`]: LearnedRecognizer::learn
#[derive(Debug, Clone, Default)]
pub struct LearnedRecognizer<C = NearestCentroid> {
    classifier: C,
    resolution: Option<Vec<Chord>>,
}

impl<C: Classifier> LearnedRecognizer<C> {
    pub fn new(classifier: C) -> Self {
        Self {
            classifier,
            resolution: None,
        }
    }

    pub fn learn(&mut self, data: &SupervisedVectors) -> Result<()> {
        self.classifier.fit(data)?;
        self.resolution = Some(data.classes());
        Ok(())
    }

    pub fn is_trained(&self) -> bool {
        self.resolution.is_some()
    }

    /// Chords the classifier can emit, i.e. the labels seen in training.
    pub fn resolution(&self) -> Result<&[Chord]> {
        self.resolution
            .as_deref()
            .ok_or_else(|| RecognitionError::IllegalState("recognizer has not been trained".into()))
    }
}

impl<C: Classifier> ChordRecognizer for LearnedRecognizer<C> {
    fn predict(&self, chroma: &ChromaMatrix) -> Result<Vec<Chord>> {
        self.resolution()?;
        check_rows(chroma)?;
        Ok((0..chroma.ncols())
            .map(|t| self.classifier.predict(&column_array(chroma, t)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::music::{ChordQuality, PitchClass};
    use ndarray::Array2;

    fn one_hot(bins: &[usize]) -> [f32; 12] {
        let mut v = [0.0; 12];
        for &b in bins {
            v[b] = 1.0;
        }
        v
    }

    fn training_set() -> SupervisedVectors {
        let c = Chord::triad(PitchClass::C, ChordQuality::Major);
        let a_min = Chord::triad(PitchClass::A, ChordQuality::Minor);
        let mut data = SupervisedVectors::new();
        data.push(one_hot(&[0, 4, 7]), c);
        data.push(one_hot(&[0, 4]), c);
        data.push(one_hot(&[9, 0, 4]), a_min);
        data.push(one_hot(&[9, 0]), a_min);
        data.push([0.0; 12], Chord::NoChord);
        data
    }

    #[test]
    fn test_classes_first_seen_order() {
        let classes = training_set().classes();
        assert_eq!(classes.len(), 3);
        assert_eq!(classes[0].to_string(), "C");
        assert_eq!(classes[2], Chord::NoChord);
    }

    #[test]
    fn test_nearest_centroid() {
        let mut clf = NearestCentroid::new();
        clf.fit(&training_set()).unwrap();
        assert_eq!(clf.centroids().len(), 3);
        assert_eq!(clf.predict(&one_hot(&[0, 4, 7])).to_string(), "C");
        assert_eq!(clf.predict(&one_hot(&[9, 0])).to_string(), "A:min");
        assert_eq!(clf.predict(&[0.0; 12]), Chord::NoChord);
    }

    #[test]
    fn test_fit_rejects_empty() {
        let mut clf = NearestCentroid::new();
        assert!(matches!(
            clf.fit(&SupervisedVectors::new()),
            Err(RecognitionError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_untrained_recognizer_is_illegal_state() {
        let rec = LearnedRecognizer::new(NearestCentroid::new());
        assert!(!rec.is_trained());
        assert!(matches!(rec.resolution(), Err(RecognitionError::IllegalState(_))));
        let chroma = Array2::<f32>::zeros((12, 2));
        assert!(matches!(
            rec.predict(&chroma),
            Err(RecognitionError::IllegalState(_))
        ));
    }

    #[test]
    fn test_learned_recognizer_predicts() {
        let mut rec = LearnedRecognizer::<NearestCentroid>::default();
        rec.learn(&training_set()).unwrap();
        assert_eq!(rec.resolution().unwrap().len(), 3);

        let mut chroma = Array2::<f32>::zeros((12, 2));
        chroma[[0, 0]] = 1.0;
        chroma[[4, 0]] = 1.0;
        chroma[[7, 0]] = 1.0;
        chroma[[9, 1]] = 1.0;
        chroma[[0, 1]] = 1.0;
        let labels: Vec<String> = rec.predict(&chroma).unwrap().iter().map(|c| c.to_string()).collect();
        assert_eq!(labels, vec!["C", "A:min"]);

        let bad = Array2::<f32>::zeros((6, 2));
        assert!(matches!(rec.predict(&bad), Err(RecognitionError::InvalidArgument(_))));
    }

    /// Ten jittered copies of each of three chord shapes.
    fn clustered_set() -> SupervisedVectors {
        let shapes = [
            (one_hot(&[0, 4, 7]), Chord::triad(PitchClass::C, ChordQuality::Major)),
            (one_hot(&[9, 0, 4]), Chord::triad(PitchClass::A, ChordQuality::Minor)),
            (one_hot(&[7, 11, 2]), Chord::triad(PitchClass::G, ChordQuality::Major)),
        ];
        let mut data = SupervisedVectors::new();
        for k in 0..10 {
            for (base, label) in &shapes {
                let mut v = *base;
                for (i, x) in v.iter_mut().enumerate() {
                    *x += 0.1 * ((k * 7 + i * 3) % 5) as f32 / 5.0;
                }
                data.push(v, *label);
            }
        }
        data
    }

    #[test]
    fn test_svm_separates_clusters() {
        let mut clf = SvmClassifier::new();
        clf.fit(&clustered_set()).unwrap();
        let c = clf.selected_c().unwrap();
        assert!(DEFAULT_C_GRID.contains(&c));
        assert_eq!(clf.predict(&one_hot(&[0, 4, 7])).to_string(), "C");
        assert_eq!(clf.predict(&one_hot(&[9, 0, 4])).to_string(), "A:min");
        assert_eq!(clf.predict(&one_hot(&[7, 11, 2])).to_string(), "G");
    }

    #[test]
    fn test_svm_single_class() {
        let g = Chord::triad(PitchClass::G, ChordQuality::Major);
        let mut data = SupervisedVectors::new();
        data.push(one_hot(&[7, 11, 2]), g);
        data.push(one_hot(&[7, 11]), g);
        let mut clf = SvmClassifier::new();
        clf.fit(&data).unwrap();
        assert_eq!(clf.selected_c(), Some(DEFAULT_C_GRID[0]));
        assert_eq!(clf.predict(&[0.0; 12]), g);
    }

    #[test]
    fn test_svm_rejects_empty_and_bad_grid() {
        let mut clf = SvmClassifier::new();
        assert!(matches!(
            clf.fit(&SupervisedVectors::new()),
            Err(RecognitionError::InvalidArgument(_))
        ));
        assert!(clf.selected_c().is_none());
        assert!(SvmClassifier::with_c_grid(&[]).is_err());
        assert!(SvmClassifier::with_c_grid(&[1.0, 0.0]).is_err());
        assert!(SvmClassifier::with_c_grid(&[f64::NAN]).is_err());
    }

    #[test]
    fn test_svm_fixed_grid_skips_search() {
        let mut clf = SvmClassifier::with_c_grid(&[10.0]).unwrap();
        clf.fit(&clustered_set()).unwrap();
        assert_eq!(clf.selected_c(), Some(10.0));
    }

    #[test]
    fn test_learned_recognizer_with_svm() {
        let mut rec = LearnedRecognizer::new(SvmClassifier::new());
        rec.learn(&clustered_set()).unwrap();
        assert_eq!(rec.resolution().unwrap().len(), 3);

        let mut chroma = Array2::<f32>::zeros((12, 2));
        for bin in [0, 4, 7] {
            chroma[[bin, 0]] = 1.0;
        }
        for bin in [7, 11, 2] {
            chroma[[bin, 1]] = 1.0;
        }
        let labels: Vec<String> = rec.predict(&chroma).unwrap().iter().map(|c| c.to_string()).collect();
        assert_eq!(labels, vec!["C", "G"]);
    }
}
