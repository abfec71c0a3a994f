//! Supervised tree-ensemble classification of feature stacks.
//!
//! Without labelled pixels the classifier stays untrained and its result
//! carries no scores or labels.

use crate::core::anomaly::{
    check_bands, derive_tree_seed, informative_bands, required_samples, score_statistics, valid_pixels,
    AnomalyEngine,
};
use crate::types::{
    AnomalyResult, EngineMode, FeatureBand, FeatureStack, FusionError, FusionResult, ModelState,
};
use ndarray::{Array2, Zip};
use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Random forest hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierParams {
    pub n_estimators: usize,
    pub max_depth: usize,
    pub min_samples_split: usize,
    pub random_seed: u64,
}

impl Default for ClassifierParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: 12,
            min_samples_split: 2,
            random_seed: 42,
        }
    }
}

impl ClassifierParams {
    pub fn validate(&self) -> FusionResult<()> {
        if self.n_estimators == 0 {
            return Err(FusionError::InvalidParameter {
                name: "classifier.n_estimators".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_depth == 0 {
            return Err(FusionError::InvalidParameter {
                name: "classifier.max_depth".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.min_samples_split < 2 {
            return Err(FusionError::InvalidParameter {
                name: "classifier.min_samples_split".to_string(),
                reason: format!("must be at least 2, got {}", self.min_samples_split),
            });
        }
        Ok(())
    }
}

/// Per-pixel class labels; negative values mark unlabelled pixels
#[derive(Debug, Clone)]
pub struct TrainingLabels {
    labels: Array2<i32>,
}

impl TrainingLabels {
    pub fn new(labels: Array2<i32>) -> FusionResult<Self> {
        if let Some(&bad) = labels.iter().find(|&&l| l > u8::MAX as i32) {
            return Err(FusionError::InvalidParameter {
                name: "labels".to_string(),
                reason: format!("class {} exceeds the maximum of {}", bad, u8::MAX),
            });
        }
        Ok(Self { labels })
    }

    pub fn labels(&self) -> &Array2<i32> {
        &self.labels
    }

    pub fn shape(&self) -> (usize, usize) {
        self.labels.dim()
    }

    pub fn labelled_count(&self) -> usize {
        self.labels.iter().filter(|&&l| l >= 0).count()
    }
}

#[derive(Debug, Clone)]
enum TreeNode {
    Split {
        feature: usize,
        threshold: f32,
        left: usize,
        right: usize,
    },
    Leaf {
        class: u8,
    },
}

#[derive(Debug, Clone)]
struct DecisionTree {
    nodes: Vec<TreeNode>,
}

impl DecisionTree {
    fn predict<F: Fn(usize) -> f32>(&self, value: F) -> u8 {
        let mut node = 0;
        loop {
            match &self.nodes[node] {
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => node = if value(*feature) < *threshold { *left } else { *right },
                TreeNode::Leaf { class } => return *class,
            }
        }
    }
}

/// Training set in row-major n x d layout
struct Samples<'a> {
    x: &'a [f32],
    y: &'a [u8],
    dims: usize,
    n_classes: usize,
}

struct CartBuilder<'a> {
    samples: &'a Samples<'a>,
    params: &'a ClassifierParams,
    features_per_split: usize,
    nodes: Vec<TreeNode>,
}

impl CartBuilder<'_> {
    fn class_counts(&self, rows: &[usize]) -> Vec<usize> {
        let mut counts = vec![0; self.samples.n_classes];
        for &r in rows {
            counts[self.samples.y[r] as usize] += 1;
        }
        counts
    }

    fn grow(&mut self, rows: &mut [usize], depth: usize, rng: &mut StdRng) -> usize {
        let counts = self.class_counts(rows);
        let majority = argmax(&counts) as u8;
        let id = self.nodes.len();
        self.nodes.push(TreeNode::Leaf { class: majority });

        let pure = counts.iter().filter(|&&c| c > 0).count() <= 1;
        if pure || depth >= self.params.max_depth || rows.len() < self.params.min_samples_split {
            return id;
        }

        let Some((feature, threshold)) = self.best_split(rows, &counts, rng) else {
            return id;
        };

        let dims = self.samples.dims;
        let mut split = 0;
        for i in 0..rows.len() {
            if self.samples.x[rows[i] * dims + feature] < threshold {
                rows.swap(i, split);
                split += 1;
            }
        }

        let (left_rows, right_rows) = rows.split_at_mut(split);
        let left = self.grow(left_rows, depth + 1, rng);
        let right = self.grow(right_rows, depth + 1, rng);
        self.nodes[id] = TreeNode::Split {
            feature,
            threshold,
            left,
            right,
        };
        id
    }

    /// Lowest weighted Gini impurity over a random feature subset
    fn best_split(&self, rows: &[usize], counts: &[usize], rng: &mut StdRng) -> Option<(usize, f32)> {
        let dims = self.samples.dims;
        let n = rows.len() as f64;
        let mut best: Option<(f64, usize, f32)> = None;

        for feature in index::sample(rng, dims, self.features_per_split).into_vec() {
            let mut column: Vec<(f32, u8)> = rows
                .iter()
                .map(|&r| (self.samples.x[r * dims + feature], self.samples.y[r]))
                .collect();
            column.sort_by(|a, b| a.0.total_cmp(&b.0));

            let mut left = vec![0usize; counts.len()];
            for i in 1..column.len() {
                left[column[i - 1].1 as usize] += 1;
                if column[i].0 <= column[i - 1].0 {
                    continue;
                }
                let n_left = i as f64;
                let n_right = n - n_left;
                let right: Vec<usize> = counts.iter().zip(&left).map(|(&t, &l)| t - l).collect();
                let impurity = (n_left * gini(&left, n_left) + n_right * gini(&right, n_right)) / n;
                if best.map_or(true, |(b, _, _)| impurity < b) {
                    let threshold = column[i - 1].0 + (column[i].0 - column[i - 1].0) / 2.0;
                    // Midpoint can round onto the lower value for adjacent floats
                    let threshold = if threshold > column[i - 1].0 { threshold } else { column[i].0 };
                    best = Some((impurity, feature, threshold));
                }
            }
        }

        let parent = gini(counts, n);
        best.filter(|(impurity, _, _)| *impurity < parent)
            .map(|(_, feature, threshold)| (feature, threshold))
    }
}

fn gini(counts: &[usize], n: f64) -> f64 {
    if n <= 0.0 {
        return 0.0;
    }
    1.0 - counts.iter().map(|&c| (c as f64 / n).powi(2)).sum::<f64>()
}

/// Index of the largest count; ties go to the lowest class
fn argmax(counts: &[usize]) -> usize {
    counts
        .iter()
        .enumerate()
        .fold((0, 0), |(bi, bc), (i, &c)| if c > bc { (i, c) } else { (bi, bc) })
        .0
}

/// Bootstrap-aggregated CART ensemble
pub struct TreeEnsembleClassifier {
    params: ClassifierParams,
    trees: Vec<DecisionTree>,
    bands: Vec<FeatureBand>,
    /// Bands the trees split on (degenerate bands excluded)
    retained: Vec<FeatureBand>,
    n_classes: usize,
    state: ModelState,
}

impl TreeEnsembleClassifier {
    pub fn new(params: ClassifierParams) -> FusionResult<Self> {
        params.validate()?;
        Ok(Self {
            params,
            trees: Vec::new(),
            bands: Vec::new(),
            retained: Vec::new(),
            n_classes: 0,
            state: ModelState::Untrained,
        })
    }

    pub fn state(&self) -> ModelState {
        self.state
    }

    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    pub fn retained_bands(&self) -> &[FeatureBand] {
        &self.retained
    }

    /// Train on the labelled, unmasked pixels of the stack.
    ///
    /// Missing or empty labels leave the model untrained rather than failing.
    pub fn fit(&mut self, stack: &FeatureStack, labels: Option<&TrainingLabels>) -> FusionResult<ModelState> {
        self.trees.clear();
        self.bands = stack.bands().to_vec();
        self.retained.clear();
        self.n_classes = 0;
        self.state = ModelState::Untrained;

        let Some(labels) = labels else {
            log::warn!("No training labels supplied: classifier output is UNTRAINED and carries no predictions");
            return Ok(self.state);
        };
        if labels.shape() != stack.shape() {
            return Err(FusionError::GridMismatch {
                raster: "training labels".to_string(),
                detail: format!("shape {:?} differs from feature stack {:?}", labels.shape(), stack.shape()),
            });
        }

        let valid = valid_pixels(stack);
        let required = required_samples(stack.bands().len());
        if valid.len() < required {
            return Err(FusionError::InsufficientSamples {
                required,
                got: valid.len(),
            });
        }
        let retained = informative_bands(stack, &valid)?;
        let retained_idx: Vec<usize> = retained.iter().filter_map(|&b| stack.band_index(b)).collect();

        let data = stack.data();
        let dims = retained_idx.len();
        let mut x = Vec::new();
        let mut y = Vec::new();
        for &(r, c) in &valid {
            let label = labels.labels()[[r, c]];
            if label >= 0 {
                x.extend(retained_idx.iter().map(|&b| data[[b, r, c]]));
                y.push(label as u8);
            }
        }
        if y.is_empty() {
            log::warn!("Training labels cover no valid pixel: classifier output is UNTRAINED");
            return Ok(self.state);
        }

        let n_classes = y.iter().copied().max().map_or(0, |m| m as usize + 1);
        let present = {
            let mut seen = vec![false; n_classes];
            y.iter().for_each(|&l| seen[l as usize] = true);
            seen.iter().filter(|&&s| s).count()
        };
        if present < 2 {
            log::warn!("Training labels contain a single class; predictions will be constant");
        }
        log::info!(
            "Training classifier: {} trees on {} labelled pixel(s), {} class(es)",
            self.params.n_estimators,
            y.len(),
            present
        );

        let samples = Samples {
            x: &x,
            y: &y,
            dims,
            n_classes,
        };
        let features_per_split = ((dims as f64).sqrt().round() as usize).clamp(1, dims);
        let n = y.len();
        let build = |tree: usize| {
            let mut rng = StdRng::seed_from_u64(derive_tree_seed(self.params.random_seed, tree as u64));
            let mut rows: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
            let mut builder = CartBuilder {
                samples: &samples,
                params: &self.params,
                features_per_split,
                nodes: Vec::new(),
            };
            builder.grow(&mut rows, 0, &mut rng);
            DecisionTree { nodes: builder.nodes }
        };

        #[cfg(feature = "parallel")]
        let trees: Vec<DecisionTree> = (0..self.params.n_estimators).into_par_iter().map(build).collect();

        #[cfg(not(feature = "parallel"))]
        let trees: Vec<DecisionTree> = (0..self.params.n_estimators).map(build).collect();

        self.trees = trees;
        self.retained = retained;
        self.n_classes = n_classes;
        self.state = ModelState::Fitted;
        Ok(self.state)
    }
}

impl AnomalyEngine for TreeEnsembleClassifier {
    fn mode(&self) -> EngineMode {
        EngineMode::Supervised
    }

    fn is_fitted(&self) -> bool {
        self.state == ModelState::Fitted
    }

    fn predict(&self, stack: &FeatureStack) -> FusionResult<AnomalyResult> {
        let valid = stack.mask().mapv(|m| !m);

        if !self.is_fitted() {
            return Ok(AnomalyResult {
                mode: EngineMode::Supervised,
                state: ModelState::Untrained,
                scores: None,
                labels: None,
                valid,
                bands_used: stack.bands().to_vec(),
                stats: None,
            });
        }
        check_bands(&self.bands, stack)?;

        let retained_idx: Vec<usize> = self.retained.iter().filter_map(|&b| stack.band_index(b)).collect();
        let data = stack.data();
        let n_trees = self.trees.len() as f32;
        let mut labels = Array2::<u8>::zeros(stack.shape());
        let mut scores = Array2::<f32>::zeros(stack.shape());

        let vote = |(r, c): (usize, usize), label: &mut u8, score: &mut f32, &ok: &bool| {
            if !ok {
                return;
            }
            let mut votes = vec![0usize; self.n_classes];
            for tree in &self.trees {
                votes[tree.predict(|f| data[[retained_idx[f], r, c]]) as usize] += 1;
            }
            let winner = argmax(&votes);
            *label = winner as u8;
            *score = votes[winner] as f32 / n_trees;
        };

        #[cfg(feature = "parallel")]
        Zip::indexed(&mut labels).and(&mut scores).and(&valid).par_for_each(vote);

        #[cfg(not(feature = "parallel"))]
        Zip::indexed(&mut labels).and(&mut scores).and(&valid).for_each(vote);

        let flagged = labels
            .iter()
            .zip(valid.iter())
            .filter(|(&l, &ok)| ok && l != 0)
            .count();
        let stats = score_statistics(&scores, &valid, flagged);
        log::info!("Classification complete: {} pixel(s) assigned a non-background class", flagged);

        Ok(AnomalyResult {
            mode: EngineMode::Supervised,
            state: ModelState::Fitted,
            scores: Some(scores),
            labels: Some(labels),
            valid,
            bands_used: self.retained.clone(),
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn separable_stack() -> (FeatureStack, TrainingLabels) {
        let ndvi = Array2::from_shape_fn((20, 20), |(r, c)| if c < 10 { 0.1 + r as f32 * 0.001 } else { 0.8 });
        let brightness = Array2::from_shape_fn((20, 20), |(r, c)| if c < 10 { 0.9 } else { 0.2 + r as f32 * 0.002 });
        let stack =
            FeatureStack::from_bands(vec![(FeatureBand::Brightness, brightness), (FeatureBand::Ndvi, ndvi)]).unwrap();

        let labels = Array2::from_shape_fn((20, 20), |(r, c)| {
            if r % 2 == 1 {
                -1
            } else if c < 10 {
                0
            } else {
                1
            }
        });
        (stack, TrainingLabels::new(labels).unwrap())
    }

    #[test]
    fn test_untrained_without_labels() {
        let (stack, _) = separable_stack();
        let mut classifier = TreeEnsembleClassifier::new(ClassifierParams::default()).unwrap();
        assert_eq!(classifier.fit(&stack, None).unwrap(), ModelState::Untrained);

        let result = classifier.predict(&stack).unwrap();
        assert!(result.is_untrained());
        assert_eq!(result.mode, EngineMode::Supervised);
        assert!(result.scores.is_none());
        assert!(result.labels.is_none());
        assert!(result.stats.is_none());
    }

    #[test]
    fn test_untrained_when_labels_empty() {
        let (stack, _) = separable_stack();
        let labels = TrainingLabels::new(Array2::from_elem((20, 20), -1)).unwrap();
        let mut classifier = TreeEnsembleClassifier::new(ClassifierParams::default()).unwrap();
        assert_eq!(classifier.fit(&stack, Some(&labels)).unwrap(), ModelState::Untrained);
        assert!(classifier.predict(&stack).unwrap().labels.is_none());
    }

    #[test]
    fn test_separable_classes() {
        let (stack, labels) = separable_stack();
        let params = ClassifierParams {
            n_estimators: 20,
            ..ClassifierParams::default()
        };
        let mut classifier = TreeEnsembleClassifier::new(params).unwrap();
        assert_eq!(classifier.fit(&stack, Some(&labels)).unwrap(), ModelState::Fitted);

        let result = classifier.predict(&stack).unwrap();
        let predicted = result.labels.unwrap();
        // Unlabelled odd rows are predicted too
        assert_eq!(predicted[[5, 2]], 0);
        assert_eq!(predicted[[5, 15]], 1);
        assert_eq!(result.stats.unwrap().n_flagged, 200);
    }

    #[test]
    fn test_label_shape_mismatch() {
        let (stack, _) = separable_stack();
        let labels = TrainingLabels::new(Array2::zeros((5, 5))).unwrap();
        let mut classifier = TreeEnsembleClassifier::new(ClassifierParams::default()).unwrap();
        assert!(matches!(
            classifier.fit(&stack, Some(&labels)),
            Err(FusionError::GridMismatch { .. })
        ));
    }

    #[test]
    fn test_too_few_valid_pixels() {
        let stack = FeatureStack::from_bands(vec![
            (FeatureBand::Brightness, Array2::from_shape_fn((10, 10), |(r, c)| (r * 10 + c) as f32)),
            (FeatureBand::Ndvi, Array2::from_shape_fn((10, 10), |(r, _)| r as f32 * 0.1)),
        ])
        .unwrap();
        let labels = TrainingLabels::new(Array2::from_shape_fn((10, 10), |(_, c)| (c % 2) as i32)).unwrap();
        let mut classifier = TreeEnsembleClassifier::new(ClassifierParams::default()).unwrap();
        match classifier.fit(&stack, Some(&labels)) {
            Err(FusionError::InsufficientSamples { required, got }) => {
                assert_eq!(required, 256);
                assert_eq!(got, 100);
            }
            other => panic!("expected InsufficientSamples, got {:?}", other),
        }
        assert!(!classifier.is_fitted());
    }

    #[test]
    fn test_constant_band_dropped() {
        let (stack, labels) = separable_stack();
        let mut bands: Vec<(FeatureBand, Array2<f32>)> = stack
            .bands()
            .iter()
            .map(|&b| (b, stack.band(b).unwrap().to_owned()))
            .collect();
        bands.push((FeatureBand::Slope, Array2::from_elem((20, 20), 4.0)));
        let stack = FeatureStack::from_bands(bands).unwrap();

        let params = ClassifierParams {
            n_estimators: 20,
            ..ClassifierParams::default()
        };
        let mut classifier = TreeEnsembleClassifier::new(params).unwrap();
        assert_eq!(classifier.fit(&stack, Some(&labels)).unwrap(), ModelState::Fitted);
        assert_eq!(classifier.retained_bands(), &[FeatureBand::Brightness, FeatureBand::Ndvi]);

        let result = classifier.predict(&stack).unwrap();
        assert_eq!(result.bands_used, vec![FeatureBand::Brightness, FeatureBand::Ndvi]);
        assert_eq!(result.labels.unwrap()[[5, 15]], 1);
    }

    #[test]
    fn test_all_constant_bands() {
        let stack = FeatureStack::from_bands(vec![
            (FeatureBand::Slope, Array2::from_elem((20, 20), 1.0)),
            (FeatureBand::Ndvi, Array2::from_elem((20, 20), 0.3)),
        ])
        .unwrap();
        let (_, labels) = separable_stack();
        let mut classifier = TreeEnsembleClassifier::new(ClassifierParams::default()).unwrap();
        assert!(matches!(
            classifier.fit(&stack, Some(&labels)),
            Err(FusionError::DegenerateFeatureSpace { .. })
        ));
    }

    #[test]
    fn test_class_out_of_range() {
        assert!(TrainingLabels::new(Array2::from_elem((2, 2), 300)).is_err());
    }

    #[test]
    fn test_gini() {
        assert_eq!(gini(&[5, 0], 5.0), 0.0);
        assert!((gini(&[5, 5], 10.0) - 0.5).abs() < 1e-12);
        assert_eq!(argmax(&[3, 7, 7]), 1);
    }
}
