//! Unsupervised isolation-forest anomaly scoring over feature stacks.
//!
//! Trees are grown on random pixel subsamples; a pixel's score is a monotonic
//! transform of its mean isolation depth (shallower means more anomalous),
//! min-max normalised to [0, 1] over the tile.

use crate::types::{
    AnomalyResult, EngineMode, FeatureBand, FeatureImage, FeatureStack, FusionError, FusionResult,
    ModelState, ScoreStatistics,
};
use ndarray::{Array2, Zip};
use num_traits::Float;
use rand::rngs::StdRng;
use rand::seq::{index, SliceRandom};
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher13;
use std::hash::Hasher;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Minimum valid pixels for stable fitting
pub const MIN_FIT_SAMPLES: usize = 256;

/// Common surface of the per-pixel engines
pub trait AnomalyEngine: Send + Sync {
    fn mode(&self) -> EngineMode;

    fn is_fitted(&self) -> bool;

    /// Score or label every pixel of a stack with the fitted band set
    fn predict(&self, stack: &FeatureStack) -> FusionResult<AnomalyResult>;
}

/// Isolation forest hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationForestParams {
    pub n_estimators: usize,
    /// Expected outlier fraction, open interval (0, 0.5)
    pub contamination: f64,
    /// Pixels drawn (without replacement) per tree
    pub max_samples: usize,
    /// Fraction of retained bands each tree may split on
    pub max_features: f64,
    pub random_seed: u64,
}

impl Default for IsolationForestParams {
    fn default() -> Self {
        Self {
            n_estimators: 200,
            contamination: 0.02,
            max_samples: 256,
            max_features: 1.0,
            random_seed: 42,
        }
    }
}

impl IsolationForestParams {
    pub fn validate(&self) -> FusionResult<()> {
        if self.n_estimators == 0 {
            return Err(FusionError::InvalidParameter {
                name: "n_estimators".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if !(self.contamination > 0.0 && self.contamination < 0.5) {
            return Err(FusionError::InvalidParameter {
                name: "contamination".to_string(),
                reason: format!("must be in (0, 0.5), got {}", self.contamination),
            });
        }
        if self.max_samples < 2 {
            return Err(FusionError::InvalidParameter {
                name: "max_samples".to_string(),
                reason: format!("must be at least 2, got {}", self.max_samples),
            });
        }
        if !(self.max_features > 0.0 && self.max_features <= 1.0) {
            return Err(FusionError::InvalidParameter {
                name: "max_features".to_string(),
                reason: format!("must be in (0, 1], got {}", self.max_features),
            });
        }
        Ok(())
    }
}

/// Valid pixels needed to fit a model on `n_features` bands
pub fn required_samples(n_features: usize) -> usize {
    MIN_FIT_SAMPLES.max(n_features * 10)
}

/// Per-tree seed derived from the master seed; independent of scheduling
pub fn derive_tree_seed(master_seed: u64, tree: u64) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(0, 0);
    hasher.write_u64(master_seed);
    hasher.write_u64(tree);
    hasher.finish()
}

/// Expected path length of an unsuccessful BST search among n points
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    Split {
        feature: usize,
        threshold: f32,
        left: usize,
        right: usize,
    },
    Leaf {
        size: usize,
    },
}

#[derive(Debug, Clone)]
struct IsolationTree {
    nodes: Vec<Node>,
}

impl IsolationTree {
    /// Grow a tree over `samples` (row indices into the n x d `matrix`)
    fn grow(matrix: &[f32], dims: usize, sample_size: usize, features: &[usize], rng: &mut StdRng) -> Self {
        let height_limit = (sample_size as f64).log2().ceil() as usize;
        let mut samples: Vec<usize> = (0..sample_size).collect();
        let mut nodes = Vec::new();
        let mut builder = TreeBuilder {
            matrix,
            dims,
            features,
            height_limit,
            nodes: &mut nodes,
        };
        builder.grow(&mut samples, 0, rng);
        Self { nodes }
    }

    /// Isolation depth of a point, with the unresolved-leaf adjustment
    fn path_length<F: Fn(usize) -> f32>(&self, value: F) -> f64 {
        let mut node = 0;
        let mut depth = 0.0;
        loop {
            match &self.nodes[node] {
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    node = if value(*feature) < *threshold { *left } else { *right };
                    depth += 1.0;
                }
                Node::Leaf { size } => return depth + average_path_length(*size),
            }
        }
    }
}

struct TreeBuilder<'a> {
    matrix: &'a [f32],
    dims: usize,
    features: &'a [usize],
    height_limit: usize,
    nodes: &'a mut Vec<Node>,
}

impl TreeBuilder<'_> {
    fn grow(&mut self, samples: &mut [usize], depth: usize, rng: &mut StdRng) -> usize {
        let id = self.nodes.len();
        self.nodes.push(Node::Leaf { size: samples.len() });
        if depth >= self.height_limit || samples.len() <= 1 {
            return id;
        }

        let mut candidates = self.features.to_vec();
        candidates.shuffle(rng);
        for feature in candidates {
            let (lo, hi) = samples.iter().fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &s| {
                let v = self.matrix[s * self.dims + feature];
                (lo.min(v), hi.max(v))
            });
            if !(hi > lo) {
                continue;
            }

            let threshold: f32 = rng.gen_range(lo..hi);
            let mut split = 0;
            for i in 0..samples.len() {
                if self.matrix[samples[i] * self.dims + feature] < threshold {
                    samples.swap(i, split);
                    split += 1;
                }
            }

            let (left_samples, right_samples) = samples.split_at_mut(split);
            let left = self.grow(left_samples, depth + 1, rng);
            let right = self.grow(right_samples, depth + 1, rng);
            self.nodes[id] = Node::Split {
                feature,
                threshold,
                left,
                right,
            };
            return id;
        }

        // Every candidate feature is constant over this node
        id
    }
}

/// Ensemble isolation forest
pub struct IsolationForest {
    params: IsolationForestParams,
    trees: Vec<IsolationTree>,
    input_bands: Vec<FeatureBand>,
    retained: Vec<FeatureBand>,
    sample_size: usize,
}

impl IsolationForest {
    pub fn new(params: IsolationForestParams) -> FusionResult<Self> {
        params.validate()?;
        Ok(Self {
            params,
            trees: Vec::new(),
            input_bands: Vec::new(),
            retained: Vec::new(),
            sample_size: 0,
        })
    }

    pub fn params(&self) -> &IsolationForestParams {
        &self.params
    }

    /// Bands the trees split on (degenerate bands excluded)
    pub fn retained_bands(&self) -> &[FeatureBand] {
        &self.retained
    }

    /// Fit the ensemble on every unmasked pixel of the stack
    pub fn fit(&mut self, stack: &FeatureStack) -> FusionResult<()> {
        log::info!(
            "Fitting isolation forest: {} trees, contamination {}, seed {}",
            self.params.n_estimators,
            self.params.contamination,
            self.params.random_seed
        );

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
        let dims = retained_idx.len();
        let sample_size = self.params.max_samples.min(valid.len());
        let n_features = ((self.params.max_features * dims as f64).round() as usize).clamp(1, dims);
        log::debug!(
            "{} valid pixel(s), {} informative band(s), {} sample(s)/tree, {} feature(s)/tree",
            valid.len(),
            dims,
            sample_size,
            n_features
        );

        let data = stack.data();
        let build = |tree: usize| {
            let mut rng = StdRng::seed_from_u64(derive_tree_seed(self.params.random_seed, tree as u64));
            let picked = index::sample(&mut rng, valid.len(), sample_size).into_vec();
            let mut matrix = Vec::with_capacity(sample_size * dims);
            for &p in &picked {
                let (r, c) = valid[p];
                matrix.extend(retained_idx.iter().map(|&b| data[[b, r, c]]));
            }
            let features = index::sample(&mut rng, dims, n_features).into_vec();
            IsolationTree::grow(&matrix, dims, sample_size, &features, &mut rng)
        };

        #[cfg(feature = "parallel")]
        let trees: Vec<IsolationTree> = (0..self.params.n_estimators).into_par_iter().map(build).collect();

        #[cfg(not(feature = "parallel"))]
        let trees: Vec<IsolationTree> = (0..self.params.n_estimators).map(build).collect();

        self.trees = trees;
        self.input_bands = stack.bands().to_vec();
        self.retained = retained;
        self.sample_size = sample_size;
        log::info!("Isolation forest fitted");
        Ok(())
    }

    /// Raw anomaly score 2^(-E[h]/c(psi)) per valid pixel, NaN elsewhere
    pub fn raw_scores(&self, stack: &FeatureStack) -> FusionResult<Array2<f64>> {
        if !self.is_fitted() {
            return Err(FusionError::Processing(
                "Isolation forest must be fitted before scoring".to_string(),
            ));
        }
        check_bands(&self.input_bands, stack)?;

        let retained_idx: Vec<usize> = self.retained.iter().filter_map(|&b| stack.band_index(b)).collect();
        let data = stack.data();
        let norm = average_path_length(self.sample_size).max(f64::MIN_POSITIVE);
        let n_trees = self.trees.len() as f64;

        let mut raw = Array2::from_elem(stack.shape(), f64::NAN);
        let score_pixel = |(r, c): (usize, usize), out: &mut f64, &masked: &bool| {
            if masked {
                return;
            }
            let mean_depth = self
                .trees
                .iter()
                .map(|t| t.path_length(|f| data[[retained_idx[f], r, c]]))
                .sum::<f64>()
                / n_trees;
            *out = 2f64.powf(-mean_depth / norm);
        };

        #[cfg(feature = "parallel")]
        Zip::indexed(&mut raw).and(stack.mask()).par_for_each(score_pixel);

        #[cfg(not(feature = "parallel"))]
        Zip::indexed(&mut raw).and(stack.mask()).for_each(score_pixel);

        Ok(raw)
    }
}

impl AnomalyEngine for IsolationForest {
    fn mode(&self) -> EngineMode {
        EngineMode::Unsupervised
    }

    fn is_fitted(&self) -> bool {
        !self.trees.is_empty()
    }

    fn predict(&self, stack: &FeatureStack) -> FusionResult<AnomalyResult> {
        let raw = self.raw_scores(stack)?;
        let valid = stack.mask().mapv(|m| !m);

        let valid_raw: Vec<f64> = raw.iter().copied().filter(|v| !v.is_nan()).collect();
        let (lo, hi) = valid_raw
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let span = hi - lo;
        let scores: FeatureImage = raw.mapv(|v| {
            if v.is_nan() || !(span > 0.0) {
                0.0
            } else {
                ((v - lo) / span) as f32
            }
        });

        let threshold = contamination_threshold(&valid_raw, self.params.contamination);
        let labels = raw.mapv(|v| u8::from(!v.is_nan() && v >= threshold));
        let flagged = labels.iter().filter(|&&l| l == 1).count();
        let stats = score_statistics(&scores, &valid, flagged);

        log::info!(
            "Anomaly scoring complete: {} of {} pixel(s) flagged (threshold {:.5})",
            flagged,
            valid_raw.len(),
            threshold
        );
        log::debug!("Score statistics: {:?}", stats);

        Ok(AnomalyResult {
            mode: EngineMode::Unsupervised,
            state: ModelState::Fitted,
            scores: Some(scores),
            labels: Some(labels),
            valid,
            bands_used: self.retained.clone(),
            stats,
        })
    }
}

/// Fit a forest on the stack and score it in one step
pub fn detect_anomalies(stack: &FeatureStack, params: &IsolationForestParams) -> FusionResult<AnomalyResult> {
    let mut forest = IsolationForest::new(params.clone())?;
    forest.fit(stack)?;
    forest.predict(stack)
}

pub(crate) fn valid_pixels(stack: &FeatureStack) -> Vec<(usize, usize)> {
    stack
        .mask()
        .indexed_iter()
        .filter(|(_, &masked)| !masked)
        .map(|(idx, _)| idx)
        .collect()
}

pub(crate) fn check_bands(expected: &[FeatureBand], stack: &FeatureStack) -> FusionResult<()> {
    if expected != stack.bands() {
        return Err(FusionError::BandMismatch {
            expected: expected.iter().map(|b| b.name().to_string()).collect(),
            found: stack.band_names(),
        });
    }
    Ok(())
}

/// Drop zero-variance bands; fails only when nothing informative remains
pub(crate) fn informative_bands(stack: &FeatureStack, valid: &[(usize, usize)]) -> FusionResult<Vec<FeatureBand>> {
    let data = stack.data();
    let mut retained = Vec::new();
    let mut degenerate = Vec::new();

    for (i, &band) in stack.bands().iter().enumerate() {
        let (lo, hi) = valid.iter().fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &(r, c)| {
            let v = data[[i, r, c]];
            (lo.min(v), hi.max(v))
        });
        if hi > lo {
            retained.push(band);
        } else {
            log::warn!("Dropping zero-variance feature band {} (constant value {})", band, lo);
            degenerate.push(band.name().to_string());
        }
    }

    if retained.is_empty() {
        return Err(FusionError::DegenerateFeatureSpace { bands: degenerate });
    }
    Ok(retained)
}

/// Raw score at or above which a pixel is labelled anomalous
fn contamination_threshold(raw: &[f64], contamination: f64) -> f64 {
    if raw.is_empty() {
        return f64::INFINITY;
    }
    let mut sorted = raw.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));
    let k = ((contamination * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
    sorted[k - 1]
}

/// Linear-interpolated percentile of an ascending slice, q in [0, 100]
pub(crate) fn percentile<T: Float>(sorted: &[T], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let rank = q / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let a = sorted[lower].to_f64().unwrap_or(f64::NAN);
    let b = sorted[upper].to_f64().unwrap_or(f64::NAN);
    a + (b - a) * (rank - lower as f64)
}

pub(crate) fn score_statistics(scores: &FeatureImage, valid: &Array2<bool>, flagged: usize) -> Option<ScoreStatistics> {
    let mut values: Vec<f32> = scores
        .iter()
        .zip(valid.iter())
        .filter(|(_, &ok)| ok)
        .map(|(&s, _)| s)
        .collect();
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));

    let n = values.len() as f64;
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
    let std = (values.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n).sqrt();
    let p95 = percentile(&values, 95.0);

    Some(ScoreStatistics {
        mean,
        std,
        min: values[0] as f64,
        max: values[values.len() - 1] as f64,
        p50: percentile(&values, 50.0),
        p95,
        p99: percentile(&values, 99.0),
        n_above_p95: values.iter().filter(|&&v| v as f64 > p95).count(),
        n_flagged: flagged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn gaussian_like(rows: usize, cols: usize, seed: u64) -> Array2<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_simple_fn((rows, cols), || {
            (0..6).map(|_| rng.gen::<f32>()).sum::<f32>() - 3.0
        })
    }

    fn stack_with_outliers() -> FeatureStack {
        let mut a = gaussian_like(50, 50, 1);
        let mut b = gaussian_like(50, 50, 2);
        for k in 0..5 {
            a[[10 + k, 10]] = 12.0;
            b[[10 + k, 10]] = -12.0;
        }
        FeatureStack::from_bands(vec![(FeatureBand::Slope, a), (FeatureBand::Ndvi, b)]).unwrap()
    }

    fn small_params() -> IsolationForestParams {
        IsolationForestParams {
            n_estimators: 50,
            ..IsolationForestParams::default()
        }
    }

    #[test]
    fn test_average_path_length() {
        assert_eq!(average_path_length(1), 0.0);
        assert_eq!(average_path_length(2), 1.0);
        assert_abs_diff_eq!(average_path_length(256), 10.2448, epsilon = 1e-3);
    }

    #[test]
    fn test_tree_seed_depends_on_index() {
        assert_ne!(derive_tree_seed(42, 0), derive_tree_seed(42, 1));
        assert_eq!(derive_tree_seed(42, 7), derive_tree_seed(42, 7));
    }

    #[test]
    fn test_contamination_bounds() {
        for contamination in [0.0, 0.5, -0.1, 0.7] {
            let params = IsolationForestParams {
                contamination,
                ..IsolationForestParams::default()
            };
            assert!(IsolationForest::new(params).is_err());
        }
    }

    #[test]
    fn test_outliers_score_highest() {
        let result = detect_anomalies(&stack_with_outliers(), &small_params()).unwrap();
        let scores = result.scores.unwrap();
        assert!(scores.iter().all(|&s| (0.0..=1.0).contains(&s)));
        assert_abs_diff_eq!(scores.iter().cloned().fold(0.0f32, f32::max), 1.0);

        let stats = result.stats.unwrap();
        for k in 0..5 {
            assert!(scores[[10 + k, 10]] as f64 > stats.p99);
            assert_eq!(result.labels.as_ref().unwrap()[[10 + k, 10]], 1);
        }
    }

    #[test]
    fn test_deterministic_given_seed() {
        let stack = stack_with_outliers();
        let a = detect_anomalies(&stack, &small_params()).unwrap();
        let b = detect_anomalies(&stack, &small_params()).unwrap();
        assert_eq!(a.scores, b.scores);
        assert_eq!(a.labels, b.labels);
    }

    #[test]
    fn test_insufficient_samples() {
        let stack = FeatureStack::from_bands(vec![(FeatureBand::Slope, gaussian_like(10, 10, 3))]).unwrap();
        match detect_anomalies(&stack, &small_params()) {
            Err(FusionError::InsufficientSamples { required, got }) => {
                assert_eq!(required, 256);
                assert_eq!(got, 100);
            }
            other => panic!("expected InsufficientSamples, got {:?}", other.map(|r| r.state)),
        }
    }

    #[test]
    fn test_all_degenerate_bands() {
        let stack = FeatureStack::from_bands(vec![
            (FeatureBand::Slope, Array2::from_elem((20, 20), 1.0)),
            (FeatureBand::Aspect, Array2::from_elem((20, 20), 2.0)),
        ])
        .unwrap();
        assert!(matches!(
            detect_anomalies(&stack, &small_params()),
            Err(FusionError::DegenerateFeatureSpace { .. })
        ));
    }

    #[test]
    fn test_band_mismatch_rejected() {
        let mut forest = IsolationForest::new(small_params()).unwrap();
        forest.fit(&stack_with_outliers()).unwrap();
        let other = FeatureStack::from_bands(vec![
            (FeatureBand::Ndvi, gaussian_like(50, 50, 1)),
            (FeatureBand::Slope, gaussian_like(50, 50, 2)),
        ])
        .unwrap();
        assert!(matches!(forest.predict(&other), Err(FusionError::BandMismatch { .. })));
    }

    #[test]
    fn test_masked_pixels_score_zero() {
        let mut a = gaussian_like(30, 30, 5);
        a[[0, 0]] = f32::NAN;
        let stack = FeatureStack::from_bands(vec![
            (FeatureBand::Slope, a),
            (FeatureBand::Ndvi, gaussian_like(30, 30, 6)),
        ])
        .unwrap();
        let result = detect_anomalies(&stack, &small_params()).unwrap();
        assert!(!result.valid[[0, 0]]);
        assert_eq!(result.scores.unwrap()[[0, 0]], 0.0);
        assert_eq!(result.labels.unwrap()[[0, 0]], 0);
    }

    #[test]
    fn test_threshold_labels_top_fraction() {
        let raw: Vec<f64> = (0..100).map(|i| i as f64).collect();
        assert_eq!(contamination_threshold(&raw, 0.02), 98.0);
        assert_eq!(contamination_threshold(&raw, 0.001), 99.0);
    }

    #[test]
    fn test_percentile_interpolates() {
        let values = [1.0f32, 2.0, 3.0, 4.0];
        assert_abs_diff_eq!(percentile(&values, 50.0), 2.5);
        assert_abs_diff_eq!(percentile(&values, 100.0), 4.0);
    }
}
