//! Pipeline configuration.
//!
//! Every stage has its own parameter block with defaults, so a JSON file
//! only needs the keys it changes.

use crate::core::anomaly::IsolationForestParams;
use crate::core::classify::ClassifierParams;
use crate::core::encode::{is_valid_target_size, is_valid_texture_size};
use crate::core::features::FeatureConfig;
use crate::core::validate::ValidationParams;
use crate::types::{FusionError, FusionResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Asset export settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportParams {
    /// Height buffer side, 2^k + 1
    pub target_size: usize,
    pub vertical_exaggeration: f64,
    /// Texture side, power of two
    pub texture_size: usize,
    /// Engine units per metre (100 for centimetre-based engines)
    pub engine_units_per_metre: f64,
    pub write_feature_stack: bool,
}

impl Default for ExportParams {
    fn default() -> Self {
        Self {
            target_size: 1025,
            vertical_exaggeration: 2.0,
            texture_size: 4096,
            engine_units_per_metre: 100.0,
            write_feature_stack: true,
        }
    }
}

/// Complete configuration for one pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Master seed; overrides the per-model seeds
    pub random_seed: u64,
    pub validation: ValidationParams,
    pub features: FeatureConfig,
    pub anomaly: IsolationForestParams,
    pub classifier: ClassifierParams,
    /// Also run the supervised classifier (untrained without labels)
    pub supervised: bool,
    pub export: ExportParams,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            random_seed: 42,
            validation: ValidationParams::default(),
            features: FeatureConfig::default(),
            anomaly: IsolationForestParams::default(),
            classifier: ClassifierParams::default(),
            supervised: false,
            export: ExportParams::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_json_str(text: &str) -> FusionResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> FusionResult<Self> {
        log::info!("Loading configuration: {}", path.as_ref().display());
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }

    /// Forest parameters with the master seed applied
    pub fn forest_params(&self) -> IsolationForestParams {
        IsolationForestParams {
            random_seed: self.random_seed,
            ..self.anomaly.clone()
        }
    }

    /// Classifier parameters with the master seed applied
    pub fn classifier_params(&self) -> ClassifierParams {
        ClassifierParams {
            random_seed: self.random_seed,
            ..self.classifier.clone()
        }
    }

    /// Reject unusable parameters; warn about legal but unusual ones
    pub fn validate(&self) -> FusionResult<()> {
        let threshold = self.validation.min_valid_fraction;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(invalid(
                "min_valid_fraction",
                format!("must be within [0, 1], got {}", threshold),
            ));
        }

        self.features.validate()?;
        self.anomaly.validate()?;
        if self.anomaly.n_estimators < 10 {
            return Err(invalid(
                "n_estimators",
                format!("must be at least 10, got {}", self.anomaly.n_estimators),
            ));
        }
        if self.anomaly.n_estimators > 1000 {
            log::warn!(
                "n_estimators = {} is very large; fitting will be slow",
                self.anomaly.n_estimators
            );
        }
        if self.anomaly.contamination > 0.1 {
            log::warn!(
                "contamination = {} is high; more than 10% of pixels will be flagged",
                self.anomaly.contamination
            );
        }
        self.classifier.validate()?;

        let export = &self.export;
        if !is_valid_target_size(export.target_size) {
            return Err(FusionError::InvalidTargetSize(export.target_size));
        }
        if !is_valid_texture_size(export.texture_size) {
            return Err(FusionError::InvalidTextureSize(export.texture_size));
        }
        if !(export.vertical_exaggeration.is_finite() && export.vertical_exaggeration > 0.0) {
            return Err(invalid(
                "vertical_exaggeration",
                format!("must be positive, got {}", export.vertical_exaggeration),
            ));
        }
        if !(0.1..=20.0).contains(&export.vertical_exaggeration) {
            log::warn!(
                "vertical_exaggeration = {} is outside the usual range [0.1, 20]",
                export.vertical_exaggeration
            );
        }
        if !(export.engine_units_per_metre.is_finite() && export.engine_units_per_metre > 0.0) {
            return Err(invalid(
                "engine_units_per_metre",
                format!("must be positive, got {}", export.engine_units_per_metre),
            ));
        }

        Ok(())
    }
}

fn invalid(name: &str, reason: String) -> FusionError {
    FusionError::InvalidParameter {
        name: name.to_string(),
        reason,
    }
}
