//! Core fusion stages

pub mod validate;
pub mod features;
pub mod anomaly;
pub mod classify;
pub mod encode;
pub mod pipeline;

// Re-export main types
pub use validate::{Validator, ValidationParams, ValidationReport, RasterStatistics};
pub use features::{FeatureExtractor, FeatureConfig, OpticalBandMap, RadarScale};
pub use anomaly::{AnomalyEngine, IsolationForest, IsolationForestParams, detect_anomalies};
pub use classify::{ClassifierParams, TrainingLabels, TreeEnsembleClassifier};
pub use encode::{
    encode_height, encode_texture, AssetMetadata, ColorSpace, HeightBuffer, TextureBuffer,
};
pub use pipeline::{CancellationToken, ExportManifest, FusionPipeline, PipelineOutputs, PipelineRun};
