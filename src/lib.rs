//! geofuse: multi-sensor raster fusion, anomaly detection and terrain asset export
//!
//! Co-registered radar, optical and elevation rasters are validated, turned
//! into a per-pixel feature stack, scored by an isolation forest (optionally
//! classified by a supervised tree ensemble) and encoded as a 16-bit height
//! buffer, textures and an import manifest for a 3D engine.

pub mod types;
pub mod config;
pub mod io;
pub mod core;

#[cfg(feature = "python")]
mod python;

// Re-export main types and functions for easier access
pub use types::{
    AnomalyResult, BoundingBox, EngineMode, FeatureBand, FeatureImage, FeatureStack, FusionError,
    FusionResult, GeoTransform, GeographicBounds, ModelState, Raster, ScoreStatistics, SensorRole, Tile,
};

pub use config::{ExportParams, PipelineConfig};
pub use io::{ExportWriter, GdalTileProvider, GdalTileSource, RasterReader, TileProvider, TileSource};
pub use crate::core::{
    detect_anomalies, encode_height, encode_texture, AnomalyEngine, CancellationToken, ColorSpace,
    FeatureConfig, FeatureExtractor, FusionPipeline, IsolationForest, IsolationForestParams,
    PipelineOutputs, TrainingLabels, TreeEnsembleClassifier, Validator,
};
pub use crate::core::features::extract;
pub use crate::core::validate::validate;
