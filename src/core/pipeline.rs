//! Tile pipeline: validate -> extract -> detect (-> classify) -> encode.

use crate::config::PipelineConfig;
use crate::core::anomaly::{AnomalyEngine, IsolationForest};
use crate::core::classify::{TrainingLabels, TreeEnsembleClassifier};
use crate::core::encode::{
    encode_height, encode_texture, encode_texture_bands, AssetMetadata, ColorSpace, HeightBuffer,
    TextureBuffer,
};
use crate::core::features::FeatureExtractor;
use crate::core::validate::{ValidationReport, Validator};
use crate::io::raster_reader::TileProvider;
use crate::io::tile_source::{GdalTileSource, TileSource};
use crate::io::writer::ExportWriter;
use crate::types::{
    AnomalyResult, BoundingBox, FeatureStack, FusionError, FusionResult, GeographicBounds, ModelState,
    Raster, ScoreStatistics, SensorRole, Tile,
};
use gdal::spatial_ref::{CoordTransform, SpatialRef};
use ndarray::{Array2, Axis, Zip};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub const HEIGHTMAP_FILE: &str = "heightmap_16bit.png";
pub const ANOMALY_FILE: &str = "anomaly_probability.tif";
pub const FEATURE_STACK_FILE: &str = "feature_stack.tif";
pub const CLASSIFICATION_FILE: &str = "classification.tif";
pub const MANIFEST_FILE: &str = "meta.json";

/// Recommended landscape section layout for the engine import
const SECTION_SIZE: &str = "127x127";

/// Shared flag checked between stages
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Everything a tile run produces, in memory
#[derive(Debug, Clone)]
pub struct PipelineOutputs {
    pub tile_id: String,
    pub validation: ValidationReport,
    pub features: FeatureStack,
    pub anomaly: AnomalyResult,
    pub classification: Option<AnomalyResult>,
    pub height: HeightBuffer,
    pub height_metadata: AssetMetadata,
    pub texture: TextureBuffer,
    pub overlay: TextureBuffer,
    /// Geometry of the tile grid, kept for georeferenced output
    pub grid: Raster,
}

/// Encode stage products shared by the in-memory and windowed paths
struct EncodedAssets {
    height: HeightBuffer,
    height_metadata: AssetMetadata,
    texture: TextureBuffer,
    overlay: TextureBuffer,
    grid: Raster,
}

impl EncodedAssets {
    fn into_outputs(
        self,
        tile_id: &str,
        validation: ValidationReport,
        features: FeatureStack,
        anomaly: AnomalyResult,
        classification: Option<AnomalyResult>,
    ) -> PipelineOutputs {
        PipelineOutputs {
            tile_id: tile_id.to_string(),
            validation,
            features,
            anomaly,
            classification,
            height: self.height,
            height_metadata: self.height_metadata,
            texture: self.texture,
            overlay: self.overlay,
            grid: self.grid,
        }
    }
}

/// Engine import settings derived from the height metadata
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportParameters {
    pub landscape_size: String,
    pub section_size: String,
    pub sections_per_component: u32,
    pub x_scale: f64,
    pub y_scale: f64,
    pub z_scale: f64,
    pub engine_units_per_metre: f64,
    pub min_elevation_m: f64,
    pub max_elevation_m: f64,
}

impl ImportParameters {
    pub fn from_metadata(meta: &AssetMetadata, engine_units_per_metre: f64) -> Self {
        let spans = (meta.target_width.max(2) - 1) as f64;
        Self {
            landscape_size: format!("{}x{}", meta.target_width, meta.target_height),
            section_size: SECTION_SIZE.to_string(),
            sections_per_component: 1,
            x_scale: meta.bbox.width() / spans * engine_units_per_metre,
            y_scale: meta.bbox.height() / spans * engine_units_per_metre,
            z_scale: meta.z_scale * engine_units_per_metre,
            engine_units_per_metre,
            min_elevation_m: meta.min_elevation,
            max_elevation_m: meta.max_elevation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextureRecord {
    pub role: String,
    pub file: String,
    pub size: usize,
    pub channels: usize,
    pub color_space: ColorSpace,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassificationSummary {
    pub state: ModelState,
    pub note: Option<String>,
    pub statistics: Option<ScoreStatistics>,
}

/// Contents of `meta.json`
#[derive(Debug, Clone, Serialize)]
pub struct ExportManifest {
    #[serde(flatten)]
    pub asset: AssetMetadata,
    pub bbox_geographic: Option<GeographicBounds>,
    pub import_parameters: ImportParameters,
    pub heightmap: String,
    pub textures: Vec<TextureRecord>,
    pub features: Vec<String>,
    pub bands_used: Vec<String>,
    pub anomaly_statistics: Option<ScoreStatistics>,
    pub classification: Option<ClassificationSummary>,
    pub validation: ValidationReport,
    pub parameters: PipelineConfig,
    pub processing_date: String,
    pub processor_version: String,
}

/// Output of a run that also wrote its files
#[derive(Debug)]
pub struct PipelineRun {
    pub outputs: PipelineOutputs,
    pub manifest: ExportManifest,
    pub files: Vec<PathBuf>,
}

/// Per-tile fusion pipeline
pub struct FusionPipeline {
    config: PipelineConfig,
    cancel: CancellationToken,
}

impl FusionPipeline {
    pub fn new(config: PipelineConfig) -> FusionResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn checkpoint(&self, stage: &str) -> FusionResult<()> {
        if self.cancel.is_cancelled() {
            log::warn!("Cancellation requested; stopping before '{}'", stage);
            return Err(FusionError::Cancelled {
                stage: stage.to_string(),
            });
        }
        log::info!("Stage: {}", stage);
        Ok(())
    }

    /// Run every stage on an in-memory tile
    pub fn run_tile(&self, tile: &Tile, labels: Option<&TrainingLabels>) -> FusionResult<PipelineOutputs> {
        let start = Instant::now();
        log::info!("Processing tile '{}' ({}x{} px)", tile.id(), tile.shape().1, tile.shape().0);

        self.checkpoint("validate")?;
        let validation = Validator::with_params(self.config.validation.clone()).validate_tile(tile)?;

        self.checkpoint("extract")?;
        let features = FeatureExtractor::new(self.config.features.clone())?.extract(tile)?;

        let (anomaly, classification) = self.model_stages(&features, labels)?;

        self.checkpoint("encode")?;
        let map = &self.config.features.optical_bands;
        let encoded = self.encode_stage(
            tile.id(),
            tile.elevation(),
            tile.optical(),
            &[map.red, map.green, map.blue],
            &anomaly,
        )?;

        log::info!("Tile '{}' processed in {:.2?}", tile.id(), start.elapsed());
        Ok(encoded.into_outputs(tile.id(), validation, features, anomaly, classification))
    }

    /// Run every stage on a file-backed tile.
    ///
    /// Validation and feature extraction read inputs in row windows and
    /// never hold a whole input raster. Encoding reads the elevation band
    /// and the three texture bands whole.
    pub fn run_source_tile(
        &self,
        tile_id: &str,
        source: &GdalTileSource,
        labels: Option<&TrainingLabels>,
    ) -> FusionResult<PipelineOutputs> {
        let start = Instant::now();
        let grid = source.grid();
        log::info!("Processing tile '{}' from files ({}x{} px)", tile_id, grid.cols, grid.rows);

        self.checkpoint("validate")?;
        let validation = Validator::with_params(self.config.validation.clone()).validate_source(source)?;

        self.checkpoint("extract")?;
        let features = FeatureExtractor::new(self.config.features.clone())?.extract_from_source(source)?;

        let (anomaly, classification) = self.model_stages(&features, labels)?;

        self.checkpoint("encode")?;
        let map = &self.config.features.optical_bands;
        let elevation = source.elevation().read_raster_bands(&SensorRole::Elevation.to_string(), &[0])?;
        let optical = source
            .optical()
            .read_raster_bands(&SensorRole::Optical.to_string(), &[map.red, map.green, map.blue])?;
        let encoded = self.encode_stage(tile_id, &elevation, &optical, &[0, 1, 2], &anomaly)?;

        log::info!("Tile '{}' processed in {:.2?}", tile_id, start.elapsed());
        Ok(encoded.into_outputs(tile_id, validation, features, anomaly, classification))
    }

    fn model_stages(
        &self,
        features: &FeatureStack,
        labels: Option<&TrainingLabels>,
    ) -> FusionResult<(AnomalyResult, Option<AnomalyResult>)> {
        self.checkpoint("detect")?;
        let mut forest = IsolationForest::new(self.config.forest_params())?;
        forest.fit(features)?;
        let anomaly = forest.predict(features)?;

        let classification = if self.config.supervised || labels.is_some() {
            self.checkpoint("classify")?;
            let mut classifier = TreeEnsembleClassifier::new(self.config.classifier_params())?;
            classifier.fit(features, labels)?;
            Some(classifier.predict(features)?)
        } else {
            None
        };
        Ok((anomaly, classification))
    }

    fn encode_stage(
        &self,
        tile_id: &str,
        elevation: &Raster,
        optical: &Raster,
        rgb: &[usize],
        anomaly: &AnomalyResult,
    ) -> FusionResult<EncodedAssets> {
        let export = &self.config.export;
        let (height, mut height_metadata) =
            encode_height(elevation, export.target_size, export.vertical_exaggeration)?;
        height_metadata.source_id = tile_id.to_string();

        let texture = encode_texture_bands(optical, rgb, export.texture_size, ColorSpace::Srgb)?;

        let grid = Raster::from_band(
            "anomaly",
            anomaly.scores.clone().unwrap_or_else(|| Array2::zeros(elevation.shape())),
            *elevation.geo_transform(),
            elevation.crs(),
            None,
        )?;
        let overlay = encode_texture(&grid, export.texture_size, ColorSpace::Linear)?;

        Ok(EncodedAssets {
            height,
            height_metadata,
            texture,
            overlay,
            grid,
        })
    }

    /// Load a tile from the provider, process it and write all products
    pub fn run<P: AsRef<Path>>(&self, provider: &dyn TileProvider, output_dir: P) -> FusionResult<PipelineRun> {
        let tile = provider.provide()?;
        let outputs = self.run_tile(&tile, None)?;
        let (manifest, files) = self.export(&outputs, output_dir)?;
        Ok(PipelineRun {
            outputs,
            manifest,
            files,
        })
    }

    /// Process a file-backed tile in row windows and write all products
    pub fn run_source<P: AsRef<Path>>(
        &self,
        tile_id: &str,
        source: &GdalTileSource,
        labels: Option<&TrainingLabels>,
        output_dir: P,
    ) -> FusionResult<PipelineRun> {
        let outputs = self.run_source_tile(tile_id, source, labels)?;
        let (manifest, files) = self.export(&outputs, output_dir)?;
        Ok(PipelineRun {
            outputs,
            manifest,
            files,
        })
    }

    /// Write the products of a tile run and its manifest
    pub fn export<P: AsRef<Path>>(
        &self,
        outputs: &PipelineOutputs,
        output_dir: P,
    ) -> FusionResult<(ExportManifest, Vec<PathBuf>)> {
        self.checkpoint("export")?;
        let writer = ExportWriter::new(output_dir)?;
        let gt = outputs.grid.geo_transform();
        let crs = outputs.grid.crs();
        let mut files = Vec::new();

        files.push(writer.write_height_png(HEIGHTMAP_FILE, &outputs.height)?);

        let size = outputs.texture.size();
        let texture_file = format!("texture_rgb_{}.png", size);
        let overlay_file = format!("anomaly_overlay_{}.png", outputs.overlay.size());
        files.push(writer.write_texture_png(&texture_file, &outputs.texture)?);
        files.push(writer.write_texture_png(&overlay_file, &outputs.overlay)?);

        if let (Some(scores), Some(labels)) = (&outputs.anomaly.scores, &outputs.anomaly.labels) {
            let probability = masked_image(scores, &outputs.anomaly.valid);
            let flags = masked_image(&labels.mapv(f32::from), &outputs.anomaly.valid);
            files.push(writer.write_geotiff(
                ANOMALY_FILE,
                &[("anomaly_probability", probability.view()), ("anomaly_label", flags.view())],
                gt,
                crs,
                Some(f64::NAN),
            )?);
        }

        if let Some(classification) = &outputs.classification {
            if let (Some(scores), Some(labels)) = (&classification.scores, &classification.labels) {
                let class = masked_image(&labels.mapv(f32::from), &classification.valid);
                let confidence = masked_image(scores, &classification.valid);
                files.push(writer.write_geotiff(
                    CLASSIFICATION_FILE,
                    &[("class", class.view()), ("confidence", confidence.view())],
                    gt,
                    crs,
                    Some(f64::NAN),
                )?);
            }
        }

        if self.config.export.write_feature_stack {
            let stack = &outputs.features;
            let images: Vec<Array2<f32>> = stack
                .data()
                .axis_iter(Axis(0))
                .map(|band| {
                    let mut image = band.to_owned();
                    Zip::from(&mut image).and(stack.mask()).for_each(|v, &masked| {
                        if masked {
                            *v = f32::NAN;
                        }
                    });
                    image
                })
                .collect();
            let bands: Vec<(&str, _)> = stack
                .bands()
                .iter()
                .zip(&images)
                .map(|(band, image)| (band.name(), image.view()))
                .collect();
            files.push(writer.write_geotiff(FEATURE_STACK_FILE, &bands, gt, crs, Some(f64::NAN))?);
        }

        let manifest = self.manifest(outputs, texture_file, overlay_file);
        files.push(writer.write_manifest(MANIFEST_FILE, &manifest)?);

        log::info!("Exported {} file(s) to {}", files.len(), writer.output_dir().display());
        log::info!(
            "Import with landscape size {} and Z scale {:.4}",
            manifest.import_parameters.landscape_size,
            manifest.import_parameters.z_scale
        );
        Ok((manifest, files))
    }

    fn manifest(&self, outputs: &PipelineOutputs, texture_file: String, overlay_file: String) -> ExportManifest {
        let asset = outputs.height_metadata.clone();
        let export = &self.config.export;

        let textures = vec![
            TextureRecord {
                role: "base_rgb".to_string(),
                file: texture_file,
                size: outputs.texture.size(),
                channels: outputs.texture.channels(),
                color_space: outputs.texture.color_space,
            },
            TextureRecord {
                role: "anomaly_overlay".to_string(),
                file: overlay_file,
                size: outputs.overlay.size(),
                channels: outputs.overlay.channels(),
                color_space: outputs.overlay.color_space,
            },
        ];

        let classification = outputs.classification.as_ref().map(|c| ClassificationSummary {
            state: c.state,
            note: c
                .is_untrained()
                .then(|| "no labelled training data; classifier output withheld".to_string()),
            statistics: c.stats,
        });

        ExportManifest {
            bbox_geographic: geographic_bounds(&asset.bbox, &asset.crs),
            import_parameters: ImportParameters::from_metadata(&asset, export.engine_units_per_metre),
            heightmap: HEIGHTMAP_FILE.to_string(),
            textures,
            features: outputs.features.band_names(),
            bands_used: outputs.anomaly.bands_used.iter().map(|b| b.name().to_string()).collect(),
            anomaly_statistics: outputs.anomaly.stats,
            classification,
            validation: outputs.validation.clone(),
            parameters: self.config.clone(),
            processing_date: chrono::Utc::now().to_rfc3339(),
            processor_version: env!("CARGO_PKG_VERSION").to_string(),
            asset,
        }
    }
}

fn masked_image(image: &Array2<f32>, valid: &Array2<bool>) -> Array2<f32> {
    let mut out = image.clone();
    Zip::from(&mut out).and(valid).for_each(|v, &ok| {
        if !ok {
            *v = f32::NAN;
        }
    });
    out
}

/// Native bounds expressed as WGS84 lon/lat; None when the CRS cannot be transformed
pub fn geographic_bounds(bbox: &BoundingBox, crs: &str) -> Option<GeographicBounds> {
    if crs.is_empty() {
        return None;
    }
    match transform_bounds(bbox, crs) {
        Ok(bounds) => Some(bounds),
        Err(e) => {
            log::warn!("Could not derive geographic bounds from {}: {}", crs, e);
            None
        }
    }
}

fn transform_bounds(bbox: &BoundingBox, crs: &str) -> FusionResult<GeographicBounds> {
    let source = SpatialRef::from_definition(crs)?;
    let mut xs = [bbox.min_x, bbox.max_x, bbox.min_x, bbox.max_x];
    let mut ys = [bbox.min_y, bbox.min_y, bbox.max_y, bbox.max_y];

    if !source.is_geographic() {
        let target = SpatialRef::from_proj4("+proj=longlat +datum=WGS84 +no_defs")?;
        let transform = CoordTransform::new(&source, &target)?;
        let mut zs = [0.0; 4];
        transform.transform_coords(&mut xs, &mut ys, &mut zs)?;
    }

    let fold = |values: &[f64]| {
        values
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)))
    };
    let (min_lon, max_lon) = fold(&xs);
    let (min_lat, max_lat) = fold(&ys);
    Ok(GeographicBounds {
        min_lon,
        max_lon,
        min_lat,
        max_lat,
    })
}
