use ndarray::{s, Array2, Array3, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Single feature or score image (rows x cols)
pub type FeatureImage = Array2<f32>;

/// Affine georeferencing transform in GDAL coefficient order
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform with square-ish pixels
    pub fn north_up(top_left_x: f64, top_left_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            top_left_x,
            pixel_width,
            rotation_x: 0.0,
            top_left_y,
            rotation_y: 0.0,
            pixel_height: -pixel_height.abs(),
        }
    }

    pub fn from_gdal(coefficients: [f64; 6]) -> Self {
        Self {
            top_left_x: coefficients[0],
            pixel_width: coefficients[1],
            rotation_x: coefficients[2],
            top_left_y: coefficients[3],
            rotation_y: coefficients[4],
            pixel_height: coefficients[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    /// Determinant of the linear part; zero means pixels do not map uniquely
    pub fn determinant(&self) -> f64 {
        self.pixel_width * self.pixel_height - self.rotation_x * self.rotation_y
    }

    /// World coordinate of a (fractional) pixel position
    pub fn pixel_to_world(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.top_left_x + col * self.pixel_width + row * self.rotation_x,
            self.top_left_y + col * self.rotation_y + row * self.pixel_height,
        )
    }

    /// Ground extent of a single pixel along x and y
    pub fn pixel_size(&self) -> (f64, f64) {
        (
            self.pixel_width.hypot(self.rotation_y),
            self.pixel_height.hypot(self.rotation_x),
        )
    }

    /// Axis-aligned bounds of a width x height grid
    pub fn bounds(&self, width: usize, height: usize) -> BoundingBox {
        let corners = [
            self.pixel_to_world(0.0, 0.0),
            self.pixel_to_world(width as f64, 0.0),
            self.pixel_to_world(0.0, height as f64),
            self.pixel_to_world(width as f64, height as f64),
        ];
        let mut bbox = BoundingBox {
            min_x: f64::INFINITY,
            min_y: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            max_y: f64::NEG_INFINITY,
        };
        for (x, y) in corners {
            bbox.min_x = bbox.min_x.min(x);
            bbox.min_y = bbox.min_y.min(y);
            bbox.max_x = bbox.max_x.max(x);
            bbox.max_y = bbox.max_y.max(y);
        }
        bbox
    }
}

/// Bounding box in the raster's native CRS units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// Area, zero for inverted or empty boxes
    pub fn area(&self) -> f64 {
        if self.width() <= 0.0 || self.height() <= 0.0 {
            0.0
        } else {
            self.width() * self.height()
        }
    }

    pub fn intersection(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            min_x: self.min_x.max(other.min_x),
            min_y: self.min_y.max(other.min_y),
            max_x: self.max_x.min(other.max_x),
            max_y: self.max_y.min(other.max_y),
        }
    }
}

/// Geographic (WGS84 lon/lat) bounding box
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeographicBounds {
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
}

/// Sensor role of a raster within a tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorRole {
    Radar,
    Optical,
    Elevation,
    Hyperspectral,
}

impl std::fmt::Display for SensorRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SensorRole::Radar => write!(f, "radar"),
            SensorRole::Optical => write!(f, "optical"),
            SensorRole::Elevation => write!(f, "elevation"),
            SensorRole::Hyperspectral => write!(f, "hyperspectral"),
        }
    }
}

/// Georeferenced banded raster (bands x rows x cols)
#[derive(Debug, Clone)]
pub struct Raster {
    name: String,
    data: Array3<f32>,
    geo_transform: GeoTransform,
    crs: String,
    nodata: Option<f32>,
}

impl Raster {
    pub fn new(
        name: impl Into<String>,
        data: Array3<f32>,
        geo_transform: GeoTransform,
        crs: impl Into<String>,
        nodata: Option<f32>,
    ) -> FusionResult<Self> {
        let name = name.into();
        let (bands, rows, cols) = data.dim();
        if bands == 0 || rows == 0 || cols == 0 {
            return Err(FusionError::InvalidFormat(format!(
                "Raster '{}' has empty shape {}x{}x{}",
                name, bands, rows, cols
            )));
        }
        if geo_transform.determinant() == 0.0 {
            return Err(FusionError::InvalidFormat(format!(
                "Raster '{}' has a singular geotransform {:?}",
                name, geo_transform
            )));
        }

        Ok(Self {
            name,
            data,
            geo_transform,
            crs: crs.into(),
            nodata,
        })
    }

    /// Single-band raster from a 2D array
    pub fn from_band(
        name: impl Into<String>,
        band: Array2<f32>,
        geo_transform: GeoTransform,
        crs: impl Into<String>,
        nodata: Option<f32>,
    ) -> FusionResult<Self> {
        Self::new(name, band.insert_axis(Axis(0)), geo_transform, crs, nodata)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn band(&self, index: usize) -> ArrayView2<'_, f32> {
        self.data.index_axis(Axis(0), index)
    }

    pub fn band_count(&self) -> usize {
        self.data.dim().0
    }

    /// (rows, cols)
    pub fn shape(&self) -> (usize, usize) {
        let (_, rows, cols) = self.data.dim();
        (rows, cols)
    }

    pub fn geo_transform(&self) -> &GeoTransform {
        &self.geo_transform
    }

    pub fn crs(&self) -> &str {
        &self.crs
    }

    pub fn nodata(&self) -> Option<f32> {
        self.nodata
    }

    pub fn bounds(&self) -> BoundingBox {
        let (rows, cols) = self.shape();
        self.geo_transform.bounds(cols, rows)
    }

    pub fn pixel_size(&self) -> (f64, f64) {
        self.geo_transform.pixel_size()
    }

    /// A sample is valid when finite and not equal to the nodata sentinel
    pub fn is_valid_sample(&self, value: f32) -> bool {
        value.is_finite() && self.nodata.map_or(true, |nd| value != nd)
    }

    /// Per-pixel validity; a pixel is valid only if every band is valid
    pub fn valid_mask(&self) -> Array2<bool> {
        let (rows, cols) = self.shape();
        let mut mask = Array2::from_elem((rows, cols), true);
        for band in self.data.outer_iter() {
            ndarray::Zip::from(&mut mask).and(&band).for_each(|m, &v| {
                *m = *m && self.is_valid_sample(v);
            });
        }
        mask
    }

    pub fn valid_pixel_count(&self) -> usize {
        self.valid_mask().iter().filter(|&&v| v).count()
    }

    /// Rows of one band with nodata replaced by NaN
    pub fn band_rows_masked(&self, band: usize, rows: Range<usize>) -> Array2<f32> {
        self.data
            .slice(s![band, rows, ..])
            .mapv(|v| if self.is_valid_sample(v) { v } else { f32::NAN })
    }
}

/// Co-registered rasters over one footprint; immutable after construction
#[derive(Debug, Clone)]
pub struct Tile {
    id: String,
    radar: Raster,
    optical: Raster,
    elevation: Raster,
    hyperspectral: Option<Raster>,
}

impl Tile {
    pub fn new(
        id: impl Into<String>,
        radar: Raster,
        optical: Raster,
        elevation: Raster,
        hyperspectral: Option<Raster>,
    ) -> FusionResult<Self> {
        if radar.band_count() < 2 {
            return Err(FusionError::InvalidFormat(format!(
                "Radar raster '{}' needs VV and VH bands, found {}",
                radar.name(),
                radar.band_count()
            )));
        }
        if optical.band_count() < 3 {
            return Err(FusionError::InvalidFormat(format!(
                "Optical raster '{}' needs at least 3 bands, found {}",
                optical.name(),
                optical.band_count()
            )));
        }
        // Transforms are checked by the validator; shapes must agree for row slicing
        let shape = elevation.shape();
        for member in [Some(&radar), Some(&optical), hyperspectral.as_ref()].into_iter().flatten() {
            if member.shape() != shape {
                return Err(FusionError::GridMismatch {
                    raster: member.name().to_string(),
                    detail: format!(
                        "shape {:?} differs from elevation '{}' shape {:?}",
                        member.shape(),
                        elevation.name(),
                        shape
                    ),
                });
            }
        }

        Ok(Self {
            id: id.into(),
            radar,
            optical,
            elevation,
            hyperspectral,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn radar(&self) -> &Raster {
        &self.radar
    }

    pub fn optical(&self) -> &Raster {
        &self.optical
    }

    pub fn elevation(&self) -> &Raster {
        &self.elevation
    }

    pub fn hyperspectral(&self) -> Option<&Raster> {
        self.hyperspectral.as_ref()
    }

    /// Member rasters paired with their roles, fixed order
    pub fn members(&self) -> Vec<(SensorRole, &Raster)> {
        let mut members = vec![
            (SensorRole::Radar, &self.radar),
            (SensorRole::Optical, &self.optical),
            (SensorRole::Elevation, &self.elevation),
        ];
        if let Some(hs) = &self.hyperspectral {
            members.push((SensorRole::Hyperspectral, hs));
        }
        members
    }

    pub fn rasters(&self) -> Vec<&Raster> {
        self.members().into_iter().map(|(_, r)| r).collect()
    }

    /// Grid of the tile, taken from the elevation raster
    pub fn shape(&self) -> (usize, usize) {
        self.elevation.shape()
    }

    pub fn geo_transform(&self) -> &GeoTransform {
        self.elevation.geo_transform()
    }

    pub fn crs(&self) -> &str {
        self.elevation.crs()
    }

    pub fn bounds(&self) -> BoundingBox {
        self.elevation.bounds()
    }
}

/// Feature band identifiers; order within a stack is configuration-defined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureBand {
    /// VV/VH cross-polarisation ratio (linear power)
    VvVhRatio,
    /// Windowed variance of VV
    VvTexture,
    /// Windowed mean of VV
    VvMean,
    /// Windowed mean of VH
    VhMean,
    /// (R + G + B) / 3
    Brightness,
    Ndvi,
    Ndwi,
    RedGreenRatio,
    RedBlueRatio,
    /// Gradient magnitude in degrees
    Slope,
    /// Gradient direction in radians, [0, 2pi)
    Aspect,
    /// Central-difference Laplacian
    Curvature,
    /// Windowed elevation standard deviation
    Roughness,
}

impl FeatureBand {
    /// Every band in the default stacking order
    pub const ALL: [FeatureBand; 13] = [
        FeatureBand::VvVhRatio,
        FeatureBand::VvTexture,
        FeatureBand::VvMean,
        FeatureBand::VhMean,
        FeatureBand::Brightness,
        FeatureBand::Ndvi,
        FeatureBand::Ndwi,
        FeatureBand::RedGreenRatio,
        FeatureBand::RedBlueRatio,
        FeatureBand::Slope,
        FeatureBand::Aspect,
        FeatureBand::Roughness,
        FeatureBand::Curvature,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FeatureBand::VvVhRatio => "vv_vh_ratio",
            FeatureBand::VvTexture => "vv_texture",
            FeatureBand::VvMean => "vv_mean",
            FeatureBand::VhMean => "vh_mean",
            FeatureBand::Brightness => "brightness",
            FeatureBand::Ndvi => "ndvi",
            FeatureBand::Ndwi => "ndwi",
            FeatureBand::RedGreenRatio => "rg_ratio",
            FeatureBand::RedBlueRatio => "rb_ratio",
            FeatureBand::Slope => "slope",
            FeatureBand::Aspect => "aspect",
            FeatureBand::Curvature => "curvature",
            FeatureBand::Roughness => "roughness",
        }
    }

    pub fn source(&self) -> SensorRole {
        match self {
            FeatureBand::VvVhRatio
            | FeatureBand::VvTexture
            | FeatureBand::VvMean
            | FeatureBand::VhMean => SensorRole::Radar,
            FeatureBand::Brightness
            | FeatureBand::Ndvi
            | FeatureBand::Ndwi
            | FeatureBand::RedGreenRatio
            | FeatureBand::RedBlueRatio => SensorRole::Optical,
            FeatureBand::Slope
            | FeatureBand::Aspect
            | FeatureBand::Curvature
            | FeatureBand::Roughness => SensorRole::Elevation,
        }
    }
}

impl std::fmt::Display for FeatureBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Ordered feature bands plus a mask of pixels that had non-finite values
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureStack {
    bands: Vec<FeatureBand>,
    data: Array3<f32>,
    mask: Array2<bool>,
    masked_counts: Vec<usize>,
}

impl FeatureStack {
    /// Build a stack, replacing NaN/Inf with 0 and flagging those pixels
    pub fn from_bands(bands: Vec<(FeatureBand, Array2<f32>)>) -> FusionResult<Self> {
        let first = bands
            .first()
            .ok_or_else(|| FusionError::Processing("Feature stack needs at least one band".to_string()))?;
        let (rows, cols) = first.1.dim();

        let mut ids = Vec::with_capacity(bands.len());
        let mut data = Array3::zeros((bands.len(), rows, cols));
        for (i, (band, image)) in bands.into_iter().enumerate() {
            if image.dim() != (rows, cols) {
                return Err(FusionError::GridMismatch {
                    raster: band.name().to_string(),
                    detail: format!("shape {:?} differs from stack shape {:?}", image.dim(), (rows, cols)),
                });
            }
            data.index_axis_mut(Axis(0), i).assign(&image);
            ids.push(band);
        }

        Self::from_array(ids, data)
    }

    /// Build a stack from a (band, row, col) array, masking non-finite values
    pub fn from_array(bands: Vec<FeatureBand>, mut data: Array3<f32>) -> FusionResult<Self> {
        if bands.is_empty() || bands.len() != data.dim().0 {
            return Err(FusionError::Processing(format!(
                "{} band id(s) for {} data band(s)",
                bands.len(),
                data.dim().0
            )));
        }
        for (i, band) in bands.iter().enumerate() {
            if bands[..i].contains(band) {
                return Err(FusionError::InvalidParameter {
                    name: "bands".to_string(),
                    reason: format!("duplicate feature band {}", band),
                });
            }
        }

        let (_, rows, cols) = data.dim();
        let mut mask = Array2::from_elem((rows, cols), false);
        let mut masked_counts = Vec::with_capacity(bands.len());
        for mut layer in data.outer_iter_mut() {
            let mut masked = 0;
            ndarray::Zip::from(&mut layer).and(&mut mask).for_each(|v, m| {
                if !v.is_finite() {
                    *v = 0.0;
                    *m = true;
                    masked += 1;
                }
            });
            masked_counts.push(masked);
        }

        Ok(Self {
            bands,
            data,
            mask,
            masked_counts,
        })
    }

    pub fn bands(&self) -> &[FeatureBand] {
        &self.bands
    }

    pub fn band_names(&self) -> Vec<String> {
        self.bands.iter().map(|b| b.name().to_string()).collect()
    }

    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn band_index(&self, band: FeatureBand) -> Option<usize> {
        self.bands.iter().position(|&b| b == band)
    }

    pub fn band(&self, band: FeatureBand) -> Option<ArrayView2<'_, f32>> {
        self.band_index(band).map(|i| self.data.index_axis(Axis(0), i))
    }

    /// True where at least one band was non-finite before masking
    pub fn mask(&self) -> &Array2<bool> {
        &self.mask
    }

    /// Number of masked pixels per band, in band order
    pub fn masked_counts(&self) -> &[usize] {
        &self.masked_counts
    }

    pub fn shape(&self) -> (usize, usize) {
        self.mask.dim()
    }

    pub fn valid_pixel_count(&self) -> usize {
        self.mask.iter().filter(|&&m| !m).count()
    }
}

/// Which engine produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    Unsupervised,
    Supervised,
}

/// Whether the producing model was fitted on real data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    Fitted,
    /// No labelled data was available; the result carries no predictions
    Untrained,
}

/// Summary statistics of normalised scores over valid pixels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreStatistics {
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub n_above_p95: usize,
    pub n_flagged: usize,
}

/// Per-pixel output of the anomaly/classification engine
#[derive(Debug, Clone)]
pub struct AnomalyResult {
    pub mode: EngineMode,
    pub state: ModelState,
    /// Normalised score in [0, 1]
    pub scores: Option<FeatureImage>,
    /// Anomaly flag (0/1) or class label
    pub labels: Option<Array2<u8>>,
    /// Pixels that took part in fitting and scoring
    pub valid: Array2<bool>,
    pub bands_used: Vec<FeatureBand>,
    pub stats: Option<ScoreStatistics>,
}

impl AnomalyResult {
    pub fn is_untrained(&self) -> bool {
        self.state == ModelState::Untrained
    }

    pub fn shape(&self) -> (usize, usize) {
        self.valid.dim()
    }
}

/// Error types for the fusion pipeline
#[derive(Debug, thiserror::Error)]
pub enum FusionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Invalid parameter: {name} - {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("Insufficient valid pixels in '{raster}': {valid_fraction:.4} valid, minimum {threshold:.4}")]
    InsufficientValidPixels {
        raster: String,
        valid_fraction: f64,
        threshold: f64,
    },

    #[error("CRS mismatch: '{raster}' has {found}, expected {expected}")]
    CrsMismatch {
        raster: String,
        expected: String,
        found: String,
    },

    #[error("No extent overlap: intersection area {intersection_area} is below one pixel ({pixel_area})")]
    NoExtentOverlap { intersection_area: f64, pixel_area: f64 },

    #[error("Pixel grid mismatch for '{raster}': {detail}")]
    GridMismatch { raster: String, detail: String },

    #[error("Insufficient samples: required {required}, got {got}")]
    InsufficientSamples { required: usize, got: usize },

    #[error("Degenerate feature space: all bands have zero variance ({bands:?})")]
    DegenerateFeatureSpace { bands: Vec<String> },

    #[error("Band mismatch: model expects {expected:?}, stack has {found:?}")]
    BandMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("Invalid target size {0}: must be 2^k + 1 and at least 65")]
    InvalidTargetSize(usize),

    #[error("Invalid texture size {0}: must be a power of two")]
    InvalidTextureSize(usize),

    #[error("Pipeline cancelled before stage '{stage}'")]
    Cancelled { stage: String },
}

/// Result type for fusion operations
pub type FusionResult<T> = Result<T, FusionError>;

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn transform() -> GeoTransform {
        GeoTransform::north_up(500_000.0, 4_000_000.0, 10.0, 10.0)
    }

    #[test]
    fn test_bounds_north_up() {
        let bbox = transform().bounds(100, 50);
        assert_abs_diff_eq!(bbox.min_x, 500_000.0);
        assert_abs_diff_eq!(bbox.max_x, 501_000.0);
        assert_abs_diff_eq!(bbox.min_y, 3_999_500.0);
        assert_abs_diff_eq!(bbox.max_y, 4_000_000.0);
        assert_abs_diff_eq!(bbox.area(), 1000.0 * 500.0);
    }

    #[test]
    fn test_disjoint_intersection_has_zero_area() {
        let a = transform().bounds(10, 10);
        let b = GeoTransform::north_up(600_000.0, 4_000_000.0, 10.0, 10.0).bounds(10, 10);
        assert_eq!(a.intersection(&b).area(), 0.0);
    }

    #[test]
    fn test_singular_transform_rejected() {
        let mut gt = transform();
        gt.pixel_width = 0.0;
        let result = Raster::from_band("dem", Array2::zeros((4, 4)), gt, "EPSG:32633", None);
        assert!(matches!(result, Err(FusionError::InvalidFormat(_))));
    }

    #[test]
    fn test_valid_mask_uses_all_bands() {
        let mut data = Array3::from_elem((2, 3, 3), 1.0f32);
        data[[0, 0, 0]] = -9999.0;
        data[[1, 2, 2]] = f32::NAN;
        let raster = Raster::new("s1", data, transform(), "EPSG:32633", Some(-9999.0)).unwrap();
        assert_eq!(raster.valid_pixel_count(), 7);
        let masked = raster.band_rows_masked(0, 0..1);
        assert!(masked[[0, 0]].is_nan());
    }

    #[test]
    fn test_tile_rejects_member_shape_mismatch() {
        let gt = transform();
        let radar = Raster::new("s1", Array3::from_elem((2, 10, 10), -10.0), gt, "EPSG:32633", None).unwrap();
        let optical = Raster::new("s2", Array3::from_elem((3, 10, 10), 0.2), gt, "EPSG:32633", None).unwrap();
        let dem = Raster::from_band("dem", Array2::from_elem((20, 20), 100.0), gt, "EPSG:32633", None).unwrap();

        match Tile::new("t", radar, optical, dem, None) {
            Err(FusionError::GridMismatch { raster, .. }) => assert_eq!(raster, "s1"),
            other => panic!("expected GridMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_tile_rejects_hyperspectral_shape_mismatch() {
        let gt = transform();
        let result = Tile::new(
            "t",
            Raster::new("s1", Array3::from_elem((2, 8, 8), -10.0), gt, "EPSG:32633", None).unwrap(),
            Raster::new("s2", Array3::from_elem((3, 8, 8), 0.2), gt, "EPSG:32633", None).unwrap(),
            Raster::from_band("dem", Array2::from_elem((8, 8), 100.0), gt, "EPSG:32633", None).unwrap(),
            Some(Raster::new("hs", Array3::from_elem((5, 8, 9), 0.1), gt, "EPSG:32633", None).unwrap()),
        );
        assert!(matches!(result, Err(FusionError::GridMismatch { .. })));
    }

    #[test]
    fn test_feature_stack_masks_non_finite() {
        let mut slope = Array2::from_elem((2, 2), 1.0f32);
        slope[[1, 1]] = f32::INFINITY;
        let stack = FeatureStack::from_bands(vec![
            (FeatureBand::Slope, slope),
            (FeatureBand::Ndvi, Array2::from_elem((2, 2), 0.5)),
        ])
        .unwrap();

        assert_eq!(stack.masked_counts(), &[1, 0]);
        assert!(stack.mask()[[1, 1]]);
        assert_eq!(stack.band(FeatureBand::Slope).unwrap()[[1, 1]], 0.0);
        assert_eq!(stack.valid_pixel_count(), 3);
    }

    #[test]
    fn test_feature_stack_rejects_duplicates() {
        let result = FeatureStack::from_bands(vec![
            (FeatureBand::Slope, Array2::zeros((2, 2))),
            (FeatureBand::Slope, Array2::zeros((2, 2))),
        ]);
        assert!(matches!(result, Err(FusionError::InvalidParameter { .. })));
    }
}
