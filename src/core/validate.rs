use crate::io::raster_reader::RasterReader;
use crate::io::tile_source::GdalTileSource;
use crate::types::{BoundingBox, FusionError, FusionResult, GeoTransform, Raster, Tile};
use serde::{Deserialize, Serialize};

/// Relative tolerance when comparing geotransform coefficients
const GRID_TOLERANCE: f64 = 1e-9;

/// Rows per window when counting valid pixels in files
const COUNT_BLOCK_ROWS: usize = 256;

/// Input compatibility checks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationParams {
    /// Minimum fraction of non-nodata pixels per raster
    pub min_valid_fraction: f64,
    /// Reject tiles whose rasters do not share one CRS identifier
    pub require_crs_match: bool,
}

impl Default for ValidationParams {
    fn default() -> Self {
        Self {
            min_valid_fraction: 0.5,
            require_crs_match: true,
        }
    }
}

/// Per-raster statistics gathered during validation
#[derive(Debug, Clone, Serialize)]
pub struct RasterStatistics {
    pub name: String,
    pub crs: String,
    pub width: usize,
    pub height: usize,
    pub bands: usize,
    pub valid_pixels: usize,
    pub total_pixels: usize,
    pub valid_fraction: f64,
    pub bounds: BoundingBox,
    pub pixel_size: (f64, f64),
}

impl RasterStatistics {
    fn collect(raster: &Raster) -> Self {
        let (height, width) = raster.shape();
        let total_pixels = width * height;
        let valid_pixels = raster.valid_pixel_count();

        Self {
            name: raster.name().to_string(),
            crs: raster.crs().to_string(),
            width,
            height,
            bands: raster.band_count(),
            valid_pixels,
            total_pixels,
            valid_fraction: valid_pixels as f64 / total_pixels as f64,
            bounds: raster.bounds(),
            pixel_size: raster.pixel_size(),
        }
    }

    /// Same statistics from file metadata and a windowed valid-pixel count
    fn from_reader(name: &str, reader: &RasterReader) -> FusionResult<Self> {
        let (width, height) = reader.size();
        let geo_transform = reader.geo_transform()?;
        let total_pixels = width * height;
        let valid_pixels = reader.valid_pixel_count(COUNT_BLOCK_ROWS)?;

        Ok(Self {
            name: name.to_string(),
            crs: reader.crs()?,
            width,
            height,
            bands: reader.band_count(),
            valid_pixels,
            total_pixels,
            valid_fraction: valid_pixels as f64 / total_pixels.max(1) as f64,
            bounds: geo_transform.bounds(width, height),
            pixel_size: geo_transform.pixel_size(),
        })
    }
}

/// Outcome of a successful validation
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub rasters: Vec<RasterStatistics>,
    pub crs: String,
    /// Intersection of all raster extents
    pub intersection: BoundingBox,
    /// Intersection area over the largest raster area (1.0 when extents coincide)
    pub overlap_fraction: f64,
    /// Whether all rasters share shape and geotransform
    pub grid_aligned: bool,
}

impl ValidationReport {
    pub fn log_summary(&self) {
        for stats in &self.rasters {
            log::info!(
                "  {}: {}x{} px, {} band(s), {:.1}% valid, CRS {}",
                stats.name,
                stats.width,
                stats.height,
                stats.bands,
                stats.valid_fraction * 100.0,
                stats.crs
            );
        }
        log::info!(
            "  overlap {:.1}%, grid aligned: {}",
            self.overlap_fraction * 100.0,
            self.grid_aligned
        );
    }
}

/// Raster compatibility validator
pub struct Validator {
    params: ValidationParams,
}

impl Validator {
    pub fn new() -> Self {
        Self {
            params: ValidationParams::default(),
        }
    }

    pub fn with_params(params: ValidationParams) -> Self {
        Self { params }
    }

    /// Check valid-pixel fractions, CRS agreement and extent overlap.
    /// Pure: nothing is modified, the report is returned for logging.
    pub fn validate(&self, rasters: &[&Raster]) -> FusionResult<ValidationReport> {
        log::info!("Validating {} raster(s)", rasters.len());
        log::debug!("Validation parameters: {:?}", self.params);

        if rasters.is_empty() {
            return Err(FusionError::InvalidParameter {
                name: "tile_rasters".to_string(),
                reason: "at least one raster is required".to_string(),
            });
        }
        self.check_threshold()?;

        let stats: Vec<RasterStatistics> = rasters.iter().map(|r| RasterStatistics::collect(r)).collect();
        let grid_aligned = rasters.iter().skip(1).all(|r| same_grid(rasters[0], r));
        self.check(stats, grid_aligned)
    }

    /// Validate a file-backed tile without loading it: metadata plus
    /// valid-pixel counts read in row windows.
    pub fn validate_source(&self, source: &GdalTileSource) -> FusionResult<ValidationReport> {
        log::info!("Validating windowed tile source");
        log::debug!("Validation parameters: {:?}", self.params);
        self.check_threshold()?;

        let members = source.members();
        let mut stats = Vec::with_capacity(members.len());
        let mut grids = Vec::with_capacity(members.len());
        for (role, reader) in &members {
            let (width, height) = reader.size();
            grids.push(((height, width), reader.geo_transform()?));
            stats.push(RasterStatistics::from_reader(&role.to_string(), reader)?);
        }

        let (ref_shape, ref_gt) = grids[0];
        let offender = grids
            .iter()
            .position(|(shape, gt)| !same_geometry((ref_shape, &ref_gt), (*shape, gt)));
        let report = self.check(stats, offender.is_none())?;

        if let Some(i) = offender {
            let (shape, gt) = grids[i];
            let detail = format!(
                "shape {:?} / transform {:?} differs from '{}' shape {:?} / transform {:?}",
                shape, gt, report.rasters[0].name, ref_shape, ref_gt
            );
            log::error!("Tile source is not co-registered: {}", detail);
            return Err(FusionError::GridMismatch {
                raster: report.rasters[i].name.clone(),
                detail,
            });
        }
        Ok(report)
    }

    fn check_threshold(&self) -> FusionResult<()> {
        let threshold = self.params.min_valid_fraction;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(FusionError::InvalidParameter {
                name: "min_valid_fraction".to_string(),
                reason: format!("must be within [0, 1], got {}", threshold),
            });
        }
        Ok(())
    }

    fn check(&self, stats: Vec<RasterStatistics>, grid_aligned: bool) -> FusionResult<ValidationReport> {
        let threshold = self.params.min_valid_fraction;
        for s in &stats {
            // An all-nodata raster is rejected even with a zero threshold
            if s.valid_pixels == 0 || s.valid_fraction < threshold {
                log::error!(
                    "Raster '{}' has {}/{} valid pixels ({:.2}%), minimum {:.2}%",
                    s.name,
                    s.valid_pixels,
                    s.total_pixels,
                    s.valid_fraction * 100.0,
                    threshold * 100.0
                );
                return Err(FusionError::InsufficientValidPixels {
                    raster: s.name.clone(),
                    valid_fraction: s.valid_fraction,
                    threshold,
                });
            }
        }

        let reference_crs = stats[0].crs.clone();
        if self.params.require_crs_match {
            if let Some(other) = stats.iter().find(|s| !same_crs(&s.crs, &reference_crs)) {
                log::error!(
                    "CRS mismatch: '{}' uses {}, '{}' uses {}",
                    stats[0].name,
                    reference_crs,
                    other.name,
                    other.crs
                );
                return Err(FusionError::CrsMismatch {
                    raster: other.name.clone(),
                    expected: reference_crs,
                    found: other.crs.clone(),
                });
            }
        }

        let intersection = stats
            .iter()
            .skip(1)
            .fold(stats[0].bounds, |acc, s| acc.intersection(&s.bounds));
        let pixel_area = stats
            .iter()
            .map(|s| s.pixel_size.0 * s.pixel_size.1)
            .fold(f64::INFINITY, f64::min);
        let intersection_area = intersection.area();

        // Anything smaller than a single pixel counts as no overlap
        if intersection_area <= 0.0 || intersection_area < pixel_area {
            log::error!(
                "Raster extents do not overlap: intersection {:?} ({} < pixel area {})",
                intersection,
                intersection_area,
                pixel_area
            );
            return Err(FusionError::NoExtentOverlap {
                intersection_area,
                pixel_area,
            });
        }

        let largest_area = stats.iter().map(|s| s.bounds.area()).fold(0.0, f64::max);
        let overlap_fraction = intersection_area / largest_area;

        let report = ValidationReport {
            rasters: stats,
            crs: reference_crs,
            intersection,
            overlap_fraction,
            grid_aligned,
        };
        log::info!("Validation passed");
        report.log_summary();
        Ok(report)
    }

    /// Validate a tile and additionally require one shared pixel grid
    pub fn validate_tile(&self, tile: &Tile) -> FusionResult<ValidationReport> {
        log::info!("Validating tile '{}'", tile.id());
        let rasters = tile.rasters();
        let report = self.validate(&rasters)?;

        if !report.grid_aligned {
            let reference = rasters[0];
            if let Some(offender) = rasters.iter().find(|r| !same_grid(reference, r)) {
                let detail = format!(
                    "shape {:?} / transform {:?} differs from '{}' shape {:?} / transform {:?}",
                    offender.shape(),
                    offender.geo_transform(),
                    reference.name(),
                    reference.shape(),
                    reference.geo_transform()
                );
                log::error!("Tile '{}' is not co-registered: {}", tile.id(), detail);
                return Err(FusionError::GridMismatch {
                    raster: offender.name().to_string(),
                    detail,
                });
            }
        }

        Ok(report)
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate a list of rasters with explicit thresholds
pub fn validate(
    tile_rasters: &[&Raster],
    min_valid_fraction: f64,
    require_crs_match: bool,
) -> FusionResult<ValidationReport> {
    Validator::with_params(ValidationParams {
        min_valid_fraction,
        require_crs_match,
    })
    .validate(tile_rasters)
}

fn same_crs(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

fn same_grid(a: &Raster, b: &Raster) -> bool {
    same_geometry((a.shape(), a.geo_transform()), (b.shape(), b.geo_transform()))
}

fn same_geometry(a: ((usize, usize), &GeoTransform), b: ((usize, usize), &GeoTransform)) -> bool {
    if a.0 != b.0 {
        return false;
    }
    let (px, py) = a.1.pixel_size();
    let scale = px.max(py).max(1.0);
    a.1.to_gdal()
        .iter()
        .zip(b.1.to_gdal().iter())
        .all(|(x, y)| (x - y).abs() <= GRID_TOLERANCE * scale.max(x.abs()))
}
