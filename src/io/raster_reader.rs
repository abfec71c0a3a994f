use crate::types::{FusionError, FusionResult, GeoTransform, Raster, Tile};
use gdal::Dataset;
use ndarray::{Array2, Array3, Axis, Zip};
use std::ops::Range;
use std::path::{Path, PathBuf};

/// Georeferenced raster file reader (GeoTIFF or anything GDAL opens)
pub struct RasterReader {
    path: PathBuf,
    dataset: Dataset,
}

impl RasterReader {
    pub fn open<P: AsRef<Path>>(path: P) -> FusionResult<Self> {
        let path = path.as_ref().to_path_buf();
        log::info!("Opening raster: {}", path.display());

        let dataset = Dataset::open(&path)?;
        let (width, height) = dataset.raster_size();
        log::debug!(
            "Raster size: {}x{}, {} band(s)",
            width,
            height,
            dataset.raster_count()
        );

        Ok(Self { path, dataset })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// (width, height) in pixels
    pub fn size(&self) -> (usize, usize) {
        self.dataset.raster_size()
    }

    pub fn band_count(&self) -> usize {
        self.dataset.raster_count().max(0) as usize
    }

    pub fn geo_transform(&self) -> FusionResult<GeoTransform> {
        Ok(GeoTransform::from_gdal(self.dataset.geo_transform()?))
    }

    /// Pixel size along x and y in CRS units
    pub fn resolution(&self) -> FusionResult<(f64, f64)> {
        Ok(self.geo_transform()?.pixel_size())
    }

    /// Authority code (e.g. `EPSG:32633`) when known, WKT otherwise
    pub fn crs(&self) -> FusionResult<String> {
        let srs = match self.dataset.spatial_ref() {
            Ok(srs) => srs,
            Err(_) => {
                log::warn!("No CRS defined for: {}", self.path.display());
                return Ok(String::new());
            }
        };

        match (srs.auth_name(), srs.auth_code()) {
            (Ok(name), Ok(code)) => Ok(format!("{}:{}", name, code)),
            _ => Ok(srs.to_wkt()?),
        }
    }

    /// Nodata sentinel of the first band
    pub fn nodata(&self) -> FusionResult<Option<f32>> {
        let band = self.dataset.rasterband(1)?;
        Ok(band.no_data_value().map(|v| v as f32))
    }

    /// Read a block of full-width rows from every band
    pub fn read_window(&self, rows: Range<usize>) -> FusionResult<Array3<f32>> {
        let (width, height) = self.size();
        if rows.start >= rows.end || rows.end > height {
            return Err(FusionError::Processing(format!(
                "Row window {:?} outside raster {} of {} rows",
                rows,
                self.path.display(),
                height
            )));
        }

        let bands: Vec<usize> = (0..self.band_count()).collect();
        self.read_bands_window(&bands, rows, width)
    }

    fn read_bands_window(&self, bands: &[usize], rows: Range<usize>, width: usize) -> FusionResult<Array3<f32>> {
        let n_rows = rows.len();
        let mut block = Array3::zeros((bands.len(), n_rows, width));

        for (i, &b) in bands.iter().enumerate() {
            let rasterband = self.dataset.rasterband(b as isize + 1)?;
            let buffer = rasterband.read_as::<f32>(
                (0, rows.start as isize),
                (width, n_rows),
                (width, n_rows),
                None,
            )?;
            let band_array = Array2::from_shape_vec((n_rows, width), buffer.data)
                .map_err(|e| FusionError::Processing(format!("Failed to reshape band {}: {}", b + 1, e)))?;
            block.index_axis_mut(Axis(0), i).assign(&band_array);
        }

        Ok(block)
    }

    /// Row window with nodata and non-finite samples replaced by NaN
    pub fn read_window_masked(&self, rows: Range<usize>) -> FusionResult<Array3<f32>> {
        let nodata = self.nodata()?;
        let mut block = self.read_window(rows)?;
        block.mapv_inplace(|v| {
            if !v.is_finite() || nodata.map_or(false, |nd| v == nd) {
                f32::NAN
            } else {
                v
            }
        });
        Ok(block)
    }

    /// Read the whole raster into memory
    pub fn read_raster(&self, name: &str) -> FusionResult<Raster> {
        let (_, height) = self.size();
        let data = self.read_window(0..height)?;
        Raster::new(name, data, self.geo_transform()?, self.crs()?, self.nodata()?)
    }

    /// Read a subset of bands (0-based) over the whole raster
    pub fn read_raster_bands(&self, name: &str, bands: &[usize]) -> FusionResult<Raster> {
        let available = self.band_count();
        if let Some(&bad) = bands.iter().find(|&&b| b >= available) {
            return Err(FusionError::InvalidParameter {
                name: "bands".to_string(),
                reason: format!("band index {} exceeds {} band(s) in {}", bad, available, self.path.display()),
            });
        }
        let (width, height) = self.size();
        let data = self.read_bands_window(bands, 0..height, width)?;
        Raster::new(name, data, self.geo_transform()?, self.crs()?, self.nodata()?)
    }

    /// Count pixels valid in every band, reading `block_rows` rows at a time
    pub fn valid_pixel_count(&self, block_rows: usize) -> FusionResult<usize> {
        let (_, height) = self.size();
        let step = block_rows.max(1);
        let mut valid = 0;
        for start in (0..height).step_by(step) {
            let block = self.read_window_masked(start..(start + step).min(height))?;
            let (_, rows, cols) = block.dim();
            let mut mask = Array2::from_elem((rows, cols), true);
            for band in block.outer_iter() {
                Zip::from(&mut mask).and(&band).for_each(|m, v| *m = *m && !v.is_nan());
            }
            valid += mask.iter().filter(|&&m| m).count();
        }
        Ok(valid)
    }
}

/// Supplies an aligned, calibrated tile to the pipeline.
///
/// This is the only contract with the upstream preprocessor.
pub trait TileProvider {
    fn provide(&self) -> FusionResult<Tile>;
}

/// Loads a tile from separate radar, optical and elevation files
#[derive(Debug, Clone)]
pub struct GdalTileProvider {
    pub tile_id: String,
    pub radar_path: PathBuf,
    pub optical_path: PathBuf,
    pub elevation_path: PathBuf,
    pub hyperspectral_path: Option<PathBuf>,
}

impl GdalTileProvider {
    pub fn new(
        tile_id: impl Into<String>,
        radar_path: impl Into<PathBuf>,
        optical_path: impl Into<PathBuf>,
        elevation_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            tile_id: tile_id.into(),
            radar_path: radar_path.into(),
            optical_path: optical_path.into(),
            elevation_path: elevation_path.into(),
            hyperspectral_path: None,
        }
    }

    pub fn with_hyperspectral(mut self, path: impl Into<PathBuf>) -> Self {
        self.hyperspectral_path = Some(path.into());
        self
    }
}

impl TileProvider for GdalTileProvider {
    fn provide(&self) -> FusionResult<Tile> {
        log::info!("Loading tile '{}'", self.tile_id);

        let radar = RasterReader::open(&self.radar_path)?.read_raster("radar")?;
        let optical = RasterReader::open(&self.optical_path)?.read_raster("optical")?;
        let elevation = RasterReader::open(&self.elevation_path)?.read_raster("elevation")?;
        let hyperspectral = match &self.hyperspectral_path {
            Some(path) => Some(RasterReader::open(path)?.read_raster("hyperspectral")?),
            None => None,
        };

        Tile::new(self.tile_id.clone(), radar, optical, elevation, hyperspectral)
    }
}
