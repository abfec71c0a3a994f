use crate::io::raster_reader::RasterReader;
use crate::types::{FusionError, FusionResult, GeoTransform, Raster, SensorRole, Tile};
use ndarray::{s, Array2, Array3, Axis};
use std::ops::Range;
use std::path::Path;

/// Pixel grid shared by all members of a tile
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileGrid {
    pub rows: usize,
    pub cols: usize,
    pub geo_transform: GeoTransform,
}

/// A block of full-width rows from every tile member, nodata replaced by NaN
#[derive(Debug, Clone)]
pub struct TileSlab {
    /// Global row range covered by this slab
    pub rows: Range<usize>,
    /// Radar bands (VV, VH, ...) x rows x cols
    pub radar: Array3<f32>,
    /// Optical bands x rows x cols
    pub optical: Array3<f32>,
    pub elevation: Array2<f32>,
}

impl TileSlab {
    pub fn height(&self) -> usize {
        self.rows.len()
    }
}

/// Row-windowed access to co-registered tile data.
///
/// Feature extraction only ever holds one slab (plus halo) per worker, so
/// an implementation backed by files keeps memory bounded by the block size.
pub trait TileSource {
    fn grid(&self) -> TileGrid;

    fn read_rows(&self, rows: Range<usize>) -> FusionResult<TileSlab>;
}

fn masked_rows(raster: &Raster, rows: Range<usize>) -> Array3<f32> {
    raster
        .data()
        .slice(s![.., rows, ..])
        .mapv(|v| if raster.is_valid_sample(v) { v } else { f32::NAN })
}

impl TileSource for Tile {
    fn grid(&self) -> TileGrid {
        let (rows, cols) = self.shape();
        TileGrid {
            rows,
            cols,
            geo_transform: *self.geo_transform(),
        }
    }

    fn read_rows(&self, rows: Range<usize>) -> FusionResult<TileSlab> {
        let (height, _) = self.shape();
        if rows.end > height || rows.start >= rows.end {
            return Err(FusionError::Processing(format!(
                "Row window {:?} outside tile of {} rows",
                rows, height
            )));
        }

        Ok(TileSlab {
            radar: masked_rows(self.radar(), rows.clone()),
            optical: masked_rows(self.optical(), rows.clone()),
            elevation: self.elevation().band_rows_masked(0, rows.clone()),
            rows,
        })
    }
}

/// File-backed tile source reading row windows on demand
pub struct GdalTileSource {
    radar: RasterReader,
    optical: RasterReader,
    elevation: RasterReader,
    hyperspectral: Option<RasterReader>,
    grid: TileGrid,
}

impl GdalTileSource {
    pub fn open<P: AsRef<Path>>(radar: P, optical: P, elevation: P) -> FusionResult<Self> {
        let radar = RasterReader::open(radar)?;
        let optical = RasterReader::open(optical)?;
        let elevation = RasterReader::open(elevation)?;

        let (cols, rows) = elevation.size();
        for reader in [&radar, &optical] {
            check_size(reader, (cols, rows))?;
        }
        if radar.band_count() < 2 {
            return Err(FusionError::InvalidFormat(format!(
                "Radar file {} needs VV and VH bands",
                radar.path().display()
            )));
        }
        if optical.band_count() < 3 {
            return Err(FusionError::InvalidFormat(format!(
                "Optical file {} needs at least 3 bands",
                optical.path().display()
            )));
        }

        let grid = TileGrid {
            rows,
            cols,
            geo_transform: elevation.geo_transform()?,
        };
        log::info!("Opened windowed tile source: {}x{} px", cols, rows);

        Ok(Self {
            radar,
            optical,
            elevation,
            hyperspectral: None,
            grid,
        })
    }

    /// Attach a hyperspectral cube; it is validated with the other members
    pub fn with_hyperspectral<P: AsRef<Path>>(mut self, path: P) -> FusionResult<Self> {
        let reader = RasterReader::open(path)?;
        check_size(&reader, (self.grid.cols, self.grid.rows))?;
        self.hyperspectral = Some(reader);
        Ok(self)
    }

    pub fn optical(&self) -> &RasterReader {
        &self.optical
    }

    pub fn elevation(&self) -> &RasterReader {
        &self.elevation
    }

    /// Member readers paired with their roles, same order as `Tile::members`
    pub fn members(&self) -> Vec<(SensorRole, &RasterReader)> {
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
}

fn check_size(reader: &RasterReader, expected: (usize, usize)) -> FusionResult<()> {
    if reader.size() != expected {
        return Err(FusionError::GridMismatch {
            raster: reader.path().display().to_string(),
            detail: format!(
                "size {:?} differs from elevation size {:?}",
                reader.size(),
                expected
            ),
        });
    }
    Ok(())
}

impl TileSource for GdalTileSource {
    fn grid(&self) -> TileGrid {
        self.grid
    }

    fn read_rows(&self, rows: Range<usize>) -> FusionResult<TileSlab> {
        let elevation = self
            .elevation
            .read_window_masked(rows.clone())?
            .index_axis_move(Axis(0), 0);

        Ok(TileSlab {
            radar: self.radar.read_window_masked(rows.clone())?,
            optical: self.optical.read_window_masked(rows.clone())?,
            elevation,
            rows,
        })
    }
}
