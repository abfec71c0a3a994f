use crate::io::tile_source::{TileGrid, TileSlab, TileSource};
use crate::types::{FeatureBand, FeatureStack, FusionError, FusionResult, SensorRole, Tile};
use ndarray::{s, Array2, Array3, ArrayView2, Axis, Zip};
use serde::{Deserialize, Serialize};
use std::f32::consts::TAU;
use std::ops::Range;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Units of the incoming radar backscatter bands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RadarScale {
    /// 10·log10(power); converted to linear power before feature computation
    Decibel,
    Linear,
}

/// Zero-based indices of the optical reflectance bands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpticalBandMap {
    pub red: usize,
    pub green: usize,
    pub blue: usize,
    /// Without NIR, NDVI/NDWI fall back to visible-band proxies
    pub nir: Option<usize>,
}

impl Default for OpticalBandMap {
    fn default() -> Self {
        Self {
            red: 0,
            green: 1,
            blue: 2,
            nir: None,
        }
    }
}

/// Feature extraction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Output band order; a model fitted on one order only accepts that order
    pub bands: Vec<FeatureBand>,
    /// Texture/roughness kernel size (odd)
    pub window_size: usize,
    /// Rows per processing block; bounds the per-worker working set
    pub block_rows: usize,
    pub radar_scale: RadarScale,
    pub optical_bands: OpticalBandMap,
    /// Floor applied to ratio denominators
    pub epsilon: f32,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            bands: FeatureBand::ALL.to_vec(),
            window_size: 5,
            block_rows: 256,
            radar_scale: RadarScale::Decibel,
            optical_bands: OpticalBandMap::default(),
            epsilon: 1e-9,
        }
    }
}

impl FeatureConfig {
    pub fn validate(&self) -> FusionResult<()> {
        if self.bands.is_empty() {
            return Err(FusionError::InvalidParameter {
                name: "bands".to_string(),
                reason: "at least one feature band is required".to_string(),
            });
        }
        for (i, band) in self.bands.iter().enumerate() {
            if self.bands[..i].contains(band) {
                return Err(FusionError::InvalidParameter {
                    name: "bands".to_string(),
                    reason: format!("duplicate feature band {}", band),
                });
            }
        }
        if self.window_size < 3 || self.window_size % 2 == 0 {
            return Err(FusionError::InvalidParameter {
                name: "window_size".to_string(),
                reason: format!("must be odd and >= 3, got {}", self.window_size),
            });
        }
        if self.block_rows == 0 {
            return Err(FusionError::InvalidParameter {
                name: "block_rows".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if !(self.epsilon > 0.0) {
            return Err(FusionError::InvalidParameter {
                name: "epsilon".to_string(),
                reason: format!("must be positive, got {}", self.epsilon),
            });
        }
        Ok(())
    }

    /// Rows of context each block needs above and below
    pub fn halo(&self) -> usize {
        (self.window_size / 2).max(1)
    }
}

/// Inputs shared by every band computed on one slab
struct SlabInputs<'a> {
    vv: Array2<f32>,
    vh: Array2<f32>,
    red: ArrayView2<'a, f32>,
    green: ArrayView2<'a, f32>,
    blue: ArrayView2<'a, f32>,
    nir: Option<ArrayView2<'a, f32>>,
    elevation: &'a Array2<f32>,
    spacing: (f32, f32),
    /// Per-source nodata footprints, propagated into every derived band
    radar_invalid: Array2<bool>,
    optical_invalid: Array2<bool>,
}

/// Multi-domain feature extractor (radar, optical, terrain)
pub struct FeatureExtractor {
    config: FeatureConfig,
}

impl FeatureExtractor {
    pub fn new(config: FeatureConfig) -> FusionResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    /// Extract features from an in-memory tile, blocks processed in parallel
    pub fn extract(&self, tile: &Tile) -> FusionResult<FeatureStack> {
        log::info!(
            "Extracting {} feature band(s) from tile '{}'",
            self.config.bands.len(),
            tile.id()
        );
        self.check_optical_bands(tile.optical().band_count())?;
        self.warn_missing_nir();

        let grid = tile.grid();
        let blocks = self.blocks(grid.rows);
        log::debug!("Processing {} block(s) of up to {} rows", blocks.len(), self.config.block_rows);

        #[cfg(feature = "parallel")]
        let results: Vec<FusionResult<Array3<f32>>> = blocks
            .par_iter()
            .map(|block| self.process_block(tile, &grid, block.clone()))
            .collect();

        #[cfg(not(feature = "parallel"))]
        let results: Vec<FusionResult<Array3<f32>>> = blocks
            .iter()
            .map(|block| self.process_block(tile, &grid, block.clone()))
            .collect();

        self.assemble(&grid, &blocks, results)
    }

    /// Extract features from any row-windowed source, one block in memory at a time
    pub fn extract_from_source<S: TileSource + ?Sized>(&self, source: &S) -> FusionResult<FeatureStack> {
        let grid = source.grid();
        log::info!(
            "Extracting {} feature band(s) from windowed source ({}x{} px)",
            self.config.bands.len(),
            grid.cols,
            grid.rows
        );
        self.warn_missing_nir();

        let blocks = self.blocks(grid.rows);
        let results = blocks
            .iter()
            .map(|block| self.process_block(source, &grid, block.clone()))
            .collect();

        self.assemble(&grid, &blocks, results)
    }

    fn check_optical_bands(&self, available: usize) -> FusionResult<()> {
        let map = &self.config.optical_bands;
        let mut indices = vec![map.red, map.green, map.blue];
        indices.extend(map.nir);
        if let Some(&bad) = indices.iter().find(|&&i| i >= available) {
            return Err(FusionError::InvalidParameter {
                name: "optical_bands".to_string(),
                reason: format!("band index {} exceeds {} optical band(s)", bad, available),
            });
        }
        Ok(())
    }

    fn warn_missing_nir(&self) {
        let wants_indices = self
            .config
            .bands
            .iter()
            .any(|b| matches!(b, FeatureBand::Ndvi | FeatureBand::Ndwi));
        if wants_indices && self.config.optical_bands.nir.is_none() {
            log::warn!("No NIR band configured; NDVI/NDWI use Green/Red and Green/Blue proxies");
        }
    }

    fn blocks(&self, rows: usize) -> Vec<Range<usize>> {
        (0..rows)
            .step_by(self.config.block_rows)
            .map(|start| start..(start + self.config.block_rows).min(rows))
            .collect()
    }

    /// Read a block plus halo, compute every band, crop the halo away
    fn process_block<S: TileSource + ?Sized>(
        &self,
        source: &S,
        grid: &TileGrid,
        block: Range<usize>,
    ) -> FusionResult<Array3<f32>> {
        let halo = self.config.halo();
        let read_start = block.start.saturating_sub(halo);
        let read_end = (block.end + halo).min(grid.rows);
        let slab = source.read_rows(read_start..read_end)?;
        check_slab_shape(&slab, (read_end - read_start, grid.cols))?;
        self.check_optical_bands(slab.optical.dim().0)?;

        let (px, py) = grid.geo_transform.pixel_size();
        let features = self.compute_slab(&slab, (px as f32, py as f32))?;

        let crop = (block.start - read_start)..(block.end - read_start);
        Ok(features.slice(s![.., crop, ..]).to_owned())
    }

    fn compute_slab(&self, slab: &TileSlab, spacing: (f32, f32)) -> FusionResult<Array3<f32>> {
        let to_power = |image: ArrayView2<f32>| match self.config.radar_scale {
            RadarScale::Decibel => image.mapv(|db| 10f32.powf(db / 10.0)),
            RadarScale::Linear => image.to_owned(),
        };
        let map = &self.config.optical_bands;
        let vv = to_power(slab.radar.index_axis(Axis(0), 0));
        let vh = to_power(slab.radar.index_axis(Axis(0), 1));
        let radar_invalid = Zip::from(&vv).and(&vh).map_collect(|a, b| a.is_nan() || b.is_nan());

        let mut optical_bands = vec![map.red, map.green, map.blue];
        optical_bands.extend(map.nir);
        let mut optical_invalid = Array2::from_elem(slab.elevation.dim(), false);
        for &b in &optical_bands {
            Zip::from(&mut optical_invalid)
                .and(&slab.optical.index_axis(Axis(0), b))
                .for_each(|m, v| *m = *m || v.is_nan());
        }

        let inputs = SlabInputs {
            vv,
            vh,
            red: slab.optical.index_axis(Axis(0), map.red),
            green: slab.optical.index_axis(Axis(0), map.green),
            blue: slab.optical.index_axis(Axis(0), map.blue),
            nir: map.nir.map(|i| slab.optical.index_axis(Axis(0), i)),
            elevation: &slab.elevation,
            spacing,
            radar_invalid,
            optical_invalid,
        };

        #[cfg(feature = "parallel")]
        let bands: Vec<Array2<f32>> = self
            .config
            .bands
            .par_iter()
            .map(|&band| self.compute_masked_band(&inputs, band))
            .collect();

        #[cfg(not(feature = "parallel"))]
        let bands: Vec<Array2<f32>> = self
            .config
            .bands
            .iter()
            .map(|&band| self.compute_masked_band(&inputs, band))
            .collect();

        let (rows, cols) = slab.elevation.dim();
        let mut out = Array3::zeros((bands.len(), rows, cols));
        for (i, band) in bands.iter().enumerate() {
            out.index_axis_mut(Axis(0), i).assign(band);
        }
        Ok(out)
    }

    /// Compute a band and blank every pixel whose source sample was nodata
    fn compute_masked_band(&self, inputs: &SlabInputs, band: FeatureBand) -> Array2<f32> {
        let mut image = self.compute_band(inputs, band);
        match band.source() {
            SensorRole::Radar => blank(&mut image, &inputs.radar_invalid),
            SensorRole::Optical => blank(&mut image, &inputs.optical_invalid),
            _ => Zip::from(&mut image).and(inputs.elevation).for_each(|v, z| {
                if z.is_nan() {
                    *v = f32::NAN;
                }
            }),
        }
        image
    }

    fn compute_band(&self, inputs: &SlabInputs, band: FeatureBand) -> Array2<f32> {
        let eps = self.config.epsilon;
        let window = self.config.window_size;

        match band {
            FeatureBand::VvVhRatio => {
                Zip::from(&inputs.vv)
                    .and(&inputs.vh)
                    .map_collect(|&vv, &vh| vv / floor_at(vh, eps))
            }
            FeatureBand::VvTexture => window_statistics(&inputs.vv.view(), window).1,
            FeatureBand::VvMean => window_statistics(&inputs.vv.view(), window).0,
            FeatureBand::VhMean => window_statistics(&inputs.vh.view(), window).0,
            FeatureBand::Brightness => Zip::from(&inputs.red)
                .and(&inputs.green)
                .and(&inputs.blue)
                .map_collect(|&r, &g, &b| (r + g + b) / 3.0),
            FeatureBand::Ndvi => match &inputs.nir {
                Some(nir) => normalized_difference(nir, &inputs.red),
                None => normalized_difference(&inputs.green, &inputs.red),
            },
            FeatureBand::Ndwi => match &inputs.nir {
                Some(nir) => normalized_difference(&inputs.green, nir),
                None => normalized_difference(&inputs.green, &inputs.blue),
            },
            FeatureBand::RedGreenRatio => Zip::from(&inputs.red)
                .and(&inputs.green)
                .map_collect(|&r, &g| r / floor_at(g, eps)),
            FeatureBand::RedBlueRatio => Zip::from(&inputs.red)
                .and(&inputs.blue)
                .map_collect(|&r, &b| r / floor_at(b, eps)),
            FeatureBand::Slope => {
                let (gx, gy) = gradient(inputs.elevation, inputs.spacing);
                Zip::from(&gx)
                    .and(&gy)
                    .map_collect(|&dx, &dy| dx.hypot(dy).atan().to_degrees())
            }
            FeatureBand::Aspect => {
                let (gx, gy) = gradient(inputs.elevation, inputs.spacing);
                Zip::from(&gx).and(&gy).map_collect(|&dx, &dy| wrap_angle(dy.atan2(dx)))
            }
            FeatureBand::Curvature => laplacian(inputs.elevation, inputs.spacing),
            FeatureBand::Roughness => {
                window_statistics(&inputs.elevation.view(), window).1.mapv(f32::sqrt)
            }
        }
    }

    fn assemble(
        &self,
        grid: &TileGrid,
        blocks: &[Range<usize>],
        results: Vec<FusionResult<Array3<f32>>>,
    ) -> FusionResult<FeatureStack> {
        let mut data = Array3::zeros((self.config.bands.len(), grid.rows, grid.cols));
        for (block, result) in blocks.iter().zip(results) {
            data.slice_mut(s![.., block.clone(), ..]).assign(&result?);
        }

        let stack = FeatureStack::from_array(self.config.bands.clone(), data)?;
        for (band, &count) in stack.bands().iter().zip(stack.masked_counts()) {
            if count > 0 {
                log::warn!("Feature {} had {} non-finite pixel(s), masked to 0", band, count);
            }
        }
        log::info!(
            "Feature extraction complete: {} band(s), {} valid pixel(s)",
            stack.bands().len(),
            stack.valid_pixel_count()
        );
        Ok(stack)
    }
}

/// Extract features from a tile with the given configuration
pub fn extract(tile: &Tile, config: &FeatureConfig) -> FusionResult<FeatureStack> {
    FeatureExtractor::new(config.clone())?.extract(tile)
}

/// Every slab member must cover the requested rows at full width
fn check_slab_shape(slab: &TileSlab, expected: (usize, usize)) -> FusionResult<()> {
    let (_, radar_rows, radar_cols) = slab.radar.dim();
    let (_, optical_rows, optical_cols) = slab.optical.dim();
    for (role, shape) in [
        (SensorRole::Radar, (radar_rows, radar_cols)),
        (SensorRole::Optical, (optical_rows, optical_cols)),
        (SensorRole::Elevation, slab.elevation.dim()),
    ] {
        if shape != expected {
            return Err(FusionError::GridMismatch {
                raster: role.to_string(),
                detail: format!(
                    "rows {:?} read as {:?}, expected {:?}",
                    slab.rows, shape, expected
                ),
            });
        }
    }
    if slab.radar.dim().0 < 2 {
        return Err(FusionError::InvalidFormat(format!(
            "Radar slab needs VV and VH bands, found {}",
            slab.radar.dim().0
        )));
    }
    Ok(())
}

fn blank(image: &mut Array2<f32>, invalid: &Array2<bool>) {
    Zip::from(image).and(invalid).for_each(|v, &bad| {
        if bad {
            *v = f32::NAN;
        }
    });
}

/// Floor a denominator at epsilon; NaN stays NaN so it gets masked later
fn floor_at(value: f32, eps: f32) -> f32 {
    if value.is_nan() {
        value
    } else {
        value.max(eps)
    }
}

/// (a - b) / (a + b), defined as 0 when the denominator is 0
fn normalized_difference(a: &ArrayView2<f32>, b: &ArrayView2<f32>) -> Array2<f32> {
    Zip::from(a).and(b).map_collect(|&a, &b| {
        let sum = a + b;
        if sum == 0.0 {
            0.0
        } else {
            (a - b) / sum
        }
    })
}

fn wrap_angle(angle: f32) -> f32 {
    let wrapped = angle.rem_euclid(TAU);
    // rem_euclid can round up to exactly TAU for tiny negative inputs
    if wrapped >= TAU {
        0.0
    } else {
        wrapped
    }
}

/// Symmetric (half-sample) reflection: ... b a | a b c ... c b | b a ...
pub(crate) fn reflect_index(index: isize, len: usize) -> usize {
    let n = len as isize;
    let period = 2 * n;
    let m = index.rem_euclid(period);
    (if m < n { m } else { period - 1 - m }) as usize
}

/// Windowed mean and population variance with reflected borders.
/// Any NaN inside the window makes both outputs NaN.
pub(crate) fn window_statistics(image: &ArrayView2<f32>, window: usize) -> (Array2<f32>, Array2<f32>) {
    let (rows, cols) = image.dim();
    let half = (window / 2) as isize;
    let count = (window * window) as f64;
    let mut mean = Array2::zeros((rows, cols));
    let mut variance = Array2::zeros((rows, cols));
    let mut samples = Vec::with_capacity(window * window);

    for i in 0..rows {
        for j in 0..cols {
            samples.clear();
            for di in -half..=half {
                let ii = reflect_index(i as isize + di, rows);
                for dj in -half..=half {
                    let jj = reflect_index(j as isize + dj, cols);
                    samples.push(image[[ii, jj]] as f64);
                }
            }
            let m = samples.iter().sum::<f64>() / count;
            let v = samples.iter().map(|x| (x - m) * (x - m)).sum::<f64>() / count;
            mean[[i, j]] = m as f32;
            variance[[i, j]] = v as f32;
        }
    }

    (mean, variance)
}

/// Column (x) and row (y) derivatives: central differences inside,
/// one-sided differences on the outermost rows/columns
pub(crate) fn gradient(z: &Array2<f32>, spacing: (f32, f32)) -> (Array2<f32>, Array2<f32>) {
    let (rows, cols) = z.dim();
    let (dx, dy) = spacing;
    let mut gx = Array2::zeros((rows, cols));
    let mut gy = Array2::zeros((rows, cols));

    for i in 0..rows {
        for j in 0..cols {
            gx[[i, j]] = if cols < 2 {
                0.0
            } else if j == 0 {
                (z[[i, 1]] - z[[i, 0]]) / dx
            } else if j == cols - 1 {
                (z[[i, j]] - z[[i, j - 1]]) / dx
            } else {
                (z[[i, j + 1]] - z[[i, j - 1]]) / (2.0 * dx)
            };

            gy[[i, j]] = if rows < 2 {
                0.0
            } else if i == 0 {
                (z[[1, j]] - z[[0, j]]) / dy
            } else if i == rows - 1 {
                (z[[i, j]] - z[[i - 1, j]]) / dy
            } else {
                (z[[i + 1, j]] - z[[i - 1, j]]) / (2.0 * dy)
            };
        }
    }

    (gx, gy)
}

/// Central-difference Laplacian with reflected borders
pub(crate) fn laplacian(z: &Array2<f32>, spacing: (f32, f32)) -> Array2<f32> {
    let (rows, cols) = z.dim();
    let (dx, dy) = spacing;
    let mut out = Array2::zeros((rows, cols));

    for i in 0..rows {
        let up = reflect_index(i as isize - 1, rows);
        let down = reflect_index(i as isize + 1, rows);
        for j in 0..cols {
            let left = reflect_index(j as isize - 1, cols);
            let right = reflect_index(j as isize + 1, cols);
            let center = z[[i, j]];
            let d2x = (z[[i, right]] - 2.0 * center + z[[i, left]]) / (dx * dx);
            let d2y = (z[[down, j]] - 2.0 * center + z[[up, j]]) / (dy * dy);
            out[[i, j]] = d2x + d2y;
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GeoTransform, Raster};
    use approx::assert_abs_diff_eq;

    fn synthetic_tile(rows: usize, cols: usize) -> Tile {
        let gt = GeoTransform::north_up(500_000.0, 4_000_000.0, 10.0, 10.0);
        let radar = Array3::from_shape_fn((2, rows, cols), |(b, i, j)| {
            -12.0 - 6.0 * b as f32 + ((i * 7 + j * 3) % 11) as f32 * 0.3
        });
        let optical = Array3::from_shape_fn((4, rows, cols), |(b, i, j)| {
            0.05 + 0.1 * b as f32 + ((i * 5 + j * 13 + b) % 17) as f32 * 0.01
        });
        let dem = Array2::from_shape_fn((rows, cols), |(i, j)| {
            200.0 + (i as f32 * 0.3).sin() * 15.0 + j as f32 * 0.8
        });
        Tile::new(
            "synthetic",
            Raster::new("s1", radar, gt, "EPSG:32633", None).unwrap(),
            Raster::new("s2", optical, gt, "EPSG:32633", None).unwrap(),
            Raster::from_band("dem", dem, gt, "EPSG:32633", None).unwrap(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_reflect_index() {
        assert_eq!(reflect_index(-1, 5), 0);
        assert_eq!(reflect_index(-2, 5), 1);
        assert_eq!(reflect_index(5, 5), 4);
        assert_eq!(reflect_index(6, 5), 3);
        assert_eq!(reflect_index(2, 5), 2);
        assert_eq!(reflect_index(-3, 1), 0);
    }

    #[test]
    fn test_window_statistics_constant_image() {
        let image = Array2::from_elem((6, 6), 3.0f32);
        let (mean, var) = window_statistics(&image.view(), 5);
        assert!(mean.iter().all(|&m| (m - 3.0).abs() < 1e-6));
        assert!(var.iter().all(|&v| v.abs() < 1e-9));
    }

    #[test]
    fn test_window_statistics_reflected_corner() {
        // 3x3 window at (0,0) with half-sample reflection sees rows/cols {0,0,1}
        let image = Array2::from_shape_vec((2, 2), vec![1.0f32, 2.0, 3.0, 4.0]).unwrap();
        let (mean, _) = window_statistics(&image.view(), 3);
        // samples: 1,1,2 / 1,1,2 / 3,3,4 -> 18 / 9
        assert_abs_diff_eq!(mean[[0, 0]], 2.0, epsilon = 1e-6);
    }

    #[test]
    fn test_slope_of_tilted_plane() {
        // dz/dx = 1 m per 10 m pixel -> 0.1 -> atan(0.1) in degrees
        let dem = Array2::from_shape_fn((5, 5), |(_, j)| j as f32);
        let (gx, gy) = gradient(&dem, (10.0, 10.0));
        assert_abs_diff_eq!(gx[[2, 2]], 0.1, epsilon = 1e-6);
        assert_abs_diff_eq!(gy[[2, 2]], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(gx[[2, 0]], 0.1, epsilon = 1e-6);
    }

    #[test]
    fn test_aspect_wrapped_into_range() {
        assert!(wrap_angle(-1e-12) < TAU);
        assert_abs_diff_eq!(wrap_angle(-std::f32::consts::FRAC_PI_2), 1.5 * std::f32::consts::PI, epsilon = 1e-6);
        assert_eq!(wrap_angle(0.0), 0.0);
    }

    #[test]
    fn test_laplacian_of_paraboloid() {
        let dem = Array2::from_shape_fn((7, 7), |(i, j)| {
            let x = j as f32;
            let y = i as f32;
            x * x + y * y
        });
        let lap = laplacian(&dem, (1.0, 1.0));
        assert_abs_diff_eq!(lap[[3, 3]], 4.0, epsilon = 1e-4);
    }

    #[test]
    fn test_normalized_difference_zero_denominator() {
        let a = Array2::from_elem((1, 2), 0.0f32);
        let b = Array2::from_elem((1, 2), 0.0f32);
        let nd = normalized_difference(&a.view(), &b.view());
        assert_eq!(nd[[0, 0]], 0.0);

        let a = Array2::from_elem((1, 1), 0.6f32);
        let b = Array2::from_elem((1, 1), 0.2f32);
        assert_abs_diff_eq!(normalized_difference(&a.view(), &b.view())[[0, 0]], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_ratio_floors_vh() {
        let config = FeatureConfig {
            bands: vec![FeatureBand::VvVhRatio],
            radar_scale: RadarScale::Linear,
            ..FeatureConfig::default()
        };
        let gt = GeoTransform::north_up(0.0, 100.0, 10.0, 10.0);
        let mut radar = Array3::from_elem((2, 4, 4), 0.5f32);
        radar.index_axis_mut(Axis(0), 1).fill(0.0);
        let tile = Tile::new(
            "ratio",
            Raster::new("s1", radar, gt, "EPSG:32633", None).unwrap(),
            Raster::new("s2", Array3::from_elem((3, 4, 4), 0.1), gt, "EPSG:32633", None).unwrap(),
            Raster::from_band("dem", Array2::zeros((4, 4)), gt, "EPSG:32633", None).unwrap(),
            None,
        )
        .unwrap();

        let stack = extract(&tile, &config).unwrap();
        let ratio = stack.band(FeatureBand::VvVhRatio).unwrap();
        assert_abs_diff_eq!(ratio[[0, 0]], 0.5 / 1e-9, epsilon = 1.0);
        assert_eq!(stack.valid_pixel_count(), 16);
    }

    #[test]
    fn test_band_order_follows_config() {
        let config = FeatureConfig {
            bands: vec![FeatureBand::Slope, FeatureBand::Ndvi, FeatureBand::VvVhRatio],
            ..FeatureConfig::default()
        };
        let stack = extract(&synthetic_tile(12, 9), &config).unwrap();
        assert_eq!(stack.bands(), &[FeatureBand::Slope, FeatureBand::Ndvi, FeatureBand::VvVhRatio]);
        assert_eq!(stack.shape(), (12, 9));
    }

    #[test]
    fn test_extract_is_bit_identical_across_runs() {
        let tile = synthetic_tile(40, 30);
        let config = FeatureConfig::default();
        let a = extract(&tile, &config).unwrap();
        let b = extract(&tile, &config).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_blocked_matches_single_block() {
        let tile = synthetic_tile(37, 21);
        let whole = extract(
            &tile,
            &FeatureConfig {
                block_rows: 1000,
                ..FeatureConfig::default()
            },
        )
        .unwrap();

        for block_rows in [1, 4, 7, 16] {
            let blocked = extract(
                &tile,
                &FeatureConfig {
                    block_rows,
                    ..FeatureConfig::default()
                },
            )
            .unwrap();
            assert_eq!(whole, blocked, "block_rows = {}", block_rows);
        }
    }

    #[test]
    fn test_nodata_pixels_are_masked() {
        let gt = GeoTransform::north_up(0.0, 100.0, 10.0, 10.0);
        let mut dem = Array2::from_elem((10, 10), 50.0f32);
        dem[[5, 5]] = -32768.0;
        let tile = Tile::new(
            "holes",
            Raster::new("s1", Array3::from_elem((2, 10, 10), -10.0), gt, "EPSG:32633", None).unwrap(),
            Raster::new("s2", Array3::from_elem((3, 10, 10), 0.2), gt, "EPSG:32633", None).unwrap(),
            Raster::from_band("dem", dem, gt, "EPSG:32633", Some(-32768.0)).unwrap(),
            None,
        )
        .unwrap();
        let config = FeatureConfig {
            bands: vec![FeatureBand::Slope, FeatureBand::Brightness],
            ..FeatureConfig::default()
        };

        let stack = extract(&tile, &config).unwrap();
        assert!(stack.mask()[[5, 5]]);
        assert!(stack.mask()[[5, 4]]);
        assert!(!stack.mask()[[0, 0]]);
        assert!(stack.data().iter().all(|v| v.is_finite()));
        assert_eq!(stack.masked_counts()[1], 0);
    }

    /// Source whose optical slabs are one column short
    struct NarrowOptical(Tile);

    impl TileSource for NarrowOptical {
        fn grid(&self) -> TileGrid {
            self.0.grid()
        }

        fn read_rows(&self, rows: Range<usize>) -> FusionResult<TileSlab> {
            let mut slab = self.0.read_rows(rows)?;
            let cols = slab.optical.dim().2;
            slab.optical = slab.optical.slice(s![.., .., ..cols - 1]).to_owned();
            Ok(slab)
        }
    }

    #[test]
    fn test_misshaped_source_is_an_error() {
        let source = NarrowOptical(synthetic_tile(10, 10));
        let result = FeatureExtractor::new(FeatureConfig::default())
            .unwrap()
            .extract_from_source(&source);
        match result {
            Err(FusionError::GridMismatch { raster, .. }) => assert_eq!(raster, "optical"),
            other => panic!("expected GridMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_window_size() {
        let config = FeatureConfig {
            window_size: 4,
            ..FeatureConfig::default()
        };
        assert!(matches!(
            FeatureExtractor::new(config),
            Err(FusionError::InvalidParameter { .. })
        ));
    }
}
