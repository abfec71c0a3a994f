//! Engine asset encoding: 16-bit height buffers and 8-bit textures.

use crate::core::anomaly::percentile;
use crate::types::{BoundingBox, FusionError, FusionResult, Raster};
use ndarray::{Array2, Array3, ArrayView2, Axis, Zip};
use serde::{Deserialize, Serialize};

/// Largest encoded height value
pub const HEIGHT_LEVELS: f64 = 65535.0;

/// Keys cubic convolution parameter
const CUBIC_A: f64 = -0.5;

/// Stretch percentiles for sRGB base imagery
const STRETCH_LOW: f64 = 2.0;
const STRETCH_HIGH: f64 = 98.0;

/// Colour space of an 8-bit texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColorSpace {
    /// Gamma-encoded base imagery
    Srgb,
    /// Raw values, used for data overlays
    Linear,
}

impl std::fmt::Display for ColorSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColorSpace::Srgb => write!(f, "SRGB"),
            ColorSpace::Linear => write!(f, "LINEAR"),
        }
    }
}

/// Square 16-bit height grid plus the range needed to decode it
#[derive(Debug, Clone)]
pub struct HeightBuffer {
    pub data: Array2<u16>,
    pub min_elevation: f64,
    pub max_elevation: f64,
}

impl HeightBuffer {
    pub fn size(&self) -> usize {
        self.data.nrows()
    }

    /// Elevation represented by one 16-bit step
    pub fn step(&self) -> f64 {
        (self.max_elevation - self.min_elevation) / HEIGHT_LEVELS
    }

    /// Inverse of the height encoding
    pub fn decode(&self) -> Array2<f64> {
        let step = self.step();
        self.data.mapv(|v| self.min_elevation + v as f64 * step)
    }
}

/// 8-bit texture, channels x rows x cols
#[derive(Debug, Clone)]
pub struct TextureBuffer {
    pub data: Array3<u8>,
    pub color_space: ColorSpace,
}

impl TextureBuffer {
    pub fn size(&self) -> usize {
        self.data.len_of(Axis(1))
    }

    pub fn channels(&self) -> usize {
        self.data.len_of(Axis(0))
    }
}

/// Placement metadata for the downstream terrain import
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetMetadata {
    /// Provenance identifier of the source tile
    pub source_id: String,
    pub crs: String,
    pub bbox: BoundingBox,
    pub pixel_size_x: f64,
    pub pixel_size_y: f64,
    pub source_width: usize,
    pub source_height: usize,
    pub target_width: usize,
    pub target_height: usize,
    pub min_elevation: f64,
    pub max_elevation: f64,
    /// Vertical units per encoded step, exaggeration included
    pub z_scale: f64,
    pub vertical_exaggeration: f64,
}

/// Height grids must be 2^k + 1 samples on a side, at least 65
pub fn is_valid_target_size(size: usize) -> bool {
    size >= 65 && (size - 1).is_power_of_two()
}

pub fn is_valid_texture_size(size: usize) -> bool {
    size.is_power_of_two()
}

/// Encode an elevation raster as a square 16-bit height buffer.
///
/// The range comes from the source's valid pixels, so resampling overshoot
/// never widens it. Nodata is filled with the minimum before resampling.
pub fn encode_height(
    elevation: &Raster,
    target_size: usize,
    vertical_exaggeration: f64,
) -> FusionResult<(HeightBuffer, AssetMetadata)> {
    if !is_valid_target_size(target_size) {
        return Err(FusionError::InvalidTargetSize(target_size));
    }
    if !(vertical_exaggeration.is_finite() && vertical_exaggeration > 0.0) {
        return Err(FusionError::InvalidParameter {
            name: "vertical_exaggeration".to_string(),
            reason: format!("must be positive, got {}", vertical_exaggeration),
        });
    }

    let band = elevation.band(0);
    let (min_elev, max_elev) = band
        .iter()
        .filter(|&&v| elevation.is_valid_sample(v))
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v as f64), hi.max(v as f64))
        });
    if min_elev > max_elev {
        return Err(FusionError::InsufficientValidPixels {
            raster: elevation.name().to_string(),
            valid_fraction: 0.0,
            threshold: 0.0,
        });
    }

    let (rows, cols) = elevation.shape();
    log::info!(
        "Encoding height buffer: {}x{} -> {}x{}, range [{:.3}, {:.3}], exaggeration {}",
        cols,
        rows,
        target_size,
        target_size,
        min_elev,
        max_elev,
        vertical_exaggeration
    );

    let filled = band.mapv(|v| {
        if elevation.is_valid_sample(v) {
            v as f64
        } else {
            min_elev
        }
    });
    let resampled = resample_cubic(filled.view(), target_size, target_size);

    let range = max_elev - min_elev;
    let data = resampled.mapv(|e| {
        if range > 0.0 {
            ((e - min_elev) / range * HEIGHT_LEVELS).round().clamp(0.0, HEIGHT_LEVELS) as u16
        } else {
            0
        }
    });
    let z_scale = range / HEIGHT_LEVELS * vertical_exaggeration;
    if range == 0.0 {
        log::warn!("Flat elevation raster '{}': height buffer is all zero", elevation.name());
    }

    let (pixel_size_x, pixel_size_y) = elevation.pixel_size();
    let metadata = AssetMetadata {
        source_id: elevation.name().to_string(),
        crs: elevation.crs().to_string(),
        bbox: elevation.bounds(),
        pixel_size_x,
        pixel_size_y,
        source_width: cols,
        source_height: rows,
        target_width: target_size,
        target_height: target_size,
        min_elevation: min_elev,
        max_elevation: max_elev,
        z_scale,
        vertical_exaggeration,
    };
    log::debug!("Height metadata: {:?}", metadata);

    Ok((
        HeightBuffer {
            data,
            min_elevation: min_elev,
            max_elevation: max_elev,
        },
        metadata,
    ))
}

/// Encode a raster as a square 8-bit texture.
///
/// One band gives a single-channel texture, three or more give RGB from the
/// first three bands.
pub fn encode_texture(raster: &Raster, size: usize, color_space: ColorSpace) -> FusionResult<TextureBuffer> {
    let bands: Vec<usize> = match raster.band_count() {
        1 => vec![0],
        2 => {
            return Err(FusionError::InvalidFormat(format!(
                "Texture source '{}' has 2 bands; expected 1 or at least 3",
                raster.name()
            )))
        }
        _ => vec![0, 1, 2],
    };
    encode_texture_bands(raster, &bands, size, color_space)
}

/// Encode the given bands of a raster, in order, as texture channels
pub fn encode_texture_bands(
    raster: &Raster,
    bands: &[usize],
    size: usize,
    color_space: ColorSpace,
) -> FusionResult<TextureBuffer> {
    if !is_valid_texture_size(size) {
        return Err(FusionError::InvalidTextureSize(size));
    }
    if let Some(&bad) = bands.iter().find(|&&b| b >= raster.band_count()) {
        return Err(FusionError::InvalidParameter {
            name: "texture band".to_string(),
            reason: format!("band {} not in '{}' ({} bands)", bad, raster.name(), raster.band_count()),
        });
    }
    log::info!(
        "Encoding {} texture '{}': {} channel(s) at {}x{}",
        color_space,
        raster.name(),
        bands.len(),
        size,
        size
    );

    let mut data = Array3::<u8>::zeros((bands.len(), size, size));
    for (channel, &b) in bands.iter().enumerate() {
        let band = raster
            .band(b)
            .mapv(|v| if raster.is_valid_sample(v) { v as f64 } else { f64::NAN });
        let resampled = resample_bilinear(band.view(), size, size);

        let to_byte: Box<dyn Fn(f64) -> f64> = match color_space {
            ColorSpace::Linear => Box::new(|v: f64| v.clamp(0.0, 1.0)),
            ColorSpace::Srgb => {
                let (lo, hi) = stretch_limits(&band);
                let span = hi - lo;
                Box::new(move |v: f64| {
                    let stretched = if span > 0.0 { ((v - lo) / span).clamp(0.0, 1.0) } else { 0.0 };
                    srgb_oetf(stretched)
                })
            }
        };

        Zip::from(data.index_axis_mut(Axis(0), channel))
            .and(&resampled)
            .for_each(|out, &v| {
                *out = if v.is_nan() { 0 } else { (to_byte(v) * 255.0).round() as u8 };
            });
    }

    Ok(TextureBuffer { data, color_space })
}

/// Linear-light to sRGB transfer function
pub fn srgb_oetf(linear: f64) -> f64 {
    if linear <= 0.003_130_8 {
        12.92 * linear
    } else {
        1.055 * linear.powf(1.0 / 2.4) - 0.055
    }
}

fn stretch_limits(band: &Array2<f64>) -> (f64, f64) {
    let mut values: Vec<f64> = band.iter().copied().filter(|v| v.is_finite()).collect();
    if values.is_empty() {
        return (0.0, 0.0);
    }
    values.sort_by(|a, b| a.total_cmp(b));
    (percentile(&values, STRETCH_LOW), percentile(&values, STRETCH_HIGH))
}

fn cubic_weight(t: f64) -> f64 {
    let t = t.abs();
    if t <= 1.0 {
        ((CUBIC_A + 2.0) * t - (CUBIC_A + 3.0)) * t * t + 1.0
    } else if t < 2.0 {
        ((CUBIC_A * t - 5.0 * CUBIC_A) * t + 8.0 * CUBIC_A) * t - 4.0 * CUBIC_A
    } else {
        0.0
    }
}

/// Source coordinate of an output sample with corners mapped onto corners
fn source_coordinate(index: usize, out_len: usize, in_len: usize) -> f64 {
    if out_len <= 1 {
        0.0
    } else {
        index as f64 * (in_len - 1) as f64 / (out_len - 1) as f64
    }
}

/// Bicubic (Keys, a = -0.5) resampling with clamped edges
pub fn resample_cubic(src: ArrayView2<f64>, out_rows: usize, out_cols: usize) -> Array2<f64> {
    let (rows, cols) = src.dim();
    let mut out = Array2::zeros((out_rows, out_cols));

    let sample = |(i, j): (usize, usize), value: &mut f64| {
        let y = source_coordinate(i, out_rows, rows);
        let x = source_coordinate(j, out_cols, cols);
        let y0 = y.floor() as isize;
        let x0 = x.floor() as isize;

        let mut acc = 0.0;
        for m in -1..=2isize {
            let wy = cubic_weight(y - (y0 + m) as f64);
            if wy == 0.0 {
                continue;
            }
            let r = (y0 + m).clamp(0, rows as isize - 1) as usize;
            for n in -1..=2isize {
                let wx = cubic_weight(x - (x0 + n) as f64);
                if wx == 0.0 {
                    continue;
                }
                let c = (x0 + n).clamp(0, cols as isize - 1) as usize;
                acc += wy * wx * src[[r, c]];
            }
        }
        *value = acc;
    };

    #[cfg(feature = "parallel")]
    Zip::indexed(&mut out).par_for_each(sample);

    #[cfg(not(feature = "parallel"))]
    Zip::indexed(&mut out).for_each(sample);

    out
}

/// Bilinear resampling with corners mapped onto corners
pub fn resample_bilinear(src: ArrayView2<f64>, out_rows: usize, out_cols: usize) -> Array2<f64> {
    let (rows, cols) = src.dim();
    let mut out = Array2::zeros((out_rows, out_cols));

    let sample = |(i, j): (usize, usize), value: &mut f64| {
        let y = source_coordinate(i, out_rows, rows);
        let x = source_coordinate(j, out_cols, cols);
        let y1 = (y.floor() as usize).min(rows - 1);
        let x1 = (x.floor() as usize).min(cols - 1);
        let y2 = (y1 + 1).min(rows - 1);
        let x2 = (x1 + 1).min(cols - 1);
        let dy = y - y1 as f64;
        let dx = x - x1 as f64;

        *value = src[[y1, x1]] * (1.0 - dx) * (1.0 - dy)
            + src[[y1, x2]] * dx * (1.0 - dy)
            + src[[y2, x1]] * (1.0 - dx) * dy
            + src[[y2, x2]] * dx * dy;
        // Exact grid hits skip neighbours with zero weight
        if value.is_nan() && dx == 0.0 && dy == 0.0 {
            *value = src[[y1, x1]];
        }
    };

    #[cfg(feature = "parallel")]
    Zip::indexed(&mut out).par_for_each(sample);

    #[cfg(not(feature = "parallel"))]
    Zip::indexed(&mut out).for_each(sample);

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GeoTransform;
    use approx::assert_abs_diff_eq;
    use ndarray::Array3;

    fn elevation(data: Array2<f32>) -> Raster {
        let gt = GeoTransform::north_up(500_000.0, 4_000_000.0, 30.0, 30.0);
        Raster::from_band("dem", data, gt, "EPSG:32633", Some(-9999.0)).unwrap()
    }

    fn ramp(rows: usize, cols: usize, lo: f32, hi: f32) -> Array2<f32> {
        Array2::from_shape_fn((rows, cols), |(_, c)| lo + (hi - lo) * c as f32 / (cols - 1) as f32)
    }

    #[test]
    fn test_target_size_validation() {
        for size in [65, 129, 257, 513, 1025, 2049, 4097, 8193] {
            assert!(is_valid_target_size(size), "{}", size);
        }
        for size in [0, 1, 2, 33, 64, 1024, 4096] {
            assert!(!is_valid_target_size(size), "{}", size);
        }
    }

    #[test]
    fn test_rejects_4096_accepts_4097() {
        let raster = elevation(ramp(8, 8, 0.0, 10.0));
        assert!(matches!(
            encode_height(&raster, 4096, 1.0),
            Err(FusionError::InvalidTargetSize(4096))
        ));
        let (buffer, meta) = encode_height(&raster, 4097, 1.0).unwrap();
        assert_eq!(buffer.size(), 4097);
        assert_eq!(meta.target_width, 4097);
    }

    #[test]
    fn test_round_trip_extremes() {
        let raster = elevation(ramp(16, 16, 100.0, 200.0));
        let (buffer, meta) = encode_height(&raster, 65, 1.0).unwrap();
        assert_eq!(meta.min_elevation, 100.0);
        assert_eq!(meta.max_elevation, 200.0);

        let decoded = buffer.decode();
        let step = buffer.step();
        assert_abs_diff_eq!(decoded[[0, 0]], 100.0, epsilon = step);
        assert_abs_diff_eq!(decoded[[64, 64]], 200.0, epsilon = step);
        assert_eq!(buffer.data[[10, 0]], 0);
        assert_eq!(buffer.data[[10, 64]], 65535);
    }

    #[test]
    fn test_z_scale_scenario() {
        let raster = elevation(ramp(100, 100, 145.3, 892.7));
        let (buffer, meta) = encode_height(&raster, 1025, 2.0).unwrap();

        let expected = (meta.max_elevation - meta.min_elevation) / 65535.0 * 2.0;
        assert_eq!(meta.z_scale, expected);
        assert_abs_diff_eq!(meta.z_scale, 0.022_81, epsilon = 1e-5);
        assert_eq!((meta.source_width, meta.source_height), (100, 100));
        assert_eq!(meta.crs, "EPSG:32633");
        assert_eq!(meta.pixel_size_x, 30.0);

        let decoded = buffer.decode();
        let lo = decoded.iter().cloned().fold(f64::INFINITY, f64::min);
        let hi = decoded.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        assert_abs_diff_eq!(lo, 145.3, epsilon = 1e-3);
        assert_abs_diff_eq!(hi, 892.7, epsilon = 1e-3);
    }

    #[test]
    fn test_nodata_excluded_from_range() {
        let mut data = ramp(8, 8, 10.0, 20.0);
        data[[3, 3]] = -9999.0;
        let (_, meta) = encode_height(&elevation(data), 65, 1.0).unwrap();
        assert_eq!(meta.min_elevation, 10.0);
    }

    #[test]
    fn test_flat_elevation() {
        let (buffer, meta) = encode_height(&elevation(Array2::from_elem((4, 4), 50.0)), 65, 2.0).unwrap();
        assert_eq!(meta.z_scale, 0.0);
        assert!(buffer.data.iter().all(|&v| v == 0));
    }

    #[test]
    fn test_cubic_reproduces_grid_points() {
        let src = Array2::from_shape_fn((5, 5), |(r, c)| (r * 5 + c) as f64);
        let out = resample_cubic(src.view(), 9, 9);
        assert_abs_diff_eq!(out[[2, 2]], src[[1, 1]], epsilon = 1e-12);
        assert_abs_diff_eq!(out[[8, 8]], src[[4, 4]], epsilon = 1e-12);
        // Linear data stays linear between samples
        assert_abs_diff_eq!(out[[4, 3]], 11.5, epsilon = 1e-9);
    }

    #[test]
    fn test_texture_sizes() {
        let gt = GeoTransform::north_up(0.0, 0.0, 10.0, 10.0);
        let rgb = Raster::new("s2", Array3::from_elem((3, 10, 10), 0.25), gt, "EPSG:32633", None).unwrap();
        let texture = encode_texture(&rgb, 64, ColorSpace::Srgb).unwrap();
        assert_eq!(texture.channels(), 3);
        assert_eq!(texture.size(), 64);
        assert!(matches!(
            encode_texture(&rgb, 100, ColorSpace::Srgb),
            Err(FusionError::InvalidTextureSize(100))
        ));

        let two = Raster::new("x", Array3::zeros((2, 4, 4)), gt, "EPSG:32633", None).unwrap();
        assert!(encode_texture(&two, 16, ColorSpace::Linear).is_err());
    }

    #[test]
    fn test_linear_overlay_values() {
        let gt = GeoTransform::north_up(0.0, 0.0, 10.0, 10.0);
        let scores = Array2::from_shape_fn((2, 2), |(r, c)| [[0.0, 0.5], [1.0, 2.0]][r][c]);
        let overlay = Raster::from_band("anomaly", scores, gt, "EPSG:32633", None).unwrap();
        let texture = encode_texture(&overlay, 2, ColorSpace::Linear).unwrap();
        assert_eq!(texture.channels(), 1);
        assert_eq!(texture.data[[0, 0, 0]], 0);
        assert_eq!(texture.data[[0, 0, 1]], 128);
        assert_eq!(texture.data[[0, 1, 0]], 255);
        assert_eq!(texture.data[[0, 1, 1]], 255);
    }

    #[test]
    fn test_srgb_transfer() {
        assert_eq!(srgb_oetf(0.0), 0.0);
        assert_abs_diff_eq!(srgb_oetf(1.0), 1.0, epsilon = 1e-12);
        assert!(srgb_oetf(0.2) > 0.2);
    }
}
