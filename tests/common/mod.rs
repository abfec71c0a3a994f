#![allow(dead_code)]

use geofuse::config::PipelineConfig;
use geofuse::io::writer::ExportWriter;
use geofuse::{GeoTransform, Raster, Tile};
use ndarray::{Array2, Array3, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};

pub const CRS: &str = "EPSG:32633";

/// Rows/cols of the injected anomaly patch
pub const PATCH_ROWS: std::ops::Range<usize> = 20..24;
pub const PATCH_COLS: std::ops::Range<usize> = 30..34;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn geo_transform(rows: usize) -> GeoTransform {
    GeoTransform::north_up(500_000.0, 4_000_000.0 + rows as f64 * 10.0, 10.0, 10.0)
}

fn in_patch(r: usize, c: usize) -> bool {
    PATCH_ROWS.contains(&r) && PATCH_COLS.contains(&c)
}

/// Radar in dB, reflectance optical, smooth hilly DEM, plus one bright patch
pub fn synthetic_tile(id: &str, rows: usize, cols: usize, seed: u64) -> Tile {
    let mut rng = StdRng::seed_from_u64(seed);
    let gt = geo_transform(rows);

    let radar = Array3::from_shape_fn((2, rows, cols), |(b, r, c)| {
        let base = if b == 0 { -10.0 } else { -17.0 };
        if in_patch(r, c) {
            base + 15.0
        } else {
            base + rng.gen_range(-1.0..1.0)
        }
    });
    let optical = Array3::from_shape_fn((4, rows, cols), |(b, r, c)| {
        if in_patch(r, c) {
            0.95
        } else {
            0.05 + 0.05 * b as f32 + rng.gen_range(0.0..0.03)
        }
    });
    let dem = Array2::from_shape_fn((rows, cols), |(r, c)| {
        200.0 + 50.0 * (r as f32 / 10.0).sin() * (c as f32 / 10.0).cos() + rng.gen_range(0.0..0.5)
    });

    Tile::new(
        id,
        Raster::new("radar", radar, gt, CRS, None).unwrap(),
        Raster::new("optical", optical, gt, CRS, None).unwrap(),
        Raster::from_band("elevation", dem, gt, CRS, Some(-9999.0)).unwrap(),
        None,
    )
    .unwrap()
}

/// Small sizes so tests stay fast
pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.anomaly.n_estimators = 50;
    config.export.target_size = 65;
    config.export.texture_size = 64;
    config
}

/// Write every band of a raster to a GeoTIFF
pub fn write_raster(dir: &Path, file_name: &str, raster: &Raster) -> PathBuf {
    let writer = ExportWriter::new(dir).unwrap();
    let names: Vec<String> = (0..raster.band_count()).map(|b| format!("band_{}", b + 1)).collect();
    let bands: Vec<_> = raster
        .data()
        .axis_iter(Axis(0))
        .zip(&names)
        .map(|(band, name)| (name.as_str(), band))
        .collect();
    writer
        .write_geotiff(
            file_name,
            &bands,
            raster.geo_transform(),
            raster.crs(),
            raster.nodata().map(f64::from),
        )
        .unwrap()
}
