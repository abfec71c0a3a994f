use crate::core::encode::{HeightBuffer, TextureBuffer};
use crate::types::{FusionError, FusionResult, GeoTransform};
use gdal::raster::{Buffer, GdalType};
use gdal::spatial_ref::SpatialRef;
use gdal::{Dataset, DriverManager, Metadata};
use ndarray::{ArrayView2, Axis};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Writes pipeline products into one output directory
#[derive(Debug, Clone)]
pub struct ExportWriter {
    output_dir: PathBuf,
}

impl ExportWriter {
    pub fn new<P: AsRef<Path>>(output_dir: P) -> FusionResult<Self> {
        let output_dir = output_dir.as_ref().to_path_buf();
        fs::create_dir_all(&output_dir)?;
        Ok(Self { output_dir })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Float32 GeoTIFF, one band per named image
    pub fn write_geotiff(
        &self,
        file_name: &str,
        bands: &[(&str, ArrayView2<f32>)],
        geo_transform: &GeoTransform,
        crs: &str,
        nodata: Option<f64>,
    ) -> FusionResult<PathBuf> {
        let path = self.output_dir.join(file_name);
        log::info!("Writing GeoTIFF: {}", path.display());

        let (height, width) = match bands.first() {
            Some((_, image)) => image.dim(),
            None => return Err(FusionError::Processing(format!("No bands to write to {}", file_name))),
        };
        if let Some((name, image)) = bands.iter().find(|(_, image)| image.dim() != (height, width)) {
            return Err(FusionError::Processing(format!(
                "Band '{}' has shape {:?}, expected {:?}",
                name,
                image.dim(),
                (height, width)
            )));
        }

        let driver = DriverManager::get_driver_by_name("GTiff")?;
        let mut dataset =
            driver.create_with_band_type::<f32, _>(&path, width as isize, height as isize, bands.len() as isize)?;
        dataset.set_geo_transform(&geo_transform.to_gdal())?;
        if !crs.is_empty() {
            dataset.set_spatial_ref(&SpatialRef::from_definition(crs)?)?;
        }

        for (i, (name, image)) in bands.iter().enumerate() {
            let mut rasterband = dataset.rasterband(i as isize + 1)?;
            let buffer = Buffer::new((width, height), image.iter().copied().collect());
            rasterband.write((0, 0), (width, height), &buffer)?;
            rasterband.set_description(name)?;
            if let Some(value) = nodata {
                rasterband.set_no_data_value(Some(value))?;
            }
        }

        Ok(path)
    }

    /// Single-channel 16-bit PNG of a height buffer
    pub fn write_height_png(&self, file_name: &str, height: &HeightBuffer) -> FusionResult<PathBuf> {
        let path = self.output_dir.join(file_name);
        log::info!("Writing 16-bit height PNG: {}", path.display());

        let size = height.size();
        let planes = vec![height.data.iter().copied().collect::<Vec<u16>>()];
        write_png(&path, (size, size), planes)?;
        Ok(path)
    }

    /// 8-bit PNG with one plane per texture channel
    pub fn write_texture_png(&self, file_name: &str, texture: &TextureBuffer) -> FusionResult<PathBuf> {
        let path = self.output_dir.join(file_name);
        log::info!(
            "Writing {}-channel {} texture PNG: {}",
            texture.channels(),
            texture.color_space,
            path.display()
        );

        let size = texture.size();
        let planes: Vec<Vec<u8>> = texture
            .data
            .axis_iter(Axis(0))
            .map(|plane| plane.iter().copied().collect())
            .collect();
        write_png(&path, (size, size), planes)?;
        Ok(path)
    }

    /// Pretty-printed JSON document
    pub fn write_manifest<T: Serialize>(&self, file_name: &str, manifest: &T) -> FusionResult<PathBuf> {
        let path = self.output_dir.join(file_name);
        log::info!("Writing manifest: {}", path.display());
        fs::write(&path, serde_json::to_string_pretty(manifest)?)?;
        Ok(path)
    }
}

/// PNG has no create() in GDAL; build in memory and copy
fn write_png<T: GdalType + Copy>(path: &Path, (width, height): (usize, usize), planes: Vec<Vec<T>>) -> FusionResult<()> {
    let mem = DriverManager::get_driver_by_name("MEM")?;
    let mut dataset: Dataset =
        mem.create_with_band_type::<T, _>("", width as isize, height as isize, planes.len() as isize)?;
    for (i, plane) in planes.into_iter().enumerate() {
        let mut rasterband = dataset.rasterband(i as isize + 1)?;
        rasterband.write((0, 0), (width, height), &Buffer::new((width, height), plane))?;
    }

    let png = DriverManager::get_driver_by_name("PNG")?;
    dataset.create_copy(&png, path, &[])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::encode::ColorSpace;
    use crate::io::raster_reader::RasterReader;
    use ndarray::{Array2, Array3};
    use tempfile::TempDir;

    #[test]
    fn test_geotiff_round_trip() {
        let dir = TempDir::new().unwrap();
        let writer = ExportWriter::new(dir.path()).unwrap();
        let gt = GeoTransform::north_up(500_000.0, 4_000_000.0, 10.0, 10.0);
        let a = Array2::from_shape_fn((6, 8), |(r, c)| (r * 8 + c) as f32);
        let b = Array2::from_elem((6, 8), 0.5f32);

        let path = writer
            .write_geotiff("stack.tif", &[("slope", a.view()), ("ndvi", b.view())], &gt, "EPSG:32633", None)
            .unwrap();

        let reader = RasterReader::open(&path).unwrap();
        assert_eq!(reader.size(), (8, 6));
        assert_eq!(reader.band_count(), 2);
        assert_eq!(reader.crs().unwrap(), "EPSG:32633");
        assert_eq!(reader.geo_transform().unwrap(), gt);

        let block = reader.read_window(0..6).unwrap();
        assert_eq!(block[[0, 5, 7]], 47.0);
        assert_eq!(block[[1, 2, 2]], 0.5);
    }

    #[test]
    fn test_png_outputs() {
        let dir = TempDir::new().unwrap();
        let writer = ExportWriter::new(dir.path().join("nested")).unwrap();

        let height = HeightBuffer {
            data: Array2::from_shape_fn((65, 65), |(r, _)| (r * 1000) as u16),
            min_elevation: 0.0,
            max_elevation: 1.0,
        };
        let path = writer.write_height_png("heightmap_16bit.png", &height).unwrap();
        let dataset = Dataset::open(&path).unwrap();
        assert_eq!(dataset.raster_size(), (65, 65));
        let band = dataset.rasterband(1).unwrap();
        let values = band.read_as::<u16>((0, 0), (65, 65), (65, 65), None).unwrap();
        assert_eq!(values.data[64 * 65], 64_000);

        let texture = TextureBuffer {
            data: Array3::from_elem((3, 16, 16), 200u8),
            color_space: ColorSpace::Srgb,
        };
        let path = writer.write_texture_png("texture_rgb_16.png", &texture).unwrap();
        assert_eq!(Dataset::open(&path).unwrap().raster_count(), 3);
    }

    #[test]
    fn test_manifest_json() {
        let dir = TempDir::new().unwrap();
        let writer = ExportWriter::new(dir.path()).unwrap();
        let path = writer.write_manifest("meta.json", &serde_json::json!({"tile_id": "t1"})).unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["tile_id"], "t1");
    }
}
