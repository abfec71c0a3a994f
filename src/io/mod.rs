//! Raster access and product writers

pub mod raster_reader;
pub mod tile_source;
pub mod writer;

pub use raster_reader::{GdalTileProvider, RasterReader, TileProvider};
pub use tile_source::{GdalTileSource, TileGrid, TileSlab, TileSource};
pub use writer::ExportWriter;
