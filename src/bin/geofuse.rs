use anyhow::{Context, Result};
use clap::Parser;
use geofuse::core::classify::TrainingLabels;
use geofuse::core::pipeline::FusionPipeline;
use geofuse::io::raster_reader::RasterReader;
use geofuse::io::tile_source::GdalTileSource;
use geofuse::PipelineConfig;
use log::info;
use std::path::{Path, PathBuf};

/// Fuse radar, optical and elevation rasters into anomaly maps and terrain assets
#[derive(Parser, Debug)]
#[command(name = "geofuse", version)]
struct Args {
    /// Radar GeoTIFF (VV, VH)
    #[arg(long)]
    radar: PathBuf,

    /// Optical reflectance GeoTIFF (3+ bands)
    #[arg(long)]
    optical: PathBuf,

    /// Elevation GeoTIFF (metres)
    #[arg(long)]
    dem: PathBuf,

    #[arg(long)]
    hyperspectral: Option<PathBuf>,

    /// Single-band class raster; negative or nodata pixels are unlabelled
    #[arg(long)]
    labels: Option<PathBuf>,

    #[arg(long)]
    output_dir: PathBuf,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "tile_001")]
    tile_id: String,

    #[arg(long)]
    contamination: Option<f64>,

    #[arg(long)]
    n_estimators: Option<usize>,

    #[arg(long)]
    target_size: Option<usize>,

    #[arg(long)]
    vertical_exaggeration: Option<f64>,

    #[arg(long)]
    texture_size: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    /// Worker threads (default: all cores)
    #[arg(long)]
    jobs: Option<usize>,
}

impl Args {
    fn config(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_json_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => PipelineConfig::default(),
        };

        if let Some(v) = self.contamination {
            config.anomaly.contamination = v;
        }
        if let Some(v) = self.n_estimators {
            config.anomaly.n_estimators = v;
        }
        if let Some(v) = self.target_size {
            config.export.target_size = v;
        }
        if let Some(v) = self.vertical_exaggeration {
            config.export.vertical_exaggeration = v;
        }
        if let Some(v) = self.texture_size {
            config.export.texture_size = v;
        }
        if let Some(v) = self.seed {
            config.random_seed = v;
        }
        Ok(config)
    }
}

fn load_labels(path: &Path) -> Result<TrainingLabels> {
    let raster = RasterReader::open(path)?.read_raster("labels")?;
    let labels = raster.band(0).mapv(|v| {
        if raster.is_valid_sample(v) && v >= 0.0 {
            v.round() as i32
        } else {
            -1
        }
    });
    Ok(TrainingLabels::new(labels)?)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if let Some(jobs) = args.jobs {
        rayon::ThreadPoolBuilder::new().num_threads(jobs).build_global()?;
    }

    let pipeline = FusionPipeline::new(args.config()?)?;
    let mut source = GdalTileSource::open(&args.radar, &args.optical, &args.dem)
        .context("opening input rasters")?;
    if let Some(path) = &args.hyperspectral {
        source = source.with_hyperspectral(path)?;
    }
    let labels = args.labels.as_deref().map(load_labels).transpose()?;

    let run = pipeline.run_source(&args.tile_id, &source, labels.as_ref(), &args.output_dir)?;
    let (manifest, files) = (run.manifest, run.files);

    for file in &files {
        info!("  {}", file.display());
    }
    info!(
        "Done: landscape {}, Z scale {:.4}",
        manifest.import_parameters.landscape_size,
        manifest.import_parameters.z_scale
    );
    Ok(())
}
