//! Python bindings (`python` feature)

use crate::config::PipelineConfig;
use crate::core::anomaly::{detect_anomalies, IsolationForestParams};
use crate::core::pipeline::FusionPipeline;
use crate::io::tile_source::GdalTileSource;
use crate::types::{FeatureBand, FeatureStack, FusionError};
use numpy::{PyReadonlyArray3, ToPyArray};
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;

fn to_py_err(err: FusionError) -> PyErr {
    match err {
        FusionError::InvalidParameter { .. }
        | FusionError::InvalidTargetSize(_)
        | FusionError::InvalidTextureSize(_) => PyValueError::new_err(err.to_string()),
        _ => PyRuntimeError::new_err(err.to_string()),
    }
}

/// Run the full pipeline on three GeoTIFFs and write products to `output_dir`
#[pyfunction]
#[pyo3(signature = (radar, optical, dem, output_dir, tile_id = "tile_001", config = None))]
fn run_pipeline(
    py: Python,
    radar: String,
    optical: String,
    dem: String,
    output_dir: String,
    tile_id: &str,
    config: Option<String>,
) -> PyResult<PyObject> {
    let config = match config {
        Some(path) => PipelineConfig::from_json_file(path).map_err(to_py_err)?,
        None => PipelineConfig::default(),
    };
    let pipeline = FusionPipeline::new(config).map_err(to_py_err)?;

    let run = py
        .allow_threads(|| {
            let source = GdalTileSource::open(&radar, &optical, &dem)?;
            pipeline.run_source(tile_id, &source, None, &output_dir)
        })
        .map_err(to_py_err)?;

    let result = PyDict::new(py);
    if let Some(scores) = &run.outputs.anomaly.scores {
        result.set_item("anomaly", scores.to_pyarray(py))?;
    }
    if let Some(labels) = &run.outputs.anomaly.labels {
        result.set_item("labels", labels.to_pyarray(py))?;
    }
    result.set_item("z_scale", run.manifest.asset.z_scale)?;
    result.set_item(
        "files",
        run.files.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
    )?;
    result.set_item("manifest", serde_json::to_string(&run.manifest).map_err(|e| PyRuntimeError::new_err(e.to_string()))?)?;

    Ok(result.into())
}

/// Isolation-forest scores for a (bands, rows, cols) float32 array
#[pyfunction]
#[pyo3(signature = (features, band_names, contamination = 0.02, n_estimators = 200, seed = 42))]
fn anomaly_scores(
    py: Python,
    features: PyReadonlyArray3<f32>,
    band_names: Vec<String>,
    contamination: f64,
    n_estimators: usize,
    seed: u64,
) -> PyResult<PyObject> {
    let bands = band_names
        .iter()
        .map(|name| {
            serde_json::from_value::<FeatureBand>(serde_json::Value::String(name.clone()))
                .map_err(|_| PyValueError::new_err(format!("Unknown feature band: {}", name)))
        })
        .collect::<PyResult<Vec<_>>>()?;
    let stack = FeatureStack::from_array(bands, features.as_array().to_owned()).map_err(to_py_err)?;

    let params = IsolationForestParams {
        n_estimators,
        contamination,
        random_seed: seed,
        ..IsolationForestParams::default()
    };
    let result = py
        .allow_threads(|| detect_anomalies(&stack, &params))
        .map_err(to_py_err)?;

    let out = PyDict::new(py);
    if let Some(scores) = &result.scores {
        out.set_item("scores", scores.to_pyarray(py))?;
    }
    if let Some(labels) = &result.labels {
        out.set_item("labels", labels.to_pyarray(py))?;
    }
    Ok(out.into())
}

#[pymodule]
fn geofuse(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(run_pipeline, m)?)?;
    m.add_function(wrap_pyfunction!(anomaly_scores, m)?)?;
    Ok(())
}
