//! Full-precision model artifacts.
//!
//! A saved model is a single safetensors file: every weight as F32 plus string
//! metadata carrying the [`ModelSpec`] and the names of the tracked metrics.
//! Loading resolves those names through the metric registry before the
//! network is rebuilt.

use crate::error::MlError;
use crate::model::architecture::ModelSpec;
use crate::model::network::Model;
use crate::persistence::atomic_write;
use crate::training::metrics::MetricKind;
use candle_core::{Device, Tensor};
use safetensors::SafeTensors;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Extension of every model artifact.
pub const MODEL_EXTENSION: &str = "safetensors";

/// Inserted between stem and extension for the quantized sibling.
pub const QUANTIZED_SUFFIX: &str = "-quantized";

pub(crate) const META_SPEC: &str = "skinvestigator.spec";
pub(crate) const META_METRICS: &str = "skinvestigator.metrics";
pub(crate) const META_PRECISION: &str = "skinvestigator.precision";
pub(crate) const META_FORMAT: &str = "skinvestigator.format";
pub(crate) const FORMAT_VERSION: &str = "1";

/// Numeric precision of the weights stored in an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    F32,
    Int8,
}

impl Precision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::F32 => "f32",
            Precision::Int8 => "i8",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "f32" => Some(Precision::F32),
            "i8" => Some(Precision::Int8),
            _ => None,
        }
    }
}

/// Path of the quantized artifact written beside `path`:
/// `models/skin.safetensors` becomes `models/skin-quantized.safetensors`.
pub fn quantized_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "model".to_string());
    path.with_file_name(format!("{stem}{QUANTIZED_SUFFIX}.{MODEL_EXTENSION}"))
}

/// Metadata block shared by both artifact forms.
pub(crate) fn artifact_metadata(
    spec: &ModelSpec,
    precision: Precision,
) -> Result<HashMap<String, String>, MlError> {
    let metric_names: Vec<&str> = spec.metrics.iter().map(|m| m.name()).collect();
    let mut metadata = HashMap::new();
    metadata.insert(META_FORMAT.to_string(), FORMAT_VERSION.to_string());
    metadata.insert(META_SPEC.to_string(), serde_json::to_string(spec)?);
    metadata.insert(META_METRICS.to_string(), serde_json::to_string(&metric_names)?);
    metadata.insert(META_PRECISION.to_string(), precision.as_str().to_string());
    Ok(metadata)
}

/// Serialize `model` to full-precision safetensors bytes.
pub fn encode_model(model: &Model) -> Result<Vec<u8>, MlError> {
    let tensors = model.named_tensors()?;
    let metadata = artifact_metadata(model.spec(), Precision::F32)?;
    Ok(safetensors::tensor::serialize(tensors, &Some(metadata))?)
}

/// Write `model` to `path`; returns the artifact size in bytes.
pub fn save_model(model: &Model, path: &Path) -> Result<u64, MlError> {
    let bytes = encode_model(model)?;
    atomic_write(path, &bytes)?;
    Ok(bytes.len() as u64)
}

/// Raw contents of an artifact.
pub(crate) struct Artifact {
    pub spec: ModelSpec,
    pub precision: Precision,
    pub metadata: HashMap<String, String>,
    pub tensors: HashMap<String, Tensor>,
}

pub(crate) fn read_artifact(path: &Path, device: &Device) -> Result<Artifact, MlError> {
    if !path.exists() {
        return Err(MlError::not_found(format!("model file {}", path.display())));
    }
    let bytes = std::fs::read(path)?;
    let (_, header) = SafeTensors::read_metadata(&bytes)?;
    let metadata = header.metadata().clone().unwrap_or_default();

    let format = metadata.get(META_FORMAT).map(String::as_str);
    if format != Some(FORMAT_VERSION) {
        return Err(MlError::model(format!(
            "{} is not a skinvestigator artifact (format {:?})",
            path.display(),
            format
        )));
    }

    let mut spec: ModelSpec = serde_json::from_str(
        metadata
            .get(META_SPEC)
            .ok_or_else(|| MlError::model("artifact is missing its architecture"))?,
    )?;
    spec.metrics = resolve_metrics(&metadata)?;

    let precision = metadata
        .get(META_PRECISION)
        .and_then(|p| Precision::parse(p))
        .ok_or_else(|| MlError::model("artifact has no recognised precision"))?;

    let tensors = candle_core::safetensors::load_buffer(&bytes, device)?;
    Ok(Artifact {
        spec,
        precision,
        metadata,
        tensors,
    })
}

// Every stored metric name must map onto a known metric implementation.
fn resolve_metrics(metadata: &HashMap<String, String>) -> Result<Vec<MetricKind>, MlError> {
    let raw = metadata
        .get(META_METRICS)
        .ok_or_else(|| MlError::model("artifact is missing its metric list"))?;
    let names: Vec<String> = serde_json::from_str(raw)?;
    names
        .iter()
        .map(|name| {
            MetricKind::from_name(name)
                .ok_or_else(|| MlError::model(format!("unknown metric '{name}' in artifact")))
        })
        .collect()
}

/// Restore a full-precision model written by [`save_model`].
pub fn load_model(path: &Path, device: &Device) -> Result<Model, MlError> {
    let artifact = read_artifact(path, device)?;
    if artifact.precision != Precision::F32 {
        return Err(MlError::model(format!(
            "{} holds {} weights; load it with QuantizedModel::load",
            path.display(),
            artifact.precision.as_str()
        )));
    }
    let mut model = Model::new(artifact.spec, device)?;
    model.load_weights(&artifact.tensors)?;
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImageSize;
    use crate::model::architecture::LayerConfig;
    use tempfile::TempDir;

    fn tiny_model() -> Model {
        let mut spec = ModelSpec::fixed(ImageSize::new(8, 8));
        spec.layers = vec![
            LayerConfig::conv(4),
            LayerConfig::pool(),
            LayerConfig::Flatten,
            LayerConfig::dense(8),
        ];
        Model::new(spec, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_quantized_path() {
        assert_eq!(
            quantized_path(Path::new("models/skinvestigator.safetensors")),
            PathBuf::from("models/skinvestigator-quantized.safetensors")
        );
        assert_eq!(
            quantized_path(Path::new("out.h5")),
            PathBuf::from("out-quantized.safetensors")
        );
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.safetensors");
        let model = tiny_model();
        let size = save_model(&model, &path).unwrap();
        assert_eq!(size, std::fs::metadata(&path).unwrap().len());

        let loaded = load_model(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded.spec(), model.spec());
        let diff = model
            .snapshot()
            .unwrap()
            .max_abs_diff(&loaded.snapshot().unwrap())
            .unwrap();
        assert_eq!(diff, Some(0.0));
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_model(Path::new("/no/such/model.safetensors"), &Device::Cpu).unwrap_err();
        assert!(matches!(err, MlError::NotFound(_)));
    }

    #[test]
    fn test_unknown_metric_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.safetensors");
        let model = tiny_model();
        let mut metadata = artifact_metadata(model.spec(), Precision::F32).unwrap();
        metadata.insert(META_METRICS.to_string(), r#"["accuracy","f1"]"#.to_string());
        let bytes =
            safetensors::tensor::serialize(model.named_tensors().unwrap(), &Some(metadata)).unwrap();
        std::fs::write(&path, bytes).unwrap();

        let err = load_model(&path, &Device::Cpu).unwrap_err();
        assert!(err.to_string().contains("unknown metric 'f1'"));
    }

    #[test]
    fn test_foreign_safetensors_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("foreign.safetensors");
        let t = Tensor::zeros((2, 2), candle_core::DType::F32, &Device::Cpu).unwrap();
        let bytes = safetensors::tensor::serialize(vec![("w".to_string(), t)], &None).unwrap();
        std::fs::write(&path, bytes).unwrap();
        assert!(load_model(&path, &Device::Cpu).is_err());
    }
}
