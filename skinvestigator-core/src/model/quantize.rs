//! Post-training model quantization.
//!
//! Dynamic-range int8: large weight matrices and kernels are stored as affine
//! `u8` (symmetric scale, zero point 128) with their scales in the artifact
//! metadata; biases and small tensors stay F32. Activations are untouched, so
//! a quantized model is dequantized back to F32 for inference.

use crate::error::MlError;
use crate::model::io::{Precision, artifact_metadata, read_artifact};
use crate::model::network::Model;
use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Tensors with fewer elements than this are left in F32.
pub const MIN_QUANTIZED_ELEMENTS: usize = 1024;

const ZERO_POINT: f64 = 128.0;
const SCALE_PREFIX: &str = "scale.";

/// Quantization method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantizationMethod {
    /// 8-bit weights, float activations.
    DynamicRangeInt8,
}

/// Quantization result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantizationResult {
    pub method: QuantizationMethod,
    pub quantized_tensors: usize,
    pub float_tensors: usize,
    pub output_bytes: u64,
    pub output_path: Option<PathBuf>,
}

/// An int8 tensor and the scale that maps it back to F32.
#[derive(Debug, Clone)]
pub struct QuantizedTensor {
    pub values: Tensor,
    pub scale: f32,
}

/// Quantize one F32 tensor symmetrically around zero.
pub fn quantize_tensor(tensor: &Tensor) -> Result<QuantizedTensor, MlError> {
    let max_abs = tensor
        .abs()?
        .flatten_all()?
        .max(0)?
        .to_dtype(DType::F32)?
        .to_scalar::<f32>()?;
    let scale = if max_abs > 0.0 { max_abs / 127.0 } else { 1.0 };
    let values = tensor
        .to_dtype(DType::F32)?
        .affine(1.0 / f64::from(scale), ZERO_POINT)?
        .round()?
        .clamp(0f32, 255f32)?
        .to_dtype(DType::U8)?;
    Ok(QuantizedTensor { values, scale })
}

pub fn dequantize_tensor(values: &Tensor, scale: f32) -> Result<Tensor, MlError> {
    let scale = f64::from(scale);
    Ok(values
        .to_dtype(DType::F32)?
        .affine(scale, -ZERO_POINT * scale)?)
}

fn should_quantize(tensor: &Tensor) -> bool {
    tensor.rank() >= 2 && tensor.elem_count() >= MIN_QUANTIZED_ELEMENTS
}

/// Serialize `model` in quantized form.
pub fn quantize_model(model: &Model) -> Result<(Vec<u8>, QuantizationResult), MlError> {
    let mut metadata = artifact_metadata(model.spec(), Precision::Int8)?;
    let mut tensors = Vec::new();
    let (mut quantized, mut kept) = (0, 0);
    for (name, tensor) in model.named_tensors()? {
        if should_quantize(&tensor) {
            let q = quantize_tensor(&tensor)?;
            metadata.insert(format!("{SCALE_PREFIX}{name}"), q.scale.to_string());
            tensors.push((name, q.values));
            quantized += 1;
        } else {
            tensors.push((name, tensor));
            kept += 1;
        }
    }
    let bytes = safetensors::tensor::serialize(tensors, &Some(metadata))?;
    tracing::debug!(quantized, kept, bytes = bytes.len(), "Quantized model");
    let result = QuantizationResult {
        method: QuantizationMethod::DynamicRangeInt8,
        quantized_tensors: quantized,
        float_tensors: kept,
        output_bytes: bytes.len() as u64,
        output_path: None,
    };
    Ok((bytes, result))
}

/// Loader for quantized artifacts.
pub struct QuantizedModel;

impl QuantizedModel {
    /// Read a quantized artifact and dequantize it into an F32 [`Model`].
    pub fn load(path: &Path, device: &Device) -> Result<Model, MlError> {
        let artifact = read_artifact(path, device)?;
        if artifact.precision != Precision::Int8 {
            return Err(MlError::model(format!(
                "{} is not a quantized artifact",
                path.display()
            )));
        }
        let mut weights = HashMap::with_capacity(artifact.tensors.len());
        for (name, tensor) in artifact.tensors {
            let weight = match artifact.metadata.get(&format!("{SCALE_PREFIX}{name}")) {
                Some(raw) => {
                    let scale: f32 = raw.parse().map_err(|_| {
                        MlError::model(format!("bad scale '{raw}' for tensor '{name}'"))
                    })?;
                    dequantize_tensor(&tensor, scale)?
                }
                None => tensor,
            };
            weights.insert(name, weight);
        }
        let mut model = Model::new(artifact.spec, device)?;
        model.load_weights(&weights)?;
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImageSize;
    use crate::model::architecture::{LayerConfig, ModelSpec};
    use crate::model::io::encode_model;
    use tempfile::TempDir;

    fn model_with_dense(units: usize) -> Model {
        let mut spec = ModelSpec::fixed(ImageSize::new(8, 8));
        spec.layers = vec![
            LayerConfig::conv(8),
            LayerConfig::pool(),
            LayerConfig::Flatten,
            LayerConfig::dense(units),
        ];
        Model::new(spec, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_quantize_roundtrip_error_bounded() {
        let t = Tensor::new(&[[-1.0f32, -0.25, 0.0], [0.5, 0.75, 1.0]], &Device::Cpu).unwrap();
        let q = quantize_tensor(&t).unwrap();
        assert_eq!(q.values.dtype(), DType::U8);
        let back = dequantize_tensor(&q.values, q.scale).unwrap();
        let err = (back - &t)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(err <= q.scale / 2.0 + 1e-6);
    }

    #[test]
    fn test_zero_tensor_quantizes() {
        let t = Tensor::zeros((4, 4), DType::F32, &Device::Cpu).unwrap();
        let q = quantize_tensor(&t).unwrap();
        assert_eq!(q.scale, 1.0);
        let back = dequantize_tensor(&q.values, q.scale).unwrap();
        assert_eq!(back.flatten_all().unwrap().to_vec1::<f32>().unwrap(), vec![0.0; 16]);
    }

    #[test]
    fn test_quantized_is_smaller() {
        let model = model_with_dense(64);
        let primary = encode_model(&model).unwrap();
        let (quantized, result) = quantize_model(&model).unwrap();
        // dense_0.weight is 64x128
        assert!(result.quantized_tensors >= 1);
        assert!(quantized.len() < primary.len());
    }

    #[test]
    fn test_small_model_never_larger() {
        let model = model_with_dense(1);
        let primary = encode_model(&model).unwrap();
        let (quantized, result) = quantize_model(&model).unwrap();
        assert_eq!(result.quantized_tensors, 0);
        assert!(quantized.len() <= primary.len());
    }

    #[test]
    fn test_quantized_load_close_to_original() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m-quantized.safetensors");
        let model = model_with_dense(64);
        let (bytes, _) = quantize_model(&model).unwrap();
        std::fs::write(&path, bytes).unwrap();

        let restored = QuantizedModel::load(&path, &Device::Cpu).unwrap();
        let images = Tensor::rand(0f32, 1f32, (3, 3, 8, 8), &Device::Cpu).unwrap();
        let a = model.predict(&images).unwrap();
        let b = restored.predict(&images).unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 0.05, "{x} vs {y}");
        }
    }

    #[test]
    fn test_quantized_load_rejects_primary() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.safetensors");
        crate::model::io::save_model(&model_with_dense(4), &path).unwrap();
        assert!(QuantizedModel::load(&path, &Device::Cpu).is_err());
    }
}
