use anyhow::{Context, Result as AnyResult};
use log::info;
use ndarray::{Array2, Array3, ArrayD, Axis, Ix3};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::Path;

use crate::config::ModelVariant;
use crate::error::{KwsError, Result};
use crate::CTC_CACHE_AXIS;

/// Forward pass of the acoustic model.
///
/// Takes a `[1, T, D]` feature batch and the recurrent cache, and returns the
/// `[T, V]` posteriors together with the cache for the next call. The cache is
/// moved in and out so exactly one copy is live.
pub trait InferenceBackend {
    /// Shape of a zeroed cache for `variant`.
    fn cache_shape(&self, variant: ModelVariant) -> Vec<usize>;

    fn forward(&mut self, feats: Array3<f32>, cache: ArrayD<f32>) -> Result<(Array2<f32>, ArrayD<f32>)>;
}

/// ONNX Runtime model exported with `input`/`cache` inputs and
/// `output`/`r_cache` outputs, plus `cache_dim`/`cache_len` metadata.
pub struct OnnxBackend {
    session: Session,
    cache_dim: usize,
    cache_len: usize,
}

impl OnnxBackend {
    pub fn new(model_path: &Path, num_threads: usize) -> AnyResult<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(num_threads)?
            .with_inter_threads(num_threads)?
            .commit_from_file(model_path)
            .with_context(|| format!("Failed to load KWS model {}", model_path.display()))?;

        let metadata = session.metadata().context("Failed to read model metadata")?;
        let custom = |key: &str| -> Result<usize> {
            metadata
                .custom(key)?
                .and_then(|value| value.trim().parse().ok())
                .ok_or_else(|| KwsError::Metadata(key.to_string()))
        };
        let cache_dim = custom("cache_dim")?;
        let cache_len = custom("cache_len")?;
        drop(metadata);

        info!("KWS model info: cache_dim {cache_dim} cache_len {cache_len}");

        Ok(Self {
            session,
            cache_dim,
            cache_len,
        })
    }
}

impl InferenceBackend for OnnxBackend {
    fn cache_shape(&self, variant: ModelVariant) -> Vec<usize> {
        match variant {
            ModelVariant::CtcContext => vec![1, self.cache_dim, self.cache_len, CTC_CACHE_AXIS],
            ModelVariant::Simple => vec![1, self.cache_dim, self.cache_len],
        }
    }

    fn forward(&mut self, feats: Array3<f32>, cache: ArrayD<f32>) -> Result<(Array2<f32>, ArrayD<f32>)> {
        let outputs = self.session.run(ort::inputs![
            "input" => Tensor::from_array(feats)?,
            "cache" => Tensor::from_array(cache)?,
        ])?;

        let probs = outputs
            .get("output")
            .ok_or_else(|| KwsError::OutputNotFound("output".to_string()))?
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix3>()?
            .index_axis(Axis(0), 0)
            .to_owned();

        let cache = outputs
            .get("r_cache")
            .ok_or_else(|| KwsError::OutputNotFound("r_cache".to_string()))?
            .try_extract_array::<f32>()?
            .to_owned();

        Ok((probs, cache))
    }
}
