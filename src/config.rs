use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{KwsError, Result};
use crate::features::{ms_to_samples, FeaturePipelineConfig};
use crate::{
    BLANK_ID, DOWNSAMPLING_STRIDE, FIRST_BEAM_SIZE, FRAME_LENGTH_MS, FRAME_SHIFT_MS, LEFT_CONTEXT,
    NUM_BINS, RIGHT_CONTEXT, SAMPLE_RATE, SECOND_BEAM_SIZE,
};

/// Acoustic model family. Decides feature layout and cache shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ModelVariant {
    /// Plain fbank frames in, per-keyword posteriors out (max-pooling models).
    Simple,
    /// Context-expanded, downsampled frames in, CTC token posteriors out.
    CtcContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DecodeMode {
    Greedy,
    PrefixBeam,
}

/// Runtime configuration, loadable from TOML.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KwsConfig {
    pub num_bins: usize,
    pub sample_rate: u32,
    pub frame_length_ms: u32,
    pub frame_shift_ms: u32,
    pub left_context: usize,
    pub right_context: usize,
    pub downsampling_stride: usize,
    pub model_variant: ModelVariant,
    pub decode_mode: DecodeMode,
    pub first_beam_size: usize,
    pub second_beam_size: usize,
    pub blank_id: usize,
    pub detection_score_threshold: f32,

    /// Feature frames handed to the model per forward call.
    pub batch_size: usize,
    /// Feature queue capacity; unbounded when absent.
    pub queue_capacity: Option<usize>,
    pub num_threads: usize,
    /// Microphone delivery interval.
    pub chunk_ms: u32,
    pub keyword: Option<String>,
    pub tokens_path: Option<PathBuf>,
    pub model_path: Option<PathBuf>,
}

impl Default for KwsConfig {
    fn default() -> Self {
        Self {
            num_bins: NUM_BINS,
            sample_rate: SAMPLE_RATE,
            frame_length_ms: FRAME_LENGTH_MS,
            frame_shift_ms: FRAME_SHIFT_MS,
            left_context: LEFT_CONTEXT,
            right_context: RIGHT_CONTEXT,
            downsampling_stride: DOWNSAMPLING_STRIDE,
            model_variant: ModelVariant::CtcContext,
            decode_mode: DecodeMode::PrefixBeam,
            first_beam_size: FIRST_BEAM_SIZE,
            second_beam_size: SECOND_BEAM_SIZE,
            blank_id: BLANK_ID,
            detection_score_threshold: 0.1,
            batch_size: 4,
            queue_capacity: None,
            num_threads: 1,
            chunk_ms: 500,
            keyword: None,
            tokens_path: None,
            model_path: None,
        }
    }
}

impl KwsConfig {
    /// Load configuration from a TOML file.
    ///
    /// Missing fields use default values. The result is validated.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: KwsConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(KwsError::InvalidConfig(msg.to_string()));

        if self.num_bins == 0 {
            return invalid("num_bins must be positive");
        }
        if self.sample_rate == 0 {
            return invalid("sample_rate must be positive");
        }
        if self.frame_length_ms == 0 || self.frame_shift_ms == 0 {
            return invalid("frame_length_ms and frame_shift_ms must be positive");
        }
        if self.frame_shift_ms > self.frame_length_ms {
            return invalid("frame_shift_ms must not exceed frame_length_ms");
        }
        if self.downsampling_stride == 0 {
            return invalid("downsampling_stride must be positive");
        }
        if self.first_beam_size == 0 || self.second_beam_size == 0 {
            return invalid("beam sizes must be positive");
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be positive");
        }
        if self.queue_capacity == Some(0) {
            return invalid("queue_capacity must be positive when set");
        }
        if !(0.0..=1.0).contains(&self.detection_score_threshold) {
            return invalid("detection_score_threshold must be within [0, 1]");
        }
        Ok(())
    }

    pub fn feature_config(&self) -> FeaturePipelineConfig {
        FeaturePipelineConfig {
            num_bins: self.num_bins,
            sample_rate: self.sample_rate,
            frame_length: ms_to_samples(self.sample_rate, self.frame_length_ms),
            frame_shift: ms_to_samples(self.sample_rate, self.frame_shift_ms),
            left_context: self.left_context,
            right_context: self.right_context,
            downsampling: self.downsampling_stride,
            model_variant: self.model_variant,
            queue_capacity: self.queue_capacity,
        }
    }

    /// Pipeline settings for callers that feed and drain on one thread.
    ///
    /// The queue is unbounded there: a bounded push would wait for a reader
    /// that only runs after the push returns.
    pub fn single_thread_feature_config(&self) -> FeaturePipelineConfig {
        FeaturePipelineConfig {
            queue_capacity: None,
            ..self.feature_config()
        }
    }

    /// Samples per microphone chunk.
    pub fn chunk_samples(&self) -> usize {
        ms_to_samples(self.sample_rate, self.chunk_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = KwsConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.first_beam_size, 3);
        assert_eq!(config.second_beam_size, 10);
        assert_eq!(config.model_variant, ModelVariant::CtcContext);
    }

    #[test]
    fn feature_config_uses_sample_counts() {
        let features = KwsConfig::default().feature_config();
        assert_eq!(features.frame_length, 400);
        assert_eq!(features.frame_shift, 160);
        assert_eq!(features.downsampling, 3);
    }

    #[test]
    fn sample_counts_for_non_khz_rates() {
        let config = KwsConfig {
            sample_rate: 22050,
            ..KwsConfig::default()
        };
        let features = config.feature_config();
        assert_eq!(features.frame_length, 551);
        assert_eq!(features.frame_shift, 220);
        assert_eq!(config.chunk_samples(), 11025);
    }

    #[test]
    fn single_thread_pipeline_is_unbounded() {
        let config = KwsConfig {
            queue_capacity: Some(2),
            ..KwsConfig::default()
        };
        assert_eq!(config.feature_config().queue_capacity, Some(2));

        let features = config.single_thread_feature_config();
        assert_eq!(features.queue_capacity, None);
        assert_eq!(features.frame_length, 400);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: KwsConfig = toml::from_str(
            r#"
            num_bins = 40
            model_variant = "simple"
            decode_mode = "greedy"
            keyword = "你好问问"
            "#,
        )
        .unwrap();
        assert_eq!(config.num_bins, 40);
        assert_eq!(config.model_variant, ModelVariant::Simple);
        assert_eq!(config.decode_mode, DecodeMode::Greedy);
        assert_eq!(config.keyword.as_deref(), Some("你好问问"));
        assert_eq!(config.left_context, 2);
        assert_eq!(config.batch_size, 4);
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = KwsConfig::default();
        config.downsampling_stride = 0;
        assert!(config.validate().is_err());

        let mut config = KwsConfig::default();
        config.frame_shift_ms = 30;
        assert!(config.validate().is_err());

        let mut config = KwsConfig::default();
        config.detection_score_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kws.toml");
        fs::write(&path, "batch_size = 8\nsecond_beam_size = 5\n").unwrap();

        let config = KwsConfig::load(&path).unwrap();
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.second_beam_size, 5);
    }

    #[test]
    fn load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kws.toml");
        fs::write(&path, "batch_size = 0\n").unwrap();
        assert!(matches!(
            KwsConfig::load(&path),
            Err(KwsError::InvalidConfig(_))
        ));
    }
}
