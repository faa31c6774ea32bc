use log::{debug, info};
use ndarray::{Array3, ArrayD, IxDyn};

use crate::backend::InferenceBackend;
use crate::config::{DecodeMode, KwsConfig, ModelVariant};
use crate::error::Result;
use crate::features::FeatureFrame;
use crate::greedy::GreedySearch;
use crate::prefix_beam::{CtcPrefixBeamSearch, CtcPrefixBeamSearchOptions};
use crate::vocab::Keyword;

/// A decoded token and the model frame it was emitted at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Token {
    pub time_step: usize,
    pub id: usize,
    pub prob: f32,
}

/// A keyword detection.
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordHit {
    pub keyword: String,
    /// Product of the token probs.
    pub score: f32,
    pub start_frame: usize,
    pub end_frame: usize,
}

/// Posterior of a max-pooling model output over the threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabelActivation {
    pub frame: usize,
    pub label: usize,
    pub prob: f32,
}

pub struct KeywordSpotter<B: InferenceBackend> {
    backend: B,
    model_variant: ModelVariant,
    decode_mode: DecodeMode,
    keyword: Keyword,
    /// Taken during a forward pass.
    cache: Option<ArrayD<f32>>,
    greedy: GreedySearch,
    beam: CtcPrefixBeamSearch,
}

impl<B: InferenceBackend> KeywordSpotter<B> {
    pub fn new(
        backend: B,
        model_variant: ModelVariant,
        decode_mode: DecodeMode,
        keyword: Keyword,
        options: CtcPrefixBeamSearchOptions,
    ) -> Self {
        let cache = ArrayD::zeros(IxDyn(&backend.cache_shape(model_variant)));
        Self {
            backend,
            model_variant,
            decode_mode,
            keyword,
            cache: Some(cache),
            greedy: GreedySearch::new(options.blank),
            beam: CtcPrefixBeamSearch::new(options),
        }
    }

    pub fn from_config(backend: B, config: &KwsConfig, keyword: Keyword) -> Self {
        let options = CtcPrefixBeamSearchOptions {
            blank: config.blank_id,
            first_beam_size: config.first_beam_size,
            second_beam_size: config.second_beam_size,
        };
        Self::new(backend, config.model_variant, config.decode_mode, keyword, options)
    }

    pub fn model_variant(&self) -> ModelVariant {
        self.model_variant
    }

    pub fn decode_mode(&self) -> DecodeMode {
        self.decode_mode
    }

    pub fn keyword(&self) -> &Keyword {
        &self.keyword
    }

    /// Replace the keyword. Decoder state is cleared, the model cache is kept.
    pub fn set_keyword(&mut self, keyword: Keyword) {
        self.keyword = keyword;
        self.reset_value();
    }

    pub fn greedy(&self) -> &GreedySearch {
        &self.greedy
    }

    pub fn beam(&self) -> &CtcPrefixBeamSearch {
        &self.beam
    }

    /// Run the model over one batch of feature frames.
    ///
    /// Returns one posterior vector per model output frame and keeps the
    /// returned cache for the next call.
    pub fn forward(&mut self, feats: &[FeatureFrame]) -> Result<Vec<Vec<f32>>> {
        if feats.is_empty() {
            return Ok(Vec::new());
        }

        let dim = feats[0].len();
        let data: Vec<f32> = feats.iter().flatten().copied().collect();
        let input = Array3::from_shape_vec((1, feats.len(), dim), data)?;

        let cache = match self.cache.take() {
            Some(cache) => cache,
            None => self.zero_cache(),
        };
        let (probs, cache) = self.backend.forward(input, cache)?;
        self.cache = Some(cache);

        debug!("forward {} frames -> {:?}", feats.len(), probs.shape());
        Ok(probs.rows().into_iter().map(|row| row.to_vec()).collect())
    }

    /// Feed posteriors to the decoder. `offset` is the model frame index of
    /// `probs[0]`.
    pub fn decode_keywords(&mut self, offset: usize, probs: &[Vec<f32>]) {
        match self.decode_mode {
            DecodeMode::Greedy => self.greedy.search(offset, probs, &self.keyword),
            DecodeMode::PrefixBeam => self.beam.search(probs, &self.keyword),
        }
    }

    /// Check for the keyword. On a hit the decoder state is cleared.
    pub fn detect_hit(&mut self, threshold: f32) -> Option<KeywordHit> {
        let nodes = match self.decode_mode {
            DecodeMode::Greedy => self.greedy.matched(&self.keyword),
            DecodeMode::PrefixBeam => self.beam.find(&self.keyword).map(|score| score.nodes.as_slice()),
        }?;

        let score: f32 = nodes.iter().map(|node| node.prob).product();
        let (first, last) = (nodes.first()?, nodes.last()?);
        let hit = KeywordHit {
            keyword: self.keyword.text().to_string(),
            score,
            start_frame: first.time_step,
            end_frame: last.time_step,
        };

        if score <= threshold {
            debug!("keyword {} below threshold: {score:.3}", hit.keyword);
            return None;
        }

        info!(
            "hit keyword {} score {:.3} frames {}..={}",
            hit.keyword, hit.score, hit.start_frame, hit.end_frame
        );
        self.reset_value();
        Some(hit)
    }

    pub fn detect(&mut self, threshold: f32) -> bool {
        self.detect_hit(threshold).is_some()
    }

    /// Zero the model cache and clear decoder state.
    pub fn reset(&mut self) {
        self.cache = Some(self.zero_cache());
        self.reset_value();
    }

    /// Clear decoder hypotheses only.
    pub fn reset_value(&mut self) {
        self.greedy.reset();
        self.beam.reset();
    }

    /// Restart prefix beam time steps at zero.
    pub fn step_clear(&mut self) {
        self.beam.clear_time_step();
    }

    fn zero_cache(&self) -> ArrayD<f32> {
        ArrayD::zeros(IxDyn(&self.backend.cache_shape(self.model_variant)))
    }
}

/// Outputs of a max-pooling model over `threshold`, one per label and frame.
pub fn scan_labels(offset: usize, probs: &[Vec<f32>], threshold: f32) -> Vec<LabelActivation> {
    probs
        .iter()
        .enumerate()
        .flat_map(move |(i, frame)| {
            frame
                .iter()
                .enumerate()
                .filter(move |&(_, &prob)| prob > threshold)
                .map(move |(label, &prob)| LabelActivation {
                    frame: offset + i,
                    label,
                    prob,
                })
        })
        .collect()
}
