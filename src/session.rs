use log::{debug, info};
use std::sync::Arc;

use crate::backend::InferenceBackend;
use crate::config::ModelVariant;
use crate::error::Result;
use crate::features::{FeatureFrame, FeaturePipeline};
use crate::spotter::{scan_labels, KeywordHit, KeywordSpotter, LabelActivation};

/// What one read-forward-decode round produced.
#[derive(Debug, Default)]
pub struct StepOutcome {
    /// The pipeline is finished and drained.
    pub finished: bool,
    pub frames: usize,
    pub hits: Vec<KeywordHit>,
    pub activations: Vec<LabelActivation>,
}

/// Consumer side of streaming keyword spotting.
///
/// Pulls feature batches from a shared [`FeaturePipeline`], runs the model and
/// reports detections. Producers feed the same pipeline from another thread.
pub struct KwsSession<B: InferenceBackend> {
    pipeline: Arc<FeaturePipeline>,
    spotter: KeywordSpotter<B>,
    batch_size: usize,
    threshold: f32,
    /// Output names of a max-pooling model.
    labels: Vec<String>,
    /// Model frames decoded so far.
    offset: usize,
}

impl<B: InferenceBackend> KwsSession<B> {
    pub fn new(pipeline: Arc<FeaturePipeline>, spotter: KeywordSpotter<B>, batch_size: usize, threshold: f32) -> Self {
        Self {
            pipeline,
            spotter,
            batch_size: batch_size.max(1),
            threshold,
            labels: Vec::new(),
            offset: 0,
        }
    }

    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn pipeline(&self) -> &Arc<FeaturePipeline> {
        &self.pipeline
    }

    pub fn spotter(&self) -> &KeywordSpotter<B> {
        &self.spotter
    }

    pub fn spotter_mut(&mut self) -> &mut KeywordSpotter<B> {
        &mut self.spotter
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Read up to one batch, blocking until it is full or input is finished.
    pub fn step(&mut self) -> Result<StepOutcome> {
        let mut feats = Vec::with_capacity(self.batch_size);
        let more = self.pipeline.read(self.batch_size, &mut feats);
        let mut outcome = self.process(&feats)?;
        outcome.finished = !more;
        Ok(outcome)
    }

    /// Process every full batch already queued without blocking.
    pub fn process_ready(&mut self) -> Result<Vec<KeywordHit>> {
        let mut hits = Vec::new();
        while self.pipeline.num_queued_frames() >= self.batch_size {
            hits.extend(self.step()?.hits);
        }
        Ok(hits)
    }

    /// Run until the pipeline is finished and drained, calling `on_hit` for
    /// every detection.
    pub fn run_with<F: FnMut(&KeywordHit)>(&mut self, mut on_hit: F) -> Result<Vec<KeywordHit>> {
        let mut hits = Vec::new();
        loop {
            let outcome = self.step()?;
            for hit in outcome.hits {
                on_hit(&hit);
                hits.push(hit);
            }
            if outcome.finished {
                break;
            }
        }
        debug!("session done after {} model frames", self.offset);
        Ok(hits)
    }

    pub fn run(&mut self) -> Result<Vec<KeywordHit>> {
        self.run_with(|_| {})
    }

    /// Mark input finished and decode what is left.
    pub fn finish(&mut self) -> Result<Vec<KeywordHit>> {
        self.pipeline.set_input_finished();
        self.run()
    }

    /// Prepare for a new utterance. Must not race with producers.
    pub fn reset(&mut self) {
        self.pipeline.reset();
        self.spotter.reset();
        self.spotter.step_clear();
        self.offset = 0;
    }

    fn process(&mut self, feats: &[FeatureFrame]) -> Result<StepOutcome> {
        let probs = self.spotter.forward(feats)?;
        let mut outcome = StepOutcome {
            frames: probs.len(),
            ..StepOutcome::default()
        };

        match self.spotter.model_variant() {
            ModelVariant::CtcContext => {
                self.spotter.decode_keywords(self.offset, &probs);
                if let Some(hit) = self.spotter.detect_hit(self.threshold) {
                    outcome.hits.push(hit);
                }
            }
            ModelVariant::Simple => {
                outcome.activations = scan_labels(self.offset, &probs, self.threshold);
                for activation in &outcome.activations {
                    let label = self.labels.get(activation.label).map_or("?", String::as_str);
                    info!(
                        "frame {} keyword {} ({}) prob {:.3}",
                        activation.frame, activation.label, label, activation.prob
                    );
                }
            }
        }

        self.offset += probs.len();
        Ok(outcome)
    }
}
