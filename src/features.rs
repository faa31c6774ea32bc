//! Streaming feature pipeline.
//!
//! One thread feeds waveform chunks through [`FeaturePipeline::accept_waveform`]
//! and finally calls [`FeaturePipeline::set_input_finished`]; another thread
//! consumes model-ready frames with [`FeaturePipeline::read`], which blocks
//! while no frame is queued and the input is still open.
//!
//! Two remainders survive between calls: the waveform tail that did not fill a
//! whole frame shift, and (for context models) the last raw frames needed to
//! build the next context windows.

use log::{info, warn};
use parking_lot::{Condvar, Mutex};

use crate::config::ModelVariant;
use crate::fbank::{Fbank, FeatureExtractor};
use crate::queue::BoundedQueue;

pub type FeatureFrame = Vec<f32>;

/// Number of samples in `ms` milliseconds, rounded down.
pub fn ms_to_samples(sample_rate: u32, ms: u32) -> usize {
    (sample_rate as u64 * ms as u64 / 1000) as usize
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeaturePipelineConfig {
    pub num_bins: usize,
    pub sample_rate: u32,
    /// Frame length in samples.
    pub frame_length: usize,
    /// Frame shift in samples.
    pub frame_shift: usize,
    pub left_context: usize,
    pub right_context: usize,
    pub downsampling: usize,
    pub model_variant: ModelVariant,
    pub queue_capacity: Option<usize>,
}

impl FeaturePipelineConfig {
    pub fn new(num_bins: usize, sample_rate: u32, model_variant: ModelVariant) -> Self {
        Self {
            num_bins,
            sample_rate,
            frame_length: ms_to_samples(sample_rate, crate::FRAME_LENGTH_MS),
            frame_shift: ms_to_samples(sample_rate, crate::FRAME_SHIFT_MS),
            left_context: crate::LEFT_CONTEXT,
            right_context: crate::RIGHT_CONTEXT,
            downsampling: crate::DOWNSAMPLING_STRIDE,
            model_variant,
            queue_capacity: None,
        }
    }

    pub fn context_window(&self) -> usize {
        self.left_context + self.right_context + 1
    }

    /// Dimension of the frames handed out by `read`.
    pub fn output_dim(&self) -> usize {
        match self.model_variant {
            ModelVariant::CtcContext => self.num_bins * self.context_window(),
            ModelVariant::Simple => self.num_bins,
        }
    }
}

#[derive(Default)]
struct PipelineState {
    remained_wav: Vec<f32>,
    feature_remained: Vec<FeatureFrame>,
    /// Context frames produced so far, used to keep the downsampling phase.
    num_context_frames: usize,
    num_frames: usize,
    input_finished: bool,
}

pub struct FeaturePipeline {
    config: FeaturePipelineConfig,
    extractor: Mutex<Box<dyn FeatureExtractor>>,
    feature_queue: BoundedQueue<FeatureFrame>,
    state: Mutex<PipelineState>,
    finish_condition: Condvar,
}

impl FeaturePipeline {
    pub fn new(config: FeaturePipelineConfig) -> Self {
        let fbank = Fbank::new(
            config.num_bins,
            config.sample_rate,
            config.frame_length,
            config.frame_shift,
        );
        Self::with_extractor(config, Box::new(fbank))
    }

    pub fn with_extractor(config: FeaturePipelineConfig, extractor: Box<dyn FeatureExtractor>) -> Self {
        info!(
            "feature pipeline: num_bins {} frame_length {} frame_shift {} variant {:?}",
            config.num_bins, config.frame_length, config.frame_shift, config.model_variant
        );
        if extractor.dim() != config.num_bins {
            warn!(
                "extractor produces {} bins, config expects {}",
                extractor.dim(),
                config.num_bins
            );
        }
        let feature_queue = match config.queue_capacity {
            Some(capacity) => BoundedQueue::with_capacity(capacity),
            None => BoundedQueue::new(),
        };
        Self {
            config,
            extractor: Mutex::new(extractor),
            feature_queue,
            state: Mutex::new(PipelineState::default()),
            finish_condition: Condvar::new(),
        }
    }

    pub fn config(&self) -> &FeaturePipelineConfig {
        &self.config
    }

    pub fn feature_dim(&self) -> usize {
        self.config.output_dim()
    }

    /// Raw frames extracted so far.
    pub fn num_frames(&self) -> usize {
        self.state.lock().num_frames
    }

    pub fn input_finished(&self) -> bool {
        self.state.lock().input_finished
    }

    pub fn num_queued_frames(&self) -> usize {
        self.feature_queue.len()
    }

    pub fn is_last_frame(&self, frame: usize) -> bool {
        let state = self.state.lock();
        state.input_finished && frame + 1 == state.num_frames
    }

    /// Accept float or 16-bit PCM samples. Integer samples are converted
    /// without normalization.
    ///
    /// # Panics
    ///
    /// Panics if called after [`set_input_finished`](Self::set_input_finished).
    pub fn accept_waveform<S: Copy + Into<f32>>(&self, wav: &[S]) {
        let frames = {
            let mut state = self.state.lock();
            assert!(
                !state.input_finished,
                "accept_waveform called after set_input_finished"
            );

            let mut waves = std::mem::take(&mut state.remained_wav);
            waves.extend(wav.iter().map(|&s| s.into()));

            let feats = self.extractor.lock().compute(&waves);
            let num_frames = feats.len();
            state.num_frames += num_frames;
            let consumed = (self.config.frame_shift * num_frames).min(waves.len());
            state.remained_wav = waves.split_off(consumed);

            match self.config.model_variant {
                ModelVariant::CtcContext => self.contextualize(&mut state, feats),
                ModelVariant::Simple => feats,
            }
        };

        // Notify after every push: with a bounded queue the next push can
        // block until the reader has been woken and drained a frame. Notify
        // under the lock so a reader between its queue check and its wait
        // cannot miss the wakeup.
        for frame in frames {
            self.feature_queue.push(frame);
            let _state = self.state.lock();
            self.finish_condition.notify_one();
        }
    }

    /// Build context windows and downsample.
    fn contextualize(&self, state: &mut PipelineState, feats: Vec<FeatureFrame>) -> Vec<FeatureFrame> {
        let left = self.config.left_context;
        let keep = left + self.config.right_context;

        let padded = if !state.feature_remained.is_empty() {
            let mut padded = std::mem::take(&mut state.feature_remained);
            padded.extend(feats);
            padded
        } else if let Some(first) = feats.first().cloned() {
            let mut padded = vec![first; left];
            padded.extend(feats);
            padded
        } else {
            return Vec::new();
        };

        let contexts = extract_context(&padded, left, self.config.right_context);
        state.feature_remained = padded[padded.len().saturating_sub(keep)..].to_vec();

        let stride = self.config.downsampling;
        let first = state.num_context_frames;
        state.num_context_frames += contexts.len();
        contexts
            .into_iter()
            .enumerate()
            .filter(|(i, _)| (first + i) % stride == 0)
            .map(|(_, frame)| frame)
            .collect()
    }

    /// Mark the end of input and wake a blocked reader.
    ///
    /// # Panics
    ///
    /// Panics if the input was already finished.
    pub fn set_input_finished(&self) {
        {
            let mut state = self.state.lock();
            assert!(!state.input_finished, "set_input_finished called twice");
            state.input_finished = true;
            state.feature_remained.clear();
        }
        self.finish_condition.notify_one();
    }

    /// Read one frame, blocking while the queue is empty and input is open.
    /// Returns `None` once input is finished and the queue is drained.
    pub fn read_one(&self) -> Option<FeatureFrame> {
        if let Some(frame) = self.feature_queue.try_pop() {
            return Some(frame);
        }

        let mut state = self.state.lock();
        while !state.input_finished {
            if let Some(frame) = self.feature_queue.try_pop() {
                return Some(frame);
            }
            self.finish_condition.wait(&mut state);
        }
        drop(state);

        // The last push may have landed right before the finish flag.
        self.feature_queue.try_pop()
    }

    /// Read `num_frames` frames into `feats` (cleared first).
    ///
    /// Returns `false` when input finished before `num_frames` frames were
    /// available; `feats` then holds whatever was left.
    pub fn read(&self, num_frames: usize, feats: &mut Vec<FeatureFrame>) -> bool {
        feats.clear();
        while feats.len() < num_frames {
            match self.read_one() {
                Some(frame) => feats.push(frame),
                None => return false,
            }
        }
        true
    }

    /// Prepare for a new utterance.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        *state = PipelineState::default();
        self.feature_queue.clear();
    }
}

/// Concatenate each window of `left + right + 1` frames.
fn extract_context(padded: &[FeatureFrame], left: usize, right: usize) -> Vec<FeatureFrame> {
    let window = left + right + 1;
    if padded.len() < window {
        return Vec::new();
    }
    padded.windows(window).map(|frames| frames.concat()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    /// One frame per shift whose single bin is the first sample of the frame.
    struct FirstSample {
        frame_length: usize,
        frame_shift: usize,
    }

    impl FeatureExtractor for FirstSample {
        fn dim(&self) -> usize {
            1
        }

        fn compute(&mut self, wave: &[f32]) -> Vec<FeatureFrame> {
            if wave.len() < self.frame_length {
                return Vec::new();
            }
            let n = 1 + (wave.len() - self.frame_length) / self.frame_shift;
            (0..n).map(|i| vec![wave[i * self.frame_shift]]).collect()
        }
    }

    fn toy_config(variant: ModelVariant) -> FeaturePipelineConfig {
        FeaturePipelineConfig {
            num_bins: 1,
            sample_rate: 16000,
            frame_length: 4,
            frame_shift: 2,
            left_context: 2,
            right_context: 2,
            downsampling: 3,
            model_variant: variant,
            queue_capacity: None,
        }
    }

    fn toy_pipeline(variant: ModelVariant) -> FeaturePipeline {
        FeaturePipeline::with_extractor(
            toy_config(variant),
            Box::new(FirstSample {
                frame_length: 4,
                frame_shift: 2,
            }),
        )
    }

    fn drain(pipeline: &FeaturePipeline) -> Vec<FeatureFrame> {
        let mut out = Vec::new();
        while let Some(frame) = pipeline.feature_queue.try_pop() {
            out.push(frame);
        }
        out
    }

    fn ramp(len: usize) -> Vec<f32> {
        (0..len).map(|i| i as f32).collect()
    }

    #[test]
    fn simple_variant_passes_raw_frames() {
        let pipeline = toy_pipeline(ModelVariant::Simple);
        pipeline.accept_waveform(&ramp(9));
        // frames start at 0, 2, 4; samples 6..9 remain
        assert_eq!(drain(&pipeline), vec![vec![0.0], vec![2.0], vec![4.0]]);
        assert_eq!(pipeline.num_frames(), 3);

        pipeline.accept_waveform(&[9.0f32]);
        assert_eq!(drain(&pipeline), vec![vec![6.0]]);
    }

    #[test]
    fn integer_samples_are_not_normalized() {
        let pipeline = toy_pipeline(ModelVariant::Simple);
        pipeline.accept_waveform(&[1000i16, 2, -3000, 4]);
        assert_eq!(drain(&pipeline), vec![vec![1000.0]]);
    }

    #[test]
    fn context_windows_pad_left_edge() {
        let mut config = toy_config(ModelVariant::CtcContext);
        config.downsampling = 1;
        let pipeline = FeaturePipeline::with_extractor(
            config,
            Box::new(FirstSample {
                frame_length: 4,
                frame_shift: 2,
            }),
        );

        // raw frames 0, 2, 4, 6, 8
        pipeline.accept_waveform(&ramp(12));
        let out = drain(&pipeline);
        assert_eq!(
            out,
            vec![
                vec![0.0, 0.0, 0.0, 2.0, 4.0],
                vec![0.0, 0.0, 2.0, 4.0, 6.0],
                vec![0.0, 2.0, 4.0, 6.0, 8.0],
            ]
        );
    }

    #[test]
    fn downsampling_keeps_every_stride_frame() {
        let mut config = toy_config(ModelVariant::CtcContext);
        config.downsampling = 1;
        let dense = FeaturePipeline::with_extractor(
            config,
            Box::new(FirstSample {
                frame_length: 4,
                frame_shift: 2,
            }),
        );
        let strided = toy_pipeline(ModelVariant::CtcContext);

        let wave = ramp(80);
        dense.accept_waveform(&wave);
        strided.accept_waveform(&wave);

        let dense = drain(&dense);
        let strided = drain(&strided);
        assert_eq!(strided.len(), dense.len().div_ceil(3));
        for (i, frame) in strided.iter().enumerate() {
            assert_eq!(frame, &dense[i * 3]);
        }
    }

    #[test]
    fn chunked_input_matches_single_call() {
        let wave = ramp(301);
        for variant in [ModelVariant::Simple, ModelVariant::CtcContext] {
            let whole = toy_pipeline(variant);
            whole.accept_waveform(&wave);
            let expected = drain(&whole);

            for chunk in [1, 3, 5, 7, 64] {
                let chunked = toy_pipeline(variant);
                for piece in wave.chunks(chunk) {
                    chunked.accept_waveform(piece);
                }
                assert_eq!(drain(&chunked), expected, "variant {variant:?} chunk {chunk}");
            }
        }
    }

    #[test]
    fn fbank_pipeline_chunked_matches_single_call() {
        let config = FeaturePipelineConfig::new(40, 16000, ModelVariant::CtcContext);
        let wave: Vec<f32> = (0..8000)
            .map(|i| 3000.0 * (i as f32 * 0.05).sin() + 500.0 * (i as f32 * 0.37).cos())
            .collect();

        let whole = FeaturePipeline::new(config.clone());
        whole.accept_waveform(&wave);
        let expected = drain(&whole);
        assert!(!expected.is_empty());
        assert!(expected.iter().all(|f| f.len() == 200));

        let chunked = FeaturePipeline::new(config);
        for piece in wave.chunks(1234) {
            chunked.accept_waveform(piece);
        }
        assert_eq!(drain(&chunked), expected);
    }

    #[test]
    fn context_frames_track_raw_frames_across_calls() {
        let mut config = toy_config(ModelVariant::CtcContext);
        config.downsampling = 1;
        let pipeline = FeaturePipeline::with_extractor(
            config,
            Box::new(FirstSample {
                frame_length: 4,
                frame_shift: 2,
            }),
        );

        // First call: 10 raw frames, the right context holds back 2.
        pipeline.accept_waveform(&ramp(22));
        assert_eq!(drain(&pipeline).len(), 8);

        // Later calls emit one context frame per raw frame.
        pipeline.accept_waveform(&ramp(20));
        assert_eq!(pipeline.num_frames(), 20);
        assert_eq!(drain(&pipeline).len(), 10);
    }

    #[test]
    fn read_returns_partial_batch_after_finish() {
        let pipeline = toy_pipeline(ModelVariant::Simple);
        pipeline.accept_waveform(&ramp(8)); // 3 frames
        pipeline.set_input_finished();

        let mut feats = Vec::new();
        assert!(!pipeline.read(4, &mut feats));
        assert_eq!(feats.len(), 3);

        assert!(!pipeline.read(4, &mut feats));
        assert!(feats.is_empty());
    }

    #[test]
    fn read_full_batch() {
        let pipeline = toy_pipeline(ModelVariant::Simple);
        pipeline.accept_waveform(&ramp(12)); // 5 frames

        let mut feats = Vec::new();
        assert!(pipeline.read(4, &mut feats));
        assert_eq!(feats.len(), 4);
        assert_eq!(pipeline.num_queued_frames(), 1);
    }

    #[test]
    fn read_blocks_until_producer_delivers() {
        let pipeline = Arc::new(toy_pipeline(ModelVariant::Simple));
        let reader = {
            let pipeline = Arc::clone(&pipeline);
            thread::spawn(move || {
                let mut feats = Vec::new();
                let ok = pipeline.read(2, &mut feats);
                (ok, feats)
            })
        };

        thread::sleep(Duration::from_millis(30));
        assert!(!reader.is_finished());

        pipeline.accept_waveform(&ramp(6)); // 2 frames
        let (ok, feats) = reader.join().unwrap();
        assert!(ok);
        assert_eq!(feats, vec![vec![0.0], vec![2.0]]);
    }

    #[test]
    fn finish_wakes_blocked_reader() {
        let pipeline = Arc::new(toy_pipeline(ModelVariant::Simple));
        let reader = {
            let pipeline = Arc::clone(&pipeline);
            thread::spawn(move || pipeline.read_one())
        };

        thread::sleep(Duration::from_millis(30));
        pipeline.set_input_finished();
        assert_eq!(reader.join().unwrap(), None);
    }

    #[test]
    fn producer_and_consumer_threads() {
        let pipeline = Arc::new(toy_pipeline(ModelVariant::Simple));
        let producer = {
            let pipeline = Arc::clone(&pipeline);
            thread::spawn(move || {
                for chunk in ramp(200).chunks(7) {
                    pipeline.accept_waveform(chunk);
                }
                pipeline.set_input_finished();
            })
        };

        let mut total = Vec::new();
        let mut feats = Vec::new();
        loop {
            let ok = pipeline.read(4, &mut feats);
            total.append(&mut feats);
            if !ok {
                break;
            }
        }
        producer.join().unwrap();

        let expected: Vec<FeatureFrame> = (0..99).map(|i| vec![(i * 2) as f32]).collect();
        assert_eq!(total, expected);
        assert!(pipeline.is_last_frame(98));
    }

    #[test]
    #[should_panic(expected = "set_input_finished called twice")]
    fn finishing_twice_panics() {
        let pipeline = toy_pipeline(ModelVariant::Simple);
        pipeline.set_input_finished();
        pipeline.set_input_finished();
    }

    #[test]
    #[should_panic(expected = "after set_input_finished")]
    fn accept_after_finish_panics() {
        let pipeline = toy_pipeline(ModelVariant::Simple);
        pipeline.set_input_finished();
        pipeline.accept_waveform(&[0.0f32; 4]);
    }

    #[test]
    fn reset_allows_reuse() {
        let pipeline = toy_pipeline(ModelVariant::CtcContext);
        pipeline.accept_waveform(&ramp(21));
        pipeline.set_input_finished();
        pipeline.reset();

        assert!(!pipeline.input_finished());
        assert_eq!(pipeline.num_frames(), 0);
        assert_eq!(pipeline.num_queued_frames(), 0);

        let fresh = toy_pipeline(ModelVariant::CtcContext);
        fresh.accept_waveform(&ramp(40));
        pipeline.accept_waveform(&ramp(40));
        assert_eq!(drain(&pipeline), drain(&fresh));
    }

    #[test]
    fn frame_sizes_for_non_khz_rates() {
        assert_eq!(ms_to_samples(16000, 25), 400);
        let config = FeaturePipelineConfig::new(80, 22050, ModelVariant::Simple);
        assert_eq!(config.frame_length, 551);
        assert_eq!(config.frame_shift, 220);
    }

    #[test]
    fn capacity_below_frames_per_call() {
        let mut config = toy_config(ModelVariant::Simple);
        config.queue_capacity = Some(2);
        let pipeline = Arc::new(FeaturePipeline::with_extractor(
            config,
            Box::new(FirstSample {
                frame_length: 4,
                frame_shift: 2,
            }),
        ));

        let (sender, receiver) = mpsc::channel();
        {
            let pipeline = Arc::clone(&pipeline);
            thread::spawn(move || {
                let mut feats = Vec::new();
                let ok = pipeline.read(4, &mut feats);
                let _ = sender.send((ok, feats));
            });
        }
        thread::sleep(Duration::from_millis(30));

        let (done_sender, done) = mpsc::channel();
        {
            let pipeline = Arc::clone(&pipeline);
            thread::spawn(move || {
                pipeline.accept_waveform(&ramp(12)); // 5 frames
                let _ = done_sender.send(());
            });
        }

        let (ok, feats) = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(ok);
        assert_eq!(feats, vec![vec![0.0], vec![2.0], vec![4.0], vec![6.0]]);
        done.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(pipeline.num_queued_frames(), 1);
    }

    #[test]
    fn output_dim_per_variant() {
        let config = FeaturePipelineConfig::new(80, 16000, ModelVariant::CtcContext);
        assert_eq!(config.output_dim(), 400);
        let config = FeaturePipelineConfig::new(40, 16000, ModelVariant::Simple);
        assert_eq!(config.output_dim(), 40);
    }
}
