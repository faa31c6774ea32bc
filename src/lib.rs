pub mod audio;
pub mod backend;
pub mod config;
pub mod error;
pub mod fbank;
pub mod features;
pub mod greedy;
pub mod prefix_beam;
pub mod queue;
pub mod session;
pub mod spotter;
pub mod topk;
pub mod vocab;

// Front end constants - must match the exported model's training config
pub const SAMPLE_RATE: u32 = 16000;
pub const FRAME_LENGTH_MS: u32 = 25;
pub const FRAME_SHIFT_MS: u32 = 10;
pub const NUM_BINS: usize = 80;
pub const LEFT_CONTEXT: usize = 2;
pub const RIGHT_CONTEXT: usize = 2;
pub const DOWNSAMPLING_STRIDE: usize = 3;

// Decoder constants
pub const BLANK_ID: usize = 0;
pub const FIRST_BEAM_SIZE: usize = 3;
pub const SECOND_BEAM_SIZE: usize = 10;
/// Candidates at or below this probability never enter the beam.
pub const MIN_TOKEN_PROB: f32 = 0.05;
/// Fixed trailing axis of the context-model cache tensor.
pub const CTC_CACHE_AXIS: usize = 4;

pub use backend::{InferenceBackend, OnnxBackend};
pub use config::{DecodeMode, KwsConfig, ModelVariant};
pub use error::KwsError;
pub use features::{FeatureFrame, FeaturePipeline, FeaturePipelineConfig};
pub use queue::BoundedQueue;
pub use session::{KwsSession, StepOutcome};
pub use spotter::{KeywordHit, KeywordSpotter, LabelActivation};
pub use vocab::{Keyword, Vocabulary};
