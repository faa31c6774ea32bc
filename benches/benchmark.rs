use criterion::{criterion_group, criterion_main, Criterion};
use kws_rs::fbank::{Fbank, FeatureExtractor};
use kws_rs::prefix_beam::{CtcPrefixBeamSearch, CtcPrefixBeamSearchOptions};
use kws_rs::{FeaturePipeline, FeaturePipelineConfig, Keyword, ModelVariant};
use std::hint::black_box;

fn tone(num_samples: usize) -> Vec<f32> {
    (0..num_samples)
        .map(|i| 8000.0 * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 16000.0).sin())
        .collect()
}

fn benchmark_fbank(c: &mut Criterion) {
    let mut fbank = Fbank::new(80, 16000, 400, 160);
    // 1s at 16kHz
    let audio = tone(16000);

    c.bench_function("fbank_1s", |b| b.iter(|| fbank.compute(black_box(&audio))));
}

fn benchmark_pipeline(c: &mut Criterion) {
    let config = FeaturePipelineConfig::new(80, 16000, ModelVariant::CtcContext);
    // 100ms chunks like the microphone loop
    let audio = tone(1600);

    c.bench_function("pipeline_100ms_chunk", |b| {
        b.iter_with_setup(
            || FeaturePipeline::new(config.clone()),
            |pipeline| {
                pipeline.accept_waveform(black_box(&audio));
                pipeline.set_input_finished();
                let mut feats = Vec::new();
                while pipeline.read(8, &mut feats) {}
                feats.len()
            },
        )
    });
}

fn benchmark_prefix_beam(c: &mut Criterion) {
    let keyword = Keyword::new("abcd", vec![1, 2, 3, 4], 0);
    // 100 frames over a 2k vocabulary, peaks cycling through the keyword
    let probs: Vec<Vec<f32>> = (0..100)
        .map(|t| {
            let mut frame = vec![0.1 / 2000.0; 2000];
            frame[0] = 0.5;
            frame[t % 5] += 0.3;
            frame[(t + 1) % 5] += 0.1;
            frame
        })
        .collect();

    c.bench_function("prefix_beam_100_frames", |b| {
        b.iter(|| {
            let mut search = CtcPrefixBeamSearch::new(CtcPrefixBeamSearchOptions::default());
            search.search(black_box(&probs), &keyword);
            search.hypotheses().len()
        })
    });
}

criterion_group!(benches, benchmark_fbank, benchmark_pipeline, benchmark_prefix_beam);
criterion_main!(benches);
