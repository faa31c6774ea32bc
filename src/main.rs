use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use kws_rs::audio::{find_wav_files, read_audio, MicrophoneCapture};
use kws_rs::features::ms_to_samples;
use kws_rs::vocab::load_keyword_list;
use kws_rs::{
    DecodeMode, FeaturePipeline, Keyword, KeywordSpotter, KwsConfig, KwsSession, ModelVariant, OnnxBackend,
    Vocabulary,
};

#[derive(Parser)]
#[command(name = "kws-rs")]
#[command(about = "Streaming keyword spotting with CTC acoustic models")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct CommonArgs {
    /// TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// ONNX model
    #[arg(short, long, global = true)]
    model: Option<PathBuf>,

    /// Token table, or keyword list for simple models
    #[arg(short, long, global = true)]
    tokens: Option<PathBuf>,

    /// Keyword to spot
    #[arg(short, long, global = true)]
    keyword: Option<String>,

    #[arg(long, value_enum, global = true)]
    variant: Option<ModelVariant>,

    #[arg(long, value_enum, global = true)]
    mode: Option<DecodeMode>,

    /// Detection threshold (0.0 - 1.0)
    #[arg(long, global = true)]
    threshold: Option<f32>,

    #[arg(long, global = true)]
    num_bins: Option<usize>,

    /// Feature frames per model call
    #[arg(long, global = true)]
    batch_size: Option<usize>,
}

#[derive(Subcommand)]
enum Command {
    /// Spot the keyword on the default microphone
    Listen,
    /// Spot the keyword in one WAV or raw PCM file
    File { path: PathBuf },
    /// Count hits over a directory of positive WAV files
    Batch {
        dir: PathBuf,

        /// Milliseconds of audio fed per chunk
        #[arg(long, default_value = "100")]
        interval_ms: u32,

        /// Where to list files without a hit
        #[arg(long, default_value = "misses.txt")]
        misses: PathBuf,
    },
}

fn load_config(args: &CommonArgs) -> Result<KwsConfig> {
    let mut config = match &args.config {
        Some(path) => KwsConfig::load(path).with_context(|| format!("Failed to load {}", path.display()))?,
        None => KwsConfig::default(),
    };

    if let Some(model) = &args.model {
        config.model_path = Some(model.clone());
    }
    if let Some(tokens) = &args.tokens {
        config.tokens_path = Some(tokens.clone());
    }
    if let Some(keyword) = &args.keyword {
        config.keyword = Some(keyword.clone());
    }
    if let Some(variant) = args.variant {
        config.model_variant = variant;
    }
    if let Some(mode) = args.mode {
        config.decode_mode = mode;
    }
    if let Some(threshold) = args.threshold {
        config.detection_score_threshold = threshold;
    }
    if let Some(num_bins) = args.num_bins {
        config.num_bins = num_bins;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }

    config.validate()?;
    Ok(config)
}

/// `threaded` sessions read from a producer on another thread; the others
/// feed and drain the pipeline themselves.
fn build_session(config: &KwsConfig, threaded: bool) -> Result<KwsSession<OnnxBackend>> {
    let model_path = config.model_path.as_deref().context("No model given (--model)")?;
    let tokens_path = config.tokens_path.as_deref().context("No token file given (--tokens)")?;

    let (keyword, labels) = match config.model_variant {
        ModelVariant::CtcContext => {
            let text = config.keyword.as_deref().context("No keyword given (--keyword)")?;
            let vocab = Vocabulary::load(tokens_path)
                .with_context(|| format!("Failed to load tokens {}", tokens_path.display()))?;
            let keyword = vocab.keyword(text, config.blank_id);
            if keyword.is_empty() {
                bail!("Keyword {text:?} has no tokens in the vocabulary");
            }
            info!("keyword {text} -> tokens {:?}", keyword.tokens());
            (keyword, Vec::new())
        }
        ModelVariant::Simple => {
            let labels = load_keyword_list(tokens_path)
                .with_context(|| format!("Failed to load keywords {}", tokens_path.display()))?;
            info!("keywords: {labels:?}");
            (Keyword::default(), labels)
        }
    };

    let start = Instant::now();
    let backend = OnnxBackend::new(model_path, config.num_threads)?;
    info!("model loaded in {:.2}s", start.elapsed().as_secs_f32());

    let feature_config = if threaded {
        config.feature_config()
    } else {
        if config.queue_capacity.is_some() {
            warn!("queue_capacity only applies to listen, ignored");
        }
        config.single_thread_feature_config()
    };
    let pipeline = Arc::new(FeaturePipeline::new(feature_config));
    let spotter = KeywordSpotter::from_config(backend, config, keyword);
    Ok(KwsSession::new(pipeline, spotter, config.batch_size, config.detection_score_threshold).with_labels(labels))
}

fn print_hit(source: &str, hit: &kws_rs::KeywordHit) {
    println!(
        "{source}: {} score {:.3} frames {}..={}",
        hit.keyword, hit.score, hit.start_frame, hit.end_frame
    );
}

fn listen(config: &KwsConfig, mut session: KwsSession<OnnxBackend>) -> Result<()> {
    let pipeline = Arc::clone(session.pipeline());
    let audio = MicrophoneCapture::new(config.sample_rate, config.chunk_samples())?;

    let consumer = thread::spawn(move || session.run_with(|hit| print_hit("mic", hit)));

    println!("Listening... (Ctrl+C to quit)");
    loop {
        match audio.read() {
            Ok(chunk) => pipeline.accept_waveform(&chunk),
            Err(e) => {
                warn!("{e:#}");
                break;
            }
        }
    }

    pipeline.set_input_finished();
    match consumer.join() {
        Ok(result) => result.map(|_| ()).map_err(Into::into),
        Err(_) => bail!("Decoder thread panicked"),
    }
}

fn spot_file(config: &KwsConfig, mut session: KwsSession<OnnxBackend>, path: &Path) -> Result<()> {
    let wav = read_audio(path, config.sample_rate)?;
    info!("{}: {} samples", path.display(), wav.len());

    let mut hits = Vec::new();
    for chunk in wav.chunks(config.chunk_samples().max(1)) {
        session.pipeline().accept_waveform(chunk);
        hits.extend(session.process_ready()?);
    }
    hits.extend(session.finish()?);

    let name = path.display().to_string();
    for hit in &hits {
        print_hit(&name, hit);
    }
    if hits.is_empty() {
        println!("{name}: no keyword");
    }
    Ok(())
}

fn batch(
    config: &KwsConfig,
    mut session: KwsSession<OnnxBackend>,
    dir: &Path,
    interval_ms: u32,
    misses_path: &Path,
) -> Result<()> {
    let files = find_wav_files(dir)?;
    if files.is_empty() {
        bail!("No WAV files under {}", dir.display());
    }
    let interval = ms_to_samples(config.sample_rate, interval_ms).max(1);

    let mut misses = Vec::new();
    let mut processed = 0;
    for (i, path) in files.iter().enumerate() {
        session.reset();
        let wav = match read_audio(path, config.sample_rate) {
            Ok(wav) => wav,
            Err(e) => {
                warn!("skipping {}: {e}", path.display());
                continue;
            }
        };

        processed += 1;
        let mut hit = false;
        for chunk in wav.chunks(interval) {
            session.pipeline().accept_waveform(chunk);
            hit |= !session.process_ready()?.is_empty();
        }
        hit |= !session.finish()?.is_empty();

        println!("[{}/{}] {} {}", i + 1, files.len(), path.display(), if hit { "hit" } else { "miss" });
        if !hit {
            misses.push(path.display().to_string());
        }
    }

    let tp = processed - misses.len();
    let recall = if processed > 0 { tp as f32 / processed as f32 } else { 0.0 };
    println!("TP: {tp} FN: {} recall: {recall:.3}", misses.len());

    let mut listing = misses.join("\n");
    listing.push('\n');
    fs::write(misses_path, listing).with_context(|| format!("Failed to write {}", misses_path.display()))?;
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = load_config(&cli.common)?;
    let session = build_session(&config, matches!(cli.command, Command::Listen))?;

    match &cli.command {
        Command::Listen => listen(&config, session),
        Command::File { path } => spot_file(&config, session, path),
        Command::Batch {
            dir,
            interval_ms,
            misses,
        } => batch(&config, session, dir, *interval_ms, misses),
    }
}
