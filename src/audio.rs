use anyhow::{Context, Result as AnyResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, Stream, StreamConfig};
use log::{error, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};

use crate::error::{KwsError, Result};

/// Mono microphone input delivered as fixed-size 16-bit chunks.
///
/// Devices without 16-bit input are opened as float and converted.
pub struct MicrophoneCapture {
    _stream: Stream,
    receiver: Receiver<Vec<i16>>,
}

impl MicrophoneCapture {
    pub fn new(sample_rate: u32, chunk_samples: usize) -> AnyResult<Self> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .context("No input device available")?;

        let supported = device
            .supported_input_configs()
            .context("Failed to get supported configs")?
            .filter(|c| c.channels() == 1)
            .filter(|c| c.min_sample_rate().0 <= sample_rate && c.max_sample_rate().0 >= sample_rate)
            .find(|c| c.sample_format() == SampleFormat::I16);

        let (config, format) = match supported {
            Some(c) => (c.with_sample_rate(SampleRate(sample_rate)).config(), SampleFormat::I16),
            None => (
                StreamConfig {
                    channels: 1,
                    sample_rate: SampleRate(sample_rate),
                    buffer_size: cpal::BufferSize::Default,
                },
                SampleFormat::F32,
            ),
        };
        info!("microphone: {sample_rate} Hz mono {format:?}, {chunk_samples} samples per chunk");

        let (sender, receiver) = mpsc::channel();
        let mut chunker = Chunker::new(chunk_samples, sender);
        let stream = match format {
            SampleFormat::I16 => device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| chunker.push(data.iter().copied()),
                |err| error!("Audio stream error: {err}"),
                None,
            ),
            _ => device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    chunker.push(data.iter().map(|&s| (s * 32767.0).clamp(-32768.0, 32767.0) as i16))
                },
                |err| error!("Audio stream error: {err}"),
                None,
            ),
        }
        .context("Failed to build input stream")?;
        stream.play().context("Failed to start audio stream")?;

        Ok(Self {
            _stream: stream,
            receiver,
        })
    }

    /// Read a chunk of audio (blocking)
    pub fn read(&self) -> AnyResult<Vec<i16>> {
        self.receiver.recv().context("Audio channel closed")
    }
}

/// Splits callback buffers into fixed-size chunks.
struct Chunker {
    size: usize,
    buffer: Vec<i16>,
    sender: Sender<Vec<i16>>,
}

impl Chunker {
    fn new(size: usize, sender: Sender<Vec<i16>>) -> Self {
        let size = size.max(1);
        Self {
            size,
            buffer: Vec::with_capacity(size * 2),
            sender,
        }
    }

    fn push(&mut self, samples: impl Iterator<Item = i16>) {
        self.buffer.extend(samples);
        while self.buffer.len() >= self.size {
            let chunk: Vec<i16> = self.buffer.drain(..self.size).collect();
            let _ = self.sender.send(chunk);
        }
    }
}

/// Read a WAV file as samples in 16-bit range.
///
/// Float files are scaled by 32768. Only the first channel of multichannel
/// files is kept.
pub fn read_wav(path: &Path, expected_rate: u32) -> Result<Vec<f32>> {
    let reader = hound::WavReader::open(path).map_err(|e| KwsError::Audio(format!("{}: {e}", path.display())))?;
    let spec = reader.spec();
    if spec.sample_rate != expected_rate {
        warn!(
            "{}: sample rate {} differs from {expected_rate}, not resampled",
            path.display(),
            spec.sample_rate
        );
    }
    let channels = spec.channels.max(1) as usize;
    if channels > 1 {
        warn!("{}: {channels} channels, using the first", path.display());
    }

    let samples: std::result::Result<Vec<f32>, hound::Error> = match spec.sample_format {
        hound::SampleFormat::Float => reader.into_samples::<f32>().map(|s| s.map(|s| s * 32768.0)).collect(),
        hound::SampleFormat::Int => {
            let scale = 2f32.powi(spec.bits_per_sample as i32 - 16);
            reader.into_samples::<i32>().map(|s| s.map(|s| s as f32 / scale)).collect()
        }
    };
    let samples = samples.map_err(|e| KwsError::Audio(format!("{}: {e}", path.display())))?;

    Ok(samples.into_iter().step_by(channels).collect())
}

/// Read headerless little-endian 16-bit mono PCM.
pub fn read_pcm(path: &Path) -> Result<Vec<f32>> {
    let bytes = fs::read(path)?;
    if bytes.len() % 2 != 0 {
        warn!("{}: odd byte count, last byte ignored", path.display());
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32)
        .collect())
}

/// Read `.wav` with [`read_wav`] and `.pcm`/`.raw` with [`read_pcm`].
pub fn read_audio(path: &Path, expected_rate: u32) -> Result<Vec<f32>> {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("wav") => read_wav(path, expected_rate),
        Some("pcm" | "raw") => read_pcm(path),
        _ => Err(KwsError::Audio(format!("{}: unsupported audio file type", path.display()))),
    }
}

/// All `.wav` files under `dir`, recursively, sorted by path.
pub fn find_wav_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("wav")) {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}
