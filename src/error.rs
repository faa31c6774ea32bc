use thiserror::Error;

/// Errors surfaced by the keyword spotting library.
#[derive(Error, Debug)]
pub enum KwsError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("ONNX Runtime: {0}")]
    Ort(#[from] ort::Error),

    #[error("Shape: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("Model metadata `{0}` missing or not an integer")]
    Metadata(String),

    #[error("Model output `{0}` not found")]
    OutputNotFound(String),

    #[error("Audio: {0}")]
    Audio(String),
}

pub type Result<T> = std::result::Result<T, KwsError>;
