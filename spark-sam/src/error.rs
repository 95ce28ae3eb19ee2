use thiserror::Error;

#[derive(Debug, Error)]
pub enum SamError {
    #[error("failed to load model: {0}")]
    Load(#[from] LoadError),
    #[error("failed to preprocess image: {0}")]
    Preprocess(#[from] PreprocessError),
    #[error("image encoding failed: {0:#}")]
    Encode(#[source] anyhow::Error),
    #[error("mask decoding failed: {0:#}")]
    Decode(#[source] anyhow::Error),
    #[error("no image has been encoded in this session")]
    NoImage,
    #[error("postprocessing produced no eligible mask")]
    EmptyResult,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid magic header {found:?}")]
    BadMagic { found: [u8; 8] },
    #[error("unsupported weight file version {0}")]
    UnsupportedVersion(u32),
    #[error("file truncated while reading {0}")]
    Truncated(String),
    #[error("invalid hyperparameters: {0}")]
    InvalidHparams(String),
    #[error("tensor '{name}' has unsupported dtype tag {tag}")]
    UnsupportedDtype { name: String, tag: u32 },
    #[error("tensor '{name}' has invalid rank {n_dims}")]
    InvalidRank { name: String, n_dims: u32 },
    #[error("tensor '{name}' declares {actual} bytes, shape needs {expected}")]
    ByteLengthMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },
    #[error("tensor '{name}' declares {bytes} bytes, above the supported maximum")]
    TensorTooLarge { name: String, bytes: u64 },
    #[error("tensor name is not valid UTF-8 or is too long")]
    InvalidName,
    #[error("required tensor '{0}' is missing")]
    MissingTensor(String),
    #[error("tensor '{name}' has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PreprocessError {
    #[error("image has degenerate size {width}x{height}")]
    EmptyImage { width: usize, height: usize },
    #[error("image buffer holds {actual} bytes, {width}x{height} RGB needs {expected}")]
    ChannelMismatch {
        width: usize,
        height: usize,
        expected: usize,
        actual: usize,
    },
}

pub type Result<T, E = SamError> = std::result::Result<T, E>;
