//! File and source error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FileError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid file: {0}")]
    InvalidFile(String),

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("IR file too long: {0} frames")]
    TooLong(u64),

    #[error("Resampler error: {0}")]
    Resample(String),
}

pub type FileResult<T> = Result<T, FileError>;

impl From<hound::Error> for FileError {
    fn from(err: hound::Error) -> Self {
        FileError::DecodeError(err.to_string())
    }
}

impl From<symphonia::core::errors::Error> for FileError {
    fn from(err: symphonia::core::errors::Error) -> Self {
        FileError::DecodeError(err.to_string())
    }
}
