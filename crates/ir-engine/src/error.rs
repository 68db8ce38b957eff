//! Facade error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error(transparent)]
    File(#[from] ir_file::FileError),

    #[error("engine error: {0}")]
    Engine(#[from] ir_dsp::EngineError),

    #[error("convolver failed to start")]
    NotReady,
}

pub type LoadResult<T> = Result<T, LoadError>;
