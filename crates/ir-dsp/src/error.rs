//! Engine error types

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
    #[error("operation is not legal in the current engine state")]
    BadState,

    #[error("configuration parameter out of range")]
    BadParam,

    #[error("buffer allocation or FFT plan failure")]
    MemAlloc,
}

pub type EngineResult<T> = Result<T, EngineError>;
