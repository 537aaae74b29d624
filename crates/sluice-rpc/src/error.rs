use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("stream is closed")]
    ClosedStream,
    #[error("buffered bytes would exceed the cap: need {need}, cap {cap}")]
    BufferOverflow { need: usize, cap: usize },
    #[error("invalid frame header")]
    InvalidFrame,
    #[error("frame of {0} bytes does not fit the wire format")]
    FrameTooLarge(usize),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("handler failed: {0}")]
    Handler(#[from] Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T> = std::result::Result<T, Error>;
