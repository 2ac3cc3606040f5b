use std::path::PathBuf;

use thiserror::Error;

use crate::shared::frame::Frame;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to open input {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("input stream contains no data")]
    Empty,
    #[error("failed to read frame: {0}")]
    Read(#[from] std::io::Error),
    #[error("frame source already closed")]
    Closed,
}

/// Supplies fixed-size raw frames to the encode loop.
///
/// Implementations never run dry: reaching the end of the underlying stream
/// wraps back to its start.
pub trait FrameSource: Send {
    /// Byte length of every frame returned by `next_frame`.
    fn frame_len(&self) -> usize;

    fn next_frame(&mut self) -> Result<Frame, SourceError>;

    /// Releases the underlying stream. Safe to call more than once.
    fn close(&mut self);
}
