//! Pipeline error taxonomy.

/// Errors surfaced by the pipeline.
///
/// `Again` and `Malformed` are recoverable at the read loop (skip and keep
/// going); `Eof` ends a stream cleanly; the rest end the worker that hit
/// them.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Nothing usable this round; try the next read.
    #[error("no data available, try again")]
    Again,

    /// Stream ended cleanly.
    #[error("end of stream")]
    Eof,

    /// Protocol parse failure; the offending frame is dropped.
    #[error("malformed data: {0}")]
    Malformed(String),

    /// A bounded table or buffer cannot accept more.
    #[error("capacity exceeded")]
    Overflow,

    /// Allocation failed. Surfaced so the caller decides whether to
    /// terminate.
    #[error("allocation failed")]
    MemFail,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Catch-all; ends the worker loop.
    #[error("{0}")]
    Failure(String),
}

impl From<prost::DecodeError> for Error {
    fn from(e: prost::DecodeError) -> Self {
        Error::Malformed(e.to_string())
    }
}

impl Error {
    /// True for conditions the read loop recovers from by skipping.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Again | Error::Malformed(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
