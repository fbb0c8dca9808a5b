use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// ErrNoMessage indicates that a control request carried no body at all.
    #[error("no message")]
    ErrNoMessage,

    /// ErrInvalidJson indicates a body or an MJR info header that is not
    /// well-formed JSON (or not a JSON object where one is required).
    #[error("invalid json")]
    ErrInvalidJson,

    /// ErrInvalidRequest indicates an unknown `request` verb.
    #[error("unknown request '{0}'")]
    ErrInvalidRequest(String),

    /// ErrInvalidElement indicates a request field of the wrong type.
    #[error("invalid element type ({0})")]
    ErrInvalidElement(&'static str),

    /// ErrMissingElement indicates a required request field that is absent.
    #[error("missing element ({0})")]
    ErrMissingElement(&'static str),

    /// ErrNotFound indicates a recording id with no live registry entry.
    #[error("recording not found")]
    ErrNotFound,

    /// ErrInvalidRecording indicates a recording none of whose tracks could
    /// be indexed for replay.
    #[error("recording cannot be indexed")]
    ErrInvalidRecording,

    /// ErrInvalidState indicates an operation incompatible with the
    /// session's current role or phase.
    #[error("invalid state ({0})")]
    ErrInvalidState(&'static str),

    /// ErrInvalidSdp indicates an offer or answer that failed to parse.
    #[error("invalid sdp")]
    ErrInvalidSdp,

    /// ErrRecordingExists indicates an id collision on `record`.
    #[error("recording already exists")]
    ErrRecordingExists,

    /// ErrUnknown is the catch-all for invariant violations, including
    /// operating on a destroyed session.
    #[error("{0}")]
    ErrUnknown(&'static str),

    #[error("invalid MJR header")]
    ErrInvalidHeader,
    #[error("missing info header field ({0})")]
    ErrMissingField(&'static str),
    #[error("unsupported codec '{0}'")]
    ErrUnsupportedCodec(String),
    #[error("writer already closed")]
    ErrWriterClosed,
    #[error("frame cannot be stored in an MJR record")]
    ErrInvalidFrame,
    #[error("recordings path unusable: {0}")]
    ErrInvalidPath(String),

    #[error("{0}")]
    Io(#[source] IoError),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// code maps protocol-visible errors to their fixed wire codes.
    pub fn code(&self) -> u16 {
        match self {
            Error::ErrNoMessage => 411,
            Error::ErrInvalidJson => 412,
            Error::ErrInvalidRequest(_) => 413,
            Error::ErrInvalidElement(_) => 414,
            Error::ErrMissingElement(_) => 415,
            Error::ErrNotFound => 416,
            Error::ErrInvalidRecording => 417,
            Error::ErrInvalidState(_) => 418,
            Error::ErrInvalidSdp => 419,
            Error::ErrRecordingExists => 420,
            _ => 499,
        }
    }
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}
