use std::fmt;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FacesError {
    #[error("faces: invalid clustering parameters: {0}")]
    Config(#[from] facekit_clusters::ClusterError),

    #[error("faces: invalid settings: {0}")]
    Settings(String),

    #[error("faces: bad data: {0}")]
    Data(String),

    #[error("faces: a run is already in progress")]
    Busy,

    #[error("faces: canceled")]
    Canceled,

    #[error("faces: kv error: {0}")]
    Store(#[from] facekit_kv::KVError),

    #[error("faces: {kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("faces: invalid marker area {0}")]
    InvalidArea(String),

    #[error("faces: face recognition is disabled")]
    Disabled,

    #[error("faces: detector failed: {0}")]
    Detector(String),

    #[error("faces: run aborted by internal fault: {0}")]
    Panic(String),
}

impl FacesError {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        FacesError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Cancellation is a clean stop, safe to resume.
    pub fn is_canceled(&self) -> bool {
        matches!(self, FacesError::Canceled)
    }
}

impl From<serde_json::Error> for FacesError {
    fn from(e: serde_json::Error) -> Self {
        FacesError::Data(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FacesError>;

/// An error that interrupted work after some of it was done.
///
/// `done` holds the counters accumulated up to the failure.
#[derive(Debug)]
pub struct Partial<T> {
    pub error: FacesError,
    pub done: T,
}

impl<T> Partial<T> {
    pub fn new(error: FacesError, done: T) -> Self {
        Self { error, done }
    }
}

impl<T: fmt::Debug> fmt::Display for Partial<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (partial: {:?})", self.error, self.done)
    }
}

impl<T: fmt::Debug> std::error::Error for Partial<T> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
