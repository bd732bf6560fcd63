use thiserror::Error;

/// Invalid clustering input. Always returned before any work starts.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ClusterError {
    #[error("clusters: min points must be at least 1")]
    ZeroMinPoints,

    #[error("clusters: epsilon must be positive, got {0}")]
    InvalidEpsilon(f32),

    #[error("clusters: empty data set")]
    EmptySet,

    #[error("clusters: dimension mismatch at row {row}: expected {expected}, got {got}")]
    DimensionMismatch {
        row: usize,
        expected: usize,
        got: usize,
    },
}
