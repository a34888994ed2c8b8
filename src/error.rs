use thiserror::Error;

/// Errors produced by the fitting engine.
///
/// Skips are not errors: a failed sensor or a too-small sample set surfaces
/// as `fit_valid = false` in the per-channel result. A batch timeout is not
/// an error either; the coordinator aggregates whatever partial results
/// exist and reports the timeout separately.
#[derive(Debug, Error)]
pub enum FitError {
    /// A value vector did not match the channel count of the series.
    #[error("channel count mismatch: expected {expected}, got {found}")]
    ChannelMismatch { expected: usize, found: usize },

    /// The worker pool could not be constructed.
    #[error("worker pool: {0}")]
    Pool(String),

    /// The series holds no data points.
    #[error("series contains no data")]
    EmptySeries,

    /// A configuration file could not be parsed.
    #[error("config: {0}")]
    Config(#[from] toml::de::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The results table could not be written.
    #[error("table export: {0}")]
    Export(#[from] csv::Error),
}
