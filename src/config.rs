use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Configuration for range detection and curve fitting.
///
/// Every field has a default, so a TOML file only needs to name the values
/// it overrides:
///
/// ```
/// use response_fit::FitConfig;
///
/// let config = FitConfig::from_toml_str("jump_factor = 6.0").unwrap();
/// assert_eq!(config.jump_factor, 6.0);
/// assert_eq!(config.fit_buffer, FitConfig::default().fit_buffer);
/// ```
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FitConfig {
    /// Detect the exposition start by jump detection. When `false` the
    /// entire window becomes the fitting range.
    pub detect_exposition_start: bool,
    /// Detect the recovery start and cut the sample set there. Only
    /// meaningful together with `detect_exposition_start`.
    pub detect_recovery_start: bool,
    /// Noise multiple in the jump threshold
    /// `jump_factor * sigma + jump_base_threshold`.
    pub jump_factor: f64,
    /// Absolute floor of the jump threshold, in relative deviation (%).
    pub jump_base_threshold: f64,
    /// Noise multiple the recovery slope must exceed.
    pub recovery_factor: f64,
    /// Length of the local line-fit window, in seconds.
    pub fit_buffer: i64,
    /// Number of random restarts per minimization strategy.
    pub n_iterations: usize,
    /// Plateau bound multiplier in the parameter validity check.
    pub limit_factor: f64,
    /// Maximum recovery window in seconds; `t10_recovery` is censored here.
    pub t_recovery: i64,
    /// Rolling-average window used for recovery-time determination, in
    /// seconds.
    pub t_average: i64,
    /// Base seed for restart initialization. Each channel derives its own
    /// stream from it, so results do not depend on worker scheduling.
    pub random_seed: u64,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            detect_exposition_start: true,
            detect_recovery_start: false,
            jump_factor: 4.0,
            jump_base_threshold: 0.2,
            recovery_factor: 2.0,
            fit_buffer: 50,
            n_iterations: 100,
            limit_factor: 10.0,
            t_recovery: 300,
            t_average: 5,
            random_seed: 40,
        }
    }
}

impl FitConfig {
    /// Parse a configuration from TOML text.
    ///
    /// # Errors
    /// Returns an error when the text is not valid TOML or a field has the
    /// wrong type.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Read a configuration from a TOML file.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or parsed.
    pub fn from_path(path: &Path) -> Result<Self> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    /// Whether switching to `other` invalidates previously determined
    /// channel ranges.
    pub(crate) fn invalidates_ranges(&self, other: &Self) -> bool {
        self.detect_exposition_start != other.detect_exposition_start
            || self.detect_recovery_start != other.detect_recovery_start
            || self.jump_factor != other.jump_factor
            || self.jump_base_threshold != other.jump_base_threshold
            || self.recovery_factor != other.recovery_factor
            || self.fit_buffer != other.fit_buffer
    }
}
