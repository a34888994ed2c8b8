use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::coordinator::FitResult;
use crate::Result;

/// Column names of the delimited export, one metric or parameter each.
pub const COLUMN_NAMES: [&str; 15] = [
    "channel",
    "failed",
    "fit_valid",
    "n_samples",
    "sigma_error",
    "sigma_noise",
    "tau90",
    "f_t90",
    "t10_recovery",
    "alpha_1",
    "beta_1",
    "t0_1",
    "alpha_2",
    "beta_2",
    "t0_2",
];

/// Aggregated per-channel results of one fit run.
///
/// Conceptually one column per channel with a row per metric; the
/// delimited export transposes this to one line per channel for
/// spreadsheet use.
#[derive(Clone, Debug)]
pub struct ResultsTable {
    results: Vec<FitResult>,
}

impl ResultsTable {
    pub(crate) const fn new(results: Vec<FitResult>) -> Self {
        Self { results }
    }

    #[must_use]
    pub fn results(&self) -> &[FitResult] {
        &self.results
    }

    #[must_use]
    pub fn channel(&self, channel: usize) -> Option<&FitResult> {
        self.results.get(channel)
    }

    #[must_use]
    pub fn n_channels(&self) -> usize {
        self.results.len()
    }

    /// Write the semicolon-delimited table: a header row naming each
    /// metric/parameter, then one data row per channel.
    ///
    /// # Errors
    /// Returns an error when the underlying writer fails.
    pub fn write_delimited<W: Write>(&self, writer: W) -> Result<()> {
        let mut out = csv::WriterBuilder::new().delimiter(b';').from_writer(writer);
        out.write_record(COLUMN_NAMES)?;
        for (channel, result) in self.results.iter().enumerate() {
            out.write_record(row(channel, result))?;
        }
        out.flush()?;
        Ok(())
    }

    /// Write the delimited table to a file.
    ///
    /// # Errors
    /// Returns an error when the file cannot be created or written.
    pub fn write_to_path(&self, path: &Path) -> Result<()> {
        self.write_delimited(File::create(path)?)
    }
}

fn row(channel: usize, result: &FitResult) -> Vec<String> {
    let number = |v: f64| format!("{v:.6}");
    let parameter = |select: fn(&crate::model::Parameters) -> f64| {
        result
            .parameters
            .as_ref()
            .map_or_else(String::new, |p| number(select(p)))
    };

    vec![
        channel.to_string(),
        result.channel_failed.to_string(),
        result.fit_valid.to_string(),
        result.n_samples.to_string(),
        number(result.sigma_error),
        number(result.sigma_noise),
        number(result.tau_90),
        number(result.f_t90),
        number(result.t10_recovery),
        parameter(|p| p.alpha_1),
        parameter(|p| p.beta_1),
        parameter(|p| p.t0_1),
        parameter(|p| p.alpha_2),
        parameter(|p| p.beta_2),
        parameter(|p| p.t0_2),
    ]
}
