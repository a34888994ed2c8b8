use std::num::NonZeroUsize;
use std::time::Duration;

use crossbeam_channel::Sender;

use crate::config::FitConfig;
use crate::coordinator::{FitCoordinator, FitEvent};
use crate::error::FitError;
use crate::report::ResultsTable;
use crate::series::TimeSeries;
use crate::Result;

/// Seconds of wait budget granted per channel when no timeout is given.
const TIMEOUT_PER_CHANNEL: u64 = 10;

/// Headless batch driver around [`FitCoordinator`].
///
/// Selects the exposition and recovery windows from offsets into the data,
/// fills in defaults for timeout and worker count, then runs one complete
/// range-detect/fit cycle and blocks until it finishes or times out.
#[derive(Clone, Debug)]
pub struct AutomatedFitWorker {
    config: FitConfig,
    offset: i64,
    duration: Option<i64>,
    recovery_duration: Option<i64>,
    timeout: Option<Duration>,
    workers: Option<usize>,
    progress: Option<Sender<FitEvent>>,
}

/// What a batch run produced. A timeout is reported, never fatal: the
/// table then covers the channels that finished in time.
#[derive(Clone, Debug)]
pub struct BatchOutcome {
    pub table: ResultsTable,
    pub timed_out: bool,
    /// Per-channel solver failures as (channel, message).
    pub errors: Vec<(usize, String)>,
}

impl AutomatedFitWorker {
    #[must_use]
    pub const fn new(config: FitConfig) -> Self {
        Self {
            config,
            offset: 0,
            duration: None,
            recovery_duration: None,
            timeout: None,
            workers: None,
            progress: None,
        }
    }

    /// Seconds between the first data point and the exposition window.
    #[must_use]
    pub const fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }

    /// Exposition window length in seconds; end-of-data when unset.
    #[must_use]
    pub const fn with_duration(mut self, duration: i64) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Recovery window length in seconds; the remaining data when unset.
    #[must_use]
    pub const fn with_recovery_duration(mut self, duration: i64) -> Self {
        self.recovery_duration = Some(duration);
        self
    }

    /// Wait budget for the whole run; 10 s per channel when unset.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Worker-pool size; all available cores when unset.
    #[must_use]
    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Sink for per-channel progress events.
    #[must_use]
    pub fn with_progress_sink(mut self, sink: Sender<FitEvent>) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Run the full pipeline against `series`.
    ///
    /// # Errors
    /// Returns an error when the series is empty or the worker pool cannot
    /// be built. Timeouts and per-channel solver failures are reported in
    /// the outcome instead.
    pub fn run(&self, series: &TimeSeries, failures: &[bool]) -> Result<BatchOutcome> {
        let first = series.first_timestamp().ok_or(FitError::EmptySeries)?;
        let last = series.last_timestamp().ok_or(FitError::EmptySeries)?;

        let exposition_start = first + self.offset;
        let exposition_end = self
            .duration
            .map_or(last, |duration| exposition_start + duration)
            .min(last);

        let mut config = self.config.clone();
        config.t_recovery = self
            .recovery_duration
            .unwrap_or(last - exposition_end)
            .max(0);

        let n_channels = series.n_channels();
        let workers = self
            .workers
            .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, NonZeroUsize::get));
        let timeout = self
            .timeout
            .unwrap_or_else(|| Duration::from_secs(TIMEOUT_PER_CHANNEL * n_channels as u64));

        log::debug!(
            "batch fit: window [{exposition_start}, {exposition_end}], recovery {} s, \
             {workers} workers, timeout {timeout:?}",
            config.t_recovery
        );

        let mut coordinator = FitCoordinator::new(n_channels, workers, config)?;
        if let Some(sink) = &self.progress {
            coordinator.set_progress_sink(sink.clone());
        }

        coordinator.determine_ranges(series, failures, exposition_start..=exposition_end);
        coordinator.start_fit(series, failures);
        let complete = coordinator.wait(timeout);
        if !complete {
            log::warn!("batch fit timed out after {timeout:?}; results are partial");
        }

        let table = coordinator
            .table()
            .cloned()
            .unwrap_or_else(|| ResultsTable::new(Vec::new()));

        Ok(BatchOutcome {
            table,
            timed_out: !complete,
            errors: coordinator.fit_errors().to_vec(),
        })
    }
}

impl BatchOutcome {
    /// Write the semicolon-delimited results table to a file.
    ///
    /// # Errors
    /// Returns an error when the file cannot be created or written.
    pub fn write_to_path(&self, path: &std::path::Path) -> Result<()> {
        self.table.write_to_path(path)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array1;

    use super::AutomatedFitWorker;
    use crate::config::FitConfig;
    use crate::error::FitError;
    use crate::series::TimeSeries;

    #[test]
    fn an_empty_series_is_rejected() {
        let worker = AutomatedFitWorker::new(FitConfig::default());
        let err = worker.run(&TimeSeries::new(1), &[false]).unwrap_err();
        assert!(matches!(err, FitError::EmptySeries));
    }

    #[test]
    fn skip_only_runs_complete_without_fitting_work() {
        // All channels failed, so the run finishes immediately and the
        // table still has one row per channel.
        let mut series = TimeSeries::new(3);
        for t in 0..=50 {
            series
                .insert(t, Array1::from(vec![0.0, 1.0, 2.0]))
                .unwrap();
        }

        let outcome = AutomatedFitWorker::new(FitConfig::default())
            .with_workers(2)
            .run(&series, &[true, true, true])
            .unwrap();

        assert!(!outcome.timed_out);
        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.table.n_channels(), 3);
        assert!(outcome
            .table
            .results()
            .iter()
            .all(|r| r.channel_failed && !r.fit_valid));
    }
}
