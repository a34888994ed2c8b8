//! Per-channel fit tasks on a bounded worker pool, plus the coordinator
//! that schedules them and aggregates results.
//!
//! One task per channel runs on a fixed-size pool. Tasks communicate only
//! through value channels and a mutex-guarded countdown; a task failure is
//! a tagged error value, never an unwound panic, so one channel's
//! numerical trouble cannot abort the others. The coordinator's only
//! suspension point is the bounded wait for the countdown: a timeout stops
//! the wait, not the in-flight tasks, whose late results are simply
//! dropped.

use std::ops::RangeInclusive;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use ndarray_rand::rand::SeedableRng;
use rand_isaac::Isaac64Rng;

use crate::config::FitConfig;
use crate::error::FitError;
use crate::minimisation::{fit_samples, response_metrics};
use crate::model::Parameters;
use crate::ranges::{determine_channel_ranges, ChannelRange};
use crate::report::ResultsTable;
use crate::series::TimeSeries;
use crate::Result;

/// Fraction of the detection window a channel's sample set must reach to
/// be fitted at all.
const MIN_SAMPLE_FRACTION: f64 = 0.15;

/// Spreads the per-channel seeds across the generator's state space.
const SEED_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

/// Lifecycle of a [`FitCoordinator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    RangeDetermining,
    Ready,
    Fitting,
    Aggregating,
    Done,
}

/// Progress notification delivered to the external sink.
#[derive(Clone, Debug)]
pub enum FitEvent {
    ChannelFinished {
        channel: usize,
        /// Channels finished so far, including this one.
        finished: usize,
        total: usize,
        /// Message of a per-channel solver failure, if any.
        error: Option<String>,
    },
}

/// Per-channel outcome of one fit run.
#[derive(Clone, Debug, PartialEq)]
pub struct FitResult {
    pub channel_failed: bool,
    pub fit_valid: bool,
    pub n_samples: usize,
    /// Root-mean-square residual of the winning fit.
    pub sigma_error: f64,
    /// Pre-exposition drift std-dev from range detection.
    pub sigma_noise: f64,
    pub tau_90: f64,
    pub f_t90: f64,
    /// Seconds from the exposition end to the 10%-of-plateau crossing;
    /// censored at the configured recovery window when no crossing exists.
    pub t10_recovery: f64,
    pub parameters: Option<Parameters>,
}

impl FitResult {
    fn skipped(channel_failed: bool, n_samples: usize, sigma_noise: f64, t_recovery: i64) -> Self {
        Self {
            channel_failed,
            fit_valid: false,
            n_samples,
            sigma_error: 0.0,
            sigma_noise,
            tau_90: 0.0,
            f_t90: 0.0,
            t10_recovery: t_recovery as f64,
            parameters: None,
        }
    }
}

/// Everything one channel's task needs, owned so the task is `'static`.
struct TaskInput {
    channel: usize,
    channel_failed: bool,
    samples: Vec<(f64, f64)>,
    /// (seconds past the exposition end, baseline-subtracted value) pairs
    /// for recovery scanning.
    tail: Vec<(f64, f64)>,
    sigma_noise: f64,
    min_count: f64,
    n_iterations: usize,
    limit_factor: f64,
    t_recovery: i64,
    t_average: i64,
    seed: u64,
}

/// Mutex-guarded countdown for "all channels done".
struct Countdown {
    finished: Mutex<usize>,
    all_done: Condvar,
}

impl Countdown {
    fn new() -> Self {
        Self {
            finished: Mutex::new(0),
            all_done: Condvar::new(),
        }
    }

    /// Count one task as finished. `report` runs under the lock with the
    /// new count, so anything it publishes is visible before a satisfied
    /// [`Self::wait`] returns.
    fn complete_one(&self, report: impl FnOnce(usize)) {
        let mut finished = self
            .finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *finished += 1;
        report(*finished);
        self.all_done.notify_all();
    }

    /// Wait until `target` tasks reported or `deadline` passed; reports
    /// whether the target was reached.
    fn wait(&self, target: usize, deadline: Instant) -> bool {
        let mut finished = self
            .finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while *finished < target {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .all_done
                .wait_timeout(finished, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            finished = guard;
        }
        true
    }
}

struct PendingRun {
    outputs: Receiver<(usize, ::std::result::Result<FitResult, String>)>,
    countdown: Arc<Countdown>,
}

/// Schedules one fit task per channel and aggregates their results.
///
/// The channel count is fixed at construction; series and failure bitsets
/// handed to the methods must match it.
pub struct FitCoordinator {
    n_channels: usize,
    config: FitConfig,
    pool: rayon::ThreadPool,
    phase: Phase,
    range_redetermination_possible: bool,
    ranges: Vec<ChannelRange>,
    window_len: usize,
    results: Vec<FitResult>,
    errors: Vec<(usize, String)>,
    table: Option<ResultsTable>,
    progress: Option<Sender<FitEvent>>,
    pending: Option<PendingRun>,
}

impl FitCoordinator {
    /// Create a coordinator with a pool of `workers` threads.
    ///
    /// # Errors
    /// Returns [`FitError::Pool`] when the pool cannot be built.
    pub fn new(n_channels: usize, workers: usize, config: FitConfig) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|ii| format!("fit-worker-{ii}"))
            .build()
            .map_err(|e| FitError::Pool(e.to_string()))?;

        Ok(Self {
            n_channels,
            config,
            pool,
            phase: Phase::Idle,
            range_redetermination_possible: false,
            ranges: vec![ChannelRange::default(); n_channels],
            window_len: 0,
            results: Vec::new(),
            errors: Vec::new(),
            table: None,
            progress: None,
            pending: None,
        })
    }

    #[must_use]
    pub const fn n_channels(&self) -> usize {
        self.n_channels
    }

    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    #[must_use]
    pub const fn range_redetermination_possible(&self) -> bool {
        self.range_redetermination_possible
    }

    #[must_use]
    pub const fn config(&self) -> &FitConfig {
        &self.config
    }

    /// Register the sink for per-channel progress events.
    pub fn set_progress_sink(&mut self, sink: Sender<FitEvent>) {
        self.progress = Some(sink);
    }

    /// Replace the configuration. A change to a detection-affecting field
    /// after ranges were computed raises the redetermination flag.
    pub fn set_config(&mut self, config: FitConfig) {
        if self.phase != Phase::Idle && self.config.invalidates_ranges(&config) {
            self.range_redetermination_possible = true;
        }
        self.config = config;
    }

    /// Run range detection for every channel inside `window`.
    ///
    /// # Panics
    /// When the series channel count or the failure bitset do not match
    /// this coordinator.
    pub fn determine_ranges(
        &mut self,
        series: &TimeSeries,
        failures: &[bool],
        window: RangeInclusive<i64>,
    ) {
        assert_eq!(series.n_channels(), self.n_channels);
        self.phase = Phase::RangeDetermining;
        self.window_len = series.window(window.clone()).count();
        self.ranges = determine_channel_ranges(series, failures, &window, &self.config);
        self.range_redetermination_possible = false;
        self.phase = Phase::Ready;
    }

    #[must_use]
    pub fn ranges(&self) -> &[ChannelRange] {
        &self.ranges
    }

    /// Per-channel overlay samples for external plotting.
    ///
    /// # Panics
    /// When `channel` is out of range.
    #[must_use]
    pub fn channel_samples(&self, channel: usize) -> &[(f64, f64)] {
        &self.ranges[channel].samples
    }

    /// Insert `timestamp` into one channel's sample set without rerunning
    /// detection; raises the redetermination flag. Reports whether the
    /// timestamp existed in the series.
    ///
    /// # Panics
    /// When `channel` is out of range.
    pub fn add_to_range(&mut self, series: &TimeSeries, channel: usize, timestamp: i64) -> bool {
        assert!(channel < self.n_channels);
        let Some(value) = series.value(timestamp, channel) else {
            return false;
        };
        let range = &mut self.ranges[channel];
        range.insert_sample((timestamp - range.x_start) as f64, value - range.y_offset);
        self.range_redetermination_possible = true;
        true
    }

    /// Remove `timestamp` from one channel's sample set; raises the
    /// redetermination flag when a sample was removed.
    ///
    /// # Panics
    /// When `channel` is out of range.
    pub fn remove_from_range(&mut self, channel: usize, timestamp: i64) -> bool {
        let range = &mut self.ranges[channel];
        let removed = range.remove_sample((timestamp - range.x_start) as f64);
        if removed {
            self.range_redetermination_possible = true;
        }
        removed
    }

    /// Submit one fit task per channel to the worker pool.
    ///
    /// # Panics
    /// When ranges have not been determined yet, or the failure bitset
    /// does not match the channel count.
    pub fn start_fit(&mut self, series: &TimeSeries, failures: &[bool]) {
        assert!(
            matches!(self.phase, Phase::Ready | Phase::Done),
            "ranges must be determined before fitting"
        );
        assert_eq!(failures.len(), self.n_channels);

        let min_count = MIN_SAMPLE_FRACTION * self.window_len as f64;
        let (outputs_tx, outputs_rx) = unbounded();
        let countdown = Arc::new(Countdown::new());

        self.errors.clear();
        self.table = None;
        // Placeholders so a timed-out run still exports sane rows for the
        // channels that never reported.
        let placeholders: Vec<FitResult> = (0..self.n_channels)
            .map(|channel| {
                FitResult::skipped(
                    failures[channel],
                    self.ranges[channel].samples.len(),
                    self.ranges[channel].sigma_noise,
                    self.config.t_recovery,
                )
            })
            .collect();
        self.results = placeholders;
        self.phase = Phase::Fitting;

        for channel in 0..self.n_channels {
            let input = TaskInput {
                channel,
                channel_failed: failures[channel],
                samples: self.ranges[channel].samples.clone(),
                tail: self.recovery_tail(series, channel),
                sigma_noise: self.ranges[channel].sigma_noise,
                min_count,
                n_iterations: self.config.n_iterations,
                limit_factor: self.config.limit_factor,
                t_recovery: self.config.t_recovery,
                t_average: self.config.t_average,
                seed: self
                    .config
                    .random_seed
                    .wrapping_add((channel as u64).wrapping_mul(SEED_STRIDE)),
            };
            let outputs = outputs_tx.clone();
            let countdown = Arc::clone(&countdown);
            let progress = self.progress.clone();
            let total = self.n_channels;

            self.pool.spawn(move || {
                let outcome = run_task(&input);
                let error = outcome.as_ref().err().cloned();
                // Send before counting so a satisfied countdown implies
                // every output is already queued.
                let _ = outputs.send((input.channel, outcome));
                countdown.complete_one(|finished| {
                    if let Some(sink) = progress {
                        let _ = sink.send(FitEvent::ChannelFinished {
                            channel: input.channel,
                            finished,
                            total,
                            error,
                        });
                    }
                });
            });
        }

        self.pending = Some(PendingRun {
            outputs: outputs_rx,
            countdown,
        });
    }

    /// Block until every channel reported or `timeout` elapsed, then
    /// aggregate the results table. Reports whether all channels finished;
    /// on timeout the table covers whatever results arrived in time and
    /// stragglers keep running on the pool.
    pub fn wait(&mut self, timeout: Duration) -> bool {
        let Some(pending) = self.pending.take() else {
            return self.phase == Phase::Done;
        };

        let deadline = Instant::now() + timeout;
        let complete = pending.countdown.wait(self.n_channels, deadline);
        if !complete {
            log::warn!("fit wait timed out after {timeout:?}; aggregating partial results");
        }

        self.phase = Phase::Aggregating;
        while let Ok((channel, outcome)) = pending.outputs.try_recv() {
            match outcome {
                Ok(result) => self.results[channel] = result,
                Err(message) => {
                    log::warn!("channel {channel}: fit failed: {message}");
                    self.errors.push((channel, message));
                }
            }
        }
        self.table = Some(ResultsTable::new(self.results.clone()));
        self.phase = Phase::Done;
        complete
    }

    /// Per-channel results of the last run.
    #[must_use]
    pub fn results(&self) -> &[FitResult] {
        &self.results
    }

    /// Per-channel solver failures of the last run, as (channel, message).
    #[must_use]
    pub fn fit_errors(&self) -> &[(usize, String)] {
        &self.errors
    }

    /// Aggregated table of the last completed run.
    #[must_use]
    pub const fn table(&self) -> Option<&ResultsTable> {
        self.table.as_ref()
    }

    /// Baseline-subtracted series tail following one channel's exposition
    /// window, clipped to the recovery window.
    #[allow(clippy::cast_possible_truncation)]
    fn recovery_tail(&self, series: &TimeSeries, channel: usize) -> Vec<(f64, f64)> {
        let range = &self.ranges[channel];
        let Some(&(last_relative, _)) = range.samples.last() else {
            return Vec::new();
        };
        let x_end = range.x_start + last_relative as i64;
        series
            .channel_window(channel, x_end..=x_end + self.config.t_recovery)
            .into_iter()
            .map(|(t, y)| ((t - x_end) as f64, y - range.y_offset))
            .collect()
    }
}

fn run_task(input: &TaskInput) -> ::std::result::Result<FitResult, String> {
    if input.channel_failed {
        return Ok(FitResult::skipped(true, 0, 0.0, input.t_recovery));
    }

    let n_samples = input.samples.len();
    if n_samples == 0 || (n_samples as f64) < input.min_count {
        log::debug!(
            "channel {}: skipped with {} samples (minimum {:.0})",
            input.channel,
            n_samples,
            input.min_count
        );
        return Ok(FitResult::skipped(
            false,
            n_samples,
            input.sigma_noise,
            input.t_recovery,
        ));
    }

    let mut rng = Isaac64Rng::seed_from_u64(input.seed);
    let Some(best) = fit_samples(
        &input.samples,
        input.n_iterations,
        input.limit_factor,
        &mut rng,
    )?
    else {
        log::debug!("channel {}: no restart produced a valid fit", input.channel);
        return Ok(FitResult::skipped(
            false,
            n_samples,
            input.sigma_noise,
            input.t_recovery,
        ));
    };

    let t_first = input.samples[0].0;
    let t_last = input.samples[n_samples - 1].0;
    let metrics = response_metrics(&best.params, t_first, t_last)?;
    let t10_recovery = recovery_time(&input.tail, metrics.f_t90, input.t_average, input.t_recovery);

    #[allow(clippy::cast_precision_loss)]
    let sigma_error = (best.rss / n_samples as f64).sqrt();

    Ok(FitResult {
        channel_failed: false,
        fit_valid: true,
        n_samples,
        sigma_error,
        sigma_noise: input.sigma_noise,
        tau_90: metrics.tau_90,
        f_t90: metrics.f_t90,
        t10_recovery,
        parameters: Some(best.params),
    })
}

/// First time the trailing `t_average`-second rolling average of the
/// recovery tail crosses 10% of the plateau (`f_t90 / 9`); censored at
/// `t_recovery` when no crossing exists. Sign-aware, so downward responses
/// recover upward.
fn recovery_time(tail: &[(f64, f64)], f_t90: f64, t_average: i64, t_recovery: i64) -> f64 {
    let threshold = f_t90 / 9.0;
    let plateau_sign = if f_t90 >= 0.0 { 1.0 } else { -1.0 };
    let horizon = t_recovery as f64;

    for (ii, &(t, _)) in tail.iter().enumerate() {
        if t > horizon {
            break;
        }
        let window_start = t - t_average as f64;
        let (sum, count) = tail[..=ii]
            .iter()
            .rev()
            .take_while(|&&(tp, _)| tp > window_start)
            .fold((0.0, 0usize), |(sum, count), &(_, v)| (sum + v, count + 1));
        if count == 0 {
            continue;
        }
        #[allow(clippy::cast_precision_loss)]
        let average = sum / count as f64;
        if (average - threshold) * plateau_sign < 0.0 {
            return t;
        }
    }
    horizon
}
