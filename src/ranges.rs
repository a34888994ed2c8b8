//! Unsupervised segmentation of a channel's series into the exposition
//! window that gets fitted.
//!
//! The detector walks the window and keeps a local line fit over
//! `fit_buffer` seconds. Before the exposition starts, the line trails the
//! current point and the residual between the point and the line's
//! prediction is the "jump"; a jump beyond `jump_factor * sigma +
//! jump_base_threshold` marks the exposition start. Once in range, an
//! opposing local slope beyond `recovery_factor * sigma` marks the recovery
//! start.

use std::cmp::Ordering;
use std::ops::RangeInclusive;

use crate::config::FitConfig;
use crate::math::{fit_line, LinearFit};
use crate::series::TimeSeries;

/// Detected fitting range of one channel.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChannelRange {
    /// Timestamp of the exposition start.
    pub x_start: i64,
    /// Baseline value at `x_start`, subtracted from every sample.
    pub y_offset: f64,
    /// Residual std-dev of the pre-exposition drift.
    pub sigma_noise: f64,
    /// (time - x_start, value - y_offset) pairs, ordered by time.
    pub samples: Vec<(f64, f64)>,
}

impl ChannelRange {
    /// Insert a sample at `time` (relative seconds), keeping time order.
    /// An existing sample at the same time is replaced.
    pub(crate) fn insert_sample(&mut self, time: f64, value: f64) {
        match self
            .samples
            .binary_search_by(|(t, _)| t.partial_cmp(&time).unwrap_or(Ordering::Equal))
        {
            Ok(ii) => self.samples[ii] = (time, value),
            Err(ii) => self.samples.insert(ii, (time, value)),
        }
    }

    /// Remove the sample at `time` (relative seconds); reports whether one
    /// was present.
    pub(crate) fn remove_sample(&mut self, time: f64) -> bool {
        match self
            .samples
            .binary_search_by(|(t, _)| t.partial_cmp(&time).unwrap_or(Ordering::Equal))
        {
            Ok(ii) => {
                self.samples.remove(ii);
                true
            }
            Err(_) => false,
        }
    }
}

/// Determine per-channel fitting ranges inside `window`.
///
/// Failed channels get an empty range. The result is a pure function of
/// the inputs, so repeated calls with unchanged data and configuration
/// yield identical ranges.
///
/// # Panics
/// When `failures` does not match the series channel count, or when
/// recovery detection is requested while exposition detection is disabled
/// (a caller contract violation).
pub fn determine_channel_ranges(
    series: &TimeSeries,
    failures: &[bool],
    window: &RangeInclusive<i64>,
    config: &FitConfig,
) -> Vec<ChannelRange> {
    assert_eq!(
        failures.len(),
        series.n_channels(),
        "sensor-failure bitset must cover every channel"
    );
    assert!(
        config.detect_exposition_start || !config.detect_recovery_start,
        "recovery detection requires exposition detection"
    );

    (0..series.n_channels())
        .map(|channel| {
            if failures[channel] {
                ChannelRange::default()
            } else {
                detect_channel(series, channel, window, config)
            }
        })
        .collect()
}

fn detect_channel(
    series: &TimeSeries,
    channel: usize,
    window: &RangeInclusive<i64>,
    config: &FitConfig,
) -> ChannelRange {
    let points = series.channel_window(channel, window.clone());
    if points.is_empty() {
        return ChannelRange::default();
    }

    if !config.detect_exposition_start {
        return whole_window_range(series, channel, window, config, &points);
    }

    let mut range = ChannelRange::default();
    let mut in_range = false;
    let mut reaction_positive = false;
    let mut x_end = *window.end();

    for (ii, &(t, y)) in points.iter().enumerate() {
        if !in_range {
            let lead: Vec<(i64, f64)> = points[..ii]
                .iter()
                .copied()
                .filter(|&(tp, _)| tp >= t - config.fit_buffer)
                .collect();
            if lead.len() < 2 {
                continue;
            }
            let (fit, sigma) = local_fit(&lead);
            let predicted = fit.predict(t as f64);
            let jump = y - predicted;
            if jump.abs() > config.jump_factor.mul_add(sigma, config.jump_base_threshold) {
                in_range = true;
                reaction_positive = jump > 0.0;
                range.x_start = t;
                range.y_offset = predicted;
                range.sigma_noise = sigma;
                log::debug!(
                    "channel {channel}: exposition start at {t} (jump {jump:.3}, sigma {sigma:.4})"
                );
                if !config.detect_recovery_start {
                    break;
                }
            }
        } else {
            let tail: Vec<(i64, f64)> = points[ii..]
                .iter()
                .copied()
                .take_while(|&(tp, _)| tp <= t + config.fit_buffer)
                .collect();
            if tail.len() < 2 {
                continue;
            }
            let (fit, sigma) = local_fit(&tail);
            let opposes = if reaction_positive {
                fit.slope < 0.0
            } else {
                fit.slope > 0.0
            };
            if opposes && fit.slope.abs() > config.recovery_factor * sigma {
                x_end = t;
                log::debug!("channel {channel}: recovery start at {t} (slope {:.4})", fit.slope);
                break;
            }
        }
    }

    if !in_range {
        // No jump found; leave an empty range at the window end so the fit
        // stage skips this channel.
        range.x_start = x_end;
        return range;
    }

    range.samples = points
        .iter()
        .filter(|&&(t, _)| t >= range.x_start && t <= x_end)
        .map(|&(t, y)| ((t - range.x_start) as f64, y - range.y_offset))
        .collect();
    range
}

fn whole_window_range(
    series: &TimeSeries,
    channel: usize,
    window: &RangeInclusive<i64>,
    config: &FitConfig,
    points: &[(i64, f64)],
) -> ChannelRange {
    let (x_start, y_offset) = points[0];
    let preceding = series.channel_window(
        channel,
        window.start() - config.fit_buffer..=window.start() - 1,
    );
    let sigma_noise = if preceding.len() < 4 {
        0.0
    } else {
        local_fit(&preceding).1
    };

    ChannelRange {
        x_start,
        y_offset,
        sigma_noise,
        samples: points
            .iter()
            .map(|&(t, y)| ((t - x_start) as f64, y - y_offset))
            .collect(),
    }
}

/// Line fit over (timestamp, value) points. Fewer than 4 points report
/// sigma = 0 (the fit itself still stands).
fn local_fit(points: &[(i64, f64)]) -> (LinearFit<f64>, f64) {
    let x: Vec<f64> = points.iter().map(|&(t, _)| t as f64).collect();
    let y: Vec<f64> = points.iter().map(|&(_, v)| v).collect();
    let fit = fit_line(&x, &y);
    let sigma = if points.len() < 4 { 0.0 } else { fit.sigma };
    (fit, sigma)
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;
    use ndarray::Array1;

    use super::{determine_channel_ranges, ChannelRange};
    use crate::config::FitConfig;
    use crate::series::TimeSeries;

    /// One channel whose values come from `f(t)`.
    fn series_from(f: impl Fn(i64) -> f64, t_last: i64) -> TimeSeries {
        let mut series = TimeSeries::new(1);
        for t in 0..=t_last {
            series.insert(t, Array1::from(vec![f(t)])).unwrap();
        }
        series
    }

    fn detection_config() -> FitConfig {
        FitConfig {
            fit_buffer: 10,
            jump_factor: 4.0,
            jump_base_threshold: 0.1,
            recovery_factor: 2.0,
            ..FitConfig::default()
        }
    }

    #[test]
    fn a_step_is_detected_at_its_exact_timestamp() {
        let series = series_from(|t| if t < 60 { 0.0 } else { 2.0 }, 120);
        let config = detection_config();

        let ranges = determine_channel_ranges(&series, &[false], &(0..=120), &config);
        let range = &ranges[0];

        assert_eq!(range.x_start, 60);
        assert!(range.y_offset.abs() < 1e-9);
        assert_eq!(range.samples.len(), 61);
        assert!((range.samples[0].1 - 2.0).abs() < 1e-9);
        assert!(range
            .samples
            .iter()
            .tuple_windows()
            .all(|(a, b)| a.0 < b.0));
    }

    #[test]
    fn disabled_detection_takes_the_whole_window() {
        let series = series_from(|t| 0.01 * t as f64, 120);
        let config = FitConfig {
            detect_exposition_start: false,
            ..detection_config()
        };

        let ranges = determine_channel_ranges(&series, &[false], &(40..=100), &config);
        let range = &ranges[0];

        assert_eq!(range.x_start, 40);
        assert!((range.y_offset - 0.4).abs() < 1e-9);
        assert_eq!(range.samples.len(), 61);
        // The preceding buffer is a clean line, so drift sigma vanishes.
        assert!(range.sigma_noise < 1e-9);
    }

    #[test]
    fn a_recovery_start_cuts_the_sample_set() {
        // Rise from t = 60 to a peak at t = 90, then fall.
        let series = series_from(
            |t| match t {
                0..=59 => 0.0,
                60..=90 => (t - 59) as f64,
                _ => 31.0 - (t - 90) as f64,
            },
            200,
        );
        let config = FitConfig {
            detect_recovery_start: true,
            ..detection_config()
        };

        let ranges = determine_channel_ranges(&series, &[false], &(0..=200), &config);
        let range = &ranges[0];

        assert_eq!(range.x_start, 60);
        let last = range.samples.last().unwrap().0 as i64 + range.x_start;
        assert!(
            (80..=95).contains(&last),
            "recovery cut at unexpected timestamp {last}"
        );
    }

    #[test]
    fn failed_channels_get_an_empty_range() {
        let mut series = TimeSeries::new(2);
        for t in 0..=100 {
            let step = if t < 50 { 0.0 } else { 3.0 };
            series.insert(t, Array1::from(vec![step, step])).unwrap();
        }

        let ranges =
            determine_channel_ranges(&series, &[true, false], &(0..=100), &detection_config());
        assert_eq!(ranges[0], ChannelRange::default());
        assert_eq!(ranges[1].x_start, 50);
    }

    #[test]
    fn a_flat_channel_yields_an_empty_sample_set() {
        let series = series_from(|_| 0.5, 100);
        let ranges = determine_channel_ranges(&series, &[false], &(0..=100), &detection_config());
        assert!(ranges[0].samples.is_empty());
    }

    #[test]
    fn short_local_fits_fall_back_to_the_base_threshold() {
        // Only 3 points precede the step, so sigma = 0 and the base
        // threshold alone decides.
        let series = series_from(|t| if t < 3 { 0.0 } else { 0.5 }, 40);
        let mut config = detection_config();
        config.jump_base_threshold = 0.3;

        let ranges = determine_channel_ranges(&series, &[false], &(0..=40), &config);
        assert_eq!(ranges[0].x_start, 3);
    }

    #[test]
    fn redetection_is_idempotent() {
        let series = series_from(|t| if t < 30 { 0.1 } else { 2.1 }, 90);
        let config = detection_config();

        let first = determine_channel_ranges(&series, &[false], &(0..=90), &config);
        let second = determine_channel_ranges(&series, &[false], &(0..=90), &config);
        assert_eq!(first, second);
    }

    #[test]
    #[should_panic(expected = "recovery detection requires exposition detection")]
    fn recovery_without_exposition_detection_is_a_contract_violation() {
        let series = series_from(|_| 0.0, 10);
        let config = FitConfig {
            detect_exposition_start: false,
            detect_recovery_start: true,
            ..FitConfig::default()
        };
        determine_channel_ranges(&series, &[false], &(0..=10), &config);
    }

    #[test]
    fn manual_sample_edits_keep_time_order() {
        let mut range = ChannelRange::default();
        range.insert_sample(4.0, 1.0);
        range.insert_sample(1.0, 2.0);
        range.insert_sample(2.0, 3.0);
        assert_eq!(range.samples, vec![(1.0, 2.0), (2.0, 3.0), (4.0, 1.0)]);

        assert!(range.remove_sample(2.0));
        assert!(!range.remove_sample(9.0));
        assert_eq!(range.samples, vec![(1.0, 2.0), (4.0, 1.0)]);
    }
}
