use std::collections::BTreeMap;
use std::ops::RangeInclusive;

use ndarray::Array1;

use crate::error::FitError;
use crate::Result;

/// A time-indexed sequence of per-channel relative deviation values (%).
///
/// Timestamps are integer seconds; traversal is always in time order. The
/// channel count is fixed at construction and every inserted vector must
/// match it.
#[derive(Clone, Debug)]
pub struct TimeSeries {
    n_channels: usize,
    points: BTreeMap<i64, Array1<f64>>,
}

impl TimeSeries {
    #[must_use]
    pub const fn new(n_channels: usize) -> Self {
        Self {
            n_channels,
            points: BTreeMap::new(),
        }
    }

    /// Insert one measurement vector, replacing any existing one at
    /// `timestamp`.
    ///
    /// # Errors
    /// Returns [`FitError::ChannelMismatch`] when the vector length differs
    /// from the channel count.
    pub fn insert(&mut self, timestamp: i64, values: Array1<f64>) -> Result<()> {
        if values.len() != self.n_channels {
            return Err(FitError::ChannelMismatch {
                expected: self.n_channels,
                found: values.len(),
            });
        }
        self.points.insert(timestamp, values);
        Ok(())
    }

    #[must_use]
    pub const fn n_channels(&self) -> usize {
        self.n_channels
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    #[must_use]
    pub fn first_timestamp(&self) -> Option<i64> {
        self.points.keys().next().copied()
    }

    #[must_use]
    pub fn last_timestamp(&self) -> Option<i64> {
        self.points.keys().next_back().copied()
    }

    /// Value of one channel at an exact timestamp.
    #[must_use]
    pub fn value(&self, timestamp: i64, channel: usize) -> Option<f64> {
        self.points
            .get(&timestamp)
            .and_then(|values| values.get(channel))
            .copied()
    }

    /// Iterate over all points inside `window`, in time order.
    pub fn window(
        &self,
        window: RangeInclusive<i64>,
    ) -> impl Iterator<Item = (i64, &Array1<f64>)> {
        self.points.range(window).map(|(t, values)| (*t, values))
    }

    /// (timestamp, value) pairs of one channel inside `window`.
    #[must_use]
    pub fn channel_window(&self, channel: usize, window: RangeInclusive<i64>) -> Vec<(i64, f64)> {
        self.points
            .range(window)
            .filter_map(|(t, values)| values.get(channel).map(|v| (*t, *v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use ndarray::arr1;

    use super::TimeSeries;
    use crate::error::FitError;

    fn series_of(rows: &[(i64, [f64; 2])]) -> TimeSeries {
        let mut series = TimeSeries::new(2);
        for (t, values) in rows {
            series.insert(*t, arr1(values)).unwrap();
        }
        series
    }

    #[test]
    fn inserts_with_wrong_channel_count_are_rejected() {
        let mut series = TimeSeries::new(2);
        let err = series.insert(0, arr1(&[1.0])).unwrap_err();
        assert!(matches!(
            err,
            FitError::ChannelMismatch {
                expected: 2,
                found: 1
            }
        ));
    }

    #[test]
    fn windows_are_inclusive_and_time_ordered() {
        let series = series_of(&[
            (3, [3.0, 30.0]),
            (1, [1.0, 10.0]),
            (2, [2.0, 20.0]),
            (4, [4.0, 40.0]),
        ]);

        let window = series.channel_window(1, 1..=3);
        assert_eq!(window, vec![(1, 10.0), (2, 20.0), (3, 30.0)]);
        assert_eq!(series.first_timestamp(), Some(1));
        assert_eq!(series.last_timestamp(), Some(4));
    }

    #[test]
    fn exact_lookups_miss_outside_the_series() {
        let series = series_of(&[(0, [0.5, -0.5])]);
        assert_eq!(series.value(0, 1), Some(-0.5));
        assert_eq!(series.value(1, 0), None);
        assert_eq!(series.value(0, 2), None);
    }
}
