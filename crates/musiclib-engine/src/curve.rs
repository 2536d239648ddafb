use crate::accounting::AccountingError;
use chrono::{DateTime, Duration, Utc};

/// Front-loading curve `g(f) = 1 - e^(-k f)`.
///
/// `g(0) = 0` places the head of the list at the window end, and `g(1) < 1`
/// keeps the tail strictly after the window start.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecayCurve {
    rate: f64,
}

impl DecayCurve {
    pub fn new(rate: f64) -> Result<Self, AccountingError> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(AccountingError::InvalidDecayRate(rate));
        }
        Ok(Self { rate })
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Share of the window elapsed between `end` and the timestamp of a track
    /// at normalized list position `position` (0 = front, 1 = back).
    pub fn elapsed_fraction(&self, position: f64) -> f64 {
        let position = position.clamp(0.0, 1.0);
        (1.0 - (-self.rate * position).exp()).clamp(0.0, 1.0)
    }

    /// One timestamp per list position, non-increasing, all within
    /// `[start, end]`. A single track always gets `end`.
    pub fn timestamps(
        &self,
        count: usize,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<DateTime<Utc>> {
        let end = end.max(start);
        if count <= 1 {
            return vec![end; count];
        }
        let span_ms = (end - start).num_milliseconds() as f64;
        let last = (count - 1) as f64;
        (0..count)
            .map(|index| {
                let offset = (self.elapsed_fraction(index as f64 / last) * span_ms).round();
                (end - Duration::milliseconds(offset as i64)).clamp(start, end)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn rejects_non_positive_rates() {
        assert!(DecayCurve::new(0.0).is_err());
        assert!(DecayCurve::new(-1.5).is_err());
        assert!(DecayCurve::new(f64::NAN).is_err());
        assert!(DecayCurve::new(f64::INFINITY).is_err());
    }

    #[test]
    fn fraction_is_monotonic_and_below_one() {
        let curve = DecayCurve::new(3.0).expect("curve");
        assert_eq!(curve.elapsed_fraction(0.0), 0.0);
        let mut previous = 0.0;
        for step in 1..=100 {
            let value = curve.elapsed_fraction(step as f64 / 100.0);
            assert!(value > previous);
            assert!(value < 1.0);
            previous = value;
        }
    }

    #[test]
    fn single_track_lands_on_window_end() {
        let curve = DecayCurve::new(3.0).expect("curve");
        let end = start() + Duration::hours(5);
        assert_eq!(curve.timestamps(1, start(), end), vec![end]);
        assert!(curve.timestamps(0, start(), end).is_empty());
    }

    #[test]
    fn timestamps_stay_inside_window_for_many_shapes() {
        for rate in [0.25, 1.0, 3.0, 12.0] {
            let curve = DecayCurve::new(rate).expect("curve");
            for count in [2usize, 3, 17, 250] {
                for hours in [1i64, 7, 24 * 40] {
                    let end = start() + Duration::hours(hours);
                    let stamps = curve.timestamps(count, start(), end);
                    assert_eq!(stamps.len(), count);
                    assert_eq!(stamps[0], end);
                    for pair in stamps.windows(2) {
                        assert!(pair[0] >= pair[1]);
                    }
                    assert!(stamps.iter().all(|ts| *ts >= start() && *ts <= end));
                }
            }
        }
    }
}
