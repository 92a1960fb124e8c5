use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::domain::{CurrentConverter, OverflowWindow};
use crate::repo::PersistedState;

/// Slack added on both sides of the overflow window to tolerate over-radiation
pub const OVERFLOW_SLACK_MINUTES: i64 = 30;
/// Threshold factor for the second pass on days where nothing exceeds the feed-in limit
const RELAXED_THRESHOLD: f64 = 0.9;

/// Theoretical cloudless DC production of the PV generator
pub trait ClearSkyProduction: Send + Sync {
    fn clear_sky_dc_power_w(&self, at: DateTime<Utc>) -> f64;
}

/// Day-scoped results of the clear-sky analysis
#[derive(Debug, Clone, PartialEq)]
pub struct ClearSkyWindows {
    pub endcharge: BTreeMap<u32, NaiveTime>,
    pub overflow: OverflowWindow,
}

/// Derives per-current cut-off times and the feed-in overflow window from a clear-sky curve
#[derive(Clone)]
pub struct ClearskyWindowCalculator {
    production: Arc<dyn ClearSkyProduction>,
    step_minutes: u32,
    inverter_efficiency: f64,
    feed_in_limit_w: f64,
}

impl ClearskyWindowCalculator {
    pub fn new(
        production: Arc<dyn ClearSkyProduction>,
        step_minutes: u32,
        inverter_efficiency: f64,
        feed_in_limit_w: f64,
    ) -> Self {
        Self {
            production,
            step_minutes: step_minutes.max(1),
            inverter_efficiency,
            feed_in_limit_w,
        }
    }

    /// Recompute the day-scoped windows in `state` when `now` falls on a later UTC date than the
    /// last save. Returns whether anything was recomputed.
    pub fn refresh(
        &self,
        state: &mut PersistedState,
        now: DateTime<Utc>,
        converter: CurrentConverter,
        i_max: f64,
    ) -> bool {
        if !state.needs_daily_refresh(now) {
            return false;
        }
        let windows = self.compute(now.date_naive(), converter, i_max);
        info!(
            date = %now.date_naive(),
            overflow_start = %windows.overflow.start,
            overflow_end = %windows.overflow.end,
            overflow_risk = !windows.overflow.is_none(),
            cutoff_levels = windows.endcharge.len(),
            "clear-sky windows recomputed"
        );
        state.endcharge = windows.endcharge;
        state.overflow = windows.overflow;
        true
    }

    pub fn compute(&self, date: NaiveDate, converter: CurrentConverter, i_max: f64) -> ClearSkyWindows {
        let curve = self.ac_curve(date);

        // Levels 1 ..= ceil(I_max) - 1
        let top = i_max.ceil().max(1.0) as u32;
        let endcharge = (1..top)
            .filter_map(|level| {
                let needed = converter.to_power(f64::from(level));
                curve
                    .iter()
                    .rev()
                    .find(|(_, ac)| *ac > needed)
                    .map(|(t, _)| (level, t.time()))
            })
            .collect();

        let overflow = self
            .exceeding(&curve, self.feed_in_limit_w)
            .or_else(|| self.exceeding(&curve, self.feed_in_limit_w * RELAXED_THRESHOLD))
            .map(|(first, last)| {
                let slack = Duration::minutes(OVERFLOW_SLACK_MINUTES);
                OverflowWindow {
                    start: clamp_to_day(first - slack, date),
                    end: clamp_to_day(last + slack, date),
                }
            })
            .unwrap_or_else(OverflowWindow::none);

        ClearSkyWindows { endcharge, overflow }
    }

    /// Clear-sky AC power over the whole UTC day
    fn ac_curve(&self, date: NaiveDate) -> Vec<(DateTime<Utc>, f64)> {
        let start = date.and_time(NaiveTime::MIN).and_utc();
        let samples = 24 * 60 / self.step_minutes;
        (0..samples)
            .map(|k| {
                let t = start + Duration::minutes(i64::from(k * self.step_minutes));
                (t, self.production.clear_sky_dc_power_w(t) * self.inverter_efficiency)
            })
            .collect()
    }

    fn exceeding(
        &self,
        curve: &[(DateTime<Utc>, f64)],
        threshold_w: f64,
    ) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let first = curve.iter().find(|(_, ac)| *ac > threshold_w)?;
        let last = curve.iter().rev().find(|(_, ac)| *ac > threshold_w)?;
        Some((first.0, last.0))
    }
}

fn clamp_to_day(t: DateTime<Utc>, date: NaiveDate) -> NaiveTime {
    if t.date_naive() < date {
        NaiveTime::MIN
    } else if t.date_naive() > date {
        OverflowWindow::none().start
    } else {
        t.time()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use proptest::prelude::*;

    /// Triangular production: zero at 06:00 and 18:00, `peak_w` at noon
    struct Triangle {
        peak_w: f64,
    }

    impl ClearSkyProduction for Triangle {
        fn clear_sky_dc_power_w(&self, at: DateTime<Utc>) -> f64 {
            let h = at.hour() as f64 + at.minute() as f64 / 60.0;
            self.peak_w * (1.0 - (h - 12.0).abs() / 6.0).max(0.0)
        }
    }

    fn calc(peak_w: f64, feed_in_limit_w: f64) -> ClearskyWindowCalculator {
        ClearskyWindowCalculator::new(Arc::new(Triangle { peak_w }), 15, 1.0, feed_in_limit_w)
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 21).unwrap()
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_overflow_window_is_padded() {
        let w = calc(10_000.0, 6000.0).compute(day(), CurrentConverter::new(230.0, 3), 16.0);
        assert_eq!(w.overflow.start, hm(9, 15));
        assert_eq!(w.overflow.end, hm(14, 45));
        assert!(!w.overflow.is_none());
    }

    #[test]
    fn test_marginal_day_uses_relaxed_threshold() {
        let w = calc(10_000.0, 10_000.0).compute(day(), CurrentConverter::new(230.0, 3), 16.0);
        assert_eq!(w.overflow.start, hm(11, 0));
        assert_eq!(w.overflow.end, hm(13, 0));
    }

    #[test]
    fn test_no_overflow_risk_gives_sentinel() {
        let w = calc(10_000.0, 20_000.0).compute(day(), CurrentConverter::new(230.0, 3), 16.0);
        assert_eq!(w.overflow, OverflowWindow::none());
        assert!(w.overflow.is_none());
    }

    #[test]
    fn test_endcharge_levels() {
        let w = calc(10_000.0, 6000.0).compute(day(), CurrentConverter::new(230.0, 3), 16.0);
        assert_eq!(w.endcharge.get(&1), Some(&hm(17, 30)));
        assert_eq!(w.endcharge.get(&10), Some(&hm(13, 45)));
        assert_eq!(w.endcharge.get(&14), Some(&hm(12, 0)));
        // 15 A needs 10.35 kW, never reached
        assert_eq!(w.endcharge.get(&15), None);
        assert_eq!(w.endcharge.keys().max(), Some(&14));
    }

    #[test]
    fn test_refresh_runs_once_per_day() {
        let calc = calc(10_000.0, 6000.0);
        let conv = CurrentConverter::new(230.0, 3);
        let morning = day().and_hms_opt(5, 0, 0).unwrap().and_utc();

        let mut state = PersistedState::default();
        assert!(calc.refresh(&mut state, morning, conv, 16.0));
        let first = state.clone();

        state.saved = morning;
        assert!(!calc.refresh(&mut state, morning + Duration::hours(3), conv, 16.0));
        assert_eq!(state.endcharge, first.endcharge);
        assert_eq!(state.overflow, first.overflow);
    }

    #[test]
    fn test_compute_is_deterministic() {
        let calc = calc(8_000.0, 5000.0);
        let conv = CurrentConverter::new(231.5, 3);
        assert_eq!(calc.compute(day(), conv, 16.0), calc.compute(day(), conv, 16.0));
    }

    proptest! {
        #[test]
        fn prop_cutoff_times_never_increase_with_current(
            peak_w in 500.0f64..20_000.0,
            voltage in 200.0f64..250.0,
            phases in 1u8..=3,
            i_max in 6.0f64..32.0,
        ) {
            let w = calc(peak_w, 6000.0).compute(day(), CurrentConverter::new(voltage, phases), i_max);
            let times: Vec<NaiveTime> = w.endcharge.values().copied().collect();
            prop_assert!(times.windows(2).all(|p| p[1] <= p[0]));
            prop_assert!(w.endcharge.keys().all(|k| f64::from(*k) < i_max.ceil()));
        }
    }
}
