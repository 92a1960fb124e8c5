//! # Charge Current Allocation
//!
//! Decides how much current to offer the wallbox from PV surplus, topped up from the home battery
//! and a small grid allowance where that lets a charge start or continue at the minimum current.
//!
//! Evaluation order:
//! 1. No vehicle (or charging not allowed yet): 0 A.
//! 2. Surplus power -> `I_maxPV`.
//! 3. Missing current to reach (or hold) `I_min`, sourced from battery and grid.
//! 4. Day-feasibility cut-off from the clear-sky windows.
//! 5. Rounding to wallbox granularity and clamping to `[I_min, I_max]` or 0.

use chrono::{DateTime, NaiveTime, Utc};
use std::collections::BTreeMap;

use crate::config::ControllerConfig;
use crate::domain::{CurrentConverter, LiveStatus, WallboxStatus};

/// Available-power value reported when no vehicle is connected
pub const NO_PV_DATA: f64 = -1.0;
/// Currents this close to `I_min` are treated as `I_min`
const ROUNDING_NOISE_A: f64 = 0.1;
/// Absorbs float error before rounding down to wallbox granularity
pub(crate) const ROUNDING_SLACK_A: f64 = 1e-9;
const FALLBACK_I_MIN: f64 = 6.0;
const FALLBACK_I_MAX: f64 = 16.0;

/// Charge current bounds for this tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurrentLimits {
    pub i_min: f64,
    pub i_max: f64,
}

impl CurrentLimits {
    /// Configured bounds refined by what the wallbox reports: the higher minimum and the lower
    /// maximum win. `I_min` is rounded to wallbox granularity.
    pub fn resolve(
        cfg: &ControllerConfig,
        wallbox: Option<&WallboxStatus>,
        round: &dyn Fn(f64) -> f64,
    ) -> Self {
        let (mut i_min, mut i_max) = (cfg.i_min, cfg.i_max);
        if let Some(wb) = wallbox {
            if i_min.map_or(true, |v| v < wb.min_current_a) {
                i_min = Some(wb.min_current_a);
            }
            if i_max.map_or(true, |v| v > wb.max_current_a) {
                i_max = Some(wb.max_current_a);
            }
        }
        let i_max = i_max.unwrap_or(FALLBACK_I_MAX);
        let i_min = round(i_min.unwrap_or(FALLBACK_I_MIN)).min(i_max);
        Self { i_min, i_max }
    }
}

/// Per-tick inputs of the allocator
#[derive(Debug, Clone)]
pub struct AllocationInput<'a> {
    pub now: DateTime<Utc>,
    pub status: &'a LiveStatus,
    pub connected: bool,
    pub charge_now: bool,
    /// Power the wallbox delivered on the previous tick (W)
    pub delivered_power_w: f64,
    /// Power the controller asked for on the previous tick (W)
    pub requested_power_w: f64,
    pub endcharge: &'a BTreeMap<u32, NaiveTime>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Allocation {
    pub i_charge: f64,
    /// Current attributed to the battery (telemetry only)
    pub i_bat: f64,
    pub inhibit_discharge: bool,
    /// Surplus power, or [`NO_PV_DATA`] without a vehicle
    pub avail_power_w: f64,
}

impl Allocation {
    fn idle() -> Self {
        Self {
            i_charge: 0.0,
            i_bat: 0.0,
            inhibit_discharge: false,
            avail_power_w: NO_PV_DATA,
        }
    }
}

pub struct ChargeCurrentAllocator<'a> {
    cfg: &'a ControllerConfig,
    limits: CurrentLimits,
    round: &'a dyn Fn(f64) -> f64,
}

impl<'a> ChargeCurrentAllocator<'a> {
    pub fn new(cfg: &'a ControllerConfig, limits: CurrentLimits, round: &'a dyn Fn(f64) -> f64) -> Self {
        Self { cfg, limits, round }
    }

    pub fn allocate(&self, input: &AllocationInput<'_>) -> Allocation {
        if !input.connected || !input.charge_now {
            return Allocation::idle();
        }

        let cfg = self.cfg;
        let CurrentLimits { i_min, i_max } = self.limits;
        let conv = input.status.converter(cfg.phases);
        let soc = input.status.soc;

        let i_prev = self.snap_to_min(conv.to_current(input.delivered_power_w));
        let i_prev_req = self.snap_to_min(conv.to_current(input.requested_power_w));

        let avail_power_w = (input.status.dc_power_w * cfg.inverter_efficiency
            - input.status.home_consumption_w
            + input.delivered_power_w)
            .max(0.0);
        let i_max_pv = conv.to_current(avail_power_w);

        let charging = input.delivered_power_w > 0.0;
        let mut i_missing = if charging && i_max_pv < i_min {
            // halfway between what we had and the minimum
            (i_prev + i_min) / 2.0 - i_max_pv
        } else if !charging && (i_max_pv + cfg.i_grid_max >= i_min || cfg.allow_bat2ev) {
            i_min - i_max_pv
        } else {
            0.0
        };

        let mut i_bat = 0.0;
        let mut inhibit_discharge = false;

        let i_charge = if i_missing > 0.0 {
            if cfg.allow_bat2ev && soc > cfg.min_soc_charge {
                i_bat = bat_discharge_current(cfg, conv);
                cfg.i_grid_max + i_bat + i_max_pv
            } else {
                i_bat = self.battery_current(conv, soc, cfg.coefficients.a, cfg.min_soc_charge);
                if i_missing > i_bat {
                    // only try to sustain I_min
                    i_missing = i_min - i_max_pv;
                    i_bat = self.battery_current(conv, soc, cfg.coefficients.b, cfg.min_soc);
                    if i_missing > i_bat + cfg.i_grid_max {
                        i_missing = 0.0;
                    } else if i_missing > 0.0 && i_missing <= cfg.i_grid_max {
                        // the grid allowance covers the gap, keep the battery out of it
                        inhibit_discharge = true;
                        i_bat = 0.0;
                        if cfg.use_full_grid_allowance {
                            i_missing = cfg.i_grid_max;
                        }
                    }
                }
                if self.past_cutoff(input) {
                    i_missing = 0.0;
                    i_bat = 0.0;
                    inhibit_discharge = false;
                }
                let mut i_charge = i_max_pv + i_missing;
                if !inhibit_discharge && i_prev > 0.0 && i_charge > i_prev {
                    i_charge = i_prev;
                }
                i_charge
            }
        } else {
            i_max_pv
        };

        let mut i_charge = (self.round)(i_charge + ROUNDING_SLACK_A);
        if i_charge < i_min {
            // keep I_min only if the vehicle, not PV, limited the previous charge
            i_charge = if i_prev_req > i_prev { i_min } else { 0.0 };
        }
        if i_charge > i_max {
            i_charge = i_max;
        }

        Allocation {
            i_charge,
            i_bat,
            inhibit_discharge,
            avail_power_w,
        }
    }

    /// Current the battery may contribute, ramping linearly from 0 at `c0` to the full discharge
    /// current at `c1`
    pub fn battery_current(&self, conv: CurrentConverter, soc: f64, [c0, c1]: [f64; 2], floor: f64) -> f64 {
        let i_bat_max = bat_discharge_current(self.cfg, conv);
        if soc <= floor {
            return 0.0;
        }
        let a = i_bat_max / (c1 - c0);
        let b = -a * c0;
        (soc * a + b).clamp(0.0, i_bat_max)
    }

    fn snap_to_min(&self, current: f64) -> f64 {
        if (self.limits.i_min - current).abs() < ROUNDING_NOISE_A {
            self.limits.i_min
        } else {
            current
        }
    }

    /// PV alone can no longer sustain the current we would be left with later today
    fn past_cutoff(&self, input: &AllocationInput<'_>) -> bool {
        let level = (self.limits.i_min - self.cfg.i_grid_max).floor();
        if level < 0.0 {
            return false;
        }
        input
            .endcharge
            .get(&(level as u32))
            .is_some_and(|cutoff| input.now.time() > *cutoff)
    }
}

fn bat_discharge_current(cfg: &ControllerConfig, conv: CurrentConverter) -> f64 {
    conv.to_current(cfg.max_bat_discharge_w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use rstest::rstest;

    fn floor(a: f64) -> f64 {
        a.floor()
    }

    fn cfg() -> ControllerConfig {
        ControllerConfig {
            i_min: Some(6.0),
            i_max: Some(16.0),
            i_grid_max: 0.0,
            max_bat_discharge_w: 4140.0,
            ..ControllerConfig::default()
        }
    }

    fn limits() -> CurrentLimits {
        CurrentLimits { i_min: 6.0, i_max: 16.0 }
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 21, h, m, 0).unwrap()
    }

    fn status(dc: f64, home: f64, soc: f64) -> LiveStatus {
        LiveStatus {
            timestamp: at(12, 0),
            dc_power_w: dc,
            home_consumption_w: home,
            grid_voltage_v: 230.0,
            bat_power_w: 0.0,
            soc,
        }
    }

    fn run(cfg: &ControllerConfig, st: &LiveStatus, delivered: f64, requested: f64) -> Allocation {
        run_with_cutoffs(cfg, st, delivered, requested, &BTreeMap::new(), at(12, 0))
    }

    fn run_with_cutoffs(
        cfg: &ControllerConfig,
        st: &LiveStatus,
        delivered: f64,
        requested: f64,
        endcharge: &BTreeMap<u32, NaiveTime>,
        now: DateTime<Utc>,
    ) -> Allocation {
        let alloc = ChargeCurrentAllocator::new(cfg, limits(), &floor);
        alloc.allocate(&AllocationInput {
            now,
            status: st,
            connected: true,
            charge_now: true,
            delivered_power_w: delivered,
            requested_power_w: requested,
            endcharge,
        })
    }

    #[rstest]
    #[case::disconnected(false, true)]
    #[case::charge_not_allowed(true, false)]
    fn test_idle_without_vehicle_or_permission(#[case] connected: bool, #[case] charge_now: bool) {
        let cfg = cfg();
        let st = status(8000.0, 300.0, 0.8);
        let endcharge = BTreeMap::new();
        let alloc = ChargeCurrentAllocator::new(&cfg, limits(), &floor).allocate(&AllocationInput {
            now: at(12, 0),
            status: &st,
            connected,
            charge_now,
            delivered_power_w: 0.0,
            requested_power_w: 0.0,
            endcharge: &endcharge,
        });
        assert_eq!(alloc.i_charge, 0.0);
        assert_eq!(alloc.avail_power_w, NO_PV_DATA);
    }

    #[test]
    fn test_pure_pv_surplus_rounds_down() {
        let a = run(&cfg(), &status(5000.0, 500.0, 0.5), 0.0, 0.0);
        assert!((a.avail_power_w - 4350.0).abs() < 1e-9);
        assert_eq!(a.i_charge, 6.0);
        assert!(!a.inhibit_discharge);
    }

    #[rstest]
    #[case::large_surplus(12_000.0, 400.0, 16.0)]
    #[case::mid_surplus(7_600.0, 400.0, 10.0)]
    fn test_surplus_current(#[case] dc: f64, #[case] home: f64, #[case] expected: f64) {
        let a = run(&cfg(), &status(dc, home, 0.5), 0.0, 0.0);
        assert_eq!(a.i_charge, expected);
    }

    fn surplus(amps: f64, home: f64) -> f64 {
        (amps * 690.0 + home) / 0.97
    }

    #[test]
    fn test_cold_start_from_battery_with_permissive_model() {
        // 5.2 A of surplus, 0.8 A missing; SOC 0.9 allows 0.8 * 6 A = 4.8 A from the battery
        let cfg = ControllerConfig {
            i_grid_max: 1.0,
            ..cfg()
        };
        let a = run(&cfg, &status(surplus(5.2, 400.0), 400.0, 0.9), 0.0, 0.0);
        assert_eq!(a.i_charge, 6.0);
        assert!(!a.inhibit_discharge);
        assert!((a.i_bat - 4.8).abs() < 1e-9);
    }

    #[test]
    fn test_no_cold_start_below_minimum_without_grid_allowance() {
        let a = run(&cfg(), &status(surplus(5.2, 400.0), 400.0, 0.9), 0.0, 0.0);
        assert_eq!(a.i_charge, 0.0);
    }

    #[test]
    fn test_midpoint_target_while_charging() {
        // Charging 8 A, surplus collapsed to 3 A: aim for (8 + 6) / 2 = 7 A
        let home = 4000.0;
        let dc = (3.0 * 690.0 + home - 8.0 * 690.0) / 0.97;
        let a = run(&cfg(), &status(dc, home, 0.9), 8.0 * 690.0, 8.0 * 690.0);
        assert_eq!(a.i_charge, 7.0);
    }

    #[test]
    fn test_grid_allowance_inhibits_discharge() {
        let cfg = ControllerConfig {
            i_grid_max: 1.5,
            ..cfg()
        };
        // battery too low for either model, 0.8 A gap fits in the grid allowance
        let a = run(&cfg, &status(surplus(5.2, 400.0), 400.0, 0.1), 0.0, 0.0);
        assert!(a.inhibit_discharge);
        assert_eq!(a.i_bat, 0.0);
        assert_eq!(a.i_charge, 6.0);
    }

    #[test]
    fn test_battery_cover_keeps_discharge_enabled_even_if_grid_would_do() {
        let cfg = ControllerConfig {
            i_grid_max: 1.5,
            ..cfg()
        };
        // 0.8 A gap fits the grid allowance, but the permissive model already covers it with 4.8 A
        let a = run(&cfg, &status(surplus(5.2, 400.0), 400.0, 0.9), 0.0, 0.0);
        assert!(!a.inhibit_discharge);
        assert!((a.i_bat - 4.8).abs() < 1e-9);
        assert_eq!(a.i_charge, 6.0);
    }

    #[test]
    fn test_full_grid_allowance_raises_missing_current() {
        let cfg = ControllerConfig {
            i_grid_max: 2.0,
            use_full_grid_allowance: true,
            ..cfg()
        };
        let a = run(&cfg, &status(surplus(5.2, 400.0), 400.0, 0.1), 0.0, 0.0);
        assert!(a.inhibit_discharge);
        assert_eq!(a.i_charge, 7.0);
    }

    #[test]
    fn test_gap_too_large_for_battery_and_grid_gives_up() {
        let cfg = ControllerConfig {
            i_grid_max: 1.0,
            ..cfg()
        };
        // Charging 8 A, surplus down to 3 A, battery too low: 3 A gap exceeds the grid allowance
        let home = 4000.0;
        let dc = (3.0 * 690.0 + home - 8.0 * 690.0) / 0.97;
        let a = run(&cfg, &status(dc, home, 0.1), 8.0 * 690.0, 8.0 * 690.0);
        assert_eq!(a.i_charge, 0.0);
        assert!(!a.inhibit_discharge);
    }

    #[test]
    fn test_bat2ev_bypasses_coefficient_models() {
        let cfg = ControllerConfig {
            allow_bat2ev: true,
            i_grid_max: 1.0,
            min_soc_charge: 0.3,
            ..cfg()
        };
        // 1 A grid + 6 A battery + 2.2 A surplus
        let a = run(&cfg, &status(surplus(2.2, 400.0), 400.0, 0.5), 0.0, 0.0);
        assert_eq!(a.i_charge, 9.0);
        assert!((a.i_bat - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_cutoff_stops_battery_support_late_in_the_day() {
        let cfg = ControllerConfig {
            i_grid_max: 1.0,
            ..cfg()
        };
        // cut-off level floor(6 - 1) = 5
        let mut endcharge = BTreeMap::new();
        endcharge.insert(5, NaiveTime::from_hms_opt(15, 0, 0).unwrap());
        let st = status(surplus(5.2, 400.0), 400.0, 0.9);

        let early = run_with_cutoffs(&cfg, &st, 0.0, 0.0, &endcharge, at(14, 0));
        assert_eq!(early.i_charge, 6.0);

        let late = run_with_cutoffs(&cfg, &st, 0.0, 0.0, &endcharge, at(15, 30));
        assert_eq!(late.i_charge, 0.0);
    }

    #[test]
    fn test_vehicle_limited_charge_keeps_minimum() {
        // Vehicle took 4 A of the 6 A offered; no surplus left
        let st = status(0.0, 400.0, 0.1);
        let a = run(&cfg(), &st, 4.0 * 690.0, 6.0 * 690.0);
        assert_eq!(a.i_charge, 6.0);

        let pv_limited = run(&cfg(), &st, 6.0 * 690.0, 6.0 * 690.0);
        assert_eq!(pv_limited.i_charge, 0.0);
    }

    #[test]
    fn test_limits_refined_by_wallbox() {
        let cfg = ControllerConfig {
            i_min: Some(5.5),
            i_max: Some(32.0),
            ..ControllerConfig::default()
        };
        let wb = WallboxStatus {
            connected: true,
            charge_completed: false,
            ctrl_current_a: 0.0,
            min_current_a: 6.5,
            max_current_a: 16.0,
        };
        let limits = CurrentLimits::resolve(&cfg, Some(&wb), &floor);
        assert_eq!(limits, CurrentLimits { i_min: 6.0, i_max: 16.0 });

        let fallback = CurrentLimits::resolve(&ControllerConfig::default(), None, &floor);
        assert_eq!(fallback, CurrentLimits { i_min: 6.0, i_max: 16.0 });
    }

    #[rstest]
    #[case(0.2, 0.0)]
    #[case(0.5, 0.0)]
    #[case(0.75, 3.0)]
    #[case(1.0, 6.0)]
    fn test_permissive_battery_ramp(#[case] soc: f64, #[case] expected: f64) {
        let cfg = cfg();
        let alloc = ChargeCurrentAllocator::new(&cfg, limits(), &floor);
        let i = alloc.battery_current(CurrentConverter::new(230.0, 3), soc, [0.5, 1.0], 0.05);
        assert!((i - expected).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn prop_charge_current_within_bounds(
            dc in 0.0f64..15_000.0,
            home in 0.0f64..6_000.0,
            soc in 0.0f64..=1.0,
            delivered_a in 0.0f64..16.0,
            requested_a in 0.0f64..16.0,
            i_grid_max in 0.0f64..3.0,
            allow_bat2ev: bool,
            use_full_grid_allowance: bool,
        ) {
            let cfg = ControllerConfig { i_grid_max, allow_bat2ev, use_full_grid_allowance, ..cfg() };
            let a = run(&cfg, &status(dc, home, soc), delivered_a * 690.0, requested_a * 690.0);
            prop_assert!(a.i_charge >= 0.0 && a.i_charge <= 16.0);
            prop_assert!(a.i_charge == 0.0 || a.i_charge >= 6.0);
            prop_assert_eq!(a.i_charge, a.i_charge.floor());
        }
    }
}
