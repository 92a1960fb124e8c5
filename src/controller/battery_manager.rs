//! # Battery Charge Management
//!
//! Chooses between fast-charging the home battery and letting the inverter smart-charge, based on
//! how much PV energy the forecast still promises for today ("have") against what the battery
//! needs to reach its ceiling ("need"). May claw current back from the vehicle when the battery
//! falls behind.

use chrono::{DateTime, NaiveTime, Utc};
use tracing::warn;

use crate::config::ControllerConfig;
use crate::domain::{CurrentConverter, Forecast, ForecastError, ForecastSeries, LiveStatus, OverflowWindow};

use super::allocator::{Allocation, CurrentLimits};

/// DC production below `feed_in_limit / MEANINGFUL_PRODUCTION_DIVISOR` always fast-charges
const MEANINGFUL_PRODUCTION_DIVISOR: f64 = 50.0;

#[derive(Debug, Clone)]
pub struct BatteryInput<'a> {
    pub now: DateTime<Utc>,
    pub status: &'a LiveStatus,
    pub forecast: &'a Forecast,
    /// Coulomb-counted SOC, preferred over the measured one when present
    pub calc_soc: Option<f64>,
    pub connected: bool,
    pub charge_completed: bool,
    /// Power the wallbox delivered on the previous tick (W)
    pub delivered_power_w: f64,
    pub overflow: OverflowWindow,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryDecision {
    pub fastcharge: bool,
    pub i_charge: f64,
    pub i_bat: f64,
    pub inhibit_discharge: bool,
    pub need_wh: f64,
    pub have_wh: f64,
    /// have / need, 1 when nothing is needed
    pub bat_forecast: f64,
    /// SOC ceiling to command this tick
    pub max_soc: f64,
    /// SOC floor to command this tick
    pub min_soc: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Outlook {
    need_wh: f64,
    have_wh: f64,
}

pub struct BatteryChargeManager<'a> {
    cfg: &'a ControllerConfig,
    limits: CurrentLimits,
}

impl<'a> BatteryChargeManager<'a> {
    pub fn new(cfg: &'a ControllerConfig, limits: CurrentLimits) -> Self {
        Self { cfg, limits }
    }

    pub fn decide(&self, input: &BatteryInput<'_>, allocation: Allocation) -> BatteryDecision {
        let cfg = self.cfg;
        let soc = input.calc_soc.unwrap_or(input.status.soc);
        let conv = input.status.converter(cfg.phases);

        let mut i_charge = allocation.i_charge;
        let mut i_bat = allocation.i_bat;
        let mut inhibit_discharge = allocation.inhibit_discharge;
        let mut max_soc = cfg.max_soc;
        let mut min_soc_charge = cfg.min_soc_charge;

        let outlook = input.forecast.series().and_then(|series| {
            self.outlook(series, input, soc)
                .map_err(|e| warn!(error = %e, "forecast unusable, fast-charging battery"))
                .ok()
        });

        if input.connected && input.charge_completed {
            inhibit_discharge = false;
            min_soc_charge = cfg.min_soc;
        }

        let (fastcharge, outlook) = match outlook {
            None => (true, Outlook { need_wh: 0.0, have_wh: 0.0 }),
            Some(outlook) => {
                let routing_to_vehicle = cfg.allow_bat2ev
                    && input.connected
                    && i_charge > 0.0
                    && !input.charge_completed;
                let fastcharge = if routing_to_vehicle {
                    false
                } else if input.status.dc_power_w <= cfg.feed_in_limit_w / MEANINGFUL_PRODUCTION_DIVISOR {
                    true
                } else {
                    self.fastcharge_rules(
                        input,
                        outlook,
                        soc,
                        conv,
                        min_soc_charge,
                        inhibit_discharge,
                        &mut i_charge,
                        &mut max_soc,
                    )
                };
                (fastcharge, outlook)
            }
        };

        if i_charge == 0.0 {
            i_bat = 0.0;
        }

        let session_active = input.connected && !input.charge_completed;
        BatteryDecision {
            fastcharge,
            i_charge,
            i_bat,
            inhibit_discharge,
            need_wh: outlook.need_wh,
            have_wh: outlook.have_wh,
            bat_forecast: if outlook.need_wh > 0.0 {
                outlook.have_wh / outlook.need_wh
            } else {
                1.0
            },
            max_soc,
            min_soc: if session_active { min_soc_charge } else { cfg.min_soc },
        }
    }

    /// First matching rule wins
    #[allow(clippy::too_many_arguments)]
    fn fastcharge_rules(
        &self,
        input: &BatteryInput<'_>,
        Outlook { need_wh: need, have_wh: have }: Outlook,
        soc: f64,
        conv: CurrentConverter,
        min_soc_charge: f64,
        inhibit_discharge: bool,
        i_charge: &mut f64,
        max_soc: &mut f64,
    ) -> bool {
        let cfg = self.cfg;
        let [c_urgent, c_early] = cfg.coefficients.c;
        let t: NaiveTime = input.now.time();
        let window = input.overflow;

        if need > have / c_urgent && !inhibit_discharge {
            // battery falls behind: take its charge power back from the vehicle
            *i_charge -= conv.to_current(cfg.max_bat_charge_w);
            if *i_charge < self.limits.i_min {
                *i_charge = 0.0;
            }
            true
        } else if min_soc_charge > soc {
            *i_charge = 0.0;
            true
        } else if input.connected && !input.charge_completed {
            if need < have / c_early && window.before_start(t) {
                *max_soc = cfg.max_soc_charge;
            }
            soc < cfg.max_soc_charge || window.past_end(t)
        } else if need > have / c_early && t < window.end {
            true
        } else {
            window.past_end(t)
        }
    }

    fn outlook(
        &self,
        series: &ForecastSeries,
        input: &BatteryInput<'_>,
        soc: f64,
    ) -> Result<Outlook, ForecastError> {
        let need_wh = ((self.cfg.max_soc - soc) * self.cfg.bat_capacity_wh).max(0.0);

        let remaining_wh = series.remaining_at(input.now)?;
        let end = series.end_of_production()?;
        let dt_pv_h = ((end - input.now).num_seconds() as f64 / 3600.0).max(0.0);
        let home_w = (input.status.home_consumption_w - input.delivered_power_w).max(0.0);
        let have_wh = (remaining_wh - home_w * dt_pv_h).max(0.0);

        Ok(Outlook { need_wh, have_wh })
    }
}
