//! # Day Simulation
//!
//! Replays one day of a PV home at one-minute resolution and runs the decision engine against it.
//! The house, the car and the battery are modelled just well enough to close the loop: the engine
//! sees what its previous decisions did to consumption, battery power and state of charge.
//!
//! Power distribution per minute:
//! - PV beyond `feed_in_limit + home + battery charge` is clipped (wasted).
//! - Surplus charges the battery up to `max_soc`; in smart-charge mode only the part that would
//!   otherwise exceed the feed-in limit goes into the battery.
//! - A deficit is covered by the battery down to `min_soc` unless discharge is inhibited, the rest
//!   comes from the grid.
//! - Below the emergency level the battery is charged from the grid at full power.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::solar::{CloudProcess, PvArray};
use crate::config::{Config, ControllerConfig};
use crate::controller::{ClearSkyProduction, DecisionEngine, TickInputs};
use crate::domain::{BatteryCommand, Forecast, ForecastSample, ForecastSeries, LiveStatus, WallboxStatus};
use crate::repo::{MemoryStateStore, StateStore};

const NOMINAL_VOLTAGE_V: f64 = 230.0;
const FORECAST_PERIOD_MINUTES: i64 = 15;

/// Scenario of a simulated day
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub date: NaiveDate,
    /// First simulated minute (UTC)
    pub start: NaiveTime,
    /// End of the simulation (UTC, exclusive)
    pub end: NaiveTime,
    pub start_soc: f64,
    /// Household consumption without the car (W)
    pub base_consumption_w: f64,
    /// Standard deviation of the consumption jitter; 0 gives reproducible constant load
    pub sigma_consumption_w: f64,
    /// Car is plugged in after this time
    pub connect_time: Option<NaiveTime>,
    /// Energy the car takes before it reports completion (Wh)
    pub charge_energy_wh: f64,
    /// SOC below which the battery is charged from the grid
    pub emergency_charge_soc: f64,
    pub clouds: bool,
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            date: NaiveDate::from_ymd_opt(2024, 6, 21).unwrap_or_default(),
            start: NaiveTime::from_hms_opt(3, 0, 0).unwrap_or_default(),
            end: NaiveTime::from_hms_opt(20, 0, 0).unwrap_or_default(),
            start_soc: 0.3,
            base_consumption_w: 350.0,
            sigma_consumption_w: 50.0,
            connect_time: None,
            charge_energy_wh: 16_000.0,
            emergency_charge_soc: 0.03,
            clouds: false,
            seed: 42,
        }
    }
}

/// One simulated minute. Positive grid power is import, positive battery power is charging.
#[derive(Debug, Clone, Serialize)]
pub struct MinuteRecord {
    pub time: DateTime<Utc>,
    pub dc_power_w: f64,
    pub home_consumption_w: f64,
    pub ctrl_power_w: f64,
    pub bat_power_w: f64,
    pub grid_power_w: f64,
    pub waste_power_w: f64,
    pub soc: f64,
    pub fastcharge: bool,
    pub inhibit_discharge: bool,
    pub bat_forecast: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DaySummary {
    pub pv_wh: f64,
    pub home_wh: f64,
    pub ev_wh: f64,
    pub grid_import_wh: f64,
    pub grid_export_wh: f64,
    pub clipped_wh: f64,
    pub bat_charge_wh: f64,
    pub bat_discharge_wh: f64,
    pub final_soc: f64,
    pub ev_completed: bool,
}

#[derive(Debug, Clone)]
pub struct DayReport {
    pub trace: Vec<MinuteRecord>,
    pub summary: DaySummary,
}

/// Battery and grid flows of one minute
#[derive(Debug, Clone, Copy, PartialEq)]
struct Flows {
    bat_power_w: f64,
    grid_power_w: f64,
    waste_power_w: f64,
    soc: f64,
}

pub struct HomeSimulator {
    engine: DecisionEngine,
    pv: PvArray,
    scenario: SimulationConfig,
}

impl HomeSimulator {
    pub fn new(engine: DecisionEngine, pv: PvArray, scenario: SimulationConfig) -> Self {
        Self {
            engine,
            pv,
            scenario,
        }
    }

    pub fn from_config(config: &Config, scenario: SimulationConfig) -> Self {
        Self::new(
            DecisionEngine::from_config(config),
            PvArray::from_site(&config.site),
            scenario,
        )
    }

    fn minutes(&self) -> Vec<DateTime<Utc>> {
        let start = self.scenario.date.and_time(self.scenario.start).and_utc();
        let end = self.scenario.date.and_time(self.scenario.end).and_utc();
        let count = (end - start).num_minutes().max(0);
        (0..count).map(|m| start + Duration::minutes(m)).collect()
    }

    /// DC power per simulated minute: clear-sky production attenuated by clouds
    fn pv_curve(&self, minutes: &[DateTime<Utc>]) -> Vec<f64> {
        let mut clouds = CloudProcess::new(self.scenario.seed, self.scenario.clouds);
        minutes
            .iter()
            .map(|t| self.pv.clear_sky_dc_power_w(*t) * clouds.advance(1))
            .collect()
    }

    /// Forecast that knows the simulated PV curve exactly, sampled every 15 minutes over the
    /// whole day
    fn perfect_forecast(&self, minutes: &[DateTime<Utc>], pv: &[f64]) -> Result<Forecast> {
        let day_start = self.scenario.date.and_time(NaiveTime::MIN).and_utc();
        let samples = (0..=24 * 60 / FORECAST_PERIOD_MINUTES)
            .map(|k| {
                let period_end = day_start + Duration::minutes(k * FORECAST_PERIOD_MINUTES);
                let remaining_wh = minutes
                    .iter()
                    .zip(pv)
                    .filter(|(t, _)| **t >= period_end)
                    .map(|(_, p)| p / 60.0)
                    .sum();
                ForecastSample {
                    period_end,
                    remaining_wh,
                }
            })
            .collect();
        let series = ForecastSeries::new(samples).context("building simulated forecast")?;
        Ok(Forecast::Series(series))
    }

    pub fn run(&self) -> Result<DayReport> {
        let cfg = self.engine.config();
        let minutes = self.minutes();
        let pv = self.pv_curve(&minutes);
        let forecast = self.perfect_forecast(&minutes, &pv)?;
        let store = MemoryStateStore::new();

        let mut rng = StdRng::seed_from_u64(self.scenario.seed);
        let jitter = Normal::new(0.0, self.scenario.sigma_consumption_w.max(0.0))
            .context("consumption jitter")?;

        let (i_min, i_max) = (cfg.i_min.unwrap_or(6.0), cfg.i_max.unwrap_or(16.0));
        let mut soc = self.scenario.start_soc;
        let mut prev_ctrl_w = 0.0;
        let mut prev_bat_w = 0.0;
        let mut ev_wh = 0.0;
        let mut ev_completed = false;
        let mut trace = Vec::with_capacity(minutes.len());

        for (now, pv_w) in minutes.iter().copied().zip(pv) {
            let home_w = (self.scenario.base_consumption_w + jitter.sample(&mut rng)).max(0.0);

            // The inverter sees the car as part of the house load
            let measured_home_w = home_w + prev_ctrl_w;
            let feed_in_w = pv_w * cfg.inverter_efficiency - measured_home_w - prev_bat_w;
            let clipped_w = (feed_in_w - cfg.feed_in_limit_w).max(0.0);
            let dc_w = pv_w - clipped_w;

            let connected = self
                .scenario
                .connect_time
                .is_some_and(|t| now.time() > t);
            let status = LiveStatus {
                timestamp: now,
                dc_power_w: dc_w,
                home_consumption_w: measured_home_w,
                grid_voltage_v: NOMINAL_VOLTAGE_V,
                bat_power_w: prev_bat_w,
                soc,
            };
            let conv = status.converter(cfg.phases);
            let wallbox = WallboxStatus {
                connected,
                charge_completed: ev_completed,
                ctrl_current_a: conv.to_current(prev_ctrl_w),
                min_current_a: i_min,
                max_current_a: i_max,
            };

            let state = store.load_for_tick(now);
            let inputs = TickInputs {
                now,
                status,
                wallbox: Some(wallbox),
                forecast: forecast.clone(),
            };
            let (decision, next) = self.engine.evaluate(state, &inputs, &f64::floor);
            store.save(&next)?;

            let mut ctrl_w = if connected { decision.status.ctrl_power_w } else { 0.0 };
            if ev_wh > self.scenario.charge_energy_wh {
                ev_completed = true;
                ctrl_w = 0.0;
            }

            let flows = distribute(
                cfg,
                &self.scenario,
                Power {
                    dc_w,
                    home_w,
                    ctrl_w,
                    clipped_w,
                },
                soc,
                &decision.battery,
            );
            ev_wh += ctrl_w / 60.0;

            trace.push(MinuteRecord {
                time: now,
                dc_power_w: dc_w,
                home_consumption_w: home_w,
                ctrl_power_w: ctrl_w,
                bat_power_w: flows.bat_power_w,
                grid_power_w: flows.grid_power_w,
                waste_power_w: flows.waste_power_w,
                soc: flows.soc,
                fastcharge: decision.battery.fastcharge,
                inhibit_discharge: decision.battery.inhibit_discharge,
                bat_forecast: decision.status.bat_forecast,
            });
            debug!(%now, ctrl_w, bat_w = flows.bat_power_w, soc = flows.soc, "simulated minute");

            soc = flows.soc;
            prev_ctrl_w = ctrl_w;
            prev_bat_w = flows.bat_power_w;
        }

        let summary = summarize(&trace, ev_completed);
        info!(
            date = %self.scenario.date,
            pv_wh = summary.pv_wh,
            ev_wh = summary.ev_wh,
            grid_import_wh = summary.grid_import_wh,
            grid_export_wh = summary.grid_export_wh,
            clipped_wh = summary.clipped_wh,
            final_soc = summary.final_soc,
            "simulated day"
        );
        Ok(DayReport { trace, summary })
    }
}

#[derive(Debug, Clone, Copy)]
struct Power {
    dc_w: f64,
    home_w: f64,
    ctrl_w: f64,
    clipped_w: f64,
}

/// Battery, grid and waste for one minute given the controller's battery command
fn distribute(
    cfg: &ControllerConfig,
    scenario: &SimulationConfig,
    p: Power,
    soc: f64,
    cmd: &BatteryCommand,
) -> Flows {
    let dt_h = 1.0 / 60.0;
    let capacity = cfg.bat_capacity_wh;
    let surplus_w = p.dc_w * cfg.inverter_efficiency - p.home_w - p.ctrl_w + p.clipped_w;

    let (mut bat_w, mut grid_w, mut waste_w) = (0.0, 0.0, p.clipped_w);
    if surplus_w > 0.0 {
        if soc < cmd.max_soc {
            let wanted = if cmd.fastcharge {
                surplus_w
            } else {
                surplus_w - cfg.feed_in_limit_w
            };
            bat_w = wanted.clamp(0.0, cfg.max_bat_charge_w);
        }
        waste_w = (surplus_w - bat_w - cfg.feed_in_limit_w).max(0.0);
        grid_w = -(surplus_w - bat_w - p.clipped_w);
    } else if soc > cmd.min_soc && !cmd.inhibit_discharge {
        bat_w = surplus_w;
        if -bat_w > cfg.max_bat_discharge_w {
            grid_w = -bat_w - cfg.max_bat_discharge_w;
            bat_w = -cfg.max_bat_discharge_w;
        }
    } else {
        grid_w = -surplus_w;
    }

    let mut soc = soc + bat_w * dt_h / capacity;
    if soc > 1.0 {
        let excess = (soc - 1.0) * capacity / dt_h;
        bat_w -= excess;
        grid_w -= excess;
        soc = 1.0;
    } else if soc < scenario.emergency_charge_soc && bat_w <= 0.0 {
        grid_w += cfg.max_bat_charge_w + bat_w;
        bat_w = cfg.max_bat_charge_w;
        soc += cfg.max_bat_charge_w * dt_h / capacity;
    }

    Flows {
        bat_power_w: bat_w,
        grid_power_w: grid_w,
        waste_power_w: waste_w,
        soc,
    }
}

fn summarize(trace: &[MinuteRecord], ev_completed: bool) -> DaySummary {
    let wh = |f: &dyn Fn(&MinuteRecord) -> f64| trace.iter().map(f).sum::<f64>() / 60.0;
    DaySummary {
        pv_wh: wh(&|r| r.dc_power_w + r.waste_power_w),
        home_wh: wh(&|r| r.home_consumption_w),
        ev_wh: wh(&|r| r.ctrl_power_w),
        grid_import_wh: wh(&|r| r.grid_power_w.max(0.0)),
        grid_export_wh: wh(&|r| (-r.grid_power_w).max(0.0)),
        clipped_wh: wh(&|r| r.waste_power_w),
        bat_charge_wh: wh(&|r| r.bat_power_w.max(0.0)),
        bat_discharge_wh: wh(&|r| (-r.bat_power_w).max(0.0)),
        final_soc: trace.last().map_or(0.0, |r| r.soc),
        ev_completed,
    }
}
