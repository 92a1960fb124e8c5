pub mod allocator;
pub mod battery_manager;
pub mod clearsky;
pub mod soc_estimator;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{Config, ControllerConfig};
use crate::domain::{BatteryCommand, EvCharger, Forecast, Inverter, LiveStatus, WallboxStatus};
use crate::forecast::ForecastProvider;
use crate::repo::{PersistedState, StateStore};
use crate::simulation::solar::PvArray;
use crate::telemetry::{TelemetrySink, TickRecord};

pub use allocator::{Allocation, AllocationInput, ChargeCurrentAllocator, CurrentLimits, NO_PV_DATA};
pub use battery_manager::{BatteryChargeManager, BatteryDecision, BatteryInput};
pub use clearsky::{ClearSkyProduction, ClearSkyWindows, ClearskyWindowCalculator};
pub use soc_estimator::SocEstimator;

/// Everything the decision engine reads from the outside world for one tick
#[derive(Debug, Clone)]
pub struct TickInputs {
    pub now: DateTime<Utc>,
    pub status: LiveStatus,
    /// `None` when the wallbox could not be read
    pub wallbox: Option<WallboxStatus>,
    pub forecast: Forecast,
}

/// Controller-internal values reported once per tick
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerStatus {
    pub avail_power_w: f64,
    pub i_charge_a: f64,
    pub i_bat_a: f64,
    pub ctrl_power_w: f64,
    pub have_wh: f64,
    pub need_wh: f64,
    pub bat_forecast: f64,
    pub calc_soc: f64,
    pub fastcharge: bool,
    pub inhibit_discharge: bool,
    pub charge_now: bool,
    pub overflow_start: NaiveTime,
    pub overflow_end: NaiveTime,
    pub max_soc: f64,
    pub bat_min_soc: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickDecision {
    /// Current to offer the vehicle (A per phase), 0 = stop
    pub i_charge_a: f64,
    pub battery: BatteryCommand,
    /// Wallbox status as the engine saw it (reconstructed when unreachable)
    pub wallbox: WallboxStatus,
    pub wallbox_reachable: bool,
    pub status: ControllerStatus,
}

/// Pure per-tick decision: persisted state and inputs in, commands and next state out
#[derive(Clone)]
pub struct DecisionEngine {
    cfg: ControllerConfig,
    clearsky: ClearskyWindowCalculator,
    soc: SocEstimator,
}

impl DecisionEngine {
    pub fn new(cfg: ControllerConfig, clearsky: ClearskyWindowCalculator) -> Self {
        let soc = SocEstimator::new(cfg.bat_capacity_wh, cfg.max_soc);
        Self { cfg, clearsky, soc }
    }

    pub fn from_config(config: &Config) -> Self {
        let cfg = config.controller_config();
        let clearsky = ClearskyWindowCalculator::new(
            Arc::new(PvArray::from_site(&config.site)),
            config.site.clearsky_step_minutes,
            cfg.inverter_efficiency,
            cfg.feed_in_limit_w,
        );
        Self::new(cfg, clearsky)
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.cfg
    }

    /// `round` rounds a current to wallbox granularity
    pub fn evaluate(
        &self,
        mut state: PersistedState,
        inputs: &TickInputs,
        round: &dyn Fn(f64) -> f64,
    ) -> (TickDecision, PersistedState) {
        let cfg = &self.cfg;
        let now = inputs.now;
        let status = &inputs.status;
        let conv = status.converter(cfg.phases);
        let limits = CurrentLimits::resolve(cfg, inputs.wallbox.as_ref(), round);

        let wallbox = inputs.wallbox.clone().unwrap_or_else(|| WallboxStatus {
            connected: state.ctrl_power_w > 0.0,
            charge_completed: state.charge_completed,
            ctrl_current_a: conv.to_current(state.ctrl_power_w),
            min_current_a: limits.i_min,
            max_current_a: limits.i_max,
        });
        let delivered_power_w = conv.to_power(wallbox.ctrl_current_a);

        let calc_soc = self
            .soc
            .advance(state.calc_soc, status, state.minutes_since_saved(now));
        self.clearsky.refresh(&mut state, now, conv, limits.i_max);

        let charge_now = cfg.charge_now && cfg.charge_start.map_or(true, |start| now.time() >= start);

        let allocation = ChargeCurrentAllocator::new(cfg, limits, round).allocate(&AllocationInput {
            now,
            status,
            connected: wallbox.connected,
            charge_now,
            delivered_power_w,
            requested_power_w: state.ctrl_power_w,
            endcharge: &state.endcharge,
        });

        let battery = BatteryChargeManager::new(cfg, limits).decide(
            &BatteryInput {
                now,
                status,
                forecast: &inputs.forecast,
                calc_soc: Some(calc_soc),
                connected: wallbox.connected,
                charge_completed: wallbox.charge_completed,
                delivered_power_w,
                overflow: state.overflow,
            },
            allocation,
        );

        let mut i_charge = round(battery.i_charge + allocator::ROUNDING_SLACK_A);
        if i_charge < limits.i_min {
            i_charge = 0.0;
        }
        i_charge = i_charge.min(limits.i_max);
        let ctrl_power_w = conv.to_power(i_charge);

        state.saved = now;
        state.ctrl_power_w = ctrl_power_w;
        state.charge_completed = wallbox.charge_completed;
        state.calc_soc = Some(calc_soc);

        let command = BatteryCommand {
            fastcharge: battery.fastcharge,
            inhibit_discharge: battery.inhibit_discharge,
            feed_in_limit_w: cfg.feed_in_limit_w,
            max_charge_w: cfg.max_bat_charge_w,
            max_soc: battery.max_soc,
            min_soc: battery.min_soc,
        };
        let controller_status = ControllerStatus {
            avail_power_w: allocation.avail_power_w,
            i_charge_a: i_charge,
            i_bat_a: if i_charge == 0.0 { 0.0 } else { battery.i_bat },
            ctrl_power_w,
            have_wh: battery.have_wh,
            need_wh: battery.need_wh,
            bat_forecast: battery.bat_forecast,
            calc_soc,
            fastcharge: battery.fastcharge,
            inhibit_discharge: battery.inhibit_discharge,
            charge_now,
            overflow_start: state.overflow.start,
            overflow_end: state.overflow.end,
            max_soc: battery.max_soc,
            bat_min_soc: battery.min_soc,
        };

        let decision = TickDecision {
            i_charge_a: i_charge,
            battery: command,
            wallbox,
            wallbox_reachable: inputs.wallbox.is_some(),
            status: controller_status,
        };
        (decision, state)
    }
}

/// Runs ticks against the hardware, forecast, state and telemetry ports
pub struct Controller {
    engine: DecisionEngine,
    inverter: Arc<dyn Inverter>,
    wallbox: Arc<dyn EvCharger>,
    forecast: Arc<dyn ForecastProvider>,
    store: Arc<dyn StateStore>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl Controller {
    pub fn new(
        engine: DecisionEngine,
        inverter: Arc<dyn Inverter>,
        wallbox: Arc<dyn EvCharger>,
        forecast: Arc<dyn ForecastProvider>,
        store: Arc<dyn StateStore>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            engine,
            inverter,
            wallbox,
            forecast,
            store,
            telemetry,
        }
    }

    /// One control tick. State is saved even when commanding the hardware fails; the first
    /// command error is returned afterwards.
    pub async fn tick(&mut self) -> Result<TickDecision> {
        let status = self
            .inverter
            .read_status()
            .await
            .context("reading inverter status")?;
        let now = status.timestamp;
        let state = self.store.load_for_tick(now);

        let wallbox = match self.wallbox.read_status(state.charge_completed).await {
            Ok(wb) => Some(wb),
            Err(e) => {
                warn!(error = %e, "wallbox unreachable, using last commanded power");
                None
            }
        };
        let forecast = match self.forecast.forecast(now).await {
            Ok(forecast) => forecast,
            Err(e) => {
                warn!(error = %e, "forecast unavailable");
                Forecast::Unavailable
            }
        };

        let inputs = TickInputs {
            now,
            status,
            wallbox,
            forecast,
        };
        let charger = self.wallbox.clone();
        let round = move |amps: f64| charger.round_current(amps);
        let (decision, next_state) = self.engine.evaluate(state, &inputs, &round);

        if let Err(e) = self.telemetry.record(&TickRecord {
            timestamp: now,
            wallbox: &decision.wallbox,
            pv: &inputs.status,
            controller: &decision.status,
        }) {
            warn!(error = %e, "telemetry write failed");
        }

        let applied = self.apply(&decision).await;
        let saved = self
            .store
            .save(&next_state)
            .context("saving controller state");
        if let Err(e) = &saved {
            warn!(error = %e, "state not saved");
        }

        let s = &decision.status;
        info!(
            i_charge_a = s.i_charge_a,
            i_bat_a = s.i_bat_a,
            avail_power_w = s.avail_power_w,
            fastcharge = s.fastcharge,
            inhibit_discharge = s.inhibit_discharge,
            have_wh = s.have_wh,
            need_wh = s.need_wh,
            calc_soc = s.calc_soc,
            max_soc = s.max_soc,
            "control tick"
        );

        applied?;
        saved?;
        Ok(decision)
    }

    async fn apply(&self, decision: &TickDecision) -> Result<()> {
        let mut first_error = None;
        if decision.wallbox_reachable {
            if let Err(e) = self.wallbox.set_current(decision.i_charge_a).await {
                warn!(error = %e, amps = decision.i_charge_a, "wallbox command failed");
                first_error = Some(e.context("commanding wallbox"));
            }
        }
        if let Err(e) = self.inverter.apply_battery_command(&decision.battery).await {
            warn!(error = %e, "battery command failed");
            first_error.get_or_insert(e.context("commanding inverter"));
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Tick every `tick_seconds` until `shutdown` resolves. Failed ticks are logged and skipped.
    pub async fn run(&mut self, tick_seconds: u64, shutdown: impl Future<Output = ()>) -> Result<()> {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(tick_seconds.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("controller loop stopped");
                    return Ok(());
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "control tick failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MockEvCharger, MockInverter};
    use crate::forecast::MockForecastProvider;
    use crate::repo::MemoryStateStore;
    use crate::telemetry::TracingTelemetry;
    use chrono::{Duration, TimeZone, Timelike};

    struct Flat;

    impl ClearSkyProduction for Flat {
        fn clear_sky_dc_power_w(&self, at: DateTime<Utc>) -> f64 {
            if (6..18).contains(&at.hour()) {
                8000.0
            } else {
                0.0
            }
        }
    }

    fn cfg() -> ControllerConfig {
        ControllerConfig {
            i_min: Some(6.0),
            i_max: Some(16.0),
            feed_in_limit_w: 6000.0,
            max_bat_discharge_w: 4140.0,
            ..ControllerConfig::default()
        }
    }

    fn engine(cfg: ControllerConfig) -> DecisionEngine {
        let clearsky = ClearskyWindowCalculator::new(
            Arc::new(Flat),
            15,
            cfg.inverter_efficiency,
            cfg.feed_in_limit_w,
        );
        DecisionEngine::new(cfg, clearsky)
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 21, 11, 0, 0).unwrap()
    }

    fn live(dc: f64, home: f64) -> LiveStatus {
        LiveStatus {
            timestamp: now(),
            dc_power_w: dc,
            home_consumption_w: home,
            grid_voltage_v: 230.0,
            bat_power_w: 0.0,
            soc: 0.5,
        }
    }

    fn connected(ctrl_current_a: f64) -> WallboxStatus {
        WallboxStatus {
            connected: true,
            charge_completed: false,
            ctrl_current_a,
            min_current_a: 6.0,
            max_current_a: 16.0,
        }
    }

    fn floor(a: f64) -> f64 {
        a.floor()
    }

    #[test]
    fn test_engine_charges_from_surplus_and_updates_state() {
        let inputs = TickInputs {
            now: now(),
            status: live(5000.0, 500.0),
            wallbox: Some(connected(0.0)),
            forecast: Forecast::Unavailable,
        };
        let (decision, state) = engine(cfg()).evaluate(PersistedState::default(), &inputs, &floor);

        assert_eq!(decision.i_charge_a, 6.0);
        assert!(decision.battery.fastcharge);
        assert_eq!(state.saved, now());
        assert_eq!(state.ctrl_power_w, 6.0 * 690.0);
        assert_eq!(state.calc_soc, Some(0.5));
        // flat 8 kW * 0.97 exceeds 6 kW from 06:00 to 17:45, padded by 30 minutes
        assert_eq!(state.overflow.start, NaiveTime::from_hms_opt(5, 30, 0).unwrap());
        assert_eq!(state.overflow.end, NaiveTime::from_hms_opt(18, 15, 0).unwrap());
        assert_eq!(decision.status.overflow_end, state.overflow.end);
    }

    #[test]
    fn test_engine_disconnected_reports_sentinel() {
        let inputs = TickInputs {
            now: now(),
            status: live(5000.0, 500.0),
            wallbox: Some(WallboxStatus::disconnected()),
            forecast: Forecast::Unavailable,
        };
        let (decision, state) = engine(cfg()).evaluate(PersistedState::default(), &inputs, &floor);
        assert_eq!(decision.i_charge_a, 0.0);
        assert_eq!(decision.status.avail_power_w, NO_PV_DATA);
        assert_eq!(state.ctrl_power_w, 0.0);
    }

    #[test]
    fn test_engine_charge_start_gates_charging() {
        let cfg = ControllerConfig {
            charge_start: NaiveTime::from_hms_opt(12, 0, 0),
            ..cfg()
        };
        let inputs = TickInputs {
            now: now(),
            status: live(9000.0, 500.0),
            wallbox: Some(connected(0.0)),
            forecast: Forecast::Unavailable,
        };
        let (decision, _) = engine(cfg).evaluate(PersistedState::default(), &inputs, &floor);
        assert_eq!(decision.i_charge_a, 0.0);
        assert!(!decision.status.charge_now);
    }

    #[test]
    fn test_engine_falls_back_to_persisted_power_without_wallbox() {
        let state = PersistedState {
            saved: now() - Duration::minutes(1),
            ctrl_power_w: 8.0 * 690.0,
            ..PersistedState::default()
        };
        // 8 A delivered + 2 A fresh surplus
        let inputs = TickInputs {
            now: now(),
            status: live((2.0 * 690.0 + 500.0) / 0.97, 500.0),
            wallbox: None,
            forecast: Forecast::Unavailable,
        };
        let (decision, _) = engine(cfg()).evaluate(state, &inputs, &floor);
        assert!(decision.wallbox.connected);
        assert!(!decision.wallbox_reachable);
        assert_eq!(decision.i_charge_a, 10.0);
    }

    #[test]
    fn test_engine_keeps_day_windows_within_same_day() {
        let mut state = PersistedState {
            saved: now() - Duration::minutes(1),
            ..PersistedState::default()
        };
        state.endcharge.insert(6, NaiveTime::from_hms_opt(10, 0, 0).unwrap());
        let inputs = TickInputs {
            now: now(),
            status: live(0.0, 500.0),
            wallbox: Some(WallboxStatus::disconnected()),
            forecast: Forecast::Unavailable,
        };
        let (_, next) = engine(cfg()).evaluate(state.clone(), &inputs, &floor);
        assert_eq!(next.endcharge, state.endcharge);
        assert_eq!(next.overflow, state.overflow);
    }

    fn controller(
        inverter: MockInverter,
        wallbox: MockEvCharger,
        store: Arc<MemoryStateStore>,
    ) -> Controller {
        let mut forecast = MockForecastProvider::new();
        forecast
            .expect_forecast()
            .returning(|_| Ok(Forecast::Unavailable));
        Controller::new(
            engine(cfg()),
            Arc::new(inverter),
            Arc::new(wallbox),
            Arc::new(forecast),
            store,
            Arc::new(TracingTelemetry),
        )
    }

    #[tokio::test]
    async fn test_tick_commands_hardware_and_saves_state() {
        let mut inverter = MockInverter::new();
        inverter
            .expect_read_status()
            .returning(|| Ok(live(5000.0, 500.0)));
        inverter
            .expect_apply_battery_command()
            .withf(|cmd| cmd.fastcharge && cmd.feed_in_limit_w == 6000.0)
            .times(1)
            .returning(|_| Ok(()));

        let mut wallbox = MockEvCharger::new();
        wallbox
            .expect_read_status()
            .returning(|_| Ok(connected(0.0)));
        wallbox.expect_round_current().returning(|a| a.floor());
        wallbox
            .expect_set_current()
            .withf(|amps| *amps == 6.0)
            .times(1)
            .returning(|_| Ok(()));

        let store = Arc::new(MemoryStateStore::new());
        let mut ctl = controller(inverter, wallbox, store.clone());
        let decision = ctl.tick().await.unwrap();

        assert_eq!(decision.i_charge_a, 6.0);
        assert_eq!(store.snapshot().unwrap().ctrl_power_w, 6.0 * 690.0);
    }

    #[tokio::test]
    async fn test_tick_saves_state_when_wallbox_command_fails() {
        let mut inverter = MockInverter::new();
        inverter
            .expect_read_status()
            .returning(|| Ok(live(5000.0, 500.0)));
        inverter
            .expect_apply_battery_command()
            .times(1)
            .returning(|_| Ok(()));

        let mut wallbox = MockEvCharger::new();
        wallbox
            .expect_read_status()
            .returning(|_| Ok(connected(0.0)));
        wallbox.expect_round_current().returning(|a| a.floor());
        wallbox
            .expect_set_current()
            .returning(|_| Err(anyhow::anyhow!("connection refused")));

        let store = Arc::new(MemoryStateStore::new());
        let mut ctl = controller(inverter, wallbox, store.clone());

        assert!(ctl.tick().await.is_err());
        let saved = store.snapshot().unwrap();
        assert_eq!(saved.saved, now());
        assert_eq!(saved.ctrl_power_w, 6.0 * 690.0);
    }

    #[tokio::test]
    async fn test_tick_skips_wallbox_command_when_unreachable() {
        let mut inverter = MockInverter::new();
        inverter
            .expect_read_status()
            .returning(|| Ok(live(5000.0, 500.0)));
        inverter
            .expect_apply_battery_command()
            .returning(|_| Ok(()));

        let mut wallbox = MockEvCharger::new();
        wallbox
            .expect_read_status()
            .returning(|_| Err(anyhow::anyhow!("timeout")));
        wallbox.expect_round_current().returning(|a| a.floor());
        wallbox.expect_set_current().never();

        let store = Arc::new(MemoryStateStore::new());
        let mut ctl = controller(inverter, wallbox, store.clone());
        let decision = ctl.tick().await.unwrap();

        assert!(!decision.wallbox.connected);
        assert_eq!(decision.i_charge_a, 0.0);
        assert!(store.snapshot().is_some());
    }

    #[tokio::test]
    async fn test_tick_aborts_without_inverter_status() {
        let mut inverter = MockInverter::new();
        inverter
            .expect_read_status()
            .returning(|| Err(anyhow::anyhow!("offline")));
        inverter.expect_apply_battery_command().never();

        let mut wallbox = MockEvCharger::new();
        wallbox.expect_read_status().never();
        wallbox.expect_set_current().never();

        let store = Arc::new(MemoryStateStore::new());
        let mut ctl = controller(inverter, wallbox, store.clone());
        assert!(ctl.tick().await.is_err());
        assert!(store.snapshot().is_none());
    }
}
