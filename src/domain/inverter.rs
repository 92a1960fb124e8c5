use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;

use super::{BatteryCommand, LiveStatus};

/// Inverter-specific errors
#[derive(Debug, Error)]
pub enum InverterError {
    #[error("Communication error: {0}")]
    Communication(String),
    #[error("Invalid SOC limit: {0} (expected 0..1)")]
    InvalidSocLimit(f64),
    #[error("Inverter offline or unavailable")]
    Offline,
    #[error("Unexpected inverter response: {0}")]
    UnexpectedResponse(String),
    #[error("Battery command issued before any status was read")]
    NoStatus,
}

/// Hybrid inverter port - PV, home and battery telemetry plus battery charge control
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Inverter: Send + Sync {
    async fn read_status(&self) -> Result<LiveStatus>;
    async fn apply_battery_command(&self, command: &BatteryCommand) -> Result<()>;
}

/// Simulated inverter for development and testing
///
/// Returns whatever status was last injected and remembers the last battery command.
#[derive(Debug)]
pub struct SimulatedInverter {
    status: Mutex<Option<LiveStatus>>,
    last_command: Mutex<Option<BatteryCommand>>,
    /// Stamp every read with the wall clock instead of the injected timestamp
    live_clock: bool,
}

impl SimulatedInverter {
    pub fn new(initial: LiveStatus) -> Self {
        Self {
            status: Mutex::new(Some(initial)),
            last_command: Mutex::new(None),
            live_clock: false,
        }
    }

    /// Inverter at night: no PV, idle battery at 50 %. Reads carry the current time.
    pub fn default_inverter() -> Self {
        Self {
            live_clock: true,
            ..Self::new(LiveStatus {
                timestamp: Utc::now(),
                dc_power_w: 0.0,
                home_consumption_w: 350.0,
                grid_voltage_v: 230.0,
                bat_power_w: 0.0,
                soc: 0.5,
            })
        }
    }

    /// Inject the status returned by the next reads
    pub fn set_status(&self, status: LiveStatus) {
        *self.status.lock() = Some(status);
    }

    /// Simulate a communication outage
    pub fn go_offline(&self) {
        *self.status.lock() = None;
    }

    pub fn last_command(&self) -> Option<BatteryCommand> {
        self.last_command.lock().clone()
    }
}

#[async_trait]
impl Inverter for SimulatedInverter {
    async fn read_status(&self) -> Result<LiveStatus> {
        let mut status = self.status.lock().clone().ok_or(InverterError::Offline)?;
        if self.live_clock {
            status.timestamp = Utc::now();
        }
        Ok(status)
    }

    async fn apply_battery_command(&self, command: &BatteryCommand) -> Result<()> {
        for soc in [command.max_soc, command.min_soc] {
            if !(0.0..=1.0).contains(&soc) {
                return Err(InverterError::InvalidSocLimit(soc).into());
            }
        }
        if self.status.lock().is_none() {
            return Err(InverterError::Offline.into());
        }
        *self.last_command.lock() = Some(command.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command() -> BatteryCommand {
        BatteryCommand {
            fastcharge: true,
            inhibit_discharge: false,
            feed_in_limit_w: 6000.0,
            max_charge_w: 3500.0,
            max_soc: 1.0,
            min_soc: 0.05,
        }
    }

    #[tokio::test]
    async fn test_simulated_inverter_records_commands() {
        let inverter = SimulatedInverter::default_inverter();
        assert!(inverter.last_command().is_none());

        inverter.apply_battery_command(&command()).await.unwrap();
        assert_eq!(inverter.last_command(), Some(command()));
    }

    #[tokio::test]
    async fn test_default_inverter_follows_the_clock() {
        let inverter = SimulatedInverter::default_inverter();
        let first = inverter.read_status().await.unwrap().timestamp;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = inverter.read_status().await.unwrap().timestamp;
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_injected_status_keeps_its_timestamp() {
        let status = LiveStatus {
            timestamp: Utc::now() - chrono::Duration::hours(3),
            ..SimulatedInverter::default_inverter().read_status().await.unwrap()
        };
        let inverter = SimulatedInverter::new(status.clone());
        assert_eq!(inverter.read_status().await.unwrap(), status);
    }

    #[tokio::test]
    async fn test_offline_inverter_fails_reads_and_commands() {
        let inverter = SimulatedInverter::default_inverter();
        inverter.go_offline();
        assert!(inverter.read_status().await.is_err());
        assert!(inverter.apply_battery_command(&command()).await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_soc_limits_outside_unit_range() {
        let inverter = SimulatedInverter::default_inverter();
        let mut cmd = command();
        cmd.max_soc = 1.2;
        assert!(inverter.apply_battery_command(&cmd).await.is_err());
    }
}
