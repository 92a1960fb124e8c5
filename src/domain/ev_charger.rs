use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wallbox-specific errors
#[derive(Debug, Error)]
pub enum ChargerError {
    #[error("Communication error: {0}")]
    Communication(String),
    #[error("Invalid current: {0}A (out of supported range)")]
    InvalidCurrent(f64),
    #[error("Vehicle not connected")]
    VehicleNotConnected,
    #[error("Unexpected wallbox response: {0}")]
    UnexpectedResponse(String),
}

/// Wallbox port - abstraction over REST-controlled or simulated wallboxes
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EvCharger: Send + Sync {
    /// Read the wallbox status. `previous_charge_completed` is the flag seen on the
    /// previous tick; some wallboxes need it to tell "finished" from "disabled".
    async fn read_status(&self, previous_charge_completed: bool) -> Result<WallboxStatus>;

    /// Offer `amps` per phase to the vehicle; 0 stops charging.
    async fn set_current(&self, amps: f64) -> Result<()>;

    /// Round a charge current to what the wallbox can actually deliver
    fn round_current(&self, amps: f64) -> f64 {
        amps.floor()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WallboxStatus {
    pub connected: bool,
    pub charge_completed: bool,
    /// Current the wallbox is offering right now (A per phase)
    pub ctrl_current_a: f64,
    pub min_current_a: f64,
    pub max_current_a: f64,
}

impl WallboxStatus {
    pub fn disconnected() -> Self {
        Self {
            connected: false,
            charge_completed: false,
            ctrl_current_a: 0.0,
            min_current_a: 6.0,
            max_current_a: 16.0,
        }
    }
}

/// Simulated wallbox for development and testing
#[derive(Debug)]
pub struct SimulatedEvCharger {
    state: Mutex<WallboxStatus>,
}

impl SimulatedEvCharger {
    pub fn new(initial: WallboxStatus) -> Self {
        Self {
            state: Mutex::new(initial),
        }
    }

    pub fn default_charger() -> Self {
        Self::new(WallboxStatus::disconnected())
    }

    /// Simulate a vehicle plugging in
    pub fn simulate_connect(&self) {
        let mut st = self.state.lock();
        st.connected = true;
        st.charge_completed = false;
    }

    /// Simulate a vehicle being unplugged
    pub fn simulate_disconnect(&self) {
        let mut st = self.state.lock();
        st.connected = false;
        st.charge_completed = false;
        st.ctrl_current_a = 0.0;
    }

    /// Simulate the vehicle reporting a full battery
    pub fn simulate_charge_completed(&self) {
        let mut st = self.state.lock();
        st.charge_completed = true;
        st.ctrl_current_a = 0.0;
    }

    pub fn status(&self) -> WallboxStatus {
        self.state.lock().clone()
    }
}

#[async_trait]
impl EvCharger for SimulatedEvCharger {
    async fn read_status(&self, _previous_charge_completed: bool) -> Result<WallboxStatus> {
        Ok(self.status())
    }

    async fn set_current(&self, amps: f64) -> Result<()> {
        if !amps.is_finite() || amps < 0.0 {
            return Err(ChargerError::InvalidCurrent(amps).into());
        }
        let mut st = self.state.lock();
        if amps > 0.0 && !st.connected {
            return Err(ChargerError::VehicleNotConnected.into());
        }
        if amps > st.max_current_a {
            return Err(ChargerError::InvalidCurrent(amps).into());
        }
        st.ctrl_current_a = if st.charge_completed { 0.0 } else { amps };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulated_charger_follows_commands() {
        let charger = SimulatedEvCharger::default_charger();
        assert!(charger.set_current(8.0).await.is_err());

        charger.simulate_connect();
        charger.set_current(8.0).await.unwrap();
        let st = charger.read_status(false).await.unwrap();
        assert!(st.connected);
        assert_eq!(st.ctrl_current_a, 8.0);

        charger.set_current(0.0).await.unwrap();
        assert_eq!(charger.status().ctrl_current_a, 0.0);
    }

    #[tokio::test]
    async fn test_completed_vehicle_draws_nothing() {
        let charger = SimulatedEvCharger::default_charger();
        charger.simulate_connect();
        charger.simulate_charge_completed();
        charger.set_current(10.0).await.unwrap();
        assert_eq!(charger.status().ctrl_current_a, 0.0);
    }

    #[test]
    fn test_default_rounding_floors_to_whole_amps() {
        let charger = SimulatedEvCharger::default_charger();
        assert_eq!(charger.round_current(6.97), 6.0);
        assert_eq!(charger.round_current(7.0), 7.0);
    }

    #[tokio::test]
    async fn test_rejects_current_above_maximum() {
        let charger = SimulatedEvCharger::default_charger();
        charger.simulate_connect();
        assert!(charger.set_current(32.0).await.is_err());
    }
}
