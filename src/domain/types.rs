use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Grid voltage assumed when the inverter reports no usable AC voltage
pub const NOMINAL_GRID_VOLTAGE_V: f64 = 230.0;

/// Snapshot of the PV system as read from the inverter
///
/// Power sign conventions:
/// - `dc_power_w` is always positive (PV generator output)
/// - `bat_power_w` is positive while the battery charges, negative while it discharges
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveStatus {
    pub timestamp: DateTime<Utc>,
    pub dc_power_w: f64,
    pub home_consumption_w: f64,
    pub grid_voltage_v: f64,
    pub bat_power_w: f64,
    /// Battery state of charge as reported by the hardware (0..1)
    pub soc: f64,
}

impl LiveStatus {
    /// Converter between per-phase charge current and AC power at the measured voltage
    pub fn converter(&self, phases: u8) -> CurrentConverter {
        CurrentConverter::new(self.grid_voltage_v, phases)
    }
}

impl fmt::Display for LiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LiveStatus {{ DC: {:.0}W, Home: {:.0}W, Battery: {:.0}W, SOC: {:.1}%, Grid: {:.1}V }}",
            self.dc_power_w,
            self.home_consumption_w,
            self.bat_power_w,
            self.soc * 100.0,
            self.grid_voltage_v
        )
    }
}

/// Converts between per-phase charge current (A) and total AC power (W)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurrentConverter {
    voltage_v: f64,
    phases: f64,
}

impl CurrentConverter {
    pub fn new(voltage_v: f64, phases: u8) -> Self {
        let voltage_v = if voltage_v.is_finite() && voltage_v > 0.0 {
            voltage_v
        } else {
            NOMINAL_GRID_VOLTAGE_V
        };
        Self {
            voltage_v,
            phases: f64::from(phases.max(1)),
        }
    }

    pub fn to_current(&self, power_w: f64) -> f64 {
        power_w / (self.voltage_v * self.phases)
    }

    pub fn to_power(&self, current_a: f64) -> f64 {
        current_a * self.voltage_v * self.phases
    }
}

/// Battery charging strategy handed to the inverter once per active tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatteryCommand {
    /// Charge as fast as possible instead of letting the inverter smart-charge
    pub fastcharge: bool,
    /// Do not discharge the battery for home load during this tick
    pub inhibit_discharge: bool,
    pub feed_in_limit_w: f64,
    pub max_charge_w: f64,
    /// SOC ceiling (0..1)
    pub max_soc: f64,
    /// SOC floor (0..1)
    pub min_soc: f64,
}

/// Time-of-day window (UTC) in which PV output risks exceeding the feed-in limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverflowWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl OverflowWindow {
    /// "No overflow risk today": starts at the end of the day and ends at its beginning
    pub fn none() -> Self {
        Self {
            start: NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN),
            end: NaiveTime::MIN,
        }
    }

    pub fn is_none(&self) -> bool {
        self.start >= self.end
    }

    pub fn before_start(&self, t: NaiveTime) -> bool {
        t < self.start
    }

    pub fn past_end(&self, t: NaiveTime) -> bool {
        t > self.end
    }
}

impl Default for OverflowWindow {
    fn default() -> Self {
        Self::none()
    }
}
