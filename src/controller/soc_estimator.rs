use crate::domain::LiveStatus;

/// Coulomb-counted battery SOC, smoother than the sampled hardware value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SocEstimator {
    capacity_wh: f64,
    max_soc: f64,
}

impl SocEstimator {
    pub fn new(capacity_wh: f64, max_soc: f64) -> Self {
        Self {
            capacity_wh,
            max_soc,
        }
    }

    /// Advance the estimate by `elapsed_minutes` of battery power from `status`.
    ///
    /// Seeds from the measured SOC when there is no estimate yet, and snaps back to the
    /// ceiling whenever the hardware reports it.
    pub fn advance(&self, calc_soc: Option<f64>, status: &LiveStatus, elapsed_minutes: f64) -> f64 {
        let Some(calc_soc) = calc_soc else {
            return status.soc;
        };
        if (status.soc - self.max_soc).abs() < f64::EPSILON {
            return self.max_soc;
        }
        let energy_wh = status.bat_power_w * elapsed_minutes.max(0.0) / 60.0;
        (calc_soc + energy_wh / self.capacity_wh).clamp(0.0, 1.0)
    }
}
