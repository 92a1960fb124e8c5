use anyhow::{anyhow, Result};
use std::sync::Arc;
use tracing::info;

use crate::config::{HardwareConfig, InverterKind, WallboxKind};
use crate::domain::{EvCharger, Inverter, SimulatedEvCharger, SimulatedInverter};

use super::{HardyBarthWallbox, KostalInverter};

/// Builds the device drivers selected by `[hardware]`
pub struct DeviceFactory {
    config: HardwareConfig,
}

impl DeviceFactory {
    pub fn new(config: HardwareConfig) -> Self {
        Self { config }
    }

    /// Create the inverter driver
    pub fn create_inverter(&self) -> Result<Arc<dyn Inverter>> {
        info!(kind = %self.config.inverter, "creating inverter");
        match self.config.inverter {
            InverterKind::Simulated => Ok(Arc::new(SimulatedInverter::default_inverter())),
            InverterKind::Kostal => {
                let cfg = self
                    .config
                    .kostal
                    .as_ref()
                    .ok_or_else(|| anyhow!("inverter = \"kostal\" needs a [hardware.kostal] section"))?;
                Ok(Arc::new(KostalInverter::new(cfg)?))
            }
        }
    }

    /// Create the wallbox driver
    pub fn create_ev_charger(&self) -> Result<Arc<dyn EvCharger>> {
        info!(kind = %self.config.wallbox, "creating wallbox");
        match self.config.wallbox {
            WallboxKind::Simulated => Ok(Arc::new(SimulatedEvCharger::default_charger())),
            WallboxKind::HardyBarth => {
                let cfg = self
                    .config
                    .hardy_barth
                    .as_ref()
                    .ok_or_else(|| anyhow!("wallbox = \"hardy_barth\" needs a [hardware.hardy_barth] section"))?;
                Ok(Arc::new(HardyBarthWallbox::new(cfg)?))
            }
        }
    }
}

impl Default for DeviceFactory {
    fn default() -> Self {
        Self::new(HardwareConfig::default())
    }
}
