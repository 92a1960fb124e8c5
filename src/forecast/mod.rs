//! # Production Forecast
//!
//! The battery charge manager needs, for the current UTC day, how much PV energy is still to come
//! after each forecast period. Providers turn whatever source they read into a
//! [`Forecast`](crate::domain::Forecast).

pub mod file;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::ForecastConfig;
use crate::domain::Forecast;

pub use file::FileForecastProvider;

/// Forecast port
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ForecastProvider: Send + Sync {
    /// Same-day forecast as seen at `now`
    async fn forecast(&self, now: DateTime<Utc>) -> Result<Forecast>;
}

/// Provider used when forecasting is switched off: the battery is always fast-charged
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledForecast;

#[async_trait]
impl ForecastProvider for DisabledForecast {
    async fn forecast(&self, _now: DateTime<Utc>) -> Result<Forecast> {
        Ok(Forecast::Unavailable)
    }
}

/// Provider selected by `[forecast]`
pub fn provider_from_config(cfg: &ForecastConfig) -> Box<dyn ForecastProvider> {
    match (&cfg.path, cfg.enabled) {
        (Some(path), true) => Box::new(FileForecastProvider::new(path.clone())),
        _ => Box::new(DisabledForecast),
    }
}
