use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Remaining energy (Wh) below which PV production is considered over for the day
pub const END_OF_PRODUCTION_WH: f64 = 100.0;

#[derive(Debug, Error, PartialEq)]
pub enum ForecastError {
    #[error("forecast contains no samples")]
    Empty,
    #[error("forecast samples are not ordered by period end")]
    Unordered,
    #[error("forecast sample has invalid remaining energy: {0}")]
    InvalidRemaining(f64),
    #[error("no forecast interval brackets {0}")]
    OutOfRange(DateTime<Utc>),
    #[error("forecast never drops below {END_OF_PRODUCTION_WH} Wh remaining")]
    NoEndOfProduction,
    #[error("forecast file is malformed: {0}")]
    Malformed(String),
}

/// One forecast period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastSample {
    pub period_end: DateTime<Utc>,
    /// PV energy expected for the rest of the day after `period_end` (Wh)
    pub remaining_wh: f64,
}

/// Same-day production forecast, ordered by `period_end`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastSeries {
    samples: Vec<ForecastSample>,
}

impl ForecastSeries {
    /// Build a series, rejecting empty, unordered or non-finite input
    pub fn new(samples: Vec<ForecastSample>) -> Result<Self, ForecastError> {
        if samples.is_empty() {
            return Err(ForecastError::Empty);
        }
        if let Some(bad) = samples
            .iter()
            .find(|s| !s.remaining_wh.is_finite() || s.remaining_wh < 0.0)
        {
            return Err(ForecastError::InvalidRemaining(bad.remaining_wh));
        }
        if samples
            .iter()
            .tuple_windows()
            .any(|(a, b)| a.period_end >= b.period_end)
        {
            return Err(ForecastError::Unordered);
        }
        Ok(Self { samples })
    }

    pub fn samples(&self) -> &[ForecastSample] {
        &self.samples
    }

    /// Remaining energy (Wh) at `now`, linearly interpolated between the bracketing samples
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Result<f64, ForecastError> {
        let (prev, next) = self
            .samples
            .iter()
            .tuple_windows()
            .find(|(_, next)| next.period_end >= now)
            .ok_or(ForecastError::OutOfRange(now))?;
        if now < prev.period_end {
            return Err(ForecastError::OutOfRange(now));
        }

        let dt = (next.period_end - prev.period_end).num_seconds() as f64;
        let elapsed = (now - prev.period_end).num_seconds() as f64;
        let delta = next.remaining_wh - prev.remaining_wh;
        Ok(prev.remaining_wh + delta * elapsed / dt)
    }

    /// First period end at which the remaining energy drops below [`END_OF_PRODUCTION_WH`]
    pub fn end_of_production(&self) -> Result<DateTime<Utc>, ForecastError> {
        self.samples
            .iter()
            .find(|s| s.remaining_wh < END_OF_PRODUCTION_WH)
            .map(|s| s.period_end)
            .ok_or(ForecastError::NoEndOfProduction)
    }
}

/// Forecast as seen by the battery charge manager
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Forecast {
    #[default]
    Unavailable,
    Series(ForecastSeries),
}

impl Forecast {
    pub fn series(&self) -> Option<&ForecastSeries> {
        match self {
            Forecast::Unavailable => None,
            Forecast::Series(series) => Some(series),
        }
    }
}

impl From<Option<ForecastSeries>> for Forecast {
    fn from(series: Option<ForecastSeries>) -> Self {
        series.map_or(Forecast::Unavailable, Forecast::Series)
    }
}
