use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use itertools::Itertools;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::RwLock;
use tracing::debug;

use super::ForecastProvider;
use crate::domain::{Forecast, ForecastError, ForecastSample, ForecastSeries};

/// Reads PV production forecasts from a JSON file
///
/// The file holds `[{ "period_end": "2024-06-21T10:30:00Z", "power_w": 3120.0 }, ...]` with
/// the average power of each period. Samples outside the current UTC day are ignored.
#[derive(Clone)]
pub struct FileForecastProvider {
    path: PathBuf,
    cache: Arc<RwLock<Option<CacheEntry>>>,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    date: NaiveDate,
    modified: Option<SystemTime>,
    forecast: Forecast,
}

#[derive(Debug, Deserialize)]
struct RawSample {
    period_end: DateTime<Utc>,
    power_w: f64,
}

impl FileForecastProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Arc::new(RwLock::new(None)),
        }
    }

    async fn modified(&self) -> Option<SystemTime> {
        tokio::fs::metadata(&self.path)
            .await
            .and_then(|m| m.modified())
            .ok()
    }
}

#[async_trait]
impl ForecastProvider for FileForecastProvider {
    async fn forecast(&self, now: DateTime<Utc>) -> Result<Forecast> {
        let date = now.date_naive();
        let modified = self.modified().await;
        {
            let c = self.cache.read().await;
            if let Some(entry) = &*c {
                if entry.date == date && entry.modified == modified {
                    return Ok(entry.forecast.clone());
                }
            }
        }

        let body = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading forecast file {}", self.path.display()))?;
        let raw: Vec<RawSample> =
            serde_json::from_str(&body).map_err(|e| ForecastError::Malformed(e.to_string()))?;

        let forecast = match series_for_day(raw, date) {
            Ok(series) => Forecast::Series(series),
            Err(ForecastError::Empty) => {
                debug!(%date, "forecast file has no samples for today");
                Forecast::Unavailable
            }
            Err(e) => return Err(e.into()),
        };

        *self.cache.write().await = Some(CacheEntry {
            date,
            modified,
            forecast: forecast.clone(),
        });
        Ok(forecast)
    }
}

/// Turn per-period production samples into "energy remaining after this period" samples
fn series_for_day(raw: Vec<RawSample>, date: NaiveDate) -> Result<ForecastSeries, ForecastError> {
    let samples: Vec<RawSample> = raw
        .into_iter()
        .filter(|s| s.period_end.date_naive() == date)
        .sorted_by_key(|s| s.period_end)
        .collect();
    if samples.is_empty() {
        return Err(ForecastError::Empty);
    }
    if samples.len() < 2 {
        return Err(ForecastError::Malformed(
            "at least two samples are needed to infer the period length".into(),
        ));
    }

    let period_h = (samples[1].period_end - samples[0].period_end).num_seconds() as f64 / 3600.0;
    if period_h <= 0.0 {
        return Err(ForecastError::Unordered);
    }

    let energy_wh: Vec<f64> = samples
        .iter()
        .map(|s| s.power_w.max(0.0) * period_h)
        .collect();
    let mut remaining = 0.0;
    let mut remaining_after = vec![0.0; samples.len()];
    for i in (0..samples.len()).rev() {
        remaining_after[i] = remaining;
        remaining += energy_wh[i];
    }

    ForecastSeries::new(
        samples
            .iter()
            .zip(remaining_after)
            .map(|(s, remaining_wh)| ForecastSample {
                period_end: s.period_end,
                remaining_wh,
            })
            .collect(),
    )
}
