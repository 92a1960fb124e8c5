use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use tokio::signal;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use crate::config::TelemetryConfig;
use crate::controller::ControllerStatus;
use crate::domain::{LiveStatus, WallboxStatus};

const DEFAULT_LOG_FILTER: &str = "info,reqwest=warn,hyper=warn";

/// Install the global subscriber. Keep the returned guard alive to flush file logs.
pub fn init_tracing(cfg: &TelemetryConfig) -> Option<WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        cfg.log_filter
            .as_deref()
            .unwrap_or(DEFAULT_LOG_FILTER)
            .into()
    });

    let (file_layer, guard) = match &cfg.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "pv-surplus-controller.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .with(file_layer)
        .init();
    guard
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! { _ = ctrl_c => {}, _ = terminate => {}, }
    info!("shutdown signal received");
}

/// The three per-tick measurements
#[derive(Debug, Clone, Copy)]
pub struct TickRecord<'a> {
    pub timestamp: DateTime<Utc>,
    pub wallbox: &'a WallboxStatus,
    pub pv: &'a LiveStatus,
    pub controller: &'a ControllerStatus,
}

/// Receives per-tick records; failures are reported to the caller, which only logs them
pub trait TelemetrySink: Send + Sync {
    fn record(&self, tick: &TickRecord<'_>) -> Result<()>;
}

/// Emits the records as structured tracing events
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn record(&self, tick: &TickRecord<'_>) -> Result<()> {
        let wb = tick.wallbox;
        let pv = tick.pv;
        let c = tick.controller;
        tracing::debug!(
            measurement = "wbstatus",
            connected = wb.connected,
            charge_completed = wb.charge_completed,
            ctrl_current_a = wb.ctrl_current_a,
            "wallbox status"
        );
        tracing::debug!(
            measurement = "pvstatus",
            dc_power_w = pv.dc_power_w,
            home_consumption_w = pv.home_consumption_w,
            bat_power_w = pv.bat_power_w,
            soc = pv.soc,
            grid_voltage_v = pv.grid_voltage_v,
            "pv status"
        );
        tracing::debug!(
            measurement = "ctrlstatus",
            avail_power_w = c.avail_power_w,
            i_charge_a = c.i_charge_a,
            i_bat_a = c.i_bat_a,
            have_wh = c.have_wh,
            need_wh = c.need_wh,
            bat_forecast = c.bat_forecast,
            calc_soc = c.calc_soc,
            fastcharge = c.fastcharge,
            inhibit_discharge = c.inhibit_discharge,
            charge_now = c.charge_now,
            overflow_start = %c.overflow_start,
            max_soc = c.max_soc,
            bat_min_soc = c.bat_min_soc,
            "controller status"
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct Line<'a, T: Serialize> {
    measurement: &'static str,
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    fields: &'a T,
}

/// Appends one JSON object per measurement to a file
#[derive(Debug)]
pub struct JsonLinesTelemetry {
    file: Mutex<File>,
}

impl JsonLinesTelemetry {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening telemetry file {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    fn write_line<T: Serialize>(
        file: &mut File,
        measurement: &'static str,
        timestamp: DateTime<Utc>,
        fields: &T,
    ) -> Result<()> {
        let line = serde_json::to_string(&Line {
            measurement,
            timestamp,
            fields,
        })?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

impl TelemetrySink for JsonLinesTelemetry {
    fn record(&self, tick: &TickRecord<'_>) -> Result<()> {
        let mut file = self.file.lock();
        Self::write_line(&mut file, "wbstatus", tick.timestamp, tick.wallbox)?;
        Self::write_line(&mut file, "pvstatus", tick.timestamp, tick.pv)?;
        Self::write_line(&mut file, "ctrlstatus", tick.timestamp, tick.controller)?;
        file.flush()?;
        Ok(())
    }
}

/// Fans records out to several sinks; every sink is tried, the first error is returned
pub struct MultiTelemetry {
    sinks: Vec<Box<dyn TelemetrySink>>,
}

impl MultiTelemetry {
    pub fn new(sinks: Vec<Box<dyn TelemetrySink>>) -> Self {
        Self { sinks }
    }
}

impl TelemetrySink for MultiTelemetry {
    fn record(&self, tick: &TickRecord<'_>) -> Result<()> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.record(tick) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Sinks selected by `[telemetry]`
pub fn sink_from_config(cfg: &TelemetryConfig) -> Result<MultiTelemetry> {
    let mut sinks: Vec<Box<dyn TelemetrySink>> = vec![Box::new(TracingTelemetry)];
    if let Some(path) = &cfg.json_lines {
        sinks.push(Box::new(JsonLinesTelemetry::open(path)?));
    }
    Ok(MultiTelemetry::new(sinks))
}
