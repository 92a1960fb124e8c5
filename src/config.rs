use anyhow::{Context, Result};
use chrono::NaiveTime;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

/// Default location of the configuration file, overridable through `PVC_CONFIG`
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(#[from] ValidationErrors),
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[validate(schema(function = "validate_soc_bands"))]
pub struct Config {
    #[validate(nested)]
    pub controller: ControllerSettings,
    #[validate(nested)]
    pub storage: StorageConfig,
    #[validate(nested)]
    pub site: SiteConfig,
    #[serde(default)]
    pub forecast: ForecastConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[validate(schema(function = "validate_controller_settings"))]
pub struct ControllerSettings {
    #[serde(default = "default_phases")]
    #[validate(range(min = 1, max = 3))]
    pub phases: u8,
    /// Minimum charge current; refined from the wallbox when unset or lower than its minimum
    #[validate(range(min = 0.0))]
    pub i_min: Option<f64>,
    /// Maximum charge current; refined from the wallbox when unset or higher than its maximum
    #[validate(range(min = 0.0))]
    pub i_max: Option<f64>,
    #[serde(default)]
    #[validate(range(min = 0.0))]
    pub i_grid_max: f64,
    #[serde(default = "default_feed_in_limit")]
    #[validate(range(min = 0.0))]
    pub feed_in_limit_w: f64,
    #[serde(default = "default_max_soc")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub max_soc: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub max_soc_charge: Option<f64>,
    #[validate(range(min = 0.0, max = 1.0))]
    pub min_soc_charge: Option<f64>,
    #[serde(default)]
    pub allow_bat2ev: bool,
    #[serde(default = "default_true")]
    pub charge_now: bool,
    /// Time of day (UTC, `HH:MM:SS`) before which the vehicle is not charged
    pub charge_start: Option<NaiveTime>,
    #[serde(default = "default_inverter_efficiency")]
    #[validate(range(min = 0.5, max = 1.0))]
    pub inverter_efficiency: f64,
    #[serde(default)]
    pub use_full_grid_allowance: bool,
    #[serde(default = "default_tick_seconds")]
    #[validate(range(min = 1))]
    pub tick_seconds: u64,
    #[serde(default)]
    pub run_once: bool,
    #[serde(default)]
    pub coefficients: Coefficients,
}

/// Coefficient pairs of the battery current and battery urgency models
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Coefficients {
    /// Permissive battery-current ramp (SOC at which the allowance starts, SOC at full allowance)
    pub a: [f64; 2],
    /// Conservative battery-current ramp used to merely sustain the minimum current
    pub b: [f64; 2],
    /// have/need divisors for the urgent and the early battery-charge rules
    pub c: [f64; 2],
}

impl Default for Coefficients {
    fn default() -> Self {
        Self {
            a: [0.5, 1.0],
            b: [0.2, 0.7],
            c: [1.2, 2.0],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[validate(schema(function = "validate_storage"))]
pub struct StorageConfig {
    #[validate(range(min = 1.0))]
    pub capacity_wh: f64,
    #[validate(range(min = 0.0))]
    pub max_discharge_w: f64,
    /// Defaults to `max_discharge_w / inverter_efficiency`
    #[validate(range(min = 0.0))]
    pub max_charge_w: Option<f64>,
    #[serde(default = "default_min_soc")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub min_soc: f64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SiteConfig {
    #[validate(range(min = -90.0, max = 90.0))]
    pub latitude: f64,
    #[validate(range(min = -180.0, max = 180.0))]
    pub longitude: f64,
    /// Installed PV generator peak power (W)
    #[validate(range(min = 0.0))]
    pub pv_peak_w: f64,
    #[serde(default = "default_system_efficiency")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub system_efficiency: f64,
    #[serde(default = "default_clearsky_step")]
    #[validate(range(min = 5, max = 15))]
    pub clearsky_step_minutes: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForecastConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// JSON file with `{ period_end, power_w }` samples; no forecast when unset
    pub path: Option<PathBuf>,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: default_state_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InverterKind {
    #[default]
    Simulated,
    Kostal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WallboxKind {
    #[default]
    Simulated,
    HardyBarth,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HardwareConfig {
    #[serde(default)]
    pub inverter: InverterKind,
    #[serde(default)]
    pub wallbox: WallboxKind,
    pub kostal: Option<KostalConfig>,
    pub hardy_barth: Option<HardyBarthConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KostalConfig {
    pub host: String,
    /// Plant owner ("user") password; usually supplied as `PVC__HARDWARE__KOSTAL__PASSWORD`
    pub password: String,
    /// Read the inverter but never change its settings
    #[serde(default)]
    pub inhibit_write: bool,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_seconds: u64,
    /// `Battery:MinHomeComsumption` restored when discharge is no longer held back
    #[serde(default = "default_min_home_consumption")]
    pub min_home_consumption_w: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HardyBarthConfig {
    pub host: String,
    #[serde(default = "default_charge_control_id")]
    pub id: u32,
    /// Read the wallbox but never write to it
    #[serde(default)]
    pub inhibit_write: bool,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_seconds: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub log_filter: Option<String>,
    /// Directory for daily-rolling log files in addition to stdout
    pub log_dir: Option<PathBuf>,
    /// File receiving one JSON record per measurement and tick
    pub json_lines: Option<PathBuf>,
}

/// Immutable per-run controller parameters derived from [`Config`]
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    pub phases: u8,
    pub i_min: Option<f64>,
    pub i_max: Option<f64>,
    pub i_grid_max: f64,
    pub feed_in_limit_w: f64,
    pub min_soc: f64,
    pub max_soc: f64,
    pub min_soc_charge: f64,
    pub max_soc_charge: f64,
    pub allow_bat2ev: bool,
    pub charge_now: bool,
    pub charge_start: Option<NaiveTime>,
    pub inverter_efficiency: f64,
    pub use_full_grid_allowance: bool,
    pub bat_capacity_wh: f64,
    pub max_bat_charge_w: f64,
    pub max_bat_discharge_w: f64,
    pub coefficients: Coefficients,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            phases: default_phases(),
            i_min: None,
            i_max: None,
            i_grid_max: 0.0,
            feed_in_limit_w: default_feed_in_limit(),
            min_soc: default_min_soc(),
            max_soc: default_max_soc(),
            min_soc_charge: default_min_soc(),
            max_soc_charge: default_max_soc(),
            allow_bat2ev: false,
            charge_now: true,
            charge_start: None,
            inverter_efficiency: default_inverter_efficiency(),
            use_full_grid_allowance: false,
            bat_capacity_wh: 10_000.0,
            max_bat_charge_w: 5000.0 / default_inverter_efficiency(),
            max_bat_discharge_w: 5000.0,
            coefficients: Coefficients::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let path = std::env::var("PVC_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        Self::from_figment(
            Figment::new()
                .merge(Toml::file(&path))
                .merge(Env::prefixed("PVC__").split("__")),
        )
        .with_context(|| format!("loading configuration from {path} and PVC__* environment"))
    }

    /// Parse and validate a configuration from TOML text
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        Self::from_figment(Figment::new().merge(Toml::string(toml)))
    }

    fn from_figment(figment: Figment) -> Result<Self> {
        let cfg: Config = figment.extract()?;
        cfg.validate().map_err(ConfigError::from)?;
        Ok(cfg)
    }

    pub fn controller_config(&self) -> ControllerConfig {
        let c = &self.controller;
        let s = &self.storage;
        ControllerConfig {
            phases: c.phases,
            i_min: c.i_min,
            i_max: c.i_max,
            i_grid_max: c.i_grid_max,
            feed_in_limit_w: c.feed_in_limit_w,
            min_soc: s.min_soc,
            max_soc: c.max_soc,
            min_soc_charge: c.min_soc_charge.unwrap_or(s.min_soc),
            max_soc_charge: c.max_soc_charge.unwrap_or(c.max_soc),
            allow_bat2ev: c.allow_bat2ev,
            charge_now: c.charge_now,
            charge_start: c.charge_start,
            inverter_efficiency: c.inverter_efficiency,
            use_full_grid_allowance: c.use_full_grid_allowance,
            bat_capacity_wh: s.capacity_wh,
            max_bat_charge_w: s
                .max_charge_w
                .unwrap_or(s.max_discharge_w / c.inverter_efficiency),
            max_bat_discharge_w: s.max_discharge_w,
            coefficients: c.coefficients,
        }
    }
}

fn validate_soc_bands(cfg: &Config) -> Result<(), ValidationError> {
    let min_soc_charge = cfg.controller.min_soc_charge.unwrap_or(cfg.storage.min_soc);
    if min_soc_charge < cfg.storage.min_soc {
        return Err(ValidationError::new("min_soc_charge_below_min_soc"));
    }
    if cfg.storage.min_soc >= cfg.controller.max_soc {
        return Err(ValidationError::new("min_soc_not_below_max_soc"));
    }
    Ok(())
}

fn validate_controller_settings(c: &ControllerSettings) -> Result<(), ValidationError> {
    if let (Some(lo), Some(hi)) = (c.i_min, c.i_max) {
        if lo > hi {
            return Err(ValidationError::new("i_min_above_i_max"));
        }
    }
    if c.max_soc_charge.is_some_and(|m| m > c.max_soc) {
        return Err(ValidationError::new("max_soc_charge_above_max_soc"));
    }
    let k = &c.coefficients;
    if [k.a, k.b].iter().any(|[c0, c1]| c0 >= c1) {
        return Err(ValidationError::new("coefficient_ramp_not_increasing"));
    }
    if k.c.iter().any(|c| *c <= 0.0) {
        return Err(ValidationError::new("urgency_coefficient_not_positive"));
    }
    Ok(())
}

fn validate_storage(s: &StorageConfig) -> Result<(), ValidationError> {
    if s.max_discharge_w <= 0.0 {
        return Err(ValidationError::new("max_discharge_not_positive"));
    }
    Ok(())
}

fn default_phases() -> u8 {
    3
}
fn default_feed_in_limit() -> f64 {
    99_999.0
}
fn default_max_soc() -> f64 {
    1.0
}
fn default_min_soc() -> f64 {
    0.05
}
fn default_true() -> bool {
    true
}
fn default_inverter_efficiency() -> f64 {
    0.97
}
fn default_tick_seconds() -> u64 {
    60
}
fn default_system_efficiency() -> f64 {
    0.85
}
fn default_clearsky_step() -> u32 {
    15
}
fn default_state_path() -> PathBuf {
    PathBuf::from("pvcontrol.state")
}
fn default_charge_control_id() -> u32 {
    1
}
fn default_http_timeout() -> u64 {
    10
}
fn default_min_home_consumption() -> f64 {
    50.0
}
