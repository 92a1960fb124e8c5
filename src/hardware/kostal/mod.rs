//! # Kostal Plenticore inverter
//!
//! REST API at `http://<host>/api/v1/`, "external battery control" must be enabled on the
//! inverter. Status comes from the `processdata` and `settings` endpoints of the
//! `devices:local*` modules. Battery commands become writes to the `Battery:*` settings, issued
//! only for values that differ from what the inverter reported on the last read.
//!
//! Kostal counts battery discharge as positive power; [`LiveStatus`] is flipped to charge-positive.

mod session;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use reqwest::{header::AUTHORIZATION, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::KostalConfig;
use crate::domain::{BatteryCommand, Inverter, InverterError, LiveStatus};

use session::{
    client_nonce, CreateSessionResponse, FinishRequest, FinishResponse, Scram, StartRequest,
    StartResponse, USERNAME,
};

const MODULE: &str = "devices:local";
const SMART_BATTERY_CONTROL: &str = "Battery:SmartBatteryControl:Enable";
const MAX_CHARGE_POWER: &str = "Battery:ExternControl:MaxChargePowerAbs";
const MAX_SOC: &str = "Battery:ExternControl:MaxSocRel";
const MIN_SOC: &str = "Battery:MinSoc";
// sic, the inverter spells it this way
const MIN_HOME_CONSUMPTION: &str = "Battery:MinHomeComsumption";

/// Battery settings are only touched while the PV generator produces at least this much
const ACTIVE_DC_POWER_W: f64 = 50.0;
/// Smart charging never throttles the battery below this charge power
const MIN_THROTTLED_CHARGE_W: f64 = 200.0;
/// Discharge only starts above this home load, so setting it holds the battery back
const HOLD_DISCHARGE_MIN_HOME_W: f64 = 20_000.0;

#[derive(Debug, Deserialize)]
struct ProcessDataModule {
    processdata: Vec<ProcessValue>,
}

#[derive(Debug, Deserialize)]
struct ProcessValue {
    id: String,
    value: f64,
}

/// Settings come back as strings
#[derive(Debug, Deserialize)]
struct SettingValue {
    id: String,
    value: String,
}

/// Everything the last status read saw, in the inverter's own sign conventions
#[derive(Debug, Clone, PartialEq)]
struct KostalSnapshot {
    dc_power_w: f64,
    /// Consumption from the grid positive, feed-in negative
    grid_power_w: f64,
    /// Discharge positive
    bat_power_w: f64,
    max_charge_w: f64,
    max_soc: f64,
    min_soc: f64,
    min_home_consumption_w: f64,
    smart_battery_control: bool,
}

pub struct KostalInverter {
    client: reqwest::Client,
    base_url: String,
    password: String,
    inhibit_write: bool,
    min_home_consumption_w: f64,
    session: tokio::sync::Mutex<Option<String>>,
    last: Mutex<Option<KostalSnapshot>>,
}

impl KostalInverter {
    pub fn new(cfg: &KostalConfig) -> Result<Self> {
        let base_url = if cfg.host.starts_with("http://") || cfg.host.starts_with("https://") {
            format!("{}/api/v1", cfg.host.trim_end_matches('/'))
        } else {
            format!("http://{}/api/v1", cfg.host)
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.http_timeout_seconds))
            .build()
            .context("building inverter http client")?;
        Ok(Self {
            client,
            base_url,
            password: cfg.password.clone(),
            inhibit_write: cfg.inhibit_write,
            min_home_consumption_w: cfg.min_home_consumption_w,
            session: tokio::sync::Mutex::new(None),
            last: Mutex::new(None),
        })
    }

    /// Module and data ids keep `:` and `,` percent-encoded
    fn url(&self, endpoint: &str) -> String {
        format!(
            "{}/{}",
            self.base_url,
            endpoint.replace(':', "%3A").replace(',', "%2C")
        )
    }

    async fn post_unauthorized<B, T>(&self, endpoint: &str, body: &B) -> Result<T>
    where
        B: serde::Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let resp = self
            .client
            .post(self.url(endpoint))
            .json(body)
            .send()
            .await
            .map_err(|e| InverterError::Communication(e.to_string()))?
            .error_for_status()
            .map_err(|e| InverterError::Communication(format!("{endpoint}: {e}")))?;
        Ok(resp
            .json()
            .await
            .map_err(|e| InverterError::UnexpectedResponse(format!("{endpoint}: {e}")))?)
    }

    async fn login(&self) -> Result<String> {
        let nonce = client_nonce();
        let start: StartResponse = self
            .post_unauthorized(
                "auth/start",
                &StartRequest {
                    username: USERNAME,
                    nonce: nonce.clone(),
                },
            )
            .await?;
        let scram = Scram::new(&self.password, &nonce, &start)?;

        let finish: FinishResponse = self
            .post_unauthorized(
                "auth/finish",
                &FinishRequest {
                    transaction_id: &start.transaction_id,
                    proof: scram.proof(),
                },
            )
            .await?;
        if let Some(signature) = &finish.signature {
            scram.verify_server(signature)?;
        }

        let request = scram.seal_token(&start.transaction_id, &finish.token)?;
        let created: CreateSessionResponse = self
            .post_unauthorized("auth/create_session", &request)
            .await?;
        info!(base_url = %self.base_url, "logged in to inverter");
        Ok(created.session_id)
    }

    async fn session_id(&self) -> Result<String> {
        let mut session = self.session.lock().await;
        if let Some(id) = session.as_ref() {
            return Ok(id.clone());
        }
        let id = self.login().await?;
        *session = Some(id.clone());
        Ok(id)
    }

    async fn send_in_session(&self, build: &(dyn Fn() -> RequestBuilder + Send + Sync)) -> Result<Response> {
        let session = self.session_id().await?;
        Ok(build()
            .header(AUTHORIZATION, format!("Session {session}"))
            .send()
            .await
            .map_err(|e| InverterError::Communication(e.to_string()))?)
    }

    /// Send with the current session, logging in again once if it has expired
    async fn authorized(&self, endpoint: &str, build: &(dyn Fn() -> RequestBuilder + Send + Sync)) -> Result<Response> {
        let mut resp = self.send_in_session(build).await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            debug!(endpoint, "inverter session expired");
            *self.session.lock().await = None;
            resp = self.send_in_session(build).await?;
        }
        Ok(resp
            .error_for_status()
            .map_err(|e| InverterError::Communication(format!("{endpoint}: {e}")))?)
    }

    async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
        let url = self.url(endpoint);
        let resp = self.authorized(endpoint, &|| self.client.get(&url)).await?;
        Ok(resp
            .json()
            .await
            .map_err(|e| InverterError::UnexpectedResponse(format!("{endpoint}: {e}")))?)
    }

    async fn process_data(&self, module: &str, ids: &str) -> Result<Vec<ProcessValue>> {
        let modules: Vec<ProcessDataModule> = self.get(&format!("processdata/{module}/{ids}")).await?;
        modules
            .into_iter()
            .next()
            .map(|m| m.processdata)
            .ok_or_else(|| InverterError::UnexpectedResponse(format!("no process data for {module}")).into())
    }

    async fn fetch(&self) -> Result<(LiveStatus, KostalSnapshot)> {
        let settings = [
            SMART_BATTERY_CONTROL,
            MAX_CHARGE_POWER,
            MAX_SOC,
            MIN_SOC,
            MIN_HOME_CONSUMPTION,
        ]
        .join(",");
        let settings_endpoint = format!("settings/{MODULE}/{settings}");
        let (home, pv1, pv2, ac, battery, settings) = tokio::try_join!(
            self.process_data(MODULE, "Home_P,Grid_P"),
            self.process_data("devices:local:pv1", "P"),
            self.process_data("devices:local:pv2", "P"),
            self.process_data("devices:local:ac", "L1_U,L2_U,L3_U"),
            self.process_data("devices:local:battery", "P,SoC"),
            self.get::<Vec<SettingValue>>(&settings_endpoint),
        )?;

        let snapshot = KostalSnapshot {
            dc_power_w: (value(&pv1, "P")? + value(&pv2, "P")?).max(0.0),
            grid_power_w: value(&home, "Grid_P")?,
            bat_power_w: value(&battery, "P")?,
            max_charge_w: setting(&settings, MAX_CHARGE_POWER)?,
            max_soc: setting(&settings, MAX_SOC)? / 100.0,
            min_soc: setting(&settings, MIN_SOC)? / 100.0,
            min_home_consumption_w: setting(&settings, MIN_HOME_CONSUMPTION)?,
            smart_battery_control: setting(&settings, SMART_BATTERY_CONTROL)? != 0.0,
        };
        let status = LiveStatus {
            timestamp: Utc::now(),
            dc_power_w: snapshot.dc_power_w,
            home_consumption_w: value(&home, "Home_P")?,
            grid_voltage_v: ac.iter().map(|v| v.value).sum::<f64>() / ac.len().max(1) as f64,
            bat_power_w: -snapshot.bat_power_w,
            soc: value(&battery, "SoC")? / 100.0,
        };
        Ok((status, snapshot))
    }

    async fn write_settings(&self, settings: &[(&'static str, String)]) -> Result<()> {
        if settings.is_empty() {
            return Ok(());
        }
        if self.inhibit_write {
            debug!(?settings, "inverter write inhibited");
            return Ok(());
        }
        let body = json!([{
            "moduleid": MODULE,
            "settings": settings
                .iter()
                .map(|(id, value)| json!({ "id": id, "value": value }))
                .collect::<Vec<_>>(),
        }]);
        let url = self.url("settings");
        self.authorized("settings", &|| self.client.put(&url).json(&body))
            .await?;
        debug!(?settings, "inverter write");
        Ok(())
    }

    /// Settings to write so the inverter follows `cmd`
    fn plan(&self, s: &KostalSnapshot, cmd: &BatteryCommand) -> Vec<(&'static str, String)> {
        let mut writes = Vec::new();
        let mut max_charge = None;

        if s.dc_power_w > ACTIVE_DC_POWER_W {
            if cmd.fastcharge {
                if s.smart_battery_control {
                    writes.push((SMART_BATTERY_CONTROL, "0".to_string()));
                }
            } else {
                if !s.smart_battery_control {
                    writes.push((SMART_BATTERY_CONTROL, "1".to_string()));
                }
                let exporting = s.grid_power_w < 0.0;
                let near_limit = s.grid_power_w < -cmd.feed_in_limit_w * 0.9;
                if exporting && !near_limit && s.bat_power_w < 20.0 {
                    // halve the allowance every tick while surplus goes to the grid anyway
                    let halved = s.max_charge_w / 2.0;
                    max_charge = Some(if halved < MIN_THROTTLED_CHARGE_W { 0.0 } else { halved });
                } else if near_limit && s.max_charge_w < cmd.max_charge_w * 0.9 {
                    max_charge = Some(cmd.max_charge_w * 1.05);
                }
            }
        }
        if cmd.max_soc < 1.0 && max_charge.is_none() && s.max_charge_w < cmd.max_charge_w * 0.9 {
            max_charge = Some(cmd.max_charge_w * 1.05);
        }
        if let Some(w) = max_charge {
            writes.push((MAX_CHARGE_POWER, format!("{w:.0}")));
        }

        if percent(cmd.max_soc) != percent(s.max_soc) {
            writes.push((MAX_SOC, percent(cmd.max_soc).to_string()));
        }
        if percent(cmd.min_soc) != percent(s.min_soc) {
            writes.push((MIN_SOC, percent(cmd.min_soc).to_string()));
        }

        let min_home_w = if cmd.inhibit_discharge {
            HOLD_DISCHARGE_MIN_HOME_W
        } else {
            self.min_home_consumption_w
        };
        if (min_home_w - s.min_home_consumption_w).abs() >= 1.0 {
            writes.push((MIN_HOME_CONSUMPTION, format!("{min_home_w:.0}")));
        }
        writes
    }
}

fn percent(fraction: f64) -> i64 {
    (fraction * 100.0).round() as i64
}

fn value(data: &[ProcessValue], id: &str) -> Result<f64> {
    data.iter()
        .find(|v| v.id == id)
        .map(|v| v.value)
        .ok_or_else(|| InverterError::UnexpectedResponse(format!("missing process value {id}")).into())
}

fn setting(settings: &[SettingValue], id: &str) -> Result<f64> {
    let raw = settings
        .iter()
        .find(|s| s.id == id)
        .map(|s| s.value.as_str())
        .ok_or_else(|| InverterError::UnexpectedResponse(format!("missing setting {id}")))?;
    let parsed = raw
        .trim()
        .parse()
        .map_err(|_| InverterError::UnexpectedResponse(format!("{id} = {raw:?}")))?;
    Ok(parsed)
}

#[async_trait]
impl Inverter for KostalInverter {
    async fn read_status(&self) -> Result<LiveStatus> {
        let (status, snapshot) = self.fetch().await?;
        *self.last.lock() = Some(snapshot);
        Ok(status)
    }

    async fn apply_battery_command(&self, command: &BatteryCommand) -> Result<()> {
        for soc in [command.max_soc, command.min_soc] {
            if !(0.0..=1.0).contains(&soc) {
                return Err(InverterError::InvalidSocLimit(soc).into());
            }
        }
        let snapshot = self.last.lock().clone().ok_or(InverterError::NoStatus)?;
        let writes = self.plan(&snapshot, command);
        self.write_settings(&writes).await
    }
}
