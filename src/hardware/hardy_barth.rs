//! # Hardy Barth wallbox
//!
//! Talks to the wallbox REST API at `http://<host>/api/v1/`. Charging is driven through the
//! "manual" PV mode: the set point goes to `pvmode/manual/ampere` and the charge control is
//! started or stopped around it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::HardyBarthConfig;
use crate::domain::{ChargerError, EvCharger, WallboxStatus};

const MODE_MANUAL: u32 = 3;
const STATE_ENABLED_WAITING: u32 = 4;
const STATE_CHARGING: u32 = 5;
const STATE_DISABLED: u32 = 17;

#[derive(Debug, Clone, Deserialize)]
struct ChargeControlEnvelope {
    chargecontrol: ChargeControl,
}

/// Subset of `chargecontrols/{id}` the controller relies on
#[derive(Debug, Clone, PartialEq, Deserialize)]
struct ChargeControl {
    connected: bool,
    stateid: u32,
    modeid: u32,
    manualmodeamp: f64,
    currentpwmamp: f64,
    evminamp: f64,
    supplylinemaxamp: f64,
}

impl ChargeControl {
    fn to_status(&self, previous_charge_completed: bool) -> WallboxStatus {
        let charge_completed = self.connected
            && (self.stateid == STATE_ENABLED_WAITING
                || (self.stateid == STATE_DISABLED && previous_charge_completed));
        WallboxStatus {
            connected: self.connected,
            charge_completed,
            // currentpwmamp keeps the last set point after the vehicle is done
            ctrl_current_a: if charge_completed { 0.0 } else { self.currentpwmamp },
            min_current_a: self.evminamp,
            max_current_a: self.supplylinemaxamp,
        }
    }
}

pub struct HardyBarthWallbox {
    client: reqwest::Client,
    base_url: String,
    id: u32,
    inhibit_write: bool,
    last: Mutex<Option<ChargeControl>>,
}

impl HardyBarthWallbox {
    pub fn new(cfg: &HardyBarthConfig) -> Result<Self> {
        let base_url = if cfg.host.starts_with("http://") || cfg.host.starts_with("https://") {
            format!("{}/api/v1", cfg.host.trim_end_matches('/'))
        } else {
            format!("http://{}/api/v1", cfg.host)
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.http_timeout_seconds))
            .build()
            .context("building wallbox http client")?;
        Ok(Self {
            client,
            base_url,
            id: cfg.id,
            inhibit_write: cfg.inhibit_write,
            last: Mutex::new(None),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint)
    }

    async fn fetch(&self) -> Result<ChargeControl> {
        let endpoint = format!("chargecontrols/{}", self.id);
        let resp = self
            .client
            .get(self.url(&endpoint))
            .send()
            .await
            .map_err(|e| ChargerError::Communication(e.to_string()))?
            .error_for_status()
            .map_err(|e| ChargerError::Communication(e.to_string()))?;
        let envelope: ChargeControlEnvelope = resp
            .json()
            .await
            .map_err(|e| ChargerError::UnexpectedResponse(e.to_string()))?;
        Ok(envelope.chargecontrol)
    }

    async fn post(&self, endpoint: &str, form: Option<(&str, String)>) -> Result<()> {
        if self.inhibit_write {
            debug!(endpoint, "wallbox write inhibited");
            return Ok(());
        }
        let mut req = self.client.post(self.url(endpoint));
        if let Some((key, value)) = &form {
            req = req.form(&[(*key, value.as_str())]);
        }
        req.send()
            .await
            .map_err(|e| ChargerError::Communication(e.to_string()))?
            .error_for_status()
            .map_err(|e| ChargerError::Communication(format!("{endpoint}: {e}")))?;
        debug!(endpoint, value = ?form.map(|(_, v)| v), "wallbox write");
        Ok(())
    }

    /// Active power from the built-in meter; informational only, so failures are ignored
    async fn meter_power_w(&self) -> Option<f64> {
        let resp = self.client.get(self.url("all")).send().await.ok()?;
        let body: serde_json::Value = resp.error_for_status().ok()?.json().await.ok()?;
        body["meters"][1]["data"]["1-0:1.4.0"].as_f64()
    }

    /// Last status read, or a fresh one when nothing was read yet
    async fn current_control(&self) -> Result<ChargeControl> {
        let cached = self.last.lock().clone();
        match cached {
            Some(cc) => Ok(cc),
            None => {
                let cc = self.fetch().await?;
                *self.last.lock() = Some(cc.clone());
                Ok(cc)
            }
        }
    }
}

#[async_trait]
impl EvCharger for HardyBarthWallbox {
    async fn read_status(&self, previous_charge_completed: bool) -> Result<WallboxStatus> {
        let cc = self.fetch().await?;
        let status = cc.to_status(previous_charge_completed);
        *self.last.lock() = Some(cc);
        if let Some(active_power_w) = self.meter_power_w().await {
            debug!(active_power_w, "wallbox meter");
        }
        Ok(status)
    }

    async fn set_current(&self, amps: f64) -> Result<()> {
        if !amps.is_finite() || amps < 0.0 {
            return Err(ChargerError::InvalidCurrent(amps).into());
        }
        let cc = self.current_control().await?;
        let start_stop = |action: &str| format!("chargecontrols/{}/{action}", self.id);

        if amps > 0.0 {
            if !cc.connected {
                warn!(amps, "wallbox not connected, cannot charge");
                return Ok(());
            }
            if cc.modeid != MODE_MANUAL {
                self.post("pvmode", Some(("pvmode", "manual".to_string())))
                    .await?;
            }
            if cc.manualmodeamp != amps {
                self.post(
                    "pvmode/manual/ampere",
                    Some(("manualmodeamp", amps.to_string())),
                )
                .await?;
            }
            if cc.stateid != STATE_CHARGING && cc.stateid != STATE_ENABLED_WAITING {
                self.post(&start_stop("start"), None).await?;
            }
        } else {
            if cc.manualmodeamp > cc.evminamp {
                self.post(
                    "pvmode/manual/ampere",
                    Some(("manualmodeamp", cc.evminamp.to_string())),
                )
                .await?;
            }
            if cc.stateid != STATE_DISABLED && cc.stateid != STATE_ENABLED_WAITING {
                self.post(&start_stop("stop"), None).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn control(connected: bool, stateid: u32, modeid: u32, manualmodeamp: f64) -> serde_json::Value {
        json!({
            "chargecontrol": {
                "id": 1,
                "name": "CC1",
                "connected": connected,
                "stateid": stateid,
                "state": "whatever",
                "modeid": modeid,
                "mode": "eco",
                "manualmodeamp": manualmodeamp,
                "currentpwmamp": 10.0,
                "evminamp": 6.0,
                "supplylinemaxamp": 16.0
            }
        })
    }

    async fn wallbox(server: &MockServer, inhibit_write: bool) -> HardyBarthWallbox {
        HardyBarthWallbox::new(&HardyBarthConfig {
            host: server.uri(),
            id: 1,
            inhibit_write,
            http_timeout_seconds: 2,
        })
        .unwrap()
    }

    async fn serve_control(server: &MockServer, body: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/api/v1/chargecontrols/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_maps_charge_control_fields() {
        let server = MockServer::start().await;
        serve_control(&server, control(true, STATE_CHARGING, MODE_MANUAL, 10.0)).await;

        let wb = wallbox(&server, false).await;
        let st = wb.read_status(false).await.unwrap();
        assert!(st.connected);
        assert!(!st.charge_completed);
        assert_eq!(st.ctrl_current_a, 10.0);
        assert_eq!(st.min_current_a, 6.0);
        assert_eq!(st.max_current_a, 16.0);
    }

    #[tokio::test]
    async fn test_enabled_waiting_means_completed() {
        let server = MockServer::start().await;
        serve_control(&server, control(true, STATE_ENABLED_WAITING, MODE_MANUAL, 10.0)).await;

        let st = wallbox(&server, false).await.read_status(false).await.unwrap();
        assert!(st.charge_completed);
        assert_eq!(st.ctrl_current_a, 0.0);
    }

    #[tokio::test]
    async fn test_disabled_is_completed_only_if_it_was_before() {
        let server = MockServer::start().await;
        serve_control(&server, control(true, STATE_DISABLED, MODE_MANUAL, 6.0)).await;
        let wb = wallbox(&server, false).await;

        assert!(!wb.read_status(false).await.unwrap().charge_completed);
        assert!(wb.read_status(true).await.unwrap().charge_completed);
    }

    #[tokio::test]
    async fn test_start_switches_to_manual_and_sets_current() {
        let server = MockServer::start().await;
        serve_control(&server, control(true, STATE_DISABLED, 1, 6.0)).await;
        Mock::given(method("POST"))
            .and(path("/api/v1/pvmode"))
            .and(body_string_contains("pvmode=manual"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/pvmode/manual/ampere"))
            .and(body_string_contains("manualmodeamp=8"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/chargecontrols/1/start"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let wb = wallbox(&server, false).await;
        wb.read_status(false).await.unwrap();
        wb.set_current(8.0).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_lowers_set_point_to_minimum() {
        let server = MockServer::start().await;
        serve_control(&server, control(true, STATE_CHARGING, MODE_MANUAL, 12.0)).await;
        Mock::given(method("POST"))
            .and(path("/api/v1/pvmode/manual/ampere"))
            .and(body_string_contains("manualmodeamp=6"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/chargecontrols/1/stop"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let wb = wallbox(&server, false).await;
        wb.read_status(false).await.unwrap();
        wb.set_current(0.0).await.unwrap();
    }

    #[tokio::test]
    async fn test_inhibit_write_never_posts() {
        let server = MockServer::start().await;
        serve_control(&server, control(true, STATE_DISABLED, 1, 6.0)).await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let wb = wallbox(&server, true).await;
        wb.read_status(false).await.unwrap();
        wb.set_current(10.0).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_post_is_reported() {
        let server = MockServer::start().await;
        serve_control(&server, control(true, STATE_CHARGING, MODE_MANUAL, 6.0)).await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let wb = wallbox(&server, false).await;
        wb.read_status(false).await.unwrap();
        assert!(wb.set_current(10.0).await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_wallbox_is_an_error() {
        let wb = HardyBarthWallbox::new(&HardyBarthConfig {
            host: "127.0.0.1:9".into(),
            id: 1,
            inhibit_write: false,
            http_timeout_seconds: 1,
        })
        .unwrap();
        assert!(wb.read_status(false).await.is_err());
    }
}
