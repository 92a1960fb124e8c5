//! # Solar Production Model
//!
//! Clear-sky radiation model for a PV array at a fixed location, plus a seeded cloud process used
//! by the day simulation. All times are UTC.

use chrono::{DateTime, Datelike, Timelike, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::SiteConfig;
use crate::controller::ClearSkyProduction;

const SOLAR_CONSTANT_W_M2: f64 = 1367.0;
const ATMOSPHERIC_TRANSMITTANCE: f64 = 0.7;

/// Sky condition of the cloud process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloudCover {
    Clear,
    PartlyCloudy,
    MostlyCloudy,
    Overcast,
}

impl CloudCover {
    /// Share of clear-sky irradiance that reaches the array
    pub fn transmission_factor(&self) -> f64 {
        match self {
            CloudCover::Clear => 1.0,
            CloudCover::PartlyCloudy => 0.7,
            CloudCover::MostlyCloudy => 0.4,
            CloudCover::Overcast => 0.15,
        }
    }

    /// Draw a sky: 41 % clear, 30 % partly, 15 % mostly cloudy, 14 % overcast
    pub fn random<R: Rng>(rng: &mut R) -> Self {
        match rng.gen_range(0..100u8) {
            0..=40 => CloudCover::Clear,
            41..=70 => CloudCover::PartlyCloudy,
            71..=85 => CloudCover::MostlyCloudy,
            _ => CloudCover::Overcast,
        }
    }
}

/// Sun position and clear-sky global irradiance on a horizontal plane
#[derive(Debug, Clone, Copy)]
pub struct ClearSkyModel {
    latitude_deg: f64,
    longitude_deg: f64,
}

impl ClearSkyModel {
    pub fn new(latitude_deg: f64, longitude_deg: f64) -> Self {
        Self {
            latitude_deg,
            longitude_deg,
        }
    }

    /// Cooper's approximation, in degrees
    fn declination_deg(at: DateTime<Utc>) -> f64 {
        let day = f64::from(at.ordinal());
        23.45 * (360.0 / 365.0 * (day + 284.0)).to_radians().sin()
    }

    /// Degrees from local solar noon, positive in the afternoon
    fn hour_angle_deg(&self, at: DateTime<Utc>) -> f64 {
        let utc_hours = f64::from(at.num_seconds_from_midnight()) / 3600.0;
        let solar_hours = utc_hours + self.longitude_deg / 15.0;
        15.0 * (solar_hours - 12.0)
    }

    /// `(elevation, azimuth)` in degrees; azimuth counts clockwise from north
    pub fn solar_position(&self, at: DateTime<Utc>) -> (f64, f64) {
        let decl = Self::declination_deg(at).to_radians();
        let lat = self.latitude_deg.to_radians();
        let hour_angle = self.hour_angle_deg(at);
        let h = hour_angle.to_radians();

        let elevation = (lat.sin() * decl.sin() + lat.cos() * decl.cos() * h.cos()).asin();
        let cos_azimuth =
            (decl.sin() - lat.sin() * elevation.sin()) / (lat.cos() * elevation.cos());
        let from_north = cos_azimuth.clamp(-1.0, 1.0).acos().to_degrees();

        let azimuth = if hour_angle.rem_euclid(360.0) < 180.0 {
            360.0 - from_north
        } else {
            from_north
        };
        (elevation.to_degrees(), azimuth)
    }

    /// Global horizontal irradiance under a clear sky (W/m²)
    pub fn clear_sky_irradiance(&self, at: DateTime<Utc>) -> f64 {
        let (elevation_deg, _) = self.solar_position(at);
        if elevation_deg <= 0.0 {
            return 0.0;
        }
        let sin_elevation = elevation_deg.to_radians().sin();

        // relative air mass, linearised close to the horizon
        let air_mass = if elevation_deg > 5.0 {
            1.0 / sin_elevation
        } else {
            12.0 - elevation_deg / 5.0
        };
        let transmittance = ATMOSPHERIC_TRANSMITTANCE.powf(air_mass.powf(0.678));
        SOLAR_CONSTANT_W_M2 * transmittance * sin_elevation
    }
}

/// PV generator at a site: clear-sky irradiance scaled to installed peak power
#[derive(Debug, Clone, Copy)]
pub struct PvArray {
    model: ClearSkyModel,
    peak_w: f64,
    system_efficiency: f64,
}

impl PvArray {
    pub fn new(model: ClearSkyModel, peak_w: f64, system_efficiency: f64) -> Self {
        Self {
            model,
            peak_w,
            system_efficiency,
        }
    }

    pub fn from_site(site: &SiteConfig) -> Self {
        Self::new(
            ClearSkyModel::new(site.latitude, site.longitude),
            site.pv_peak_w,
            site.system_efficiency,
        )
    }

    pub fn model(&self) -> &ClearSkyModel {
        &self.model
    }
}

impl ClearSkyProduction for PvArray {
    fn clear_sky_dc_power_w(&self, at: DateTime<Utc>) -> f64 {
        // Peak power is rated at 1000 W/m²
        (self.model.clear_sky_irradiance(at) / 1000.0 * self.peak_w * self.system_efficiency)
            .max(0.0)
    }
}

/// Seeded cloud process: a cover level persists for 30-180 minutes, then a new one is drawn
#[derive(Debug)]
pub struct CloudProcess {
    rng: StdRng,
    cover: CloudCover,
    remaining_minutes: i64,
    enabled: bool,
}

impl CloudProcess {
    pub fn new(seed: u64, enabled: bool) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            cover: CloudCover::Clear,
            remaining_minutes: 0,
            enabled,
        }
    }

    pub fn cover(&self) -> CloudCover {
        self.cover
    }

    /// Advance the process and return the transmission factor for the next interval
    pub fn advance(&mut self, minutes: i64) -> f64 {
        if !self.enabled {
            return 1.0;
        }
        self.remaining_minutes -= minutes;
        if self.remaining_minutes <= 0 {
            self.cover = CloudCover::random(&mut self.rng);
            self.remaining_minutes = self.rng.gen_range(30..=180);
        }
        self.cover.transmission_factor()
    }
}
