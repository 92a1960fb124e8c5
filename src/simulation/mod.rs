//! # Simulation
//!
//! - **Solar**: clear-sky PV model used both by the controller (clear-sky windows) and by the
//!   day simulation, plus a seeded cloud process
//! - **House** (feature `sim`): one-day replay of a PV home with battery and car, driving the
//!   decision engine minute by minute
//!
//! ```rust,no_run
//! use pv_surplus_controller::config::Config;
//! use pv_surplus_controller::simulation::{HomeSimulator, SimulationConfig};
//!
//! let config = Config::load()?;
//! let report = HomeSimulator::from_config(&config, SimulationConfig::default()).run()?;
//! println!("EV energy today: {:.0} Wh", report.summary.ev_wh);
//! # Ok::<(), anyhow::Error>(())
//! ```

#[cfg(feature = "sim")]
pub mod house;
pub mod solar;

#[cfg(feature = "sim")]
pub use house::{DayReport, DaySummary, HomeSimulator, MinuteRecord, SimulationConfig};
pub use solar::{ClearSkyModel, CloudCover, CloudProcess, PvArray};
