//! # Persisted Controller State
//!
//! The controller carries a small record from one tick to the next: the power it commanded last,
//! the wallbox "charge completed" flag, the coulomb-counted SOC and the day-scoped clear-sky
//! windows. The record is loaded once at the start of a tick and written once at the end.
//!
//! A record older than [`STALE_AFTER_MINUTES`] describes a previous session and is replaced by
//! defaults. An unreadable record is treated the same way; neither case is an error for the tick.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::OverflowWindow;

pub const STALE_AFTER_MINUTES: i64 = 10;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode state: {0}")]
    Encode(#[source] bincode::Error),
    #[error("failed to decode state: {0}")]
    Decode(#[source] bincode::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub saved: DateTime<Utc>,
    /// Control power commanded on the previous tick (W)
    pub ctrl_power_w: f64,
    pub overflow: OverflowWindow,
    /// Latest time of day at which clear-sky production still sustains each current level (A)
    pub endcharge: BTreeMap<u32, NaiveTime>,
    pub charge_completed: bool,
    /// Coulomb-counted SOC; `None` until seeded from a measurement
    pub calc_soc: Option<f64>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            saved: DateTime::<Utc>::UNIX_EPOCH,
            ctrl_power_w: 0.0,
            overflow: OverflowWindow::none(),
            endcharge: BTreeMap::new(),
            charge_completed: false,
            calc_soc: None,
        }
    }
}

impl PersistedState {
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now - self.saved > Duration::minutes(STALE_AFTER_MINUTES)
    }

    /// Day-scoped fields must be recomputed when the tick falls on a later UTC date
    pub fn needs_daily_refresh(&self, now: DateTime<Utc>) -> bool {
        now.date_naive() > self.saved.date_naive()
    }

    /// Minutes elapsed since the state was saved
    pub fn minutes_since_saved(&self, now: DateTime<Utc>) -> f64 {
        (now - self.saved).num_seconds() as f64 / 60.0
    }
}

/// Persistence port for [`PersistedState`]
pub trait StateStore: Send + Sync {
    /// `Ok(None)` when nothing has been stored yet
    fn load(&self) -> Result<Option<PersistedState>, StateError>;
    fn save(&self, state: &PersistedState) -> Result<(), StateError>;

    /// State to use for the tick at `now`: the stored record, or defaults when it is missing,
    /// unreadable or stale
    fn load_for_tick(&self, now: DateTime<Utc>) -> PersistedState {
        match self.load() {
            Ok(Some(state)) if state.is_stale(now) => {
                debug!(saved = %state.saved, "persisted state is stale, starting a new session");
                PersistedState::default()
            }
            Ok(Some(state)) => state,
            Ok(None) => PersistedState::default(),
            Err(e) => {
                warn!(error = %e, "persisted state unreadable, starting from defaults");
                PersistedState::default()
            }
        }
    }
}

/// Bincode-encoded state file, replaced atomically on save
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<Option<PersistedState>, StateError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        bincode::deserialize(&bytes)
            .map(Some)
            .map_err(StateError::Decode)
    }

    fn save(&self, state: &PersistedState) -> Result<(), StateError> {
        let bytes = bincode::serialize(state).map_err(StateError::Encode)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// In-process state store for simulation and tests
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<Option<PersistedState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: PersistedState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
        }
    }

    pub fn snapshot(&self) -> Option<PersistedState> {
        self.state.lock().clone()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<Option<PersistedState>, StateError> {
        Ok(self.state.lock().clone())
    }

    fn save(&self, state: &PersistedState) -> Result<(), StateError> {
        *self.state.lock() = Some(state.clone());
        Ok(())
    }
}
