pub mod state;

pub use state::{FileStateStore, MemoryStateStore, PersistedState, StateError, StateStore};
