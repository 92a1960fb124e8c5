pub mod ev_charger;
pub mod forecast;
pub mod inverter;
pub mod types;

pub use ev_charger::*;
pub use forecast::*;
pub use inverter::*;
pub use types::*;
