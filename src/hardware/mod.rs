//! Device drivers behind the [`Inverter`](crate::domain::Inverter) and
//! [`EvCharger`](crate::domain::EvCharger) ports.

pub mod factory;
pub mod hardy_barth;
pub mod kostal;

pub use factory::DeviceFactory;
pub use hardy_barth::HardyBarthWallbox;
pub use kostal::KostalInverter;
