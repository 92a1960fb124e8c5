//! PV surplus controller: charges an electric vehicle from PV surplus and steers the home
//! battery so that it is full by the end of the day without spilling production into the grid.

pub mod config;
pub mod controller;
pub mod domain;
pub mod forecast;
pub mod hardware;
pub mod repo;
pub mod simulation;
pub mod telemetry;
