pub mod api;
pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod optimizer;
pub mod telemetry;
