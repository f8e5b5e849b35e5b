// Data-access and transaction layer shared by every resource of the
// service template

pub mod bootstrap;
pub mod config;
pub mod db;
pub mod errors;
pub mod models;
pub mod service;
pub mod telemetry;
