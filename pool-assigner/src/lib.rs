pub mod config;
pub mod controller;
pub mod error;
pub mod handlers;
pub mod health_check;
pub mod lease;
pub mod metrics;
pub mod registry;
pub mod status;
pub mod types;
