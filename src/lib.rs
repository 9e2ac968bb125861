pub mod app;
pub mod config;
pub mod error;
pub mod lock;
pub mod log;
pub mod manifest;
pub mod observability;
pub mod telemetry;
pub mod transport;
pub mod updater;
pub mod version;
