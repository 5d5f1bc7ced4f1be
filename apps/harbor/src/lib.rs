pub mod config;
pub mod connection;
pub mod entities;
pub mod error;
pub mod load;
pub mod metrics;
pub mod relay;
pub mod runtime;
pub mod telemetry;
pub mod workspace;
