pub mod config;
pub mod context;
pub mod storage;
pub mod telemetry;
