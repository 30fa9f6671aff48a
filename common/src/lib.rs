// Common library for the backup orchestrator: scheduling, execution gating,
// retention and bandwidth policies, drivers and persistence

pub mod bandwidth;
pub mod config;
pub mod db;
pub mod drivers;
pub mod errors;
pub mod executor;
pub mod models;
pub mod notify;
pub mod policy;
pub mod retention;
pub mod schedule;
pub mod scheduler;
pub mod stagger;
pub mod store;
pub mod telemetry;
