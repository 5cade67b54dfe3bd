pub mod brief;
pub mod config;
pub mod context;
pub mod db;
pub mod delivery;
pub mod errors;
pub mod feedback;
pub mod models;
pub mod pipeline;
pub mod research;
pub mod retry;
pub mod scheduler;
pub mod server;
pub mod telemetry;
pub mod triage;
