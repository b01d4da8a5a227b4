//! Location-based search-rank audits.
//!
//! A scan samples a geographic area on a grid, runs the same keyword search
//! from every point in a Headless Chrome session, records where a target
//! business ranks, and aggregates the competitor listings it saw.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod extractor;
pub mod geocode;
pub mod grid;
pub mod insights;
pub mod json_path;
pub mod memory;
pub mod models;
pub mod orchestrator;
pub mod proxy;
pub mod queue;
pub mod scheduler;
pub mod session;
pub mod stealth;
pub mod store;
pub mod telemetry;
pub mod worker;
