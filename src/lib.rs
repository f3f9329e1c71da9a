//! # Message Ingestor Library
//!
//! Core functionality for the elastic message ingestion pipeline: the HTTP
//! ingestion surface, the shared buffer protocol, the batch coordinator, and
//! the telemetry broadcaster.

pub mod broadcaster;
pub mod buffer;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod records;
pub mod repositories;
pub mod server;
pub mod telemetry;
pub mod worker;
pub use migration;
