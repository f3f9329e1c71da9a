//! # Data Models
//!
//! This module contains the entity models and shared API response types.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::config::AppConfig;

pub mod message;

pub use message::Entity as Message;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
    /// Messages per committed batch
    pub batch_size: usize,
    /// Seconds before an incomplete batch is flushed
    pub batch_timeout_seconds: f64,
}

impl ServiceInfo {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            service: "ingestor".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            batch_size: config.batch_size,
            batch_timeout_seconds: config.batch_timeout,
        }
    }
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}
