//! Runtime configuration for the upload pipeline
//!
//! Everything here is injected into the job rather than read from process
//! globals, so tests and multi-tenant deployments can run jobs with
//! different settings side by side.

use granary_core::retry::RetryPolicy;
use granary_core::warehouse::{DestinationType, DISCARDS_TABLE};
use std::collections::HashMap;
use std::time::Duration;

/// Configuration for one upload job
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Staging files per message batch published to the worker bus
    pub publish_batch_size: usize,

    /// Concurrent table loads per destination kind
    pub max_parallel_loads: HashMap<DestinationType, usize>,

    /// Concurrent table loads for destination kinds not in the map
    pub fallback_parallel_loads: usize,

    /// Retry/abort policy applied to stage failures
    pub retry: RetryPolicy,

    /// Emit the long-running-upload metric when a run exceeds this
    pub long_running_upload_threshold: Duration,

    /// Global switch for identity resolution
    pub id_resolution_enabled: bool,

    /// Destinations the identity tables are maintained for
    pub identity_enabled_destinations: Vec<DestinationType>,

    /// Tables marked exported even when the batch produced no load files
    /// for them
    pub always_mark_exported: Vec<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        let max_parallel_loads = HashMap::from([
            (DestinationType::BigQuery, 20),
            (DestinationType::Redshift, 3),
            (DestinationType::Postgres, 3),
            (DestinationType::Snowflake, 3),
            (DestinationType::Clickhouse, 3),
        ]);
        Self {
            publish_batch_size: 100,
            max_parallel_loads,
            fallback_parallel_loads: 1,
            retry: RetryPolicy::default(),
            long_running_upload_threshold: Duration::from_secs(120 * 60),
            id_resolution_enabled: false,
            identity_enabled_destinations: vec![
                DestinationType::BigQuery,
                DestinationType::Snowflake,
            ],
            always_mark_exported: vec![DISCARDS_TABLE.to_string()],
        }
    }
}

impl UploadConfig {
    /// Width of the table-load semaphore for this destination kind.
    pub fn parallel_loads_for(&self, destination_type: DestinationType) -> usize {
        self.max_parallel_loads
            .get(&destination_type)
            .copied()
            .unwrap_or(self.fallback_parallel_loads)
            .max(1)
    }

    /// Whether identity tables are maintained for this destination kind.
    pub fn identity_enabled_for(&self, destination_type: DestinationType) -> bool {
        self.identity_enabled_destinations
            .contains(&destination_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_parallel_loads() {
        let config = UploadConfig::default();
        assert_eq!(config.parallel_loads_for(DestinationType::BigQuery), 20);
        assert_eq!(config.parallel_loads_for(DestinationType::Postgres), 3);
    }

    #[test]
    fn test_fallback_parallel_loads() {
        let mut config = UploadConfig::default();
        config.max_parallel_loads.clear();
        assert_eq!(config.parallel_loads_for(DestinationType::Snowflake), 1);
    }

    #[test]
    fn test_identity_destinations() {
        let config = UploadConfig::default();
        assert!(config.identity_enabled_for(DestinationType::Snowflake));
        assert!(!config.identity_enabled_for(DestinationType::Postgres));
    }
}
