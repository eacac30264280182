use super::{types::Config, ConfigError};

/// Validate configuration
/// Currently validates:
/// - At least one role (`[coordinator]` or `[worker]`) is configured
/// - Server port is not 0
/// - Coordinator intervals are non-zero
/// - Worker identity is set and capture backoff is at least one second
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.server.port == 0 {
        return Err(ConfigError::ValidationError(
            "server.port cannot be 0".to_string(),
        ));
    }

    if config.coordinator.is_none() && config.worker.is_none() {
        return Err(ConfigError::ValidationError(
            "at least one of [coordinator] or [worker] must be configured".to_string(),
        ));
    }

    if let Some(ref coordinator) = config.coordinator {
        if coordinator.dispatch_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "coordinator.dispatch_interval_secs cannot be 0".to_string(),
            ));
        }
        if coordinator.rpc_deadline_secs == 0 {
            return Err(ConfigError::ValidationError(
                "coordinator.rpc_deadline_secs cannot be 0".to_string(),
            ));
        }
        if coordinator.source_variants.is_empty() {
            return Err(ConfigError::ValidationError(
                "coordinator.source_variants cannot be empty".to_string(),
            ));
        }
    }

    if let Some(ref worker) = config.worker {
        if worker.id.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "worker.id cannot be empty".to_string(),
            ));
        }
        if worker.capture_backoff_min_secs < 1 {
            return Err(ConfigError::ValidationError(
                "worker.capture_backoff_min_secs must be at least 1".to_string(),
            ));
        }
        if worker.silence.merge_gap_secs <= 0.0 {
            return Err(ConfigError::ValidationError(
                "worker.silence.merge_gap_secs must be positive".to_string(),
            ));
        }
        if worker.heartbeat_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "worker.heartbeat_interval_secs cannot be 0".to_string(),
            ));
        }
    }

    Ok(())
}
