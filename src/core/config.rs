//! Consensus configuration parameters

use std::time::Duration;

use crate::error::ConsensusError;
use super::types::NodeId;

/// Configuration for a single consensus node
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Identifier of the node this config belongs to
    pub node_id: NodeId,
    /// Interval between heartbeats sent by leader (default: 100ms)
    pub heartbeat_interval: Duration,
    /// Minimum election timeout (default: 300ms)
    pub election_timeout_min: Duration,
    /// Maximum election timeout (default: 500ms)
    pub election_timeout_max: Duration,
    /// Upper bound on a single outbound RPC (default: 100ms)
    pub rpc_timeout: Duration,
    /// Number of applied log entries before triggering automatic snapshot (default: 1000)
    /// Set to 0 to disable automatic snapshots
    pub snapshot_threshold: u64,
    /// Maximum entries carried by one AppendEntries request (default: 64)
    pub max_entries_per_append: usize,
    /// Snapshots kept in the snapshot store after pruning (default: 2)
    pub snapshots_retained: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            heartbeat_interval: Duration::from_millis(100),
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(500),
            rpc_timeout: Duration::from_millis(100),
            snapshot_threshold: 1000,
            max_entries_per_append: 64,
            snapshots_retained: 2,
        }
    }
}

impl ConsensusConfig {
    /// Default config for the given node
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Self::default()
        }
    }

    /// Create a new config with custom heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Create a new config with custom election timeout range
    pub fn with_election_timeout(mut self, min: Duration, max: Duration) -> Self {
        self.election_timeout_min = min;
        self.election_timeout_max = max;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Create a new config with custom snapshot threshold
    /// Set to 0 to disable automatic snapshots
    pub fn with_snapshot_threshold(mut self, threshold: u64) -> Self {
        self.snapshot_threshold = threshold;
        self
    }

    pub fn with_max_entries_per_append(mut self, max: usize) -> Self {
        self.max_entries_per_append = max;
        self
    }

    pub fn with_snapshots_retained(mut self, retained: usize) -> Self {
        self.snapshots_retained = retained;
        self
    }

    /// Check the timing and sizing invariants the protocol depends on
    pub fn validate(&self) -> Result<(), ConsensusError> {
        if self.election_timeout_min.is_zero() {
            return Err(ConsensusError::InvalidConfig(
                "election_timeout_min must be positive".to_string(),
            ));
        }
        if self.election_timeout_min > self.election_timeout_max {
            return Err(ConsensusError::InvalidConfig(format!(
                "election_timeout_min {:?} exceeds election_timeout_max {:?}",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval >= self.election_timeout_min {
            return Err(ConsensusError::InvalidConfig(format!(
                "heartbeat_interval {:?} must be positive and below election_timeout_min {:?}",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        if self.rpc_timeout.is_zero() {
            return Err(ConsensusError::InvalidConfig("rpc_timeout must be positive".to_string()));
        }
        if self.max_entries_per_append == 0 {
            return Err(ConsensusError::InvalidConfig(
                "max_entries_per_append must be at least 1".to_string(),
            ));
        }
        if self.snapshots_retained == 0 {
            return Err(ConsensusError::InvalidConfig(
                "snapshots_retained must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Generate a random election timeout within the configured range
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let min_ms = self.election_timeout_min.as_millis() as u64;
        let max_ms = self.election_timeout_max.as_millis() as u64;
        if min_ms >= max_ms {
            return self.election_timeout_min;
        }
        let timeout_ms = rand::rng().random_range(min_ms..=max_ms);
        Duration::from_millis(timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ConsensusConfig::default().validate().is_ok());
    }

    #[test]
    fn test_random_timeout_within_range() {
        let config = ConsensusConfig::new(7)
            .with_election_timeout(Duration::from_millis(150), Duration::from_millis(300));
        for _ in 0..200 {
            let timeout = config.random_election_timeout();
            assert!(timeout >= Duration::from_millis(150));
            assert!(timeout <= Duration::from_millis(300));
        }
    }

    #[test]
    fn test_fixed_timeout_range() {
        let config = ConsensusConfig::default()
            .with_election_timeout(Duration::from_secs(100), Duration::from_secs(100));
        assert_eq!(config.random_election_timeout(), Duration::from_secs(100));
    }

    #[test]
    fn test_heartbeat_must_be_shorter_than_election_timeout() {
        let config = ConsensusConfig::default()
            .with_heartbeat_interval(Duration::from_millis(400))
            .with_election_timeout(Duration::from_millis(300), Duration::from_millis(500));
        assert!(matches!(config.validate(), Err(ConsensusError::InvalidConfig(_))));
    }

    #[test]
    fn test_inverted_timeout_range_rejected() {
        let config = ConsensusConfig::default()
            .with_election_timeout(Duration::from_millis(500), Duration::from_millis(300));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let config = ConsensusConfig::default().with_max_entries_per_append(0);
        assert!(config.validate().is_err());
    }
}
