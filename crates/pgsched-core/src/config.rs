//! Configuration types for pgsched

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{PgschedError, PgschedResult, PlacementStrategy, ResourceSet};

/// Scheduler tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How long a reservation may stay unanswered before it counts as denied
    pub reservation_timeout_ms: u64,
    /// Commit tries per bundle before the failure is reported
    pub commit_max_attempts: u32,
    /// Pause between commit tries
    pub commit_retry_backoff_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reservation_timeout_ms: 10_000,
            commit_max_attempts: 3,
            commit_retry_backoff_ms: 100,
        }
    }
}

impl SchedulerConfig {
    pub fn reservation_timeout(&self) -> Duration {
        Duration::from_millis(self.reservation_timeout_ms)
    }

    pub fn commit_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.commit_retry_backoff_ms)
    }

    /// Reject values the scheduler cannot run with
    pub fn validate(&self) -> PgschedResult<()> {
        if self.reservation_timeout_ms == 0 {
            return Err(PgschedError::Config(
                "reservation_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.commit_max_attempts == 0 {
            return Err(PgschedError::Config(
                "commit_max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or text)
    pub format: String,
    /// Log file path (if any)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            file: None,
        }
    }
}

/// A simulated node in a cluster file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    pub id: String,
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    pub resources: ResourceSet,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

/// A placement group to schedule in a cluster file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSettings {
    pub name: String,
    pub strategy: PlacementStrategy,
    pub bundles: Vec<ResourceSet>,
    /// How many independent copies of the group to schedule
    #[serde(default = "default_rounds")]
    pub rounds: u32,
}

fn default_rounds() -> u32 {
    1
}

/// Simulation file format (TOML)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub nodes: Vec<NodeSettings>,
    #[serde(default)]
    pub groups: Vec<GroupSettings>,
}

impl SimulationConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> PgschedResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PgschedError::Config(format!("Failed to read config file: {}", e))
        })?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| PgschedError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> PgschedResult<()> {
        self.scheduler.validate()?;

        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(PgschedError::Config(format!("duplicate node id: {}", node.id)));
            }
        }

        if let Some(group) = self.groups.iter().find(|g| g.bundles.is_empty()) {
            return Err(PgschedError::Config(format!(
                "group '{}' has no bundles",
                group.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CLUSTER: &str = r#"
[scheduler]
reservation_timeout_ms = 500

[[nodes]]
id = "node-0"
port = 7000
resources = { CPU = 10.0 }

[[nodes]]
id = "node-1"
host = "10.0.0.2"
port = 7001
resources = { CPU = 10.0, GPU = 2.0 }

[[groups]]
name = "trainer"
strategy = "STRICT_PACK"
bundles = [{ CPU = 1.0 }, { CPU = 1.0 }]
rounds = 4
"#;

    #[test]
    fn test_default_scheduler_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.reservation_timeout(), Duration::from_secs(10));
        assert_eq!(config.commit_max_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_simulation_config_parse() {
        let config: SimulationConfig = toml::from_str(CLUSTER).unwrap();
        assert_eq!(config.scheduler.reservation_timeout_ms, 500);
        assert_eq!(config.scheduler.commit_max_attempts, 3);
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.nodes[0].host, "127.0.0.1");
        assert_eq!(config.nodes[1].resources.get("GPU"), 2.0);
        assert_eq!(config.groups[0].strategy, PlacementStrategy::StrictPack);
        assert_eq!(config.groups[0].rounds, 4);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CLUSTER.as_bytes()).unwrap();
        let config = SimulationConfig::from_file(file.path()).unwrap();
        assert_eq!(config.groups[0].name, "trainer");
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let mut config: SimulationConfig = toml::from_str(CLUSTER).unwrap();
        config.nodes[1].id = "node-0".to_string();
        assert!(matches!(config.validate(), Err(PgschedError::Config(_))));
    }

    #[test]
    fn test_zero_commit_attempts_rejected() {
        let config = SchedulerConfig {
            commit_max_attempts: 0,
            ..SchedulerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
