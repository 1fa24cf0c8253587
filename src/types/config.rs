//! Configuration structures.
//!
//! Configuration is loaded from defaults, a JSON document, and environment
//! variables (in that order of precedence, lowest first).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::errors::{Error, Result};

/// Global coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Worker pool sizing and recycling.
    #[serde(default)]
    pub pool: PoolConfig,

    /// How workers are launched and configured.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Pipeline engine tuning.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Target number of live workers.
    pub max_nodes: usize,

    /// Maximum lifetime of a worker before it is recycled. The same value is
    /// the grace period between the shutdown request and the forced kill.
    #[serde(with = "humantime_serde")]
    pub node_ttl: Duration,

    /// Virtual points per worker on the placement ring.
    pub virtual_nodes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_nodes: 5,
            node_ttl: Duration::from_secs(300),
            virtual_nodes: 160,
        }
    }
}

/// Worker launch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker executable used by `ProcessSpawner`.
    pub program: PathBuf,

    /// Extra arguments passed before `--ttl`.
    #[serde(default)]
    pub args: Vec<String>,

    /// Scoped module path; forwarded to every node via `SetConfig`.
    #[serde(default)]
    pub module_path: Option<String>,

    /// Maximum frame payload size in bytes.
    pub max_frame_bytes: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("fabric-worker"),
            args: Vec::new(),
            module_path: None,
            max_frame_bytes: 5 * 1024 * 1024,
        }
    }
}

/// Pipeline engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// How long a pipeline's resolved step list is reused. Zero disables caching.
    #[serde(with = "humantime_serde")]
    pub resolution_cache_ttl: Duration,

    /// Seed for split draws. Unset means seeded from OS entropy.
    #[serde(default)]
    pub split_seed: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            resolution_cache_ttl: Duration::from_secs(1),
            split_seed: None,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl Config {
    /// Parse a JSON configuration document. Missing sections take defaults.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with `FABRIC_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from a key lookup. Split out from `from_env` so tests
    /// don't have to mutate the process environment.
    pub fn with_env_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        if let Some(v) = lookup("FABRIC_MAX_NODES") {
            self.pool.max_nodes = parse_number("FABRIC_MAX_NODES", &v)?;
        }
        if let Some(v) = lookup("FABRIC_NODE_TTL_MS") {
            self.pool.node_ttl = Duration::from_millis(parse_number("FABRIC_NODE_TTL_MS", &v)?);
        }
        if let Some(v) = lookup("FABRIC_WORKER_PROGRAM") {
            self.worker.program = PathBuf::from(v);
        }
        if let Some(v) = lookup("FABRIC_MODULE_PATH") {
            self.worker.module_path = Some(v);
        }
        if let Some(v) = lookup("FABRIC_SPLIT_CACHE_MS") {
            self.pipeline.resolution_cache_ttl =
                Duration::from_millis(parse_number("FABRIC_SPLIT_CACHE_MS", &v)?);
        }
        if let Some(v) = lookup("FABRIC_LOG_FORMAT") {
            self.observability.json_logs = v.eq_ignore_ascii_case("json");
        }
        self.validate()?;
        Ok(self)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.pool.virtual_nodes == 0 {
            return Err(Error::validation("pool.virtual_nodes must be at least 1"));
        }
        if self.worker.max_frame_bytes == 0 {
            return Err(Error::validation("worker.max_frame_bytes must be positive"));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| Error::validation(format!("{} is not a valid number: {:?}", key, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.pool.max_nodes, 5);
        assert_eq!(config.pool.node_ttl, Duration::from_secs(300));
        assert_eq!(config.pipeline.resolution_cache_ttl, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let config = Config::from_json(r#"{"pool": {"max_nodes": 3, "node_ttl": "30s", "virtual_nodes": 40}}"#)
            .unwrap();
        assert_eq!(config.pool.max_nodes, 3);
        assert_eq!(config.pool.node_ttl, Duration::from_secs(30));
        assert_eq!(config.worker.max_frame_bytes, 5 * 1024 * 1024);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("FABRIC_MAX_NODES", "2"),
            ("FABRIC_NODE_TTL_MS", "1500"),
            ("FABRIC_MODULE_PATH", "/opt/modules"),
            ("FABRIC_SPLIT_CACHE_MS", "0"),
        ]
        .into_iter()
        .collect();

        let config = Config::default()
            .with_env_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.pool.max_nodes, 2);
        assert_eq!(config.pool.node_ttl, Duration::from_millis(1500));
        assert_eq!(config.worker.module_path.as_deref(), Some("/opt/modules"));
        assert_eq!(config.pipeline.resolution_cache_ttl, Duration::ZERO);
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let err = Config::default()
            .with_env_overrides(|k| (k == "FABRIC_MAX_NODES").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("FABRIC_MAX_NODES"));
    }

    #[test]
    fn test_zero_virtual_nodes_invalid() {
        let mut config = Config::default();
        config.pool.virtual_nodes = 0;
        assert!(config.validate().is_err());
    }
}
