//! Renderer configuration.
//!
//! Settings come from an optional YAML file, then command line overrides.
//!
//! ```yaml
//! table_offset: 0
//! flow_update_delay_ms: 250
//! parallelism: 1
//! learning_mode: orchestrated
//! log_level: info
//! store:
//!   backend: redis
//!   host: 127.0.0.1
//!   port: 6379
//!   db: 0
//! ```

use crate::error::{RendererError, Result};
use crate::pipeline::STAGE_COUNT;
use clap::Args;
use ofoverlay_common::{TableId, TableIdMapper};
#[cfg(feature = "redis")]
use ofoverlay_common::RedisConfig;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// How endpoints are learned. Only recorded; both modes render the same flows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum LearningMode {
    #[default]
    Orchestrated,
    Reactive,
}

/// Southbound store selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StoreConfig {
    #[default]
    Memory,
    #[cfg(feature = "redis")]
    Redis(RedisConfig),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RendererConfig {
    /// Physical id of the first pipeline table.
    pub table_offset: TableId,
    /// Quiescence delay before a triggered run.
    pub flow_update_delay_ms: u64,
    /// Switches computed concurrently per run; 1 walks them serially.
    pub parallelism: usize,
    pub learning_mode: LearningMode,
    pub store: StoreConfig,
    pub log_level: String,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            table_offset: 0,
            flow_update_delay_ms: 250,
            parallelism: 1,
            learning_mode: LearningMode::default(),
            store: StoreConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl RendererConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw).map_err(|e| RendererError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn from_yaml(raw: &str) -> std::result::Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }

    /// Checks settings that cannot be expressed in the file format.
    pub fn validate(&self) -> Result<()> {
        TableIdMapper::verify_offset(self.table_offset, STAGE_COUNT)?;
        if self.parallelism == 0 {
            return Err(RendererError::InvalidSetting(
                "parallelism must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn flow_update_delay(&self) -> Duration {
        Duration::from_millis(self.flow_update_delay_ms)
    }
}

/// Command line settings that override the config file.
#[derive(Debug, Clone, Default, Args)]
pub struct ConfigOverrides {
    /// Physical id of the first pipeline table
    #[arg(long)]
    pub table_offset: Option<TableId>,

    /// Quiescence delay before a flow update, in milliseconds
    #[arg(long)]
    pub flow_update_delay_ms: Option<u64>,

    /// Switches computed concurrently per run
    #[arg(long)]
    pub parallelism: Option<usize>,

    /// Endpoint learning mode
    #[arg(long, value_enum)]
    pub learning_mode: Option<LearningMode>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long)]
    pub log_level: Option<String>,

    /// Use the Redis store at this host
    #[cfg(feature = "redis")]
    #[arg(long)]
    pub redis_host: Option<String>,

    /// Redis port, with --redis-host
    #[cfg(feature = "redis")]
    #[arg(long, requires = "redis_host")]
    pub redis_port: Option<u16>,
}

impl ConfigOverrides {
    pub fn apply(&self, config: &mut RendererConfig) {
        if let Some(offset) = self.table_offset {
            config.table_offset = offset;
        }
        if let Some(delay) = self.flow_update_delay_ms {
            config.flow_update_delay_ms = delay;
        }
        if let Some(parallelism) = self.parallelism {
            config.parallelism = parallelism;
        }
        if let Some(mode) = self.learning_mode {
            config.learning_mode = mode;
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        #[cfg(feature = "redis")]
        if let Some(host) = &self.redis_host {
            let mut redis = match &config.store {
                StoreConfig::Redis(existing) => existing.clone(),
                StoreConfig::Memory => RedisConfig::default(),
            };
            redis.host = host.clone();
            if let Some(port) = self.redis_port {
                redis.port = port;
            }
            config.store = StoreConfig::Redis(redis);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        overrides: ConfigOverrides,
    }

    #[test]
    fn test_defaults() {
        let config = RendererConfig::from_yaml("{}").unwrap();
        assert_eq!(config, RendererConfig::default());
        assert_eq!(config.flow_update_delay(), Duration::from_millis(250));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "table_offset: 10\nparallelism: 4\nlearning_mode: reactive\nstore:\n  backend: memory"
        )
        .unwrap();
        let config = RendererConfig::from_file(file.path()).unwrap();
        assert_eq!(config.table_offset, 10);
        assert_eq!(config.parallelism, 4);
        assert_eq!(config.learning_mode, LearningMode::Reactive);
        assert_eq!(config.store, StoreConfig::Memory);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "table_ofset: 10").unwrap();
        let err = RendererConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, RendererError::Config { .. }));
    }

    #[test]
    fn test_offset_validated() {
        let config = RendererConfig {
            table_offset: 250,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RendererError::Configuration(_))
        ));
        let config = RendererConfig {
            parallelism: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(RendererError::InvalidSetting(_))));
    }

    #[test]
    fn test_overrides() {
        let cli = Cli::parse_from(["ofoverlayd", "--table-offset", "5", "-l", "debug"]);
        let mut config = RendererConfig::default();
        cli.overrides.apply(&mut config);
        assert_eq!(config.table_offset, 5);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.parallelism, 1);
    }

    #[cfg(feature = "redis")]
    #[test]
    fn test_redis_store() {
        let config = RendererConfig::from_yaml("store:\n  backend: redis\n  port: 6380").unwrap();
        assert_eq!(
            config.store,
            StoreConfig::Redis(RedisConfig::new("127.0.0.1", 6380, 0))
        );

        let cli = Cli::parse_from(["ofoverlayd", "--redis-host", "10.1.1.1"]);
        let mut config = RendererConfig::default();
        cli.overrides.apply(&mut config);
        assert_eq!(
            config.store,
            StoreConfig::Redis(RedisConfig::new("10.1.1.1", 6379, 0))
        );
    }
}
