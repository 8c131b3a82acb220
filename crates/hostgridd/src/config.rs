//! hostgridd.toml configuration.
//!
//! Every field has a default, so an empty (or missing) file is valid.
//! Durations are whole seconds.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use hostgrid_agent::AgentConfig;
use hostgrid_control::{LifecycleConfig, MigrationConfig, PlaneConfig, SettleMode};
use hostgrid_converge::{ConvergeConfig, TriggerMode};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub convergence: ConvergenceConfig,
    pub lifecycle: LifecycleSection,
    pub migration: MigrationSection,
    pub agent: AgentSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8480,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Keep the ledger in memory; nothing survives a restart.
    pub in_memory: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/hostgrid"),
            in_memory: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceConfig {
    pub ack_timeout_secs: u64,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self { ack_timeout_secs: 120 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSection {
    pub settle_timeout_secs: u64,
    pub reconcile_interval_secs: u64,
}

impl Default for LifecycleSection {
    fn default() -> Self {
        Self {
            settle_timeout_secs: 600,
            reconcile_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationSection {
    pub step_timeout_secs: u64,
    /// A node health report older than this fails target verification.
    pub health_freshness_secs: u64,
}

impl Default for MigrationSection {
    fn default() -> Self {
        Self {
            step_timeout_secs: 1800,
            health_freshness_secs: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub drift_retention: usize,
    /// Zero disables drift-triggered re-convergence.
    pub drift_threshold: usize,
    pub drift_window_secs: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            drift_retention: hostgrid_ledger::store::DEFAULT_DRIFT_RETENTION,
            drift_threshold: 10,
            drift_window_secs: 300,
        }
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: DaemonConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server.bind, self.server.port)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.lifecycle.reconcile_interval_secs.max(1))
    }

    /// Library configuration for a daemon: workflows settle and shards
    /// converge in background tasks.
    pub fn plane_config(&self) -> PlaneConfig {
        PlaneConfig {
            lifecycle: LifecycleConfig::default()
                .with_settle_timeout(Duration::from_secs(self.lifecycle.settle_timeout_secs))
                .with_settle_mode(SettleMode::Background),
            converge: ConvergeConfig::default()
                .with_ack_timeout(Duration::from_secs(self.convergence.ack_timeout_secs)),
            trigger_mode: TriggerMode::Spawn,
            migration: MigrationConfig::default()
                .with_step_timeout(Duration::from_secs(self.migration.step_timeout_secs)),
            agent: AgentConfig::default()
                .with_health_freshness(Duration::from_secs(self.migration.health_freshness_secs))
                .with_drift_policy(
                    self.agent.drift_threshold,
                    Duration::from_secs(self.agent.drift_window_secs),
                ),
        }
    }
}
