//! Typed payloads for each resource kind.
//!
//! The ledger stores a resource's configuration as an opaque ordered map.
//! On create and update the map is decoded into the kind's payload type,
//! validated (including rules that depend on the parent record), and
//! re-encoded so what lands in the ledger is the canonical form.

use std::sync::LazyLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::resource::{ManagedResource, ResourceKind};
use crate::types::Config;

static DB_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]{0,62}$").expect("valid regex"));

static SLUG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]{0,62}$").expect("valid regex"));

static HOSTNAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z]{2,63}$").expect("valid regex")
});

static CIDR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{1,3}\.){3}\d{1,3}/(\d|[12]\d|3[0-2])$|^[0-9a-fA-F:]+/\d{1,3}$")
        .expect("valid regex")
});

/// A kind-specific payload that can be validated before it reaches the ledger.
pub trait Provisionable: Serialize + DeserializeOwned {
    const KIND: ResourceKind;

    /// Check business rules. `parent` is the parent record for
    /// parent-placed kinds.
    fn validate(&self, parent: Option<&ManagedResource>) -> Result<(), String>;
}

fn require(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field} is required"));
    }
    Ok(())
}

// ── Shard-placed ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TenantSpec {
    #[serde(default)]
    pub sftp_enabled: bool,
    #[serde(default)]
    pub ssh_enabled: bool,
    #[serde(default)]
    pub disk_quota_bytes: u64,
}

impl Provisionable for TenantSpec {
    const KIND: ResourceKind = ResourceKind::Tenant;

    fn validate(&self, _parent: Option<&ManagedResource>) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSpec {
    pub name: String,
}

impl Provisionable for DatabaseSpec {
    const KIND: ResourceKind = ResourceKind::Database;

    fn validate(&self, _parent: Option<&ManagedResource>) -> Result<(), String> {
        if !DB_NAME_RE.is_match(&self.name) {
            return Err(format!("invalid database name: {}", self.name));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheInstanceSpec {
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u32,
}

fn default_max_memory_mb() -> u32 {
    64
}

impl Provisionable for CacheInstanceSpec {
    const KIND: ResourceKind = ResourceKind::CacheInstance;

    fn validate(&self, _parent: Option<&ManagedResource>) -> Result<(), String> {
        if self.max_memory_mb == 0 {
            return Err("max_memory_mb must be at least 1".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct S3BucketSpec {
    #[serde(default)]
    pub public: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_bytes: Option<u64>,
}

impl Provisionable for S3BucketSpec {
    const KIND: ResourceKind = ResourceKind::S3Bucket;

    fn validate(&self, _parent: Option<&ManagedResource>) -> Result<(), String> {
        Ok(())
    }
}

// ── Parent-placed ─────────────────────────────────────────────────

const RUNTIMES: [&str; 6] = ["php", "php-worker", "node", "python", "ruby", "static"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebrootSpec {
    pub runtime: String,
    pub runtime_version: String,
    #[serde(default)]
    pub public_folder: String,
}

impl Provisionable for WebrootSpec {
    const KIND: ResourceKind = ResourceKind::Webroot;

    fn validate(&self, _parent: Option<&ManagedResource>) -> Result<(), String> {
        if !RUNTIMES.contains(&self.runtime.as_str()) {
            return Err(format!(
                "runtime must be one of {}, got {}",
                RUNTIMES.join(", "),
                self.runtime
            ));
        }
        require("runtime_version", &self.runtime_version)?;
        if self.public_folder.contains("..") {
            return Err("public_folder must not traverse upwards".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FqdnSpec {
    pub fqdn: String,
    #[serde(default = "default_true")]
    pub ssl_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Provisionable for FqdnSpec {
    const KIND: ResourceKind = ResourceKind::Fqdn;

    fn validate(&self, _parent: Option<&ManagedResource>) -> Result<(), String> {
        if !HOSTNAME_RE.is_match(&self.fqdn) {
            return Err(format!("invalid fqdn: {}", self.fqdn));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseUserSpec {
    pub username: String,
    #[serde(default)]
    pub privileges: Vec<String>,
}

impl Provisionable for DatabaseUserSpec {
    const KIND: ResourceKind = ResourceKind::DatabaseUser;

    fn validate(&self, parent: Option<&ManagedResource>) -> Result<(), String> {
        if !DB_NAME_RE.is_match(&self.username) {
            return Err(format!("invalid username: {}", self.username));
        }
        if self.privileges.is_empty() {
            return Err("at least one privilege is required".into());
        }
        let parent = parent.ok_or("database user requires its parent database")?;
        let db_name = parent
            .config
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or(&parent.id);
        let prefix = format!("{db_name}_");
        if !self.username.starts_with(&prefix) {
            return Err(format!("username must start with {prefix}"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshKeySpec {
    pub name: String,
    pub public_key: String,
}

impl Provisionable for SshKeySpec {
    const KIND: ResourceKind = ResourceKind::SshKey;

    fn validate(&self, _parent: Option<&ManagedResource>) -> Result<(), String> {
        require("name", &self.name)?;
        if self.name.len() > 255 {
            return Err("name must be at most 255 characters".into());
        }
        let mut parts = self.public_key.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some(algo), Some(_)) if algo.starts_with("ssh-") || algo.starts_with("ecdsa-") => {
                Ok(())
            }
            _ => Err("public_key is not an OpenSSH public key".into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EgressRuleSpec {
    pub cidr: String,
    #[serde(default)]
    pub description: String,
}

impl Provisionable for EgressRuleSpec {
    const KIND: ResourceKind = ResourceKind::EgressRule;

    fn validate(&self, _parent: Option<&ManagedResource>) -> Result<(), String> {
        if !CIDR_RE.is_match(&self.cidr) {
            return Err(format!("invalid cidr: {}", self.cidr));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJobSpec {
    pub schedule: String,
    pub command: String,
    #[serde(default)]
    pub working_directory: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Provisionable for CronJobSpec {
    const KIND: ResourceKind = ResourceKind::CronJob;

    fn validate(&self, _parent: Option<&ManagedResource>) -> Result<(), String> {
        if self.schedule.split_whitespace().count() != 5 {
            return Err(format!(
                "schedule must have five fields, got {:?}",
                self.schedule
            ));
        }
        require("command", &self.command)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSpec {
    pub command: String,
    #[serde(default = "default_num_procs")]
    pub num_procs: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_port: Option<u16>,
    /// Pins the daemon to one node of its shard.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_num_procs() -> u32 {
    1
}

impl Provisionable for DaemonSpec {
    const KIND: ResourceKind = ResourceKind::Daemon;

    fn validate(&self, _parent: Option<&ManagedResource>) -> Result<(), String> {
        require("command", &self.command)?;
        if self.num_procs == 0 {
            return Err("num_procs must be at least 1".into());
        }
        if let Some(port) = self.proxy_port
            && port < 1024
        {
            return Err(format!("proxy_port {port} is privileged"));
        }
        Ok(())
    }
}

// ── Unplaced ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneSpec {
    pub name: String,
}

impl Provisionable for ZoneSpec {
    const KIND: ResourceKind = ResourceKind::Zone;

    fn validate(&self, _parent: Option<&ManagedResource>) -> Result<(), String> {
        if !HOSTNAME_RE.is_match(&self.name) {
            return Err(format!("invalid zone name: {}", self.name));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSpec {
    /// `kind/id` of the resource being backed up.
    pub source: String,
    #[serde(default)]
    pub retention_days: u32,
}

impl Provisionable for BackupSpec {
    const KIND: ResourceKind = ResourceKind::Backup;

    fn validate(&self, _parent: Option<&ManagedResource>) -> Result<(), String> {
        let (kind, id) = self
            .source
            .split_once('/')
            .ok_or_else(|| format!("source must be kind/id, got {}", self.source))?;
        let kind: ResourceKind = kind.parse()?;
        if !matches!(kind, ResourceKind::Webroot | ResourceKind::Database) {
            return Err(format!("cannot back up a {kind}"));
        }
        if !SLUG_RE.is_match(id) {
            return Err(format!("invalid source id: {id}"));
        }
        Ok(())
    }
}

// ── Dispatch ──────────────────────────────────────────────────────

fn check<P: Provisionable>(config: &Config, parent: Option<&ManagedResource>) -> Result<Config, String> {
    let value = serde_json::to_value(config).map_err(|e| e.to_string())?;
    let spec: P =
        serde_json::from_value(value).map_err(|e| format!("invalid {} config: {e}", P::KIND))?;
    spec.validate(parent)?;
    let canonical = serde_json::to_value(&spec).map_err(|e| e.to_string())?;
    serde_json::from_value(canonical).map_err(|e| e.to_string())
}

/// Validate `config` as the payload of `kind` and return its canonical form.
pub fn validate_config(
    kind: ResourceKind,
    config: &Config,
    parent: Option<&ManagedResource>,
) -> Result<Config, String> {
    match kind {
        ResourceKind::Tenant => check::<TenantSpec>(config, parent),
        ResourceKind::Webroot => check::<WebrootSpec>(config, parent),
        ResourceKind::Fqdn => check::<FqdnSpec>(config, parent),
        ResourceKind::SshKey => check::<SshKeySpec>(config, parent),
        ResourceKind::EgressRule => check::<EgressRuleSpec>(config, parent),
        ResourceKind::CronJob => check::<CronJobSpec>(config, parent),
        ResourceKind::Daemon => check::<DaemonSpec>(config, parent),
        ResourceKind::Database => check::<DatabaseSpec>(config, parent),
        ResourceKind::DatabaseUser => check::<DatabaseUserSpec>(config, parent),
        ResourceKind::CacheInstance => check::<CacheInstanceSpec>(config, parent),
        ResourceKind::S3Bucket => check::<S3BucketSpec>(config, parent),
        ResourceKind::Zone => check::<ZoneSpec>(config, parent),
        ResourceKind::Backup => check::<BackupSpec>(config, parent),
    }
}

/// Whether `id` is an acceptable resource or topology identifier.
pub fn valid_id(id: &str) -> bool {
    SLUG_RE.is_match(id)
}
