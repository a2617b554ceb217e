//! YAML configuration for the daemon (SPEC_FULL.md §2.9).
//!
//! Every field defaults so a missing or partial settings file is a
//! logged warning, not a fatal error (spec.md §7 configuration fault
//! policy): the on-disk settings document and its JSON-patch admin
//! surface are out of scope (spec.md §1), but the daemon still needs
//! *some* way to load the engine's tunables at startup.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub dict: DictConfig,

    #[serde(default)]
    pub certificate: CertificateConfig,

    #[serde(default)]
    pub classify: ClassifyConfig,

    #[serde(default)]
    pub reputation: ReputationConfig,

    #[serde(default)]
    pub threat: ThreatConfig,

    #[serde(default)]
    pub geoip: GeoIpConfig,

    #[serde(default)]
    pub warehouse: WarehouseConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// First NFQUEUE number; workers bind `base..base+count-1` (spec.md §6).
    #[serde(default = "default_queue_base")]
    pub base: u16,

    /// Number of packet-queue workers.
    #[serde(default = "default_queue_count")]
    pub count: u16,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base: default_queue_base(),
            count: default_queue_count(),
        }
    }
}

fn default_queue_base() -> u16 {
    2000
}

fn default_queue_count() -> u16 {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DictConfig {
    /// Base path for the `write`/`read`/`all` pseudo-files (spec.md §6).
    #[serde(default = "default_dict_path")]
    pub path: PathBuf,
}

impl Default for DictConfig {
    fn default() -> Self {
        Self {
            path: default_dict_path(),
        }
    }
}

fn default_dict_path() -> PathBuf {
    PathBuf::from("/proc/net/dict")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateConfig {
    /// Cache entry retention from creation time (spec.md §4.5, ~24h).
    #[serde(default = "default_cert_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cert_ttl_secs(),
        }
    }
}

fn default_cert_ttl_secs() -> u64 {
    24 * 60 * 60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifyConfig {
    /// Upstream predictor host (spec.md §6 classification wire).
    #[serde(default = "default_classify_host")]
    pub host: String,

    #[serde(default = "default_classify_port")]
    pub port: u16,

    #[serde(default)]
    pub auth_key: String,

    /// Worker count; `0` means "pick ≈ CPU count" (spec.md §4.6).
    #[serde(default)]
    pub workers: usize,

    /// Classification cache TTL since last access (spec.md §4.6, ~24h).
    #[serde(default = "default_cert_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for ClassifyConfig {
    fn default() -> Self {
        Self {
            host: default_classify_host(),
            port: default_classify_port(),
            auth_key: String::new(),
            workers: 0,
            ttl_secs: default_cert_ttl_secs(),
        }
    }
}

fn default_classify_host() -> String {
    "classify.internal".to_string()
}

fn default_classify_port() -> u16 {
    443
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationConfig {
    /// Reputation service host:port (spec.md §6 reputation wire,
    /// default `localhost:8484`).
    #[serde(default = "default_reputation_host")]
    pub host: String,

    #[serde(default = "default_reputation_port")]
    pub port: u16,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            host: default_reputation_host(),
            port: default_reputation_port(),
        }
    }
}

fn default_reputation_host() -> String {
    "localhost".to_string()
}

fn default_reputation_port() -> u16 {
    8484
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatConfig {
    /// Reputation score floor below which a flow is blocked
    /// (spec.md §7 configuration fault policy: "threat sensitivity
    /// defaults to 80").
    #[serde(default = "default_threat_sensitivity")]
    pub sensitivity: u32,
}

impl Default for ThreatConfig {
    fn default() -> Self {
        Self {
            sensitivity: default_threat_sensitivity(),
        }
    }
}

fn default_threat_sensitivity() -> u32 {
    sentry_core::plugins::DEFAULT_THREAT_SENSITIVITY
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GeoIpConfig {
    /// CIDR-to-country table path. Absent means the geoip plugin runs
    /// as a no-op (spec.md §7 configuration fault policy).
    #[serde(default)]
    pub table_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WarehouseConfig {
    /// When set, every ingress event is appended here (spec.md §4.7).
    #[serde(default)]
    pub capture_path: Option<PathBuf>,

    /// When set, the daemon replays this file instead of binding the
    /// kernel queues (spec.md §4.7).
    #[serde(default)]
    pub replay_path: Option<PathBuf>,

    /// `0` = no pacing, `100` = real-time (spec.md §4.7).
    #[serde(default = "default_replay_speed")]
    pub replay_speed: u32,
}

fn default_replay_speed() -> u32 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Bind address for `/metrics` and `/health` (SPEC_FULL.md §6).
    #[serde(default = "default_metrics_addr")]
    pub bind: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            bind: default_metrics_addr(),
        }
    }
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    /// Loads YAML settings from `path`. A missing file is a warning,
    /// not a fatal error: the caller falls back to `Settings::default()`
    /// (spec.md §7 "missing setting ... safe defaults used").
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let settings: Settings = serde_yaml::from_str(&contents)?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_populated_without_a_file() {
        let settings = Settings::default();
        assert_eq!(settings.queue.base, 2000);
        assert_eq!(settings.queue.count, 4);
        assert_eq!(settings.threat.sensitivity, 80);
        assert_eq!(settings.reputation.port, 8484);
        assert_eq!(settings.warehouse.replay_speed, 100);
    }

    #[test]
    fn partial_yaml_fills_remaining_fields_with_defaults() {
        let yaml = "threat:\n  sensitivity: 50\n";
        let settings: Settings = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(settings.threat.sensitivity, 50);
        assert_eq!(settings.queue.base, 2000);
        assert_eq!(settings.classify.port, 443);
    }

    #[test]
    fn load_surfaces_missing_file_as_an_error() {
        let err = Settings::load("/nonexistent/path/settings.yaml");
        assert!(err.is_err());
    }
}
