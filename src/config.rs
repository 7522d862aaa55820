//! Agent configuration: a YAML file with env-var overrides, plus the tuning
//! constants for retention, drain, and backoff.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Hard ceiling on queued telemetry entries (~1.2 GB of payloads).
pub const MAX_QUEUE_ENTRIES: i64 = 3_000_000;
/// Queued entries older than this are purged by maintenance.
pub const QUEUE_TTL: Duration = Duration::from_secs(30 * 24 * 3600);
/// Fractions of the ceiling where the watchdog starts warning / alarming.
pub const QUEUE_WARN_FRACTION: f64 = 0.80;
pub const QUEUE_CRITICAL_FRACTION: f64 = 0.95;

/// Drain moves this many entries per fetch.
pub const DRAIN_BATCH_SIZE: i64 = 50;
/// A single drain cycle stops after this many entries so it cannot
/// monopolize the broker; the next cycle picks up the rest.
pub const DRAIN_CYCLE_CAP: i64 = 5_000;
/// Pause between drain batches to yield bandwidth to online publishes.
pub const DRAIN_BATCH_PAUSE: Duration = Duration::from_millis(50);
/// Queue entries failing this many drain attempts are discarded.
pub const DELIVERY_RETRY_CAP: i64 = 8;

/// Per-publish deadline on the online path and during drain.
pub const PUBLISH_DEADLINE: Duration = Duration::from_secs(1);

pub const SYNC_INTERVAL: Duration = Duration::from_secs(15 * 60);
pub const CONFIG_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
/// Per-phase sync retries: 3 attempts, backoff doubling from 2 s.
pub const SYNC_ATTEMPTS: u32 = 3;
pub const SYNC_BACKOFF_BASE: Duration = Duration::from_secs(2);

pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(15 * 60);
/// Minimum spacing between pipeline restarts.
pub const RESTART_DEBOUNCE: Duration = Duration::from_secs(30);

pub const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(30);
pub const MQTT_BACKOFF_CAP: Duration = Duration::from_secs(120);

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    pub device_id: String,
    #[serde(default)]
    pub equipment_name: String,
    #[serde(default = "default_operator")]
    pub operator_id: String,
    #[serde(default = "default_mqtt_host")]
    pub mqtt_host: String,
    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,
    /// Base URL of the configuration service (operators/geofences).
    #[serde(default = "default_config_url")]
    pub config_url: String,
    #[serde(default = "default_db_path")]
    pub database_path: PathBuf,
    #[serde(default)]
    pub tracking_enabled: bool,
    /// Local status surface; loopback only.
    #[serde(default = "default_status_addr")]
    pub status_addr: String,
    /// Run against the built-in simulated sensor feed instead of a hardware
    /// feed. Useful for bench runs without a vehicle.
    #[serde(default)]
    pub simulated_sensors: bool,
    #[serde(default = "default_sample_rate")]
    pub sample_rate_hz: f64,
}

fn default_operator() -> String {
    "unassigned".to_string()
}

fn default_mqtt_host() -> String {
    "127.0.0.1".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_config_url() -> String {
    "http://127.0.0.1:8080/api".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("aura_agent.db")
}

fn default_status_addr() -> String {
    "127.0.0.1:3100".to_string()
}

fn default_sample_rate() -> f64 {
    1.0
}

impl AgentConfig {
    /// Load from AURA_CONFIG (or agent.yaml in cwd / parent), then apply env
    /// overrides. A missing file falls back to a simulated standalone setup.
    pub fn load() -> Result<Self> {
        let mut cfg = match read_config_file()? {
            Some((path, raw)) => {
                tracing::info!("loaded config from {}", path.display());
                serde_yaml::from_str(&raw).context("parsing agent config yaml")?
            }
            None => {
                tracing::warn!("no agent.yaml found; using simulated defaults");
                Self::simulated_default()
            }
        };
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    pub fn simulated_default() -> Self {
        Self {
            device_id: "sim-device".to_string(),
            equipment_name: "simulated rig".to_string(),
            operator_id: default_operator(),
            mqtt_host: default_mqtt_host(),
            mqtt_port: default_mqtt_port(),
            config_url: default_config_url(),
            database_path: default_db_path(),
            tracking_enabled: true,
            status_addr: default_status_addr(),
            simulated_sensors: true,
            sample_rate_hz: default_sample_rate(),
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("DEVICE_ID") {
            self.device_id = v;
        }
        if let Ok(v) = std::env::var("OPERATOR_ID") {
            self.operator_id = v;
        }
        if let Ok(v) = std::env::var("MQTT_HOST") {
            self.mqtt_host = v;
        }
        if let Ok(v) = std::env::var("MQTT_PORT") {
            match v.parse() {
                Ok(port) => self.mqtt_port = port,
                Err(_) => tracing::warn!("ignoring unparseable MQTT_PORT={v}"),
            }
        }
        if let Ok(v) = std::env::var("CONFIG_URL") {
            self.config_url = v;
        }
        if let Ok(v) = std::env::var("DATABASE_PATH") {
            self.database_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("TRACKING_ENABLED") {
            self.tracking_enabled = env_truthy(&v);
        }
        if let Ok(v) = std::env::var("SIMULATED_SENSORS") {
            self.simulated_sensors = env_truthy(&v);
        }
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.sample_rate_hz.max(0.1))
    }
}

fn read_config_file() -> Result<Option<(PathBuf, String)>> {
    let candidates = if let Ok(p) = std::env::var("AURA_CONFIG") {
        vec![PathBuf::from(p)]
    } else {
        vec![PathBuf::from("agent.yaml"), PathBuf::from("../agent.yaml")]
    };
    for path in candidates {
        match std::fs::read_to_string(&path) {
            Ok(raw) => return Ok(Some((path, raw))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()));
            }
        }
    }
    Ok(None)
}

fn env_truthy(v: &str) -> bool {
    let v = v.to_lowercase();
    v == "1" || v == "true" || v == "yes" || v == "on"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_config_parses_with_defaults() {
        let cfg: AgentConfig = serde_yaml::from_str(
            r#"
device_id: truck-07
equipment_name: CAT 777
mqtt_host: broker.mine.local
tracking_enabled: true
"#,
        )
        .unwrap();
        assert_eq!(cfg.device_id, "truck-07");
        assert_eq!(cfg.mqtt_port, 1883);
        assert_eq!(cfg.operator_id, "unassigned");
        assert!(cfg.tracking_enabled);
        assert!(!cfg.simulated_sensors);
        assert_eq!(cfg.sample_interval(), Duration::from_secs(1));
    }

    #[test]
    fn unknown_yaml_keys_are_rejected() {
        let err = serde_yaml::from_str::<AgentConfig>("device_id: a\nbogus_key: 1\n");
        assert!(err.is_err());
    }

    #[test]
    fn truthy_parsing_accepts_common_spellings() {
        for v in ["1", "true", "YES", "On"] {
            assert!(env_truthy(v), "{v} should be truthy");
        }
        for v in ["0", "false", "off", ""] {
            assert!(!env_truthy(v), "{v} should be falsy");
        }
    }
}
