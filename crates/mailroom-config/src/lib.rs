use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub crm: Crm,
    #[serde(default)]
    pub cache: Cache,
    #[serde(default)]
    pub convergence: Convergence,
    #[serde(default)]
    pub gate: Gate,
    #[serde(default)]
    pub routing: Routing,
    #[serde(default)]
    pub log: Log,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
    /// Shared secret expected in the `?secret=` query parameter; unset
    /// disables the check.
    #[serde(default)]
    pub webhook_secret: Option<String>,
    /// Application token expected in the webhook body; unset disables the
    /// check.
    #[serde(default)]
    pub app_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Crm {
    /// "rest" talks to the remote CRM endpoint; "memory" runs against the
    /// in-process fake (local development and tests).
    pub mode: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_crm_timeout_ms")]
    pub timeout_ms: u64,
    /// Memory mode only: how many reads a newly created entity stays
    /// invisible for, simulating the remote store's eventual consistency.
    #[serde(default)]
    pub visibility_lag: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cache {
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Convergence {
    #[serde(default = "default_convergence_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_convergence_interval_secs")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gate {
    #[serde(default = "default_gate_key")]
    pub key: String,
    /// How long an overlapping delivery waits for the lock before being
    /// answered "busy". Zero means fail immediately.
    #[serde(default = "default_gate_wait_secs")]
    pub wait_timeout_secs: u64,
    /// Directory for lock marker files; system temp dir when unset.
    #[serde(default)]
    pub lock_dir: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Routing {
    /// Narrow the search to the sender's contact before scanning all
    /// leads and deals. Off by default.
    #[serde(default)]
    pub contact_first: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl Default for Convergence {
    fn default() -> Self {
        Self {
            timeout_secs: default_convergence_timeout_secs(),
            interval_secs: default_convergence_interval_secs(),
        }
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self {
            key: default_gate_key(),
            wait_timeout_secs: default_gate_wait_secs(),
            lock_dir: None,
        }
    }
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_crm_timeout_ms() -> u64 {
    10_000
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_convergence_timeout_secs() -> u64 {
    30
}

fn default_convergence_interval_secs() -> u64 {
    2
}

fn default_gate_key() -> String {
    "incoming-webhook".to_string()
}

fn default_gate_wait_secs() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    match cfg.crm.mode.as_str() {
        "rest" => {
            if cfg
                .crm
                .endpoint
                .as_ref()
                .map(|v| v.trim().is_empty())
                .unwrap_or(true)
            {
                return Err(ConfigError::UnsupportedConfig(
                    "crm.endpoint is required when crm.mode=rest".to_string(),
                ));
            }
            if cfg.crm.visibility_lag > 0 {
                return Err(ConfigError::UnsupportedConfig(
                    "crm.visibility_lag is not supported when crm.mode=rest".to_string(),
                ));
            }
        }
        "memory" => {
            if cfg.crm.endpoint.is_some() {
                return Err(ConfigError::UnsupportedConfig(
                    "crm.endpoint is not supported when crm.mode=memory".to_string(),
                ));
            }
        }
        other => {
            return Err(ConfigError::UnsupportedConfig(format!(
                "crm.mode={other} is not implemented; supported: rest, memory"
            )));
        }
    }
    if cfg.crm.timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "crm.timeout_ms must be >= 1".to_string(),
        ));
    }
    if cfg.cache.ttl_secs == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "cache.ttl_secs must be >= 1".to_string(),
        ));
    }
    if cfg.convergence.timeout_secs == 0 || cfg.convergence.interval_secs == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "convergence.timeout_secs and convergence.interval_secs must be >= 1".to_string(),
        ));
    }
    if cfg.gate.key.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "gate.key must not be empty".to_string(),
        ));
    }
    match cfg.log.level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => {}
        other => {
            return Err(ConfigError::UnsupportedConfig(format!(
                "log.level={other} is not supported"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn write_temp_config(contents: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("mailroom-config-test-{nanos}.yaml"));
        std::fs::write(&path, contents).expect("write temp config");
        path.to_string_lossy().to_string()
    }

    fn base_yaml() -> String {
        r#"
server:
  listen_addr: "127.0.0.1:0"

crm:
  mode: "rest"
  endpoint: "https://crm.example.com/rest/1/token"
"#
        .to_string()
    }

    #[test]
    fn applies_defaults_for_omitted_sections() {
        let path = write_temp_config(&base_yaml());
        let cfg = load_and_validate(&path).expect("minimal config should be accepted");
        assert_eq!(cfg.cache.ttl_secs, 300);
        assert_eq!(cfg.convergence.timeout_secs, 30);
        assert_eq!(cfg.convergence.interval_secs, 2);
        assert_eq!(cfg.gate.key, "incoming-webhook");
        assert_eq!(cfg.gate.wait_timeout_secs, 5);
        assert_eq!(cfg.crm.timeout_ms, 10_000);
        assert!(!cfg.routing.contact_first);
        assert_eq!(cfg.log.level, "info");
    }

    #[test]
    fn rejects_rest_mode_without_endpoint() {
        let path = write_temp_config(&base_yaml().replace(
            "  endpoint: \"https://crm.example.com/rest/1/token\"\n",
            "",
        ));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_endpoint_in_memory_mode() {
        let path = write_temp_config(&base_yaml().replace("mode: \"rest\"", "mode: \"memory\""));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(err, ConfigError::UnsupportedConfig(_)));
    }

    #[test]
    fn rejects_unknown_crm_mode() {
        let path = write_temp_config(&base_yaml().replace("mode: \"rest\"", "mode: \"soap\""));
        let err = load_and_validate(&path).expect_err("expected rejection");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_zero_convergence_interval() {
        let yaml = format!(
            "{}\nconvergence:\n  timeout_secs: 30\n  interval_secs: 0\n",
            base_yaml()
        );
        let path = write_temp_config(&yaml);
        let err = load_and_validate(&path).expect_err("expected rejection");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_unknown_log_level() {
        let yaml = format!("{}\nlog:\n  level: \"verbose\"\n", base_yaml());
        let path = write_temp_config(&yaml);
        let err = load_and_validate(&path).expect_err("expected rejection");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn accepts_memory_mode_with_visibility_lag() {
        let path = write_temp_config(
            r#"
server:
  listen_addr: "127.0.0.1:0"

crm:
  mode: "memory"
  visibility_lag: 2
"#,
        );
        let cfg = load_and_validate(&path).expect("memory config should be accepted");
        assert_eq!(cfg.crm.mode, "memory");
        assert_eq!(cfg.crm.visibility_lag, 2);
    }
}
