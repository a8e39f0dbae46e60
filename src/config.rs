use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid environment override: {0}")]
    Env(#[from] envy::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub etcd: EtcdConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtcdConfig {
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            dial_timeout_secs: default_dial_timeout_secs(),
        }
    }
}

impl EtcdConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// 租约 TTL（秒）
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: i64,
    /// 单次存储调用的超时时间（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// gRPC 注册的实例在该时间内没有心跳则停止续约（秒）
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: default_lease_ttl_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
        }
    }
}

impl RegistryConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:50051".to_string()
}

fn default_endpoints() -> Vec<String> {
    vec!["http://127.0.0.1:2379".to_string()]
}

fn default_dial_timeout_secs() -> u64 {
    5
}

fn default_lease_ttl_secs() -> i64 {
    30
}

fn default_request_timeout_secs() -> u64 {
    5
}

fn default_heartbeat_timeout_secs() -> u64 {
    30
}

// REGISTRY_ 前缀的环境变量覆盖
#[derive(Debug, Default, Deserialize)]
struct EnvOverrides {
    listen_addr: Option<String>,
    etcd_endpoints: Option<Vec<String>>,
    dial_timeout_secs: Option<u64>,
    lease_ttl_secs: Option<i64>,
    request_timeout_secs: Option<u64>,
    heartbeat_timeout_secs: Option<u64>,
}

impl Config {
    /// 从 config.toml 加载，文件不存在时使用默认值，再应用环境变量覆盖
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config.toml")
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut config = match fs::read_to_string(path.as_ref()) {
            Ok(config_str) => Self::from_toml(&config_str)?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::info!(path = %path.as_ref().display(), "Config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(e.into()),
        };

        let overrides = envy::prefixed("REGISTRY_").from_env::<EnvOverrides>()?;
        config.apply(overrides);
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(config_str: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(config_str)?;
        Ok(config)
    }

    fn apply(&mut self, overrides: EnvOverrides) {
        if let Some(listen_addr) = overrides.listen_addr {
            self.server.listen_addr = listen_addr;
        }
        if let Some(endpoints) = overrides.etcd_endpoints {
            self.etcd.endpoints = endpoints;
        }
        if let Some(secs) = overrides.dial_timeout_secs {
            self.etcd.dial_timeout_secs = secs;
        }
        if let Some(ttl) = overrides.lease_ttl_secs {
            self.registry.lease_ttl_secs = ttl;
        }
        if let Some(secs) = overrides.request_timeout_secs {
            self.registry.request_timeout_secs = secs;
        }
        if let Some(secs) = overrides.heartbeat_timeout_secs {
            self.registry.heartbeat_timeout_secs = secs;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.etcd.endpoints.is_empty() {
            return Err(ConfigError::Invalid("etcd.endpoints must not be empty".into()));
        }
        if self.registry.lease_ttl_secs <= 0 {
            return Err(ConfigError::Invalid("registry.lease_ttl_secs must be positive".into()));
        }
        if self.registry.request_timeout_secs == 0
            || self.registry.heartbeat_timeout_secs == 0
            || self.etcd.dial_timeout_secs == 0
        {
            return Err(ConfigError::Invalid("timeouts must be positive".into()));
        }
        Ok(())
    }
}
