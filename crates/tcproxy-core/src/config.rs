//! Configuration management for tcproxy
//!
//! Worker-level settings for the queue endpoint, the local proxy and the
//! reclaim schedule. Loaded from `.tcproxy/config.toml`; every field has a
//! default so a partial file is fine.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::{Result, TcProxyError};

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Root URL of the deployment; API calls go to `<root_url>/api/...`
    #[serde(default = "default_root_url")]
    pub root_url: String,

    /// Local credential-injecting proxy
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Claim reclaim schedule
    #[serde(default)]
    pub reclaim: ReclaimConfig,
}

/// How the proxy authenticates forwarded requests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthScheme {
    /// Hawk header signing with the task's temporary credentials
    #[default]
    Hawk,
    /// `Authorization: Bearer <accessToken>`
    Bearer,
}

impl std::fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hawk => write!(f, "hawk"),
            Self::Bearer => write!(f, "bearer"),
        }
    }
}

impl std::str::FromStr for AuthScheme {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hawk" => Ok(Self::Hawk),
            "bearer" => Ok(Self::Bearer),
            _ => Err(format!("Invalid auth scheme: {}. Use hawk or bearer.", s)),
        }
    }
}

/// Proxy listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Address to bind; must be a loopback address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Port to bind (0 picks an ephemeral port)
    #[serde(default)]
    pub port: u16,

    /// Signing scheme for forwarded requests
    #[serde(default)]
    pub auth_scheme: AuthScheme,

    /// Upper bound for receiving the upstream response head
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// How long a request waits for the first credentials before 503
    #[serde(default = "default_credentials_wait_ms")]
    pub credentials_wait_ms: u64,

    /// Drain period for in-flight requests on shutdown
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

/// When reclaims are issued
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimMode {
    /// Every `interval_secs`, regardless of the lease
    Fixed,
    /// `margin_secs` before the current `takenUntil`
    #[default]
    BeforeExpiry,
}

/// Reclaim schedule settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReclaimConfig {
    #[serde(default)]
    pub mode: ReclaimMode,

    /// Tick interval for `fixed` mode
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Safety margin for `before_expiry` mode
    #[serde(default = "default_margin_secs")]
    pub margin_secs: u64,

    /// Timeout for a single reclaim call
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

// Default value providers
fn default_root_url() -> String {
    "https://community-tc.services.mozilla.com".to_string()
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_credentials_wait_ms() -> u64 {
    5_000
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

fn default_interval_secs() -> u64 {
    5
}

fn default_margin_secs() -> u64 {
    180
}

fn default_call_timeout_secs() -> u64 {
    30
}

impl WorkerConfig {
    /// Load configuration from `.tcproxy/config.toml` or use defaults
    pub fn load_or_default(root: &Path) -> Result<Self> {
        let config_path = root.join(".tcproxy/config.toml");

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load and validate a specific config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            TcProxyError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write default configuration to `.tcproxy/config.toml`
    pub fn write_default(root: &Path) -> Result<()> {
        let config_dir = root.join(".tcproxy");
        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(&Self::default()).map_err(|e| {
            TcProxyError::Config(format!("Failed to serialize config: {}", e))
        })?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    /// Check values that serde cannot
    pub fn validate(&self) -> Result<()> {
        if !(self.root_url.starts_with("http://") || self.root_url.starts_with("https://")) {
            return Err(TcProxyError::Config(format!(
                "root_url must be an http(s) URL, got '{}'",
                self.root_url
            )));
        }
        self.proxy.socket_addr()?;
        if self.reclaim.mode == ReclaimMode::Fixed && self.reclaim.interval_secs == 0 {
            return Err(TcProxyError::Config(
                "reclaim.interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.reclaim.call_timeout_secs == 0 {
            return Err(TcProxyError::Config(
                "reclaim.call_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Base of every API URL (`<root_url>/api`)
    pub fn api_base(&self) -> String {
        format!("{}/api", self.root_url.trim_end_matches('/'))
    }
}

impl ProxyConfig {
    /// Listener address; rejects anything that is not loopback
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self.bind_address.parse().map_err(|e| {
            TcProxyError::Config(format!("Invalid bind address '{}': {}", self.bind_address, e))
        })?;
        if !ip.is_loopback() {
            return Err(TcProxyError::Config(format!(
                "Proxy must bind a loopback address, got {}",
                ip
            )));
        }
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn credentials_wait(&self) -> Duration {
        Duration::from_millis(self.credentials_wait_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl ReclaimConfig {
    /// Fixed-interval schedule, as used by short-lived test tasks
    pub fn fixed(interval: Duration) -> Self {
        Self {
            mode: ReclaimMode::Fixed,
            interval_secs: interval.as_secs().max(1),
            ..Self::default()
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn margin(&self) -> Duration {
        Duration::from_secs(self.margin_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            root_url: default_root_url(),
            proxy: ProxyConfig::default(),
            reclaim: ReclaimConfig::default(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: 0,
            auth_scheme: AuthScheme::default(),
            request_timeout_secs: default_request_timeout_secs(),
            credentials_wait_ms: default_credentials_wait_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            mode: ReclaimMode::default(),
            interval_secs: default_interval_secs(),
            margin_secs: default_margin_secs(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.proxy.auth_scheme, AuthScheme::Hawk);
        assert_eq!(config.reclaim.mode, ReclaimMode::BeforeExpiry);
        assert_eq!(config.reclaim.margin(), Duration::from_secs(180));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = TempDir::new().unwrap();
        let config = WorkerConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.root_url, default_root_url());
    }

    #[test]
    fn test_write_default_round_trips() {
        let dir = TempDir::new().unwrap();
        WorkerConfig::write_default(dir.path()).unwrap();
        assert!(dir.path().join(".tcproxy/config.toml").exists());

        let config = WorkerConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.proxy.bind_address, "127.0.0.1");
        assert_eq!(config.reclaim.call_timeout_secs, 30);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
root_url = "http://localhost:8080"

[reclaim]
mode = "fixed"
interval_secs = 5

[proxy]
auth_scheme = "bearer"
"#,
        )
        .unwrap();

        let config = WorkerConfig::load(&path).unwrap();
        assert_eq!(config.api_base(), "http://localhost:8080/api");
        assert_eq!(config.reclaim.mode, ReclaimMode::Fixed);
        assert_eq!(config.reclaim.interval(), Duration::from_secs(5));
        assert_eq!(config.proxy.auth_scheme, AuthScheme::Bearer);
        assert_eq!(config.proxy.credentials_wait(), Duration::from_secs(5));
    }

    #[test]
    fn test_rejects_non_loopback_bind() {
        let mut config = WorkerConfig::default();
        config.proxy.bind_address = "0.0.0.0".to_string();
        assert!(matches!(config.validate(), Err(TcProxyError::Config(_))));

        config.proxy.bind_address = "::1".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_fixed_interval() {
        let mut config = WorkerConfig::default();
        config.reclaim.mode = ReclaimMode::Fixed;
        config.reclaim.interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_root_url() {
        let config = WorkerConfig {
            root_url: "ftp://queue".to_string(),
            ..WorkerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_auth_scheme_parse() {
        assert_eq!("HAWK".parse::<AuthScheme>().unwrap(), AuthScheme::Hawk);
        assert_eq!("bearer".parse::<AuthScheme>().unwrap(), AuthScheme::Bearer);
        assert!("basic".parse::<AuthScheme>().is_err());
    }
}
