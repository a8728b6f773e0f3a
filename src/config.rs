use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the controller
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// HTTP listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Docker engine connection
    #[serde(default)]
    pub docker: DockerConfig,

    /// Container labels used for discovery
    #[serde(default)]
    pub labels: LabelConfig,

    /// Activity supervisor tuning
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listening port (default: 10000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Return the error's HTTP status instead of 200 for failed pings
    #[serde(default)]
    pub strict_status_codes: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            strict_status_codes: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DockerConfig {
    /// Docker host URL (default: DOCKER_HOST, then common socket paths)
    pub host: Option<String>,

    /// Seconds to wait before the engine kills a stopping container
    /// (default: the engine's own grace period)
    pub stop_grace_secs: Option<u64>,
}

impl DockerConfig {
    pub fn stop_grace(&self) -> Option<Duration> {
        self.stop_grace_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LabelConfig {
    /// Label namespace; keys are `<prefix>.name`, `<prefix>.host`, `<prefix>.path`
    #[serde(default = "default_label_prefix")]
    pub prefix: String,

    /// Service name that asks for the real name to be read from container labels
    #[serde(default = "default_sentinel")]
    pub sentinel: String,
}

impl LabelConfig {
    pub fn name_key(&self) -> String {
        format!("{}.name", self.prefix)
    }

    pub fn host_key(&self) -> String {
        format!("{}.host", self.prefix)
    }

    pub fn path_key(&self) -> String {
        format!("{}.path", self.prefix)
    }
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            prefix: default_label_prefix(),
            sentinel: default_sentinel(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    /// Delay before re-querying a service whose status could not be read
    #[serde(default = "default_status_retry_backoff")]
    pub status_retry_backoff_ms: u64,
}

impl SupervisorConfig {
    pub fn status_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.status_retry_backoff_ms)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            status_retry_backoff_ms: default_status_retry_backoff(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    10000
}

fn default_label_prefix() -> String {
    "traefik-container-manager".to_string()
}

fn default_sentinel() -> String {
    "generic-container-manager".to_string()
}

fn default_status_retry_backoff() -> u64 {
    500
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if given, else from `idlegate.toml` when present, else defaults
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let fallback = Path::new("idlegate.toml");
                if fallback.exists() {
                    Self::load(fallback)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server: 'port' must be greater than 0".to_string());
        }
        if self.labels.prefix.trim().is_empty() {
            errors.push("labels: 'prefix' must not be empty".to_string());
        }
        if self.labels.sentinel.trim().is_empty() {
            errors.push("labels: 'sentinel' must not be empty".to_string());
        }
        if let Some(ref host) = self.docker.host {
            if !(host.starts_with("unix://")
                || host.starts_with("tcp://")
                || host.starts_with("http://"))
            {
                errors.push(format!(
                    "docker: 'host' must start with unix://, tcp:// or http:// (got '{}')",
                    host
                ));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
