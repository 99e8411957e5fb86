use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config {path}: {message}")]
    Parse { path: String, message: String },
    #[error("refusing to bind {0}: the service only listens on loopback")]
    NonLoopbackBind(IpAddr),
    #[error("no environment roots configured")]
    NoRoots,
    #[error("invalid {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Largest request body the service may be configured to accept.
pub const MAX_BODY_CEILING: usize = 1024 * 1024 * 1024;

/// Service settings, read from `pyops.toml` and overridden by CLI flags.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    pub bind: IpAddr,
    pub port: u16,
    /// Search roots in priority order; the first is where `create` puts new environments.
    pub roots: Vec<PathBuf>,
    pub protected: Vec<String>,
    /// Interpreter used for `-m venv` when creating environments.
    pub base_python: PathBuf,
    pub snippet_timeout_secs: u64,
    pub max_body_bytes: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8765,
            roots: vec![PathBuf::from("~/.local/share/pyops/envs")],
            protected: vec![pyops_env::PROTECTED_ENV.to_owned()],
            base_python: PathBuf::from("python3"),
            snippet_timeout_secs: 180,
            max_body_bytes: 32 * 1024 * 1024,
        }
    }
}

impl ServiceConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content, path)
    }

    /// Load an explicit path, or the default path if it exists, or built-in defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match default_config_path() {
            Some(path) if path.is_file() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Expand `~/` in every root.
    #[must_use]
    pub fn expanded(mut self) -> Self {
        self.roots = self.roots.iter().map(|r| expand_tilde(r)).collect();
        self.base_python = expand_tilde(&self.base_python);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.bind.is_loopback() {
            return Err(ConfigError::NonLoopbackBind(self.bind));
        }
        if self.roots.is_empty() {
            return Err(ConfigError::NoRoots);
        }
        if self.snippet_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "snippet_timeout_secs",
                message: "must be at least 1".to_owned(),
            });
        }
        if self.max_body_bytes == 0 || self.max_body_bytes > MAX_BODY_CEILING {
            return Err(ConfigError::Invalid {
                key: "max_body_bytes",
                message: format!("must be between 1 and {MAX_BODY_CEILING}"),
            });
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn snippet_timeout(&self) -> Duration {
        Duration::from_secs(self.snippet_timeout_secs)
    }
}

fn default_config_path() -> Option<PathBuf> {
    let home = std::env::var_os("HOME")?;
    Some(PathBuf::from(home).join(".config/pyops/pyops.toml"))
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    path.to_path_buf()
}
