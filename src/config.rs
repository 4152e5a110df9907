//! Configuration: CLI flags, environment variables, TOML config file.
//!
//! Precedence, lowest first: built-in defaults, config file, `TSE_*`
//! environment variables, CLI flags. Tenants and metric definitions only come
//! from the file.

use clap::Parser;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::model::MetricDefinition;
use crate::tenant::TenantConfig;

pub const DEFAULT_CONFIG_PATH: &str = "tenant-sql-exporter.toml";

/// Prometheus exporter running SQL metrics across PostgreSQL tenants
#[derive(Parser, Debug, Default)]
#[command(name = "tenant-sql-exporter", version, about)]
pub struct Cli {
    /// Config file path [default: tenant-sql-exporter.toml]
    #[arg(long, short = 'c')]
    pub config: Option<String>,

    /// Listen port
    #[arg(long, short = 'p')]
    pub port: Option<u16>,

    /// Bind address
    #[arg(long)]
    pub listen_host: Option<String>,

    /// Per-metric collection timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Tenant connect and handshake timeout in seconds
    #[arg(long)]
    pub connect_timeout: Option<u64>,

    /// Log level or tracing filter directive
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_host: String,
    pub port: u16,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub log_level: String,
    pub tenants: Vec<TenantConfig>,
    pub metrics: Vec<MetricDefinition>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".into(),
            port: 9658,
            timeout_secs: 5,
            connect_timeout_secs: 10,
            log_level: "info".into(),
            tenants: Vec::new(),
            metrics: Vec::new(),
        }
    }
}

/// On-disk shape of the config file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    listen_host: Option<String>,
    port: Option<u16>,
    timeout: Option<u64>,
    connect_timeout: Option<u64>,
    log_level: Option<String>,
    #[serde(default, rename = "tenant")]
    tenants: Vec<TenantConfig>,
    #[serde(default, rename = "metric")]
    metrics: Vec<MetricDefinition>,
}

impl Config {
    /// Load configuration: defaults → config file → env vars → CLI flags.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(Cli::parse(), |key| std::env::var(key).ok())
    }

    fn from_cli(cli: Cli, env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. Config file. Only the default path may be absent.
        let (path, explicit) = match &cli.config {
            Some(p) => (p.as_str(), true),
            None => (DEFAULT_CONFIG_PATH, false),
        };
        if explicit || Path::new(path).exists() {
            let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_string(),
                source,
            })?;
            config.apply_file(&content, path)?;
        }

        // 2. Environment variables
        config.apply_env(env)?;

        // 3. CLI flags (highest priority)
        if let Some(v) = cli.port {
            config.port = v;
        }
        if let Some(v) = cli.listen_host {
            config.listen_host = v;
        }
        if let Some(v) = cli.timeout {
            config.timeout_secs = v;
        }
        if let Some(v) = cli.connect_timeout {
            config.connect_timeout_secs = v;
        }
        if let Some(v) = cli.log_level {
            config.log_level = v;
        }

        Ok(config)
    }

    /// Parse a TOML document on top of the defaults.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.apply_file(content, "<inline>")?;
        Ok(config)
    }

    fn apply_file(&mut self, content: &str, path: &str) -> Result<(), ConfigError> {
        let file: FileConfig = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })?;

        if let Some(v) = file.listen_host {
            self.listen_host = v;
        }
        if let Some(v) = file.port {
            self.port = v;
        }
        if let Some(v) = file.timeout {
            self.timeout_secs = v;
        }
        if let Some(v) = file.connect_timeout {
            self.connect_timeout_secs = v;
        }
        if let Some(v) = file.log_level {
            self.log_level = v;
        }
        self.tenants = file.tenants;
        self.metrics = file.metrics;
        Ok(())
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = env("TSE_PORT") {
            self.port = parse_env("TSE_PORT", &v)?;
        }
        if let Some(v) = env("TSE_LISTEN_HOST") {
            self.listen_host = v;
        }
        if let Some(v) = env("TSE_TIMEOUT") {
            self.timeout_secs = parse_env("TSE_TIMEOUT", &v)?;
        }
        if let Some(v) = env("TSE_CONNECT_TIMEOUT") {
            self.connect_timeout_secs = parse_env("TSE_CONNECT_TIMEOUT", &v)?;
        }
        if let Some(v) = env("TSE_LOG_LEVEL") {
            self.log_level = v;
        }
        Ok(())
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeout must be > 0".into()));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid("connect_timeout must be > 0".into()));
        }
        self.listen_addr()?;

        let mut tenant_names = HashSet::new();
        for tenant in &self.tenants {
            if tenant.name.trim().is_empty() {
                return Err(ConfigError::Invalid("tenant name must not be empty".into()));
            }
            if !tenant_names.insert(tenant.name.to_lowercase()) {
                return Err(ConfigError::Invalid(format!("duplicate tenant name '{}'", tenant.name)));
            }
            if tenant.max_connections == 0 {
                return Err(ConfigError::Invalid(format!(
                    "tenant '{}': max_connections must be > 0",
                    tenant.name
                )));
            }
        }

        let mut metric_names = HashSet::new();
        for metric in &self.metrics {
            if !is_valid_metric_name(&metric.name) {
                return Err(ConfigError::Invalid(format!(
                    "metric name '{}' is not a valid Prometheus metric name",
                    metric.name
                )));
            }
            if !metric_names.insert(metric.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate metric name '{}'", metric.name)));
            }
        }

        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self.listen_host.parse().map_err(|_| {
            ConfigError::Invalid(format!("listen_host '{}' is not an IP address", self.listen_host))
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{key}: cannot parse '{value}'")))
}

/// `[a-zA-Z_:][a-zA-Z0-9_:]*`
fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}
