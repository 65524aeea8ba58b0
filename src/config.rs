use crate::decision::FixedUpstream;
use crate::error::ProxyError;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_http_port() -> u16 {
    80
}

fn default_https_port() -> u16 {
    443
}

fn default_cert_domain() -> String {
    "reserver.proxy".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    30
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    #[default]
    None,
    Generate,
    On,
}

impl FromStr for SslMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(SslMode::None),
            "generate" => Ok(SslMode::Generate),
            "on" => Ok(SslMode::On),
            _ => Err(format!("Invalid SSL mode: {}. Must be one of: none, generate, on", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(format!("Invalid log level: {}. Must be one of: trace, debug, info, warn, error", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("Invalid log format: {}. Must be one of: text, json", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutputType {
    Stdout,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogTarget {
    #[serde(rename = "type")]
    pub output_type: LogOutputType,
    pub path: Option<PathBuf>,
    pub level: Option<LogLevel>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<LogLevel>,
    pub format: Option<LogFormat>,
    pub targets: Option<Vec<LogTarget>>,
}

/// Startup configuration, from flags and optionally a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ssl: SslMode,
    #[serde(default)]
    pub ssl_crt: Option<String>,
    #[serde(default)]
    pub ssl_key: Option<String>,
    /// Upstream proxy every dial goes through (e.g. `http://localhost:7897`).
    #[serde(default)]
    pub proxy: Option<String>,
    /// Destination all traffic is sent to while the `Host` header is preserved.
    #[serde(default)]
    pub fixed_upstream: Option<String>,
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_https_port")]
    pub https_port: u16,
    /// Domain covered by the generated certificate (`*.domain` and `domain`).
    #[serde(default = "default_cert_domain")]
    pub cert_domain: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ssl: SslMode::None,
            ssl_crt: None,
            ssl_key: None,
            proxy: None,
            fixed_upstream: None,
            bind: default_bind(),
            http_port: default_http_port(),
            https_port: default_https_port(),
            cert_domain: default_cert_domain(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            logging: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, ProxyError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::Config(format!("Failed to read config file {}: {}", path, e)))?;
        serde_json::from_str(&content)
            .map_err(|e| ProxyError::Config(format!("Failed to parse config file {}: {}", path, e)))
    }

    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.ssl == SslMode::On && (self.ssl_crt.is_none() || self.ssl_key.is_none()) {
            return Err(ProxyError::Config(
                "--ssl-crt and --ssl-key are required when --ssl=on".to_string(),
            ));
        }
        // Port 0 asks the OS for an ephemeral port on each listener
        if self.ssl != SslMode::None && self.http_port != 0 && self.http_port == self.https_port {
            return Err(ProxyError::Config(format!(
                "HTTP and HTTPS listeners cannot share port {}",
                self.http_port
            )));
        }
        if self.connect_timeout_secs == 0 || self.request_timeout_secs == 0 {
            return Err(ProxyError::Config("Timeouts must be at least one second".to_string()));
        }
        if self.cert_domain.trim().is_empty() {
            return Err(ProxyError::Config("Certificate domain cannot be empty".to_string()));
        }
        if let Some(proxy) = &self.proxy {
            parse_proxy_url(proxy)?;
        }
        Ok(())
    }

    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.http_port)
    }

    pub fn https_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.https_port)
    }
}

/// Validated, immutable connectivity settings shared by every component.
#[derive(Debug, Clone)]
pub struct Connectivity {
    pub proxy: Option<Url>,
    pub fixed_upstream: Option<FixedUpstream>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub pool_idle_timeout: Duration,
    pub pool_max_idle_per_host: usize,
}

impl Connectivity {
    pub fn from_config(config: &Config) -> Result<Self, ProxyError> {
        let proxy = config.proxy.as_deref().map(parse_proxy_url).transpose()?;
        let fixed_upstream = config
            .fixed_upstream
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(FixedUpstream::parse);

        Ok(Self {
            proxy,
            fixed_upstream,
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            pool_idle_timeout: Duration::from_secs(config.pool_idle_timeout_secs),
            pool_max_idle_per_host: config.pool_max_idle_per_host,
        })
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self {
            proxy: None,
            fixed_upstream: None,
            connect_timeout: Duration::from_secs(default_connect_timeout()),
            request_timeout: Duration::from_secs(default_request_timeout()),
            pool_idle_timeout: Duration::from_secs(default_pool_idle_timeout()),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
        }
    }
}

/// Parses a proxy URL and requires it to name a host.
pub fn parse_proxy_url(raw: &str) -> Result<Url, ProxyError> {
    let url = Url::parse(raw.trim())
        .map_err(|e| ProxyError::Config(format!("Invalid proxy URL {:?}: {}", raw, e)))?;
    if url.host_str().is_none_or(str::is_empty) {
        return Err(ProxyError::Config(format!("Proxy URL {:?} has no host", raw)));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.ssl, SslMode::None);
        assert_eq!(config.http_port, 80);
        assert_eq!(config.https_port, 443);
        assert_eq!(config.request_timeout_secs, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ssl_on_requires_files() {
        let config = Config {
            ssl: SslMode::On,
            ssl_crt: Some("server.crt".to_string()),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_shared_port_and_bad_proxy() {
        let config = Config {
            ssl: SslMode::Generate,
            http_port: 8443,
            https_port: 8443,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            proxy: Some("not a url".to_string()),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"ssl": "generate", "fixed_upstream": "https://192.168.1.1", "http_port": 8080, "https_port": 8443}}"#
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.ssl, SslMode::Generate);
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.cert_domain, "reserver.proxy");
        assert_eq!(config.pool_idle_timeout_secs, 90);

        let connectivity = Connectivity::from_config(&config).unwrap();
        let fixed = connectivity.fixed_upstream.unwrap();
        assert_eq!(fixed.authority, "192.168.1.1");
        assert_eq!(connectivity.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("generate".parse::<SslMode>().unwrap(), SslMode::Generate);
        assert!("maybe".parse::<SslMode>().is_err());
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("warn".parse::<LogLevel>().unwrap(), LogLevel::Warn);
    }
}
