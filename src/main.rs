use anyhow::{Context, anyhow};
use clap::Parser;
use log::info;
use reserver::config::{Config, LogFormat, LogLevel, SslMode};
use reserver::logging;
use reserver::resolver::ProxyEnvironment;
use reserver::server::Server;
use std::net::IpAddr;
use tokio::signal;

#[derive(Parser)]
#[clap(
    version,
    about = "TLS-capable gateway that forwards HTTP and WebSocket traffic by Host header"
)]
struct Args {
    #[clap(long, value_name = "MODE", help = "HTTPS listener: none, generate (self-signed) or on (PEM files)")]
    ssl: Option<SslMode>,

    #[clap(long, value_name = "FILE", help = "Certificate chain for --ssl=on")]
    ssl_crt: Option<String>,

    #[clap(long, value_name = "FILE", help = "Private key for --ssl=on")]
    ssl_key: Option<String>,

    #[clap(long, value_name = "URL", help = "Upstream proxy for every dial (e.g. http://localhost:7897)")]
    proxy: Option<String>,

    #[clap(long, value_name = "URL", help = "Send all traffic here while keeping the original Host (e.g. https://192.168.1.1)")]
    fixed_upstream: Option<String>,

    #[clap(long, value_name = "PORT", help = "HTTP listener port (default 80)")]
    http_port: Option<u16>,

    #[clap(long, value_name = "PORT", help = "HTTPS listener port (default 443)")]
    https_port: Option<u16>,

    #[clap(long, value_name = "IP", help = "Address both listeners bind to (default 0.0.0.0)")]
    bind: Option<IpAddr>,

    #[clap(long, value_name = "DOMAIN", help = "Domain of the generated certificate (default reserver.proxy)")]
    cert_domain: Option<String>,

    #[clap(short, long, value_name = "FILE", help = "JSON configuration file; flags override its values")]
    config: Option<String>,

    #[clap(long, value_name = "LEVEL", help = "Log level: trace, debug, info, warn, error")]
    log_level: Option<LogLevel>,

    #[clap(long, value_name = "FORMAT", help = "Log format: text or json")]
    log_format: Option<LogFormat>,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(ssl) = self.ssl {
            config.ssl = ssl;
        }
        if self.ssl_crt.is_some() {
            config.ssl_crt = self.ssl_crt.clone();
        }
        if self.ssl_key.is_some() {
            config.ssl_key = self.ssl_key.clone();
        }
        if self.proxy.is_some() {
            config.proxy = self.proxy.clone();
        }
        if self.fixed_upstream.is_some() {
            config.fixed_upstream = self.fixed_upstream.clone();
        }
        if let Some(port) = self.http_port {
            config.http_port = port;
        }
        if let Some(port) = self.https_port {
            config.https_port = port;
        }
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(domain) = &self.cert_domain {
            config.cert_domain = domain.clone();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path).with_context(|| format!("loading configuration from {}", path))?,
        None => Config::default(),
    };
    args.apply(&mut config);

    let file_logging = config.logging.clone().unwrap_or_default();
    let level = args.log_level.or(file_logging.level).unwrap_or_default();
    let format = args.log_format.or(file_logging.format).unwrap_or_default();
    logging::init(level, format, config.logging.clone())
        .map_err(|e| anyhow!("failed to initialize logging: {}", e))?;

    info!(
        "Starting reserver (ssl: {:?}, http: {}, https: {})",
        config.ssl,
        config.http_addr(),
        if config.ssl == SslMode::None { "disabled".to_string() } else { config.https_addr().to_string() }
    );

    let server = Server::bind(&config, ProxyEnvironment::from_env())
        .await
        .context("failed to start listeners")?;

    tokio::select! {
        result = server.run() => result.context("listener failed")?,
        _ = signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
    }

    Ok(())
}
