use crate::error::ProxyError;
use hyper::Uri;
use log::warn;
use std::fmt;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
    Ws,
    Wss,
}

impl Scheme {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Some(Scheme::Http),
            "https" => Some(Scheme::Https),
            "ws" => Some(Scheme::Ws),
            "wss" => Some(Scheme::Wss),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, Scheme::Https | Scheme::Wss)
    }

    pub fn default_port(&self) -> u16 {
        if self.is_encrypted() { 443 } else { 80 }
    }

    /// The HTTP scheme with the same encryption mode.
    pub fn as_http(&self) -> Scheme {
        if self.is_encrypted() { Scheme::Https } else { Scheme::Http }
    }

    /// The WebSocket scheme with the same encryption mode.
    pub fn as_websocket(&self) -> Scheme {
        if self.is_encrypted() { Scheme::Wss } else { Scheme::Ws }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheme the client used to reach us: `https` over TLS or when the host names port 443.
pub fn infer_inbound_scheme(tls: bool, original_host: &str) -> Scheme {
    if tls || original_host.ends_with(":443") {
        Scheme::Https
    } else {
        Scheme::Http
    }
}

/// Operator-configured destination that replaces the request's own host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedUpstream {
    /// Scheme named in the configured URL, if any.
    pub scheme: Option<String>,
    /// `host[:port]` to connect to.
    pub authority: String,
    /// Set when the value could not be read as a URL and is used verbatim as a host.
    pub raw_fallback: bool,
}

impl FixedUpstream {
    /// Reads `https://10.0.0.5:8443`-style values. A value that does not parse as a
    /// URL with a host is taken as a bare `host[:port]`.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match Url::parse(raw) {
            Ok(url) if url.host_str().is_some_and(|h| !h.is_empty()) => {
                let host = url.host_str().unwrap_or_default();
                let authority = match url.port() {
                    Some(port) => format!("{}:{}", host, port),
                    None => host.to_string(),
                };
                Self {
                    scheme: Some(url.scheme().to_string()).filter(|s| !s.is_empty()),
                    authority,
                    raw_fallback: false,
                }
            }
            _ => {
                warn!(
                    "Fixed upstream {:?} is not a URL with a host; using it verbatim as host[:port]",
                    raw
                );
                Self {
                    scheme: None,
                    authority: raw.to_string(),
                    raw_fallback: true,
                }
            }
        }
    }

    fn scheme(&self) -> Option<Scheme> {
        self.scheme.as_deref().and_then(Scheme::parse)
    }
}

/// Per-request upstream target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingDecision {
    /// Scheme used toward the upstream.
    pub scheme: Scheme,
    /// `host[:port]` physically connected to.
    pub host: String,
    pub path: String,
    pub query: Option<String>,
    /// Scheme the client used toward us; becomes `X-Forwarded-Proto`.
    pub inbound_scheme: Scheme,
    /// Client-visible virtual host; always sent upstream as `Host`.
    pub original_host: String,
}

impl ForwardingDecision {
    /// Target for an ordinary HTTP request.
    pub fn for_http(
        original_host: &str,
        tls: bool,
        uri: &Uri,
        fixed: Option<&FixedUpstream>,
    ) -> Result<Self, ProxyError> {
        if original_host.is_empty() {
            return Err(ProxyError::MissingHost);
        }
        let inbound_scheme = infer_inbound_scheme(tls, original_host);
        let mut scheme = inbound_scheme;
        let mut host = original_host.to_string();

        if let Some(fixed) = fixed {
            if let Some(raw) = fixed.scheme.as_deref() {
                scheme = Scheme::parse(raw)
                    .map(|s| s.as_http())
                    .ok_or_else(|| ProxyError::Construction(format!("unsupported upstream scheme {:?}", raw)))?;
            }
            host = fixed.authority.clone();
        }

        Ok(Self {
            scheme,
            host,
            path: uri.path().to_string(),
            query: uri.query().map(str::to_string),
            inbound_scheme,
            original_host: original_host.to_string(),
        })
    }

    /// Target for a WebSocket upgrade. Only the encryption mode of the fixed
    /// upstream's scheme is taken over.
    pub fn for_websocket(
        original_host: &str,
        tls: bool,
        uri: &Uri,
        fixed: Option<&FixedUpstream>,
    ) -> Result<Self, ProxyError> {
        if original_host.is_empty() {
            return Err(ProxyError::MissingHost);
        }
        let inbound_scheme = infer_inbound_scheme(tls, original_host);
        let mut scheme = inbound_scheme.as_websocket();
        let mut host = original_host.to_string();

        if let Some(fixed) = fixed {
            if let Some(forced) = fixed.scheme() {
                scheme = forced.as_websocket();
            }
            host = fixed.authority.clone();
        }

        Ok(Self {
            scheme,
            host,
            path: uri.path().to_string(),
            query: uri.query().map(str::to_string),
            inbound_scheme,
            original_host: original_host.to_string(),
        })
    }

    /// Absolute URI for the outbound request.
    pub fn target_uri(&self) -> Result<Uri, ProxyError> {
        let mut target = format!("{}://{}{}", self.scheme.as_http(), self.host, self.path);
        if let Some(query) = &self.query {
            target.push('?');
            target.push_str(query);
        }
        target
            .parse::<Uri>()
            .map_err(|e| ProxyError::Construction(format!("{}: {}", target, e)))
    }

    /// `host:port` to dial, with the scheme's default port filled in.
    pub fn connect_authority(&self) -> String {
        with_default_port(&self.host, self.scheme.default_port())
    }
}

/// Appends `:port` unless `authority` already carries one.
pub fn with_default_port(authority: &str, port: u16) -> String {
    if authority_port(authority).is_some() {
        authority.to_string()
    } else {
        format!("{}:{}", authority, port)
    }
}

/// Host part of `host[:port]`, without IPv6 brackets.
pub fn authority_host(authority: &str) -> &str {
    if let Some(rest) = authority.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => host,
        _ => authority,
    }
}

fn authority_port(authority: &str) -> Option<u16> {
    if let Some(rest) = authority.strip_prefix('[') {
        return rest.split_once("]:").and_then(|(_, port)| port.parse().ok());
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => port.parse().ok(),
        _ => None,
    }
}
