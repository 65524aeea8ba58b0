use hyper::StatusCode;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Host header is missing")]
    MissingHost,

    #[error("Create proxy request failed: {0}")]
    Construction(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("CONNECT tunnel failed: {0}")]
    Tunnel(String),

    #[error("SOCKS5 error: {0}")]
    Socks(String),

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    #[error("Upstream timed out after {0}s")]
    Timeout(u64),

    #[error("Proxy request failed: {0}")]
    Upstream(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Malformed HTTP message: {0}")]
    Protocol(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Status returned to the client when this error ends a request.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::MissingHost | ProxyError::Protocol(_) => StatusCode::BAD_REQUEST,
            ProxyError::Io(_)
            | ProxyError::Connection(_)
            | ProxyError::Tunnel(_)
            | ProxyError::Socks(_)
            | ProxyError::Tls(_)
            | ProxyError::Timeout(_)
            | ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Construction(_)
            | ProxyError::Config(_)
            | ProxyError::Url(_)
            | ProxyError::Certificate(_)
            | ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short text written as the body of an error response.
    pub fn public_message(&self) -> &'static str {
        match self {
            ProxyError::MissingHost => "Host header is missing",
            ProxyError::Protocol(_) => "Bad Request",
            ProxyError::Construction(_) => "Create proxy request failed",
            e if e.status_code() == StatusCode::BAD_GATEWAY => "Proxy request failed",
            _ => "Internal Server Error",
        }
    }

    /// True when the error only reports that a peer went away.
    pub fn is_benign_disconnect(&self) -> bool {
        match self {
            ProxyError::Io(e) => is_benign_disconnect(e),
            _ => false,
        }
    }
}

/// Classifies teardown errors that happen on every normal disconnect.
pub fn is_benign_disconnect(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::NotConnected => true,
        _ => {
            let text = err.to_string();
            text.contains("closed") || text.contains("close_notify")
        }
    }
}

/// Walks an error's source chain looking for a benign I/O teardown.
pub fn is_benign_error(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if is_benign_disconnect(io_err) {
                return true;
            }
        }
        if let Some(hyper_err) = e.downcast_ref::<hyper::Error>() {
            if hyper_err.is_incomplete_message() || hyper_err.is_canceled() {
                return true;
            }
        }
        current = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ProxyError::MissingHost.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ProxyError::Construction("bad uri".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(ProxyError::Tunnel("407".to_string()).status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(ProxyError::Timeout(30).status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(ProxyError::Tls("bad record".to_string()).status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_benign_disconnects() {
        assert!(is_benign_disconnect(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(is_benign_disconnect(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(is_benign_disconnect(&io::Error::from(io::ErrorKind::UnexpectedEof)));
        assert!(is_benign_disconnect(&io::Error::other("use of closed network connection")));
        assert!(!is_benign_disconnect(&io::Error::from(io::ErrorKind::PermissionDenied)));

        let wrapped = ProxyError::Io(io::Error::from(io::ErrorKind::ConnectionAborted));
        assert!(wrapped.is_benign_disconnect());
        assert!(!ProxyError::Upstream("refused".to_string()).is_benign_disconnect());
    }

    #[test]
    fn test_benign_error_walks_sources() {
        let outer = ProxyError::Io(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(is_benign_error(&outer));
        let other = ProxyError::Config("nope".to_string());
        assert!(!is_benign_error(&other));
    }
}
