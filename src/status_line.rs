//! Parsing of HTTP/1.x response status lines read from raw sockets.
//!
//! Proxies and WebSocket upstreams answer with a head we read byte-for-byte
//! before handing the socket over to something else, so the status is taken
//! from the first line only: `HTTP/<major>.<minor> <code>[ <reason>]`.

use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum StatusLineError {
    #[error("empty status line")]
    Empty,
    #[error("status line does not start with HTTP/: {0:?}")]
    NotHttp(String),
    #[error("invalid HTTP version in status line: {0:?}")]
    BadVersion(String),
    #[error("invalid status code in status line: {0:?}")]
    BadCode(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub major: u8,
    pub minor: u8,
    pub code: u16,
    pub reason: String,
}

impl StatusLine {
    /// Parses the first line of `head`. Anything after the first line break is ignored.
    pub fn parse(head: &[u8]) -> Result<Self, StatusLineError> {
        let line = first_line(head);
        if line.is_empty() {
            return Err(StatusLineError::Empty);
        }
        let line = String::from_utf8_lossy(line);

        let rest = line
            .strip_prefix("HTTP/")
            .ok_or_else(|| StatusLineError::NotHttp(line.to_string()))?;

        let (version, rest) = rest.split_once(' ').unwrap_or((rest, ""));
        let (major, minor) = parse_version(version)
            .ok_or_else(|| StatusLineError::BadVersion(version.to_string()))?;

        let rest = rest.trim_start_matches(' ');
        let (code, reason) = rest.split_once(' ').unwrap_or((rest, ""));
        if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(StatusLineError::BadCode(code.to_string()));
        }
        let code: u16 = code
            .parse()
            .map_err(|_| StatusLineError::BadCode(code.to_string()))?;
        if !(100..=599).contains(&code) {
            return Err(StatusLineError::BadCode(code.to_string()));
        }

        Ok(Self {
            major,
            minor,
            code,
            reason: reason.trim().to_string(),
        })
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_switching_protocols(&self) -> bool {
        self.code == 101
    }
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/{}.{} {}", self.major, self.minor, self.code)?;
        if !self.reason.is_empty() {
            write!(f, " {}", self.reason)?;
        }
        Ok(())
    }
}

/// The bytes before the first CRLF (or bare LF).
pub fn first_line(head: &[u8]) -> &[u8] {
    let end = head.iter().position(|&b| b == b'\n').unwrap_or(head.len());
    let line = &head[..end];
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn parse_version(version: &str) -> Option<(u8, u8)> {
    let (major, minor) = version.split_once('.')?;
    if major.len() != 1 || minor.len() != 1 {
        return None;
    }
    Some((major.parse().ok()?, minor.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connect_established() {
        let line = StatusLine::parse(b"HTTP/1.1 200 Connection established\r\n\r\n").unwrap();
        assert_eq!(line.major, 1);
        assert_eq!(line.minor, 1);
        assert_eq!(line.code, 200);
        assert_eq!(line.reason, "Connection established");
        assert!(line.is_success());
    }

    #[test]
    fn test_parse_switching_protocols() {
        let head = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n";
        let line = StatusLine::parse(head).unwrap();
        assert!(line.is_switching_protocols());
        assert!(!line.is_success());
    }

    #[test]
    fn test_reason_phrase_is_not_the_code() {
        let line = StatusLine::parse(b"HTTP/1.1 407 Need 200 credits\r\n").unwrap();
        assert_eq!(line.code, 407);
        assert!(!line.is_success());

        let line = StatusLine::parse(b"HTTP/1.1 403 Forbidden\r\nX-Trace: 101\r\n\r\n").unwrap();
        assert!(!line.is_switching_protocols());
    }

    #[test]
    fn test_missing_reason_and_bare_lf() {
        let line = StatusLine::parse(b"HTTP/1.0 200\n").unwrap();
        assert_eq!(line.minor, 0);
        assert_eq!(line.reason, "");
        assert_eq!(line.to_string(), "HTTP/1.0 200");
    }

    #[test]
    fn test_rejects_garbage() {
        assert_eq!(StatusLine::parse(b""), Err(StatusLineError::Empty));
        assert!(matches!(StatusLine::parse(b"SSH-2.0-OpenSSH\r\n"), Err(StatusLineError::NotHttp(_))));
        assert!(matches!(StatusLine::parse(b"HTTP/11 200 OK\r\n"), Err(StatusLineError::BadVersion(_))));
        assert!(matches!(StatusLine::parse(b"HTTP/1.1 2000 OK\r\n"), Err(StatusLineError::BadCode(_))));
        assert!(matches!(StatusLine::parse(b"HTTP/1.1 OK 200\r\n"), Err(StatusLineError::BadCode(_))));
        assert!(matches!(StatusLine::parse(b"HTTP/1.1 999 Nope\r\n"), Err(StatusLineError::BadCode(_))));
    }
}
