use crate::decision::{FixedUpstream, ForwardingDecision};
use crate::error::ProxyError;
use crate::pipe::pipe;
use crate::resolver::ProxyChain;
use crate::response::{ProxyBody, empty, full};
use crate::rewind::read_head;
use crate::status_line::StatusLine;
use crate::tls::UpstreamStream;
use bytes::{Bytes, BytesMut};
use hyper::header::{CONTENT_LENGTH, HeaderMap, HeaderName, HeaderValue, TRANSFER_ENCODING};
use hyper::http::request::Parts;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Most header lines accepted in a request or upgrade response head.
const MAX_HEADERS: usize = 100;

/// Upper bound for the upstream's handshake response.
pub const MAX_HANDSHAKE_RESPONSE: usize = 4096;

pub const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
pub const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";
pub const INTERNAL_SERVER_ERROR: &[u8] = b"HTTP/1.1 500 Internal Server Error\r\n\r\n";

/// True for `Upgrade: websocket` together with a `Connection` header mentioning `upgrade`.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let upgrade = headers
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    let connection = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("upgrade"));
    upgrade && connection
}

/// Request head as the client sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Request target exactly as written on the request line.
    pub target: String,
    /// Header lines in arrival order, names as written.
    pub headers: Vec<(String, Vec<u8>)>,
}

impl RequestHead {
    /// Parses a complete head (request line, headers, blank line).
    pub fn parse(head: &[u8]) -> Result<Self, ProxyError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(head) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(ProxyError::Protocol("incomplete request head".to_string()));
            }
            Err(e) => return Err(ProxyError::Protocol(e.to_string())),
        }

        Ok(Self {
            method: req.method.unwrap_or("GET").to_string(),
            target: req.path.unwrap_or("/").to_string(),
            headers: req
                .headers
                .iter()
                .map(|h| (h.name.to_string(), h.value.to_vec()))
                .collect(),
        })
    }

    pub fn from_parts(parts: &Parts) -> Self {
        Self {
            method: parts.method.to_string(),
            target: parts
                .uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .filter(|_| parts.uri.authority().is_none())
                .unwrap_or_else(|| parts.uri.to_string()),
            headers: parts
                .headers
                .iter()
                .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
                .collect(),
        }
    }

    pub fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value),
            ) {
                map.append(name, value);
            }
        }
        map
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        is_websocket_upgrade(&self.header_map())
    }

    /// `Host` header, or the authority of an absolute-form target.
    pub fn host(&self) -> Option<String> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("host"))
            .and_then(|(_, value)| std::str::from_utf8(value).ok())
            .map(|v| v.trim().to_string())
            .or_else(|| {
                self.uri()
                    .ok()
                    .and_then(|uri| uri.authority().map(|a| a.as_str().to_string()))
            })
            .filter(|h| !h.is_empty())
    }

    pub fn uri(&self) -> Result<Uri, ProxyError> {
        self.target
            .parse::<Uri>()
            .map_err(|e| ProxyError::Protocol(format!("invalid request target {:?}: {}", self.target, e)))
    }

    /// Handshake sent upstream: original request line, every header except
    /// `Host`, then `Host` set to the client-visible host.
    pub fn to_upstream_bytes(&self, original_host: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", self.method, self.target).as_bytes());
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("host") {
                continue;
            }
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(format!("Host: {}\r\n\r\n", original_host).as_bytes());
        out
    }
}

/// Upstream connection whose handshake response has been read.
struct UpstreamHandshake {
    upstream: UpstreamStream,
    /// Every byte read from the upstream so far.
    response: Bytes,
    /// Length of the response head within `response`, if it was complete.
    head_len: Option<usize>,
    status: StatusLine,
}

/// Joins WebSocket clients to their upstream. A session moves through
/// `hijacked -> dialing -> handshake sent -> handshake validated -> bridging
/// -> closed`; failures before validation get a bare status line.
pub struct WebSocketBridge {
    chain: Arc<ProxyChain>,
    fixed: Option<FixedUpstream>,
}

impl WebSocketBridge {
    pub fn new(chain: Arc<ProxyChain>, fixed: Option<FixedUpstream>) -> Self {
        Self { chain, fixed }
    }

    /// Bridges a connection whose first request was a WebSocket upgrade. The
    /// client socket is driven from here on; bytes it sent after the head are
    /// expected to be replayed by `client` itself.
    pub async fn bridge_hijacked<C>(&self, client: &mut C, head: RequestHead, tls: bool)
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let original_host = head.host();
        info!(
            "WebSocket Request: {} (Host: {})",
            head.target,
            original_host.as_deref().unwrap_or("")
        );

        let Some(original_host) = original_host else {
            warn!("WebSocket missing Host header");
            let _ = client.write_all(BAD_REQUEST).await;
            return;
        };

        let handshake = match self.open_upstream(&head, &original_host, tls).await {
            Ok(handshake) => handshake,
            Err(e) => {
                warn!("WebSocket dial upstream failed: {}", e);
                let reply = if e.status_code() == StatusCode::BAD_REQUEST {
                    BAD_REQUEST
                } else {
                    BAD_GATEWAY
                };
                let _ = client.write_all(reply).await;
                return;
            }
        };

        if let Err(e) = client.write_all(&handshake.response).await {
            warn!("Forward WebSocket upgrade response failed: {}", e);
            return;
        }
        if !handshake.status.is_switching_protocols() {
            info!("WebSocket upgrade failed, upstream response: {}", handshake.status);
            return;
        }

        relay(client, handshake.upstream).await;
    }

    /// Bridges an upgrade that arrived on a connection already served by
    /// hyper. The upstream's status and headers become the response; the
    /// byte streams are joined once hyper hands over the upgraded connection.
    pub async fn bridge_upgrade<B>(&self, mut req: Request<B>, tls: bool) -> Result<Response<ProxyBody>, ProxyError> {
        let on_upgrade = hyper::upgrade::on(&mut req);
        let (parts, _) = req.into_parts();
        let head = RequestHead::from_parts(&parts);
        let original_host = head.host().ok_or(ProxyError::MissingHost)?;
        info!("WebSocket Request: {} (Host: {})", head.target, original_host);

        let handshake = self.open_upstream(&head, &original_host, tls).await?;
        let head_len = handshake
            .head_len
            .ok_or_else(|| ProxyError::Upstream("incomplete WebSocket handshake response".to_string()))?;
        let mut response = response_from_head(&handshake.response[..head_len])?;
        let early = handshake.response.slice(head_len..);

        if !handshake.status.is_switching_protocols() {
            info!("WebSocket upgrade failed, upstream response: {}", handshake.status);
            response.headers_mut().remove(CONTENT_LENGTH);
            response.headers_mut().remove(TRANSFER_ENCODING);
            return Ok(response.map(|_| full(early)));
        }

        let upstream = handshake.upstream;
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let mut client = TokioIo::new(upgraded);
                    if !early.is_empty() {
                        if let Err(e) = client.write_all(&early).await {
                            debug!("WebSocket client gone before bridging: {}", e);
                            return;
                        }
                    }
                    relay(client, upstream).await;
                }
                Err(e) => warn!("WebSocket upgrade failed on client side: {}", e),
            }
        });

        Ok(response)
    }

    async fn open_upstream(
        &self,
        head: &RequestHead,
        original_host: &str,
        tls: bool,
    ) -> Result<UpstreamHandshake, ProxyError> {
        let uri = head.uri()?;
        let decision = ForwardingDecision::for_websocket(original_host, tls, &uri, self.fixed.as_ref())?;

        let mut upstream = self
            .chain
            .connect(decision.scheme, &decision.connect_authority(), original_host)
            .await?;

        info!(
            "Sending WebSocket upgrade to upstream: Host={} (Physically connecting to: {})",
            original_host, decision.host
        );
        upstream
            .write_all(&head.to_upstream_bytes(original_host))
            .await
            .map_err(|e| ProxyError::Upstream(format!("send upgrade failed: {}", e)))?;

        let mut buf = BytesMut::with_capacity(1024);
        let head_len = read_head(&mut upstream, &mut buf, MAX_HANDSHAKE_RESPONSE)
            .await
            .map_err(|e| ProxyError::Upstream(format!("read upgrade response failed: {}", e)))?;
        if buf.is_empty() {
            return Err(ProxyError::Upstream("upstream closed before answering the upgrade".to_string()));
        }
        let status = StatusLine::parse(&buf)
            .map_err(|e| ProxyError::Upstream(format!("unreadable upgrade response: {}", e)))?;

        Ok(UpstreamHandshake {
            upstream,
            response: buf.freeze(),
            head_len,
            status,
        })
    }
}

async fn relay<C>(client: C, upstream: UpstreamStream)
where
    C: AsyncRead + AsyncWrite + Send,
{
    info!("WebSocket connected, bridging data");
    let outcome = pipe(client, upstream).await;
    match &outcome.error {
        Some(e) if !outcome.is_clean() => warn!("WebSocket bridge error: {}", e),
        _ => info!(
            "WebSocket closed ({} bytes to upstream, {} bytes to client)",
            outcome.a_to_b, outcome.b_to_a
        ),
    }
}

/// Turns a raw upstream response head into a response with an empty body.
fn response_from_head(head: &[u8]) -> Result<Response<ProxyBody>, ProxyError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut headers);
    parsed
        .parse(head)
        .map_err(|e| ProxyError::Upstream(format!("malformed upgrade response: {}", e)))?;

    let code = parsed
        .code
        .ok_or_else(|| ProxyError::Upstream("upgrade response has no status".to_string()))?;
    let status = StatusCode::from_u16(code)
        .map_err(|e| ProxyError::Upstream(format!("invalid upgrade status {}: {}", code, e)))?;

    let mut response = Response::new(empty());
    *response.status_mut() = status;
    for header in parsed.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|e| ProxyError::Upstream(format!("invalid header name {:?}: {}", header.name, e)))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|e| ProxyError::Upstream(format!("invalid value for {}: {}", header.name, e)))?;
        response.headers_mut().append(name, value);
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HOST;

    const HANDSHAKE: &[u8] = b"GET /chat?room=1 HTTP/1.1\r\n\
        Host: chat.example.com\r\n\
        Upgrade: websocket\r\n\
        Connection: keep-alive, Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\r\n";

    #[test]
    fn test_parse_and_classify() {
        let head = RequestHead::parse(HANDSHAKE).unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/chat?room=1");
        assert_eq!(head.host().as_deref(), Some("chat.example.com"));
        assert!(head.is_websocket_upgrade());

        let plain = RequestHead::parse(b"GET / HTTP/1.1\r\nHost: a\r\nUpgrade: h2c\r\nConnection: Upgrade\r\n\r\n").unwrap();
        assert!(!plain.is_websocket_upgrade());
    }

    #[test]
    fn test_classification_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert("upgrade", HeaderValue::from_static("WebSocket"));
        headers.insert("connection", HeaderValue::from_static("UPGRADE"));
        assert!(is_websocket_upgrade(&headers));

        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        assert!(!is_websocket_upgrade(&headers));
    }

    #[test]
    fn test_upstream_handshake_rewrites_host_last() {
        let head = RequestHead::parse(HANDSHAKE).unwrap();
        let bytes = head.to_upstream_bytes("chat.example.com");
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("GET /chat?room=1 HTTP/1.1\r\nUpgrade: websocket\r\n"));
        assert!(text.ends_with("Sec-WebSocket-Version: 13\r\nHost: chat.example.com\r\n\r\n"));
        assert_eq!(text.matches("Host:").count(), 1);
    }

    #[test]
    fn test_missing_host() {
        let head = RequestHead::parse(b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\n\r\n").unwrap();
        assert_eq!(head.host(), None);

        let absolute = RequestHead::parse(b"GET http://chat.test:8080/ws HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(absolute.host().as_deref(), Some("chat.test:8080"));
    }

    #[test]
    fn test_response_from_head() {
        let response = response_from_head(
            b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: abc\r\n\r\n",
        )
        .unwrap();
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(response.headers()["sec-websocket-accept"], "abc");
    }

    #[test]
    fn test_from_parts_keeps_origin_form_target() {
        let req = Request::builder()
            .uri("/ws?x=1")
            .header(HOST, "chat.test")
            .body(())
            .unwrap();
        let (parts, _) = req.into_parts();
        let head = RequestHead::from_parts(&parts);
        assert_eq!(head.target, "/ws?x=1");
        assert_eq!(head.host().as_deref(), Some("chat.test"));
    }
}
