use crate::config::Connectivity;
use crate::decision::{ForwardingDecision, Scheme};
use crate::error::{ProxyError, is_benign_error};
use crate::resolver::{ProxyChain, basic_credentials};
use crate::response::{BoxError, ProxyBody};
use crate::tls::UpstreamStream;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, SizeHint};
use hyper::header::{HOST, HeaderMap, HeaderName, HeaderValue, PROXY_AUTHORIZATION};
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use log::{debug, info, warn};
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep, sleep_until, timeout_at};
use tower_service::Service;

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

pub struct HttpForwarder {
    client: Client<UpstreamConnector, ProxyBody>,
    chain: Arc<ProxyChain>,
    request_timeout: Duration,
}

impl HttpForwarder {
    pub fn new(chain: Arc<ProxyChain>, connectivity: &Connectivity) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(connectivity.pool_idle_timeout)
            .pool_max_idle_per_host(connectivity.pool_max_idle_per_host)
            .pool_timer(TokioTimer::new())
            .build(UpstreamConnector::new(chain.clone()));

        Self {
            client,
            chain,
            request_timeout: connectivity.request_timeout,
        }
    }

    /// Sends `req` to the decision's target and streams the upstream response back.
    ///
    /// One deadline covers the whole exchange: a response body still streaming
    /// when it passes is cut off with an error.
    pub async fn forward<B>(
        &self,
        req: Request<B>,
        decision: &ForwardingDecision,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes, Error = hyper::Error> + Send + 'static,
    {
        let (parts, body) = req.into_parts();
        let uri = decision.target_uri()?;
        let mut headers = forwarded_headers(&parts.headers, decision, client_addr.map(|a| a.ip()))?;
        if let Ok(Some(proxy)) = self.chain.forward_proxy_for(decision.scheme, &decision.host) {
            if let Some(auth) = basic_credentials(&proxy) {
                let value = HeaderValue::from_str(&auth)
                    .map_err(|e| ProxyError::Construction(format!("invalid proxy credentials: {}", e)))?;
                headers.insert(PROXY_AUTHORIZATION, value);
            }
        }

        let body = body.map_err(|e| Box::new(e) as BoxError).boxed_unsync();
        let mut outbound = Request::new(body);
        *outbound.method_mut() = parts.method.clone();
        *outbound.uri_mut() = uri.clone();
        *outbound.headers_mut() = headers;

        info!("Forwarding to: {} (Host: {})", uri, decision.original_host);

        let deadline = Instant::now() + self.request_timeout;
        let response = timeout_at(deadline, self.client.request(outbound))
            .await
            .map_err(|_| ProxyError::Timeout(self.request_timeout.as_secs()))?
            .map_err(|e| ProxyError::Upstream(error_chain(&e)))?;

        let (parts_out, body) = response.into_parts();
        let body = LoggedBody::new(body, parts.method, parts.uri.path().to_string(), parts_out.status)
            .with_deadline(deadline, self.request_timeout);
        Ok(Response::from_parts(parts_out, body.boxed_unsync()))
    }
}

/// Outbound headers: every inbound header verbatim, `Host` pinned to the
/// client-visible host and the `X-Forwarded-*` trio set.
pub fn forwarded_headers(
    inbound: &HeaderMap,
    decision: &ForwardingDecision,
    client_ip: Option<IpAddr>,
) -> Result<HeaderMap, ProxyError> {
    let mut headers = inbound.clone();

    let host = HeaderValue::from_str(&decision.original_host)
        .map_err(|e| ProxyError::Construction(format!("invalid Host {:?}: {}", decision.original_host, e)))?;
    headers.insert(HOST, host.clone());

    if let Some(ip) = client_ip {
        let prior = headers
            .get(&X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty());
        let chain = match prior {
            Some(prior) => format!("{}, {}", prior, ip),
            None => ip.to_string(),
        };
        let value = HeaderValue::from_str(&chain)
            .map_err(|e| ProxyError::Construction(format!("invalid X-Forwarded-For: {}", e)))?;
        headers.insert(X_FORWARDED_FOR, value);
    }

    headers.insert(
        X_FORWARDED_PROTO,
        HeaderValue::from_static(decision.inbound_scheme.as_str()),
    );
    headers.insert(X_FORWARDED_HOST, host);
    Ok(headers)
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Dials pooled upstream connections through the proxy chain.
#[derive(Clone)]
pub struct UpstreamConnector {
    chain: Arc<ProxyChain>,
}

impl UpstreamConnector {
    pub fn new(chain: Arc<ProxyChain>) -> Self {
        Self { chain }
    }
}

impl Service<Uri> for UpstreamConnector {
    type Response = UpstreamIo;
    type Error = ProxyError;
    type Future = Pin<Box<dyn Future<Output = Result<UpstreamIo, ProxyError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let chain = self.chain.clone();
        Box::pin(async move {
            let scheme = uri
                .scheme_str()
                .and_then(Scheme::parse)
                .ok_or_else(|| ProxyError::Construction(format!("unsupported scheme in {}", uri)))?;
            let authority = uri
                .authority()
                .map(|a| a.as_str().to_string())
                .ok_or_else(|| ProxyError::Construction(format!("no host in {}", uri)))?;

            // Plain http behind an HTTP proxy is sent to the proxy in absolute form
            if let Some(proxy) = chain.forward_proxy_for(scheme, &authority)? {
                let raw = chain.connect_proxy(&proxy).await?;
                debug!(
                    "Opened pooled connection to proxy {}:{} for {}",
                    proxy.host_str().unwrap_or("?"),
                    proxy.port_or_known_default().unwrap_or(0),
                    authority
                );
                return Ok(UpstreamIo::new(UpstreamStream::Plain(raw), true));
            }

            // SNI names the host actually dialed
            let stream = chain.connect(scheme, &authority, &authority).await?;
            debug!("Opened pooled connection to {} (tls: {})", authority, stream.is_tls());
            Ok(UpstreamIo::new(stream, false))
        })
    }
}

/// Upstream stream as seen by the hyper client.
pub struct UpstreamIo {
    inner: TokioIo<UpstreamStream>,
    /// Connected to a forward proxy rather than the target.
    proxied: bool,
}

impl UpstreamIo {
    fn new(stream: UpstreamStream, proxied: bool) -> Self {
        Self {
            inner: TokioIo::new(stream),
            proxied,
        }
    }
}

impl Connection for UpstreamIo {
    fn connected(&self) -> Connected {
        Connected::new().proxy(self.proxied)
    }
}

impl hyper::rt::Read for UpstreamIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl hyper::rt::Write for UpstreamIo {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Response body that counts relayed bytes and logs how the relay ended.
pub struct LoggedBody<B> {
    inner: B,
    method: Method,
    path: String,
    status: StatusCode,
    bytes: u64,
    finished: bool,
    failed: bool,
    deadline: Option<Pin<Box<Sleep>>>,
    limit: Duration,
}

impl<B> LoggedBody<B> {
    pub fn new(inner: B, method: Method, path: String, status: StatusCode) -> Self {
        Self {
            inner,
            method,
            path,
            status,
            bytes: 0,
            finished: false,
            failed: false,
            deadline: None,
            limit: Duration::ZERO,
        }
    }

    /// Ends the body with a timeout error once `deadline` passes.
    pub fn with_deadline(mut self, deadline: Instant, limit: Duration) -> Self {
        self.deadline = Some(Box::pin(sleep_until(deadline)));
        self.limit = limit;
        self
    }
}

impl<B> Body for LoggedBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        if let Some(deadline) = this.deadline.as_mut() {
            if deadline.as_mut().poll(cx).is_ready() {
                this.deadline = None;
                this.failed = true;
                warn!(
                    "Response body for {} {} cut off after {} bytes: request timeout reached",
                    this.method, this.path, this.bytes
                );
                return Poll::Ready(Some(Err(Box::new(ProxyError::Timeout(this.limit.as_secs())))));
            }
        }

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.bytes += data.len() as u64;
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                let e: BoxError = e.into();
                this.failed = true;
                if is_benign_error(&*e) {
                    debug!("Response body for {} {} ended early: {}", this.method, this.path, e);
                } else {
                    warn!("Copy response body failed: {}", e);
                }
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finished = true;
                this.deadline = None;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B> Drop for LoggedBody<B> {
    fn drop(&mut self) {
        if self.failed {
            return;
        }
        if self.finished || self.bytes == 0 {
            info!(
                "Request finished: {} {} -> {} ({} bytes)",
                self.method,
                self.path,
                self.status.as_u16(),
                self.bytes
            );
        } else {
            debug!(
                "Client went away during {} {} after {} bytes",
                self.method, self.path, self.bytes
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::FixedUpstream;
    use http_body_util::{Full, StreamBody};
    use tokio::time::timeout;

    fn decision(host: &str, tls: bool, fixed: Option<&FixedUpstream>) -> ForwardingDecision {
        let uri: Uri = "/path?q=1".parse().unwrap();
        ForwardingDecision::for_http(host, tls, &uri, fixed).unwrap()
    }

    #[test]
    fn test_host_stays_original_with_fixed_upstream() {
        let fixed = FixedUpstream::parse("https://192.168.1.1");
        let d = decision("app.example.com", false, Some(&fixed));
        let mut inbound = HeaderMap::new();
        inbound.insert(HOST, HeaderValue::from_static("app.example.com"));
        inbound.append("accept", HeaderValue::from_static("text/html"));
        inbound.append("accept", HeaderValue::from_static("application/json"));

        let headers = forwarded_headers(&inbound, &d, Some("10.0.0.9".parse().unwrap())).unwrap();
        assert_eq!(headers[HOST], "app.example.com");
        assert_eq!(headers[X_FORWARDED_HOST], "app.example.com");
        assert_eq!(headers[X_FORWARDED_PROTO], "http");
        assert_eq!(headers[X_FORWARDED_FOR], "10.0.0.9");
        assert_eq!(headers.get_all("accept").iter().count(), 2);
    }

    #[test]
    fn test_forwarded_for_accumulates() {
        let d = decision("site.test", false, None);
        let mut inbound = HeaderMap::new();
        inbound.insert(X_FORWARDED_FOR, HeaderValue::from_static("1.1.1.1"));

        let headers = forwarded_headers(&inbound, &d, Some("2.2.2.2".parse().unwrap())).unwrap();
        assert_eq!(headers[X_FORWARDED_FOR], "1.1.1.1, 2.2.2.2");
    }

    #[test]
    fn test_port_443_host_reports_https() {
        let d = decision("example.com:443", false, None);
        let headers = forwarded_headers(&HeaderMap::new(), &d, None).unwrap();
        assert_eq!(headers[X_FORWARDED_PROTO], "https");
        assert!(headers.get(X_FORWARDED_FOR).is_none());
    }

    #[test]
    fn test_error_chain_includes_sources() {
        let inner = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let outer = ProxyError::Io(inner);
        assert_eq!(error_chain(&outer), "IO error: refused: refused");
    }

    #[tokio::test]
    async fn test_logged_body_counts_bytes() {
        let inner = Full::new(Bytes::from_static(b"hello world"));
        let mut body = LoggedBody::new(inner, Method::GET, "/".to_string(), StatusCode::OK);
        while let Some(frame) = body.frame().await {
            frame.unwrap();
        }
        assert_eq!(body.bytes, 11);
        assert!(body.finished);
    }

    #[tokio::test]
    async fn test_logged_body_stops_at_deadline() {
        let stalled = StreamBody::new(futures::stream::pending::<Result<Frame<Bytes>, hyper::Error>>());
        let mut body = LoggedBody::new(stalled, Method::GET, "/slow".to_string(), StatusCode::OK)
            .with_deadline(Instant::now() + Duration::from_millis(50), Duration::from_secs(1));

        let frame = timeout(Duration::from_secs(2), body.frame())
            .await
            .expect("deadline did not end the body");
        let err = frame.unwrap().unwrap_err();
        assert!(err.to_string().contains("timed out"), "unexpected error: {}", err);
        assert!(body.failed);
    }

    #[tokio::test]
    async fn test_logged_body_finishing_before_deadline() {
        let inner = Full::new(Bytes::from_static(b"fast"));
        let mut body = LoggedBody::new(inner, Method::GET, "/".to_string(), StatusCode::OK)
            .with_deadline(Instant::now() + Duration::from_secs(5), Duration::from_secs(5));
        let collected = (&mut body).collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"fast");
        assert!(body.finished);
        assert!(!body.failed);
    }
}
