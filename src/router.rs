use crate::config::Connectivity;
use crate::decision::{FixedUpstream, ForwardingDecision};
use crate::error::{ProxyError, is_benign_error};
use crate::forwarder::HttpForwarder;
use crate::resolver::{ProxyChain, ProxyEnvironment};
use crate::response::{ProxyBody, ResponseBuilder};
use crate::rewind::{Rewind, read_head};
use crate::websocket::{INTERNAL_SERVER_ERROR, RequestHead, WebSocketBridge, is_websocket_upgrade};
use bytes::BytesMut;
use futures::FutureExt;
use hyper::body::Incoming;
use hyper::header::HOST;
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, error, info, warn};
use std::any::Any;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Largest first request head sniffed before handing the connection to hyper.
const MAX_SNIFF: usize = 16 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct ConnectionInfo {
    pub peer: Option<SocketAddr>,
    /// Connection arrived on the HTTPS listener.
    pub tls: bool,
}

pub struct Router {
    forwarder: HttpForwarder,
    bridge: WebSocketBridge,
    fixed: Option<FixedUpstream>,
}

impl Router {
    pub fn new(connectivity: &Connectivity, env: ProxyEnvironment) -> Self {
        let chain = Arc::new(ProxyChain::new(connectivity, env));
        if let Some(fixed) = &connectivity.fixed_upstream {
            info!(
                "All traffic goes to fixed upstream {}{}",
                fixed.scheme.as_deref().map(|s| format!("{}://", s)).unwrap_or_default(),
                fixed.authority
            );
        }

        Self {
            forwarder: HttpForwarder::new(chain.clone(), connectivity),
            bridge: WebSocketBridge::new(chain, connectivity.fixed_upstream.clone()),
            fixed: connectivity.fixed_upstream.clone(),
        }
    }

    /// Serves one inbound connection until it closes.
    ///
    /// The first request head is read here. A WebSocket upgrade takes the raw
    /// socket over; anything else is replayed into an HTTP/1.1 server.
    pub async fn serve_connection<S>(self: Arc<Self>, mut io: S, info: ConnectionInfo)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut buf = BytesMut::with_capacity(4096);
        let head_end = match read_head(&mut io, &mut buf, MAX_SNIFF).await {
            Ok(end) => end,
            Err(e) => {
                debug!("Connection from {:?} failed before a request: {}", info.peer, e);
                return;
            }
        };
        if buf.is_empty() {
            return;
        }

        if let Some(end) = head_end {
            if let Ok(head) = RequestHead::parse(&buf[..end]) {
                if head.is_websocket_upgrade() {
                    let early = buf.split_off(end).freeze();
                    let mut client = Rewind::new(early, io);
                    let session = AssertUnwindSafe(self.bridge.bridge_hijacked(&mut client, head, info.tls))
                        .catch_unwind()
                        .await;
                    recover_hijacked(&mut client, session).await;
                    return;
                }
            }
        }

        let io = Rewind::new(buf.freeze(), io);
        let router = self.clone();
        let service = service_fn(move |req| {
            let router = router.clone();
            async move { Ok::<_, Infallible>(router.dispatch(req, info).await) }
        });

        if let Err(e) = ServerBuilder::new()
            .keep_alive(true)
            .serve_connection(TokioIo::new(io), service)
            .with_upgrades()
            .await
        {
            if is_benign_error(&e) {
                debug!("Connection from {:?} closed: {}", info.peer, e);
            } else {
                warn!("Error serving connection from {:?}: {}", info.peer, e);
            }
        }
    }

    /// Handles one request; never fails.
    pub async fn dispatch(&self, req: Request<Incoming>, info: ConnectionInfo) -> Response<ProxyBody> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        guarded(self.handle(req, info), |e| {
            if e.status_code() == StatusCode::BAD_REQUEST {
                warn!("{} {} rejected: {}", method, path, e);
            } else {
                error!("{} {} failed: {}", method, path, e);
            }
        })
        .await
    }

    async fn handle(&self, req: Request<Incoming>, info: ConnectionInfo) -> Result<Response<ProxyBody>, ProxyError> {
        let host = original_host(&req);
        info!(
            "Request start: {} {} (Host: {})",
            req.method(),
            req.uri().path(),
            host.as_deref().unwrap_or("")
        );

        if is_websocket_upgrade(req.headers()) {
            return self.bridge.bridge_upgrade(req, info.tls).await;
        }

        let host = host.ok_or(ProxyError::MissingHost)?;
        let decision = ForwardingDecision::for_http(&host, info.tls, req.uri(), self.fixed.as_ref())?;
        self.forwarder.forward(req, &decision, info.peer).await
    }
}

/// Runs a request handler, turning its error or panic into a response.
pub async fn guarded<F, L>(handler: F, on_error: L) -> Response<ProxyBody>
where
    F: Future<Output = Result<Response<ProxyBody>, ProxyError>>,
    L: FnOnce(&ProxyError),
{
    match AssertUnwindSafe(handler).catch_unwind().await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            on_error(&e);
            ResponseBuilder::from_error(&e)
        }
        Err(panic) => {
            error!("PANIC: {}", panic_message(panic.as_ref()));
            ResponseBuilder::internal_server_error()
        }
    }
}

/// Answers a hijacked client with a bare 500 if its bridge panicked.
pub async fn recover_hijacked<C>(client: &mut C, session: std::thread::Result<()>)
where
    C: AsyncWrite + Unpin,
{
    if let Err(panic) = session {
        error!("PANIC in WebSocket bridge: {}", panic_message(panic.as_ref()));
        let _ = client.write_all(INTERNAL_SERVER_ERROR).await;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

/// `Host` header, or the authority of an absolute-form request target.
pub fn original_host<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))
        .filter(|h| !h.is_empty())
}
