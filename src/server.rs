use crate::certificate::ServerIdentity;
use crate::config::{Config, Connectivity};
use crate::error::ProxyError;
use crate::resolver::ProxyEnvironment;
use crate::router::{ConnectionInfo, Router};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

/// Bound HTTP and optional HTTPS listeners sharing one router.
pub struct Server {
    router: Arc<Router>,
    http: TcpListener,
    https: Option<(TcpListener, TlsAcceptor)>,
}

impl Server {
    pub async fn bind(config: &Config, env: ProxyEnvironment) -> Result<Self, ProxyError> {
        config.validate()?;
        let connectivity = Connectivity::from_config(config)?;
        let identity = ServerIdentity::for_mode(
            config.ssl,
            config.ssl_crt.as_deref(),
            config.ssl_key.as_deref(),
            &config.cert_domain,
        )?;

        let router = Arc::new(Router::new(&connectivity, env));

        let http = TcpListener::bind(config.http_addr()).await.map_err(|e| {
            ProxyError::Config(format!("Failed to bind HTTP listener on {}: {}", config.http_addr(), e))
        })?;
        info!("HTTP server listening on {}", http.local_addr()?);

        let https = match identity {
            Some(identity) => {
                let acceptor = TlsAcceptor::from(Arc::new(identity.into_server_config()?));
                let listener = TcpListener::bind(config.https_addr()).await.map_err(|e| {
                    ProxyError::Config(format!("Failed to bind HTTPS listener on {}: {}", config.https_addr(), e))
                })?;
                info!("HTTPS server listening on {}", listener.local_addr()?);
                Some((listener, acceptor))
            }
            None => None,
        };

        Ok(Self { router, http, https })
    }

    pub fn http_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.http.local_addr()?)
    }

    pub fn https_addr(&self) -> Option<SocketAddr> {
        self.https.as_ref().and_then(|(l, _)| l.local_addr().ok())
    }

    /// Accepts connections until a listener fails.
    pub async fn run(self) -> Result<(), ProxyError> {
        let plain = serve_plain(self.http, self.router.clone());
        match self.https {
            Some((listener, acceptor)) => {
                tokio::select! {
                    result = plain => result,
                    result = serve_tls(listener, acceptor, self.router) => result,
                }
            }
            None => plain.await,
        }
    }
}

async fn serve_plain(listener: TcpListener, router: Arc<Router>) -> Result<(), ProxyError> {
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!("Accepted connection from {}", peer);
        let router = router.clone();
        tokio::spawn(async move {
            let info = ConnectionInfo {
                peer: Some(peer),
                tls: false,
            };
            router.serve_connection(stream, info).await;
        });
    }
}

async fn serve_tls(listener: TcpListener, acceptor: TlsAcceptor, router: Arc<Router>) -> Result<(), ProxyError> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let acceptor = acceptor.clone();
        let router = router.clone();
        tokio::spawn(async move {
            match acceptor.accept(stream).await {
                Ok(tls_stream) => {
                    let info = ConnectionInfo {
                        peer: Some(peer),
                        tls: true,
                    };
                    router.serve_connection(tls_stream, info).await;
                }
                Err(e) => warn!("Error establishing TLS connection from {}: {}", peer, e),
            }
        });
    }
}
