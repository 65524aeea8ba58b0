pub mod certificate;
pub mod config;
pub mod decision;
pub mod error;
pub mod forwarder;
pub mod logging;
pub mod pipe;
pub mod resolver;
pub mod response;
pub mod rewind;
pub mod router;
pub mod server;
pub mod status_line;
pub mod tls;
pub mod websocket;

pub use config::{Config, Connectivity};
pub use error::ProxyError;
pub use router::Router;
pub use server::Server;
