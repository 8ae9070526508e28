//! The parrot proxy: accepts redirected connections, classifies the
//! protocol, and records or replays the traffic per session.

pub mod config;
pub mod generic;
pub mod http;
pub mod mysql;
pub mod orchestrator;
pub mod proxy;
pub mod session;
pub mod sniff;
pub mod stream;
pub mod tls;
pub mod util;

pub use config::ProxyConfig;
pub use proxy::Proxy;
pub use session::{Session, Sessions};
