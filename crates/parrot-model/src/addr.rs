use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// The destination an instrumented application originally passed to
/// `connect(2)`, recovered by the redirector and keyed by the connection's
/// source port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAddress {
    pub app_id: u64,
    pub ip: IpAddr,
    pub port: u16,
}

impl NetworkAddress {
    pub fn new(app_id: u64, ip: IpAddr, port: u16) -> Self {
        Self { app_id, ip, port }
    }

    pub fn ip_version(&self) -> u8 {
        match self.ip {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 6,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl std::fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} (app {})", self.ip, self.port, self.app_id)
    }
}
