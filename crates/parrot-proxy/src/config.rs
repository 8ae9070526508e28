use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

/// Proxy configuration, env-driven with defaults. Every knob has a
/// `PARROT_*` variable; unset or unparsable values fall back silently.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Where redirected connections land.
    pub listen_addr: SocketAddr,
    /// Loopback address the DNS layer hands to the app under redirection;
    /// HTTPS handlers use it to recognize SNI-preserving dials.
    pub dns_loopback: Ipv4Addr,
    /// How long to wait for client-first bytes before treating the flow as
    /// server-speaks-first (MySQL).
    pub sniff_timeout: Duration,
    /// Inter-chunk inactivity timeout for chunked HTTP reads.
    pub chunk_timeout: Duration,
    /// Buffer sizes of the capture channels.
    pub mock_buffer: usize,
    pub testcase_buffer: usize,
    /// Persisted CA material for TLS termination; both set or both unset.
    pub ca_cert_path: Option<PathBuf>,
    pub ca_key_path: Option<PathBuf>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 16789)),
            dns_loopback: Ipv4Addr::new(127, 0, 0, 1),
            sniff_timeout: Duration::from_millis(500),
            chunk_timeout: Duration::from_secs(5),
            mock_buffer: 512,
            testcase_buffer: 128,
            ca_cert_path: None,
            ca_key_path: None,
        }
    }
}

impl ProxyConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let listen_addr = std::env::var("PARROT_PROXY_LISTEN_ADDR")
            .ok()
            .and_then(|v| v.parse::<SocketAddr>().ok())
            .unwrap_or(defaults.listen_addr);

        let dns_loopback = std::env::var("PARROT_DNS_LOOPBACK")
            .ok()
            .and_then(|v| v.parse::<Ipv4Addr>().ok())
            .unwrap_or(defaults.dns_loopback);

        let sniff_timeout = std::env::var("PARROT_SNIFF_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.sniff_timeout);

        let chunk_timeout = std::env::var("PARROT_CHUNK_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.chunk_timeout);

        let mock_buffer = std::env::var("PARROT_MOCK_BUFFER")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults.mock_buffer);

        let testcase_buffer = std::env::var("PARROT_TESTCASE_BUFFER")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults.testcase_buffer);

        let ca_cert_path = std::env::var("PARROT_CA_CERT")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);
        let ca_key_path = std::env::var("PARROT_CA_KEY")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        Self {
            listen_addr,
            dns_loopback,
            sniff_timeout,
            chunk_timeout,
            mock_buffer,
            testcase_buffer,
            ca_cert_path,
            ca_key_path,
        }
    }
}
