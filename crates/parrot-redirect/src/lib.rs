//! Transparent `connect(2)` redirection for a traced process tree.
//!
//! The tracer follows the application and all of its children via ptrace.
//! On every outbound `connect` from the monitored network namespace it
//! records the original destination, rewrites the syscall's sockaddr to
//! point at the local proxy, and — once the kernel has picked the ephemeral
//! source port — publishes `src_port -> original destination` in the
//! [`RedirectTable`] the proxy consults on accept.
//!
//! `release` is mandatory: the proxy must drop the entry on every
//! connection close path or the table leaks.

pub mod table;

#[cfg(target_os = "linux")]
pub mod ns;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod proc_net;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod tracer;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use tracer::{kill_root, Redirector, RedirectorHandle};

pub use table::RedirectTable;

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddrV4, SocketAddrV6};

use thiserror::Error;

/// What the tracer needs to know to redirect: where the proxy listens and
/// which destinations it must leave alone.
#[derive(Debug, Clone)]
pub struct RedirectCfg {
    /// Session this tracer feeds; stamped on every table entry.
    pub app_id: u64,
    pub proxy_v4: SocketAddrV4,
    /// IPv6 listener; v6 connects are rewritten here (the v4 listener
    /// mapped into v6 when no native v6 listener exists).
    pub proxy_v6: Option<SocketAddrV6>,
    /// Loopback address handed out by DNS while the app runs redirected,
    /// kept so HTTPS handlers can restore the SNI host.
    pub dns_loopback: Ipv4Addr,
    /// Destination ports that bypass interception entirely.
    pub passthrough_ports: BTreeSet<u16>,
}

#[derive(Debug, Error)]
pub enum RedirectorError {
    /// The accepting proxy saw a source port the tracer never recorded —
    /// the connection came from outside the monitored namespace.
    #[error("no redirect entry for source port {src_port}")]
    NotFound { src_port: u16 },
    #[error("ptrace: {0}")]
    Ptrace(String),
    #[error("tracee is gone (pid {pid})")]
    TraceeExited { pid: i32 },
    #[error("unsupported platform: the redirector requires x86_64 linux")]
    Unsupported,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
