use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use parrot_model::NetworkAddress;

use crate::RedirectorError;

/// Shared `source port -> original destination` map. Inserts happen on the
/// tracer thread, lookups and releases on proxy tasks; a port is never
/// reused by the kernel while its entry is live, so a plain locked map is
/// enough.
#[derive(Debug, Default)]
pub struct RedirectTable {
    entries: Mutex<HashMap<u16, NetworkAddress>>,
}

impl RedirectTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, src_port: u16, app_id: u64, ip: IpAddr, port: u16) {
        let mut entries = self.entries.lock().expect("redirect table poisoned");
        entries.insert(src_port, NetworkAddress::new(app_id, ip, port));
    }

    /// The destination the app originally dialed from `src_port`.
    pub fn lookup(&self, src_port: u16) -> Result<NetworkAddress, RedirectorError> {
        let entries = self.entries.lock().expect("redirect table poisoned");
        entries
            .get(&src_port)
            .copied()
            .ok_or(RedirectorError::NotFound { src_port })
    }

    /// Drop the entry once the proxy has consumed it. Safe to call twice —
    /// the close paths of both stream halves may race here.
    pub fn release(&self, src_port: u16) {
        let mut entries = self.entries.lock().expect("redirect table poisoned");
        entries.remove(&src_port);
    }

    /// Remove every entry belonging to a session; used on session stop so
    /// cancellation leaves no residue.
    pub fn purge_app(&self, app_id: u64) {
        let mut entries = self.entries.lock().expect("redirect table poisoned");
        entries.retain(|_, addr| addr.app_id != app_id);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("redirect table poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    #[test]
    fn lookup_roundtrip() {
        let table = RedirectTable::new();
        table.insert(50123, 1, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)), 3306);
        let addr = table.lookup(50123).unwrap();
        assert_eq!(addr.port, 3306);
        assert_eq!(addr.app_id, 1);
        assert_eq!(addr.ip_version(), 4);
    }

    #[test]
    fn unknown_port_is_not_found() {
        let table = RedirectTable::new();
        let err = table.lookup(1).unwrap_err();
        assert!(matches!(
            err,
            RedirectorError::NotFound { src_port: 1 }
        ));
    }

    #[test]
    fn release_is_idempotent() {
        let table = RedirectTable::new();
        table.insert(40000, 1, IpAddr::V4(Ipv4Addr::LOCALHOST), 80);
        table.release(40000);
        table.release(40000);
        assert!(table.lookup(40000).is_err());
        assert!(table.is_empty());
    }

    #[test]
    fn purge_removes_only_that_app() {
        let table = RedirectTable::new();
        table.insert(40001, 1, IpAddr::V4(Ipv4Addr::LOCALHOST), 80);
        table.insert(40002, 2, IpAddr::V4(Ipv4Addr::LOCALHOST), 443);
        table.purge_app(1);
        assert!(table.lookup(40001).is_err());
        assert!(table.lookup(40002).is_ok());
    }

    #[test]
    fn concurrent_insert_release() {
        let table = Arc::new(RedirectTable::new());
        let mut handles = Vec::new();
        for t in 0u16..8 {
            let table = Arc::clone(&table);
            handles.push(std::thread::spawn(move || {
                for i in 0u16..100 {
                    let port = 10_000 + t * 100 + i;
                    table.insert(port, u64::from(t), IpAddr::V4(Ipv4Addr::LOCALHOST), 80);
                    assert!(table.lookup(port).is_ok());
                    table.release(port);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(table.is_empty());
    }
}
