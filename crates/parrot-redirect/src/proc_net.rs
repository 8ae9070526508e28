//! `/proc` plumbing: map a tracee's socket fd to the local port the kernel
//! assigned during `connect`.

use std::io;

/// Inode behind `/proc/<pid>/fd/<fd>` when it is a socket.
pub(crate) fn socket_inode(pid: i32, fd: i32) -> io::Result<Option<u64>> {
    let link = std::fs::read_link(format!("/proc/{pid}/fd/{fd}"))?;
    let name = link.to_string_lossy();
    let inode = name
        .strip_prefix("socket:[")
        .and_then(|rest| rest.strip_suffix(']'))
        .and_then(|num| num.parse::<u64>().ok());
    Ok(inode)
}

/// Scan `/proc/<pid>/net/tcp` and `tcp6` for the socket inode and return
/// its local port.
pub(crate) fn local_port_of_inode(pid: i32, inode: u64) -> io::Result<Option<u16>> {
    for file in ["tcp", "tcp6"] {
        let content = std::fs::read_to_string(format!("/proc/{pid}/net/{file}"))?;
        if let Some(port) = find_port(&content, inode) {
            return Ok(Some(port));
        }
    }
    Ok(None)
}

fn find_port(proc_net_tcp: &str, inode: u64) -> Option<u16> {
    // Format: "sl local_address rem_address st ... uid timeout inode ..."
    for line in proc_net_tcp.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        let Ok(entry_inode) = fields[9].parse::<u64>() else {
            continue;
        };
        if entry_inode != inode {
            continue;
        }
        let port_hex = fields[1].rsplit(':').next()?;
        return u16::from_str_radix(port_hex, 16).ok();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:C68A 0100007F:0CEA 01 00000000:00000000 00:00000000 00000000  1000        0 424242 1 0000000000000000 20 4 30 10 -1
   1: 00000000:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 31337 1 0000000000000000 100 0 0 10 0";

    #[test]
    fn parses_local_port_by_inode() {
        assert_eq!(find_port(SAMPLE, 424242), Some(0xC68A));
        assert_eq!(find_port(SAMPLE, 31337), Some(8080));
        assert_eq!(find_port(SAMPLE, 1), None);
    }
}
