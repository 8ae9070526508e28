//! Network-namespace scoping: interception applies only to tasks whose
//! net-namespace inode matches the one captured at attach time.

use std::os::unix::fs::MetadataExt;

/// Inode of `/proc/<pid>/ns/net`.
pub fn net_namespace_inode(pid: i32) -> std::io::Result<u64> {
    let meta = std::fs::metadata(format!("/proc/{pid}/ns/net"))?;
    Ok(meta.ino())
}
