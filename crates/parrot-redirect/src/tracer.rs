//! The ptrace engine: follow the process tree, rewrite `connect`.

use std::collections::{BTreeMap, HashMap};
use std::ffi::CString;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::libc;
use nix::sys::ptrace;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execvp, fork, ForkResult, Pid};
use tracing::{debug, trace, warn};

use crate::ns::net_namespace_inode;
use crate::proc_net::{local_port_of_inode, socket_inode};
use crate::table::RedirectTable;
use crate::{RedirectCfg, RedirectorError};

const SYS_CONNECT: u64 = 42; // x86_64

const AF_INET: u16 = libc::AF_INET as u16;
const AF_INET6: u16 = libc::AF_INET6 as u16;

const SOCKADDR_IN_LEN: usize = 16;
const SOCKADDR_IN6_LEN: usize = 28;

/// Entry point for instrumenting a process tree.
pub struct Redirector;

/// Kill the traced tree's root. Used by orchestrators that are blocked on
/// `join` from another task and cannot call `stop`.
pub fn kill_root(pid: i32) {
    let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
}

impl Redirector {
    /// Fork and exec `program` under trace. The child raises SIGSTOP before
    /// exec so the tracer can install its options first (the classic
    /// traceme handoff).
    pub fn launch(
        program: &str,
        args: &[String],
        cfg: RedirectCfg,
        table: Arc<RedirectTable>,
    ) -> Result<RedirectorHandle, RedirectorError> {
        let program_c =
            CString::new(program).map_err(|_| RedirectorError::Ptrace("NUL in program".into()))?;
        let mut argv = vec![program_c.clone()];
        for arg in args {
            argv.push(
                CString::new(arg.as_str())
                    .map_err(|_| RedirectorError::Ptrace("NUL in argument".into()))?,
            );
        }

        match unsafe { fork() }.map_err(|e| RedirectorError::Ptrace(e.to_string()))? {
            ForkResult::Child => {
                // In the child: request tracing, pause for the parent, exec.
                let _ = ptrace::traceme();
                let _ = kill(Pid::this(), Signal::SIGSTOP);
                let _ = execvp(&program_c, &argv);
                std::process::exit(127);
            }
            ForkResult::Parent { child } => Self::supervise(child, cfg, table),
        }
    }

    /// Attach to an already-running process tree rooted at `pid`.
    pub fn attach(
        pid: i32,
        cfg: RedirectCfg,
        table: Arc<RedirectTable>,
    ) -> Result<RedirectorHandle, RedirectorError> {
        let root = Pid::from_raw(pid);
        ptrace::attach(root).map_err(|e| RedirectorError::Ptrace(e.to_string()))?;
        Self::supervise(root, cfg, table)
    }

    fn supervise(
        root: Pid,
        cfg: RedirectCfg,
        table: Arc<RedirectTable>,
    ) -> Result<RedirectorHandle, RedirectorError> {
        // First stop: the SIGSTOP from the handoff (or from PTRACE_ATTACH).
        match waitpid(root, None).map_err(|e| RedirectorError::Ptrace(e.to_string()))? {
            WaitStatus::Stopped(_, _) => {}
            status => {
                return Err(RedirectorError::Ptrace(format!(
                    "unexpected initial wait status {status:?}"
                )))
            }
        }

        ptrace::setoptions(
            root,
            ptrace::Options::PTRACE_O_TRACECLONE
                | ptrace::Options::PTRACE_O_TRACEFORK
                | ptrace::Options::PTRACE_O_TRACEVFORK
                | ptrace::Options::PTRACE_O_TRACEEXEC
                | ptrace::Options::PTRACE_O_TRACESYSGOOD,
        )
        .map_err(|e| RedirectorError::Ptrace(e.to_string()))?;

        let namespace_inode = net_namespace_inode(root.as_raw())?;

        ptrace::syscall(root, None).map_err(|e| RedirectorError::Ptrace(e.to_string()))?;

        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let stop = Arc::clone(&stop);
            let table = Arc::clone(&table);
            std::thread::Builder::new()
                .name("parrot-redirect".into())
                .spawn(move || {
                    let mut engine = Engine {
                        cfg,
                        table,
                        namespace_inode,
                        root,
                        pending: HashMap::new(),
                        stop,
                    };
                    engine.run()
                })?
        };

        Ok(RedirectorHandle {
            root,
            table,
            stop,
            thread: Some(thread),
        })
    }
}

/// Owns the tracer thread. Dropping it stops the traced tree: the app's
/// lifetime is bounded by its session.
pub struct RedirectorHandle {
    root: Pid,
    table: Arc<RedirectTable>,
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<i32>>,
}

impl RedirectorHandle {
    pub fn root_pid(&self) -> i32 {
        self.root.as_raw()
    }

    pub fn table(&self) -> Arc<RedirectTable> {
        Arc::clone(&self.table)
    }

    /// Block until the traced tree exits; returns the root's exit code
    /// (-1 when killed by signal).
    pub fn join(mut self) -> i32 {
        match self.thread.take() {
            Some(thread) => thread.join().unwrap_or(-1),
            None => -1,
        }
    }

    /// Kill the traced tree and reap the tracer thread.
    pub fn stop(mut self) {
        self.stop_inner();
    }

    fn stop_inner(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = kill(self.root, Signal::SIGKILL);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for RedirectorHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop_inner();
        }
    }
}

struct PendingConnect {
    fd: i32,
    dest: SocketAddr,
}

struct Engine {
    cfg: RedirectCfg,
    table: Arc<RedirectTable>,
    namespace_inode: u64,
    root: Pid,
    pending: HashMap<Pid, PendingConnect>,
    stop: Arc<AtomicBool>,
}

impl Engine {
    /// Main wait loop; returns the root's exit code.
    fn run(&mut self) -> i32 {
        let mut alive: BTreeMap<Pid, ()> = BTreeMap::new();
        alive.insert(self.root, ());
        let mut root_code = -1;

        while !alive.is_empty() {
            if self.stop.load(Ordering::SeqCst) {
                for pid in alive.keys() {
                    let _ = kill(*pid, Signal::SIGKILL);
                }
            }

            let status = match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL)) {
                Ok(status) => status,
                Err(nix::errno::Errno::ECHILD) => break,
                Err(err) => {
                    warn!("waitpid failed: {err}");
                    break;
                }
            };

            match status {
                WaitStatus::PtraceSyscall(pid) => {
                    alive.entry(pid).or_insert(());
                    if let Err(err) = self.on_syscall_stop(pid) {
                        trace!(%pid, "syscall stop handling failed: {err}");
                    }
                    let _ = ptrace::syscall(pid, None);
                }
                WaitStatus::PtraceEvent(pid, _, _) => {
                    alive.entry(pid).or_insert(());
                    let _ = ptrace::syscall(pid, None);
                }
                WaitStatus::Stopped(pid, signal) => {
                    alive.entry(pid).or_insert(());
                    // New tracees announce themselves with SIGSTOP; swallow
                    // it, forward every other signal.
                    let forward = if signal == Signal::SIGSTOP {
                        None
                    } else {
                        Some(signal)
                    };
                    let _ = ptrace::syscall(pid, forward);
                }
                WaitStatus::Exited(pid, code) => {
                    self.pending.remove(&pid);
                    alive.remove(&pid);
                    if pid == self.root {
                        root_code = code;
                    }
                }
                WaitStatus::Signaled(pid, _, _) => {
                    self.pending.remove(&pid);
                    alive.remove(&pid);
                }
                _ => {}
            }
        }

        debug!(app_id = self.cfg.app_id, "tracer loop done");
        root_code
    }

    fn on_syscall_stop(&mut self, pid: Pid) -> Result<(), RedirectorError> {
        let regs = ptrace::getregs(pid).map_err(|e| RedirectorError::Ptrace(e.to_string()))?;
        if regs.orig_rax != SYS_CONNECT {
            return Ok(());
        }
        // At syscall entry rax holds -ENOSYS; anything else is the exit stop.
        let entering = regs.rax as i64 == -(libc::ENOSYS as i64);
        if entering {
            self.on_connect_entry(pid, &regs)
        } else {
            self.on_connect_exit(pid, &regs)
        }
    }

    fn on_connect_entry(
        &mut self,
        pid: Pid,
        regs: &libc::user_regs_struct,
    ) -> Result<(), RedirectorError> {
        let fd = regs.rdi as i32;
        let addr_ptr = regs.rsi;
        let addr_len = regs.rdx as usize;
        if addr_len < 2 || addr_len > 128 {
            return Ok(());
        }

        // Scope check: only the monitored namespace is touched.
        match net_namespace_inode(pid.as_raw()) {
            Ok(inode) if inode == self.namespace_inode => {}
            _ => return Ok(()),
        }

        let raw = read_mem(pid, addr_ptr, addr_len)?;
        let Some(dest) = parse_sockaddr(&raw) else {
            return Ok(());
        };

        if self.should_skip(&dest) {
            trace!(%pid, %dest, "leaving connect untouched");
            return Ok(());
        }

        let rewritten = self.rewrite_target(&dest);
        let new_raw = encode_sockaddr(&rewritten);
        if new_raw.len() > addr_len && new_raw.len() > raw.len() {
            // Cannot grow the caller's buffer; v6 proxy for a v4 sockaddr
            // would need 28 bytes in a 16-byte buffer.
            warn!(%pid, %dest, "sockaddr buffer too small to rewrite; passing through");
            return Ok(());
        }
        write_mem(pid, addr_ptr, &new_raw)?;

        debug!(%pid, fd, orig = %dest, proxy = %rewritten, "rewrote connect");
        self.pending.insert(pid, PendingConnect { fd, dest });
        Ok(())
    }

    fn on_connect_exit(
        &mut self,
        pid: Pid,
        regs: &libc::user_regs_struct,
    ) -> Result<(), RedirectorError> {
        let Some(pending) = self.pending.remove(&pid) else {
            return Ok(());
        };
        let ret = regs.rax as i64;
        if ret != 0 && ret != -i64::from(libc::EINPROGRESS) {
            trace!(%pid, ret, "connect failed; no table entry");
            return Ok(());
        }

        // The kernel has bound the socket now; recover the ephemeral port.
        let Some(inode) = socket_inode(pid.as_raw(), pending.fd)? else {
            return Ok(());
        };
        let Some(src_port) = local_port_of_inode(pid.as_raw(), inode)? else {
            warn!(%pid, fd = pending.fd, "socket inode not found in /proc/net/tcp");
            return Ok(());
        };

        self.table.insert(
            src_port,
            self.cfg.app_id,
            pending.dest.ip(),
            pending.dest.port(),
        );
        debug!(src_port, dest = %pending.dest, "redirect entry published");
        Ok(())
    }

    fn should_skip(&self, dest: &SocketAddr) -> bool {
        if self.cfg.passthrough_ports.contains(&dest.port()) {
            return true;
        }
        // Never intercept traffic already aimed at the proxy.
        let proxy_v4 = SocketAddr::V4(self.cfg.proxy_v4);
        if *dest == proxy_v4 {
            return true;
        }
        if let Some(v6) = self.cfg.proxy_v6 {
            if *dest == SocketAddr::V6(v6) {
                return true;
            }
        }
        false
    }

    fn rewrite_target(&self, dest: &SocketAddr) -> SocketAddr {
        match dest {
            SocketAddr::V4(_) => SocketAddr::V4(self.cfg.proxy_v4),
            SocketAddr::V6(_) => match self.cfg.proxy_v6 {
                Some(v6) => SocketAddr::V6(v6),
                None => {
                    let mapped = self.cfg.proxy_v4.ip().to_ipv6_mapped();
                    SocketAddr::V6(SocketAddrV6::new(
                        mapped,
                        self.cfg.proxy_v4.port(),
                        0,
                        0,
                    ))
                }
            },
        }
    }
}

fn read_mem(pid: Pid, addr: u64, len: usize) -> Result<Vec<u8>, RedirectorError> {
    let mut out = Vec::with_capacity(len + 8);
    let mut offset = 0usize;
    while offset < len {
        let word = ptrace::read(pid, (addr as usize + offset) as ptrace::AddressType)
            .map_err(|e| RedirectorError::Ptrace(e.to_string()))?;
        out.extend_from_slice(&(word as u64).to_ne_bytes());
        offset += 8;
    }
    out.truncate(len);
    Ok(out)
}

fn write_mem(pid: Pid, addr: u64, data: &[u8]) -> Result<(), RedirectorError> {
    let mut offset = 0usize;
    while offset < data.len() {
        let chunk = &data[offset..];
        let word: u64 = if chunk.len() >= 8 {
            u64::from_ne_bytes(chunk[..8].try_into().expect("len checked"))
        } else {
            // Partial trailing word: merge with what is already there.
            let existing = ptrace::read(pid, (addr as usize + offset) as ptrace::AddressType)
                .map_err(|e| RedirectorError::Ptrace(e.to_string()))?
                as u64;
            let mut bytes = existing.to_ne_bytes();
            bytes[..chunk.len()].copy_from_slice(chunk);
            u64::from_ne_bytes(bytes)
        };
        unsafe {
            ptrace::write(
                pid,
                (addr as usize + offset) as ptrace::AddressType,
                word as nix::libc::c_long,
            )
            .map_err(|e| RedirectorError::Ptrace(e.to_string()))?;
        }
        offset += 8;
    }
    Ok(())
}

fn parse_sockaddr(raw: &[u8]) -> Option<SocketAddr> {
    if raw.len() < 2 {
        return None;
    }
    let family = u16::from_ne_bytes([raw[0], raw[1]]);
    match family {
        AF_INET if raw.len() >= SOCKADDR_IN_LEN => {
            let port = u16::from_be_bytes([raw[2], raw[3]]);
            let ip = Ipv4Addr::new(raw[4], raw[5], raw[6], raw[7]);
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        }
        AF_INET6 if raw.len() >= SOCKADDR_IN6_LEN => {
            let port = u16::from_be_bytes([raw[2], raw[3]]);
            let mut segments = [0u8; 16];
            segments.copy_from_slice(&raw[8..24]);
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(segments)), port))
        }
        _ => None,
    }
}

fn encode_sockaddr(addr: &SocketAddr) -> Vec<u8> {
    match addr {
        SocketAddr::V4(v4) => {
            let mut out = vec![0u8; SOCKADDR_IN_LEN];
            out[..2].copy_from_slice(&AF_INET.to_ne_bytes());
            out[2..4].copy_from_slice(&v4.port().to_be_bytes());
            out[4..8].copy_from_slice(&v4.ip().octets());
            out
        }
        SocketAddr::V6(v6) => {
            let mut out = vec![0u8; SOCKADDR_IN6_LEN];
            out[..2].copy_from_slice(&AF_INET6.to_ne_bytes());
            out[2..4].copy_from_slice(&v6.port().to_be_bytes());
            out[8..24].copy_from_slice(&v6.ip().octets());
            out
        }
    }
}
