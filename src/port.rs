//! Local Port Allocation
//!
//! Hands out the local ports that represent NAT'd connections to the host.
//! A port is skipped when a link already owns it, or when the host itself
//! still has a TCP connection from `gateway:port` (for example one lingering
//! in TIME_WAIT after a previous link on the same port).

use std::collections::HashSet;
use std::fs;
use std::net::Ipv4Addr;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// View of the host's live TCP connection table
pub trait OsConnectionTable: Send + Sync {
    /// Remote ports of live connections whose remote address is `remote`
    fn remote_ports(&self, remote: Ipv4Addr) -> HashSet<u16>;
}

/// Connection table that never reports anything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOsConnections;

impl OsConnectionTable for NoOsConnections {
    fn remote_ports(&self, _remote: Ipv4Addr) -> HashSet<u16> {
        HashSet::new()
    }
}

/// Reads the Linux `/proc/net/tcp` table
#[derive(Debug, Clone)]
pub struct ProcNetTcp {
    path: PathBuf,
}

impl ProcNetTcp {
    pub fn new() -> Self {
        Self {
            path: PathBuf::from("/proc/net/tcp"),
        }
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Extract remote ports for `remote` from the text of a `/proc/net/tcp` table
    pub fn parse(contents: &str, remote: Ipv4Addr) -> HashSet<u16> {
        contents
            .lines()
            .skip(1)
            .filter_map(|line| {
                let rem_address = line.split_whitespace().nth(2)?;
                let (addr, port) = rem_address.split_once(':')?;
                let addr = u32::from_str_radix(addr, 16).ok()?;
                let port = u16::from_str_radix(port, 16).ok()?;
                // The kernel prints the raw network-order word in host byte order
                (Ipv4Addr::from(addr.to_ne_bytes()) == remote).then_some(port)
            })
            .collect()
    }
}

impl Default for ProcNetTcp {
    fn default() -> Self {
        Self::new()
    }
}

impl OsConnectionTable for ProcNetTcp {
    fn remote_ports(&self, remote: Ipv4Addr) -> HashSet<u16> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Self::parse(&contents, remote),
            Err(e) => {
                log::trace!("Cannot read {}: {}", self.path.display(), e);
                HashSet::new()
            }
        }
    }
}

/// The platform's best available connection table
pub fn default_os_table() -> Arc<dyn OsConnectionTable> {
    if cfg!(target_os = "linux") {
        Arc::new(ProcNetTcp::new())
    } else {
        Arc::new(NoOsConnections)
    }
}

/// Cursor-based allocator over a port range
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    cursor: Mutex<u16>,
    gateway: Ipv4Addr,
    os_table: Arc<dyn OsConnectionTable>,
}

impl PortAllocator {
    pub fn new(
        range: RangeInclusive<u16>,
        gateway: Ipv4Addr,
        os_table: Arc<dyn OsConnectionTable>,
    ) -> Self {
        Self {
            cursor: Mutex::new(*range.start()),
            range,
            gateway,
            os_table,
        }
    }

    /// Number of ports in the range
    pub fn capacity(&self) -> usize {
        if self.range.is_empty() {
            0
        } else {
            (*self.range.end() - *self.range.start()) as usize + 1
        }
    }

    /// Ports the host currently has connections from `gateway` on.
    /// Best effort: a connection opened right after this query is only
    /// noticed on the next allocation.
    pub fn os_reserved(&self) -> HashSet<u16> {
        self.os_table.remote_ports(self.gateway)
    }

    /// Advance the cursor to the next port for which `is_taken` is false,
    /// trying at most one full cycle of the range
    pub fn next_free(&self, is_taken: impl Fn(u16) -> bool) -> Option<u16> {
        let capacity = self.capacity();
        if capacity == 0 {
            return None;
        }
        let mut cursor = self.cursor.lock().ok()?;
        for _ in 0..capacity {
            let port = *cursor;
            *cursor = if port >= *self.range.end() {
                *self.range.start()
            } else {
                port + 1
            };
            if !is_taken(port) {
                return Some(port);
            }
        }
        None
    }

    /// Allocate a port not in use by the caller and not reserved by the host
    pub fn allocate(&self, in_use: impl Fn(u16) -> bool) -> Option<u16> {
        let reserved = self.os_reserved();
        self.next_free(|port| in_use(port) || reserved.contains(&port))
    }
}
