//! NAT Link Table
//!
//! A `Link` correlates the guest's 4-tuple with the local port that
//! represents it on the host, and owns the socket carrying its payload.
//! `LinkTable` keeps two indexes over links (by guest 4-tuple and by local
//! port) that are always updated together under one lock.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::connection::{ConnectionState, Hemisphere, LinkState};
use crate::error::{Result, TapNatError};
use crate::packet::TcpSegment;
use crate::port::PortAllocator;
use crate::socket::LinkSocket;

/// Guest-side 4-tuple: (source, destination)
pub type LinkKey = (SocketAddrV4, SocketAddrV4);

/// One NAT-translated TCP connection
pub struct Link {
    id: u64,
    source: SocketAddrV4,
    destination: SocketAddrV4,
    virtual_address: SocketAddrV4,
    state: Mutex<LinkState>,
    pending_connect_frame: Mutex<Option<TcpSegment>>,
    socket: Mutex<Option<Arc<dyn LinkSocket>>>,
    last_activity: Mutex<Instant>,
    /// When the sweep first tore down the socket of a disconnecting link
    final_since: Mutex<Option<Instant>>,
    closed: AtomicBool,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl Link {
    fn new(id: u64, source: SocketAddrV4, destination: SocketAddrV4, virtual_address: SocketAddrV4, now: Instant) -> Self {
        Self {
            id,
            source,
            destination,
            virtual_address,
            state: Mutex::new(LinkState::new()),
            pending_connect_frame: Mutex::new(None),
            socket: Mutex::new(None),
            last_activity: Mutex::new(now),
            final_since: Mutex::new(None),
            closed: AtomicBool::new(false),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    /// Unique per table; distinguishes a link from a later one on the same 4-tuple
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Guest endpoint that opened the connection
    pub fn source(&self) -> SocketAddrV4 {
        self.source
    }

    /// Real destination the guest connected to
    pub fn destination(&self) -> SocketAddrV4 {
        self.destination
    }

    /// Host-side endpoint standing in for the guest (`gateway:local_port`)
    pub fn virtual_address(&self) -> SocketAddrV4 {
        self.virtual_address
    }

    pub fn local_port(&self) -> u16 {
        self.virtual_address.port()
    }

    pub fn key(&self) -> LinkKey {
        (self.source, self.destination)
    }

    /// Snapshot of the dual state machine
    pub fn state(&self) -> LinkState {
        self.state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Composite state; an established link the sweep has started
    /// finalizing reads as `Disconnecting`
    pub fn connection_state(&self) -> ConnectionState {
        let state = self
            .state
            .lock()
            .map(|s| s.connection_state())
            .unwrap_or(ConnectionState::Closed);
        if state == ConnectionState::Connected && self.is_finalizing() {
            ConnectionState::Disconnecting
        } else {
            state
        }
    }

    /// Feed a segment seen on `side` into the state machine
    pub fn observe(&self, side: Hemisphere, segment: &TcpSegment) {
        let attached = self.has_socket();
        if let Ok(mut state) = self.state.lock() {
            state.observe(side, segment, attached);
        }
    }

    /// Restart the inactivity timer
    pub fn touch(&self, now: Instant) {
        if let Ok(mut last) = self.last_activity.lock() {
            if now > *last {
                *last = now;
            }
        }
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        self.last_activity
            .lock()
            .map(|last| now.saturating_duration_since(*last))
            .unwrap_or_default()
    }

    pub fn set_pending_connect(&self, segment: TcpSegment) {
        if let Ok(mut pending) = self.pending_connect_frame.lock() {
            *pending = Some(segment);
        }
    }

    pub fn take_pending_connect(&self) -> Option<TcpSegment> {
        self.pending_connect_frame.lock().ok()?.take()
    }

    pub fn has_pending_connect(&self) -> bool {
        self.pending_connect_frame
            .lock()
            .map(|p| p.is_some())
            .unwrap_or(false)
    }

    /// Attach the socket carrying this link's payload.
    /// Fails if the link was closed while the socket was being connected.
    pub fn attach_socket(&self, socket: Arc<dyn LinkSocket>) -> bool {
        let Ok(mut slot) = self.socket.lock() else {
            return false;
        };
        if self.is_closed() {
            return false;
        }
        *slot = Some(socket);
        true
    }

    pub fn socket(&self) -> Option<Arc<dyn LinkSocket>> {
        self.socket.lock().ok()?.clone()
    }

    pub fn has_socket(&self) -> bool {
        self.socket.lock().map(|s| s.is_some()).unwrap_or(false)
    }

    /// Close and drop the attached socket, keeping the link itself
    pub fn close_socket(&self) {
        let socket = self.socket.lock().ok().and_then(|mut s| s.take());
        if let Some(socket) = socket {
            socket.close();
        }
    }

    /// Start (once) and read the grace period of a disconnecting link
    pub fn final_since(&self, now: Instant) -> Instant {
        match self.final_since.lock() {
            Ok(mut since) => *since.get_or_insert(now),
            Err(_) => now,
        }
    }

    pub fn is_finalizing(&self) -> bool {
        self.final_since.lock().map(|s| s.is_some()).unwrap_or(false)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Mark closed, cancel a pending connect and dispose the socket
    fn dispose(&self) {
        {
            // Holding the slot orders this against attach_socket
            let _slot = self.socket.lock();
            self.closed.store(true, Ordering::Release);
        }
        self.take_pending_connect();
        self.close_socket();
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("destination", &self.destination)
            .field("virtual_address", &self.virtual_address)
            .field("state", &self.state())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Outcome of `LinkTable::allocate`
#[derive(Debug, Clone)]
pub enum Allocation {
    /// A link already existed for the 4-tuple
    Existing(Arc<Link>),
    /// A new link was created
    Created(Arc<Link>),
}

impl Allocation {
    pub fn link(&self) -> &Arc<Link> {
        match self {
            Allocation::Existing(link) | Allocation::Created(link) => link,
        }
    }

    pub fn into_link(self) -> Arc<Link> {
        match self {
            Allocation::Existing(link) | Allocation::Created(link) => link,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Allocation::Created(_))
    }
}

#[derive(Default)]
struct Indexes {
    by_tuple: HashMap<LinkKey, Arc<Link>>,
    by_port: HashMap<u16, Arc<Link>>,
}

/// Thread-safe table of links with two synchronized indexes
pub struct LinkTable {
    indexes: Mutex<Indexes>,
    ports: PortAllocator,
    gateway: Ipv4Addr,
    next_id: AtomicU64,
}

impl LinkTable {
    pub fn new(gateway: Ipv4Addr, ports: PortAllocator) -> Self {
        Self {
            indexes: Mutex::new(Indexes::default()),
            ports,
            gateway,
            next_id: AtomicU64::new(1),
        }
    }

    /// Return the link for the 4-tuple, creating it with a fresh local port if absent
    pub fn allocate(
        &self,
        source: SocketAddrV4,
        destination: SocketAddrV4,
        now: Instant,
    ) -> Result<Allocation> {
        let mut indexes = self.indexes.lock().map_err(|_| TapNatError::LockError)?;

        if let Some(link) = indexes.by_tuple.get(&(source, destination)) {
            link.touch(now);
            return Ok(Allocation::Existing(Arc::clone(link)));
        }

        let port = self
            .ports
            .allocate(|port| indexes.by_port.contains_key(&port))
            .ok_or(TapNatError::PortsExhausted)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let link = Arc::new(Link::new(
            id,
            source,
            destination,
            SocketAddrV4::new(self.gateway, port),
            now,
        ));
        indexes.by_tuple.insert((source, destination), Arc::clone(&link));
        indexes.by_port.insert(port, Arc::clone(&link));

        log::debug!(
            "Link {} created: {} -> {} via local port {}",
            id,
            source,
            destination,
            port
        );
        Ok(Allocation::Created(link))
    }

    pub fn lookup_by_tuple(&self, source: SocketAddrV4, destination: SocketAddrV4) -> Option<Arc<Link>> {
        self.indexes
            .lock()
            .ok()?
            .by_tuple
            .get(&(source, destination))
            .cloned()
    }

    pub fn lookup_by_port(&self, port: u16) -> Option<Arc<Link>> {
        self.indexes.lock().ok()?.by_port.get(&port).cloned()
    }

    /// Remove the link for the 4-tuple from both indexes and dispose it.
    /// Returns the removed link; a second call is a no-op returning `None`.
    pub fn close(&self, source: SocketAddrV4, destination: SocketAddrV4) -> Option<Arc<Link>> {
        let link = {
            let mut indexes = self.indexes.lock().ok()?;
            let link = indexes.by_tuple.remove(&(source, destination))?;
            indexes.by_port.remove(&link.local_port());
            link
        };
        link.dispose();
        log::debug!("Link {} closed: {} -> {}", link.id, source, destination);
        Some(link)
    }

    /// Close `link` only if it is still the one indexed under its 4-tuple
    pub fn close_link(&self, link: &Link) -> bool {
        let removed = {
            let Ok(mut indexes) = self.indexes.lock() else {
                return false;
            };
            match indexes.by_tuple.get(&link.key()) {
                Some(current) if current.id == link.id => {
                    indexes.by_tuple.remove(&link.key());
                    indexes.by_port.remove(&link.local_port());
                    true
                }
                _ => false,
            }
        };
        if removed {
            link.dispose();
            log::debug!("Link {} closed: {} -> {}", link.id, link.source, link.destination);
        }
        removed
    }

    /// Copy of all links, for iteration without holding the lock
    pub fn snapshot(&self) -> Vec<Arc<Link>> {
        self.indexes
            .lock()
            .map(|indexes| indexes.by_tuple.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Close every link; returns how many were closed
    pub fn clear(&self) -> usize {
        let links: Vec<Arc<Link>> = match self.indexes.lock() {
            Ok(mut indexes) => {
                indexes.by_port.clear();
                indexes.by_tuple.drain().map(|(_, link)| link).collect()
            }
            Err(_) => return 0,
        };
        for link in &links {
            link.dispose();
        }
        links.len()
    }

    pub fn len(&self) -> usize {
        self.indexes.lock().map(|i| i.by_tuple.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries in each index; equal whenever the table is consistent
    pub fn index_sizes(&self) -> (usize, usize) {
        self.indexes
            .lock()
            .map(|i| (i.by_tuple.len(), i.by_port.len()))
            .unwrap_or((0, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::NoOsConnections;
    use std::collections::HashSet;
    use std::thread;

    fn table(range: std::ops::RangeInclusive<u16>) -> LinkTable {
        let gateway = Ipv4Addr::new(10, 0, 0, 2);
        LinkTable::new(
            gateway,
            PortAllocator::new(range, gateway, Arc::new(NoOsConnections)),
        )
    }

    fn endpoints(src_port: u16) -> (SocketAddrV4, SocketAddrV4) {
        (
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), src_port),
            SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 80),
        )
    }

    #[test]
    fn test_allocate_creates_link() {
        let links = table(53001..=53100);
        let (src, dst) = endpoints(51000);

        let allocation = links.allocate(src, dst, Instant::now()).unwrap();
        assert!(allocation.is_new());
        let link = allocation.link();
        assert_eq!(link.local_port(), 53001);
        assert_eq!(link.virtual_address(), SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 53001));
        assert_eq!(link.connection_state(), ConnectionState::Connection);
        assert_eq!(links.len(), 1);
    }

    #[test]
    fn test_allocate_returns_existing() {
        let links = table(53001..=53100);
        let (src, dst) = endpoints(51000);

        let first = links.allocate(src, dst, Instant::now()).unwrap().into_link();
        let second = links.allocate(src, dst, Instant::now()).unwrap();
        assert!(!second.is_new());
        assert_eq!(second.link().id(), first.id());
        assert_eq!(links.len(), 1);
    }

    #[test]
    fn test_index_symmetry() {
        let links = table(53001..=53100);
        for port in 0..20 {
            let (src, dst) = endpoints(40000 + port);
            links.allocate(src, dst, Instant::now()).unwrap();
        }
        let (src, dst) = endpoints(40003);
        links.close(src, dst);

        for link in links.snapshot() {
            let by_tuple = links.lookup_by_tuple(link.source(), link.destination()).unwrap();
            let by_port = links.lookup_by_port(link.local_port()).unwrap();
            assert_eq!(by_tuple.id(), link.id());
            assert_eq!(by_port.id(), link.id());
        }
        assert_eq!(links.index_sizes(), (19, 19));
    }

    #[test]
    fn test_close_is_idempotent() {
        let links = table(53001..=53100);
        let (src, dst) = endpoints(51000);
        let link = links.allocate(src, dst, Instant::now()).unwrap().into_link();
        let port = link.local_port();

        assert!(links.close(src, dst).is_some());
        assert!(link.is_closed());
        assert!(links.close(src, dst).is_none());
        assert!(links.lookup_by_port(port).is_none());
        assert_eq!(links.index_sizes(), (0, 0));
    }

    #[test]
    fn test_close_link_ignores_replacement() {
        let links = table(53001..=53100);
        let (src, dst) = endpoints(51000);
        let old = links.allocate(src, dst, Instant::now()).unwrap().into_link();
        links.close(src, dst);
        let new = links.allocate(src, dst, Instant::now()).unwrap().into_link();

        assert!(!links.close_link(&old));
        assert!(links.lookup_by_tuple(src, dst).is_some());
        assert!(links.close_link(&new));
    }

    #[test]
    fn test_ports_exhausted() {
        let links = table(53001..=53002);
        links.allocate(endpoints(1).0, endpoints(1).1, Instant::now()).unwrap();
        links.allocate(endpoints(2).0, endpoints(2).1, Instant::now()).unwrap();
        let third = links.allocate(endpoints(3).0, endpoints(3).1, Instant::now());
        assert!(matches!(third, Err(TapNatError::PortsExhausted)));
        assert_eq!(links.index_sizes(), (2, 2));
    }

    #[test]
    fn test_closed_port_is_reused_after_wrap() {
        let links = table(53001..=53002);
        let (a_src, a_dst) = endpoints(1);
        links.allocate(a_src, a_dst, Instant::now()).unwrap();
        links.allocate(endpoints(2).0, endpoints(2).1, Instant::now()).unwrap();
        links.close(a_src, a_dst);

        let link = links.allocate(endpoints(3).0, endpoints(3).1, Instant::now()).unwrap();
        assert_eq!(link.link().local_port(), 53001);
    }

    #[test]
    fn test_touch_and_idle() {
        let links = table(53001..=53100);
        let (src, dst) = endpoints(51000);
        let start = Instant::now();
        let link = links.allocate(src, dst, start).unwrap().into_link();

        assert_eq!(link.idle_for(start + Duration::from_secs(10)), Duration::from_secs(10));
        link.touch(start + Duration::from_secs(8));
        assert_eq!(link.idle_for(start + Duration::from_secs(10)), Duration::from_secs(2));
    }

    /// Reports one reserved port and counts how often it is asked
    struct CountingOsTable {
        reserved: u16,
        queries: AtomicU64,
    }

    impl crate::port::OsConnectionTable for CountingOsTable {
        fn remote_ports(&self, _remote: Ipv4Addr) -> HashSet<u16> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            HashSet::from([self.reserved])
        }
    }

    #[test]
    fn test_os_table_consulted_only_for_new_links() {
        let gateway = Ipv4Addr::new(10, 0, 0, 2);
        let os_table = Arc::new(CountingOsTable {
            reserved: 53001,
            queries: AtomicU64::new(0),
        });
        let links = LinkTable::new(
            gateway,
            PortAllocator::new(53001..=53100, gateway, os_table.clone()),
        );
        let (src, dst) = endpoints(51000);

        let link = links.allocate(src, dst, Instant::now()).unwrap().into_link();
        assert_eq!(link.local_port(), 53002);
        assert_eq!(os_table.queries.load(Ordering::SeqCst), 1);

        for _ in 0..3 {
            assert!(!links.allocate(src, dst, Instant::now()).unwrap().is_new());
        }
        assert_eq!(os_table.queries.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_allocate_and_close() {
        let links = Arc::new(table(20000..=60000));
        let handles: Vec<_> = (0..8u16)
            .map(|t| {
                let links = Arc::clone(&links);
                thread::spawn(move || {
                    for i in 0..200u16 {
                        let (src, dst) = endpoints(t * 1000 + i);
                        links.allocate(src, dst, Instant::now()).unwrap();
                        if i % 3 == 0 {
                            links.close(src, dst);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = links.snapshot();
        let ports: HashSet<u16> = snapshot.iter().map(|l| l.local_port()).collect();
        assert_eq!(ports.len(), snapshot.len());
        assert_eq!(links.index_sizes(), (snapshot.len(), snapshot.len()));
        for link in snapshot {
            assert_eq!(links.lookup_by_port(link.local_port()).unwrap().id(), link.id());
        }
    }
}
