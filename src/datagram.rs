//! UDP Port Entries
//!
//! Each guest UDP source endpoint gets one port entry owning a datagram
//! socket. Guest datagrams are queued to a sender task; datagrams arriving on
//! the socket are handed back through a reply handler. Entries are evicted
//! independently of the TCP link table once idle.

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::packet::UdpDatagram;
use crate::socket::{AsyncSocketProvider, DatagramSocket};

/// Datagrams queued per entry before further ones are dropped
const SEND_QUEUE_DEPTH: usize = 256;
/// Receive buffer large enough for any UDP payload
const RECV_BUFFER_LEN: usize = 65535;

/// Called with every datagram received for a guest endpoint
pub type ReplyHandler = Arc<dyn Fn(UdpDatagram) + Send + Sync>;

struct PortEntry {
    source: SocketAddrV4,
    queue: Mutex<Option<mpsc::Sender<(Bytes, SocketAddrV4)>>>,
    socket: Mutex<Option<Arc<dyn DatagramSocket>>>,
    last_activity: Mutex<Instant>,
    closed: AtomicBool,
}

impl PortEntry {
    fn touch(&self, now: Instant) {
        if let Ok(mut last) = self.last_activity.lock() {
            if now > *last {
                *last = now;
            }
        }
    }

    fn idle_for(&self, now: Instant) -> Duration {
        self.last_activity
            .lock()
            .map(|last| now.saturating_duration_since(*last))
            .unwrap_or_default()
    }

    fn attach(&self, socket: Arc<dyn DatagramSocket>) -> bool {
        let Ok(mut slot) = self.socket.lock() else {
            return false;
        };
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        *slot = Some(socket);
        true
    }

    fn enqueue(&self, payload: Bytes, target: SocketAddrV4) -> bool {
        let Ok(queue) = self.queue.lock() else {
            return false;
        };
        match queue.as_ref() {
            Some(tx) => tx.try_send((payload, target)).is_ok(),
            None => false,
        }
    }

    fn close(&self) {
        let socket = match self.socket.lock() {
            Ok(mut slot) => {
                self.closed.store(true, Ordering::Release);
                slot.take()
            }
            Err(_) => {
                self.closed.store(true, Ordering::Release);
                None
            }
        };
        if let Ok(mut queue) = self.queue.lock() {
            queue.take();
        }
        if let Some(socket) = socket {
            socket.close();
        }
    }
}

/// Table of UDP port entries keyed by guest source endpoint
pub struct UdpPortTable {
    entries: Mutex<HashMap<SocketAddrV4, Arc<PortEntry>>>,
    provider: Arc<dyn AsyncSocketProvider>,
    on_reply: ReplyHandler,
    runtime: Handle,
}

impl UdpPortTable {
    pub fn new(provider: Arc<dyn AsyncSocketProvider>, on_reply: ReplyHandler, runtime: Handle) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            provider,
            on_reply,
            runtime,
        }
    }

    /// Forward a guest datagram, creating the port entry on first use.
    /// Returns false if the datagram was dropped.
    pub fn send(&self, datagram: &UdpDatagram, now: Instant) -> bool {
        let entry = {
            let Ok(mut entries) = self.entries.lock() else {
                return false;
            };
            match entries.get(&datagram.source) {
                Some(entry) if !entry.closed.load(Ordering::Acquire) => Arc::clone(entry),
                _ => {
                    let entry = self.open(datagram.source, now);
                    entries.insert(datagram.source, Arc::clone(&entry));
                    entry
                }
            }
        };

        entry.touch(now);
        let queued = entry.enqueue(datagram.payload.clone(), datagram.destination);
        if !queued {
            log::trace!("UDP datagram from {} dropped: send queue full", datagram.source);
        }
        queued
    }

    fn open(&self, source: SocketAddrV4, now: Instant) -> Arc<PortEntry> {
        let (tx, rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let entry = Arc::new(PortEntry {
            source,
            queue: Mutex::new(Some(tx)),
            socket: Mutex::new(None),
            last_activity: Mutex::new(now),
            closed: AtomicBool::new(false),
        });

        log::debug!("UDP port entry opened for {}", source);
        self.runtime.spawn(run_entry(
            Arc::clone(&entry),
            Arc::clone(&self.provider),
            Arc::clone(&self.on_reply),
            rx,
        ));
        entry
    }

    /// Close entries idle for longer than `timeout`; returns how many were evicted
    pub fn evict_idle(&self, now: Instant, timeout: Duration) -> usize {
        let evicted: Vec<Arc<PortEntry>> = match self.entries.lock() {
            Ok(mut entries) => {
                let idle: Vec<SocketAddrV4> = entries
                    .iter()
                    .filter(|(_, entry)| entry.idle_for(now) > timeout)
                    .map(|(source, _)| *source)
                    .collect();
                idle.iter().filter_map(|source| entries.remove(source)).collect()
            }
            Err(_) => return 0,
        };

        for entry in &evicted {
            log::debug!("UDP port entry for {} evicted after inactivity", entry.source);
            entry.close();
        }
        evicted.len()
    }

    /// Close every entry
    pub fn clear(&self) -> usize {
        let entries: Vec<Arc<PortEntry>> = match self.entries.lock() {
            Ok(mut entries) => entries.drain().map(|(_, entry)| entry).collect(),
            Err(_) => return 0,
        };
        for entry in &entries {
            entry.close();
        }
        entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, source: SocketAddrV4) -> bool {
        self.entries
            .lock()
            .map(|e| e.contains_key(&source))
            .unwrap_or(false)
    }
}

async fn run_entry(
    entry: Arc<PortEntry>,
    provider: Arc<dyn AsyncSocketProvider>,
    on_reply: ReplyHandler,
    mut rx: mpsc::Receiver<(Bytes, SocketAddrV4)>,
) {
    let socket = match provider.bind_datagram().await {
        Ok(socket) => socket,
        Err(e) => {
            log::debug!("Cannot bind UDP socket for {}: {}", entry.source, e);
            entry.close();
            return;
        }
    };
    if !entry.attach(Arc::clone(&socket)) {
        socket.close();
        return;
    }

    let receiver = tokio::spawn(receive_loop(Arc::clone(&entry), Arc::clone(&socket), on_reply));

    while let Some((payload, target)) = rx.recv().await {
        if let Err(e) = socket.send_to(&payload, SocketAddr::V4(target)).await {
            log::trace!("UDP send from {} to {} failed: {}", entry.source, target, e);
        }
    }

    socket.close();
    let _ = receiver.await;
}

async fn receive_loop(entry: Arc<PortEntry>, socket: Arc<dyn DatagramSocket>, on_reply: ReplyHandler) {
    let mut buf = vec![0u8; RECV_BUFFER_LEN];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, SocketAddr::V4(from))) => {
                entry.touch(Instant::now());
                on_reply(UdpDatagram {
                    source: from,
                    destination: entry.source,
                    payload: Bytes::copy_from_slice(&buf[..len]),
                });
            }
            Ok((_, SocketAddr::V6(from))) => {
                log::trace!("Ignoring IPv6 datagram from {}", from);
            }
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::DirectSocketProvider;
    use std::net::Ipv4Addr;
    use tokio::net::UdpSocket;

    fn recording_handler() -> (ReplyHandler, Arc<Mutex<Vec<UdpDatagram>>>) {
        let replies = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&replies);
        let handler: ReplyHandler = Arc::new(move |datagram| sink.lock().unwrap().push(datagram));
        (handler, replies)
    }

    fn guest() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 40000)
    }

    #[tokio::test]
    async fn test_datagram_relay_and_reply() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let SocketAddr::V4(server_addr) = server.local_addr().unwrap() else {
            unreachable!()
        };
        let (handler, replies) = recording_handler();
        let table = UdpPortTable::new(Arc::new(DirectSocketProvider::new()), handler, Handle::current());

        let datagram = UdpDatagram {
            source: guest(),
            destination: server_addr,
            payload: Bytes::from_static(b"query"),
        };
        assert!(table.send(&datagram, Instant::now()));
        assert!(table.contains(guest()));

        let mut buf = [0u8; 64];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"query");
        server.send_to(b"answer", from).await.unwrap();

        for _ in 0..100 {
            if !replies.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let replies = replies.lock().unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].source, server_addr);
        assert_eq!(replies[0].destination, guest());
        assert_eq!(&replies[0].payload[..], b"answer");
    }

    #[tokio::test]
    async fn test_idle_entry_evicted() {
        let (handler, _) = recording_handler();
        let table = UdpPortTable::new(Arc::new(DirectSocketProvider::new()), handler, Handle::current());
        let start = Instant::now();
        let datagram = UdpDatagram {
            source: guest(),
            destination: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9),
            payload: Bytes::from_static(b"x"),
        };
        table.send(&datagram, start);

        let timeout = Duration::from_secs(60);
        assert_eq!(table.evict_idle(start + Duration::from_secs(30), timeout), 0);
        assert_eq!(table.evict_idle(start + Duration::from_secs(61), timeout), 1);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_one_entry_per_source() {
        let (handler, _) = recording_handler();
        let table = UdpPortTable::new(Arc::new(DirectSocketProvider::new()), handler, Handle::current());
        let now = Instant::now();
        for port in [53, 123, 5353] {
            table.send(
                &UdpDatagram {
                    source: guest(),
                    destination: SocketAddrV4::new(Ipv4Addr::LOCALHOST, port),
                    payload: Bytes::from_static(b"x"),
                },
                now,
            );
        }
        assert_eq!(table.len(), 1);
        assert_eq!(table.clear(), 1);
    }
}
