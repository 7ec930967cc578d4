//! NAT Translation Engine
//!
//! Entry point for frames read from the virtual interface. TCP frames are
//! translated against the link table, UDP datagrams are relayed through port
//! entries, and ICMP is handed to an optional forwarder. A periodic sweep ages
//! out links, fragment groups and UDP entries.

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::EngineConfig;
use crate::connection::{ConnectionState, Hemisphere};
use crate::datagram::{ReplyHandler, UdpPortTable};
use crate::error::{Result, TapNatError};
use crate::fragment::{FragmentReassembler, Reassembly};
use crate::nat::{Allocation, Link, LinkTable};
use crate::packet::{
    build_rst, FrameCodec, IcmpMessage, IpFrame, TcpSegment, TransportProtocol, UdpDatagram,
    WireCodec,
};
use crate::port::{default_os_table, OsConnectionTable, PortAllocator};
use crate::routing::{self, NoopRouting, RoutingService};
use crate::socket::{AsyncSocketProvider, DirectSocketProvider, LinkSocket};
use crate::stats::{Direction, Statistics, StatsSnapshot};

const RELAY_BUFFER_LEN: usize = 16 * 1024;

/// The TUN/TAP-style device the engine reads frames from and writes frames to
pub trait VirtualInterface: Send + Sync {
    /// Write one IPv4 datagram; false if the device did not take it
    fn output(&self, frame: &[u8]) -> bool;
}

/// Handles ICMP messages the engine does not translate
pub trait IcmpForwarder: Send + Sync {
    /// Returns false if the message was not forwarded
    fn forward(&self, message: &IcmpMessage) -> bool;
}

/// Encodes frames and writes them to the virtual interface
struct FrameSink {
    codec: Arc<dyn FrameCodec>,
    interface: Arc<dyn VirtualInterface>,
    stats: Arc<Statistics>,
}

impl FrameSink {
    fn write(&self, frame: &IpFrame) -> bool {
        let bytes = self.codec.serialize(frame);
        if self.interface.output(&bytes) {
            self.stats.record(Direction::Outbound, frame.protocol, bytes.len());
            true
        } else {
            log::trace!("Virtual interface refused frame to {}", frame.destination);
            self.stats.frame_dropped();
            false
        }
    }

    fn write_tcp(&self, segment: &TcpSegment) -> bool {
        self.write(&self.codec.encode_tcp(segment))
    }

    fn write_udp(&self, datagram: &UdpDatagram) -> bool {
        self.write(&self.codec.encode_udp(datagram))
    }
}

/// What one sweep reclaimed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub links_closed: usize,
    pub fragments_expired: usize,
    pub udp_evicted: usize,
}

/// Builder for `NatEngine`
pub struct NatEngineBuilder {
    config: EngineConfig,
    interface: Arc<dyn VirtualInterface>,
    provider: Arc<dyn AsyncSocketProvider>,
    codec: Arc<dyn FrameCodec>,
    routing: Arc<dyn RoutingService>,
    icmp: Option<Arc<dyn IcmpForwarder>>,
    os_table: Arc<dyn OsConnectionTable>,
    runtime: Option<Handle>,
}

impl NatEngineBuilder {
    pub fn new(config: EngineConfig, interface: Arc<dyn VirtualInterface>) -> Self {
        Self {
            config,
            interface,
            provider: Arc::new(DirectSocketProvider::new()),
            codec: Arc::new(WireCodec),
            routing: Arc::new(NoopRouting),
            icmp: None,
            os_table: default_os_table(),
            runtime: None,
        }
    }

    pub fn socket_provider(mut self, provider: Arc<dyn AsyncSocketProvider>) -> Self {
        self.provider = provider;
        self
    }

    pub fn codec(mut self, codec: Arc<dyn FrameCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn routing(mut self, routing: Arc<dyn RoutingService>) -> Self {
        self.routing = routing;
        self
    }

    pub fn icmp_forwarder(mut self, forwarder: Arc<dyn IcmpForwarder>) -> Self {
        self.icmp = Some(forwarder);
        self
    }

    pub fn os_connection_table(mut self, table: Arc<dyn OsConnectionTable>) -> Self {
        self.os_table = table;
        self
    }

    /// Runtime for the engine's tasks; defaults to the current one
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Result<Arc<NatEngine>> {
        self.config.validate()?;
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| {
                TapNatError::ConfigError("engine must be built inside a tokio runtime".into())
            })?,
        };

        let stats = Arc::new(Statistics::new());
        let sink = Arc::new(FrameSink {
            codec: Arc::clone(&self.codec),
            interface: self.interface,
            stats: Arc::clone(&stats),
        });

        let reply_sink = Arc::clone(&sink);
        let on_reply: ReplyHandler = Arc::new(move |datagram: UdpDatagram| {
            reply_sink.write_udp(&datagram);
        });
        let udp = UdpPortTable::new(Arc::clone(&self.provider), on_reply, runtime.clone());

        let ports = PortAllocator::new(
            self.config.port_range.clone(),
            self.config.gateway_address,
            self.os_table,
        );
        let links = LinkTable::new(self.config.gateway_address, ports);
        let fragments = FragmentReassembler::new(self.config.fragment_timeout);

        Ok(Arc::new_cyclic(|me| NatEngine {
            me: me.clone(),
            config: self.config,
            links,
            fragments,
            udp,
            sink,
            codec: self.codec,
            provider: self.provider,
            routing: self.routing,
            icmp: self.icmp,
            stats,
            runtime,
            ticker: Mutex::new(None),
        }))
    }
}

/// User-space NAT between a virtual interface and host sockets
pub struct NatEngine {
    me: Weak<NatEngine>,
    config: EngineConfig,
    links: LinkTable,
    fragments: FragmentReassembler,
    udp: UdpPortTable,
    sink: Arc<FrameSink>,
    codec: Arc<dyn FrameCodec>,
    provider: Arc<dyn AsyncSocketProvider>,
    routing: Arc<dyn RoutingService>,
    icmp: Option<Arc<dyn IcmpForwarder>>,
    stats: Arc<Statistics>,
    runtime: Handle,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl NatEngine {
    pub fn builder(config: EngineConfig, interface: Arc<dyn VirtualInterface>) -> NatEngineBuilder {
        NatEngineBuilder::new(config, interface)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn links(&self) -> &LinkTable {
        &self.links
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of live UDP port entries
    pub fn udp_entries(&self) -> usize {
        self.udp.len()
    }

    /// Number of datagrams waiting for fragments
    pub fn pending_fragments(&self) -> usize {
        self.fragments.pending()
    }

    pub fn is_running(&self) -> bool {
        self.ticker.lock().map(|t| t.is_some()).unwrap_or(false)
    }

    /// Install routes and DNS, then start the periodic sweep
    pub fn start(&self) -> Result<()> {
        let mut ticker = self.ticker.lock().map_err(|_| TapNatError::LockError)?;
        if ticker.is_some() {
            return Err(TapNatError::AlreadyRunning);
        }

        routing::apply(&*self.routing, &self.config.routes, &self.config.dns_servers)?;

        let engine = self.me.clone();
        let period = self.config.sweep_interval;
        *ticker = Some(self.runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.sweep(Instant::now());
            }
        }));

        log::info!(
            "NAT engine started: gateway {}, listener {}",
            self.config.gateway_address,
            self.config.listener
        );
        Ok(())
    }

    /// Stop the sweep, close every link and UDP entry, and remove the routes
    pub fn stop(&self) -> Result<()> {
        let ticker = self
            .ticker
            .lock()
            .map_err(|_| TapNatError::LockError)?
            .take()
            .ok_or(TapNatError::NotRunning)?;
        ticker.abort();

        let closed = self.links.clear();
        for _ in 0..closed {
            self.stats.link_closed();
        }
        let evicted = self.udp.clear();
        self.fragments.clear();
        routing::withdraw(&*self.routing, &self.config.routes);

        log::info!(
            "NAT engine stopped: {} links and {} UDP entries closed",
            closed,
            evicted
        );
        Ok(())
    }

    /// Process one IPv4 datagram read from the virtual interface
    pub fn on_input(&self, bytes: &[u8]) {
        let now = Instant::now();
        let Some(frame) = self.codec.parse_ipv4(bytes, self.config.validate_checksums) else {
            log::trace!("Dropping malformed frame ({} bytes)", bytes.len());
            self.stats.frame_dropped();
            return;
        };
        self.stats.record(Direction::Inbound, frame.protocol, bytes.len());
        self.process_inbound(frame, now);
    }

    fn process_inbound(&self, frame: IpFrame, now: Instant) {
        match frame.protocol {
            TransportProtocol::Tcp => {
                match self.codec.parse_tcp(&frame, self.config.validate_checksums) {
                    Some(segment) => self.process_tcp(segment, now),
                    None => self.drop_frame(&frame, "unparseable TCP segment"),
                }
            }
            TransportProtocol::Udp | TransportProtocol::Icmp => {
                let frame = match self.fragments.offer(&frame, now) {
                    Reassembly::NotFragmented => frame,
                    Reassembly::Buffered => {
                        self.stats.fragment_buffered();
                        return;
                    }
                    Reassembly::Complete(whole) => {
                        self.stats.fragment_reassembled();
                        whole
                    }
                    Reassembly::Dropped => {
                        self.drop_frame(&frame, "fragment rejected");
                        return;
                    }
                };
                if frame.protocol == TransportProtocol::Udp {
                    self.process_udp(&frame, now);
                } else {
                    self.process_icmp(&frame);
                }
            }
            TransportProtocol::Other(proto) => {
                log::trace!("Dropping frame with unsupported protocol {}", proto);
                self.stats.frame_dropped();
            }
        }
    }

    fn drop_frame(&self, frame: &IpFrame, reason: &str) {
        log::trace!("Dropping frame {} -> {}: {}", frame.source, frame.destination, reason);
        self.stats.frame_dropped();
    }

    fn process_tcp(&self, segment: TcpSegment, now: Instant) {
        if *segment.destination.ip() == self.config.gateway_address {
            if segment.source != self.config.listener {
                log::trace!("Ignoring frame to gateway from non-listener {}", segment.source);
                self.stats.frame_dropped();
                return;
            }
            self.process_reply(segment, now);
        } else if segment.flags.is_syn() {
            self.process_syn(segment, now);
        } else {
            self.process_forward(segment, now);
        }
    }

    /// Host side to guest: frames addressed to `gateway:local_port`
    fn process_reply(&self, segment: TcpSegment, now: Instant) {
        let Some(link) = self.links.lookup_by_port(segment.destination.port()) else {
            log::trace!("No link for local port {}", segment.destination.port());
            self.send_rst(&segment);
            return;
        };

        link.observe(Hemisphere::Local, &segment);
        link.touch(now);
        self.sink.write_tcp(&TcpSegment {
            source: link.destination(),
            destination: link.source(),
            ..segment
        });
    }

    /// Guest SYN: find or create the link and start connecting its socket
    fn process_syn(&self, segment: TcpSegment, now: Instant) {
        if let Some(stale) = self.links.lookup_by_tuple(segment.source, segment.destination) {
            let finished =
                stale.state().fin || stale.connection_state() == ConnectionState::Closed;
            if finished && self.links.close_link(&stale) {
                log::debug!("Replacing finished link {} for {}", stale.id(), segment.source);
                self.stats.link_closed();
            }
        }

        let allocation = match self.links.allocate(segment.source, segment.destination, now) {
            Ok(allocation) => allocation,
            Err(e) => {
                log::debug!(
                    "Cannot open link {} -> {}: {}",
                    segment.source,
                    segment.destination,
                    e
                );
                self.send_rst(&segment);
                return;
            }
        };

        let link = allocation.link();
        let translated = self.translate_forward(link, &segment);
        link.observe(Hemisphere::Virtual, &segment);

        match allocation {
            Allocation::Created(link) => {
                self.stats.link_created();
                link.set_pending_connect(translated);
                self.spawn_connect(link);
            }
            Allocation::Existing(link) => {
                if link.has_socket() {
                    self.sink.write_tcp(&translated);
                } else {
                    // Retransmission while the connect is still pending
                    link.set_pending_connect(translated);
                }
            }
        }
    }

    /// Guest to host on an existing link
    fn process_forward(&self, segment: TcpSegment, now: Instant) {
        let Some(link) = self.links.lookup_by_tuple(segment.source, segment.destination) else {
            log::trace!("No link for {} -> {}", segment.source, segment.destination);
            self.send_rst(&segment);
            return;
        };

        link.observe(Hemisphere::Virtual, &segment);
        link.touch(now);

        if link.has_pending_connect() {
            // The host side has not seen the SYN yet
            if segment.flags.rst {
                link.take_pending_connect();
            }
            return;
        }
        self.sink.write_tcp(&self.translate_forward(&link, &segment));
    }

    fn translate_forward(&self, link: &Link, segment: &TcpSegment) -> TcpSegment {
        TcpSegment {
            source: link.virtual_address(),
            destination: self.config.listener,
            ..segment.clone()
        }
    }

    /// Answer `segment` with a reset, unless it is a reset itself
    fn send_rst(&self, segment: &TcpSegment) {
        if segment.flags.rst {
            return;
        }
        if self.sink.write_tcp(&build_rst(segment)) {
            self.stats.rst_sent();
        }
    }

    fn spawn_connect(&self, link: Arc<Link>) {
        let Some(engine) = self.me.upgrade() else {
            return;
        };
        self.runtime.spawn(async move { engine.connect_link(link).await });
    }

    async fn connect_link(&self, link: Arc<Link>) {
        let destination = SocketAddr::V4(link.destination());
        match self.provider.connect(destination).await {
            Ok(socket) => {
                if !link.attach_socket(Arc::clone(&socket)) {
                    log::trace!("Link {} closed while connecting", link.id());
                    socket.close();
                    return;
                }
                log::debug!("Link {} connected to {}", link.id(), destination);
                if let Some(syn) = link.take_pending_connect() {
                    self.sink.write_tcp(&syn);
                }
            }
            Err(e) => {
                log::debug!("Link {} connect to {} failed: {}", link.id(), destination, e);
                let pending = link.take_pending_connect();
                if self.links.close_link(&link) {
                    self.stats.link_closed();
                }
                if let Some(syn) = pending {
                    self.send_rst(&TcpSegment {
                        source: link.source(),
                        destination: link.destination(),
                        ..syn
                    });
                }
            }
        }
    }

    fn process_udp(&self, frame: &IpFrame, now: Instant) {
        let Some(datagram) = self.codec.parse_udp(frame, self.config.validate_checksums) else {
            self.drop_frame(frame, "unparseable UDP datagram");
            return;
        };
        if !self.udp.send(&datagram, now) {
            self.stats.frame_dropped();
        }
    }

    fn process_icmp(&self, frame: &IpFrame) {
        let Some(message) = self.codec.parse_icmp(frame, self.config.validate_checksums) else {
            self.drop_frame(frame, "unparseable ICMP message");
            return;
        };
        let forwarded = self
            .icmp
            .as_ref()
            .map(|forwarder| forwarder.forward(&message))
            .unwrap_or(false);
        if !forwarded {
            log::trace!(
                "ICMP type {} from {} not forwarded",
                message.msg_type,
                message.source
            );
            self.stats.frame_dropped();
        }
    }

    /// Age out links, expired fragment groups and idle UDP entries
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();

        for link in self.links.snapshot() {
            let idle = link.idle_for(now);
            let remove = match link.connection_state() {
                ConnectionState::Closed => true,
                ConnectionState::Connection => idle > self.config.max_syn_time,
                ConnectionState::Connected => {
                    idle > self.config.max_inactivity_time && self.finalize(&link, now)
                }
                ConnectionState::Disconnecting => self.finalize(&link, now),
            };
            if remove && self.links.close_link(&link) {
                self.stats.link_closed();
                report.links_closed += 1;
            }
        }

        report.fragments_expired = self.fragments.sweep(now);
        self.stats.fragments_expired(report.fragments_expired);
        report.udp_evicted = self.udp.evict_idle(now, self.config.udp_inactivity_time);

        if report != SweepReport::default() {
            log::trace!("Sweep: {:?}", report);
        }
        report
    }

    /// Tear down the socket of a disconnecting link; true once its grace period is over
    fn finalize(&self, link: &Link, now: Instant) -> bool {
        if self.config.use_subnet_stack {
            return true;
        }
        let since = link.final_since(now);
        link.close_socket();
        now.saturating_duration_since(since) >= self.config.max_final_time
    }

    /// Resolve a connection accepted by the host listener to its link
    pub fn accept_client(&self, peer: SocketAddr) -> Option<Arc<Link>> {
        match peer {
            SocketAddr::V4(peer) if *peer.ip() == self.config.gateway_address => {
                self.links.lookup_by_port(peer.port())
            }
            _ => None,
        }
    }

    /// Accept translated guest connections and relay them to their link sockets
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let Some(link) = self.accept_client(peer) else {
                log::debug!("Rejecting connection from {} with no link", peer);
                continue;
            };
            let Some(socket) = link.socket() else {
                log::debug!("Link {} has no socket for {}", link.id(), peer);
                continue;
            };
            if let Err(e) = stream.set_nodelay(true) {
                log::trace!("Cannot set TCP_NODELAY for {}: {}", peer, e);
            }
            self.runtime.spawn(relay(stream, link, socket));
        }
    }

    /// Host listener endpoint, as a socket address to bind
    pub fn listener_addr(&self) -> SocketAddrV4 {
        self.config.listener
    }
}

/// Copy payload both ways between an accepted stream and a link socket
async fn relay(stream: TcpStream, link: Arc<Link>, socket: Arc<dyn LinkSocket>) {
    let (mut reader, mut writer) = stream.into_split();

    let upstream = async {
        let mut buf = vec![0u8; RELAY_BUFFER_LEN];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            socket.send(&buf[..n]).await?;
            link.add_bytes_sent(n as u64);
            link.touch(Instant::now());
        }
        socket.shutdown().await
    };

    let downstream = async {
        let mut buf = vec![0u8; RELAY_BUFFER_LEN];
        loop {
            let n = socket.receive(&mut buf).await?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n]).await?;
            link.add_bytes_received(n as u64);
            link.touch(Instant::now());
        }
        writer.shutdown().await?;
        Ok::<(), TapNatError>(())
    };

    let (up, down) = tokio::join!(upstream, downstream);
    for result in [up, down] {
        if let Err(e) = result {
            log::trace!("Relay for link {} ended: {}", link.id(), e);
        }
    }
    log::debug!(
        "Link {} relay finished: {} bytes sent, {} bytes received",
        link.id(),
        link.bytes_sent(),
        link.bytes_received()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::TcpFlags;
    use crate::port::NoOsConnections;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl VirtualInterface for Recorder {
        fn output(&self, frame: &[u8]) -> bool {
            self.frames.lock().unwrap().push(frame.to_vec());
            true
        }
    }

    impl Recorder {
        fn segments(&self) -> Vec<TcpSegment> {
            let codec = WireCodec;
            self.frames
                .lock()
                .unwrap()
                .iter()
                .filter_map(|bytes| codec.parse_ipv4(bytes, true))
                .filter_map(|frame| codec.parse_tcp(&frame, true))
                .collect()
        }
    }

    struct NullSocket;

    #[async_trait]
    impl LinkSocket for NullSocket {
        async fn send(&self, buf: &[u8]) -> Result<usize> {
            Ok(buf.len())
        }

        async fn receive(&self, _buf: &mut [u8]) -> Result<usize> {
            Ok(0)
        }

        fn close(&self) {}

        fn is_closed(&self) -> bool {
            false
        }
    }

    /// Connects instantly, or fails every connect
    struct InstantProvider {
        succeed: bool,
    }

    #[async_trait]
    impl AsyncSocketProvider for InstantProvider {
        async fn connect(&self, destination: SocketAddr) -> Result<Arc<dyn LinkSocket>> {
            if self.succeed {
                Ok(Arc::new(NullSocket))
            } else {
                Err(TapNatError::SocketError(format!("{} unreachable", destination)))
            }
        }

        async fn bind_datagram(&self) -> Result<Arc<dyn crate::socket::DatagramSocket>> {
            Err(TapNatError::SocketError("no datagrams".into()))
        }
    }

    fn engine(succeed: bool) -> (Arc<NatEngine>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let config = EngineConfig::default().with_port_range(53001..=53010);
        let engine = NatEngine::builder(config, recorder.clone())
            .socket_provider(Arc::new(InstantProvider { succeed }))
            .os_connection_table(Arc::new(NoOsConnections))
            .build()
            .unwrap();
        (engine, recorder)
    }

    fn guest() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 51000)
    }

    fn remote() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 80)
    }

    fn frame(source: SocketAddrV4, destination: SocketAddrV4, flags: u8, seq: u32, ack: u32) -> Vec<u8> {
        let codec = WireCodec;
        let segment = TcpSegment {
            source,
            destination,
            sequence_no: seq,
            acknowledgment_no: ack,
            flags: TcpFlags::from_byte(flags),
            window: 1024,
            urgent_pointer: 0,
            options: Bytes::new(),
            payload: Bytes::new(),
        };
        codec.serialize(&codec.encode_tcp(&segment))
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_syn_emits_translated_syn_after_connect() {
        let (engine, recorder) = engine(true);
        engine.on_input(&frame(guest(), remote(), 0x02, 100, 0));
        assert_eq!(engine.links().len(), 1);
        settle().await;

        let segments = recorder.segments();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].source, SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 53001));
        assert_eq!(segments[0].destination, engine.config().listener);
        assert_eq!(segments[0].sequence_no, 100);
        assert!(segments[0].flags.is_syn());
    }

    #[tokio::test]
    async fn test_failed_connect_resets_guest() {
        let (engine, recorder) = engine(false);
        engine.on_input(&frame(guest(), remote(), 0x02, 100, 0));
        settle().await;

        assert!(engine.links().is_empty());
        let segments = recorder.segments();
        assert_eq!(segments.len(), 1);
        assert!(segments[0].flags.rst);
        assert_eq!(segments[0].source, remote());
        assert_eq!(segments[0].destination, guest());
        assert_eq!(segments[0].acknowledgment_no, 101);
        assert_eq!(engine.stats().rst_sent, 1);
    }

    #[tokio::test]
    async fn test_reply_path_rewrites_to_guest() {
        let (engine, recorder) = engine(true);
        engine.on_input(&frame(guest(), remote(), 0x02, 100, 0));
        settle().await;

        let virtual_address = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 53001);
        engine.on_input(&frame(engine.config().listener, virtual_address, 0x12, 7000, 101));

        let segments = recorder.segments();
        let reply = segments.last().unwrap();
        assert_eq!(reply.source, remote());
        assert_eq!(reply.destination, guest());
        assert_eq!(reply.sequence_no, 7000);
        assert!(reply.flags.is_syn_ack());
    }

    #[tokio::test]
    async fn test_reply_from_non_listener_ignored() {
        let (engine, recorder) = engine(true);
        engine.on_input(&frame(guest(), remote(), 0x02, 100, 0));
        settle().await;
        let before = recorder.segments().len();

        let stray = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 9), 7070);
        let virtual_address = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 53001);
        engine.on_input(&frame(stray, virtual_address, 0x04, 7000, 0));

        let link = engine.links().lookup_by_port(53001).unwrap();
        assert!(!link.state().fin);
        assert_eq!(link.connection_state(), ConnectionState::Connection);
        assert_eq!(recorder.segments().len(), before);
        assert_eq!(engine.stats().frames_dropped, 1);
    }

    #[tokio::test]
    async fn test_forward_miss_answers_rst_but_not_for_rst() {
        let (engine, recorder) = engine(true);
        engine.on_input(&frame(guest(), remote(), 0x10, 100, 5));
        engine.on_input(&frame(guest(), remote(), 0x04, 100, 0));

        assert_eq!(recorder.segments().len(), 1);
        assert!(engine.links().is_empty());
    }

    #[tokio::test]
    async fn test_ports_exhausted_answers_rst() {
        let (engine, recorder) = engine(true);
        for port in 0..10 {
            let source = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 40000 + port);
            engine.on_input(&frame(source, remote(), 0x02, 1, 0));
        }
        settle().await;
        let before = recorder.segments().len();

        let source = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 41000);
        engine.on_input(&frame(source, remote(), 0x02, 1, 0));
        let segments = recorder.segments();
        assert_eq!(segments.len(), before + 1);
        assert!(segments.last().unwrap().flags.rst);
        assert_eq!(engine.links().len(), 10);
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let (engine, _) = engine(true);
        engine.on_input(&frame(guest(), remote(), 0x02, 100, 0));
        settle().await;

        let now = Instant::now();
        assert_eq!(engine.sweep(now + Duration::from_secs(10)).links_closed, 0);
        assert_eq!(engine.sweep(now + Duration::from_secs(21)).links_closed, 1);
        assert!(engine.links().is_empty());
    }

    #[tokio::test]
    async fn test_accept_client_resolves_link() {
        let (engine, _) = engine(true);
        engine.on_input(&frame(guest(), remote(), 0x02, 100, 0));

        let peer: SocketAddr = "10.0.0.2:53001".parse().unwrap();
        let link = engine.accept_client(peer).unwrap();
        assert_eq!(link.source(), guest());
        assert!(engine.accept_client("10.0.0.3:53001".parse().unwrap()).is_none());
    }

    #[tokio::test]
    async fn test_start_stop() {
        let (engine, _) = engine(true);
        engine.start().unwrap();
        assert!(engine.is_running());
        assert!(matches!(engine.start(), Err(TapNatError::AlreadyRunning)));

        engine.on_input(&frame(guest(), remote(), 0x02, 100, 0));
        engine.stop().unwrap();
        assert!(!engine.is_running());
        assert!(engine.links().is_empty());
        assert!(matches!(engine.stop(), Err(TapNatError::NotRunning)));
    }
}
