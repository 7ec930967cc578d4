//! Statistics Collector
//!
//! Lock-free counters updated on the packet path and read as a
//! point-in-time `StatsSnapshot`.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::packet::TransportProtocol;

/// Direction of a frame relative to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Read from the virtual interface
    Inbound,
    /// Written to the virtual interface
    Outbound,
}

#[derive(Debug, Default)]
struct TrafficCounter {
    packets: AtomicU64,
    bytes: AtomicU64,
}

impl TrafficCounter {
    fn add(&self, bytes: usize) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn load(&self) -> TrafficStats {
        TrafficStats {
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.packets.store(0, Ordering::Relaxed);
        self.bytes.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct ProtocolCounters {
    tcp: TrafficCounter,
    udp: TrafficCounter,
    icmp: TrafficCounter,
    other: TrafficCounter,
}

impl ProtocolCounters {
    fn get(&self, protocol: TransportProtocol) -> &TrafficCounter {
        match protocol {
            TransportProtocol::Tcp => &self.tcp,
            TransportProtocol::Udp => &self.udp,
            TransportProtocol::Icmp => &self.icmp,
            TransportProtocol::Other(_) => &self.other,
        }
    }

    fn load(&self) -> ProtocolStats {
        ProtocolStats {
            tcp: self.tcp.load(),
            udp: self.udp.load(),
            icmp: self.icmp.load(),
            other: self.other.load(),
        }
    }

    fn reset(&self) {
        for counter in [&self.tcp, &self.udp, &self.icmp, &self.other] {
            counter.reset();
        }
    }
}

/// Packet and byte totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficStats {
    pub packets: u64,
    pub bytes: u64,
}

/// Traffic totals per transport protocol
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtocolStats {
    pub tcp: TrafficStats,
    pub udp: TrafficStats,
    pub icmp: TrafficStats,
    pub other: TrafficStats,
}

impl ProtocolStats {
    pub fn total(&self) -> TrafficStats {
        let all = [self.tcp, self.udp, self.icmp, self.other];
        TrafficStats {
            packets: all.iter().map(|t| t.packets).sum(),
            bytes: all.iter().map(|t| t.bytes).sum(),
        }
    }
}

/// Point-in-time copy of all counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub inbound: ProtocolStats,
    pub outbound: ProtocolStats,
    pub links_created: u64,
    pub links_closed: u64,
    pub rst_sent: u64,
    pub fragments_buffered: u64,
    pub fragments_reassembled: u64,
    pub fragments_expired: u64,
    pub frames_dropped: u64,
}

impl StatsSnapshot {
    /// Links created and not yet closed
    pub fn active_links(&self) -> u64 {
        self.links_created.saturating_sub(self.links_closed)
    }
}

/// Engine-wide counters
#[derive(Debug, Default)]
pub struct Statistics {
    inbound: ProtocolCounters,
    outbound: ProtocolCounters,
    links_created: AtomicU64,
    links_closed: AtomicU64,
    rst_sent: AtomicU64,
    fragments_buffered: AtomicU64,
    fragments_reassembled: AtomicU64,
    fragments_expired: AtomicU64,
    frames_dropped: AtomicU64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one frame of `bytes` length
    pub fn record(&self, direction: Direction, protocol: TransportProtocol, bytes: usize) {
        let counters = match direction {
            Direction::Inbound => &self.inbound,
            Direction::Outbound => &self.outbound,
        };
        counters.get(protocol).add(bytes);
    }

    pub fn link_created(&self) {
        self.links_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn link_closed(&self) {
        self.links_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rst_sent(&self) {
        self.rst_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fragment_buffered(&self) {
        self.fragments_buffered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fragment_reassembled(&self) {
        self.fragments_reassembled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fragments_expired(&self, groups: usize) {
        self.fragments_expired.fetch_add(groups as u64, Ordering::Relaxed);
    }

    pub fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            inbound: self.inbound.load(),
            outbound: self.outbound.load(),
            links_created: self.links_created.load(Ordering::Relaxed),
            links_closed: self.links_closed.load(Ordering::Relaxed),
            rst_sent: self.rst_sent.load(Ordering::Relaxed),
            fragments_buffered: self.fragments_buffered.load(Ordering::Relaxed),
            fragments_reassembled: self.fragments_reassembled.load(Ordering::Relaxed),
            fragments_expired: self.fragments_expired.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.inbound.reset();
        self.outbound.reset();
        for counter in [
            &self.links_created,
            &self.links_closed,
            &self.rst_sent,
            &self.fragments_buffered,
            &self.fragments_reassembled,
            &self.fragments_expired,
            &self.frames_dropped,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_by_protocol_and_direction() {
        let stats = Statistics::new();
        stats.record(Direction::Inbound, TransportProtocol::Tcp, 60);
        stats.record(Direction::Inbound, TransportProtocol::Tcp, 40);
        stats.record(Direction::Outbound, TransportProtocol::Udp, 28);
        stats.record(Direction::Inbound, TransportProtocol::Other(47), 100);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.inbound.tcp, TrafficStats { packets: 2, bytes: 100 });
        assert_eq!(snapshot.outbound.udp, TrafficStats { packets: 1, bytes: 28 });
        assert_eq!(snapshot.inbound.other.packets, 1);
        assert_eq!(snapshot.inbound.total(), TrafficStats { packets: 3, bytes: 200 });
        assert_eq!(snapshot.outbound.tcp, TrafficStats::default());
    }

    #[test]
    fn test_link_counters() {
        let stats = Statistics::new();
        stats.link_created();
        stats.link_created();
        stats.link_closed();
        stats.rst_sent();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.active_links(), 1);
        assert_eq!(snapshot.rst_sent, 1);
    }

    #[test]
    fn test_reset() {
        let stats = Statistics::new();
        stats.record(Direction::Inbound, TransportProtocol::Icmp, 84);
        stats.fragments_expired(3);
        stats.frame_dropped();
        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }
}
