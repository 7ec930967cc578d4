//! Frame Codec Module
//!
//! Value types for the IPv4, TCP, UDP and ICMP frames the engine works with,
//! and the `FrameCodec` seam that converts them to and from raw datagrams.
//! `WireCodec` is the default codec, built on smoltcp's bounds-checked
//! packet views.

use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::Bytes;
use smoltcp::wire::{
    Icmpv4Packet, IpAddress, IpProtocol, Ipv4Address, Ipv4Packet, TcpPacket, TcpSeqNumber,
    UdpPacket,
};

/// Minimum IPv4 header length
pub const IPV4_MIN_HEADER_LEN: usize = 20;
/// TCP header minimum length
pub const TCP_MIN_HEADER_LEN: usize = 20;
/// UDP header length
pub const UDP_HEADER_LEN: usize = 8;
/// Default TTL for frames the engine originates
pub const DEFAULT_TTL: u8 = 64;

/// Protocol numbers
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;
pub const PROTO_ICMP: u8 = 1;

/// Transport protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Tcp,
    Udp,
    Icmp,
    Other(u8),
}

impl TransportProtocol {
    /// Create from protocol number
    pub fn from_proto(proto: u8) -> Self {
        match proto {
            PROTO_TCP => TransportProtocol::Tcp,
            PROTO_UDP => TransportProtocol::Udp,
            PROTO_ICMP => TransportProtocol::Icmp,
            other => TransportProtocol::Other(other),
        }
    }

    /// Get protocol number
    pub fn to_proto(&self) -> u8 {
        match self {
            TransportProtocol::Tcp => PROTO_TCP,
            TransportProtocol::Udp => PROTO_UDP,
            TransportProtocol::Icmp => PROTO_ICMP,
            TransportProtocol::Other(p) => *p,
        }
    }
}

/// A parsed IPv4 datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpFrame {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub protocol: TransportProtocol,
    pub identification: u16,
    /// Fragment offset in octets
    pub fragment_offset: u16,
    pub more_fragments: bool,
    pub dont_fragment: bool,
    pub ttl: u8,
    pub payload: Bytes,
}

impl IpFrame {
    /// Create an unfragmented frame with default header fields
    pub fn new(
        source: Ipv4Addr,
        destination: Ipv4Addr,
        protocol: TransportProtocol,
        payload: Bytes,
    ) -> Self {
        Self {
            source,
            destination,
            protocol,
            identification: 0,
            fragment_offset: 0,
            more_fragments: false,
            dont_fragment: false,
            ttl: DEFAULT_TTL,
            payload,
        }
    }

    /// True if this datagram is one piece of a larger one
    pub fn is_fragment(&self) -> bool {
        self.more_fragments || self.fragment_offset != 0
    }
}

/// TCP flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
    pub ece: bool,
    pub cwr: bool,
}

impl TcpFlags {
    /// Parse TCP flags from the flags byte
    pub fn from_byte(flags: u8) -> Self {
        Self {
            fin: flags & 0x01 != 0,
            syn: flags & 0x02 != 0,
            rst: flags & 0x04 != 0,
            psh: flags & 0x08 != 0,
            ack: flags & 0x10 != 0,
            urg: flags & 0x20 != 0,
            ece: flags & 0x40 != 0,
            cwr: flags & 0x80 != 0,
        }
    }

    /// Convert to byte
    pub fn to_byte(&self) -> u8 {
        let mut flags = 0u8;
        if self.fin {
            flags |= 0x01;
        }
        if self.syn {
            flags |= 0x02;
        }
        if self.rst {
            flags |= 0x04;
        }
        if self.psh {
            flags |= 0x08;
        }
        if self.ack {
            flags |= 0x10;
        }
        if self.urg {
            flags |= 0x20;
        }
        if self.ece {
            flags |= 0x40;
        }
        if self.cwr {
            flags |= 0x80;
        }
        flags
    }

    /// Check if this is a SYN packet (connection initiation)
    pub fn is_syn(&self) -> bool {
        self.syn && !self.ack
    }

    /// Check if this is a SYN-ACK packet
    pub fn is_syn_ack(&self) -> bool {
        self.syn && self.ack
    }
}

/// A parsed TCP segment. Endpoints carry the IP addresses of the enclosing frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment {
    pub source: SocketAddrV4,
    pub destination: SocketAddrV4,
    pub sequence_no: u32,
    pub acknowledgment_no: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub urgent_pointer: u16,
    /// Raw option bytes, kept as received
    pub options: Bytes,
    pub payload: Bytes,
}

impl TcpSegment {
    /// Sequence space consumed by this segment (payload plus SYN and FIN)
    pub fn sequence_len(&self) -> u32 {
        let mut len = self.payload.len() as u32;
        if self.flags.syn {
            len += 1;
        }
        if self.flags.fin {
            len += 1;
        }
        len
    }
}

/// A parsed UDP datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    pub source: SocketAddrV4,
    pub destination: SocketAddrV4,
    pub payload: Bytes,
}

/// A parsed ICMP message; `body` is the complete ICMP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpMessage {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub msg_type: u8,
    pub code: u8,
    pub body: Bytes,
}

/// Conversion between raw IPv4 datagrams and frame value types
pub trait FrameCodec: Send + Sync {
    /// Parse an IPv4 datagram; `None` if malformed
    fn parse_ipv4(&self, bytes: &[u8], validate_checksum: bool) -> Option<IpFrame>;

    /// Parse the TCP segment carried by `frame`
    fn parse_tcp(&self, frame: &IpFrame, validate_checksum: bool) -> Option<TcpSegment>;

    /// Parse the UDP datagram carried by `frame`
    fn parse_udp(&self, frame: &IpFrame, validate_checksum: bool) -> Option<UdpDatagram>;

    /// Parse the ICMP message carried by `frame`
    fn parse_icmp(&self, frame: &IpFrame, validate_checksum: bool) -> Option<IcmpMessage>;

    /// Serialize a frame, recomputing the header checksum
    fn serialize(&self, frame: &IpFrame) -> Vec<u8>;

    /// Encode a segment into a frame, recomputing the TCP checksum
    fn encode_tcp(&self, segment: &TcpSegment) -> IpFrame;

    /// Encode a datagram into a frame, recomputing the UDP checksum
    fn encode_udp(&self, datagram: &UdpDatagram) -> IpFrame;
}

fn to_std(addr: Ipv4Address) -> Ipv4Addr {
    let b = addr.as_bytes();
    Ipv4Addr::new(b[0], b[1], b[2], b[3])
}

fn to_wire(addr: Ipv4Addr) -> IpAddress {
    IpAddress::Ipv4(Ipv4Address::from_bytes(&addr.octets()))
}

/// Default codec backed by smoltcp wire views
#[derive(Debug, Default, Clone, Copy)]
pub struct WireCodec;

impl FrameCodec for WireCodec {
    fn parse_ipv4(&self, bytes: &[u8], validate_checksum: bool) -> Option<IpFrame> {
        let packet = Ipv4Packet::new_checked(bytes).ok()?;
        if packet.version() != 4 {
            return None;
        }
        if validate_checksum && !packet.verify_checksum() {
            return None;
        }

        Some(IpFrame {
            source: to_std(packet.src_addr()),
            destination: to_std(packet.dst_addr()),
            protocol: TransportProtocol::from_proto(u8::from(packet.next_header())),
            identification: packet.ident(),
            fragment_offset: packet.frag_offset(),
            more_fragments: packet.more_frags(),
            dont_fragment: packet.dont_frag(),
            ttl: packet.hop_limit(),
            payload: Bytes::copy_from_slice(packet.payload()),
        })
    }

    fn parse_tcp(&self, frame: &IpFrame, validate_checksum: bool) -> Option<TcpSegment> {
        if frame.protocol != TransportProtocol::Tcp || frame.is_fragment() {
            return None;
        }
        let data = &frame.payload[..];
        let packet = TcpPacket::new_checked(data).ok()?;
        if validate_checksum
            && !packet.verify_checksum(&to_wire(frame.source), &to_wire(frame.destination))
        {
            return None;
        }

        Some(TcpSegment {
            source: SocketAddrV4::new(frame.source, packet.src_port()),
            destination: SocketAddrV4::new(frame.destination, packet.dst_port()),
            sequence_no: packet.seq_number().0 as u32,
            acknowledgment_no: packet.ack_number().0 as u32,
            flags: TcpFlags::from_byte(data[13]),
            window: packet.window_len(),
            urgent_pointer: packet.urgent_at(),
            options: Bytes::copy_from_slice(packet.options()),
            payload: Bytes::copy_from_slice(packet.payload()),
        })
    }

    fn parse_udp(&self, frame: &IpFrame, validate_checksum: bool) -> Option<UdpDatagram> {
        if frame.protocol != TransportProtocol::Udp || frame.is_fragment() {
            return None;
        }
        let packet = UdpPacket::new_checked(&frame.payload[..]).ok()?;
        // A zero UDP checksum means the sender did not compute one
        if validate_checksum
            && packet.checksum() != 0
            && !packet.verify_checksum(&to_wire(frame.source), &to_wire(frame.destination))
        {
            return None;
        }

        Some(UdpDatagram {
            source: SocketAddrV4::new(frame.source, packet.src_port()),
            destination: SocketAddrV4::new(frame.destination, packet.dst_port()),
            payload: Bytes::copy_from_slice(packet.payload()),
        })
    }

    fn parse_icmp(&self, frame: &IpFrame, validate_checksum: bool) -> Option<IcmpMessage> {
        if frame.protocol != TransportProtocol::Icmp || frame.is_fragment() {
            return None;
        }
        let packet = Icmpv4Packet::new_checked(&frame.payload[..]).ok()?;
        if validate_checksum && !packet.verify_checksum() {
            return None;
        }

        Some(IcmpMessage {
            source: frame.source,
            destination: frame.destination,
            msg_type: u8::from(packet.msg_type()),
            code: packet.msg_code(),
            body: frame.payload.clone(),
        })
    }

    fn serialize(&self, frame: &IpFrame) -> Vec<u8> {
        let total_len = IPV4_MIN_HEADER_LEN + frame.payload.len();
        let mut buf = vec![0u8; total_len];
        buf[IPV4_MIN_HEADER_LEN..].copy_from_slice(&frame.payload);

        let mut packet = Ipv4Packet::new_unchecked(&mut buf[..]);
        packet.set_version(4);
        packet.set_header_len(IPV4_MIN_HEADER_LEN as u8);
        packet.set_dscp(0);
        packet.set_ecn(0);
        packet.set_total_len(total_len as u16);
        packet.set_ident(frame.identification);
        packet.clear_flags();
        packet.set_dont_frag(frame.dont_fragment);
        packet.set_more_frags(frame.more_fragments);
        packet.set_frag_offset(frame.fragment_offset);
        packet.set_hop_limit(frame.ttl);
        packet.set_next_header(IpProtocol::from(frame.protocol.to_proto()));
        packet.set_src_addr(Ipv4Address::from_bytes(&frame.source.octets()));
        packet.set_dst_addr(Ipv4Address::from_bytes(&frame.destination.octets()));
        packet.fill_checksum();

        buf
    }

    fn encode_tcp(&self, segment: &TcpSegment) -> IpFrame {
        // Options are padded to a whole number of 32-bit words
        let options_len = (segment.options.len() + 3) & !3;
        let header_len = TCP_MIN_HEADER_LEN + options_len;
        let mut buf = vec![0u8; header_len + segment.payload.len()];
        buf[TCP_MIN_HEADER_LEN..TCP_MIN_HEADER_LEN + segment.options.len()]
            .copy_from_slice(&segment.options);
        buf[header_len..].copy_from_slice(&segment.payload);
        buf[13] = segment.flags.to_byte();

        let mut packet = TcpPacket::new_unchecked(&mut buf[..]);
        packet.set_src_port(segment.source.port());
        packet.set_dst_port(segment.destination.port());
        packet.set_seq_number(TcpSeqNumber(segment.sequence_no as i32));
        packet.set_ack_number(TcpSeqNumber(segment.acknowledgment_no as i32));
        packet.set_header_len(header_len as u8);
        packet.set_window_len(segment.window);
        packet.set_urgent_at(segment.urgent_pointer);
        packet.fill_checksum(
            &to_wire(*segment.source.ip()),
            &to_wire(*segment.destination.ip()),
        );

        IpFrame::new(
            *segment.source.ip(),
            *segment.destination.ip(),
            TransportProtocol::Tcp,
            Bytes::from(buf),
        )
    }

    fn encode_udp(&self, datagram: &UdpDatagram) -> IpFrame {
        let len = UDP_HEADER_LEN + datagram.payload.len();
        let mut buf = vec![0u8; len];
        buf[UDP_HEADER_LEN..].copy_from_slice(&datagram.payload);

        let mut packet = UdpPacket::new_unchecked(&mut buf[..]);
        packet.set_src_port(datagram.source.port());
        packet.set_dst_port(datagram.destination.port());
        packet.set_len(len as u16);
        packet.fill_checksum(
            &to_wire(*datagram.source.ip()),
            &to_wire(*datagram.destination.ip()),
        );

        IpFrame::new(
            *datagram.source.ip(),
            *datagram.destination.ip(),
            TransportProtocol::Udp,
            Bytes::from(buf),
        )
    }
}

/// Build the reset that answers `segment` (RFC 793, "Reset Generation")
pub fn build_rst(segment: &TcpSegment) -> TcpSegment {
    let (sequence_no, acknowledgment_no, flags) = if segment.flags.ack {
        (
            segment.acknowledgment_no,
            0,
            TcpFlags {
                rst: true,
                ..Default::default()
            },
        )
    } else {
        (
            0,
            segment.sequence_no.wrapping_add(segment.sequence_len()),
            TcpFlags {
                rst: true,
                ack: true,
                ..Default::default()
            },
        )
    };

    TcpSegment {
        source: segment.destination,
        destination: segment.source,
        sequence_no,
        acknowledgment_no,
        flags,
        window: 0,
        urgent_pointer: 0,
        options: Bytes::new(),
        payload: Bytes::new(),
    }
}
