//! TapNat Core - user-space NAT between a virtual network interface and OS sockets
//!
//! Frames captured from a TUN/TAP-style device are classified by protocol,
//! translated against a table of links, and carried over real host sockets
//! (directly or through a SOCKS5 tunnel), so the guest IP stack keeps the
//! illusion of direct connectivity.

// Public modules
pub mod config;
pub mod connection;
pub mod datagram;
pub mod engine;
pub mod error;
pub mod fragment;
pub mod nat;
pub mod packet;
pub mod port;
pub mod routing;
pub mod socket;
pub mod socks5;
pub mod stats;

// Re-exports for convenience
pub use config::{EngineConfig, RouteSpec};
pub use connection::{ConnectionState, Hemisphere, LinkState, TcpState};
pub use datagram::UdpPortTable;
pub use engine::{IcmpForwarder, NatEngine, NatEngineBuilder, SweepReport, VirtualInterface};
pub use error::{Result, TapNatError};
pub use fragment::{FragmentReassembler, Reassembly};
pub use nat::{Allocation, Link, LinkTable};
pub use packet::{
    FrameCodec, IcmpMessage, IpFrame, TcpFlags, TcpSegment, TransportProtocol, UdpDatagram,
    WireCodec,
};
pub use port::{OsConnectionTable, PortAllocator, ProcNetTcp};
pub use routing::{NoopRouting, RoutingService};
pub use socket::{
    AsyncSocketProvider, DatagramSocket, DirectSocketProvider, LinkSocket, TcpLinkSocket,
};
pub use socks5::{Socks5Client, Socks5SocketProvider};
pub use stats::{StatsSnapshot, Statistics};
