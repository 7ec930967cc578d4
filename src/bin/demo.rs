//! Demo binary
//!
//! Drives the NAT engine with scripted guest frames and an in-memory virtual
//! interface, connecting links to a throwaway TCP server on loopback.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::TcpListener;

use tapnat_core::config::EngineConfig;
use tapnat_core::engine::{NatEngine, VirtualInterface};
use tapnat_core::fragment::{FragmentReassembler, Reassembly};
use tapnat_core::packet::{FrameCodec, IpFrame, TcpFlags, TcpSegment, TransportProtocol, WireCodec};

/// Virtual interface that keeps every frame written to it
#[derive(Default)]
struct MemoryInterface {
    frames: Mutex<Vec<Vec<u8>>>,
}

impl MemoryInterface {
    fn drain(&self) -> Vec<Vec<u8>> {
        self.frames
            .lock()
            .map(|mut frames| std::mem::take(&mut *frames))
            .unwrap_or_default()
    }
}

impl VirtualInterface for MemoryInterface {
    fn output(&self, frame: &[u8]) -> bool {
        match self.frames.lock() {
            Ok(mut frames) => {
                frames.push(frame.to_vec());
                true
            }
            Err(_) => false,
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("=== TapNat Core Demo ===\n");

    demo_codec();
    demo_fragments();

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Cannot start runtime: {}", e);
            return;
        }
    };
    runtime.block_on(demo_engine());

    println!("\n=== Demo Complete ===");
}

fn segment(source: SocketAddrV4, destination: SocketAddrV4, flags: u8, seq: u32, ack: u32) -> TcpSegment {
    TcpSegment {
        source,
        destination,
        sequence_no: seq,
        acknowledgment_no: ack,
        flags: TcpFlags::from_byte(flags),
        window: 0xFFFF,
        urgent_pointer: 0,
        options: Bytes::new(),
        payload: Bytes::new(),
    }
}

fn tcp_frame(segment: &TcpSegment) -> Vec<u8> {
    let codec = WireCodec;
    codec.serialize(&codec.encode_tcp(segment))
}

fn describe(frame: &[u8]) -> String {
    let codec = WireCodec;
    let Some(ip) = codec.parse_ipv4(frame, true) else {
        return "<malformed>".into();
    };
    match codec.parse_tcp(&ip, true) {
        Some(tcp) => format!(
            "TCP {} -> {} flags={:#04x} seq={} ack={}",
            tcp.source,
            tcp.destination,
            tcp.flags.to_byte(),
            tcp.sequence_no,
            tcp.acknowledgment_no
        ),
        None => format!("{:?} {} -> {}", ip.protocol, ip.source, ip.destination),
    }
}

fn demo_codec() {
    println!("--- Demo 1: Frame Codec ---");

    let syn = segment(
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 51000),
        SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 80),
        0x02,
        1000,
        0,
    );
    let bytes = tcp_frame(&syn);
    println!("  Encoded SYN: {} bytes", bytes.len());
    println!("  Parsed: {}", describe(&bytes));
    println!();
}

fn demo_fragments() {
    println!("--- Demo 2: Fragment Reassembly ---");

    let reassembler = FragmentReassembler::new(Duration::from_secs(1));
    let now = Instant::now();
    let pieces = [(16u16, false, 3u8), (0, true, 1), (8, true, 2)];

    for (offset, more, fill) in pieces {
        let mut frame = IpFrame::new(
            Ipv4Addr::new(10, 0, 0, 5),
            Ipv4Addr::new(8, 8, 8, 8),
            TransportProtocol::Udp,
            Bytes::from(vec![fill; 8]),
        );
        frame.identification = 42;
        frame.fragment_offset = offset;
        frame.more_fragments = more;

        match reassembler.offer(&frame, now) {
            Reassembly::Complete(whole) => {
                println!("  Offset {:>2}: complete, {} payload bytes", offset, whole.payload.len())
            }
            other => println!("  Offset {:>2}: {:?}", offset, other),
        }
    }
    println!();
}

async fn demo_engine() {
    println!("--- Demo 3: NAT Engine ---");

    // Stand-in for a real destination
    let server = match TcpListener::bind("127.0.0.1:0").await {
        Ok(server) => server,
        Err(e) => {
            println!("  Cannot bind demo server: {}", e);
            return;
        }
    };
    let destination = match server.local_addr() {
        Ok(SocketAddr::V4(addr)) => addr,
        _ => return,
    };
    tokio::spawn(async move {
        while let Ok((stream, peer)) = server.accept().await {
            log::info!("Demo server accepted {}", peer);
            drop(stream);
        }
    });

    let interface = Arc::new(MemoryInterface::default());
    let config = EngineConfig::default().with_port_range(53001..=53100);
    let engine = match NatEngine::builder(config, interface.clone()).build() {
        Ok(engine) => engine,
        Err(e) => {
            println!("  Cannot build engine: {}", e);
            return;
        }
    };
    if let Err(e) = engine.start() {
        println!("  Cannot start engine: {}", e);
        return;
    }

    let guest = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 51000);
    engine.on_input(&tcp_frame(&segment(guest, destination, 0x02, 1000, 0)));
    println!("  Guest SYN {} -> {}", guest, destination);

    // Let the connect task finish
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if let Some(link) = engine.links().lookup_by_tuple(guest, destination) {
            if link.has_socket() {
                break;
            }
        }
    }

    let Some(link) = engine.links().lookup_by_tuple(guest, destination) else {
        println!("  Link was not created");
        return;
    };
    println!("  Link {}: virtual address {}", link.id(), link.virtual_address());
    for frame in interface.drain() {
        println!("  -> host: {}", describe(&frame));
    }

    // Host stack answers the translated SYN
    let listener = engine.config().listener;
    engine.on_input(&tcp_frame(&segment(listener, link.virtual_address(), 0x12, 9000, 1001)));
    for frame in interface.drain() {
        println!("  -> guest: {}", describe(&frame));
    }

    engine.on_input(&tcp_frame(&segment(guest, destination, 0x10, 1001, 9001)));
    for frame in interface.drain() {
        println!("  -> host: {}", describe(&frame));
    }
    println!("  Link state: {:?}", link.connection_state());

    let stats = engine.stats();
    println!(
        "  Stats: {} frames in, {} frames out, {} active links",
        stats.inbound.total().packets,
        stats.outbound.total().packets,
        stats.active_links()
    );

    if let Err(e) = engine.stop() {
        println!("  Stop failed: {}", e);
    }
    println!("  Links after stop: {}", engine.links().len());
}
