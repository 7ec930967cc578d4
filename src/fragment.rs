//! IP Fragment Reassembly
//!
//! Buffers fragments of IPv4 datagrams until every piece has arrived, then
//! hands back a single reassembled frame. Incomplete groups are discarded
//! once their expiry passes; partial datagrams are never delivered.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::BytesMut;

use crate::packet::{IpFrame, TransportProtocol, IPV4_MIN_HEADER_LEN};

/// Largest payload an IPv4 datagram can carry
const MAX_DATAGRAM_PAYLOAD: usize = u16::MAX as usize - IPV4_MIN_HEADER_LEN;
/// Upper bound on concurrently buffered datagrams
const DEFAULT_MAX_GROUPS: usize = 1024;

/// Identifies the datagram a fragment belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentKey {
    pub protocol: TransportProtocol,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub identification: u16,
}

impl FragmentKey {
    pub fn of(frame: &IpFrame) -> Self {
        Self {
            protocol: frame.protocol,
            source: frame.source,
            destination: frame.destination,
            identification: frame.identification,
        }
    }
}

/// Result of offering a frame to the reassembler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembly {
    /// The frame is a whole datagram; process it as is
    NotFragmented,
    /// The fragment was stored; more pieces are needed
    Buffered,
    /// The last missing piece arrived
    Complete(IpFrame),
    /// The fragment was rejected (duplicate, oversized, or table full)
    Dropped,
}

#[derive(Debug)]
struct FragmentGroup {
    /// Sorted by fragment offset
    fragments: Vec<IpFrame>,
    expires_at: Instant,
}

impl FragmentGroup {
    fn new(expires_at: Instant) -> Self {
        Self {
            fragments: Vec::new(),
            expires_at,
        }
    }

    /// Insert by offset, scanning from the tail since fragments mostly arrive in order.
    /// Returns false for a duplicate offset.
    fn insert(&mut self, frame: IpFrame) -> bool {
        let mut index = self.fragments.len();
        while index > 0 {
            let previous = &self.fragments[index - 1];
            if previous.fragment_offset == frame.fragment_offset {
                return false;
            }
            if previous.fragment_offset < frame.fragment_offset {
                break;
            }
            index -= 1;
        }
        self.fragments.insert(index, frame);
        true
    }

    /// Total payload length if the fragments form a gapless run ending in a last fragment
    fn complete_len(&self) -> Option<usize> {
        let mut expected = 0usize;
        for fragment in &self.fragments {
            if fragment.fragment_offset as usize != expected {
                return None;
            }
            expected += fragment.payload.len();
            if !fragment.more_fragments {
                return Some(expected);
            }
        }
        None
    }

    fn assemble(self, len: usize) -> Option<IpFrame> {
        let mut payload = BytesMut::with_capacity(len);
        let mut fragments = self.fragments.into_iter();
        let mut head = fragments.next()?;
        payload.extend_from_slice(&head.payload);
        for fragment in fragments {
            payload.extend_from_slice(&fragment.payload);
            if !fragment.more_fragments {
                break;
            }
        }

        head.fragment_offset = 0;
        head.more_fragments = false;
        head.payload = payload.freeze();
        Some(head)
    }
}

/// Thread-safe fragment reassembly table
pub struct FragmentReassembler {
    groups: Mutex<HashMap<FragmentKey, FragmentGroup>>,
    timeout: Duration,
    max_groups: usize,
}

impl FragmentReassembler {
    /// Create a reassembler whose groups expire `timeout` after their first fragment
    pub fn new(timeout: Duration) -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            timeout,
            max_groups: DEFAULT_MAX_GROUPS,
        }
    }

    pub fn with_max_groups(mut self, max_groups: usize) -> Self {
        self.max_groups = max_groups;
        self
    }

    /// Offer a frame received at `now`
    pub fn offer(&self, frame: &IpFrame, now: Instant) -> Reassembly {
        if !frame.is_fragment() {
            return Reassembly::NotFragmented;
        }

        let end = frame.fragment_offset as usize + frame.payload.len();
        if end > MAX_DATAGRAM_PAYLOAD {
            log::trace!(
                "Dropping fragment beyond maximum datagram size: {:?}",
                FragmentKey::of(frame)
            );
            return Reassembly::Dropped;
        }

        let Ok(mut groups) = self.groups.lock() else {
            return Reassembly::Dropped;
        };

        let key = FragmentKey::of(frame);
        if groups.get(&key).is_some_and(|group| group.expires_at <= now) {
            // Stale pieces never complete a datagram
            groups.remove(&key);
        }
        if !groups.contains_key(&key) && groups.len() >= self.max_groups {
            log::debug!("Fragment table full ({} groups), dropping fragment", groups.len());
            return Reassembly::Dropped;
        }

        let timeout = self.timeout;
        let group = groups
            .entry(key)
            .or_insert_with(|| FragmentGroup::new(now + timeout));
        if !group.insert(frame.clone()) {
            return Reassembly::Dropped;
        }

        match group.complete_len() {
            Some(len) => groups
                .remove(&key)
                .and_then(|group| group.assemble(len))
                .map(Reassembly::Complete)
                .unwrap_or(Reassembly::Dropped),
            None => Reassembly::Buffered,
        }
    }

    /// Drop every group whose expiry is at or before `now`; returns how many were dropped
    pub fn sweep(&self, now: Instant) -> usize {
        let Ok(mut groups) = self.groups.lock() else {
            return 0;
        };
        let before = groups.len();
        groups.retain(|_, group| group.expires_at > now);
        before - groups.len()
    }

    /// Number of datagrams currently waiting for fragments
    pub fn pending(&self) -> usize {
        self.groups.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn clear(&self) {
        if let Ok(mut groups) = self.groups.lock() {
            groups.clear();
        }
    }
}

impl Default for FragmentReassembler {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}
