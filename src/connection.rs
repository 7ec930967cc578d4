//! Dual TCP State Machine
//!
//! Every link tracks two TCP state machines that are never driven by a real
//! TCP stack: the *virtual* hemisphere is inferred from segments the guest
//! sends, the *local* hemisphere from segments returning from the host side.
//! The two only meet when one side acknowledges the other side's FIN.

use crate::packet::TcpSegment;

/// TCP state of one hemisphere. Ordering follows the close sequence and is
/// used for the `<`/`>=` promotions below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TcpState {
    Closed,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    LastAck,
}

/// Composite state of a link, derived from both hemispheres
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake incomplete
    Connection,
    /// Established and no close signaled
    Connected,
    /// One side signaled FIN or RST, the other has not finished
    Disconnecting,
    /// Both sides reached a terminal state
    Closed,
}

/// Which side a segment was observed on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hemisphere {
    /// Segments sent by the guest stack
    Virtual,
    /// Segments returning from the host-side socket
    Local,
}

impl Hemisphere {
    pub fn peer(self) -> Self {
        match self {
            Hemisphere::Virtual => Hemisphere::Local,
            Hemisphere::Local => Hemisphere::Virtual,
        }
    }
}

/// Flag-driven state of a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkState {
    pub local_state: TcpState,
    pub virtual_state: TcpState,
    /// Sequence number of the last FIN seen on the local side
    pub local_sequence_no: u32,
    /// Sequence number of the last FIN seen on the virtual side
    pub virtual_sequence_no: u32,
    /// Still inside the handshake window
    pub syn: bool,
    /// A side reset, or close has nothing left to drain
    pub fin: bool,
}

impl LinkState {
    /// State of a link created by a guest SYN
    pub fn new() -> Self {
        Self {
            local_state: TcpState::SynRcvd,
            virtual_state: TcpState::SynSent,
            local_sequence_no: 0,
            virtual_sequence_no: 0,
            syn: true,
            fin: false,
        }
    }

    pub fn state(&self, side: Hemisphere) -> TcpState {
        match side {
            Hemisphere::Virtual => self.virtual_state,
            Hemisphere::Local => self.local_state,
        }
    }

    fn set_state(&mut self, side: Hemisphere, state: TcpState) {
        match side {
            Hemisphere::Virtual => self.virtual_state = state,
            Hemisphere::Local => self.local_state = state,
        }
    }

    pub fn sequence_no(&self, side: Hemisphere) -> u32 {
        match side {
            Hemisphere::Virtual => self.virtual_sequence_no,
            Hemisphere::Local => self.local_sequence_no,
        }
    }

    fn set_sequence_no(&mut self, side: Hemisphere, sequence_no: u32) {
        match side {
            Hemisphere::Virtual => self.virtual_sequence_no = sequence_no,
            Hemisphere::Local => self.local_sequence_no = sequence_no,
        }
    }

    /// Apply the flags of `segment`, observed on `side`.
    /// `socket_attached` tells whether a host socket is still there to drain.
    pub fn observe(&mut self, side: Hemisphere, segment: &TcpSegment, socket_attached: bool) {
        let flags = segment.flags;
        let peer = side.peer();

        if flags.rst {
            self.fin = true;
            self.syn = false;
            self.set_state(side, TcpState::Closed);
            return;
        }

        self.observe_handshake(side, segment);

        if flags.fin {
            self.syn = false;
            if self.state(side) < TcpState::LastAck {
                self.set_state(side, TcpState::FinWait1);
            }
            if !socket_attached {
                self.fin = true;
            }
            self.set_sequence_no(side, segment.sequence_no);
        }

        // Did this side just acknowledge the peer's FIN?
        if flags.ack
            && self.state(side) < TcpState::LastAck
            && self.state(peer) >= TcpState::FinWait1
            && segment.acknowledgment_no == self.sequence_no(peer).wrapping_add(1)
        {
            self.set_state(side, TcpState::LastAck);
        }

        if self.local_state == TcpState::LastAck && self.virtual_state == TcpState::LastAck {
            self.fin = true;
        }
    }

    fn observe_handshake(&mut self, side: Hemisphere, segment: &TcpSegment) {
        if !self.syn {
            return;
        }
        let flags = segment.flags;
        match side {
            Hemisphere::Local if flags.is_syn_ack() => {
                if self.local_state < TcpState::Established {
                    self.local_state = TcpState::Established;
                }
            }
            Hemisphere::Virtual if flags.ack && !flags.syn => {
                if self.local_state >= TcpState::Established
                    && self.virtual_state < TcpState::Established
                {
                    self.virtual_state = TcpState::Established;
                }
            }
            _ => {}
        }
        if self.local_state >= TcpState::Established && self.virtual_state >= TcpState::Established
        {
            self.syn = false;
        }
    }

    /// Composite state used by the aging sweep
    pub fn connection_state(&self) -> ConnectionState {
        let reset = self.fin
            && (self.local_state == TcpState::Closed || self.virtual_state == TcpState::Closed);
        if reset
            || (self.local_state == TcpState::LastAck && self.virtual_state == TcpState::LastAck)
        {
            ConnectionState::Closed
        } else if self.fin
            || self.local_state >= TcpState::FinWait1
            || self.virtual_state >= TcpState::FinWait1
        {
            ConnectionState::Disconnecting
        } else if self.syn {
            ConnectionState::Connection
        } else {
            ConnectionState::Connected
        }
    }
}

impl Default for LinkState {
    fn default() -> Self {
        Self::new()
    }
}
