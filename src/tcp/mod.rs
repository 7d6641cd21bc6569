//! The TCP connection engine: the RFC 793-derived state machine and the
//! data segment engine underneath it.

pub mod data;
pub mod fsm;

use crate::packet::PacketDescriptor;

/// TCP connection states.
///
/// `CLOSED` is terminal: entering it synchronously tears the connection
/// down (queues drained, timers canceled, control block released).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum TcbState {
    /// Control block allocated, no state machine activity yet.
    INIT,
    /// Waiting for a connection request from any remote TCP and port.
    LISTEN,
    /// Waiting for a matching connection request after having sent a
    /// connection request.
    SYN_SENT,
    /// Waiting for a confirming connection request acknowledgment after
    /// having both received and sent a connection request.
    SYN_RECEIVED,
    /// An open connection; the normal data transfer state.
    ESTABLISHED,
    /// Waiting for a connection termination request from the remote TCP,
    /// or an acknowledgment of the one previously sent.
    FIN_WAIT_1,
    /// Waiting for a connection termination request from the remote TCP.
    FIN_WAIT_2,
    /// Waiting for an acknowledgment of the connection termination request
    /// previously sent to the remote TCP.
    LAST_ACK,
    /// Waiting for a connection termination request acknowledgment from
    /// the remote TCP.
    CLOSING,
    /// Waiting for enough time to pass to be sure the remote TCP received
    /// the acknowledgment of its connection termination request.
    TIME_WAIT,
    /// Waiting for a connection termination request from the local user.
    CLOSE_WAIT,
    /// No connection state at all.
    CLOSED,
}

impl TcbState {
    /// Number of states, for per-state counter arrays.
    pub const COUNT: usize = 12;

    /// State name for diagnostics.
    pub fn as_str(self) -> &'static str {
        match self {
            TcbState::INIT => "INIT",
            TcbState::LISTEN => "LISTEN",
            TcbState::SYN_SENT => "SYN_SENT",
            TcbState::SYN_RECEIVED => "SYN_RECEIVED",
            TcbState::ESTABLISHED => "ESTABLISHED",
            TcbState::FIN_WAIT_1 => "FIN_WAIT_1",
            TcbState::FIN_WAIT_2 => "FIN_WAIT_2",
            TcbState::LAST_ACK => "LAST_ACK",
            TcbState::CLOSING => "CLOSING",
            TcbState::TIME_WAIT => "TIME_WAIT",
            TcbState::CLOSE_WAIT => "CLOSE_WAIT",
            TcbState::CLOSED => "CLOSED",
        }
    }
}

/// Events dispatched into the TCP state machine.
#[derive(Debug)]
pub enum TcpEvent {
    /// A state was just entered; dispatched by `enter_state` itself.
    Enter,
    /// Local user opens the connection.
    Open,
    /// Local user has staged data in the retransmission queue.
    Send,
    /// Local user asks for delivery of pending data. Delivery happens on
    /// segment arrival in this engine, so this is accepted and ignored.
    Receive,
    /// Local user closes the connection.
    Close,
    /// Local user aborts the connection (RST, no handshake).
    Abort,
    /// Local user queries connection status.
    Status,
    /// A segment arrived from the wire.
    Segment(PacketDescriptor),
    /// User timeout expired.
    UserTimeout,
    /// Retransmission timeout expired.
    RetransTimeout,
    /// The connection lingered too long in FIN_WAIT_1.
    OrphanTimeout,
    /// The connection lingered too long in FIN_WAIT_2.
    FinTimeout,
    /// 2MSL wait in TIME_WAIT completed.
    TimeWaitTimeout,
}

impl TcpEvent {
    /// Event name for diagnostics.
    pub fn as_str(&self) -> &'static str {
        match *self {
            TcpEvent::Enter => "ENTER",
            TcpEvent::Open => "OPEN",
            TcpEvent::Send => "SEND",
            TcpEvent::Receive => "RECEIVE",
            TcpEvent::Close => "CLOSE",
            TcpEvent::Abort => "ABORT",
            TcpEvent::Status => "STATUS",
            TcpEvent::Segment(_) => "SEGMENT_ARRIVES",
            TcpEvent::UserTimeout => "USER_TIMEOUT",
            TcpEvent::RetransTimeout => "RETRANSMISSION_TIMEOUT",
            TcpEvent::OrphanTimeout => "ORPHAN_TIMEOUT",
            TcpEvent::FinTimeout => "FIN_TIMEOUT",
            TcpEvent::TimeWaitTimeout => "TIME_WAIT_TIMEOUT",
        }
    }
}

impl std::fmt::Display for TcbState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
