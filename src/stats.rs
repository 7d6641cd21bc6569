//! Per-worker statistics. Counters are plain fields on the owning worker
//! (no atomics, no sharing); the management layer aggregates them through
//! worker messages. Everything resets at test start.

use crate::tcp::TcbState;

/// TCP engine counters, one set per worker.
#[derive(Debug, Default, Clone)]
pub struct TcpStats {
    /// Connection gauges, one per TCP state.
    pub states: [u64; TcbState::COUNT],
    /// Received segments handed to the state machine.
    pub recv_pkts: u64,
    /// Received payload bytes.
    pub recv_bytes: u64,
    /// Control segments (no payload) sent.
    pub sent_ctrl_pkts: u64,
    /// Data segments sent.
    pub sent_data_pkts: u64,
    /// Payload bytes sent.
    pub sent_data_bytes: u64,
    /// Segments retransmitted.
    pub retrans_pkts: u64,
    /// Payload bytes retransmitted.
    pub retrans_bytes: u64,
    /// Retransmission timer fired while in SYN_SENT.
    pub syn_to: u64,
    /// Retransmission timer fired while in SYN_RECEIVED.
    pub synack_to: u64,
    /// Retransmission timer fired while in ESTABLISHED or CLOSE_WAIT.
    pub data_to: u64,
    /// Retransmission timer fired in any other state.
    pub retry_to: u64,
    /// Connections currently holding out-of-order segments (gauge).
    pub missing_seq: u64,
    /// Connections torn down because a retry ceiling was exceeded.
    pub retry_exceeded: u64,
    /// Segments dropped by the acceptability test.
    pub invalid_pkts: u64,
    /// Received RSTs.
    pub rsts: u64,
    /// Control blocks allocated from the pool.
    pub tcb_allocated: u64,
    /// Control blocks released back to the pool.
    pub tcb_freed: u64,
}

impl TcpStats {
    /// Increments the gauge for `state`.
    pub fn state_inc(&mut self, state: TcbState) {
        self.states[state as usize] += 1;
    }

    /// Decrements the gauge for `state`.
    pub fn state_dec(&mut self, state: TcbState) {
        self.states[state as usize] = self.states[state as usize].saturating_sub(1);
    }

    /// Resets every counter and gauge.
    pub fn reset(&mut self) {
        *self = TcpStats::default();
    }
}

/// UDP engine counters, one set per worker.
#[derive(Debug, Default, Clone)]
pub struct UdpStats {
    /// Received datagrams handed to an endpoint.
    pub recv_pkts: u64,
    /// Received payload bytes.
    pub recv_bytes: u64,
    /// Datagrams sent.
    pub sent_pkts: u64,
    /// Payload bytes sent.
    pub sent_bytes: u64,
    /// Endpoints allocated from the pool.
    pub ucb_allocated: u64,
    /// Endpoints released back to the pool.
    pub ucb_freed: u64,
}

/// Per-test-case generator statistics, driven by the session machine.
#[derive(Debug, Default, Clone)]
pub struct GenStats {
    /// Sessions that came up (connection established, application ready)
    /// since test start.
    pub up: u64,
    /// Sessions that went down after having been up.
    pub down: u64,
    /// Open attempts that failed before the session came up.
    pub failed: u64,
    /// Connections that reached ESTABLISHED since test start.
    pub estab: u64,
    /// Application bytes sent on behalf of this test case.
    pub app_bytes_sent: u64,
    /// Application bytes delivered for this test case.
    pub app_bytes_recv: u64,
    /// Timestamp of the first session coming up, in microseconds.
    pub start_time_us: u64,
    /// Timestamp of the moment the pass criteria were met.
    pub end_time_us: u64,
}

impl GenStats {
    /// Resets every counter.
    pub fn reset(&mut self) {
        *self = GenStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_gauges_track_transitions() {
        let mut stats = TcpStats::default();

        stats.state_inc(TcbState::LISTEN);
        stats.state_inc(TcbState::LISTEN);
        stats.state_dec(TcbState::LISTEN);
        assert_eq!(stats.states[TcbState::LISTEN as usize], 1);

        // Gauges never underflow.
        stats.state_dec(TcbState::CLOSED);
        assert_eq!(stats.states[TcbState::CLOSED as usize], 0);
    }
}
