//! Engine configuration: timer wheel geometry, per-connection TCP socket
//! options and per-test-case settings.

use crate::packet::FlowTuple;

/// Largest timeout the slow wheel covers, in microseconds (1 min).
pub const SLOW_TMR_MAX_US: u64 = 60 * 1_000_000;
/// Slow wheel step (100ms).
pub const SLOW_TMR_STEP_US: u64 = 100_000;

/// Largest timeout the retransmission wheel covers (30s).
pub const RTO_TMR_MAX_US: u64 = 30 * 1_000_000;
/// Retransmission wheel step (50us).
pub const RTO_TMR_STEP_US: u64 = 50;

/// Largest timeout the test wheel covers (30 min).
pub const TEST_TMR_MAX_US: u64 = 30 * 60 * 1_000_000;
/// Test wheel step (100us).
pub const TEST_TMR_STEP_US: u64 = 100;

/// Minimum elapsed time between two wheel advances; cheaper polls are
/// skipped outright.
pub const TMR_STEP_ADVANCE_US: u64 = 25;

/// Maximum timer entries fired in a single wheel advance. When the budget
/// is hit, remaining buckets are picked up by the next advance.
pub const TMR_MAX_RUN_CNT: usize = 10_000;

/// Maximum number of segments emitted per send call on one connection.
pub const TCP_SEGS_PER_SEND: usize = 4;

/// Per-connection TCP socket options. Every connection of a test case
/// shares one copy of these.
#[derive(Debug, Clone)]
pub struct TcpSockOpt {
    /// Send window limit used to bound the retransmission queue, in bytes.
    pub win_size: u32,
    /// Maximum segment size; also the PSH threshold and the per-clone size
    /// cap of the send path.
    pub mss: usize,
    /// SYN retransmission ceiling (SYN_SENT).
    pub syn_retry_cnt: u8,
    /// SYN-ACK retransmission ceiling (SYN_RECEIVED).
    pub syn_ack_retry_cnt: u8,
    /// Data retransmission ceiling (ESTABLISHED / CLOSE_WAIT).
    pub data_retry_cnt: u8,
    /// Retransmission ceiling for every other state.
    pub retry_cnt: u8,
    /// Retransmission timeout in microseconds.
    pub rto_us: u64,
    /// How long a connection may linger in FIN_WAIT_2.
    pub fin_to_us: u64,
    /// How long a connection stays in TIME_WAIT.
    pub twait_to_us: u64,
    /// How long a connection may linger in FIN_WAIT_1.
    pub orphan_to_us: u64,
    /// Skip TIME_WAIT entirely and close as soon as the last ACK is sent.
    pub skip_timewait: bool,
}

impl Default for TcpSockOpt {
    fn default() -> TcpSockOpt {
        TcpSockOpt {
            win_size: 65_535,
            mss: 1460,
            syn_retry_cnt: 10,
            syn_ack_retry_cnt: 10,
            data_retry_cnt: 10,
            retry_cnt: 10,
            rto_us: 50_000,
            fin_to_us: 30 * 1_000_000,
            twait_to_us: 30 * 1_000_000,
            orphan_to_us: 30 * 1_000_000,
            skip_timewait: false,
        }
    }
}

/// A test-lifecycle duration: either a fixed time or "until stopped".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    /// Never fires on its own.
    Infinite,
    /// Fixed duration in microseconds. Zero is allowed and special-cased
    /// by the session machine (no timer is armed at all).
    Us(u64),
}

impl Delay {
    /// Returns the finite duration, or `None` for [`Delay::Infinite`].
    pub fn finite_us(self) -> Option<u64> {
        match self {
            Delay::Infinite => None,
            Delay::Us(us) => Some(us),
        }
    }
}

/// Pass criteria for a test case, evaluated by the management layer over
/// aggregated generator statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestCriteria {
    /// Test passes after running for this many seconds.
    RunTime(u64),
    /// Test passes once this many server sessions are up.
    SrvUp(u64),
    /// Test passes once this many client sessions are up.
    ClUp(u64),
    /// Test passes once this many client connections reached ESTABLISHED.
    ClEstab(u64),
}

/// Role the connections of a test case play.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestRole {
    /// Actively opens connections towards the device under test.
    Client,
    /// Listens and answers connections from the device under test.
    Server,
}

/// Transport protocol of a test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L4Proto {
    /// Full connection state machine.
    Tcp,
    /// Connectionless; sessions ride directly on the send path.
    Udp,
}

/// Application payload selection, a closed set picked at configuration
/// time.
#[derive(Debug, Clone, Copy)]
pub enum AppConfig {
    /// Fixed-size request/response exchange: clients send `req_size` bytes
    /// and expect `resp_size` back, servers the other way around.
    Raw {
        /// Client request payload size in bytes.
        req_size: usize,
        /// Server response payload size in bytes.
        resp_size: usize,
    },
}

/// Immutable configuration of one test case, shared by all its sessions on
/// a worker.
#[derive(Debug, Clone)]
pub struct TestCaseConfig {
    /// Test case id, unique per interface.
    pub tcid: u32,
    /// Interface the test case runs on.
    pub interface: u32,
    /// Client or server.
    pub role: TestRole,
    /// TCP or UDP.
    pub proto: L4Proto,
    /// The connections this worker emulates. For servers the remote side
    /// of each tuple is the wildcard (0.0.0.0:0).
    pub flows: Vec<FlowTuple>,
    /// Delay before the very first open of each session. Zero skips the
    /// timer and goes straight to the to-open queue.
    pub init_delay: Delay,
    /// How long a session stays up before it is closed.
    pub uptime: Delay,
    /// How long a closed session stays down before reopening.
    pub downtime: Delay,
    /// Pass criteria.
    pub criteria: TestCriteria,
    /// Application payload configuration.
    pub app: AppConfig,
    /// TCP socket options for every connection of the test case.
    pub sockopt: TcpSockOpt,
}
