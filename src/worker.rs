//! The per-core worker context and its run-to-completion poll loop.
//!
//! A [`Worker`] owns every piece of connection state for its core: the
//! control block pool, the lookup tables, the three timer wheels, the
//! per-test-case scheduling queues and the statistics. Nothing in here is
//! shared; other threads talk to a worker exclusively through its message
//! inbox, drained at poll points between packet batches.

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::time::Instant;

use crate::ccb::{CcbHandle, CcbPool, ProtoCb};
use crate::config::{
    RTO_TMR_MAX_US, RTO_TMR_STEP_US, SLOW_TMR_MAX_US, SLOW_TMR_STEP_US, TEST_TMR_MAX_US,
    TEST_TMR_STEP_US, TestCaseConfig,
};
use crate::lookup::ConnectionTable;
use crate::packet::{OutPacket, PacketDescriptor, SegmentMeta, TcpFlags};
use crate::session::TestQueue;
use crate::stats::{GenStats, TcpStats, UdpStats};
use crate::tcp::{TcbState, TcpEvent};
use crate::timer::{TimerHandle, TimerWheel};
use crate::{Error, Result, debug, info};

/// Control messages a worker accepts on its inbox.
#[derive(Debug)]
pub enum WorkerMsg {
    /// Install and start a test case.
    StartTestCase(TestCaseConfig),
    /// Purge every session of a test case and drop its runtime.
    StopTestCase {
        /// Test case to stop.
        tcid: u32,
    },
    /// Send back a snapshot of the test case and TCP statistics.
    FetchStats {
        /// Test case to report on.
        tcid: u32,
        /// Reply channel.
        reply: Sender<(GenStats, TcpStats)>,
    },
    /// Stop the poll loop.
    Shutdown,
}

/// Per-test-case runtime state on one worker: configuration, statistics
/// and the scheduling queues the poll loop consumes.
#[derive(Debug)]
pub struct TestCaseRuntime {
    /// Immutable test case configuration.
    pub cfg: TestCaseConfig,
    /// Generator statistics for this test case.
    pub gen_stats: GenStats,
    /// Every control block ever allocated for this test case. Entries go
    /// stale when a cloned connection is released; walkers skip those.
    pub(crate) conns: Vec<CcbHandle>,
    pub(crate) to_init: VecDeque<CcbHandle>,
    pub(crate) to_open: VecDeque<CcbHandle>,
    pub(crate) to_send: VecDeque<CcbHandle>,
    pub(crate) to_close: VecDeque<CcbHandle>,
    pub(crate) closed: VecDeque<CcbHandle>,
}

impl TestCaseRuntime {
    fn new(cfg: TestCaseConfig) -> TestCaseRuntime {
        TestCaseRuntime {
            cfg,
            gen_stats: GenStats::default(),
            conns: Vec::new(),
            to_init: VecDeque::new(),
            to_open: VecDeque::new(),
            to_send: VecDeque::new(),
            to_close: VecDeque::new(),
            closed: VecDeque::new(),
        }
    }

    pub(crate) fn queue_mut(&mut self, queue: TestQueue) -> &mut VecDeque<CcbHandle> {
        match queue {
            TestQueue::ToInit => &mut self.to_init,
            TestQueue::ToOpen => &mut self.to_open,
            TestQueue::ToSend => &mut self.to_send,
            TestQueue::ToClose => &mut self.to_close,
            TestQueue::Closed => &mut self.closed,
        }
    }
}

/// A single worker core's private state.
#[derive(Debug)]
pub struct Worker {
    /// Worker (core) id, for diagnostics only.
    pub id: u32,
    /// Monotonic time of the current poll iteration, microseconds.
    pub(crate) now_us: u64,
    pub(crate) ccbs: CcbPool,
    pub(crate) tcp_table: ConnectionTable<CcbHandle>,
    pub(crate) udp_table: ConnectionTable<CcbHandle>,
    pub(crate) slow_wheel: TimerWheel<CcbHandle>,
    pub(crate) rto_wheel: TimerWheel<CcbHandle>,
    pub(crate) test_wheel: TimerWheel<CcbHandle>,
    pub(crate) tcp_stats: TcpStats,
    pub(crate) udp_stats: UdpStats,
    pub(crate) test_cases: HashMap<u32, TestCaseRuntime>,
    pub(crate) tx: VecDeque<OutPacket>,
    /// Scratch buffer reused across wheel advances.
    fired: Vec<(CcbHandle, TimerHandle)>,
}

impl Worker {
    /// Creates a worker with a control block pool of `capacity`, starting
    /// its clock at `now_us`.
    pub fn new(id: u32, capacity: usize, now_us: u64) -> Worker {
        Worker {
            id,
            now_us,
            ccbs: CcbPool::new(capacity),
            tcp_table: ConnectionTable::new(),
            udp_table: ConnectionTable::new(),
            slow_wheel: TimerWheel::new(SLOW_TMR_MAX_US, SLOW_TMR_STEP_US, now_us),
            rto_wheel: TimerWheel::new(RTO_TMR_MAX_US, RTO_TMR_STEP_US, now_us),
            test_wheel: TimerWheel::new(TEST_TMR_MAX_US, TEST_TMR_STEP_US, now_us),
            tcp_stats: TcpStats::default(),
            udp_stats: UdpStats::default(),
            test_cases: HashMap::new(),
            tx: VecDeque::new(),
            fired: Vec::new(),
        }
    }

    /// Current poll-iteration timestamp in microseconds.
    pub fn now_us(&self) -> u64 {
        self.now_us
    }

    /// TCP statistics of this worker.
    pub fn tcp_stats(&self) -> &TcpStats {
        &self.tcp_stats
    }

    /// UDP statistics of this worker.
    pub fn udp_stats(&self) -> &UdpStats {
        &self.udp_stats
    }

    /// Cancels every timer of a connection and returns its control block
    /// to the pool. Lookup table entries must already be gone.
    pub(crate) fn release_ccb(&mut self, handle: CcbHandle) {
        let Some(ccb) = self.ccbs.get_mut(handle) else {
            return;
        };

        if let Some(tmr) = ccb.session.test_tmr.take() {
            self.test_wheel.cancel(tmr, handle);
        }
        if let ProtoCb::Tcp(ref mut tcp) = ccb.proto {
            if let Some(tmr) = tcp.rto_tmr.take() {
                self.rto_wheel.cancel(tmr, handle);
            }
            if let Some(tmr) = tcp.slow_tmr.take() {
                self.slow_wheel.cancel(tmr, handle);
            }
        }

        self.ccbs.release(handle);
    }

    /// Generator statistics of one test case.
    pub fn gen_stats(&self, tcid: u32) -> Option<&GenStats> {
        self.test_cases.get(&tcid).map(|tc| &tc.gen_stats)
    }

    /// Drains the packets queued for transmission.
    pub fn drain_tx(&mut self) -> Vec<OutPacket> {
        self.tx.drain(..).collect()
    }

    pub(crate) fn ccb_mut(&mut self, handle: CcbHandle) -> Result<&mut crate::ccb::Ccb> {
        self.ccbs.get_mut(handle).ok_or(Error::StaleHandle)
    }

    pub(crate) fn runtime_mut(&mut self, tcid: u32) -> Result<&mut TestCaseRuntime> {
        self.test_cases
            .get_mut(&tcid)
            .ok_or(Error::UnknownTestCase(tcid))
    }

    /// Installs a test case and schedules all its sessions for
    /// initialization.
    pub fn start_test_case(&mut self, cfg: TestCaseConfig) -> Result<()> {
        let tcid = cfg.tcid;
        info!("worker {}: starting test case {tcid}", self.id);

        let runtime = TestCaseRuntime::new(cfg);
        self.test_cases.insert(tcid, runtime);

        let flows = self.test_cases[&tcid].cfg.flows.clone();
        for flow in flows {
            let handle = self.session_create(tcid, flow)?;
            let runtime = self.runtime_mut(tcid)?;
            runtime.conns.push(handle);
        }

        Ok(())
    }

    /// Purges every session of a test case and forgets it.
    pub fn stop_test_case(&mut self, tcid: u32) -> Result<()> {
        info!("worker {}: stopping test case {tcid}", self.id);

        let conns = match self.test_cases.get(&tcid) {
            Some(tc) => tc.conns.clone(),
            None => return Err(Error::UnknownTestCase(tcid)),
        };

        for handle in conns {
            // Stale handles are connections already torn down.
            if self.ccbs.get(handle).is_some() {
                self.session_purge(handle);
            }
        }

        self.test_cases.remove(&tcid);
        Ok(())
    }

    /// Feeds one received packet into the engine.
    pub fn rx_packet(&mut self, pkt: PacketDescriptor) {
        match pkt.proto {
            crate::config::L4Proto::Tcp => self.rx_tcp_segment(pkt),
            crate::config::L4Proto::Udp => self.rx_udp_datagram(pkt),
        }
    }

    fn rx_tcp_segment(&mut self, pkt: PacketDescriptor) {
        match self.tcp_table.find(pkt.interface, pkt.flow) {
            Some(handle) => {
                self.tcp_stats.recv_pkts += 1;
                self.tcp_stats.recv_bytes += pkt.payload.len() as u64;

                if let Err(err) = self.tcp_dispatch(handle, TcpEvent::Segment(pkt)) {
                    debug!("worker {}: segment dropped: {err}", self.id);
                }
            }
            None => self.reset_unknown(pkt),
        }
    }

    fn rx_udp_datagram(&mut self, pkt: PacketDescriptor) {
        match self.udp_table.find(pkt.interface, pkt.flow) {
            Some(handle) => self.udp_receive(handle, pkt),
            None => debug!("worker {}: datagram for unknown flow dropped", self.id),
        }
    }

    /// RFC 793: a segment for a nonexistent connection gets a RST, unless
    /// it carries one itself.
    fn reset_unknown(&mut self, pkt: PacketDescriptor) {
        if pkt.seg.flags.rst() {
            return;
        }

        let seg = if pkt.seg.flags.ack() {
            SegmentMeta {
                seq: pkt.seg.ack,
                ack: 0,
                flags: TcpFlags::RST,
                window: 0,
                urgent: 0,
            }
        } else {
            SegmentMeta {
                seq: 0,
                ack: pkt.seg.seq.wrapping_add(pkt.seg_len()),
                flags: TcpFlags::RST.with(TcpFlags::ACK),
                window: 0,
                urgent: 0,
            }
        };

        self.tcp_stats.sent_ctrl_pkts += 1;
        self.tx.push_back(OutPacket {
            interface: pkt.interface,
            flow: pkt.flow,
            seg,
            payload: Vec::new(),
        });
    }

    /// One poll iteration: advance the wheels, then walk the scheduling
    /// queues. Packet input happens between polls through
    /// [`Worker::rx_packet`].
    pub fn poll(&mut self, now_us: u64) {
        self.now_us = now_us;

        self.advance_rto_wheel();
        self.advance_slow_wheel();
        self.advance_test_wheel();

        self.walk_queues();
    }

    fn advance_rto_wheel(&mut self) {
        let mut fired = std::mem::take(&mut self.fired);
        fired.clear();
        self.rto_wheel.advance(self.now_us, &mut fired);

        for &(handle, tmr) in &fired {
            let Some(ccb) = self.ccbs.get_mut(handle) else {
                continue;
            };
            let ProtoCb::Tcp(ref mut tcp) = ccb.proto else {
                continue;
            };

            // The armed field is the source of truth; a mismatch means
            // the timer was logically canceled and this expiry is stale.
            if tcp.rto_tmr != Some(tmr) {
                continue;
            }
            tcp.rto_tmr = None;

            let _ = self.tcp_dispatch(handle, TcpEvent::RetransTimeout);
        }

        self.fired = fired;
    }

    fn advance_slow_wheel(&mut self) {
        let mut fired = std::mem::take(&mut self.fired);
        fired.clear();
        self.slow_wheel.advance(self.now_us, &mut fired);

        for &(handle, tmr) in &fired {
            let Some(ccb) = self.ccbs.get_mut(handle) else {
                continue;
            };
            let ProtoCb::Tcp(ref mut tcp) = ccb.proto else {
                continue;
            };

            if tcp.slow_tmr != Some(tmr) {
                continue;
            }
            tcp.slow_tmr = None;

            let event = match tcp.state {
                TcbState::FIN_WAIT_1 => TcpEvent::OrphanTimeout,
                TcbState::FIN_WAIT_2 => TcpEvent::FinTimeout,
                TcbState::TIME_WAIT => TcpEvent::TimeWaitTimeout,
                _ => TcpEvent::UserTimeout,
            };

            let _ = self.tcp_dispatch(handle, event);
        }

        self.fired = fired;
    }

    fn advance_test_wheel(&mut self) {
        let mut fired = std::mem::take(&mut self.fired);
        fired.clear();
        self.test_wheel.advance(self.now_us, &mut fired);

        for &(handle, tmr) in &fired {
            let Some(ccb) = self.ccbs.get_mut(handle) else {
                continue;
            };

            if ccb.session.test_tmr != Some(tmr) {
                continue;
            }
            ccb.session.test_tmr = None;

            self.session_timeout(handle);
        }

        self.fired = fired;
    }

    /// Walks every test case's scheduling queues once: initialize, open,
    /// send and close whatever is due.
    fn walk_queues(&mut self) {
        let tcids: Vec<u32> = self.test_cases.keys().copied().collect();

        for tcid in tcids {
            self.walk_to_init(tcid);
            self.walk_to_open(tcid);
            self.walk_to_send(tcid);
            self.walk_to_close(tcid);
        }
    }

    fn pop_queue(&mut self, tcid: u32, queue: TestQueue) -> Option<CcbHandle> {
        let runtime = self.test_cases.get_mut(&tcid)?;

        while let Some(handle) = runtime.queue_mut(queue).pop_front() {
            // Membership field is authoritative; skip lazily removed
            // entries and released control blocks.
            match self.ccbs.get_mut(handle) {
                Some(ccb) if ccb.session.on_queue == Some(queue) => {
                    ccb.session.on_queue = None;
                    return Some(handle);
                }
                _ => continue,
            }
        }

        None
    }

    fn walk_to_init(&mut self, tcid: u32) {
        let Some(runtime) = self.test_cases.get_mut(&tcid) else {
            return;
        };

        let budget = runtime.to_init.len();
        for _ in 0..budget {
            let Some(handle) = self.pop_queue(tcid, TestQueue::ToInit) else {
                break;
            };
            self.session_initialize(handle);
        }
    }

    fn walk_to_open(&mut self, tcid: u32) {
        let Some(runtime) = self.test_cases.get_mut(&tcid) else {
            return;
        };

        let budget = runtime.to_open.len();
        for _ in 0..budget {
            let Some(handle) = self.pop_queue(tcid, TestQueue::ToOpen) else {
                break;
            };
            self.session_open_conn(handle);
        }
    }

    fn walk_to_send(&mut self, tcid: u32) {
        let Some(runtime) = self.test_cases.get_mut(&tcid) else {
            return;
        };

        let budget = runtime.to_send.len();
        for _ in 0..budget {
            let Some(handle) = self.pop_queue(tcid, TestQueue::ToSend) else {
                break;
            };
            self.session_send_data(handle);
        }
    }

    fn walk_to_close(&mut self, tcid: u32) {
        let Some(runtime) = self.test_cases.get_mut(&tcid) else {
            return;
        };

        let budget = runtime.to_close.len();
        for _ in 0..budget {
            let Some(handle) = self.pop_queue(tcid, TestQueue::ToClose) else {
                break;
            };
            self.session_close_conn(handle);
        }
    }

    fn handle_msg(&mut self, msg: WorkerMsg) -> bool {
        match msg {
            WorkerMsg::StartTestCase(cfg) => {
                if let Err(err) = self.start_test_case(cfg) {
                    crate::error!("worker {}: start failed: {err}", self.id);
                }
            }
            WorkerMsg::StopTestCase { tcid } => {
                if let Err(err) = self.stop_test_case(tcid) {
                    crate::error!("worker {}: stop failed: {err}", self.id);
                }
            }
            WorkerMsg::FetchStats { tcid, reply } => {
                let gstats = self
                    .gen_stats(tcid)
                    .cloned()
                    .unwrap_or_default();
                let _ = reply.send((gstats, self.tcp_stats.clone()));
            }
            WorkerMsg::Shutdown => return false,
        }

        true
    }

    /// Runs the worker until shutdown: drain the inbox, drain a batch of
    /// received packets, poll, and hand outgoing packets to `tx_out`.
    ///
    /// Packet I/O is modeled as channels here; a deployment wires these to
    /// its actual receive/transmit paths.
    pub fn run(
        mut self,
        inbox: Receiver<WorkerMsg>,
        rx_in: Receiver<PacketDescriptor>,
        tx_out: Sender<OutPacket>,
    ) {
        let epoch = Instant::now();

        loop {
            loop {
                match inbox.try_recv() {
                    Ok(msg) => {
                        if !self.handle_msg(msg) {
                            return;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return,
                }
            }

            // A bounded batch per iteration keeps timer processing fair.
            for _ in 0..64 {
                match rx_in.try_recv() {
                    Ok(pkt) => self.rx_packet(pkt),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return,
                }
            }

            self.poll(epoch.elapsed().as_micros() as u64);

            for pkt in self.tx.drain(..) {
                if tx_out.send(pkt).is_err() {
                    return;
                }
            }

            std::thread::yield_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, Delay, L4Proto, TcpSockOpt, TestCriteria, TestRole};
    use crate::packet::FlowTuple;
    use crate::session::SessionState;
    use std::net::Ipv4Addr;

    fn flow() -> FlowTuple {
        FlowTuple {
            local_addr: Ipv4Addr::new(10, 0, 0, 1),
            remote_addr: Ipv4Addr::new(10, 0, 0, 2),
            local_port: 40_000,
            remote_port: 80,
        }
    }

    fn cycling_cfg() -> TestCaseConfig {
        TestCaseConfig {
            tcid: 1,
            interface: 0,
            role: TestRole::Client,
            proto: L4Proto::Tcp,
            flows: vec![flow()],
            init_delay: Delay::Us(0),
            uptime: Delay::Us(1_000),
            downtime: Delay::Us(1_000),
            criteria: TestCriteria::ClUp(1),
            app: AppConfig::Raw {
                req_size: 100,
                resp_size: 50,
            },
            sockopt: TcpSockOpt {
                skip_timewait: true,
                ..TcpSockOpt::default()
            },
        }
    }

    fn rx(w: &mut Worker, seq: u32, ack: u32, flags: TcpFlags, payload: Vec<u8>) {
        w.rx_packet(PacketDescriptor {
            interface: 0,
            proto: crate::config::L4Proto::Tcp,
            flow: flow(),
            seg: crate::packet::SegmentMeta {
                seq,
                ack,
                flags,
                window: 65_535,
                urgent: 0,
            },
            payload,
            rx_tstamp_us: 0,
        });
    }

    fn iss_of(w: &Worker, h: CcbHandle) -> u32 {
        w.ccbs.get(h).unwrap().tcp().unwrap().snd.iss
    }

    #[test]
    fn session_cycles_through_uptime_and_downtime() {
        let mut w = Worker::new(0, 8, 0);
        w.start_test_case(cycling_cfg()).unwrap();
        let h = w.test_cases[&1].conns[0];

        // First open.
        w.poll(100);
        let iss = iss_of(&w, h);
        rx(&mut w, 5000, iss.wrapping_add(1), TcpFlags::SYN.with(TcpFlags::ACK), Vec::new());
        assert_eq!(w.gen_stats(1).unwrap().up, 1);
        // The uptime deadline survives the hop into Sending.
        assert!(w.ccbs.get(h).unwrap().session.test_tmr.is_some());

        // Request goes out and gets acknowledged.
        w.poll(200);
        rx(&mut w, 5001, iss.wrapping_add(101), TcpFlags::ACK, Vec::new());
        w.drain_tx();

        // Uptime expires: the session closes its side; the peer answers
        // and (with TIME_WAIT skipped) the connection dies immediately.
        w.poll(2_000);
        let fin = w.drain_tx();
        assert!(fin.last().unwrap().seg.flags.fin());
        rx(&mut w, 5001, iss.wrapping_add(102), TcpFlags::ACK, Vec::new());
        rx(&mut w, 5001, iss.wrapping_add(102), TcpFlags::FIN.with(TcpFlags::ACK), Vec::new());

        assert_eq!(w.ccbs.get(h).unwrap().session.state, SessionState::Closed);
        assert_eq!(w.gen_stats(1).unwrap().down, 1);
        assert!(w.tcp_table.find(0, flow()).is_none());
        // Configured endpoints survive the close for the next cycle.
        assert_eq!(w.ccbs.in_use(), 1);

        // Downtime expires: the same control block opens again.
        w.poll(4_100);
        let syn = w.drain_tx();
        assert_eq!(syn.len(), 1);
        assert!(syn[0].seg.flags.syn());

        let iss2 = iss_of(&w, h);
        rx(&mut w, 9000, iss2.wrapping_add(1), TcpFlags::SYN.with(TcpFlags::ACK), Vec::new());
        assert_eq!(w.gen_stats(1).unwrap().up, 2);
        assert_eq!(w.gen_stats(1).unwrap().down, 1);
    }

    #[test]
    fn stop_test_case_aborts_live_connections() {
        let mut w = Worker::new(0, 8, 0);
        w.start_test_case(cycling_cfg()).unwrap();
        let h = w.test_cases[&1].conns[0];

        w.poll(100);
        let iss = iss_of(&w, h);
        rx(&mut w, 5000, iss.wrapping_add(1), TcpFlags::SYN.with(TcpFlags::ACK), Vec::new());
        w.drain_tx();

        w.stop_test_case(1).unwrap();

        // The abort went out as a RST and everything was torn down.
        let out = w.drain_tx();
        assert!(out.last().unwrap().seg.flags.rst());
        assert_eq!(w.ccbs.in_use(), 0);
        assert!(w.tcp_table.find(0, flow()).is_none());
        assert!(w.test_cases.is_empty());
        assert!(w.gen_stats(1).is_none());

        // Packets for the dead flow now get the unknown-connection reset.
        rx(&mut w, 5001, iss.wrapping_add(1), TcpFlags::ACK, Vec::new());
        assert!(w.drain_tx().last().unwrap().seg.flags.rst());
    }

    #[test]
    fn stale_queue_entries_are_skipped() {
        let mut w = Worker::new(0, 8, 0);
        w.start_test_case(cycling_cfg()).unwrap();
        let h = w.test_cases[&1].conns[0];

        // Force a disagreement between the queue and the session.
        w.ccbs.get_mut(h).unwrap().session.on_queue = None;
        assert!(w.pop_queue(1, TestQueue::ToInit).is_none());

        // The walk tolerates it and the session simply stays put.
        w.poll(100);
        assert_eq!(
            w.ccbs.get(h).unwrap().session.state,
            SessionState::ToInit
        );
    }
}
