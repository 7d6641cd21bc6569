//! The load-test session state machine.
//!
//! A session is the test lifecycle riding on top of one connection: it
//! decides when the connection opens, how long it stays up, when it closes
//! and when it reopens. Sessions never touch the wire themselves; they
//! drive the TCP/UDP engines through open/send/close requests and react to
//! the notifications those engines raise back.
//!
//! Sessions waiting for the engine sit in per-test-case scheduling queues
//! (to-init, to-open, to-send, to-close) consumed by the worker's poll
//! loop. Queue membership is lazy: the `on_queue` field on the session is
//! authoritative and stale queue entries are skipped when popped.

use crate::ccb::{Ccb, CcbHandle, ProtoCb, TcpCb, UdpCb};
use crate::config::{Delay, L4Proto, TestRole};
use crate::packet::FlowTuple;
use crate::tcp::{TcbState, TcpEvent};
use crate::udp::UcbState;
use crate::worker::Worker;
use crate::{Result, debug};

/// Session lifecycle states. Client sessions cycle through the full ring;
/// server sessions are spawned in `Opening` by their listener and never
/// reopen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Waiting for the initial delay decision.
    #[default]
    ToInit,
    /// Queued for opening.
    ToOpen,
    /// Open issued, waiting for the connection to establish.
    Opening,
    /// Connection up, application idle.
    Open,
    /// Connection up, application sending.
    Sending,
    /// Application wants to send but the peer window is closed.
    NoSndWin,
    /// Queued for closing.
    ToClose,
    /// Close issued, waiting for the connection to finish.
    Closing,
    /// Connection down; clients wait out the downtime here.
    Closed,
    /// Listener session of a server test case.
    Listen,
    /// Torn down by a test stop; terminal.
    Purged,
}

/// The per-test-case scheduling queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestQueue {
    /// Sessions awaiting their initial-delay decision.
    ToInit,
    /// Sessions due to open their connection.
    ToOpen,
    /// Sessions with application data to push.
    ToSend,
    /// Sessions due to close their connection.
    ToClose,
    /// Sessions that finished a close; kept for accounting.
    Closed,
}

/// Session state attached to every control block.
#[derive(Debug, Default)]
pub struct Session {
    /// Current lifecycle state.
    pub state: SessionState,
    /// Which scheduling queue this session is live on, if any. This field
    /// is the source of truth; queue entries that disagree are stale.
    pub on_queue: Option<TestQueue>,
    /// Membership in the test timer wheel (init delay, uptime, downtime).
    pub test_tmr: Option<crate::timer::TimerHandle>,
    /// The session has been up at least once since it last opened.
    pub(crate) was_up: bool,
}

/// Notifications the transport engines raise into the session machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnNotif {
    /// Handshake under way.
    Connecting,
    /// Connection established.
    Connected,
    /// Orderly teardown started (locally or by the peer).
    Closing,
    /// Connection fully down.
    Closed,
    /// Send window opened up again.
    WinAvailable,
    /// Send window is full.
    WinUnavailable,
}

impl Worker {
    /// Allocates the control block and session for one configured flow of
    /// a test case.
    pub(crate) fn session_create(&mut self, tcid: u32, flow: FlowTuple) -> Result<CcbHandle> {
        let cfg = &self.test_cases[&tcid].cfg;
        let (role, proto, interface) = (cfg.role, cfg.proto, cfg.interface);
        let app = crate::app::build(&cfg.app, role);
        let sockopt = cfg.sockopt.clone();

        let proto_cb = match proto {
            L4Proto::Tcp => ProtoCb::Tcp(TcpCb::new(sockopt)),
            L4Proto::Udp => ProtoCb::Udp(UdpCb {
                state: UcbState::Init,
            }),
        };

        let ccb = Ccb {
            interface,
            flow,
            tcid,
            active: role == TestRole::Client,
            ephemeral: false,
            session: Session::default(),
            app,
            proto: proto_cb,
        };

        let handle = self.ccbs.alloc(ccb)?;
        match proto {
            L4Proto::Tcp => self.tcp_stats.tcb_allocated += 1,
            L4Proto::Udp => self.udp_stats.ucb_allocated += 1,
        }

        match role {
            TestRole::Client => self.session_enter(handle, SessionState::ToInit),
            TestRole::Server => {
                match proto {
                    L4Proto::Tcp => self.tcp_listen(handle)?,
                    L4Proto::Udp => self.udp_listen(handle)?,
                }
                if let Some(ccb) = self.ccbs.get_mut(handle) {
                    ccb.session.state = SessionState::Listen;
                }
            }
        }

        Ok(handle)
    }

    /// Spawns the session of a connection cloned off a listener. The
    /// transport side is already set up by the caller.
    pub(crate) fn session_spawn_server(&mut self, handle: CcbHandle) {
        if let Some(ccb) = self.ccbs.get_mut(handle) {
            ccb.session.state = SessionState::Opening;
        }
    }

    /// To-init queue walker: decides what the initial delay means for one
    /// session.
    pub(crate) fn session_initialize(&mut self, handle: CcbHandle) {
        let Some(ccb) = self.ccbs.get(handle) else {
            return;
        };
        if ccb.session.state != SessionState::ToInit {
            return;
        }

        let init_delay = self.test_cases[&ccb.tcid].cfg.init_delay;
        match init_delay {
            // Zero skips the timer wheel entirely.
            Delay::Us(0) => self.session_enter(handle, SessionState::ToOpen),
            Delay::Us(us) => self.session_arm_timer(handle, us),
            // Opens only when the test is stopped, i.e. never.
            Delay::Infinite => {}
        }
    }

    /// To-open queue walker: issues the transport open.
    pub(crate) fn session_open_conn(&mut self, handle: CcbHandle) {
        let Some(ccb) = self.ccbs.get(handle) else {
            return;
        };
        if ccb.session.state != SessionState::ToOpen {
            return;
        }

        match ccb.proto {
            ProtoCb::Tcp(_) => {
                if let Err(err) = self.tcp_dispatch(handle, TcpEvent::Open) {
                    debug!("session open failed: {err}");
                    self.session_conn_notif(handle, ConnNotif::Closed);
                }
            }
            ProtoCb::Udp(_) => {
                if let Err(err) = self.udp_open(handle) {
                    debug!("session open failed: {err}");
                    self.session_conn_notif(handle, ConnNotif::Closed);
                }
            }
        }
    }

    /// To-send queue walker: pulls one chunk from the application and
    /// pushes it into the transport. Sessions still sending requeue
    /// themselves.
    pub(crate) fn session_send_data(&mut self, handle: CcbHandle) {
        let Some(ccb) = self.ccbs.get_mut(handle) else {
            return;
        };
        if ccb.session.state != SessionState::Sending {
            return;
        }
        let tcid = ccb.tcid;

        let max = match ccb.proto {
            ProtoCb::Tcp(ref tcp) => crate::tcp::data::avail_send(tcp),
            ProtoCb::Udp(_) => self.test_cases[&tcid].cfg.sockopt.mss,
        };

        if max == 0 {
            // Send buffer full; the window notification resumes us.
            self.session_conn_notif(handle, ConnNotif::WinUnavailable);
            return;
        }

        let sent = match self.ccbs.get_mut(handle) {
            Some(ccb) => ccb.app.send(max),
            None => return,
        };

        let Some(bytes) = sent else {
            // Application has nothing more to push right now.
            self.session_enter(handle, SessionState::Open);
            return;
        };

        let accepted = match self.ccbs.get(handle).map(|ccb| &ccb.proto) {
            Some(ProtoCb::Tcp(_)) => match self.tcp_send_data(handle, bytes) {
                Ok(n) => n,
                Err(err) => {
                    debug!("send failed: {err}");
                    return;
                }
            },
            Some(ProtoCb::Udp(_)) => match self.udp_send(handle, bytes) {
                Ok(n) => n,
                Err(err) => {
                    debug!("send failed: {err}");
                    return;
                }
            },
            None => return,
        };

        let Some(ccb) = self.ccbs.get_mut(handle) else {
            return;
        };
        let gstats = match self.test_cases.get_mut(&tcid) {
            Some(tc) => &mut tc.gen_stats,
            None => return,
        };

        let stop = ccb.app.data_sent(gstats, accepted);

        if stop {
            self.session_enter(handle, SessionState::Open);
        } else if self.ccbs.get(handle).map(|c| c.session.state) == Some(SessionState::Sending) {
            self.session_enqueue(handle, TestQueue::ToSend);
        }
    }

    /// To-close queue walker: issues the transport close.
    pub(crate) fn session_close_conn(&mut self, handle: CcbHandle) {
        let Some(ccb) = self.ccbs.get(handle) else {
            return;
        };
        if ccb.session.state != SessionState::ToClose {
            return;
        }

        match ccb.proto {
            ProtoCb::Tcp(_) => {
                let _ = self.tcp_dispatch(handle, TcpEvent::Close);
            }
            ProtoCb::Udp(_) => self.udp_close(handle),
        }
    }

    /// Test timer expiry for one session.
    pub(crate) fn session_timeout(&mut self, handle: CcbHandle) {
        let Some(ccb) = self.ccbs.get(handle) else {
            return;
        };

        match ccb.session.state {
            // Initial delay elapsed.
            SessionState::ToInit => self.session_enter(handle, SessionState::ToOpen),
            // Uptime elapsed.
            SessionState::Open | SessionState::Sending | SessionState::NoSndWin => {
                self.session_enter(handle, SessionState::ToClose)
            }
            // Downtime elapsed.
            SessionState::Closed => self.session_enter(handle, SessionState::ToOpen),
            _ => {}
        }
    }

    /// Transport notification fan-in.
    pub(crate) fn session_conn_notif(&mut self, handle: CcbHandle, notif: ConnNotif) {
        let Some(ccb) = self.ccbs.get(handle) else {
            return;
        };
        let state = ccb.session.state;
        let tcid = ccb.tcid;

        match (state, notif) {
            (SessionState::ToOpen | SessionState::Opening, ConnNotif::Connecting) => {
                if state == SessionState::ToOpen {
                    self.session_set_state(handle, SessionState::Opening);
                }
            }
            // UDP opens establish by fiat, before the session ever saw a
            // Connecting notification.
            (SessionState::ToOpen | SessionState::Opening, ConnNotif::Connected) => {
                if let Some(tc) = self.test_cases.get_mut(&tcid) {
                    tc.gen_stats.estab += 1;
                }
                self.session_enter(handle, SessionState::Open);
            }
            (SessionState::ToOpen | SessionState::Opening, ConnNotif::Closed) => {
                // Never came up: a failed open attempt.
                if let Some(tc) = self.test_cases.get_mut(&tcid) {
                    tc.gen_stats.failed += 1;
                }
                self.session_enter(handle, SessionState::Closed);
            }
            (
                SessionState::Open | SessionState::Sending | SessionState::NoSndWin,
                ConnNotif::Closing,
            ) => {
                // Peer started the teardown; close our side too.
                self.session_enter(handle, SessionState::ToClose)
            }
            (SessionState::ToClose, ConnNotif::Closing) => {
                // Our own close moving along once the session left the
                // queue; a peer FIN while still queued stays with the
                // walker.
                if self.ccbs.get(handle).and_then(|c| c.session.on_queue).is_none() {
                    self.session_set_state(handle, SessionState::Closing);
                }
            }
            (_, ConnNotif::Closed) => self.session_enter(handle, SessionState::Closed),
            (SessionState::NoSndWin, ConnNotif::WinAvailable) => {
                self.session_enter(handle, SessionState::Sending)
            }
            (SessionState::Sending, ConnNotif::WinUnavailable) => {
                self.session_set_state(handle, SessionState::NoSndWin);
            }
            _ => {}
        }
    }

    /// The application asked to start sending (raised from the deliver
    /// path).
    pub(crate) fn session_app_send_start(&mut self, handle: CcbHandle) {
        if self.ccbs.get(handle).map(|c| c.session.state) == Some(SessionState::Open) {
            self.session_enter(handle, SessionState::Sending);
        }
    }

    /// Tears a session down because its test case is stopping.
    pub(crate) fn session_purge(&mut self, handle: CcbHandle) {
        let Some(ccb) = self.ccbs.get_mut(handle) else {
            return;
        };
        ccb.session.state = SessionState::Purged;

        match ccb.proto {
            ProtoCb::Tcp(ref tcp) => {
                if tcp.state != TcbState::CLOSED && tcp.state != TcbState::INIT {
                    let _ = self.tcp_dispatch(handle, TcpEvent::Abort);
                }
            }
            ProtoCb::Udp(_) => self.udp_close(handle),
        }

        // The abort may already have released an ephemeral block.
        if self.ccbs.get(handle).is_some() {
            self.session_cancel_timer(handle);
            self.release_ccb(handle);
        }
    }

    fn session_set_state(&mut self, handle: CcbHandle, state: SessionState) {
        if let Some(ccb) = self.ccbs.get_mut(handle) {
            ccb.session.state = state;
            ccb.session.on_queue = None;
        }
    }

    /// Enters a session state and runs its entry actions.
    pub(crate) fn session_enter(&mut self, handle: CcbHandle, state: SessionState) {
        let Some(ccb) = self.ccbs.get(handle) else {
            return;
        };
        if ccb.session.state == SessionState::Purged {
            return;
        }
        let tcid = ccb.tcid;

        self.session_set_state(handle, state);

        // Only states that retire the current deadline cancel the test
        // timer. The uptime timer armed on first open must survive the
        // chained transition into Sending.
        if matches!(
            state,
            SessionState::ToInit | SessionState::ToClose | SessionState::Closed
        ) {
            self.session_cancel_timer(handle);
        }

        match state {
            SessionState::ToInit => self.session_enqueue(handle, TestQueue::ToInit),
            SessionState::ToOpen => self.session_enqueue(handle, TestQueue::ToOpen),
            SessionState::ToClose => self.session_enqueue(handle, TestQueue::ToClose),
            SessionState::Open => self.session_enter_open(handle, tcid),
            SessionState::Sending => self.session_enqueue(handle, TestQueue::ToSend),
            SessionState::Closed => self.session_enter_closed(handle, tcid),
            _ => {}
        }
    }

    fn session_enter_open(&mut self, handle: CcbHandle, tcid: u32) {
        let first_up = {
            let Some(ccb) = self.ccbs.get_mut(handle) else {
                return;
            };
            let first = !ccb.session.was_up;
            ccb.session.was_up = true;
            first
        };

        let mut start_sending = false;
        if first_up {
            let Some(ccb) = self.ccbs.get_mut(handle) else {
                return;
            };
            let Some(tc) = self.test_cases.get_mut(&tcid) else {
                return;
            };

            tc.gen_stats.up += 1;
            if tc.gen_stats.start_time_us == 0 {
                tc.gen_stats.start_time_us = self.now_us;
            }
            start_sending = ccb.app.conn_up(&mut tc.gen_stats);

            // Uptime runs from the moment the session first comes up.
            if let Some(us) = tc.cfg.uptime.finite_us() {
                self.session_arm_timer(handle, us);
            }
        }

        if start_sending {
            self.session_enter(handle, SessionState::Sending);
        }
    }

    fn session_enter_closed(&mut self, handle: CcbHandle, tcid: u32) {
        {
            let Some(ccb) = self.ccbs.get_mut(handle) else {
                return;
            };
            let was_up = ccb.session.was_up;
            ccb.session.was_up = false;
            if was_up {
                if let Some(tc) = self.test_cases.get_mut(&tcid) {
                    tc.gen_stats.down += 1;
                    ccb.app.conn_down(&mut tc.gen_stats);
                }
            }
        }

        let Some(ccb) = self.ccbs.get(handle) else {
            return;
        };

        if ccb.ephemeral {
            // Server connections die with their TCP state; nothing left
            // for the session to do.
            return;
        }

        self.session_enqueue(handle, TestQueue::Closed);

        let downtime = match self.test_cases.get(&tcid) {
            Some(tc) => tc.cfg.downtime,
            None => return,
        };
        if let Some(us) = downtime.finite_us() {
            self.session_arm_timer(handle, us);
        }
    }

    pub(crate) fn session_enqueue(&mut self, handle: CcbHandle, queue: TestQueue) {
        let Some(ccb) = self.ccbs.get_mut(handle) else {
            return;
        };
        if ccb.session.on_queue == Some(queue) {
            return;
        }
        ccb.session.on_queue = Some(queue);
        let tcid = ccb.tcid;

        if let Some(tc) = self.test_cases.get_mut(&tcid) {
            tc.queue_mut(queue).push_back(handle);
        }
    }

    fn session_arm_timer(&mut self, handle: CcbHandle, timeout_us: u64) {
        self.session_cancel_timer(handle);

        match self.test_wheel.schedule(self.now_us, timeout_us, handle) {
            Ok(tmr) => {
                if let Some(ccb) = self.ccbs.get_mut(handle) {
                    ccb.session.test_tmr = Some(tmr);
                }
            }
            Err(err) => debug!("test timer not armed: {err}"),
        }
    }

    fn session_cancel_timer(&mut self, handle: CcbHandle) {
        let Some(ccb) = self.ccbs.get_mut(handle) else {
            return;
        };
        if let Some(tmr) = ccb.session.test_tmr.take() {
            self.test_wheel.cancel(tmr, handle);
        }
    }
}
