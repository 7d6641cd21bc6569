//! The TCP connection state machine.
//!
//! Dispatch is a two-level match: the connection's current state selects a
//! handler, the handler matches on the event. State changes go through
//! [`Worker::tcp_enter_state`] exclusively, which keeps the per-state
//! gauges honest, tells the session machine, and runs the new state's entry
//! actions.
//!
//! Segment processing for the synchronized states follows the unified
//! SEGMENT ARRIVES procedure of RFC 793 section 3.9, reduced to what a
//! traffic generator needs: every acceptable data byte is acknowledged
//! immediately and delivered through reassembly, and there is no congestion
//! control or urgent-pointer handling.

use crate::ccb::{Ccb, CcbHandle, ProtoCb, TcpCb};
use crate::packet::{FlowTuple, OutPacket, PacketDescriptor, SegmentMeta, TcpFlags};
use crate::seq::{seq_between, seq_diff, seq_geq, seq_gt, seq_leq, seq_lt};
use crate::session::ConnNotif;
use crate::tcp::data::{self, ReassemblyList, RetransQueue};
use crate::tcp::{TcbState, TcpEvent};
use crate::worker::Worker;
use crate::{Error, Result, debug};

/// Everything a handler needs to build an outgoing segment once its
/// control block borrow has ended.
#[derive(Debug, Clone, Copy)]
struct TxInfo {
    interface: u32,
    flow: FlowTuple,
    rcv_nxt: u32,
    rcv_wnd: u32,
}

impl TxInfo {
    fn of(ccb: &Ccb, tcp: &TcpCb) -> TxInfo {
        TxInfo {
            interface: ccb.interface,
            flow: ccb.flow,
            rcv_nxt: tcp.rcv.nxt,
            rcv_wnd: tcp.rcv.wnd,
        }
    }
}

impl Worker {
    /// Dispatches one event into the state machine of a connection.
    pub(crate) fn tcp_dispatch(&mut self, handle: CcbHandle, event: TcpEvent) -> Result<()> {
        let ccb = self.ccb_mut(handle)?;
        let Some(tcp) = ccb.tcp() else {
            return Err(Error::StaleHandle);
        };
        let state = tcp.state;

        debug!("[{}] {} <- {}", ccb.flow, state, event.as_str());

        match state {
            TcbState::INIT => self.tcp_st_init(handle, event),
            TcbState::LISTEN => self.tcp_st_listen(handle, event),
            TcbState::SYN_SENT => self.tcp_st_syn_sent(handle, event),
            TcbState::SYN_RECEIVED
            | TcbState::ESTABLISHED
            | TcbState::FIN_WAIT_1
            | TcbState::FIN_WAIT_2
            | TcbState::CLOSE_WAIT
            | TcbState::CLOSING
            | TcbState::LAST_ACK
            | TcbState::TIME_WAIT => self.tcp_st_synchronized(handle, event),
            TcbState::CLOSED => self.tcp_st_closed(handle, event),
        }
    }

    /// Moves a connection into `state`: gauges, session notification, then
    /// the entry actions of the new state.
    fn tcp_enter_state(&mut self, handle: CcbHandle, state: TcbState) -> Result<()> {
        let old = {
            let ccb = self.ccb_mut(handle)?;
            let Some(tcp) = ccb.tcp_mut() else {
                return Err(Error::StaleHandle);
            };
            let old = tcp.state;
            tcp.state = state;
            old
        };

        if old == state {
            return Ok(());
        }

        // INIT is implicit: the gauge never counted it.
        if old != TcbState::INIT {
            self.tcp_stats.state_dec(old);
        }
        self.tcp_stats.state_inc(state);

        let notif = match state {
            TcbState::SYN_SENT | TcbState::SYN_RECEIVED => Some(ConnNotif::Connecting),
            TcbState::ESTABLISHED => Some(ConnNotif::Connected),
            TcbState::FIN_WAIT_1
            | TcbState::FIN_WAIT_2
            | TcbState::CLOSING
            | TcbState::LAST_ACK
            | TcbState::CLOSE_WAIT
            | TcbState::TIME_WAIT => Some(ConnNotif::Closing),
            TcbState::CLOSED => Some(ConnNotif::Closed),
            TcbState::INIT | TcbState::LISTEN => None,
        };
        if let Some(notif) = notif {
            self.session_conn_notif(handle, notif);
        }

        self.tcp_dispatch(handle, TcpEvent::Enter)
    }

    /// Registers a listening control block under its wildcard tuple.
    pub(crate) fn tcp_listen(&mut self, handle: CcbHandle) -> Result<()> {
        let ccb = self.ccb_mut(handle)?;
        let (interface, flow) = (ccb.interface, ccb.flow);

        self.tcp_table.insert(interface, flow, handle)?;
        self.tcp_enter_state(handle, TcbState::LISTEN)
    }

    /// Stages application bytes in the retransmission queue and pushes
    /// whatever the peer's window allows onto the wire. Returns how many
    /// bytes were accepted.
    pub(crate) fn tcp_send_data(&mut self, handle: CcbHandle, bytes: Vec<u8>) -> Result<usize> {
        let accepted = {
            let ccb = self.ccb_mut(handle)?;
            let Some(tcp) = ccb.tcp_mut() else {
                return Err(Error::StaleHandle);
            };

            match tcp.state {
                TcbState::ESTABLISHED | TcbState::CLOSE_WAIT => {}
                state => {
                    return Err(Error::InvalidEvent {
                        state: state.as_str(),
                        event: "SEND",
                    });
                }
            }

            let avail = data::avail_send(tcp);
            tcp.retrans.store(bytes, avail)
        };

        if accepted > 0 {
            self.tcp_dispatch(handle, TcpEvent::Send)?;
        }

        Ok(accepted)
    }

    // --- state handlers ---------------------------------------------------

    fn tcp_st_init(&mut self, handle: CcbHandle, event: TcpEvent) -> Result<()> {
        match event {
            TcpEvent::Open => self.tcp_do_open(handle),
            TcpEvent::Close | TcpEvent::Abort => self.tcp_enter_state(handle, TcbState::CLOSED),
            TcpEvent::Enter | TcpEvent::Status | TcpEvent::Receive => Ok(()),
            TcpEvent::Segment(_) => Ok(()),
            _ => Err(Error::InvalidEvent {
                state: TcbState::INIT.as_str(),
                event: event.as_str(),
            }),
        }
    }

    fn tcp_st_listen(&mut self, handle: CcbHandle, event: TcpEvent) -> Result<()> {
        match event {
            TcpEvent::Segment(pkt) => {
                if pkt.seg.flags.rst() {
                    return Ok(());
                }
                if pkt.seg.flags.ack() {
                    // Nothing was ever sent from here; whatever this
                    // acknowledges deserves a reset.
                    self.tcp_emit_rst(&pkt);
                    return Ok(());
                }
                if pkt.seg.flags.syn() {
                    return self.tcp_passive_open(handle, pkt);
                }
                Ok(())
            }
            TcpEvent::Close | TcpEvent::Abort => {
                let ccb = self.ccb_mut(handle)?;
                let (interface, flow) = (ccb.interface, ccb.flow);
                self.tcp_table.remove(interface, flow);
                self.tcp_enter_state(handle, TcbState::CLOSED)
            }
            TcpEvent::Enter | TcpEvent::Status => Ok(()),
            _ => Err(Error::InvalidEvent {
                state: TcbState::LISTEN.as_str(),
                event: event.as_str(),
            }),
        }
    }

    fn tcp_st_syn_sent(&mut self, handle: CcbHandle, event: TcpEvent) -> Result<()> {
        match event {
            TcpEvent::Segment(pkt) => self.tcp_syn_sent_segment(handle, pkt),
            TcpEvent::RetransTimeout => {
                self.tcp_stats.syn_to += 1;
                self.tcp_retry_or_close(handle, |sockopt| sockopt.syn_retry_cnt)
            }
            TcpEvent::Close | TcpEvent::Abort | TcpEvent::UserTimeout => {
                self.tcp_enter_state(handle, TcbState::CLOSED)
            }
            TcpEvent::Enter | TcpEvent::Status | TcpEvent::Receive => Ok(()),
            _ => Err(Error::InvalidEvent {
                state: TcbState::SYN_SENT.as_str(),
                event: event.as_str(),
            }),
        }
    }

    /// Handler for every synchronized state: SYN_RECEIVED through
    /// TIME_WAIT. What differs between them is encoded in the segment
    /// and timeout processing, not in the dispatch.
    fn tcp_st_synchronized(&mut self, handle: CcbHandle, event: TcpEvent) -> Result<()> {
        let state = self
            .ccb_mut(handle)?
            .tcp()
            .ok_or(Error::StaleHandle)?
            .state;

        match event {
            TcpEvent::Enter => self.tcp_entry_actions(handle, state),
            TcpEvent::Segment(pkt) => self.tcp_segment_arrives(handle, pkt),
            TcpEvent::Send => match state {
                TcbState::ESTABLISHED | TcbState::CLOSE_WAIT => self.tcp_push_data(handle),
                _ => Err(Error::InvalidEvent {
                    state: state.as_str(),
                    event: "SEND",
                }),
            },
            TcpEvent::Close => match state {
                TcbState::SYN_RECEIVED | TcbState::ESTABLISHED => {
                    self.tcp_send_fin(handle)?;
                    self.tcp_enter_state(handle, TcbState::FIN_WAIT_1)
                }
                TcbState::CLOSE_WAIT => {
                    self.tcp_send_fin(handle)?;
                    self.tcp_enter_state(handle, TcbState::LAST_ACK)
                }
                // Already closing; nothing more to ask for.
                _ => Ok(()),
            },
            TcpEvent::Abort => {
                self.tcp_send_rst_from(handle)?;
                self.tcp_enter_state(handle, TcbState::CLOSED)
            }
            TcpEvent::RetransTimeout => self.tcp_retrans_timeout(handle, state),
            TcpEvent::OrphanTimeout | TcpEvent::FinTimeout | TcpEvent::TimeWaitTimeout
            | TcpEvent::UserTimeout => self.tcp_enter_state(handle, TcbState::CLOSED),
            TcpEvent::Status | TcpEvent::Receive => Ok(()),
            TcpEvent::Open => Err(Error::InvalidEvent {
                state: state.as_str(),
                event: "OPEN",
            }),
        }
    }

    fn tcp_st_closed(&mut self, handle: CcbHandle, event: TcpEvent) -> Result<()> {
        match event {
            // Entry into CLOSED is the teardown point.
            TcpEvent::Enter => {
                self.tcp_teardown(handle);
                Ok(())
            }
            // Configured endpoints reopen in place.
            TcpEvent::Open => self.tcp_do_open(handle),
            TcpEvent::Close | TcpEvent::Abort | TcpEvent::Status => Ok(()),
            TcpEvent::Segment(_) => Ok(()),
            _ => Ok(()),
        }
    }

    // --- opens ------------------------------------------------------------

    /// Active open: pick an ISS, register the tuple, send the SYN.
    fn tcp_do_open(&mut self, handle: CcbHandle) -> Result<()> {
        let iss: u32 = rand::random();

        let (interface, flow, tx) = {
            let ccb = self.ccb_mut(handle)?;
            let (interface, flow) = (ccb.interface, ccb.flow);
            let Some(tcp) = ccb.tcp_mut() else {
                return Err(Error::StaleHandle);
            };

            tcp.snd.iss = iss;
            tcp.snd.una = iss;
            tcp.snd.nxt = iss.wrapping_add(1);
            tcp.snd.wnd = 0;
            tcp.snd.wl1 = 0;
            tcp.snd.wl2 = 0;
            tcp.rcv.nxt = 0;
            tcp.rcv.irs = 0;
            tcp.rcv.wnd = tcp.sockopt.win_size;
            tcp.retry_cnt = 0;
            tcp.retrans = RetransQueue::new();
            tcp.reasm = ReassemblyList::new();
            tcp.fin_pending = None;

            let tx = TxInfo::of(ccb, ccb.tcp().ok_or(Error::StaleHandle)?);
            (interface, flow, tx)
        };

        self.tcp_table.insert(interface, flow, handle)?;

        self.tcp_emit(tx, iss, 0, TcpFlags::SYN, Vec::new());
        self.tcp_schedule_rto(handle);
        self.tcp_enter_state(handle, TcbState::SYN_SENT)
    }

    /// Passive open: clone a fresh connection off the listener for the
    /// exact tuple of the SYN.
    fn tcp_passive_open(&mut self, listener: CcbHandle, pkt: PacketDescriptor) -> Result<()> {
        let (tcid, sockopt) = {
            let ccb = self.ccb_mut(listener)?;
            let Some(tcp) = ccb.tcp() else {
                return Err(Error::StaleHandle);
            };
            (ccb.tcid, tcp.sockopt.clone())
        };

        let app = {
            let cfg = &self.runtime_mut(tcid)?.cfg;
            crate::app::build(&cfg.app, cfg.role)
        };

        let iss: u32 = rand::random();
        let mut tcp = TcpCb::new(sockopt);
        tcp.snd.iss = iss;
        tcp.snd.una = iss;
        tcp.snd.nxt = iss.wrapping_add(1);
        tcp.snd.wnd = u32::from(pkt.seg.window);
        tcp.snd.wl1 = pkt.seg.seq;
        tcp.rcv.irs = pkt.seg.seq;
        tcp.rcv.nxt = pkt.seg.seq.wrapping_add(1);

        let ccb = Ccb {
            interface: pkt.interface,
            flow: pkt.flow,
            tcid,
            active: false,
            ephemeral: true,
            session: crate::session::Session::default(),
            app,
            proto: ProtoCb::Tcp(tcp),
        };

        let clone = self.ccbs.alloc(ccb)?;
        self.tcp_stats.tcb_allocated += 1;

        if let Err(err) = self.tcp_table.insert(pkt.interface, pkt.flow, clone) {
            self.ccbs.release(clone);
            return Err(err);
        }
        if let Ok(tc) = self.runtime_mut(tcid) {
            tc.conns.push(clone);
        }

        self.session_spawn_server(clone);

        let tx = {
            let ccb = self.ccb_mut(clone)?;
            TxInfo::of(ccb, ccb.tcp().ok_or(Error::StaleHandle)?)
        };
        self.tcp_emit(tx, iss, tx.rcv_nxt, TcpFlags::SYN.with(TcpFlags::ACK), Vec::new());
        self.tcp_schedule_rto(clone);
        self.tcp_enter_state(clone, TcbState::SYN_RECEIVED)
    }

    // --- SYN_SENT segment processing ---------------------------------------

    fn tcp_syn_sent_segment(&mut self, handle: CcbHandle, pkt: PacketDescriptor) -> Result<()> {
        let ack_ok = {
            let ccb = self.ccb_mut(handle)?;
            let Some(tcp) = ccb.tcp() else {
                return Err(Error::StaleHandle);
            };
            !pkt.seg.flags.ack() || seq_between(tcp.snd.iss, pkt.seg.ack, tcp.snd.nxt)
        };

        if !ack_ok {
            self.tcp_stats.invalid_pkts += 1;
            if !pkt.seg.flags.rst() {
                self.tcp_emit_rst(&pkt);
            }
            return Ok(());
        }

        if pkt.seg.flags.rst() {
            // Only meaningful when it acknowledges our SYN.
            if pkt.seg.flags.ack() {
                self.tcp_stats.rsts += 1;
                return self.tcp_enter_state(handle, TcbState::CLOSED);
            }
            return Ok(());
        }

        if !pkt.seg.flags.syn() {
            return Ok(());
        }

        let established = {
            let ccb = self.ccb_mut(handle)?;
            let Some(tcp) = ccb.tcp_mut() else {
                return Err(Error::StaleHandle);
            };

            tcp.rcv.irs = pkt.seg.seq;
            tcp.rcv.nxt = pkt.seg.seq.wrapping_add(1);

            if pkt.seg.flags.ack() {
                tcp.snd.una = pkt.seg.ack;
                tcp.snd.wnd = u32::from(pkt.seg.window);
                tcp.snd.wl1 = pkt.seg.seq;
                tcp.snd.wl2 = pkt.seg.ack;
                tcp.retry_cnt = 0;
                true
            } else {
                false
            }
        };

        if established {
            self.tcp_cancel_rto(handle);
            let (snd_nxt, tx) = self.tcp_tx_info(handle)?;
            self.tcp_emit(tx, snd_nxt, tx.rcv_nxt, TcpFlags::ACK, Vec::new());
            self.tcp_enter_state(handle, TcbState::ESTABLISHED)
        } else {
            // Simultaneous open: answer the SYN and wait for our own to
            // be acknowledged.
            let (_, tx) = self.tcp_tx_info(handle)?;
            let iss = {
                let ccb = self.ccb_mut(handle)?;
                ccb.tcp().ok_or(Error::StaleHandle)?.snd.iss
            };
            self.tcp_emit(tx, iss, tx.rcv_nxt, TcpFlags::SYN.with(TcpFlags::ACK), Vec::new());
            self.tcp_enter_state(handle, TcbState::SYN_RECEIVED)
        }
    }

    // --- unified SEGMENT ARRIVES for synchronized states --------------------

    fn tcp_segment_arrives(&mut self, handle: CcbHandle, pkt: PacketDescriptor) -> Result<()> {
        let state = self
            .ccb_mut(handle)?
            .tcp()
            .ok_or(Error::StaleHandle)?
            .state;

        // First: the acceptability test.
        if !self.tcp_acceptable(handle, &pkt)? {
            self.tcp_stats.invalid_pkts += 1;
            if !pkt.seg.flags.rst() {
                let (snd_nxt, tx) = self.tcp_tx_info(handle)?;
                self.tcp_emit(tx, snd_nxt, tx.rcv_nxt, TcpFlags::ACK, Vec::new());

                // A retransmitted FIN in TIME_WAIT restarts the 2MSL
                // clock along with the duplicate ACK.
                if state == TcbState::TIME_WAIT && pkt.seg.flags.fin() {
                    let twait = self.tcp_sockopt_us(handle, |s| s.twait_to_us)?;
                    self.tcp_arm_slow(handle, twait);
                }
            }
            return Ok(());
        }

        // Second: RST.
        if pkt.seg.flags.rst() {
            self.tcp_stats.rsts += 1;
            return self.tcp_enter_state(handle, TcbState::CLOSED);
        }

        // Third: a SYN in the window is a hard error.
        if pkt.seg.flags.syn() {
            self.tcp_send_rst_from(handle)?;
            return self.tcp_enter_state(handle, TcbState::CLOSED);
        }

        // Fourth: everything from here on requires an ACK.
        if !pkt.seg.flags.ack() {
            return Ok(());
        }

        let mut state = state;

        if state == TcbState::SYN_RECEIVED {
            let ok = {
                let ccb = self.ccb_mut(handle)?;
                let Some(tcp) = ccb.tcp_mut() else {
                    return Err(Error::StaleHandle);
                };
                if seq_between(tcp.snd.una, pkt.seg.ack, tcp.snd.nxt) {
                    // The peer's ACK covers our SYN, which occupies one
                    // sequence number that the retransmit queue never sees.
                    tcp.snd.una = tcp.snd.una.wrapping_add(1);
                    tcp.snd.wnd = u32::from(pkt.seg.window);
                    tcp.snd.wl1 = pkt.seg.seq;
                    tcp.snd.wl2 = pkt.seg.ack;
                    tcp.retry_cnt = 0;
                    true
                } else {
                    false
                }
            };

            if !ok {
                self.tcp_emit_rst(&pkt);
                return Ok(());
            }

            self.tcp_cancel_rto(handle);
            self.tcp_enter_state(handle, TcbState::ESTABLISHED)?;
            state = TcbState::ESTABLISHED;
        }

        // Fifth: ACK processing.
        let fin_acked = self.tcp_process_ack(handle, &pkt, state)?;

        match state {
            TcbState::LAST_ACK if fin_acked => {
                return self.tcp_enter_state(handle, TcbState::CLOSED);
            }
            TcbState::CLOSING if fin_acked => {
                return self.tcp_enter_state(handle, TcbState::TIME_WAIT);
            }
            TcbState::FIN_WAIT_1 if fin_acked => {
                self.tcp_enter_state(handle, TcbState::FIN_WAIT_2)?;
                state = TcbState::FIN_WAIT_2;
            }
            _ => {}
        }

        // Sixth: payload, through reassembly and the application.
        let mut send_ack = false;
        if !pkt.payload.is_empty() {
            match state {
                TcbState::ESTABLISHED | TcbState::FIN_WAIT_1 | TcbState::FIN_WAIT_2 => {
                    self.tcp_process_payload(handle, &pkt)?;
                    send_ack = true;
                }
                // The peer already sent its FIN; late data is ignored but
                // still acknowledged.
                _ => send_ack = true,
            }
        }

        // Seventh: FIN processing, including one parked earlier while data
        // was still missing.
        let fin_now = {
            let ccb = self.ccb_mut(handle)?;
            let Some(tcp) = ccb.tcp_mut() else {
                return Err(Error::StaleHandle);
            };

            if pkt.seg.flags.fin() {
                let fin_seq = pkt.seg.seq.wrapping_add(pkt.payload.len() as u32);
                if fin_seq == tcp.rcv.nxt {
                    Some(fin_seq)
                } else if seq_lt(fin_seq, tcp.rcv.nxt) {
                    // Duplicate FIN; just re-acknowledge.
                    send_ack = true;
                    None
                } else {
                    tcp.fin_pending = Some(fin_seq);
                    None
                }
            } else if tcp.fin_pending == Some(tcp.rcv.nxt) {
                tcp.fin_pending
            } else {
                None
            }
        };

        if let Some(_fin_seq) = fin_now {
            {
                let ccb = self.ccb_mut(handle)?;
                let Some(tcp) = ccb.tcp_mut() else {
                    return Err(Error::StaleHandle);
                };
                tcp.rcv.nxt = tcp.rcv.nxt.wrapping_add(1);
                tcp.fin_pending = None;
            }
            send_ack = true;

            match state {
                TcbState::ESTABLISHED => {
                    self.tcp_ack_now(handle)?;
                    send_ack = false;
                    self.tcp_enter_state(handle, TcbState::CLOSE_WAIT)?;
                }
                TcbState::FIN_WAIT_1 => {
                    self.tcp_ack_now(handle)?;
                    send_ack = false;
                    self.tcp_enter_state(handle, TcbState::CLOSING)?;
                }
                TcbState::FIN_WAIT_2 => {
                    self.tcp_ack_now(handle)?;
                    send_ack = false;
                    self.tcp_enter_state(handle, TcbState::TIME_WAIT)?;
                }
                _ => {}
            }
        }

        if send_ack {
            self.tcp_ack_now(handle)?;
        }

        Ok(())
    }

    /// RFC 793 segment acceptability, against the receive window.
    fn tcp_acceptable(&mut self, handle: CcbHandle, pkt: &PacketDescriptor) -> Result<bool> {
        let ccb = self.ccb_mut(handle)?;
        let Some(tcp) = ccb.tcp() else {
            return Err(Error::StaleHandle);
        };

        let seq = pkt.seg.seq;
        let len = pkt.seg_len();
        let nxt = tcp.rcv.nxt;
        let wnd = tcp.rcv.wnd;
        let wnd_end = nxt.wrapping_add(wnd);

        let ok = match (len, wnd) {
            (0, 0) => seq == nxt,
            (0, _) => seq_geq(seq, nxt) && seq_lt(seq, wnd_end),
            (_, 0) => false,
            (_, _) => {
                let last = seq.wrapping_add(len - 1);
                (seq_geq(seq, nxt) && seq_lt(seq, wnd_end))
                    || (seq_geq(last, nxt) && seq_lt(last, wnd_end))
            }
        };

        Ok(ok)
    }

    /// ACK field processing: purge acknowledged bytes, slide `snd.una`,
    /// apply the window update, and keep the retransmission timer honest.
    /// Returns whether this ACK covers our FIN.
    fn tcp_process_ack(
        &mut self,
        handle: CcbHandle,
        pkt: &PacketDescriptor,
        state: TcbState,
    ) -> Result<bool> {
        let fin_outstanding = matches!(
            state,
            TcbState::FIN_WAIT_1 | TcbState::CLOSING | TcbState::LAST_ACK
        );

        let (fin_acked, win_opened, ack_beyond, new_ack, all_acked) = {
            let ccb = self.ccb_mut(handle)?;
            let Some(tcp) = ccb.tcp_mut() else {
                return Err(Error::StaleHandle);
            };

            let ack = pkt.seg.ack;
            let was_full = data::snd_win_full(tcp);

            if seq_gt(ack, tcp.snd.nxt) {
                // Acknowledges bytes never sent.
                (false, false, true, false, false)
            } else {
                let acked = seq_diff(ack, tcp.snd.una);
                let mut fin_acked = false;

                if acked > 0 {
                    let mut data_acked = acked as u32;
                    if fin_outstanding && ack == tcp.snd.nxt {
                        fin_acked = true;
                        data_acked -= 1;
                    }

                    tcp.retrans.purge_acked(data_acked)?;
                    tcp.snd.una = ack;
                    tcp.retry_cnt = 0;
                }

                // RFC 793 window update rule.
                if seq_lt(tcp.snd.wl1, pkt.seg.seq)
                    || (tcp.snd.wl1 == pkt.seg.seq && seq_leq(tcp.snd.wl2, ack))
                {
                    tcp.snd.wnd = u32::from(pkt.seg.window);
                    tcp.snd.wl1 = pkt.seg.seq;
                    tcp.snd.wl2 = ack;
                }

                let win_opened = was_full && !data::snd_win_full(tcp);
                let all_acked = tcp.snd.una == tcp.snd.nxt && tcp.retrans.is_empty();
                (fin_acked, win_opened, false, acked > 0, all_acked)
            }
        };

        if ack_beyond {
            self.tcp_ack_now(handle)?;
            return Ok(false);
        }

        // New data acknowledged: restart the clock for what remains.
        if new_ack {
            self.tcp_cancel_rto(handle);
            if !all_acked {
                self.tcp_schedule_rto(handle);
            }
        }

        if win_opened {
            self.session_conn_notif(handle, ConnNotif::WinAvailable);
        }

        let more = {
            let ccb = self.ccb_mut(handle)?;
            ccb.tcp().is_some_and(|tcp| tcp.retrans.unsent() > 0)
        };
        if more && matches!(state, TcbState::ESTABLISHED | TcbState::CLOSE_WAIT) {
            self.tcp_push_data(handle)?;
        }

        Ok(fin_acked)
    }

    /// Runs inbound payload bytes through reassembly and in-order delivery
    /// to the application.
    fn tcp_process_payload(&mut self, handle: CcbHandle, pkt: &PacketDescriptor) -> Result<()> {
        let mut start_sending = false;

        let outcome = {
            let ccb = self.ccbs.get_mut(handle).ok_or(Error::StaleHandle)?;
            let tcid = ccb.tcid;
            let gstats = &mut self
                .test_cases
                .get_mut(&tcid)
                .ok_or(Error::UnknownTestCase(tcid))?
                .gen_stats;

            let app = &mut ccb.app;
            let ProtoCb::Tcp(ref mut tcp) = ccb.proto else {
                return Err(Error::StaleHandle);
            };

            data::handle_incoming(
                &mut tcp.reasm,
                &mut tcp.rcv.nxt,
                pkt.seg.seq,
                pkt.payload.clone(),
                |bytes| {
                    let d = app.deliver(gstats, bytes, pkt.rx_tstamp_us);
                    start_sending |= d.start_sending;
                    d.consumed
                },
            )?
        };

        if outcome.missing_started {
            self.tcp_stats.missing_seq += 1;
        }
        if outcome.missing_cleared {
            self.tcp_stats.missing_seq = self.tcp_stats.missing_seq.saturating_sub(1);
        }

        if start_sending {
            self.session_app_send_start(handle);
        }

        Ok(())
    }

    // --- data send path -----------------------------------------------------

    /// Emits up to one burst of queued-but-unsent bytes.
    fn tcp_push_data(&mut self, handle: CcbHandle) -> Result<()> {
        let (segments, window_full, tx) = {
            let ccb = self.ccb_mut(handle)?;
            let (interface, flow) = (ccb.interface, ccb.flow);
            let Some(tcp) = ccb.tcp_mut() else {
                return Err(Error::StaleHandle);
            };

            let out = data::send_segments(tcp)?;
            let tx = TxInfo {
                interface,
                flow,
                rcv_nxt: tcp.rcv.nxt,
                rcv_wnd: tcp.rcv.wnd,
            };
            (out.segments, out.window_full, tx)
        };

        for seg in segments {
            let mut flags = TcpFlags::ACK;
            if seg.psh {
                flags = flags.with(TcpFlags::PSH);
            }
            self.tcp_stats.sent_data_pkts += 1;
            self.tcp_stats.sent_data_bytes += seg.payload.len() as u64;
            self.tcp_emit_raw(tx, seg.seq, tx.rcv_nxt, flags, seg.payload);
        }

        self.tcp_schedule_rto(handle);

        if window_full {
            self.session_conn_notif(handle, ConnNotif::WinUnavailable);
        }

        Ok(())
    }

    /// Retransmission timer expiry for the synchronized states.
    fn tcp_retrans_timeout(&mut self, handle: CcbHandle, state: TcbState) -> Result<()> {
        match state {
            TcbState::SYN_RECEIVED => {
                self.tcp_stats.synack_to += 1;
                self.tcp_retry_or_close(handle, |sockopt| sockopt.syn_ack_retry_cnt)
            }
            TcbState::ESTABLISHED | TcbState::CLOSE_WAIT => {
                self.tcp_stats.data_to += 1;
                self.tcp_retry_or_close(handle, |sockopt| sockopt.data_retry_cnt)
            }
            TcbState::FIN_WAIT_1 | TcbState::CLOSING | TcbState::LAST_ACK => {
                self.tcp_stats.retry_to += 1;
                self.tcp_retry_or_close(handle, |sockopt| sockopt.retry_cnt)
            }
            // No retransmission business in the remaining states.
            _ => Ok(()),
        }
    }

    /// Bumps the retry counter against `ceiling` and either resends what
    /// the state calls for or gives up on the connection.
    fn tcp_retry_or_close<F>(&mut self, handle: CcbHandle, ceiling: F) -> Result<()>
    where
        F: Fn(&crate::config::TcpSockOpt) -> u8,
    {
        let (exceeded, state) = {
            let ccb = self.ccb_mut(handle)?;
            let Some(tcp) = ccb.tcp_mut() else {
                return Err(Error::StaleHandle);
            };
            tcp.retry_cnt = tcp.retry_cnt.saturating_add(1);
            // The expiry that reaches the ceiling gives up without one
            // last resend; a ceiling of N allows N - 1 retransmissions.
            (tcp.retry_cnt >= ceiling(&tcp.sockopt), tcp.state)
        };

        if exceeded {
            self.tcp_stats.retry_exceeded += 1;
            return self.tcp_enter_state(handle, TcbState::CLOSED);
        }

        match state {
            TcbState::SYN_SENT => {
                let (iss, tx) = {
                    let ccb = self.ccb_mut(handle)?;
                    let tcp = ccb.tcp().ok_or(Error::StaleHandle)?;
                    (tcp.snd.iss, TxInfo::of(ccb, tcp))
                };
                self.tcp_emit(tx, iss, 0, TcpFlags::SYN, Vec::new());
            }
            TcbState::SYN_RECEIVED => {
                let (iss, tx) = {
                    let ccb = self.ccb_mut(handle)?;
                    let tcp = ccb.tcp().ok_or(Error::StaleHandle)?;
                    (tcp.snd.iss, TxInfo::of(ccb, tcp))
                };
                self.tcp_emit(tx, iss, tx.rcv_nxt, TcpFlags::SYN.with(TcpFlags::ACK), Vec::new());
            }
            TcbState::ESTABLISHED | TcbState::CLOSE_WAIT => {
                self.tcp_resend_data(handle)?;
            }
            TcbState::FIN_WAIT_1 | TcbState::CLOSING | TcbState::LAST_ACK => {
                // The FIN sits one before snd.nxt in sequence space.
                let (fin_seq, tx) = {
                    let ccb = self.ccb_mut(handle)?;
                    let tcp = ccb.tcp().ok_or(Error::StaleHandle)?;
                    (tcp.snd.nxt.wrapping_sub(1), TxInfo::of(ccb, tcp))
                };
                self.tcp_emit(tx, fin_seq, tx.rcv_nxt, TcpFlags::FIN.with(TcpFlags::ACK), Vec::new());
            }
            _ => {}
        }

        self.tcp_schedule_rto(handle);
        Ok(())
    }

    /// Resends already transmitted bytes from `snd.una` on.
    fn tcp_resend_data(&mut self, handle: CcbHandle) -> Result<()> {
        let (segments, tx) = {
            let ccb = self.ccb_mut(handle)?;
            let tcp = ccb.tcp().ok_or(Error::StaleHandle)?;
            (data::retrans_segments(tcp)?, TxInfo::of(ccb, tcp))
        };

        for seg in segments {
            let mut flags = TcpFlags::ACK;
            if seg.psh {
                flags = flags.with(TcpFlags::PSH);
            }
            self.tcp_stats.retrans_pkts += 1;
            self.tcp_stats.retrans_bytes += seg.payload.len() as u64;
            self.tcp_emit_raw(tx, seg.seq, tx.rcv_nxt, flags, seg.payload);
        }

        Ok(())
    }

    // --- state entry actions -------------------------------------------------

    fn tcp_entry_actions(&mut self, handle: CcbHandle, state: TcbState) -> Result<()> {
        match state {
            TcbState::ESTABLISHED => {
                let ccb = self.ccb_mut(handle)?;
                if let Some(tcp) = ccb.tcp_mut() {
                    tcp.retry_cnt = 0;
                }
                Ok(())
            }
            TcbState::FIN_WAIT_1 => {
                let orphan = self.tcp_sockopt_us(handle, |s| s.orphan_to_us)?;
                self.tcp_arm_slow(handle, orphan);
                Ok(())
            }
            TcbState::FIN_WAIT_2 => {
                let fin_to = self.tcp_sockopt_us(handle, |s| s.fin_to_us)?;
                self.tcp_arm_slow(handle, fin_to);
                Ok(())
            }
            TcbState::TIME_WAIT => {
                self.tcp_cancel_rto(handle);

                let (skip, twait) = {
                    let ccb = self.ccb_mut(handle)?;
                    let tcp = ccb.tcp().ok_or(Error::StaleHandle)?;
                    (tcp.sockopt.skip_timewait, tcp.sockopt.twait_to_us)
                };

                if skip {
                    self.tcp_enter_state(handle, TcbState::CLOSED)
                } else {
                    self.tcp_arm_slow(handle, twait);
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    /// Silent close: the connection disappears from the lookup table, every
    /// timer is canceled and the buffers are dropped. Cloned server blocks
    /// go back to the pool; configured endpoints stay for a reopen.
    fn tcp_teardown(&mut self, handle: CcbHandle) {
        let Some(ccb) = self.ccbs.get_mut(handle) else {
            return;
        };
        let (interface, flow, ephemeral) = (ccb.interface, ccb.flow, ccb.ephemeral);

        if let ProtoCb::Tcp(ref mut tcp) = ccb.proto {
            if let Some(tmr) = tcp.rto_tmr.take() {
                self.rto_wheel.cancel(tmr, handle);
            }
            if let Some(tmr) = tcp.slow_tmr.take() {
                self.slow_wheel.cancel(tmr, handle);
            }

            if !tcp.reasm.is_empty() {
                self.tcp_stats.missing_seq = self.tcp_stats.missing_seq.saturating_sub(1);
            }
            tcp.retrans = RetransQueue::new();
            tcp.reasm = ReassemblyList::new();
            tcp.fin_pending = None;
            tcp.retry_cnt = 0;
        }

        self.tcp_table.remove(interface, flow);

        if ephemeral {
            self.tcp_stats.tcb_freed += 1;
            self.release_ccb(handle);
        }
    }

    // --- small helpers --------------------------------------------------------

    fn tcp_tx_info(&mut self, handle: CcbHandle) -> Result<(u32, TxInfo)> {
        let ccb = self.ccb_mut(handle)?;
        let tcp = ccb.tcp().ok_or(Error::StaleHandle)?;
        Ok((tcp.snd.nxt, TxInfo::of(ccb, tcp)))
    }

    fn tcp_sockopt_us<F>(&mut self, handle: CcbHandle, pick: F) -> Result<u64>
    where
        F: Fn(&crate::config::TcpSockOpt) -> u64,
    {
        let ccb = self.ccb_mut(handle)?;
        let tcp = ccb.tcp().ok_or(Error::StaleHandle)?;
        Ok(pick(&tcp.sockopt))
    }

    /// Emits a pure ACK carrying the current receive state.
    fn tcp_ack_now(&mut self, handle: CcbHandle) -> Result<()> {
        let (snd_nxt, tx) = self.tcp_tx_info(handle)?;
        self.tcp_emit(tx, snd_nxt, tx.rcv_nxt, TcpFlags::ACK, Vec::new());
        Ok(())
    }

    /// Sends our FIN: it occupies one sequence number after any queued
    /// data.
    fn tcp_send_fin(&mut self, handle: CcbHandle) -> Result<()> {
        let (fin_seq, tx) = {
            let ccb = self.ccb_mut(handle)?;
            let Some(tcp) = ccb.tcp_mut() else {
                return Err(Error::StaleHandle);
            };
            let fin_seq = tcp.snd.nxt;
            tcp.snd.nxt = tcp.snd.nxt.wrapping_add(1);
            let (rcv_nxt, rcv_wnd) = (tcp.rcv.nxt, tcp.rcv.wnd);
            let tx = TxInfo {
                interface: ccb.interface,
                flow: ccb.flow,
                rcv_nxt,
                rcv_wnd,
            };
            (fin_seq, tx)
        };

        self.tcp_emit(tx, fin_seq, tx.rcv_nxt, TcpFlags::FIN.with(TcpFlags::ACK), Vec::new());
        self.tcp_schedule_rto(handle);
        Ok(())
    }

    /// Sends a RST from an existing connection (abort path).
    fn tcp_send_rst_from(&mut self, handle: CcbHandle) -> Result<()> {
        let (snd_nxt, tx) = self.tcp_tx_info(handle)?;
        self.tcp_emit(tx, snd_nxt, tx.rcv_nxt, TcpFlags::RST.with(TcpFlags::ACK), Vec::new());
        Ok(())
    }

    /// Sends a RST in response to a segment that does not belong to any
    /// live connection state.
    fn tcp_emit_rst(&mut self, pkt: &PacketDescriptor) {
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

    /// Control segment emission, counting it as such.
    fn tcp_emit(&mut self, tx: TxInfo, seq: u32, ack: u32, flags: TcpFlags, payload: Vec<u8>) {
        self.tcp_stats.sent_ctrl_pkts += 1;
        self.tcp_emit_raw(tx, seq, ack, flags, payload);
    }

    fn tcp_emit_raw(&mut self, tx: TxInfo, seq: u32, ack: u32, flags: TcpFlags, payload: Vec<u8>) {
        self.tx.push_back(OutPacket {
            interface: tx.interface,
            flow: tx.flow,
            seg: SegmentMeta {
                seq,
                ack,
                flags,
                window: tx.rcv_wnd.min(u32::from(u16::MAX)) as u16,
                urgent: 0,
            },
            payload,
        });
    }

    /// Arms the retransmission timer unless there is nothing in flight or
    /// it is already running.
    fn tcp_schedule_rto(&mut self, handle: CcbHandle) {
        let rto = {
            let Some(ccb) = self.ccbs.get_mut(handle) else {
                return;
            };
            let Some(tcp) = ccb.tcp_mut() else {
                return;
            };

            // Nothing outstanding: the counter starts over.
            if tcp.snd.una == tcp.snd.nxt && tcp.retrans.is_empty() {
                tcp.retry_cnt = 0;
                return;
            }
            if tcp.rto_tmr.is_some() {
                return;
            }
            tcp.sockopt.rto_us
        };

        match self.rto_wheel.schedule(self.now_us, rto, handle) {
            Ok(tmr) => {
                if let Some(tcp) = self.ccbs.get_mut(handle).and_then(|c| c.tcp_mut()) {
                    tcp.rto_tmr = Some(tmr);
                }
            }
            Err(err) => debug!("rto not armed: {err}"),
        }
    }

    fn tcp_cancel_rto(&mut self, handle: CcbHandle) {
        let Some(ccb) = self.ccbs.get_mut(handle) else {
            return;
        };
        if let Some(tcp) = ccb.tcp_mut() {
            if let Some(tmr) = tcp.rto_tmr.take() {
                self.rto_wheel.cancel(tmr, handle);
            }
        }
    }

    /// Re-arms the slow timer (orphan, FIN and TIME_WAIT bounds), replacing
    /// any earlier deadline.
    fn tcp_arm_slow(&mut self, handle: CcbHandle, timeout_us: u64) {
        {
            let Some(ccb) = self.ccbs.get_mut(handle) else {
                return;
            };
            if let Some(tcp) = ccb.tcp_mut() {
                if let Some(tmr) = tcp.slow_tmr.take() {
                    self.slow_wheel.cancel(tmr, handle);
                }
            }
        }

        match self.slow_wheel.schedule(self.now_us, timeout_us, handle) {
            Ok(tmr) => {
                if let Some(tcp) = self.ccbs.get_mut(handle).and_then(|c| c.tcp_mut()) {
                    tcp.slow_tmr = Some(tmr);
                }
            }
            Err(err) => debug!("slow timer not armed: {err}"),
        }
    }
}
