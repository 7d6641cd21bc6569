//! The UDP endpoint engine.
//!
//! UDP carries none of TCP's machinery: an endpoint is a pseudo-state, a
//! lookup table entry and the application riding on it. "Connections" are
//! established by fiat on open (clients) or on the first datagram from a
//! new remote (server listeners, which clone an endpoint per peer).

use crate::ccb::{Ccb, CcbHandle, ProtoCb, UdpCb};
use crate::packet::{OutPacket, PacketDescriptor, SegmentMeta};
use crate::session::ConnNotif;
use crate::worker::Worker;
use crate::{Error, Result, debug};

/// UDP endpoint pseudo-states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UcbState {
    /// Allocated, not opened yet.
    Init,
    /// Server endpoint accepting datagrams from any remote.
    Listen,
    /// Exchanging datagrams with one remote.
    Open,
    /// Closed; clients may reopen.
    Closed,
}

impl UcbState {
    /// State name for diagnostics.
    pub fn as_str(self) -> &'static str {
        match self {
            UcbState::Init => "INIT",
            UcbState::Listen => "LISTEN",
            UcbState::Open => "OPEN",
            UcbState::Closed => "CLOSED",
        }
    }
}

impl Worker {
    /// Registers a server endpoint under its wildcard tuple.
    pub(crate) fn udp_listen(&mut self, handle: CcbHandle) -> Result<()> {
        let ccb = self.ccb_mut(handle)?;
        let (interface, flow) = (ccb.interface, ccb.flow);

        if let ProtoCb::Udp(ref mut udp) = ccb.proto {
            udp.state = UcbState::Listen;
        }

        self.udp_table.insert(interface, flow, handle)
    }

    /// Opens a client endpoint: table entry plus an immediate established
    /// notification, there being no handshake to wait for.
    pub(crate) fn udp_open(&mut self, handle: CcbHandle) -> Result<()> {
        let ccb = self.ccb_mut(handle)?;
        let (interface, flow) = (ccb.interface, ccb.flow);

        let ProtoCb::Udp(ref mut udp) = ccb.proto else {
            return Err(Error::StaleHandle);
        };

        match udp.state {
            UcbState::Init | UcbState::Closed => {}
            state => {
                return Err(Error::InvalidEvent {
                    state: state.as_str(),
                    event: "OPEN",
                });
            }
        }

        udp.state = UcbState::Open;
        self.udp_table.insert(interface, flow, handle)?;

        self.session_conn_notif(handle, ConnNotif::Connected);
        Ok(())
    }

    /// Sends one datagram. UDP never buffers: the bytes are accepted in
    /// full or the endpoint was not open.
    pub(crate) fn udp_send(&mut self, handle: CcbHandle, bytes: Vec<u8>) -> Result<usize> {
        let ccb = self.ccb_mut(handle)?;

        let ProtoCb::Udp(ref udp) = ccb.proto else {
            return Err(Error::StaleHandle);
        };
        if udp.state != UcbState::Open {
            return Err(Error::InvalidEvent {
                state: udp.state.as_str(),
                event: "SEND",
            });
        }

        let len = bytes.len();
        let pkt = OutPacket {
            interface: ccb.interface,
            flow: ccb.flow,
            seg: SegmentMeta::default(),
            payload: bytes,
        };

        self.udp_stats.sent_pkts += 1;
        self.udp_stats.sent_bytes += len as u64;
        self.tx.push_back(pkt);

        Ok(len)
    }

    /// Closes an endpoint. Listeners and clients keep their control block;
    /// per-peer server clones are released.
    pub(crate) fn udp_close(&mut self, handle: CcbHandle) {
        let Some(ccb) = self.ccbs.get_mut(handle) else {
            return;
        };
        let (interface, flow, ephemeral) = (ccb.interface, ccb.flow, ccb.ephemeral);

        let ProtoCb::Udp(ref mut udp) = ccb.proto else {
            return;
        };
        if udp.state == UcbState::Closed {
            return;
        }
        udp.state = UcbState::Closed;

        self.udp_table.remove(interface, flow);
        self.session_conn_notif(handle, ConnNotif::Closed);

        if ephemeral && self.ccbs.get(handle).is_some() {
            self.udp_stats.ucb_freed += 1;
            self.release_ccb(handle);
        }
    }

    /// Handles one received datagram, cloning a per-peer endpoint when it
    /// lands on a listener.
    pub(crate) fn udp_receive(&mut self, handle: CcbHandle, pkt: PacketDescriptor) {
        let Some(ccb) = self.ccbs.get(handle) else {
            return;
        };

        let ProtoCb::Udp(ref udp) = ccb.proto else {
            return;
        };

        let target = match udp.state {
            UcbState::Open => handle,
            UcbState::Listen => match self.udp_clone(handle, &pkt) {
                Some(clone) => clone,
                None => return,
            },
            _ => {
                debug!("datagram for inactive endpoint dropped");
                return;
            }
        };

        self.udp_stats.recv_pkts += 1;
        self.udp_stats.recv_bytes += pkt.payload.len() as u64;

        self.deliver_to_app(target, &pkt.payload, pkt.rx_tstamp_us);
    }

    /// Spawns a per-peer endpoint off a listener for the exact tuple of
    /// `pkt`.
    fn udp_clone(&mut self, listener: CcbHandle, pkt: &PacketDescriptor) -> Option<CcbHandle> {
        let parent = self.ccbs.get(listener)?;
        let tcid = parent.tcid;

        let cfg = &self.test_cases.get(&tcid)?.cfg;
        let app = crate::app::build(&cfg.app, cfg.role);

        let ccb = Ccb {
            interface: pkt.interface,
            flow: pkt.flow,
            tcid,
            active: false,
            ephemeral: true,
            session: crate::session::Session::default(),
            app,
            proto: ProtoCb::Udp(UdpCb {
                state: UcbState::Open,
            }),
        };

        let clone = match self.ccbs.alloc(ccb) {
            Ok(handle) => handle,
            Err(err) => {
                debug!("endpoint clone failed: {err}");
                return None;
            }
        };
        self.udp_stats.ucb_allocated += 1;

        if let Err(err) = self.udp_table.insert(pkt.interface, pkt.flow, clone) {
            debug!("endpoint clone not inserted: {err}");
            self.ccbs.release(clone);
            return None;
        }

        if let Some(tc) = self.test_cases.get_mut(&tcid) {
            tc.conns.push(clone);
        }

        self.session_spawn_server(clone);
        self.session_conn_notif(clone, ConnNotif::Connected);

        Some(clone)
    }

    /// Hands in-order bytes to a connection's application and forwards the
    /// session triggers it raises.
    pub(crate) fn deliver_to_app(&mut self, handle: CcbHandle, bytes: &[u8], rx_tstamp_us: u64) {
        let Some(ccb) = self.ccbs.get_mut(handle) else {
            return;
        };
        let tcid = ccb.tcid;
        let Some(tc) = self.test_cases.get_mut(&tcid) else {
            return;
        };

        let outcome = ccb.app.deliver(&mut tc.gen_stats, bytes, rx_tstamp_us);

        if outcome.start_sending {
            self.session_app_send_start(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AppConfig, Delay, L4Proto, TcpSockOpt, TestCaseConfig, TestCriteria, TestRole,
    };
    use crate::packet::FlowTuple;
    use crate::session::SessionState;
    use std::net::Ipv4Addr;

    fn udp_cfg(role: TestRole, flow: FlowTuple) -> TestCaseConfig {
        TestCaseConfig {
            tcid: 7,
            interface: 0,
            role,
            proto: L4Proto::Udp,
            flows: vec![flow],
            init_delay: Delay::Us(0),
            uptime: Delay::Infinite,
            downtime: Delay::Infinite,
            criteria: TestCriteria::ClUp(1),
            app: AppConfig::Raw {
                req_size: 100,
                resp_size: 50,
            },
            sockopt: TcpSockOpt::default(),
        }
    }

    fn datagram(flow: FlowTuple, payload: Vec<u8>) -> PacketDescriptor {
        PacketDescriptor {
            interface: 0,
            proto: L4Proto::Udp,
            flow,
            seg: SegmentMeta::default(),
            payload,
            rx_tstamp_us: 0,
        }
    }

    #[test]
    fn client_endpoint_opens_and_exchanges() {
        let flow = FlowTuple {
            local_addr: Ipv4Addr::new(10, 0, 0, 1),
            remote_addr: Ipv4Addr::new(10, 0, 0, 2),
            local_port: 40_000,
            remote_port: 53,
        };

        let mut w = Worker::new(0, 8, 0);
        w.start_test_case(udp_cfg(TestRole::Client, flow)).unwrap();
        let h = w.test_cases[&7].conns[0];

        // One poll walks init, open and send: the endpoint comes up by
        // fiat and the first request goes out whole.
        w.poll(100);

        let out = w.drain_tx();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload.len(), 100);
        assert_eq!(w.udp_stats().sent_pkts, 1);
        assert_eq!(w.gen_stats(7).unwrap().up, 1);
        assert_eq!(w.gen_stats(7).unwrap().estab, 1);
        assert_eq!(w.ccbs.get(h).unwrap().session.state, SessionState::Open);

        // The full response triggers the next request.
        w.rx_packet(datagram(flow, vec![0; 50]));
        assert_eq!(w.gen_stats(7).unwrap().app_bytes_recv, 50);

        w.poll(200);
        assert_eq!(w.drain_tx().len(), 1);
        assert_eq!(w.udp_stats().sent_pkts, 2);
    }

    #[test]
    fn listener_clones_an_endpoint_per_peer() {
        let wildcard = FlowTuple {
            local_addr: Ipv4Addr::new(10, 0, 0, 2),
            remote_addr: Ipv4Addr::new(0, 0, 0, 0),
            local_port: 53,
            remote_port: 0,
        };

        let mut w = Worker::new(0, 8, 0);
        w.start_test_case(udp_cfg(TestRole::Server, wildcard)).unwrap();
        let listener = w.test_cases[&7].conns[0];

        let exact = FlowTuple {
            local_addr: Ipv4Addr::new(10, 0, 0, 2),
            remote_addr: Ipv4Addr::new(10, 0, 0, 9),
            local_port: 53,
            remote_port: 51_000,
        };
        // A full request from a new remote spawns a per-peer endpoint and
        // queues its response.
        w.rx_packet(datagram(exact, vec![0; 100]));

        assert_eq!(w.ccbs.in_use(), 2);
        assert_eq!(w.udp_stats().ucb_allocated, 2);
        assert_eq!(w.gen_stats(7).unwrap().up, 1);
        assert_eq!(w.gen_stats(7).unwrap().app_bytes_recv, 100);

        w.poll(100);
        let out = w.drain_tx();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].flow, exact);
        assert_eq!(out[0].payload.len(), 50);

        // A second datagram from the same remote reaches the clone, not
        // the listener.
        w.rx_packet(datagram(exact, vec![0; 100]));
        assert_eq!(w.ccbs.in_use(), 2);
        assert_eq!(w.gen_stats(7).unwrap().app_bytes_recv, 200);
        assert_eq!(
            w.ccbs.get(listener).unwrap().session.state,
            SessionState::Listen
        );
    }
}
