//! Connection control blocks and the fixed-size per-worker pool they live
//! in.
//!
//! One [`Ccb`] exists per emulated endpoint, TCP or UDP, together with the
//! load-test session that rides on it and the per-connection application
//! state. Control blocks are reached exclusively through [`CcbHandle`]s:
//! generation-tagged pool indices that go stale when the block is released,
//! so a handle kept across a teardown can never reach a recycled
//! connection.

use crate::app::AppProtocol;
use crate::config::TcpSockOpt;
use crate::packet::FlowTuple;
use crate::session::Session;
use crate::tcp::TcbState;
use crate::tcp::data::{ReassemblyList, RetransQueue};
use crate::timer::TimerHandle;
use crate::{Error, Result};

/// Generation-tagged index of a control block in its worker's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CcbHandle {
    idx: u32,
    generation: u32,
}

/// TCP-specific connection state.
#[derive(Debug)]
pub struct TcpCb {
    /// Current protocol state. Mutated only through the state machine's
    /// `enter_state` primitive.
    pub state: TcbState,
    /// Send sequence space.
    pub snd: SendSeqSpace,
    /// Receive sequence space.
    pub rcv: RecvSeqSpace,
    /// Retransmissions attempted for the segment currently being retried.
    pub retry_cnt: u8,
    /// Membership in the retransmission wheel.
    pub rto_tmr: Option<TimerHandle>,
    /// Membership in the slow wheel (orphan/FIN/TIME_WAIT bounds).
    pub slow_tmr: Option<TimerHandle>,
    /// Unacknowledged outbound bytes, owned by this connection.
    pub retrans: RetransQueue,
    /// Out-of-order inbound segments awaiting delivery.
    pub reasm: ReassemblyList,
    /// Sequence number of a FIN seen before all preceding data arrived.
    pub fin_pending: Option<u32>,
    /// Socket options, copied from the test case at open time.
    pub sockopt: TcpSockOpt,
}

impl TcpCb {
    /// Fresh TCP state for a connection that has not been opened yet.
    pub fn new(sockopt: TcpSockOpt) -> TcpCb {
        let win = sockopt.win_size;
        TcpCb {
            state: TcbState::INIT,
            snd: SendSeqSpace::default(),
            rcv: RecvSeqSpace {
                nxt: 0,
                wnd: win,
                irs: 0,
            },
            retry_cnt: 0,
            rto_tmr: None,
            slow_tmr: None,
            retrans: RetransQueue::new(),
            reasm: ReassemblyList::new(),
            fin_pending: None,
            sockopt,
        }
    }
}

/// Send Sequence Space.
///
/// (RFC 793 3.2)
///
/// ```text
///                   1         2          3          4
///              ----------|----------|----------|----------
///                     SND.UNA    SND.NXT    SND.UNA
///                                          +SND.WND
///
///        1 - old sequence numbers which have been acknowledged
///        2 - sequence numbers of unacknowledged data
///        3 - sequence numbers allowed for new data transmission
///        4 - future sequence numbers which are not yet allowed
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct SendSeqSpace {
    /// SND.UNA - send unacknowledged
    pub una: u32,
    /// SND.NXT - send next
    pub nxt: u32,
    /// SND.WND - send window advertised by the peer
    pub wnd: u32,
    /// SND.WL1 - segment sequence number used for last window update
    pub wl1: u32,
    /// SND.WL2 - segment acknowledgment number used for last window update
    pub wl2: u32,
    /// ISS     - initial send sequence number
    pub iss: u32,
}

/// Receive Sequence Space.
///
/// (RFC 793 3.2)
///
/// ```text
///                       1          2          3
///                   ----------|----------|----------
///                          RCV.NXT    RCV.NXT
///                                    +RCV.WND
///
///        1 - old sequence numbers which have been acknowledged
///        2 - sequence numbers allowed for new reception
///        3 - future sequence numbers which are not yet allowed
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct RecvSeqSpace {
    /// RCV.NXT - receive next
    pub nxt: u32,
    /// RCV.WND - receive window
    pub wnd: u32,
    /// IRS     - initial receive sequence number
    pub irs: u32,
}

/// UDP-specific connection state.
#[derive(Debug)]
pub struct UdpCb {
    /// Current UDP pseudo-state.
    pub state: crate::udp::UcbState,
}

/// Protocol-specific half of a control block.
#[derive(Debug)]
pub enum ProtoCb {
    /// TCP connection.
    Tcp(TcpCb),
    /// UDP endpoint.
    Udp(UdpCb),
}

/// A connection control block: one emulated endpoint plus its load-test
/// session.
#[derive(Debug)]
pub struct Ccb {
    /// Interface the connection lives on.
    pub interface: u32,
    /// Addresses and ports, local side first.
    pub flow: FlowTuple,
    /// Owning test case id.
    pub tcid: u32,
    /// `true` for actively opened (client) connections.
    pub active: bool,
    /// `true` for connections cloned off a listener. These are released
    /// back to the pool on close; configured endpoints persist.
    pub ephemeral: bool,
    /// The load-test session riding on this connection.
    pub session: Session,
    /// Per-connection application state.
    pub app: Box<dyn AppProtocol>,
    /// TCP or UDP state.
    pub proto: ProtoCb,
}

impl Ccb {
    /// Returns the TCP half, or `None` for UDP control blocks.
    pub fn tcp(&self) -> Option<&TcpCb> {
        match self.proto {
            ProtoCb::Tcp(ref tcp) => Some(tcp),
            ProtoCb::Udp(_) => None,
        }
    }

    /// Mutable access to the TCP half.
    pub fn tcp_mut(&mut self) -> Option<&mut TcpCb> {
        match self.proto {
            ProtoCb::Tcp(ref mut tcp) => Some(tcp),
            ProtoCb::Udp(_) => None,
        }
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    ccb: Option<Ccb>,
}

/// Fixed-size pool of control blocks, one per worker.
#[derive(Debug)]
pub struct CcbPool {
    slots: Vec<Slot>,
    free: Vec<u32>,
    in_use: usize,
    capacity: usize,
}

impl CcbPool {
    /// Creates a pool of at most `capacity` control blocks. Slot storage
    /// grows on demand up to the capacity, never beyond it.
    pub fn new(capacity: usize) -> CcbPool {
        CcbPool {
            slots: Vec::with_capacity(capacity.min(1024)),
            free: Vec::new(),
            in_use: 0,
            capacity,
        }
    }

    /// Control blocks currently allocated.
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Allocates a slot for `ccb`.
    ///
    /// # Errors
    ///
    /// Returns an error when the pool is exhausted.
    pub fn alloc(&mut self, ccb: Ccb) -> Result<CcbHandle> {
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize].ccb = Some(ccb);
                idx
            }
            None => {
                if self.slots.len() >= self.capacity {
                    return Err(Error::PoolExhausted {
                        capacity: self.capacity,
                    });
                }
                self.slots.push(Slot {
                    generation: 0,
                    ccb: Some(ccb),
                });
                (self.slots.len() - 1) as u32
            }
        };

        self.in_use += 1;

        Ok(CcbHandle {
            idx,
            generation: self.slots[idx as usize].generation,
        })
    }

    /// Releases the control block behind `handle`, returning it. Stale
    /// handles yield `None`.
    pub fn release(&mut self, handle: CcbHandle) -> Option<Ccb> {
        let slot = self.slots.get_mut(handle.idx as usize)?;
        if slot.generation != handle.generation || slot.ccb.is_none() {
            return None;
        }

        let ccb = slot.ccb.take();
        // Bump the generation so outstanding handles go stale.
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.idx);
        self.in_use -= 1;

        ccb
    }

    /// Shared access to the control block behind `handle`.
    pub fn get(&self, handle: CcbHandle) -> Option<&Ccb> {
        let slot = self.slots.get(handle.idx as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.ccb.as_ref()
    }

    /// Mutable access to the control block behind `handle`.
    pub fn get_mut(&mut self, handle: CcbHandle) -> Option<&mut Ccb> {
        let slot = self.slots.get_mut(handle.idx as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.ccb.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::build;
    use crate::config::{AppConfig, TestRole};
    use crate::udp::UcbState;

    fn test_ccb() -> Ccb {
        Ccb {
            interface: 0,
            flow: FlowTuple {
                local_addr: std::net::Ipv4Addr::new(10, 0, 0, 1),
                remote_addr: std::net::Ipv4Addr::new(10, 0, 0, 2),
                local_port: 10_000,
                remote_port: 80,
            },
            tcid: 0,
            active: true,
            ephemeral: false,
            session: Session::default(),
            app: build(
                &AppConfig::Raw {
                    req_size: 16,
                    resp_size: 16,
                },
                TestRole::Client,
            ),
            proto: ProtoCb::Udp(UdpCb {
                state: UcbState::Init,
            }),
        }
    }

    #[test]
    fn handle_goes_stale_after_release() {
        let mut pool = CcbPool::new(4);
        let handle = pool.alloc(test_ccb()).unwrap();

        assert!(pool.get(handle).is_some());
        assert!(pool.release(handle).is_some());

        assert!(pool.get(handle).is_none());
        assert!(pool.get_mut(handle).is_none());
        assert!(pool.release(handle).is_none());
    }

    #[test]
    fn reused_slot_gets_fresh_generation() {
        let mut pool = CcbPool::new(4);
        let old = pool.alloc(test_ccb()).unwrap();
        pool.release(old);

        let new = pool.alloc(test_ccb()).unwrap();
        assert_ne!(old, new);
        assert!(pool.get(old).is_none());
        assert!(pool.get(new).is_some());
    }

    #[test]
    fn pool_enforces_capacity() {
        let mut pool = CcbPool::new(2);
        let first = pool.alloc(test_ccb()).unwrap();
        pool.alloc(test_ccb()).unwrap();

        assert!(matches!(
            pool.alloc(test_ccb()),
            Err(Error::PoolExhausted { capacity: 2 })
        ));

        pool.release(first);
        assert!(pool.alloc(test_ccb()).is_ok());
        assert_eq!(pool.in_use(), 2);
    }
}
