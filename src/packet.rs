//! Parsed-packet descriptors exchanged with the packet I/O layer.
//!
//! The engine never parses raw frames: the receive path hands it a
//! [`PacketDescriptor`] with the TCP/UDP header fields already extracted,
//! and the transmit path is a fire-and-forget enqueue of [`OutPacket`]s
//! consumed by an I/O layer outside this crate.

use std::fmt;
use std::net::Ipv4Addr;

use crate::config::L4Proto;

/// TCP control flags, packed the way they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags(u8);

impl TcpFlags {
    /// FIN: no more data from sender.
    pub const FIN: TcpFlags = TcpFlags(0x01);
    /// SYN: synchronize sequence numbers.
    pub const SYN: TcpFlags = TcpFlags(0x02);
    /// RST: reset the connection.
    pub const RST: TcpFlags = TcpFlags(0x04);
    /// PSH: push buffered data to the receiving application.
    pub const PSH: TcpFlags = TcpFlags(0x08);
    /// ACK: acknowledgment field is significant.
    pub const ACK: TcpFlags = TcpFlags(0x10);
    /// URG: urgent pointer field is significant.
    pub const URG: TcpFlags = TcpFlags(0x20);

    /// Returns `true` if every flag in `other` is set in `self`.
    #[inline]
    pub fn contains(self, other: TcpFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns the union of both flag sets.
    #[inline]
    pub fn with(self, other: TcpFlags) -> TcpFlags {
        TcpFlags(self.0 | other.0)
    }

    #[inline]
    /// Returns `true` if the SYN flag is set.
    pub fn syn(self) -> bool {
        self.contains(TcpFlags::SYN)
    }

    #[inline]
    /// Returns `true` if the ACK flag is set.
    pub fn ack(self) -> bool {
        self.contains(TcpFlags::ACK)
    }

    #[inline]
    /// Returns `true` if the RST flag is set.
    pub fn rst(self) -> bool {
        self.contains(TcpFlags::RST)
    }

    #[inline]
    /// Returns `true` if the FIN flag is set.
    pub fn fin(self) -> bool {
        self.contains(TcpFlags::FIN)
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(TcpFlags, &str); 6] = [
            (TcpFlags::SYN, "SYN"),
            (TcpFlags::ACK, "ACK"),
            (TcpFlags::FIN, "FIN"),
            (TcpFlags::RST, "RST"),
            (TcpFlags::PSH, "PSH"),
            (TcpFlags::URG, "URG"),
        ];

        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }

        if first {
            write!(f, "<none>")?;
        }

        Ok(())
    }
}

/// The 5-field key identifying a connection on an interface, always seen
/// from the local endpoint's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowTuple {
    /// Local IPv4 address.
    pub local_addr: Ipv4Addr,
    /// Remote IPv4 address.
    pub remote_addr: Ipv4Addr,
    /// Local port.
    pub local_port: u16,
    /// Remote port.
    pub remote_port: u16,
}

impl FlowTuple {
    /// Returns the tuple as seen from the remote endpoint, used when
    /// building outgoing packets.
    pub fn reversed(&self) -> FlowTuple {
        FlowTuple {
            local_addr: self.remote_addr,
            remote_addr: self.local_addr,
            local_port: self.remote_port,
            remote_port: self.local_port,
        }
    }
}

impl fmt::Display for FlowTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.local_addr, self.local_port, self.remote_addr, self.remote_port
        )
    }
}

/// TCP header fields the engine reads and writes. Everything else in the
/// header (checksum, offset, options) belongs to the I/O layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentMeta {
    /// Sequence number.
    pub seq: u32,
    /// Acknowledgment number; only meaningful when the ACK flag is set.
    pub ack: u32,
    /// Control flags.
    pub flags: TcpFlags,
    /// Advertised receive window.
    pub window: u16,
    /// Urgent pointer; carried through but otherwise unused.
    pub urgent: u16,
}

/// A received packet, parsed by the I/O layer into the fields the engine
/// needs.
#[derive(Debug, Clone)]
pub struct PacketDescriptor {
    /// Interface the packet arrived on.
    pub interface: u32,
    /// Transport protocol, decided by the parser.
    pub proto: L4Proto,
    /// Addresses and ports, local side first.
    pub flow: FlowTuple,
    /// L4 header fields; for UDP only the flow and payload are meaningful.
    pub seg: SegmentMeta,
    /// L5 payload bytes.
    pub payload: Vec<u8>,
    /// Receive timestamp in microseconds, sampled once per poll iteration.
    pub rx_tstamp_us: u64,
}

impl PacketDescriptor {
    /// Segment length for acceptability purposes: payload bytes plus one
    /// for SYN and one for FIN (RFC 793 counts both in sequence space).
    pub fn seg_len(&self) -> u32 {
        let mut len = self.payload.len() as u32;
        if self.seg.flags.syn() {
            len += 1;
        }
        if self.seg.flags.fin() {
            len += 1;
        }
        len
    }
}

/// An outgoing packet handed to the transmit path.
#[derive(Debug, Clone)]
pub struct OutPacket {
    /// Interface to transmit on.
    pub interface: u32,
    /// Addresses and ports, local side first (the I/O layer writes
    /// `local` as the source).
    pub flow: FlowTuple,
    /// L4 header fields.
    pub seg: SegmentMeta,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_contains_and_union() {
        let flags = TcpFlags::SYN.with(TcpFlags::ACK);
        assert!(flags.syn());
        assert!(flags.ack());
        assert!(!flags.fin());
        assert!(flags.contains(TcpFlags::SYN));
        assert!(!flags.contains(TcpFlags::SYN.with(TcpFlags::FIN)));
        assert_eq!(format!("{flags}"), "SYN|ACK");
    }

    #[test]
    fn seg_len_counts_syn_and_fin() {
        let mut pkt = PacketDescriptor {
            interface: 0,
            proto: L4Proto::Tcp,
            flow: FlowTuple {
                local_addr: Ipv4Addr::new(10, 0, 0, 1),
                remote_addr: Ipv4Addr::new(10, 0, 0, 2),
                local_port: 80,
                remote_port: 4242,
            },
            seg: SegmentMeta::default(),
            payload: vec![0; 10],
            rx_tstamp_us: 0,
        };

        assert_eq!(pkt.seg_len(), 10);

        pkt.seg.flags = TcpFlags::SYN;
        assert_eq!(pkt.seg_len(), 11);

        pkt.seg.flags = TcpFlags::SYN.with(TcpFlags::FIN);
        assert_eq!(pkt.seg_len(), 12);
    }

    #[test]
    fn flow_tuple_reversal() {
        let flow = FlowTuple {
            local_addr: Ipv4Addr::new(10, 0, 0, 1),
            remote_addr: Ipv4Addr::new(10, 0, 0, 2),
            local_port: 80,
            remote_port: 4242,
        };

        let rev = flow.reversed();
        assert_eq!(rev.local_addr, flow.remote_addr);
        assert_eq!(rev.local_port, flow.remote_port);
        assert_eq!(rev.reversed(), flow);
    }
}
