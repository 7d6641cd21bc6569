//! The data segment engine: the outbound retransmission queue and the
//! inbound out-of-order reassembly list.
//!
//! Both sides live on the connection control block and are driven by the
//! state machine. All sequence comparisons are wraparound-safe (see
//! [`crate::seq`]); byte counts below are plain `usize` lengths of owned
//! buffers.

use std::collections::VecDeque;

use crate::ccb::TcpCb;
use crate::config::TCP_SEGS_PER_SEND;
use crate::error::InvariantError;
use crate::seq::{seq_diff, seq_geq, seq_gt, seq_leq, seq_lt};
use crate::Result;

/// One outbound data segment produced by the send path, ready to be
/// wrapped in a header by the state machine.
#[derive(Debug, Clone)]
pub struct DataSegment {
    /// Sequence number of the first payload byte.
    pub seq: u32,
    /// Payload bytes.
    pub payload: Vec<u8>,
    /// Whether the PSH flag should be set.
    pub psh: bool,
}

/// Result of a send or retransmit walk over the queue.
#[derive(Debug)]
pub struct SendOutcome {
    /// Segments to transmit, in sequence order.
    pub segments: Vec<DataSegment>,
    /// The peer's window is full and unsent bytes remain queued.
    pub window_full: bool,
}

/// Outbound bytes not yet acknowledged by the peer. The queue owns every
/// byte in `[snd.una, snd.una + total)`; the trailing `unsent` bytes have
/// not been transmitted yet.
#[derive(Debug, Default)]
pub struct RetransQueue {
    chunks: VecDeque<Vec<u8>>,
    total: usize,
    unsent: usize,
}

impl RetransQueue {
    /// Creates an empty queue.
    pub fn new() -> RetransQueue {
        RetransQueue::default()
    }

    /// Total queued bytes, sent and unsent.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Queued bytes not yet transmitted.
    pub fn unsent(&self) -> usize {
        self.unsent
    }

    /// Queued bytes already transmitted at least once.
    pub fn sent(&self) -> usize {
        self.total - self.unsent
    }

    /// `true` when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Appends `bytes` to the tail of the queue, provided the whole input
    /// fits in `avail`. Returns the number of bytes accepted: everything,
    /// or zero with the input dropped (the caller sees the rejection in
    /// its return value and backs off).
    pub fn store(&mut self, bytes: Vec<u8>, avail: usize) -> usize {
        let len = bytes.len();
        if len == 0 || len > avail {
            return 0;
        }

        self.chunks.push_back(bytes);
        self.total += len;
        self.unsent += len;
        len
    }

    /// Offset of the first unsent byte from the head of the queue.
    pub fn unsent_offset(&self) -> usize {
        self.total - self.unsent
    }

    /// Copies out up to `max` bytes starting `offset` bytes from the head
    /// of the queue, without consuming anything.
    ///
    /// # Errors
    ///
    /// Returns an internal invariant error if `offset` lies past the end
    /// of the queue.
    pub fn copy_range(&self, offset: usize, max: usize) -> Result<Vec<u8>> {
        if offset > self.total {
            return Err(InvariantError::SendOffsetOutOfBounds {
                offset,
                total: self.total,
            }
            .into());
        }

        let mut out = Vec::with_capacity(max.min(self.total - offset));
        let mut skip = offset;

        for chunk in &self.chunks {
            if out.len() >= max {
                break;
            }

            if skip >= chunk.len() {
                skip -= chunk.len();
                continue;
            }

            let want = max - out.len();
            let end = chunk.len().min(skip + want);
            out.extend_from_slice(&chunk[skip..end]);
            skip = 0;
        }

        Ok(out)
    }

    /// Marks `n` queued bytes as transmitted.
    pub fn mark_sent(&mut self, n: usize) {
        debug_assert!(n <= self.unsent);
        self.unsent -= n;
    }

    /// Drops `acked` bytes from the head of the queue, trimming a
    /// partially covered chunk in place.
    ///
    /// # Errors
    ///
    /// Returns an internal invariant error if the peer acknowledged more
    /// bytes than were ever transmitted.
    pub fn purge_acked(&mut self, acked: u32) -> Result<()> {
        let mut left = acked as usize;
        if left > self.sent() {
            return Err(InvariantError::RetransUnderflow {
                acked,
                queued: self.sent(),
            }
            .into());
        }

        while left > 0 {
            let head_len = self.chunks.front().map(Vec::len).unwrap_or(0);

            if head_len <= left {
                self.chunks.pop_front();
                left -= head_len;
                self.total -= head_len;
            } else {
                let head = self.chunks.front_mut().unwrap();
                head.drain(..left);
                self.total -= left;
                left = 0;
            }
        }

        Ok(())
    }
}

/// Returns `true` when no more data can go out: the in-flight bytes cover
/// the peer's advertised window.
pub fn snd_win_full(tcp: &TcpCb) -> bool {
    let in_flight = seq_diff(tcp.snd.nxt, tcp.snd.una).max(0) as u32;
    in_flight >= tcp.snd.wnd
}

/// Bytes the retransmission queue can still accept: bounded by the
/// configured window size and by one burst worth of segments.
pub fn avail_send(tcp: &TcpCb) -> usize {
    let win_limit = (tcp.sockopt.win_size as usize).saturating_sub(tcp.retrans.total());
    win_limit.min(TCP_SEGS_PER_SEND * tcp.sockopt.mss)
}

/// Walks the unsent tail of the queue and produces up to
/// [`TCP_SEGS_PER_SEND`] MSS-sized segments, never exceeding the peer's
/// window. `snd.nxt` advances for every byte handed out.
pub fn send_segments(tcp: &mut TcpCb) -> Result<SendOutcome> {
    let mss = tcp.sockopt.mss;
    let in_flight = seq_diff(tcp.snd.nxt, tcp.snd.una).max(0) as usize;
    let wnd_avail = (tcp.snd.wnd as usize).saturating_sub(in_flight);

    let mut to_send = tcp.retrans.unsent().min(wnd_avail);
    let mut offset = tcp.retrans.unsent_offset();
    let mut segments = Vec::new();

    while to_send > 0 && segments.len() < TCP_SEGS_PER_SEND {
        let len = to_send.min(mss);
        let payload = tcp.retrans.copy_range(offset, len)?;
        debug_assert_eq!(payload.len(), len);

        tcp.retrans.mark_sent(len);
        offset += len;
        to_send -= len;

        // Push the data up to the application once the unsent backlog
        // drops below one segment.
        let psh = tcp.retrans.unsent() < mss;

        segments.push(DataSegment {
            seq: tcp.snd.nxt,
            payload,
            psh,
        });

        tcp.snd.nxt = tcp.snd.nxt.wrapping_add(len as u32);
    }

    let window_full = tcp.retrans.unsent() > 0 && snd_win_full(tcp);

    Ok(SendOutcome {
        segments,
        window_full,
    })
}

/// Re-sends already transmitted bytes starting at `snd.una`, up to the
/// peer's window, in MSS-sized segments.
pub fn retrans_segments(tcp: &TcpCb) -> Result<Vec<DataSegment>> {
    let mss = tcp.sockopt.mss;
    let mut to_resend = tcp.retrans.sent().min(tcp.snd.wnd as usize);
    let mut offset = 0;
    let mut segments = Vec::new();

    while to_resend > 0 && segments.len() < TCP_SEGS_PER_SEND {
        let len = to_resend.min(mss);
        let payload = tcp.retrans.copy_range(offset, len)?;

        segments.push(DataSegment {
            seq: tcp.snd.una.wrapping_add(offset as u32),
            payload,
            psh: to_resend <= mss,
        });

        offset += len;
        to_resend -= len;
    }

    Ok(segments)
}

/// One out-of-order segment awaiting delivery.
#[derive(Debug, Clone)]
pub struct RecvSeg {
    /// Sequence number of the first byte.
    pub seq: u32,
    /// The bytes themselves.
    pub data: Vec<u8>,
}

impl RecvSeg {
    fn end(&self) -> u32 {
        self.seq.wrapping_add(self.data.len() as u32)
    }
}

/// Out-of-order inbound segments, kept sorted by sequence number with no
/// two entries overlapping or adjacent.
#[derive(Debug, Default)]
pub struct ReassemblyList {
    segs: Vec<RecvSeg>,
}

/// Result of feeding one received segment through the reassembly engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeliverOutcome {
    /// Bytes handed to (and consumed by) the application this call.
    pub delivered: usize,
    /// The list went from empty to non-empty: a gap just opened.
    pub missing_started: bool,
    /// The list drained back to empty: all gaps closed.
    pub missing_cleared: bool,
}

impl ReassemblyList {
    /// Creates an empty list.
    pub fn new() -> ReassemblyList {
        ReassemblyList::default()
    }

    /// `true` when no out-of-order data is pending.
    pub fn is_empty(&self) -> bool {
        self.segs.is_empty()
    }

    /// Number of pending segments.
    pub fn len(&self) -> usize {
        self.segs.len()
    }

    /// Inserts `data` starting at `seq`, trimming against `rcv_nxt` and
    /// against already-known bytes, merging contiguous neighbors and
    /// dropping fully subsumed entries.
    fn insert(&mut self, rcv_nxt: u32, mut seq: u32, mut data: Vec<u8>) {
        // Entirely old data.
        let end = seq.wrapping_add(data.len() as u32);
        if seq_leq(end, rcv_nxt) || data.is_empty() {
            return;
        }

        // Trim the part preceding what we still expect.
        if seq_lt(seq, rcv_nxt) {
            let trim = rcv_nxt.wrapping_sub(seq) as usize;
            data.drain(..trim);
            seq = rcv_nxt;
        }

        // Find the first entry at or after seq.
        let pos = self
            .segs
            .iter()
            .position(|seg| seq_geq(seg.seq, seq))
            .unwrap_or(self.segs.len());

        // Trim against the predecessor; existing bytes win.
        if pos > 0 {
            let pred_end = self.segs[pos - 1].end();
            if seq_lt(seq, pred_end) {
                let overlap = pred_end.wrapping_sub(seq) as usize;
                if overlap >= data.len() {
                    return;
                }
                data.drain(..overlap);
                seq = pred_end;
            }
        }

        self.segs.insert(pos, RecvSeg { seq, data });

        // Absorb or trim successors now covered by the new entry.
        let mut end = self.segs[pos].end();
        while pos + 1 < self.segs.len() {
            let next_seq = self.segs[pos + 1].seq;
            if seq_gt(next_seq, end) {
                break;
            }

            let next_end = self.segs[pos + 1].end();
            if seq_leq(next_end, end) {
                // Fully subsumed.
                self.segs.remove(pos + 1);
                continue;
            }

            // Partial overlap (or exact adjacency): keep the successor's
            // tail and merge it in.
            let keep_from = end.wrapping_sub(next_seq) as usize;
            let next = self.segs.remove(pos + 1);
            self.segs[pos].data.extend_from_slice(&next.data[keep_from..]);
            end = self.segs[pos].end();
        }

        // Merge with the predecessor if the new entry closed the gap.
        if pos > 0 && self.segs[pos - 1].end() == seq {
            let seg = self.segs.remove(pos);
            self.segs[pos - 1].data.extend_from_slice(&seg.data);
        }
    }
}

/// Feeds one received byte range through reassembly and delivers whatever
/// became contiguous at `rcv_nxt` to `consume`. The closure returns how
/// many of the offered bytes the application took; a short count trims the
/// head in place and stops delivery until more data (or another call)
/// arrives.
///
/// # Errors
///
/// Returns an internal invariant error if the closure reports consuming
/// more bytes than were offered.
pub fn handle_incoming<F>(
    list: &mut ReassemblyList,
    rcv_nxt: &mut u32,
    seq: u32,
    data: Vec<u8>,
    mut consume: F,
) -> Result<DeliverOutcome>
where
    F: FnMut(&[u8]) -> usize,
{
    let was_empty = list.is_empty();

    list.insert(*rcv_nxt, seq, data);

    let mut delivered = 0;
    while let Some(head) = list.segs.first_mut() {
        if head.seq != *rcv_nxt {
            break;
        }

        let offered = head.data.len();
        let consumed = consume(&head.data);
        if consumed > offered {
            return Err(InvariantError::DeliveredTooMuch {
                delivered: consumed,
                available: offered,
            }
            .into());
        }

        *rcv_nxt = rcv_nxt.wrapping_add(consumed as u32);
        delivered += consumed;

        if consumed == offered {
            list.segs.remove(0);
        } else {
            // Partial delivery: the application wants the rest offered
            // again later. Trim what it took and stop.
            head.data.drain(..consumed);
            head.seq = *rcv_nxt;
            break;
        }
    }

    let is_empty = list.is_empty();

    Ok(DeliverOutcome {
        delivered,
        missing_started: was_empty && !is_empty,
        missing_cleared: !was_empty && is_empty,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(start: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| start.wrapping_add(i as u8)).collect()
    }

    fn consume_all(collected: &mut Vec<u8>) -> impl FnMut(&[u8]) -> usize + '_ {
        |offered: &[u8]| {
            collected.extend_from_slice(offered);
            offered.len()
        }
    }

    #[test]
    fn store_rejects_past_the_limit() {
        let mut queue = RetransQueue::new();

        assert_eq!(queue.store(vec![0; 100], 150), 100);
        // Whole input must fit; partial stores are not a thing.
        assert_eq!(queue.store(vec![0; 100], 50), 0);
        assert_eq!(queue.total(), 100);
        assert_eq!(queue.unsent(), 100);
    }

    #[test]
    fn copy_range_spans_chunk_boundaries() {
        let mut queue = RetransQueue::new();
        queue.store(bytes(0, 10), usize::MAX);
        queue.store(bytes(10, 10), usize::MAX);

        assert_eq!(queue.copy_range(5, 10).unwrap(), bytes(5, 10));
        assert_eq!(queue.copy_range(18, 10).unwrap(), bytes(18, 2));
        assert!(queue.copy_range(25, 1).is_err());
    }

    #[test]
    fn purge_trims_partial_chunks() {
        let mut queue = RetransQueue::new();
        queue.store(bytes(0, 10), usize::MAX);
        queue.store(bytes(10, 10), usize::MAX);
        queue.mark_sent(15);

        queue.purge_acked(13).unwrap();
        assert_eq!(queue.total(), 7);
        assert_eq!(queue.sent(), 2);
        assert_eq!(queue.copy_range(0, 7).unwrap(), bytes(13, 7));

        // Acknowledging bytes that were never sent is a bug.
        assert!(queue.purge_acked(5).is_err());
    }

    #[test]
    fn in_order_segment_is_delivered_immediately() {
        let mut list = ReassemblyList::new();
        let mut rcv_nxt = 1000;
        let mut out = Vec::new();

        let outcome =
            handle_incoming(&mut list, &mut rcv_nxt, 1000, bytes(0, 50), consume_all(&mut out))
                .unwrap();

        assert_eq!(outcome.delivered, 50);
        assert!(!outcome.missing_started);
        assert_eq!(rcv_nxt, 1050);
        assert_eq!(out, bytes(0, 50));
        assert!(list.is_empty());
    }

    #[test]
    fn out_of_order_segments_deliver_once_the_gap_closes() {
        let mut list = ReassemblyList::new();
        let mut rcv_nxt = 0;
        let mut out = Vec::new();

        // [100, 150) then [50, 100) then [0, 50).
        let first =
            handle_incoming(&mut list, &mut rcv_nxt, 100, bytes(100, 50), consume_all(&mut out))
                .unwrap();
        assert_eq!(first.delivered, 0);
        assert!(first.missing_started);

        let second =
            handle_incoming(&mut list, &mut rcv_nxt, 50, bytes(50, 50), consume_all(&mut out))
                .unwrap();
        assert_eq!(second.delivered, 0);
        assert!(!second.missing_started);

        let third =
            handle_incoming(&mut list, &mut rcv_nxt, 0, bytes(0, 50), consume_all(&mut out))
                .unwrap();
        assert_eq!(third.delivered, 150);
        assert!(third.missing_cleared);

        assert_eq!(rcv_nxt, 150);
        assert_eq!(out, bytes(0, 150));
    }

    #[test]
    fn arrival_permutations_reproduce_the_stream() {
        // Six permutations of three segments, with an overlapping
        // retransmission thrown in.
        let chunks: [(u32, usize); 3] = [(0, 40), (40, 30), (70, 30)];
        let perms: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];

        for perm in perms {
            let mut list = ReassemblyList::new();
            let mut rcv_nxt = 0;
            let mut out = Vec::new();

            for &i in &perm {
                let (seq, len) = chunks[i];
                handle_incoming(
                    &mut list,
                    &mut rcv_nxt,
                    seq,
                    bytes(seq as u8, len),
                    consume_all(&mut out),
                )
                .unwrap();
            }

            // A duplicate covering the middle must change nothing.
            handle_incoming(&mut list, &mut rcv_nxt, 30, bytes(30, 50), consume_all(&mut out))
                .unwrap();

            assert_eq!(rcv_nxt, 100, "permutation {perm:?}");
            assert_eq!(out, bytes(0, 100), "permutation {perm:?}");
            assert!(list.is_empty());
        }
    }

    #[test]
    fn overlapping_inserts_keep_existing_bytes() {
        let mut list = ReassemblyList::new();
        let mut rcv_nxt = 0;
        let mut out = Vec::new();

        // Gap at [0, 10); [10, 30) and [20, 40) overlap by 10 bytes.
        handle_incoming(&mut list, &mut rcv_nxt, 10, bytes(10, 20), consume_all(&mut out))
            .unwrap();
        handle_incoming(&mut list, &mut rcv_nxt, 20, bytes(20, 20), consume_all(&mut out))
            .unwrap();
        assert_eq!(list.len(), 1);

        let outcome =
            handle_incoming(&mut list, &mut rcv_nxt, 0, bytes(0, 10), consume_all(&mut out))
                .unwrap();
        assert_eq!(outcome.delivered, 40);
        assert_eq!(out, bytes(0, 40));
    }

    #[test]
    fn partial_delivery_trims_the_head_and_stops() {
        let mut list = ReassemblyList::new();
        let mut rcv_nxt = 0;

        // The application takes only 10 of 30 offered bytes.
        let mut calls = 0;
        let outcome = handle_incoming(&mut list, &mut rcv_nxt, 0, bytes(0, 30), |_offered| {
            calls += 1;
            10
        })
        .unwrap();

        assert_eq!(calls, 1);
        assert_eq!(outcome.delivered, 10);
        assert_eq!(rcv_nxt, 10);
        assert_eq!(list.len(), 1);

        // The remainder is re-offered on the next call.
        let mut out = Vec::new();
        let outcome =
            handle_incoming(&mut list, &mut rcv_nxt, 30, bytes(30, 5), consume_all(&mut out))
                .unwrap();
        assert_eq!(outcome.delivered, 25);
        assert_eq!(out, bytes(10, 25));
        assert_eq!(rcv_nxt, 35);
        assert!(outcome.missing_cleared);
    }

    #[test]
    fn reassembly_handles_sequence_wraparound() {
        let mut list = ReassemblyList::new();
        let mut rcv_nxt = u32::MAX - 9;
        let mut out = Vec::new();

        // [MAX-9, MAX+11) arrives after [MAX+11, MAX+21) (both wrap).
        let high_seq = u32::MAX - 9;
        let wrapped_seq = high_seq.wrapping_add(20);

        handle_incoming(&mut list, &mut rcv_nxt, wrapped_seq, bytes(20, 10), consume_all(&mut out))
            .unwrap();
        let outcome = handle_incoming(
            &mut list,
            &mut rcv_nxt,
            high_seq,
            bytes(0, 20),
            consume_all(&mut out),
        )
        .unwrap();

        assert_eq!(outcome.delivered, 30);
        assert_eq!(rcv_nxt, high_seq.wrapping_add(30));
        assert_eq!(out, bytes(0, 30));
    }

    fn send_test_cb(wnd: u32, mss: usize) -> TcpCb {
        use crate::ccb::{RecvSeqSpace, SendSeqSpace};
        use crate::config::TcpSockOpt;
        use crate::tcp::TcbState;

        TcpCb {
            state: TcbState::ESTABLISHED,
            snd: SendSeqSpace {
                una: 1000,
                nxt: 1000,
                wnd,
                wl1: 0,
                wl2: 0,
                iss: 1000,
            },
            rcv: RecvSeqSpace::default(),
            retry_cnt: 0,
            rto_tmr: None,
            slow_tmr: None,
            retrans: RetransQueue::new(),
            reasm: ReassemblyList::new(),
            fin_pending: None,
            sockopt: TcpSockOpt {
                mss,
                ..TcpSockOpt::default()
            },
        }
    }

    #[test]
    fn send_emits_mss_sized_segments_and_advances_nxt() {
        let mut tcp = send_test_cb(10_000, 100);
        tcp.retrans.store(bytes(0, 250), usize::MAX);

        let outcome = send_segments(&mut tcp).unwrap();
        assert_eq!(outcome.segments.len(), 3);
        assert_eq!(outcome.segments[0].seq, 1000);
        assert_eq!(outcome.segments[0].payload.len(), 100);
        assert!(!outcome.segments[0].psh);
        assert_eq!(outcome.segments[2].seq, 1200);
        assert_eq!(outcome.segments[2].payload.len(), 50);
        assert!(outcome.segments[2].psh);
        assert!(!outcome.window_full);

        assert_eq!(tcp.snd.nxt, 1250);
        assert_eq!(tcp.retrans.unsent(), 0);
        // Queue still owns everything until the peer acknowledges.
        assert_eq!(tcp.retrans.total(), 250);
    }

    #[test]
    fn send_respects_the_peer_window() {
        let mut tcp = send_test_cb(120, 100);
        tcp.retrans.store(bytes(0, 500), usize::MAX);

        let outcome = send_segments(&mut tcp).unwrap();
        let sent: usize = outcome.segments.iter().map(|s| s.payload.len()).sum();
        assert_eq!(sent, 120);
        assert!(outcome.window_full);
        assert_eq!(tcp.snd.nxt, 1120);

        // Window exhausted: nothing more goes out.
        let outcome = send_segments(&mut tcp).unwrap();
        assert!(outcome.segments.is_empty());
        assert!(outcome.window_full);
    }

    #[test]
    fn send_caps_segments_per_burst() {
        let mut tcp = send_test_cb(100_000, 100);
        tcp.retrans.store(bytes(0, 1000), usize::MAX);

        let outcome = send_segments(&mut tcp).unwrap();
        assert_eq!(outcome.segments.len(), TCP_SEGS_PER_SEND);
        assert_eq!(tcp.retrans.unsent(), 1000 - TCP_SEGS_PER_SEND * 100);
    }

    #[test]
    fn retransmit_resends_from_una() {
        let mut tcp = send_test_cb(10_000, 100);
        tcp.retrans.store(bytes(0, 150), usize::MAX);
        send_segments(&mut tcp).unwrap();

        let segs = retrans_segments(&tcp).unwrap();
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].seq, 1000);
        assert_eq!(segs[0].payload, bytes(0, 100));
        assert_eq!(segs[1].seq, 1100);
        assert_eq!(segs[1].payload, bytes(100, 50));

        // snd.nxt does not move for retransmissions.
        assert_eq!(tcp.snd.nxt, 1150);
    }

    #[test]
    fn queue_size_matches_nxt_minus_una_at_quiescence() {
        let mut tcp = send_test_cb(10_000, 100);
        tcp.retrans.store(bytes(0, 300), usize::MAX);
        send_segments(&mut tcp).unwrap();

        let in_flight = seq_diff(tcp.snd.nxt, tcp.snd.una) as usize;
        assert_eq!(tcp.retrans.total(), in_flight);

        // Peer acknowledges half.
        tcp.retrans.purge_acked(150).unwrap();
        tcp.snd.una = tcp.snd.una.wrapping_add(150);
        let in_flight = seq_diff(tcp.snd.nxt, tcp.snd.una) as usize;
        assert_eq!(tcp.retrans.total(), in_flight);
    }
}
