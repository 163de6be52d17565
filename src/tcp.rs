//! DNS-over-TCP stream reassembly.
//!
//! A SYN establishes per-flow state and the sequence number of the first
//! message's two-byte length prefix. For every later segment on the flow:
//!
//! 1. A segment carrying the length prefix frames the next message. If the
//!    whole message is in the segment it is delivered without touching a
//!    reassembly buffer; otherwise a message buffer is allocated and any
//!    held segments belonging to it are replayed.
//! 2. A segment whose first byte falls inside an in-flight message fills
//!    that message's holes (RFC 815). A message with no holes left is
//!    delivered and freed.
//! 3. A segment ahead of everything framed so far is held until a matching
//!    message appears, or discarded if it lies outside the TCP window.
//!
//! This copes with reordering, duplication and overlap, including segments
//! of different messages interleaved on the wire and messages that do not
//! start on segment boundaries. All per-flow memory is bounded by small
//! fixed tables; anything beyond a bound is dropped silently.

use crate::transport::{DnsHandler, TransportMessage};
use log::{debug, trace};
use lru::LruCache;
use std::net::IpAddr;
use std::num::NonZeroUsize;

/// Upper bound on live flows; a new flow is dropped once the table is full.
const MAX_TCP_STATE: usize = 65535;
/// Idle seconds after which a flow is expired at the window boundary.
pub(crate) const MAX_TCP_IDLE: i64 = 60;
/// Largest plausible distance ahead of the framing point (max TCP window).
const MAX_TCP_WINDOW_SIZE: u32 = 0xFFFF << 14;

/// Messages being reassembled per flow.
const MAX_TCP_MSGS: usize = 8;
/// Held segments not yet assigned to a message, per flow.
const MAX_TCP_SEGS: usize = 8;
/// Holes per reassembly buffer.
const MAX_TCP_HOLES: usize = 8;

/// Direction-sensitive flow identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TcpKey {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl TcpKey {
    fn forward(tm: &TransportMessage) -> Self {
        Self {
            src_ip: tm.src_ip,
            dst_ip: tm.dst_ip,
            src_port: tm.src_port,
            dst_port: tm.dst_port,
        }
    }

    fn reverse(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
        }
    }
}

/// The TCP fields the reassembler needs from a decoded segment header.
#[derive(Debug, Clone, Copy)]
pub struct SegmentHeader {
    pub seq: u32,
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
}

/// A still-missing byte range of a message buffer; `len == 0` marks the
/// descriptor unused.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Hole {
    start: u16,
    len: u16,
}

/// Reassembly buffer for one DNS message.
#[derive(Debug)]
struct MsgBuf {
    /// Sequence number of the first byte after the length prefix.
    seq: u32,
    dnslen: u16,
    holes: usize,
    hole: [Hole; MAX_TCP_HOLES],
    buf: Vec<u8>,
}

/// A segment held until a message it belongs to is framed.
#[derive(Debug)]
struct SegBuf {
    seq: u32,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct TcpState {
    /// Sequence number of the length prefix of the next message to frame.
    seq_start: u32,
    /// Staging for a length prefix that straddles a segment boundary.
    dnslen_buf: [u8; 2],
    fin: bool,
    last_use: i64,
    msgbufs: usize,
    msgbuf: [Option<Box<MsgBuf>>; MAX_TCP_MSGS],
    segbuf: [Option<Box<SegBuf>>; MAX_TCP_SEGS],
}

impl TcpState {
    /// Begin a new message stream at `seq`, dropping anything in flight.
    fn reset(&mut self, seq: u32) {
        self.seq_start = seq;
        self.fin = false;
        if self.msgbufs > 0 {
            self.msgbufs = 0;
            for slot in &mut self.msgbuf {
                *slot = None;
            }
        }
        for slot in &mut self.segbuf {
            *slot = None;
        }
    }

    /// Allocate a reassembly buffer for a freshly framed message whose head
    /// (`head`, possibly empty) arrived with the length prefix, then replay
    /// any held segments that fall inside it.
    fn start_msgbuf<H: DnsHandler>(
        &mut self,
        seq: u32,
        dnslen: u16,
        head: &[u8],
        tm: &TransportMessage,
        handler: &mut H,
    ) {
        let Some(m) = self.msgbuf.iter().position(|slot| slot.is_none()) else {
            debug!("tcp: out of msgbufs, dropping message at {seq}");
            return;
        };
        let mut msg = Box::new(MsgBuf {
            seq,
            dnslen,
            holes: 1,
            hole: [Hole::default(); MAX_TCP_HOLES],
            buf: vec![0; dnslen as usize],
        });
        msg.hole[0] = Hole {
            start: head.len() as u16,
            len: dnslen - head.len() as u16,
        };
        msg.buf[..head.len()].copy_from_slice(head);
        trace!("tcp: new msgbuf {m}: seq = {seq}, dnslen = {dnslen}");
        self.msgbuf[m] = Some(msg);
        self.msgbufs += 1;

        // Now that the message length is known, held segments may belong
        // to it.
        for s in 0..MAX_TCP_SEGS {
            let Some(seg) = self.segbuf[s].take() else {
                continue;
            };
            if seg.seq.wrapping_sub(seq) < dnslen as u32 {
                stream_segment(self, &seg.data, seg.seq, tm, handler);
            } else {
                self.segbuf[s] = Some(seg);
            }
        }
    }

    /// Park a segment that matched nothing yet.
    fn hold_segment(&mut self, seq: u32, data: &[u8]) {
        let Some(s) = self.segbuf.iter().position(|slot| slot.is_none()) else {
            debug!("tcp: out of segbufs, dropping segment at {seq}");
            return;
        };
        trace!("tcp: holding segment {s}: seq = {seq}, len = {}", data.len());
        self.segbuf[s] = Some(Box::new(SegBuf {
            seq,
            data: data.to_vec(),
        }));
    }

    /// Fill message `m` from a segment starting `segoff` bytes into it,
    /// adapting the hole table per RFC 815. Returns the number of segment
    /// bytes consumed, or `None` when the hole table overflowed and the
    /// rest of the segment must be discarded.
    fn fill_msgbuf<H: DnsHandler>(
        &mut self,
        m: usize,
        segoff: usize,
        data: &[u8],
        tm: &TransportMessage,
        handler: &mut H,
    ) -> Option<usize> {
        let Some(msg) = self.msgbuf[m].as_mut() else {
            return Some(data.len());
        };
        // Payload past the end of this message belongs to the next one and
        // is handled by the caller.
        let seglen = data.len().min(msg.dnslen as usize - segoff);

        for i in 0..MAX_TCP_HOLES {
            let Hole { start, len } = msg.hole[i];
            if len == 0 {
                continue;
            }
            let (hstart, hlen) = (start as usize, len as usize);
            if segoff >= hstart + hlen {
                continue; // segment is wholly after this hole
            }
            if segoff + seglen <= hstart {
                continue; // segment is wholly before this hole
            }
            msg.hole[i] = Hole::default();
            msg.holes -= 1;
            if segoff + seglen < hstart + hlen {
                // unreceived bytes remain after the segment; slot i has
                // just been freed
                msg.hole[i] = Hole {
                    start: (segoff + seglen) as u16,
                    len: (hstart + hlen - segoff - seglen) as u16,
                };
                msg.holes += 1;
            }
            if segoff > hstart {
                // unreceived bytes remain before the segment
                let Some(j) = msg.hole.iter().position(|h| h.len == 0) else {
                    debug!("tcp: out of hole descriptors");
                    return None;
                };
                msg.hole[j] = Hole {
                    start: hstart as u16,
                    len: (segoff - hstart) as u16,
                };
                msg.holes += 1;
            }
            if segoff >= hstart && segoff + seglen <= hstart + hlen {
                // segment fit inside this hole; no other hole can overlap
                break;
            }
        }

        msg.buf[segoff..segoff + seglen].copy_from_slice(&data[..seglen]);
        let complete = msg.holes == 0;
        if complete {
            if let Some(done) = self.msgbuf[m].take() {
                handler.handle_dns(&done.buf, tm);
                self.msgbufs -= 1;
            }
        }
        Some(seglen)
    }
}

/// Run one segment's payload through the per-flow state machine.
fn stream_segment<H: DnsHandler>(
    state: &mut TcpState,
    mut data: &[u8],
    mut seq: u32,
    tm: &TransportMessage,
    handler: &mut H,
) {
    loop {
        if data.is_empty() {
            return;
        }
        let off = seq.wrapping_sub(state.seq_start);
        if off < 2 {
            // this segment contains all or part of the 2-byte length prefix
            let n = if off == 0 && data.len() > 1 { 2 } else { 1 };
            state.dnslen_buf[off as usize..off as usize + n].copy_from_slice(&data[..n]);
            data = &data[n..];
            seq = seq.wrapping_add(n as u32);
            if seq.wrapping_sub(state.seq_start) < 2 {
                // only the first prefix byte has arrived so far
                return;
            }
            let dnslen = u16::from_be_bytes(state.dnslen_buf);
            state.seq_start = state.seq_start.wrapping_add(2 + dnslen as u32);
            trace!("tcp: framed message at {seq}, dnslen = {dnslen}");
            if data.len() >= dnslen as usize {
                // the whole message is in this segment; skip the
                // reassembly buffer and handle any trailing bytes
                handler.handle_dns(&data[..dnslen as usize], tm);
                data = &data[dnslen as usize..];
                seq = seq.wrapping_add(dnslen as u32);
                continue;
            }
            state.start_msgbuf(seq, dnslen, data, tm, handler);
            return;
        }

        // find the message the first byte of this segment belongs to
        let mut hit = None;
        for m in 0..MAX_TCP_MSGS {
            if let Some(msg) = &state.msgbuf[m] {
                let segoff = seq.wrapping_sub(msg.seq);
                if segoff < msg.dnslen as u32 {
                    hit = Some((m, segoff as usize));
                    break;
                }
            }
        }
        let Some((m, segoff)) = hit else {
            // the segment is ahead of everything framed so far
            if seq.wrapping_sub(state.seq_start) > MAX_TCP_WINDOW_SIZE {
                trace!("tcp: segment at {seq} is outside the window, discarding");
                return;
            }
            state.hold_segment(seq, data);
            return;
        };

        match state.fill_msgbuf(m, segoff, data, tm, handler) {
            Some(consumed) if consumed < data.len() => {
                data = &data[consumed..];
                seq = seq.wrapping_add(consumed as u32);
            }
            _ => return,
        }
    }
}

/// Replay held segments that have become the next length prefix.
///
/// A held segment can *begin* a message that was not yet framed when it was
/// parked; once `seq_start` catches up to it, feed it back through the
/// state machine.
fn replay_held_prefixes<H: DnsHandler>(
    state: &mut TcpState,
    tm: &TransportMessage,
    handler: &mut H,
) {
    loop {
        let mut ready = None;
        for s in 0..MAX_TCP_SEGS {
            if let Some(seg) = &state.segbuf[s] {
                if seg.seq.wrapping_sub(state.seq_start) < 2 {
                    ready = Some(s);
                    break;
                }
            }
        }
        let Some(s) = ready else {
            return;
        };
        if let Some(seg) = state.segbuf[s].take() {
            stream_segment(state, &seg.data, seg.seq, tm, handler);
        }
    }
}

/// Per-flow TCP reassembly over a bounded, recency-ordered flow table.
///
/// The table owns every flow's state; `lru`'s internal recency list stands
/// in for an intrusive last-use list, so a flow is tracked for idle expiry
/// exactly as long as it is in the table. A flow being processed is
/// detached (`pop`) and re-inserted at the newest position (`put`) when it
/// is kept.
pub struct TcpReassembler {
    dns_port: u16,
    flows: LruCache<TcpKey, TcpState>,
}

impl TcpReassembler {
    pub fn new(dns_port: u16) -> Self {
        Self {
            dns_port,
            flows: LruCache::new(NonZeroUsize::new(MAX_TCP_STATE).expect("nonzero table size")),
        }
    }

    /// Number of flows currently tracked.
    pub fn active_flows(&self) -> usize {
        self.flows.len()
    }

    /// Feed one TCP segment through the reassembler. `tm` must already
    /// carry the segment's addressing; `payload` is the TCP payload.
    pub fn process_segment<H: DnsHandler>(
        &mut self,
        tm: &TransportMessage,
        hdr: &SegmentHeader,
        payload: &[u8],
        handler: &mut H,
    ) {
        if self.dns_port != tm.src_port && self.dns_port != tm.dst_port {
            return;
        }
        let key = TcpKey::forward(tm);
        let mut seq = hdr.seq;
        trace!(
            "tcp: {}:{} -> {}:{} seq = {seq}, len = {}",
            tm.src_ip,
            tm.src_port,
            tm.dst_ip,
            tm.dst_port,
            payload.len()
        );

        // Detach the flow from the recency order while we work on it.
        let state = self.flows.pop(&key);

        if state.is_none() && !hdr.syn {
            // No existing state and not the start of a stream: there is no
            // way to synchronize. (Commonly the final ACK after a FIN.)
            return;
        }

        if hdr.rst {
            // tear down both directions
            drop(state);
            self.flows.pop(&key.reverse());
            return;
        }

        let mut state = if hdr.syn {
            seq = seq.wrapping_add(1); // the SYN consumes a sequence number
            match state {
                Some(mut st) => {
                    st.reset(seq);
                    st
                }
                None => {
                    if self.flows.len() >= self.flows.cap().get() {
                        debug!("tcp: flow table full, dropping new flow");
                        return;
                    }
                    let mut st = TcpState::default();
                    st.reset(seq);
                    st
                }
            }
        } else {
            match state {
                Some(st) => st,
                None => return,
            }
        };

        stream_segment(&mut state, payload, seq, tm, handler);
        replay_held_prefixes(&mut state, tm, handler);

        if hdr.fin && !state.fin {
            state.fin = true;
        }
        if state.fin && state.msgbufs == 0 {
            // stream ended and nothing is left in flight
            return;
        }
        state.last_use = tm.ts_sec;
        self.flows.put(key, state);
    }

    /// Drop every flow whose last segment is older than `threshold`.
    pub fn expire_older_than(&mut self, threshold: i64) {
        let mut n = 0usize;
        while let Some((_, state)) = self.flows.peek_lru() {
            if state.last_use >= threshold {
                break;
            }
            self.flows.pop_lru();
            n += 1;
        }
        if n > 0 {
            debug!("tcp: discarded {n} idle flows");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Proto;
    use std::net::Ipv4Addr;

    const CLIENT: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
    const SERVER: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 53));

    fn tm_at(ts: i64) -> TransportMessage {
        let mut tm = TransportMessage::new(ts, 0);
        tm.src_ip = CLIENT;
        tm.dst_ip = SERVER;
        tm.src_port = 33000;
        tm.dst_port = 53;
        tm.proto = Proto::Tcp;
        tm
    }

    fn tm() -> TransportMessage {
        tm_at(1_700_000_000)
    }

    fn reversed(tm: &TransportMessage) -> TransportMessage {
        let mut r = tm.clone();
        std::mem::swap(&mut r.src_ip, &mut r.dst_ip);
        std::mem::swap(&mut r.src_port, &mut r.dst_port);
        r
    }

    fn hdr(seq: u32) -> SegmentHeader {
        SegmentHeader {
            seq,
            fin: false,
            syn: false,
            rst: false,
        }
    }

    fn syn(seq: u32) -> SegmentHeader {
        SegmentHeader {
            syn: true,
            ..hdr(seq)
        }
    }

    #[derive(Default)]
    struct Collector(Vec<Vec<u8>>);

    impl DnsHandler for Collector {
        fn handle_dns(&mut self, payload: &[u8], _tm: &TransportMessage) {
            self.0.push(payload.to_vec());
        }
    }

    fn key_of(tm: &TransportMessage) -> TcpKey {
        TcpKey::forward(tm)
    }

    #[test]
    fn single_segment_fast_path() {
        let mut r = TcpReassembler::new(53);
        let tm = tm();
        let mut out = Collector::default();
        r.process_segment(&tm, &syn(1000), &[], &mut out);
        r.process_segment(&tm, &hdr(1001), &[0, 8, 1, 2, 3, 4, 5, 6, 7, 8], &mut out);
        assert_eq!(out.0, vec![vec![1, 2, 3, 4, 5, 6, 7, 8]]);
        // nothing was buffered along the way
        let state = r.flows.peek(&key_of(&tm)).unwrap();
        assert_eq!(state.msgbufs, 0);
        assert!(state.segbuf.iter().all(|s| s.is_none()));
    }

    #[test]
    fn message_split_across_segments() {
        let mut r = TcpReassembler::new(53);
        let tm = tm();
        let mut out = Collector::default();
        r.process_segment(&tm, &syn(1000), &[], &mut out);
        r.process_segment(&tm, &hdr(1001), &[0, 8, 1, 2, 3, 4], &mut out);
        assert!(out.0.is_empty());
        assert_eq!(r.flows.peek(&key_of(&tm)).unwrap().msgbufs, 1);
        r.process_segment(&tm, &hdr(1007), &[5, 6, 7, 8], &mut out);
        assert_eq!(out.0, vec![vec![1, 2, 3, 4, 5, 6, 7, 8]]);
        assert_eq!(r.flows.peek(&key_of(&tm)).unwrap().msgbufs, 0);
    }

    #[test]
    fn out_of_order_segment_is_held_then_used() {
        let mut r = TcpReassembler::new(53);
        let tm = tm();
        let mut out = Collector::default();
        r.process_segment(&tm, &syn(1000), &[], &mut out);
        r.process_segment(&tm, &hdr(1007), &[5, 6, 7, 8], &mut out);
        assert!(out.0.is_empty());
        {
            let state = r.flows.peek(&key_of(&tm)).unwrap();
            assert_eq!(state.segbuf.iter().filter(|s| s.is_some()).count(), 1);
        }
        r.process_segment(&tm, &hdr(1001), &[0, 8, 1, 2, 3, 4], &mut out);
        assert_eq!(out.0, vec![vec![1, 2, 3, 4, 5, 6, 7, 8]]);
        let state = r.flows.peek(&key_of(&tm)).unwrap();
        assert!(state.segbuf.iter().all(|s| s.is_none()));
        assert_eq!(state.msgbufs, 0);
    }

    #[test]
    fn interleaved_messages_in_consecutive_segments() {
        let mut r = TcpReassembler::new(53);
        let tm = tm();
        let mut out = Collector::default();
        r.process_segment(&tm, &syn(1000), &[], &mut out);
        r.process_segment(&tm, &hdr(1001), &[0, 4, 0xa0, 0xa1], &mut out);
        r.process_segment(
            &tm,
            &hdr(1005),
            &[0xa2, 0xa3, 0, 4, 0xb0, 0xb1, 0xb2, 0xb3],
            &mut out,
        );
        assert_eq!(
            out.0,
            vec![vec![0xa0, 0xa1, 0xa2, 0xa3], vec![0xb0, 0xb1, 0xb2, 0xb3]]
        );
    }

    #[test]
    fn back_to_back_messages_in_one_segment() {
        let mut r = TcpReassembler::new(53);
        let tm = tm();
        let mut out = Collector::default();
        let mut payload = Vec::new();
        for v in [0x11u8, 0x22, 0x33] {
            payload.extend_from_slice(&[0, 3, v, v, v]);
        }
        r.process_segment(&tm, &syn(2000), &[], &mut out);
        r.process_segment(&tm, &hdr(2001), &payload, &mut out);
        assert_eq!(
            out.0,
            vec![
                vec![0x11, 0x11, 0x11],
                vec![0x22, 0x22, 0x22],
                vec![0x33, 0x33, 0x33]
            ]
        );
    }

    #[test]
    fn length_prefix_straddles_segments() {
        let mut r = TcpReassembler::new(53);
        let tm = tm();
        let mut out = Collector::default();
        r.process_segment(&tm, &syn(1000), &[], &mut out);
        r.process_segment(&tm, &hdr(1001), &[0], &mut out);
        assert!(out.0.is_empty());
        r.process_segment(&tm, &hdr(1002), &[4, 9, 8, 7, 6], &mut out);
        assert_eq!(out.0, vec![vec![9, 8, 7, 6]]);
    }

    #[test]
    fn rst_removes_both_directions() {
        let mut r = TcpReassembler::new(53);
        let fwd = tm();
        let rev = reversed(&fwd);
        let mut out = Collector::default();
        // establish state with a pending message in each direction
        r.process_segment(&fwd, &syn(1000), &[], &mut out);
        r.process_segment(&fwd, &hdr(1001), &[0, 8, 1, 2], &mut out);
        r.process_segment(&rev, &syn(5000), &[], &mut out);
        r.process_segment(&rev, &hdr(5001), &[0, 8, 9, 9], &mut out);
        assert_eq!(r.active_flows(), 2);

        let rst = SegmentHeader {
            rst: true,
            ..hdr(1005)
        };
        r.process_segment(&fwd, &rst, &[], &mut out);
        assert_eq!(r.active_flows(), 0);

        // a later non-SYN segment on the torn-down flow is dropped
        r.process_segment(&fwd, &hdr(1005), &[3, 4, 5, 6, 7, 8], &mut out);
        assert!(out.0.is_empty());
        assert_eq!(r.active_flows(), 0);
    }

    #[test]
    fn ninth_concurrent_message_is_dropped() {
        let mut r = TcpReassembler::new(53);
        let tm = tm();
        let mut out = Collector::default();
        r.process_segment(&tm, &syn(1000), &[], &mut out);
        // start nine messages of dnslen 4, each missing its last two bytes
        for i in 0..9u32 {
            let seq = 1001 + i * 6;
            r.process_segment(&tm, &hdr(seq), &[0, 4, i as u8, i as u8], &mut out);
        }
        assert_eq!(r.flows.peek(&key_of(&tm)).unwrap().msgbufs, 8);
        // complete all nine; only the first eight can ever be delivered
        for i in 0..9u32 {
            let seq = 1001 + i * 6 + 4;
            r.process_segment(&tm, &hdr(seq), &[i as u8, i as u8], &mut out);
        }
        assert_eq!(out.0.len(), 8);
        for (i, msg) in out.0.iter().enumerate() {
            assert_eq!(msg, &vec![i as u8; 4]);
        }
    }

    #[test]
    fn ninth_held_segment_is_dropped() {
        let mut r = TcpReassembler::new(53);
        let tm = tm();
        let mut out = Collector::default();
        r.process_segment(&tm, &syn(1000), &[], &mut out);
        // nine in-window segments that match nothing framed yet
        for i in 0..9u32 {
            r.process_segment(&tm, &hdr(1010 + i * 10), &[i as u8; 4], &mut out);
        }
        let state = r.flows.peek(&key_of(&tm)).unwrap();
        assert_eq!(state.segbuf.iter().filter(|s| s.is_some()).count(), 8);
        assert!(out.0.is_empty());
    }

    #[test]
    fn segment_outside_window_is_discarded() {
        let mut r = TcpReassembler::new(53);
        let tm = tm();
        let mut out = Collector::default();
        r.process_segment(&tm, &syn(1000), &[], &mut out);
        r.process_segment(&tm, &hdr(1001 + (1 << 30) + 100), &[1, 2, 3], &mut out);
        let state = r.flows.peek(&key_of(&tm)).unwrap();
        assert!(state.segbuf.iter().all(|s| s.is_none()));
        // the flow still works afterwards
        r.process_segment(&tm, &hdr(1001), &[0, 2, 0xaa, 0xbb], &mut out);
        assert_eq!(out.0, vec![vec![0xaa, 0xbb]]);
    }

    #[test]
    fn no_state_and_no_syn_is_dropped() {
        let mut r = TcpReassembler::new(53);
        let tm = tm();
        let mut out = Collector::default();
        r.process_segment(&tm, &hdr(1001), &[0, 2, 1, 2], &mut out);
        assert!(out.0.is_empty());
        assert_eq!(r.active_flows(), 0);
    }

    #[test]
    fn uninteresting_ports_are_ignored() {
        let mut r = TcpReassembler::new(53);
        let mut tm = tm();
        tm.dst_port = 8080;
        let mut out = Collector::default();
        r.process_segment(&tm, &syn(1000), &[], &mut out);
        assert_eq!(r.active_flows(), 0);
    }

    #[test]
    fn syn_resets_existing_flow() {
        let mut r = TcpReassembler::new(53);
        let tm = tm();
        let mut out = Collector::default();
        r.process_segment(&tm, &syn(1000), &[], &mut out);
        r.process_segment(&tm, &hdr(1001), &[0, 8, 1, 2, 3], &mut out);
        // the connection restarts at a new sequence number
        r.process_segment(&tm, &syn(9000), &[], &mut out);
        r.process_segment(&tm, &hdr(9001), &[0, 2, 0xcc, 0xdd], &mut out);
        assert_eq!(out.0, vec![vec![0xcc, 0xdd]]);
        assert_eq!(r.active_flows(), 1);
    }

    #[test]
    fn fin_drops_state_once_no_messages_pend() {
        let mut r = TcpReassembler::new(53);
        let tm = tm();
        let mut out = Collector::default();
        r.process_segment(&tm, &syn(1000), &[], &mut out);
        // FIN while a message is still incomplete keeps the flow
        r.process_segment(&tm, &hdr(1001), &[0, 4, 1, 2], &mut out);
        let fin = SegmentHeader {
            fin: true,
            ..hdr(1005)
        };
        r.process_segment(&tm, &fin, &[], &mut out);
        assert_eq!(r.active_flows(), 1);
        // completing the message lets the flow go
        r.process_segment(&tm, &hdr(1005), &[3, 4], &mut out);
        assert_eq!(out.0, vec![vec![1, 2, 3, 4]]);
        assert_eq!(r.active_flows(), 0);
    }

    #[test]
    fn idle_flows_expire() {
        let mut r = TcpReassembler::new(53);
        let mut out = Collector::default();
        let old = tm_at(1_700_000_000);
        let mut fresh = tm_at(1_700_000_050);
        fresh.src_port = 34000;
        r.process_segment(&old, &syn(1000), &[], &mut out);
        r.process_segment(&fresh, &syn(1000), &[], &mut out);
        assert_eq!(r.active_flows(), 2);
        r.expire_older_than(1_700_000_065 - MAX_TCP_IDLE);
        assert_eq!(r.active_flows(), 1);
        assert!(r.flows.peek(&key_of(&fresh)).is_some());
    }

    fn permutations(n: usize) -> Vec<Vec<usize>> {
        fn go(cur: &mut Vec<usize>, used: &mut [bool], out: &mut Vec<Vec<usize>>) {
            if cur.len() == used.len() {
                out.push(cur.clone());
                return;
            }
            for i in 0..used.len() {
                if !used[i] {
                    used[i] = true;
                    cur.push(i);
                    go(cur, used, out);
                    cur.pop();
                    used[i] = false;
                }
            }
        }
        let mut out = Vec::new();
        go(&mut Vec::new(), &mut vec![false; n], &mut out);
        out
    }

    #[test]
    fn every_permutation_reassembles_the_stream() {
        // two length-prefixed messages split into five segments, including
        // one segment that straddles the message boundary
        let msg_a = vec![0xa0, 0xa1, 0xa2, 0xa3];
        let msg_b = vec![0xb0, 0xb1, 0xb2, 0xb3];
        let mut stream = Vec::new();
        stream.extend_from_slice(&[0, 4]);
        stream.extend_from_slice(&msg_a);
        stream.extend_from_slice(&[0, 4]);
        stream.extend_from_slice(&msg_b);
        let cuts = [0usize, 2, 5, 7, 10, 12];
        let segments: Vec<(u32, &[u8])> = cuts
            .windows(2)
            .map(|w| (1001 + w[0] as u32, &stream[w[0]..w[1]]))
            .collect();

        for order in permutations(segments.len()) {
            let mut r = TcpReassembler::new(53);
            let tm = tm();
            let mut out = Collector::default();
            r.process_segment(&tm, &syn(1000), &[], &mut out);
            for &i in &order {
                let (seq, data) = segments[i];
                r.process_segment(&tm, &hdr(seq), data, &mut out);
            }
            let mut got = out.0.clone();
            got.sort();
            assert_eq!(
                got,
                vec![msg_a.clone(), msg_b.clone()],
                "failed for arrival order {order:?}"
            );
        }
    }

    #[test]
    fn overlapping_duplicate_segments_complete_once() {
        let mut r = TcpReassembler::new(53);
        let tm = tm();
        let mut out = Collector::default();
        r.process_segment(&tm, &syn(1000), &[], &mut out);
        r.process_segment(&tm, &hdr(1001), &[0, 6, 1, 2], &mut out);
        // duplicate bytes 1..=2 plus new bytes 3..=4
        r.process_segment(&tm, &hdr(1003), &[1, 2, 3, 4], &mut out);
        r.process_segment(&tm, &hdr(1007), &[5, 6], &mut out);
        assert_eq!(out.0, vec![vec![1, 2, 3, 4, 5, 6]]);
    }

    #[test]
    fn hole_in_the_middle_of_a_message() {
        let mut r = TcpReassembler::new(53);
        let tm = tm();
        let mut out = Collector::default();
        r.process_segment(&tm, &syn(1000), &[], &mut out);
        r.process_segment(&tm, &hdr(1001), &[0, 6, 1, 2], &mut out);
        // skip bytes 3..4, deliver tail first
        r.process_segment(&tm, &hdr(1007), &[5, 6], &mut out);
        assert!(out.0.is_empty());
        r.process_segment(&tm, &hdr(1005), &[3, 4], &mut out);
        assert_eq!(out.0, vec![vec![1, 2, 3, 4, 5, 6]]);
    }
}
