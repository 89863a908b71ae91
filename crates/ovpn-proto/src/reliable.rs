//! Reliable control-channel transport.
//!
//! Two bounded windows per key context: outbound packets wait here
//! until the peer ACKs their message ID (with retransmission on
//! datagram transports), and inbound packets are reordered by
//! message ID before delivery to the TLS stream.

use std::collections::VecDeque;

use ovpn_core::buf::{BufResult, Reader};
use ovpn_core::time::{Duration, Time};

use crate::packet::Packet;

/// Control-channel message sequence number.
pub type MsgId = u32;

/// Flags returned by [`ReliableRecv::receive`].
pub const ACK_TO_SENDER: u8 = 1 << 0;
pub const IN_WINDOW: u8 = 1 << 1;

#[derive(Debug)]
struct SendEntry {
    id: MsgId,
    packet: Packet,
    next_try: Time,
}

/// Send window: unacknowledged outbound messages with retransmit
/// timers.
#[derive(Debug)]
pub struct ReliableSend {
    window: Vec<Option<SendEntry>>,
    next_id: MsgId,
    timeout: Duration,
}

impl ReliableSend {
    pub fn new(span: usize, timeout: Duration) -> Self {
        Self {
            window: (0..span).map(|_| None).collect(),
            next_id: 0,
            timeout,
        }
    }

    fn slot(&self, id: MsgId) -> usize {
        id as usize % self.window.len()
    }

    /// Is there room for another outbound message?
    pub fn ready(&self) -> bool {
        self.window[self.slot(self.next_id)].is_none()
    }

    /// ID the next [`send`](Self::send) will assign.
    pub fn peek_next_id(&self) -> MsgId {
        self.next_id
    }

    /// Store an encapsulated packet and start its retransmit timer.
    pub fn send(&mut self, packet: Packet, now: Time) -> MsgId {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        let slot = self.slot(id);
        debug_assert!(self.window[slot].is_none());
        self.window[slot] = Some(SendEntry {
            id,
            packet,
            next_try: now + self.timeout,
        });
        id
    }

    /// Erase a message the peer has acknowledged.
    pub fn ack(&mut self, id: MsgId) -> bool {
        let slot = self.slot(id);
        match &self.window[slot] {
            Some(entry) if entry.id == id => {
                self.window[slot] = None;
                true
            }
            _ => false,
        }
    }

    /// Number of messages still awaiting acknowledgement.
    pub fn n_unacked(&self) -> usize {
        self.window.iter().flatten().count()
    }

    /// Visit every entry whose retransmit timer has expired,
    /// resetting the timer as it goes.
    pub fn visit_due(&mut self, now: Time, mut f: impl FnMut(&Packet)) {
        for entry in self.window.iter_mut().flatten() {
            if now >= entry.next_try {
                f(&entry.packet);
                entry.next_try = now + self.timeout;
            }
        }
    }

    /// Earliest retransmit deadline, infinite when the window is
    /// empty.
    pub fn next_retransmit(&self) -> Time {
        self.window
            .iter()
            .flatten()
            .map(|e| e.next_try)
            .min()
            .unwrap_or_else(Time::infinite)
    }
}

/// Receive window: reorders inbound messages by ID.
#[derive(Debug)]
pub struct ReliableRecv {
    window: Vec<Option<Packet>>,
    start: MsgId,
}

impl ReliableRecv {
    pub fn new(span: usize) -> Self {
        Self {
            window: (0..span).map(|_| None).collect(),
            start: 0,
        }
    }

    fn slot(&self, id: MsgId) -> usize {
        id as usize % self.window.len()
    }

    fn in_window(&self, id: MsgId) -> bool {
        id >= self.start && id < self.start + self.window.len() as MsgId
    }

    /// Offer a packet to the window.
    ///
    /// - below the low watermark: ACK again, do not deliver
    /// - inside the window: store (first copy only) and ACK
    /// - above the window: drop silently, no ACK
    pub fn receive(&mut self, packet: Packet, id: MsgId) -> u8 {
        if self.in_window(id) {
            let slot = self.slot(id);
            if self.window[slot].is_none() {
                self.window[slot] = Some(packet);
            }
            ACK_TO_SENDER | IN_WINDOW
        } else if id < self.start {
            ACK_TO_SENDER
        } else {
            0
        }
    }

    /// Is the next in-order message available?
    pub fn ready(&self) -> bool {
        self.window[self.slot(self.start)].is_some()
    }

    pub fn peek_ready(&self) -> Option<&Packet> {
        self.window[self.slot(self.start)].as_ref()
    }

    /// Pop the next in-order message and advance the watermark.
    pub fn next_sequenced(&mut self) -> Option<Packet> {
        let slot = self.slot(self.start);
        let packet = self.window[slot].take()?;
        self.start = self.start.wrapping_add(1);
        Some(packet)
    }
}

/// Queue of message IDs to acknowledge back to the peer.
#[derive(Debug, Default)]
pub struct AckList {
    pending: VecDeque<MsgId>,
}

impl AckList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: MsgId) {
        self.pending.push_back(id);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Serialize up to `max` pending ACKs: count byte then 4-byte
    /// IDs. Leftover IDs ride on a later packet.
    pub fn write(&mut self, buf: &mut Vec<u8>, max: usize) {
        let n = self.pending.len().min(max).min(0xff);
        buf.push(n as u8);
        for _ in 0..n {
            let id = self.pending.pop_front().expect("count bounded above");
            buf.extend_from_slice(&id.to_be_bytes());
        }
    }

    /// Parse an ACK array.
    pub fn read(r: &mut Reader<'_>) -> BufResult<Vec<MsgId>> {
        let n = r.u8()? as usize;
        let mut ids = Vec::with_capacity(n);
        for _ in 0..n {
            ids.push(r.u32()?);
        }
        Ok(ids)
    }

    /// Skip an ACK array; returns true when it was non-empty.
    pub fn skip(r: &mut Reader<'_>) -> BufResult<bool> {
        let n = r.u8()? as usize;
        r.skip(n * 4)?;
        Ok(n > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ovpn_core::constants::CONTROL_V1;

    fn pkt(tag: u8) -> Packet {
        Packet::new(CONTROL_V1, vec![tag])
    }

    fn now() -> Time {
        Time::from_secs(100)
    }

    #[test]
    fn test_send_ids_monotone() {
        let mut snd = ReliableSend::new(4, Duration::from_secs(1));
        for expect in 0..4 {
            assert!(snd.ready());
            assert_eq!(snd.peek_next_id(), expect);
            assert_eq!(snd.send(pkt(expect as u8), now()), expect);
        }
        assert!(!snd.ready());
        assert_eq!(snd.n_unacked(), 4);
    }

    #[test]
    fn test_ack_frees_window() {
        let mut snd = ReliableSend::new(2, Duration::from_secs(1));
        snd.send(pkt(0), now());
        snd.send(pkt(1), now());
        assert!(!snd.ready());
        assert!(snd.ack(0));
        assert!(snd.ready());
        assert_eq!(snd.n_unacked(), 1);
        // unknown ack ignored
        assert!(!snd.ack(7));
    }

    #[test]
    fn test_retransmit_after_timeout() {
        let mut snd = ReliableSend::new(4, Duration::from_secs(2));
        snd.send(pkt(0), now());

        let mut sent = Vec::new();
        snd.visit_due(now() + Duration::from_secs(1), |p| sent.push(p.buf[0]));
        assert!(sent.is_empty());

        snd.visit_due(now() + Duration::from_secs(2), |p| sent.push(p.buf[0]));
        assert_eq!(sent, vec![0]);

        // timer was reset
        assert_eq!(
            snd.next_retransmit(),
            now() + Duration::from_secs(2) + Duration::from_secs(2)
        );
    }

    #[test]
    fn test_recv_in_order() {
        let mut rcv = ReliableRecv::new(4);
        assert_eq!(rcv.receive(pkt(0), 0), ACK_TO_SENDER | IN_WINDOW);
        assert!(rcv.ready());
        assert_eq!(rcv.next_sequenced().unwrap().buf, vec![0]);
        assert!(!rcv.ready());
    }

    #[test]
    fn test_recv_reorders() {
        let mut rcv = ReliableRecv::new(4);
        assert_eq!(rcv.receive(pkt(2), 2), ACK_TO_SENDER | IN_WINDOW);
        assert!(!rcv.ready());
        assert_eq!(rcv.receive(pkt(0), 0), ACK_TO_SENDER | IN_WINDOW);
        assert_eq!(rcv.receive(pkt(1), 1), ACK_TO_SENDER | IN_WINDOW);

        for expect in 0..3u8 {
            assert_eq!(rcv.next_sequenced().unwrap().buf, vec![expect]);
        }
    }

    #[test]
    fn test_recv_below_watermark_acks_only() {
        let mut rcv = ReliableRecv::new(4);
        rcv.receive(pkt(0), 0);
        rcv.next_sequenced().unwrap();
        assert_eq!(rcv.receive(pkt(0), 0), ACK_TO_SENDER);
        assert!(!rcv.ready());
    }

    #[test]
    fn test_recv_above_window_dropped() {
        let mut rcv = ReliableRecv::new(4);
        assert_eq!(rcv.receive(pkt(9), 9), 0);
        assert!(!rcv.ready());
    }

    #[test]
    fn test_acklist_write_bounds() {
        let mut acks = AckList::new();
        for id in 0..6 {
            acks.push(id);
        }
        let mut buf = Vec::new();
        acks.write(&mut buf, 4);
        assert_eq!(buf[0], 4);
        assert_eq!(buf.len(), 1 + 4 * 4);
        assert_eq!(acks.len(), 2);

        let ids = AckList::read(&mut Reader::new(&buf)).unwrap();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_acklist_skip() {
        let mut acks = AckList::new();
        acks.push(7);
        let mut buf = Vec::new();
        acks.write(&mut buf, 4);
        buf.extend_from_slice(b"tail");

        let mut r = Reader::new(&buf);
        assert!(AckList::skip(&mut r).unwrap());
        assert_eq!(r.rest(), b"tail");

        let mut r = Reader::new(&[0u8]);
        assert!(!AckList::skip(&mut r).unwrap());
    }
}
