//! Per-connection transport engine.
//!
//! Each connection owns its sequence spaces, send and reorder rings,
//! retransmission timers, RTT estimator, and congestion window. The
//! endpoint demultiplexes datagrams to connections and drives their
//! timers; everything here runs on the caller's thread.
//!
//! ## State machine
//!
//! ```text
//!                    connect           inbound SYN
//!   UNINITIALIZED ───────────▶ SYN_SENT      │
//!        │                        │          ▼
//!        │                  STATE │      SYN_RECV
//!        │                        ▼          │ DATA
//!        │                   CONNECTED ◀─────┘
//!        │                        │ ▲
//!        │            window full │ │ ack frees window
//!        │                        ▼ │
//!        │                 CONNECTED_FULL
//!        │                        │
//!        │       close            │ close / FIN exchange
//!        └──────────▶ DESTROY ◀── FIN_SENT
//! ```

use std::any::Any;
use std::io::IoSlice;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::packet::{self, extension, Header, PacketType, HEADER_SIZE};
use crate::ring::RingBuffer;
use crate::seq::{seq_after, seq_before};
use crate::{
    event, Events, ACK_BEHIND_ALLOWED, KEEPALIVE_INTERVAL_MS, MAX_VEC, QUEUE_SIZE_MAX,
    RETRANSMIT_TIMEOUT_DEFAULT_MS, RETRANSMIT_TIMEOUT_MAX_MS, RETRANSMIT_TIMEOUT_MIN_MS,
    WAIT_FIN_SENT_MS, WAIT_SYN_RECV_MS, WINDOW_EXPAND_FACTOR, WINDOW_SHRINK_FACTOR,
    WINDOW_SIZE_DEFAULT, WINDOW_SIZE_MAX,
};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Created but not yet connected or accepted
    Uninitialized,
    /// SYN sent, waiting for the peer's STATE
    SynSent,
    /// Inbound SYN acknowledged, waiting for the first DATA
    SynRecv,
    /// Established, window open
    Connected,
    /// Established, send window exhausted
    ConnectedFull,
    /// FIN queued, draining outstanding packets
    FinSent,
    /// Terminal; swept by the endpoint on the next tick
    Destroy,
}

/// A send-queue entry: one encoded packet plus its bookkeeping.
#[derive(Debug)]
struct PacketRecord {
    /// Payload length, header excluded
    payload: usize,
    /// Last transmission time, milliseconds
    sent_time: u64,
    transmissions: u32,
    /// Flagged by the retransmit timer; excluded from flight accounting
    needs_resend: bool,
    /// Encoded header + payload
    data: Vec<u8>,
}

/// Consumes caller buffers left to right while packets are assembled.
struct SliceCursor<'a, 'b> {
    bufs: &'a [IoSlice<'b>],
    idx: usize,
    off: usize,
}

impl<'a, 'b> SliceCursor<'a, 'b> {
    fn new(bufs: &'a [IoSlice<'b>]) -> Self {
        Self { bufs, idx: 0, off: 0 }
    }

    /// Append exactly `needed` bytes to `dst`. The caller never requests
    /// more than the cursor has left.
    fn copy_to(&mut self, dst: &mut Vec<u8>, mut needed: usize) {
        while needed > 0 {
            let buf = &self.bufs[self.idx];
            let avail = buf.len() - self.off;
            if avail == 0 {
                self.idx += 1;
                self.off = 0;
                continue;
            }
            let n = needed.min(avail);
            dst.extend_from_slice(&buf[self.off..self.off + n]);
            self.off += n;
            needed -= n;
        }
    }
}

fn limited_retransmit_timeout(t: u64) -> u64 {
    if t > 0 {
        t.clamp(RETRANSMIT_TIMEOUT_MIN_MS, RETRANSMIT_TIMEOUT_MAX_MS)
    } else {
        RETRANSMIT_TIMEOUT_DEFAULT_MS
    }
}

fn limited_window(t: u32, floor: u32) -> u32 {
    if t > 0 {
        t.clamp(floor, WINDOW_SIZE_MAX)
    } else {
        WINDOW_SIZE_DEFAULT
    }
}

/// One logical connection multiplexed on the endpoint's UDP socket.
pub(crate) struct Connection {
    state: ConnState,
    peer: SocketAddr,
    id_seed: u16,
    pub(crate) recv_id: u16,
    send_id: u16,

    /// Next sequence number to assign
    seqnr: u16,
    /// Highest in-order sequence received
    acknr: u16,
    /// Sequence carried by the peer's FIN
    eof_seqnr: u16,
    /// In-flight record count; the queue occupies `[seqnr - queue, seqnr)`
    queue: u16,
    /// Occupied reorder slots past `acknr`
    out_of_order_count: u16,

    inbuf: RingBuffer<Vec<u8>>,
    outbuf: RingBuffer<PacketRecord>,

    /// Bytes sent and not yet acknowledged or flagged for resend
    flight_window: u32,
    /// Bytes built but never transmitted
    unsent_bytes: u32,
    flight_window_limit: u32,
    recv_window_peer: u32,
    recv_window_self: u32,

    rtt: u32,
    rtt_var: u32,
    next_retransmit_timeout: u64,
    retransmit_timeout: u64,
    retransmit_ticker: u64,
    /// Head of the queue when the last retransmit round started
    oldest_resent: Option<u16>,

    last_received_packet: u64,
    last_sent_packet: u64,

    received_fin: bool,
    received_fin_completed: bool,
    need_send_ack: bool,

    max_payload: usize,
    pub(crate) user_data: Option<Box<dyn Any + Send>>,
}

impl Connection {
    pub(crate) fn new(initial_seqnr: u16, max_payload: usize) -> Self {
        let floor = max_payload as u32;
        Self {
            state: ConnState::Uninitialized,
            peer: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
            id_seed: 0,
            recv_id: 0,
            send_id: 0,
            seqnr: initial_seqnr,
            acknr: 0,
            eof_seqnr: 0,
            queue: 0,
            out_of_order_count: 0,
            inbuf: RingBuffer::new(),
            outbuf: RingBuffer::new(),
            flight_window: 0,
            unsent_bytes: 0,
            flight_window_limit: limited_window(0, floor),
            recv_window_peer: limited_window(WINDOW_SIZE_MAX, floor),
            recv_window_self: limited_window(WINDOW_SIZE_MAX, floor),
            rtt: 0,
            rtt_var: 0,
            next_retransmit_timeout: limited_retransmit_timeout(0),
            retransmit_timeout: 0,
            retransmit_ticker: 0,
            oldest_resent: None,
            last_received_packet: 0,
            last_sent_packet: 0,
            received_fin: false,
            received_fin_completed: false,
            need_send_ack: false,
            max_payload,
            user_data: None,
        }
    }

    pub(crate) fn state(&self) -> ConnState {
        self.state
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn needs_ack(&self) -> bool {
        self.need_send_ack
    }

    /// Fix the connection identity. Registration order: the identity is
    /// set exactly once, before the first packet goes out.
    fn set_identity(&mut self, peer: SocketAddr, id_seed: u16, recv_id: u16, send_id: u16, now: u64) {
        self.peer = peer;
        self.id_seed = id_seed;
        self.recv_id = recv_id;
        self.send_id = send_id;
        self.last_received_packet = now;
    }

    /// True when this connection owns `(addr, recv_id)`.
    pub(crate) fn matches(&self, addr: SocketAddr, recv_id: u16) -> bool {
        self.state != ConnState::Uninitialized && self.recv_id == recv_id && self.peer == addr
    }

    /// Become the initiator: send a SYN carrying our receive id.
    pub(crate) fn start_connect(&mut self, socket: &UdpSocket, peer: SocketAddr, id_seed: u16, now: u64) {
        self.set_identity(peer, id_seed, id_seed, id_seed.wrapping_add(1), now);
        self.state = ConnState::SynSent;

        self.retransmit_timeout = self.next_retransmit_timeout;
        self.retransmit_ticker = now + self.retransmit_timeout;

        // The SYN is the one packet that carries recv_id; every later
        // packet carries send_id.
        let mut header = Header::new(PacketType::Syn, self.recv_id, self.seqnr, 0);
        header.window = self.recv_window_self;
        let mut data = Vec::with_capacity(HEADER_SIZE);
        header.encode_into(&mut data);

        let record = PacketRecord {
            payload: 0,
            sent_time: 0,
            transmissions: 0,
            needs_resend: false,
            data,
        };

        self.outbuf.ensure_size(self.seqnr, self.queue);
        self.outbuf.put(self.seqnr, record);
        let slot = self.seqnr;
        self.seqnr = self.seqnr.wrapping_add(1);
        self.queue += 1;
        self.send_record(socket, slot, now);

        tracing::debug!(conn = self.recv_id, %peer, "syn sent");
    }

    /// Become the acceptor for an inbound SYN.
    pub(crate) fn accept_syn(&mut self, peer: SocketAddr, header: &Header, now: u64) {
        self.set_identity(
            peer,
            header.conn_id,
            header.conn_id.wrapping_add(1),
            header.conn_id,
            now,
        );
        self.state = ConnState::SynRecv;
        self.acknr = header.seqnr;
        tracing::debug!(conn = self.recv_id, %peer, "syn received");
    }

    /// Reset the handshake retransmission deadline; used when a SYN or a
    /// retransmitted SYN arrives.
    pub(crate) fn arm_handshake_timer(&mut self, now: u64) {
        self.last_received_packet = now;
        self.retransmit_timeout = self.next_retransmit_timeout;
        self.retransmit_ticker = now + self.retransmit_timeout;
    }

    /// True when one more full packet would overflow the flight window.
    fn flight_window_full(&self) -> bool {
        self.flight_window + self.max_payload as u32
            > self.flight_window_limit.min(self.recv_window_peer)
    }

    /// The flight-window test again, but counting bytes that are queued
    /// and not yet transmitted; bounds write admission.
    fn admission_full(&self) -> bool {
        self.flight_window + self.unsent_bytes + self.max_payload as u32
            > self.flight_window_limit.min(self.recv_window_peer)
    }

    /// Transmit one record: patch the live header fields, stamp, count.
    fn send_record(&mut self, socket: &UdpSocket, slot: u16, now: u64) {
        let acknr = self.acknr;
        let peer = self.peer;
        let Some(rec) = self.outbuf.get_mut(slot) else {
            return;
        };
        debug_assert!(rec.transmissions == 0 || rec.needs_resend);

        self.flight_window += rec.payload as u32;
        if rec.transmissions == 0 {
            self.unsent_bytes = self.unsent_bytes.saturating_sub(rec.payload as u32);
        }
        rec.needs_resend = false;

        packet::patch_acknr(&mut rec.data, acknr);
        packet::patch_timestamp(&mut rec.data, now.wrapping_mul(1000) as u32);
        rec.sent_time = now;
        rec.transmissions += 1;

        if let Err(e) = socket.send_to(&rec.data, peer) {
            tracing::trace!(%peer, "send_to failed: {e}");
        }
        self.last_sent_packet = now;
    }

    /// Send every unsent or resend-flagged record the window allows.
    /// Returns true when the window filled up before the queue drained.
    pub(crate) fn flush_packets(&mut self, socket: &UdpSocket, now: u64) -> bool {
        let mut seq = self.seqnr.wrapping_sub(self.queue);
        while seq != self.seqnr {
            let wants_send = match self.outbuf.get(seq) {
                Some(rec) => rec.transmissions == 0 || rec.needs_resend,
                None => false,
            };
            if wants_send {
                if self.flight_window_full() {
                    tracing::trace!(
                        conn = self.recv_id,
                        flight = self.flight_window,
                        limit = self.flight_window_limit,
                        "flight window full"
                    );
                    return true;
                }
                self.send_record(socket, seq, now);
            }
            seq = seq.wrapping_add(1);
        }
        false
    }

    /// Append payload to the send queue, coalescing into an unsent tail
    /// record when possible.
    fn build_send_packet(
        &mut self,
        mut payload: usize,
        packet_type: PacketType,
        cursor: &mut SliceCursor<'_, '_>,
    ) {
        debug_assert!(self.queue > 0 || (self.flight_window == 0 && self.unsent_bytes == 0));
        debug_assert!(payload <= self.max_payload);

        loop {
            debug_assert!((self.queue as usize) < QUEUE_SIZE_MAX);

            let mut round = payload;
            let mut append = true;

            if payload > 0 && self.queue > 0 {
                let tail = self.seqnr.wrapping_sub(1);
                let max_payload = self.max_payload;
                if let Some(rec) = self.outbuf.get_mut(tail) {
                    if rec.transmissions == 0 && rec.payload < max_payload {
                        round = (payload + rec.payload).min(max_payload) - rec.payload;
                        cursor.copy_to(&mut rec.data, round);
                        rec.payload += round;
                        append = false;
                    }
                }
            }

            if append {
                let mut header = Header::new(packet_type, self.send_id, self.seqnr, self.acknr);
                header.window = self.recv_window_self;
                let mut data = Vec::with_capacity(HEADER_SIZE + round);
                header.encode_into(&mut data);

                let mut rec = PacketRecord {
                    payload: 0,
                    sent_time: 0,
                    transmissions: 0,
                    needs_resend: false,
                    data,
                };
                if round > 0 {
                    debug_assert_eq!(packet_type, PacketType::Data);
                    cursor.copy_to(&mut rec.data, round);
                    rec.payload = round;
                }

                self.outbuf.ensure_size(self.seqnr, self.queue);
                self.outbuf.put(self.seqnr, rec);
                self.seqnr = self.seqnr.wrapping_add(1);
                self.queue += 1;
            }

            self.unsent_bytes += round as u32;

            payload -= round;
            if payload == 0 {
                break;
            }
        }
    }

    /// Accept caller bytes into the send queue and flush what the window
    /// allows. Backpressure surfaces as [`Error::Again`].
    pub(crate) fn write_vectored(
        &mut self,
        socket: &UdpSocket,
        bufs: &[IoSlice<'_>],
        now: u64,
    ) -> Result<usize> {
        if bufs.is_empty() {
            return Err(Error::InvalidArgument("empty buffer list"));
        }
        if bufs.len() > MAX_VEC {
            return Err(Error::InvalidArgument("buffer list exceeds MAX_VEC"));
        }

        match self.state {
            ConnState::Uninitialized
            | ConnState::SynRecv
            | ConnState::Destroy
            | ConnState::FinSent => return Err(Error::InvalidState("connection not writable")),
            ConnState::SynSent | ConnState::ConnectedFull => return Err(Error::Again),
            ConnState::Connected => {}
        }

        if self.flight_window_full() {
            self.state = ConnState::ConnectedFull;
            return Err(Error::Again);
        }

        let mut total: usize = bufs.iter().map(|b| b.len()).sum();
        let mut sent = 0usize;
        let mut cursor = SliceCursor::new(bufs);

        // One queue slot stays reserved for the FIN.
        let mut valid = total.min(self.max_payload);
        while (self.queue as usize) < QUEUE_SIZE_MAX - 1 {
            if sent > 0 && self.admission_full() {
                self.state = ConnState::ConnectedFull;
                break;
            }

            total -= valid;
            sent += valid;
            self.build_send_packet(valid, PacketType::Data, &mut cursor);

            valid = total.min(self.max_payload);
            if valid == 0 {
                break;
            }
        }

        if self.flush_packets(socket, now) {
            self.state = ConnState::ConnectedFull;
        }

        if sent == 0 {
            if total == 0 {
                Ok(0)
            } else {
                Err(Error::Again)
            }
        } else {
            Ok(sent)
        }
    }

    /// Close the connection: queue a FIN, or destroy outright when the
    /// peer already finished.
    pub(crate) fn close(&mut self, socket: &UdpSocket, now: u64) -> Result<()> {
        match self.state {
            ConnState::Uninitialized
            | ConnState::SynRecv
            | ConnState::Destroy
            | ConnState::FinSent => Err(Error::InvalidState("connection not open")),
            ConnState::Connected | ConnState::ConnectedFull => {
                if self.received_fin {
                    self.state = ConnState::Destroy;
                    tracing::debug!(conn = self.recv_id, "passive close complete");
                    return Ok(());
                }

                if self.need_send_ack {
                    self.send_ack(socket, now);
                }

                debug_assert!((self.queue as usize) < QUEUE_SIZE_MAX);
                self.build_send_packet(0, PacketType::Fin, &mut SliceCursor::new(&[]));
                self.flush_packets(socket, now);

                self.state = ConnState::FinSent;
                tracing::debug!(conn = self.recv_id, "fin queued");
                Ok(())
            }
            ConnState::SynSent => {
                self.state = ConnState::Destroy;
                Ok(())
            }
        }
    }

    /// Acknowledge one record; feeds the RTT estimator on clean samples.
    fn ack_packet(&mut self, slot: u16, now: u64) -> bool {
        let Some(rec) = self.outbuf.take(slot) else {
            return false;
        };
        if rec.transmissions == 0 {
            tracing::debug!(conn = self.recv_id, slot, "ack for unsent packet");
            self.outbuf.put(slot, rec);
            return false;
        }

        if rec.transmissions == 1 {
            // Retransmitted packets make ambiguous samples; skip them.
            let sample = now.saturating_sub(rec.sent_time) as u32;
            if self.rtt == 0 {
                self.rtt = sample;
                self.rtt_var = sample / 2;
            } else {
                let delta = (self.rtt as i64 - sample as i64).abs();
                self.rtt_var = (self.rtt_var as i64 + (delta - self.rtt_var as i64) / 4) as u32;
                self.rtt = (self.rtt as i64 + (sample as i64 - self.rtt as i64) / 8) as u32;
            }
            self.next_retransmit_timeout =
                limited_retransmit_timeout(self.rtt as u64 + self.rtt_var as u64 * 4);
        }

        if !rec.needs_resend {
            debug_assert!(self.flight_window >= rec.payload as u32);
            self.flight_window = self.flight_window.saturating_sub(rec.payload as u32);
        }
        true
    }

    /// Apply a selective-ack bitmask; bit 0 names slot `start`.
    ///
    /// Clear bits are implicit losses, left for the retransmit timer; the
    /// queue head is never selectively acked, the cumulative ack owns it.
    fn selective_ack(&mut self, start: u16, mask: &[u8], now: u64) {
        if mask.is_empty() {
            return;
        }

        let mut offset = (mask.len() * 8 - 1) as isize;
        while offset >= 0 {
            let v = start.wrapping_add(offset as u16);

            let dist = self.seqnr.wrapping_sub(v).wrapping_sub(1);
            if dist >= self.queue.wrapping_sub(1) {
                offset -= 1;
                continue;
            }

            let bit = mask[(offset as usize) >> 3] & (1u8 << (offset & 7));
            if bit != 0 {
                let transmitted = self
                    .outbuf
                    .get(v)
                    .map(|rec| rec.transmissions > 0)
                    .unwrap_or(false);
                if transmitted {
                    debug_assert!(
                        v as usize & self.outbuf.mask()
                            != (self.seqnr.wrapping_sub(self.queue)) as usize & self.outbuf.mask()
                    );
                    self.ack_packet(v, now);
                }
            }
            offset -= 1;
        }
    }

    /// Emit a STATE packet, with a selective-ack bitmask whenever the
    /// reorder buffer holds anything.
    pub(crate) fn send_ack(&mut self, socket: &UdpSocket, now: u64) {
        let mut header = Header::new(PacketType::State, self.send_id, self.seqnr, self.acknr);
        header.window = self.recv_window_self;
        header.timestamp_us = now.wrapping_mul(1000) as u32;

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + 64);

        if self.out_of_order_count > 0
            && self.state != ConnState::SynRecv
            && !self.received_fin_completed
        {
            // Mask length rounds up to a multiple of four and must fit
            // both the length byte and the datagram.
            let sack_len = ((self.out_of_order_count as usize / 8 + 1 + 3) & !3)
                .min(252)
                .min((self.max_payload - 2) & !3);

            debug_assert!(self.inbuf.get(self.acknr.wrapping_add(1)).is_none());

            header.extension = extension::SELECTIVE_ACK;
            header.encode_into(&mut buf);
            buf.put_u8(extension::NONE);
            buf.put_u8(sack_len as u8);

            let bits = (sack_len * 8).min(self.inbuf.mask());
            for byte_idx in 0..sack_len {
                let mut b = 0u8;
                for bit in 0..8 {
                    let j = byte_idx * 8 + bit;
                    if j >= bits {
                        break;
                    }
                    let slot = self.acknr.wrapping_add(2).wrapping_add(j as u16);
                    if self.inbuf.get(slot).is_some() {
                        b |= 1 << bit;
                    }
                }
                buf.put_u8(b);
            }
        } else {
            header.encode_into(&mut buf);
        }

        if let Err(e) = socket.send_to(&buf, self.peer) {
            tracing::trace!(peer = %self.peer, "send_to failed: {e}");
        }
        self.last_sent_packet = now;
        self.need_send_ack = false;
    }

    /// Probe the peer with an ack one behind the real cumulative ack, so
    /// it reads as a probe rather than new information.
    fn keepalive(&mut self, socket: &UdpSocket, now: u64) {
        self.acknr = self.acknr.wrapping_sub(1);
        self.send_ack(socket, now);
        self.acknr = self.acknr.wrapping_add(1);
        tracing::trace!(conn = self.recv_id, "keepalive probe");
    }

    /// Multiplicative window adjustment, once per retransmit round: no
    /// head progress halves the limit, progress doubles it.
    fn resize_window(&mut self) {
        debug_assert!(self
            .outbuf
            .get(self.seqnr.wrapping_sub(self.queue))
            .is_some());

        let head = self.seqnr.wrapping_sub(self.queue);
        let floor = self.max_payload as u32;

        match self.oldest_resent {
            None => {
                self.oldest_resent = Some(head);
            }
            Some(mark) if mark == head => {
                self.flight_window_limit =
                    limited_window(self.flight_window_limit / WINDOW_SHRINK_FACTOR, floor);
                tracing::debug!(
                    conn = self.recv_id,
                    limit = self.flight_window_limit,
                    "retransmit round made no progress, window halved"
                );
            }
            Some(mark) => {
                debug_assert!(mark != head);
                self.flight_window_limit = limited_window(
                    self.flight_window_limit.saturating_mul(WINDOW_EXPAND_FACTOR),
                    floor,
                );
                self.oldest_resent = Some(head);
            }
        }
    }

    /// Re-arm the retransmission ticker relative to the oldest in-flight
    /// record. The remainder is computed signed and clamped at zero; an
    /// overdue head schedules an immediate ticker.
    fn update_retransmit_timeout(&mut self, now: u64) {
        let mut after_last_sent: u64 = 0;
        if self.queue != 0 {
            if let Some(rec) = self.outbuf.get(self.seqnr.wrapping_sub(self.queue)) {
                if rec.transmissions > 0 {
                    after_last_sent = now.saturating_sub(rec.sent_time);
                }
            }
        }

        let remaining = self.next_retransmit_timeout as i64 - after_last_sent as i64;
        self.retransmit_timeout = remaining.max(0) as u64;
        self.retransmit_ticker = now + self.retransmit_timeout;
    }

    /// Periodic maintenance: idle kills, retransmission, keepalive.
    ///
    /// Returns the time until this connection next needs a tick, or None
    /// when it contributes no deadline.
    pub(crate) fn check(&mut self, socket: &UdpSocket, now: u64) -> Option<u64> {
        debug_assert!(
            self.queue == 0
                || self
                    .outbuf
                    .get(self.seqnr.wrapping_sub(self.queue))
                    .is_some()
        );

        match self.state {
            ConnState::SynSent
            | ConnState::SynRecv
            | ConnState::Connected
            | ConnState::ConnectedFull
            | ConnState::FinSent => {}
            ConnState::Uninitialized | ConnState::Destroy => return None,
        }

        if now >= self.retransmit_ticker {
            if self.state == ConnState::FinSent
                && now >= self.last_received_packet + WAIT_FIN_SENT_MS
            {
                self.state = ConnState::Destroy;
                tracing::debug!(conn = self.recv_id, "fin-sent wait expired");
                return None;
            }

            if self.state == ConnState::SynRecv
                && now >= self.last_received_packet + WAIT_SYN_RECV_MS
            {
                self.state = ConnState::Destroy;
                tracing::debug!(conn = self.recv_id, "syn-recv wait expired");
                return None;
            }

            if self.queue > 0 {
                let timeout = self.retransmit_timeout;
                let mut seq = self.seqnr.wrapping_sub(self.queue);
                while seq != self.seqnr {
                    if let Some(rec) = self.outbuf.get_mut(seq) {
                        if rec.transmissions > 0
                            && !rec.needs_resend
                            && now >= rec.sent_time + timeout
                        {
                            rec.needs_resend = true;
                            let p = rec.payload as u32;
                            debug_assert!(self.flight_window >= p);
                            self.flight_window = self.flight_window.saturating_sub(p);
                        }
                    }
                    seq = seq.wrapping_add(1);
                }

                self.resize_window();
                self.flush_packets(socket, now);
            }

            self.update_retransmit_timeout(now);
        }

        if matches!(self.state, ConnState::Connected | ConnState::ConnectedFull)
            && now >= self.last_sent_packet + KEEPALIVE_INTERVAL_MS
        {
            self.keepalive(socket, now);
        }

        Some(self.retransmit_ticker.saturating_sub(now))
    }

    /// Hand buffered in-order data (or the EOF) to the caller.
    ///
    /// Outer None: nothing to do on this connection. `Some(None)`: an
    /// event fired with no payload. `Some(Some(0))` is the EOF, reported
    /// exactly once; `Some(Some(n))` delivered n bytes.
    pub(crate) fn drain(
        &mut self,
        user_buf: &mut [u8],
        socket: &UdpSocket,
        events: &mut Events,
        now: u64,
    ) -> Option<Option<usize>> {
        if !matches!(self.state, ConnState::Connected | ConnState::ConnectedFull) {
            return None;
        }

        if !self.received_fin_completed && self.received_fin && self.eof_seqnr == self.acknr {
            self.received_fin_completed = true;
            self.send_ack(socket, now);
            self.out_of_order_count = 0;
            *events = event::DATA;
            tracing::debug!(conn = self.recv_id, "stream finished");
            return Some(Some(0));
        }

        if self.out_of_order_count == 0 {
            return None;
        }

        let next = self.acknr.wrapping_add(1);
        let len = match self.inbuf.get(next) {
            Some(data) => data.len(),
            None => return None,
        };

        if len > user_buf.len() {
            *events = event::ERROR;
            tracing::debug!(
                conn = self.recv_id,
                needed = len,
                got = user_buf.len(),
                "caller buffer too small"
            );
            return Some(None);
        }

        let data = self.inbuf.take(next)?;
        if !data.is_empty() {
            user_buf[..data.len()].copy_from_slice(&data);
            *events = event::DATA;
        }

        self.acknr = next;
        self.need_send_ack = true;
        debug_assert!(self.out_of_order_count > 0);
        self.out_of_order_count -= 1;

        if data.is_empty() {
            Some(None)
        } else {
            Some(Some(data.len()))
        }
    }

    /// Process one demultiplexed non-SYN packet.
    ///
    /// Delivered in-order payload is copied into `user_buf`; the return
    /// value is its length when data was handed over.
    pub(crate) fn process_packet(
        &mut self,
        header: &Header,
        sack: Option<&[u8]>,
        payload: &[u8],
        user_buf: &mut [u8],
        events: &mut Events,
        now: u64,
    ) -> Option<usize> {
        if self.state == ConnState::Destroy {
            return None;
        }

        debug_assert!(self.queue != 0 || self.flight_window == 0);
        debug_assert!(
            self.queue == 0
                || self
                    .outbuf
                    .get(self.seqnr.wrapping_sub(self.queue))
                    .is_some()
        );

        // Acks must land between the in-flight head (with slack for
        // reordered acks) and the newest sequence handed out.
        let seq_tip = self.seqnr.wrapping_sub(1);
        if seq_before(seq_tip, header.acknr)
            || seq_before(
                header.acknr,
                seq_tip
                    .wrapping_sub(self.queue)
                    .wrapping_sub(ACK_BEHIND_ALLOWED),
            )
        {
            tracing::trace!(conn = self.recv_id, acknr = header.acknr, "invalid acknr");
            return None;
        }

        if self.state == ConnState::SynSent {
            self.acknr = header.seqnr.wrapping_sub(1);
        }

        let seq_cnt = header.seqnr.wrapping_sub(self.acknr).wrapping_sub(1);
        if seq_cnt as usize >= QUEUE_SIZE_MAX {
            if seq_cnt as usize >= (1 << 16) - QUEUE_SIZE_MAX
                && header.packet_type != PacketType::State
            {
                // An ack of ours was lost and the peer is replaying.
                self.need_send_ack = true;
            } else {
                tracing::trace!(
                    conn = self.recv_id,
                    seqnr = header.seqnr,
                    "seqnr outside window"
                );
            }
            return None;
        }

        self.last_received_packet = now;
        self.recv_window_peer = header.window;

        let mut ack_cnt = header
            .acknr
            .wrapping_sub(self.seqnr.wrapping_sub(self.queue))
            .wrapping_add(1);
        if ack_cnt > self.queue {
            ack_cnt = 0;
        }

        if header.packet_type == PacketType::Data && self.state == ConnState::SynRecv {
            self.state = ConnState::Connected;
            *events = event::ACCEPT;
            tracing::debug!(conn = self.recv_id, "inbound connection accepted");
        }

        if header.packet_type == PacketType::State && self.state == ConnState::SynSent {
            self.state = ConnState::Connected;
            *events = event::CONNECTED;
            tracing::debug!(conn = self.recv_id, "outbound connection established");
        }

        if self.state == ConnState::FinSent && self.queue == ack_cnt {
            self.state = ConnState::Destroy;
            tracing::debug!(conn = self.recv_id, "active close complete");
        }

        for _ in 0..ack_cnt {
            let head = self.seqnr.wrapping_sub(self.queue);
            self.ack_packet(head, now);
            self.queue -= 1;
        }

        debug_assert!(
            self.queue == 0
                || self
                    .outbuf
                    .get(self.seqnr.wrapping_sub(self.queue))
                    .is_some()
        );

        if self.queue > 0 {
            if let Some(mask) = sack {
                self.selective_ack(header.acknr.wrapping_add(2), mask, now);
            }
        }

        if self.state == ConnState::ConnectedFull && !self.flight_window_full() {
            self.state = ConnState::Connected;
            *events |= event::POLLOUT;
            tracing::debug!(conn = self.recv_id, "send window reopened");
        }

        if header.packet_type == PacketType::State {
            return None;
        }

        if !matches!(
            self.state,
            ConnState::Connected | ConnState::ConnectedFull | ConnState::FinSent
        ) {
            return None;
        }

        if header.packet_type == PacketType::Fin {
            if self.state == ConnState::FinSent {
                // Simultaneous close.
                self.state = ConnState::Destroy;
                return None;
            }
            if !self.received_fin {
                self.received_fin = true;
                self.eof_seqnr = header.seqnr;
                tracing::debug!(conn = self.recv_id, eof = self.eof_seqnr, "peer fin");
            }
        }

        if self.state == ConnState::FinSent {
            return None;
        }

        if seq_cnt == 0 {
            // The exact next packet: hand it straight to the caller.
            let mut delivered = None;
            if !payload.is_empty() {
                if payload.len() > user_buf.len() {
                    *events = event::ERROR;
                    tracing::debug!(
                        conn = self.recv_id,
                        needed = payload.len(),
                        got = user_buf.len(),
                        "caller buffer too small"
                    );
                    return None;
                }
                user_buf[..payload.len()].copy_from_slice(payload);
                *events |= event::DATA;
                delivered = Some(payload.len());
            }
            self.acknr = self.acknr.wrapping_add(1);
            self.need_send_ack = true;
            delivered
        } else {
            // Out of order: park it in the reorder ring.
            if self.received_fin && seq_after(header.seqnr, self.eof_seqnr) {
                tracing::trace!(conn = self.recv_id, "seqnr past fin");
                return None;
            }

            self.inbuf
                .ensure_size(header.seqnr.wrapping_add(1), seq_cnt.wrapping_add(1));

            if self.inbuf.get(header.seqnr).is_some() {
                self.need_send_ack = true;
                return None;
            }

            debug_assert!(
                header.seqnr as usize & self.inbuf.mask()
                    != self.acknr.wrapping_add(1) as usize & self.inbuf.mask()
            );
            self.inbuf.put(header.seqnr, payload.to_vec());
            self.out_of_order_count += 1;
            self.need_send_ack = true;
            None
        }
    }
}
