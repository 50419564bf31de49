//! UDP endpoint: socket ownership, demultiplexing, and timers.
//!
//! One endpoint owns one non-blocking UDP socket and every connection
//! multiplexed on it. The caller integrates the socket descriptor into
//! its own event loop, calls [`Endpoint::read_poll`] until it reports
//! AGAIN, and calls [`Endpoint::tick`] no later than the returned
//! deadline.

use std::io::{self, IoSlice};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::connection::{ConnState, Connection};
use crate::error::{Error, Result};
use crate::packet::{self, Header, PacketType, HEADER_SIZE};
use crate::{
    event, Config, Events, BUFFER_SIZE_MAX, SOCKET_CHECK_TIMEOUT_DEFAULT_MS,
    SOCKET_CHECK_TIMEOUT_MAX_MS, SOCKET_CHECK_TIMEOUT_MIN_MS,
};

/// Opaque, copyable handle naming a connection on its endpoint.
///
/// Handles stay valid until the connection is swept after DESTROY; every
/// call validates the handle against the endpoint's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnHandle(u64);

/// Outcome of one [`Endpoint::read_poll`] step.
#[derive(Debug, Clone, Copy)]
pub struct PollResult {
    /// Connection the event belongs to, when there is one
    pub conn: Option<ConnHandle>,
    /// Event bitmask; see [`crate::event`]
    pub events: Events,
    /// Bytes delivered into the caller's buffer. `Some(0)` is the EOF,
    /// reported exactly once per connection.
    pub read: Option<usize>,
}

struct ConnEntry {
    token: u64,
    conn: Connection,
}

/// A UDP endpoint multiplexing reliable connections.
pub struct Endpoint {
    socket: UdpSocket,
    conns: Vec<ConnEntry>,
    next_token: u64,
    epoch: Instant,
    now: u64,
    last_check: u64,
    next_check_timeout: u64,
    send_buffer_size: u32,
    recv_buffer_size: u32,
    rng: StdRng,
    recv_buf: Vec<u8>,
    config: Config,
}

impl Endpoint {
    /// Bind a non-blocking UDP socket and wrap it in an endpoint.
    pub fn bind(config: Config, addr: impl ToSocketAddrs) -> Result<Endpoint> {
        config.validate()?;

        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;

        let wall_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        Ok(Endpoint {
            socket,
            conns: Vec::new(),
            next_token: 1,
            epoch: Instant::now(),
            now: 0,
            last_check: 0,
            next_check_timeout: SOCKET_CHECK_TIMEOUT_DEFAULT_MS,
            send_buffer_size: BUFFER_SIZE_MAX,
            recv_buffer_size: BUFFER_SIZE_MAX,
            rng: StdRng::seed_from_u64(wall_ms),
            recv_buf: vec![0; 65536],
            config,
        })
    }

    fn refresh_now(&mut self) -> u64 {
        self.now = self.epoch.elapsed().as_millis() as u64;
        self.now
    }

    /// The underlying UDP socket, for event-loop registration.
    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    /// Local address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Send buffer size hint, bytes.
    pub fn send_buffer_size(&self) -> u32 {
        self.send_buffer_size
    }

    /// Set the send buffer size hint. Informational; not applied to the
    /// kernel socket.
    pub fn set_send_buffer_size(&mut self, bytes: u32) {
        self.send_buffer_size = bytes;
    }

    /// Receive buffer size hint, bytes.
    pub fn recv_buffer_size(&self) -> u32 {
        self.recv_buffer_size
    }

    /// Set the receive buffer size hint.
    pub fn set_recv_buffer_size(&mut self, bytes: u32) {
        self.recv_buffer_size = bytes;
    }

    /// Number of live connections, swept ones excluded.
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    fn index_of(&self, handle: ConnHandle) -> Option<usize> {
        self.conns.iter().position(|e| e.token == handle.0)
    }

    fn find_by_peer(&self, addr: SocketAddr, recv_id: u16) -> Option<usize> {
        self.conns.iter().position(|e| e.conn.matches(addr, recv_id))
    }

    /// Create a fresh, unconnected connection.
    pub fn connection(&mut self) -> ConnHandle {
        let token = self.next_token;
        self.next_token += 1;
        let initial_seqnr = self.rng.gen::<u16>();
        let conn = Connection::new(initial_seqnr, self.config.mtu - HEADER_SIZE);
        self.conns.push(ConnEntry { token, conn });
        ConnHandle(token)
    }

    /// Start the handshake toward `addr`. Valid only on a connection
    /// that has never been connected.
    pub fn connect(&mut self, handle: ConnHandle, addr: SocketAddr) -> Result<()> {
        let now = self.refresh_now();
        let idx = self.index_of(handle).ok_or(Error::UnknownConnection)?;
        if self.conns[idx].conn.state() != ConnState::Uninitialized {
            return Err(Error::InvalidState("connection already started"));
        }

        // Draw an id seed that does not collide with a live connection
        // to the same peer.
        let id_seed = loop {
            let seed: u16 = self.rng.gen();
            if !self.conns.iter().any(|e| e.conn.matches(addr, seed)) {
                break seed;
            }
        };

        let Self { socket, conns, .. } = self;
        conns[idx].conn.start_connect(socket, addr, id_seed, now);
        Ok(())
    }

    /// Resolve `host:port` and connect to the first address.
    pub fn net_connect(&mut self, host_port: &str) -> Result<ConnHandle> {
        let mut addrs = host_port
            .to_socket_addrs()
            .map_err(|e| Error::AddressResolution(e.to_string()))?;
        let addr = addrs
            .next()
            .ok_or_else(|| Error::AddressResolution(format!("no addresses for {host_port}")))?;

        let handle = self.connection();
        self.connect(handle, addr)?;
        Ok(handle)
    }

    /// Accept bytes into the connection's send queue.
    pub fn write(&mut self, handle: ConnHandle, buf: &[u8]) -> Result<usize> {
        self.write_vectored(handle, &[IoSlice::new(buf)])
    }

    /// Vectored variant of [`Endpoint::write`]; at most
    /// [`crate::MAX_VEC`] slices.
    pub fn write_vectored(&mut self, handle: ConnHandle, bufs: &[IoSlice<'_>]) -> Result<usize> {
        let now = self.refresh_now();
        let idx = self.index_of(handle).ok_or(Error::UnknownConnection)?;
        let Self { socket, conns, .. } = self;
        conns[idx].conn.write_vectored(socket, bufs, now)
    }

    /// Close a connection: queues a FIN after pending data, or destroys
    /// outright when the peer already finished.
    pub fn close(&mut self, handle: ConnHandle) -> Result<()> {
        let now = self.refresh_now();
        let idx = self.index_of(handle).ok_or(Error::UnknownConnection)?;
        let Self { socket, conns, .. } = self;
        conns[idx].conn.close(socket, now)
    }

    /// Connection state accessor; None for unknown handles.
    pub fn conn_state(&self, handle: ConnHandle) -> Option<ConnState> {
        self.index_of(handle).map(|i| self.conns[i].conn.state())
    }

    /// Peer address accessor; None for unknown handles.
    pub fn conn_peer_addr(&self, handle: ConnHandle) -> Option<SocketAddr> {
        self.index_of(handle).map(|i| self.conns[i].conn.peer())
    }

    /// Attach caller data to a connection.
    pub fn set_user_data(&mut self, handle: ConnHandle, data: Box<dyn std::any::Any + Send>) -> Result<()> {
        let idx = self.index_of(handle).ok_or(Error::UnknownConnection)?;
        self.conns[idx].conn.user_data = Some(data);
        Ok(())
    }

    /// Borrow caller data attached to a connection.
    pub fn user_data(&self, handle: ConnHandle) -> Option<&(dyn std::any::Any + Send)> {
        let idx = self.index_of(handle)?;
        self.conns[idx].conn.user_data.as_deref()
    }

    /// Mutably borrow caller data attached to a connection.
    pub fn user_data_mut(&mut self, handle: ConnHandle) -> Option<&mut (dyn std::any::Any + Send)> {
        let idx = self.index_of(handle)?;
        self.conns[idx].conn.user_data.as_deref_mut()
    }

    /// Non-blocking receive step.
    ///
    /// Drains buffered in-order data first, then reads one datagram from
    /// the socket and runs it through its connection. Call repeatedly
    /// until the events carry [`event::AGAIN`].
    pub fn read_poll(&mut self, buf: &mut [u8]) -> PollResult {
        let mut events: Events = event::CONTINUE;

        if buf.is_empty() {
            return PollResult {
                conn: None,
                events: event::ERROR,
                read: None,
            };
        }

        let now = self.refresh_now();

        // Buffered data goes out before the socket is touched.
        {
            let Self { socket, conns, .. } = &mut *self;
            for entry in conns.iter_mut() {
                if let Some(read) = entry.conn.drain(buf, socket, &mut events, now) {
                    return PollResult {
                        conn: Some(ConnHandle(entry.token)),
                        events,
                        read,
                    };
                }
            }
        }

        let (len, addr) = match self.socket.recv_from(&mut self.recv_buf) {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.flush_acks(now);
                return PollResult {
                    conn: None,
                    events: event::AGAIN,
                    read: None,
                };
            }
            Err(e) => {
                tracing::debug!("recv_from failed: {e}");
                return PollResult {
                    conn: None,
                    events: event::ERROR,
                    read: None,
                };
            }
        };

        let header = match Header::decode(&self.recv_buf[..len]) {
            Ok(h) => h,
            Err(e) => {
                tracing::trace!(%addr, "dropping datagram: {e}");
                return PollResult {
                    conn: None,
                    events,
                    read: None,
                };
            }
        };

        if header.packet_type == PacketType::Syn {
            return self.handle_syn(addr, &header, now);
        }

        if header.packet_type == PacketType::Reset {
            // Recognized but never acted on.
            tracing::trace!(%addr, "dropping reset packet");
            return PollResult {
                conn: None,
                events,
                read: None,
            };
        }

        let Some(idx) = self.find_by_peer(addr, header.conn_id) else {
            tracing::trace!(%addr, conn_id = header.conn_id, "datagram for unknown connection");
            return PollResult {
                conn: None,
                events,
                read: None,
            };
        };

        let Self { conns, recv_buf, .. } = &mut *self;
        let area = &recv_buf[HEADER_SIZE..len];
        let (sack, payload) = match packet::split_extensions(header.extension, area) {
            Ok(v) => v,
            Err(e) => {
                tracing::trace!(%addr, "dropping datagram: {e}");
                return PollResult {
                    conn: Some(ConnHandle(conns[idx].token)),
                    events,
                    read: None,
                };
            }
        };

        let entry = &mut conns[idx];
        let read = entry
            .conn
            .process_packet(&header, sack, payload, buf, &mut events, now);
        PollResult {
            conn: Some(ConnHandle(entry.token)),
            events,
            read,
        }
    }

    /// Handle an inbound SYN: match a half-open acceptor or register a
    /// new connection, then (re-)acknowledge the handshake.
    fn handle_syn(&mut self, addr: SocketAddr, header: &Header, now: u64) -> PollResult {
        let events: Events = event::CONTINUE;

        let idx = if let Some(i) = self.find_by_peer(addr, header.conn_id.wrapping_add(1)) {
            if self.conns[i].conn.state() != ConnState::SynRecv {
                tracing::trace!(%addr, "duplicate syn for settled connection");
                return PollResult {
                    conn: Some(ConnHandle(self.conns[i].token)),
                    events,
                    read: None,
                };
            }
            i
        } else {
            if self.conns.len() >= self.config.max_connections {
                tracing::debug!(%addr, "connection table full, dropping syn");
                return PollResult {
                    conn: None,
                    events: event::ERROR,
                    read: None,
                };
            }

            let token = self.next_token;
            self.next_token += 1;
            let initial_seqnr = self.rng.gen::<u16>();
            let mut conn = Connection::new(initial_seqnr, self.config.mtu - HEADER_SIZE);
            conn.accept_syn(addr, header, now);
            self.conns.push(ConnEntry { token, conn });
            self.conns.len() - 1
        };

        let Self { socket, conns, .. } = &mut *self;
        let entry = &mut conns[idx];
        entry.conn.arm_handshake_timer(now);
        entry.conn.send_ack(socket, now);
        PollResult {
            conn: Some(ConnHandle(entry.token)),
            events,
            read: None,
        }
    }

    /// Emit pending acks on every connection; runs when the socket has
    /// no more datagrams for us.
    fn flush_acks(&mut self, now: u64) {
        let Self { socket, conns, .. } = &mut *self;
        for entry in conns.iter_mut() {
            if entry.conn.needs_ack() {
                entry.conn.send_ack(socket, now);
            }
        }
    }

    /// Drive timers: retransmissions, idle kills, keepalives, and the
    /// DESTROY sweep.
    ///
    /// Returns the deadline, in milliseconds, by which the caller must
    /// tick again.
    pub fn tick(&mut self) -> u64 {
        let now = self.refresh_now();

        if now < self.last_check + self.next_check_timeout {
            return self.next_check_timeout - (now - self.last_check);
        }

        self.last_check = now;
        self.next_check_timeout = SOCKET_CHECK_TIMEOUT_DEFAULT_MS;

        {
            let Self {
                socket,
                conns,
                next_check_timeout,
                ..
            } = &mut *self;
            for entry in conns.iter_mut() {
                if let Some(until_ticker) = entry.conn.check(socket, now) {
                    *next_check_timeout = (*next_check_timeout)
                        .min(until_ticker)
                        .clamp(SOCKET_CHECK_TIMEOUT_MIN_MS, SOCKET_CHECK_TIMEOUT_MAX_MS);
                }
            }
        }

        self.conns.retain(|e| e.conn.state() != ConnState::Destroy);

        self.next_check_timeout
    }
}
