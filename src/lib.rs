//! # Reliable Datagram Protocol (RDP)
//!
//! A reliable, connection-oriented, ordered byte-stream transport
//! layered over UDP, in the uTP (BEP-29) family: 20-byte headers,
//! 16-bit sequence numbers, selective acknowledgment, RTT-driven
//! retransmission, and a multiplicatively adjusted flight window.
//!
//! One [`Endpoint`] owns one UDP socket and multiplexes any number of
//! logical connections on it, each with independent sequencing, flow
//! control, retransmission, and lifecycle.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     Application                          │
//! ├─────────────────────────────────────────────────────────┤
//! │  Endpoint (socket, demux, poll/tick loop)               │
//! ├─────────────────────────────────────────────────────────┤
//! │  Connection (state machine, windows, RTT, retransmit)   │
//! ├─────────────────────────────────────────────────────────┤
//! │  Rings (send queue, reorder buffer)                     │
//! ├─────────────────────────────────────────────────────────┤
//! │  Packet codec (framing, selective-ack extension)        │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Goals
//!
//! 1. **Single-threaded**: no internal locking or executor; the caller
//!    owns the socket descriptor and drives `read_poll` and `tick`
//! 2. **Non-blocking**: no entry point ever blocks
//! 3. **Isolation**: a misbehaving peer cannot corrupt other
//!    connections on the same endpoint
//!
//! ## Usage
//!
//! ```no_run
//! use rdp::{event, Config, Endpoint};
//!
//! # fn main() -> rdp::Result<()> {
//! let mut endpoint = Endpoint::bind(Config::default(), "0.0.0.0:7400")?;
//! let conn = endpoint.net_connect("203.0.113.7:7400")?;
//!
//! let mut buf = [0u8; 2048];
//! loop {
//!     let res = endpoint.read_poll(&mut buf);
//!     if res.events & event::CONNECTED != 0 {
//!         endpoint.write(conn, b"hello")?;
//!     }
//!     if res.events & event::AGAIN != 0 {
//!         // Sleep or poll the socket until the tick deadline.
//!         let _deadline_ms = endpoint.tick();
//!         # break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

mod connection;
mod endpoint;
pub mod error;
pub mod packet;
pub mod ring;
pub mod seq;

pub use connection::ConnState;
pub use endpoint::{ConnHandle, Endpoint, PollResult};
pub use error::{Error, Result};

/// Protocol version identifier; the only accepted value on the wire.
pub const PROTOCOL_VERSION: u8 = 1;

const ETHERNET_MTU: usize = 1500;
const IPV4_HEADER_SIZE: usize = 20;
const UDP_HEADER_SIZE: usize = 8;
const GRE_HEADER_SIZE: usize = 24;
const PPPOE_HEADER_SIZE: usize = 8;
const MPPE_HEADER_SIZE: usize = 2;
const FUDGE_HEADER_SIZE: usize = 36;

/// Conservative datagram size limit: Ethernet minus IPv4, UDP, and the
/// tunneling overheads (GRE, PPPoE, MPPE, plus slack) that may sit on
/// the path. Overridable per endpoint via [`Config::mtu`].
pub const UDP_IPV4_MTU: usize = ETHERNET_MTU
    - IPV4_HEADER_SIZE
    - UDP_HEADER_SIZE
    - GRE_HEADER_SIZE
    - PPPOE_HEADER_SIZE
    - MPPE_HEADER_SIZE
    - FUDGE_HEADER_SIZE;

/// Largest payload a single packet carries, at the default MTU.
pub const MAX_PACKET_PAYLOAD: usize = UDP_IPV4_MTU - packet::HEADER_SIZE;

/// Ring capacity ceiling, in packets. Bounded by the selective-ack
/// bitmask reach: one maximum-size UDP payload of mask bits.
pub const QUEUE_SIZE_MAX: usize = 16 * 1024;

/// Buffer size ceiling, in bytes.
pub const BUFFER_SIZE_MAX: u32 = 16 * 1024 * 1024;

/// Flight window ceiling, bytes.
pub const WINDOW_SIZE_MAX: u32 = BUFFER_SIZE_MAX;

/// Initial flight window limit, bytes.
pub const WINDOW_SIZE_DEFAULT: u32 = BUFFER_SIZE_MAX / 4;

/// Multiplicative window decrease on a no-progress retransmit round.
pub const WINDOW_SHRINK_FACTOR: u32 = 2;

/// Multiplicative window increase after a productive retransmit round.
pub const WINDOW_EXPAND_FACTOR: u32 = 2;

/// Retransmission timeout floor, milliseconds.
pub const RETRANSMIT_TIMEOUT_MIN_MS: u64 = 200;

/// Retransmission timeout ceiling, milliseconds.
pub const RETRANSMIT_TIMEOUT_MAX_MS: u64 = 1000;

/// Retransmission timeout before the first RTT sample, milliseconds.
pub const RETRANSMIT_TIMEOUT_DEFAULT_MS: u64 = 500;

/// Send-side silence that triggers a keepalive probe, milliseconds.
pub const KEEPALIVE_INTERVAL_MS: u64 = 29_000;

/// Idle bound for half-open inbound connections, milliseconds.
pub const WAIT_SYN_RECV_MS: u64 = 10_000;

/// Idle bound for the active close, milliseconds.
pub const WAIT_FIN_SENT_MS: u64 = 10_000;

/// Most io-slices one vectored write accepts.
pub const MAX_VEC: usize = 1024;

/// How far behind the in-flight head an acknowledgment may trail before
/// the packet is discarded.
pub const ACK_BEHIND_ALLOWED: u16 = 10;

/// Shortest deadline [`Endpoint::tick`] returns, milliseconds.
pub const SOCKET_CHECK_TIMEOUT_MIN_MS: u64 = 10;

/// Longest deadline [`Endpoint::tick`] returns, milliseconds.
pub const SOCKET_CHECK_TIMEOUT_MAX_MS: u64 = 500;

/// Check interval when no connection needs attention sooner,
/// milliseconds.
pub const SOCKET_CHECK_TIMEOUT_DEFAULT_MS: u64 = 500;

/// Default connection cap per endpoint.
pub const MAX_CONNECTIONS_DEFAULT: usize = 1024;

/// Event bitmask type; see [`event`].
pub type Events = u8;

/// Event bits reported by [`Endpoint::read_poll`].
pub mod event {
    use super::Events;

    /// More work may be pending; poll again
    pub const CONTINUE: Events = 1 << 0;
    /// Nothing left to do right now
    pub const AGAIN: Events = 1 << 1;
    /// The call violated its contract
    pub const ERROR: Events = 1 << 2;
    /// Payload was delivered into the caller's buffer
    pub const DATA: Events = 1 << 3;
    /// An inbound connection completed its handshake
    pub const ACCEPT: Events = 1 << 4;
    /// An outbound connection completed its handshake
    pub const CONNECTED: Events = 1 << 5;
    /// The send window reopened; writes may proceed
    pub const POLLOUT: Events = 1 << 6;
}

/// Endpoint configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Protocol version; only [`PROTOCOL_VERSION`] is accepted
    pub version: u8,
    /// Largest datagram the endpoint emits, header included
    pub mtu: usize,
    /// Connection cap for this endpoint
    pub max_connections: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            mtu: UDP_IPV4_MTU,
            max_connections: MAX_CONNECTIONS_DEFAULT,
        }
    }
}

impl Config {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.version != PROTOCOL_VERSION {
            return Err(Error::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: self.version,
            });
        }
        if self.mtu < packet::HEADER_SIZE + 64 {
            return Err(Error::InvalidArgument("mtu too small for header and payload"));
        }
        if self.mtu > 65507 {
            return Err(Error::InvalidArgument("mtu exceeds the UDP maximum"));
        }
        if self.max_connections == 0 {
            return Err(Error::InvalidArgument("max_connections must be positive"));
        }
        Ok(())
    }
}
