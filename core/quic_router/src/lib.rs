//! QUIC Connection Router
//!
//! This crate sits between a non-blocking UDP socket and the quiche packet
//! engine, handling:
//! - Session multiplexing by connection ID
//! - Connection admission (version negotiation, stateless retry, address tokens)
//! - Per-session retransmission timers driven by the engine's timeout
//! - Egress flushing and readiness-driven ingress dispatch
//! - Stream readiness notification to application callbacks
//!
//! One [`Router`] owns one socket, one registry and one event loop. Nothing is
//! shared between instances, so several listeners and dialers can run side by
//! side in the same process.

// ============================================================================
// Modules
// ============================================================================

pub mod admission;
pub mod config;
pub mod connection_id;
pub mod egress;
pub mod error;
pub mod header;
pub mod metrics;
pub mod registry;
pub mod router;
pub mod session;
pub mod streams;
pub mod timer;
pub mod token;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{CongestionControl, Config, DebugLog, Role};
pub use connection_id::ConnectionId;
pub use error::{Error, Result};
pub use metrics::Metrics;
pub use registry::ConnectionRegistry;
pub use router::Router;
pub use session::{Session, SessionState};
pub use streams::{stream_callback, StreamCallback, StreamCallbacks, StreamEvent};

// ============================================================================
// Constants (must match the engine's expectations)
// ============================================================================

/// Length of connection IDs chosen by this side
pub const LOCAL_CONN_ID_LEN: usize = 16;

/// Maximum UDP payload size for QUIC packets
pub const MAX_DATAGRAM_SIZE: usize = 1350;

/// Receive buffer size (largest possible UDP payload)
pub const MAX_BUFFER_SIZE: usize = 65535;

/// Default ALPN list, in preference order
pub const DEFAULT_APPLICATION_PROTOS: [&[u8]; 4] = [b"hq-29", b"hq-28", b"hq-27", b"http/0.9"];
