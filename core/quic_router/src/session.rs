//! Connection sessions
//!
//! A session wraps one engine connection together with the bookkeeping the
//! router needs: role, lifecycle state, peer address, retransmission timer
//! and the application's stream callbacks.

use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use crate::config::Role;
use crate::connection_id::ConnectionId;
use crate::error::Result;
use crate::streams::StreamCallbacks;
use crate::timer::RetransmitTimer;

// ============================================================================
// Session State
// ============================================================================

/// Lifecycle state, derived only from engine queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Handshaking,
    Established,
    /// Either side signalled shutdown
    Closing,
    /// Engine confirmed the close; teardown follows
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Handshaking => "handshaking",
            SessionState::Established => "established",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Session Structure
// ============================================================================

/// One QUIC session owned by a router instance
pub struct Session {
    id: ConnectionId,
    role: Role,
    state: SessionState,
    /// Listener sessions: last source address seen. Dialer: fixed at creation.
    peer: SocketAddr,
    conn: quiche::Connection,
    timer: RetransmitTimer,
    callbacks: StreamCallbacks,
}

impl Session {
    /// Wrap a freshly created engine connection.
    ///
    /// The timer is armed from the engine's initial timeout.
    pub fn new(
        id: ConnectionId,
        role: Role,
        peer: SocketAddr,
        conn: quiche::Connection,
        callbacks: StreamCallbacks,
    ) -> Self {
        let mut session = Session {
            id,
            role,
            state: SessionState::Handshaking,
            peer,
            conn,
            timer: RetransmitTimer::new(),
            callbacks,
        };
        session.rearm_timer(Instant::now());
        session
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn timer(&self) -> &RetransmitTimer {
        &self.timer
    }

    pub fn callbacks(&self) -> &StreamCallbacks {
        &self.callbacks
    }

    pub fn conn(&self) -> &quiche::Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut quiche::Connection {
        &mut self.conn
    }

    /// Feed one datagram to the engine.
    ///
    /// On success the timer is rearmed and, for listener sessions, the peer
    /// address follows the datagram's source once the engine has accepted a
    /// packet from it. Datagrams the engine discards move nothing.
    pub fn recv(&mut self, buf: &mut [u8], info: quiche::RecvInfo) -> Result<usize> {
        let accepted_before = self.conn.stats().recv;
        let read = self.conn.recv(buf, info)?;
        let accepted = self.conn.stats().recv > accepted_before;

        if self.role == Role::Listener && accepted && self.peer != info.from {
            log::debug!(
                "Address change detected for {}: {} -> {}",
                self.id,
                self.peer,
                info.from
            );
            self.peer = info.from;
        }

        self.rearm_timer(Instant::now());
        Ok(read)
    }

    /// Tell the engine its timeout elapsed. The caller flushes afterwards,
    /// which rearms the timer.
    pub fn on_timeout(&mut self) {
        self.conn.on_timeout();
    }

    /// Rearm the timer to the engine's next requested timeout
    pub fn rearm_timer(&mut self, now: Instant) {
        self.timer.rearm(self.conn.timeout(), now);
    }

    /// Re-derive the lifecycle state from the engine.
    ///
    /// Returns the previous state when it changed.
    pub fn refresh_state(&mut self) -> Option<SessionState> {
        let next = if self.conn.is_closed() {
            SessionState::Closed
        } else if self.conn.is_draining()
            || self.conn.local_error().is_some()
            || self.conn.peer_error().is_some()
        {
            SessionState::Closing
        } else if self.conn.is_established() {
            SessionState::Established
        } else {
            SessionState::Handshaking
        };

        // States only move forward
        if next > self.state {
            let prev = self.state;
            self.state = next;
            Some(prev)
        } else {
            None
        }
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    /// Ask the engine to close the session. Closing twice is not an error.
    pub fn close(&mut self, app: bool, err: u64, reason: &[u8]) -> Result<()> {
        match self.conn.close(app, err, reason) {
            Ok(()) | Err(quiche::Error::Done) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Stop the timer and free the engine connection, returning its final
    /// counters
    pub fn release(mut self) -> quiche::Stats {
        self.timer.cancel();
        let stats = self.conn.stats();
        drop(self.conn);
        stats
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("peer", &self.peer)
            .field("timer", &self.timer)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dialer_session() -> Session {
        let mut config = quiche::Config::new(quiche::PROTOCOL_VERSION).unwrap();
        config.verify_peer(false);
        config.set_application_protos(&[b"hq-29"]).unwrap();

        let id = ConnectionId::new([3u8; 16]);
        let local: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let peer: SocketAddr = "127.0.0.1:4433".parse().unwrap();
        let conn = quiche::connect(None, &id.as_quiche(), local, peer, &mut config).unwrap();

        Session::new(id, Role::Dialer, peer, conn, StreamCallbacks::default())
    }

    #[test]
    fn test_new_session_is_handshaking_with_armed_timer() {
        let session = dialer_session();

        assert_eq!(session.state(), SessionState::Handshaking);
        assert!(session.timer().is_armed());
    }

    #[test]
    fn test_refresh_state_without_progress() {
        let mut session = dialer_session();

        assert_eq!(session.refresh_state(), None);
        assert_eq!(session.state(), SessionState::Handshaking);
    }

    #[test]
    fn test_close_moves_to_closing_or_closed() {
        let mut session = dialer_session();

        session.close(false, 0, b"bye").unwrap();
        // Closing again is accepted
        session.close(false, 0, b"bye").unwrap();

        assert_eq!(session.refresh_state(), Some(SessionState::Handshaking));
        assert!(session.state() >= SessionState::Closing);
    }

    #[test]
    fn test_release_cancels_timer() {
        let session = dialer_session();
        assert!(session.timer().is_armed());

        let stats = session.release();
        assert_eq!(stats.recv, 0);
    }
}
