//! Egress flush loop
//!
//! Drains a session's pending packets into UDP datagrams until the engine
//! reports nothing more to send, then rearms the session timer.

use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use crate::config::Role;
use crate::session::Session;

// ============================================================================
// Datagram Sink
// ============================================================================

/// Where flushed datagrams go.
///
/// `to` is `Some(peer)` for listener sessions sharing one bound socket and
/// `None` for a dialer's connected socket.
pub trait DatagramSink {
    fn send_datagram(&self, buf: &[u8], to: Option<SocketAddr>) -> io::Result<usize>;
}

impl DatagramSink for mio::net::UdpSocket {
    fn send_datagram(&self, buf: &[u8], to: Option<SocketAddr>) -> io::Result<usize> {
        match to {
            Some(addr) => self.send_to(buf, addr),
            None => self.send(buf),
        }
    }
}

// ============================================================================
// Flush
// ============================================================================

/// How a flush ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Engine reported `Done`
    Drained { datagrams: usize },
    /// The socket buffer is full; the engine's loss recovery resends later
    WouldBlock { datagrams: usize },
    /// A datagram was not fully written
    SendFailed { datagrams: usize },
    /// The engine failed to build a packet
    EngineError { datagrams: usize },
}

impl FlushOutcome {
    /// Datagrams fully written during this flush
    pub fn datagrams(&self) -> usize {
        match *self {
            FlushOutcome::Drained { datagrams }
            | FlushOutcome::WouldBlock { datagrams }
            | FlushOutcome::SendFailed { datagrams }
            | FlushOutcome::EngineError { datagrams } => datagrams,
        }
    }

    pub fn is_send_failure(&self) -> bool {
        matches!(self, FlushOutcome::SendFailed { .. })
    }
}

/// Drain `session`'s pending packets through `sink`.
///
/// Each datagram is capped at `out.len()` bytes. A short or failed write is
/// reported, not retried.
pub fn flush<S>(session: &mut Session, sink: &S, out: &mut [u8], now: Instant) -> FlushOutcome
where
    S: DatagramSink + ?Sized,
{
    let to = match session.role() {
        Role::Listener => Some(session.peer()),
        Role::Dialer => None,
    };

    let mut datagrams = 0;
    let outcome = loop {
        let written = match session.conn_mut().send(out) {
            Ok((written, _send_info)) => written,
            Err(quiche::Error::Done) => break FlushOutcome::Drained { datagrams },
            Err(e) => {
                log::debug!("{}: failed to create packet: {:?}", session.id(), e);
                break FlushOutcome::EngineError { datagrams };
            }
        };

        match sink.send_datagram(&out[..written], to) {
            Ok(sent) if sent == written => {
                log::trace!("{}: sent {} bytes", session.id(), sent);
                datagrams += 1;
            }
            Ok(sent) => {
                log::warn!(
                    "{}: short send, {} of {} bytes written",
                    session.id(),
                    sent,
                    written
                );
                break FlushOutcome::SendFailed { datagrams };
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                log::debug!("{}: send would block", session.id());
                break FlushOutcome::WouldBlock { datagrams };
            }
            Err(e) => {
                log::warn!("{}: failed to send: {:?}", session.id(), e);
                break FlushOutcome::SendFailed { datagrams };
            }
        }
    };

    session.rearm_timer(now);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_id::ConnectionId;
    use crate::streams::StreamCallbacks;
    use crate::MAX_DATAGRAM_SIZE;
    use std::cell::RefCell;

    /// Records every datagram, optionally truncating writes
    struct RecordingSink {
        sent: RefCell<Vec<(Vec<u8>, Option<SocketAddr>)>>,
        short_after: Option<usize>,
        would_block: bool,
    }

    impl RecordingSink {
        fn new() -> Self {
            RecordingSink {
                sent: RefCell::new(Vec::new()),
                short_after: None,
                would_block: false,
            }
        }
    }

    impl DatagramSink for RecordingSink {
        fn send_datagram(&self, buf: &[u8], to: Option<SocketAddr>) -> io::Result<usize> {
            if self.would_block {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let mut sent = self.sent.borrow_mut();
            sent.push((buf.to_vec(), to));
            match self.short_after {
                Some(n) if sent.len() > n => Ok(buf.len() - 1),
                _ => Ok(buf.len()),
            }
        }
    }

    fn session(role: Role) -> Session {
        let mut config = quiche::Config::new(quiche::PROTOCOL_VERSION).unwrap();
        config.verify_peer(false);
        config.set_application_protos(&[b"hq-29"]).unwrap();
        config.set_max_send_udp_payload_size(MAX_DATAGRAM_SIZE);

        let id = ConnectionId::new([9u8; 16]);
        let local: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let peer: SocketAddr = "127.0.0.1:4433".parse().unwrap();
        let conn = quiche::connect(None, &id.as_quiche(), local, peer, &mut config).unwrap();

        // A client connection is enough to get an Initial flight queued; the
        // role only decides how the sink is addressed.
        Session::new(id, role, peer, conn, StreamCallbacks::default())
    }

    #[test]
    fn test_flush_drains_initial_flight() {
        let mut session = session(Role::Dialer);
        let sink = RecordingSink::new();
        let mut out = vec![0u8; MAX_DATAGRAM_SIZE];

        let outcome = flush(&mut session, &sink, &mut out, Instant::now());

        assert!(matches!(outcome, FlushOutcome::Drained { datagrams } if datagrams >= 1));
        let sent = sink.sent.borrow();
        assert_eq!(sent.len(), outcome.datagrams());
        for (datagram, to) in sent.iter() {
            assert!(datagram.len() <= MAX_DATAGRAM_SIZE);
            assert_eq!(*to, None);
        }
        assert!(session.timer().is_armed());

        // Nothing left afterwards
        drop(sent);
        let again = flush(&mut session, &sink, &mut out, Instant::now());
        assert_eq!(again, FlushOutcome::Drained { datagrams: 0 });
    }

    #[test]
    fn test_listener_sessions_address_peer() {
        let mut session = session(Role::Listener);
        let sink = RecordingSink::new();
        let mut out = vec![0u8; MAX_DATAGRAM_SIZE];

        flush(&mut session, &sink, &mut out, Instant::now());

        let peer = session.peer();
        assert!(sink.sent.borrow().iter().all(|(_, to)| *to == Some(peer)));
    }

    #[test]
    fn test_short_write_reported() {
        let mut session = session(Role::Dialer);
        let mut sink = RecordingSink::new();
        sink.short_after = Some(0);
        let mut out = vec![0u8; MAX_DATAGRAM_SIZE];

        let outcome = flush(&mut session, &sink, &mut out, Instant::now());

        assert_eq!(outcome, FlushOutcome::SendFailed { datagrams: 0 });
        assert!(outcome.is_send_failure());
        // Not retried inline
        assert_eq!(sink.sent.borrow().len(), 1);
    }

    #[test]
    fn test_would_block_is_not_a_failure() {
        let mut session = session(Role::Dialer);
        let mut sink = RecordingSink::new();
        sink.would_block = true;
        let mut out = vec![0u8; MAX_DATAGRAM_SIZE];

        let outcome = flush(&mut session, &sink, &mut out, Instant::now());

        assert_eq!(outcome, FlushOutcome::WouldBlock { datagrams: 0 });
        assert!(!outcome.is_send_failure());
        assert!(session.timer().is_armed());
    }
}
