//! Router instance and event loop
//!
//! A [`Router`] owns one UDP socket, one `mio` poll, one connection registry
//! and the timers of every session in it. Listeners bind and admit any
//! number of sessions; dialers connect and carry exactly one.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};

use crate::admission::{Admission, AdmissionController, DropReason};
use crate::config::{Config, DebugLog, Role};
use crate::connection_id::ConnectionId;
use crate::egress::{self, FlushOutcome};
use crate::error::{Error, Result};
use crate::header::DatagramHeader;
use crate::metrics::Metrics;
use crate::registry::ConnectionRegistry;
use crate::session::{Session, SessionState};
use crate::streams::{self, StreamCallbacks};
use crate::{MAX_BUFFER_SIZE, MAX_DATAGRAM_SIZE};

// ============================================================================
// Constants
// ============================================================================

const SOCKET_TOKEN: Token = Token(0);

const EVENTS_CAPACITY: usize = 1024;

/// Longest wait between shutdown flag checks
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long sessions get to finish closing after shutdown is requested
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(1);

// ============================================================================
// Debug Sink
// ============================================================================

/// Optional receiver of lifecycle lines
struct DebugSink(Option<DebugLog>);

impl DebugSink {
    fn emit(&self, line: impl FnOnce() -> String) {
        if let Some(sink) = &self.0 {
            sink(&line());
        }
    }
}

// ============================================================================
// Router
// ============================================================================

/// One routing instance: socket, registry, admission and timers
pub struct Router {
    role: Role,
    poll: Poll,
    events: Events,
    socket: UdpSocket,
    local_addr: SocketAddr,
    /// Dialer only: the connected peer
    remote: Option<SocketAddr>,
    engine_config: quiche::Config,
    registry: ConnectionRegistry<Session>,
    admission: AdmissionController,
    callbacks: StreamCallbacks,
    metrics: Arc<Metrics>,
    debug: DebugSink,
    /// Receive buffer
    recv_buf: Vec<u8>,
    /// Send buffer
    send_buf: Vec<u8>,
}

impl Router {
    /// Create a routing instance.
    ///
    /// Listeners bind `config.address:config.port`. Dialers connect to it,
    /// create their session and send the first flight before returning.
    pub fn new(config: Config, callbacks: StreamCallbacks) -> Result<Self> {
        let target = config.resolve()?;
        let engine_config = config.engine_config()?;
        let admission = AdmissionController::new(config.stateless_retry)?;

        let poll = Poll::new()?;
        let (mut socket, remote) = match config.role {
            Role::Listener => (UdpSocket::bind(target)?, None),
            Role::Dialer => {
                let any = match target.ip() {
                    IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                    IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                };
                let socket = UdpSocket::bind(SocketAddr::new(any, 0))?;
                socket.connect(target)?;
                (socket, Some(target))
            }
        };

        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;

        let local_addr = socket.local_addr()?;

        let mut router = Router {
            role: config.role,
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            socket,
            local_addr,
            remote,
            engine_config,
            registry: ConnectionRegistry::new(),
            admission,
            callbacks,
            metrics: Arc::new(Metrics::new()),
            debug: DebugSink(config.debug_log.clone()),
            recv_buf: vec![0u8; MAX_BUFFER_SIZE],
            send_buf: vec![0u8; MAX_DATAGRAM_SIZE],
        };

        match config.role {
            Role::Listener => log::info!("Listening on {}", local_addr),
            Role::Dialer => router.dial(config.sni(), target)?,
        }

        Ok(router)
    }

    fn dial(&mut self, server_name: &str, peer: SocketAddr) -> Result<()> {
        let scid = self.admission.generate_id()?;
        let conn = quiche::connect(
            Some(server_name),
            &scid.as_quiche(),
            self.local_addr,
            peer,
            &mut self.engine_config,
        )?;

        let session = Session::new(scid, Role::Dialer, peer, conn, self.callbacks.clone());
        self.registry.insert(scid, session)?;
        self.metrics.session_opened();

        log::info!("Connecting to {} from {} (scid={})", peer, self.local_addr, scid);
        self.debug
            .emit(|| format!("dial {} scid={}", peer, scid));

        self.flush_session(&scid);
        Ok(())
    }

    // ========================================================================
    // Event Loop
    // ========================================================================

    /// Drive the loop until `shutdown` is set or, for a dialer, its session
    /// is gone.
    ///
    /// On shutdown every session is closed and given a short drain period
    /// before it is torn down.
    pub fn run_until(&mut self, shutdown: &AtomicBool) -> Result<()> {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                log::info!("Shutdown requested, closing {} sessions", self.registry.len());
                self.close_all();
                return self.drain(SHUTDOWN_DRAIN);
            }

            if self.role == Role::Dialer && self.registry.is_empty() {
                return Ok(());
            }

            self.poll_once(Some(SHUTDOWN_POLL_INTERVAL))?;
        }
    }

    /// Drive the loop with no external shutdown
    pub fn run(&mut self) -> Result<()> {
        let never = AtomicBool::new(false);
        self.run_until(&never)
    }

    /// Wait for readiness at most `timeout` (or until the next session timer
    /// is due), dispatch inbound datagrams and fire expired timers.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> Result<()> {
        let wait = match (timeout, self.next_timeout(Instant::now())) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let readable = match self.poll.poll(&mut self.events, wait) {
            Ok(()) => self.events.iter().any(|e| e.token() == SOCKET_TOKEN),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => false,
            Err(e) => return Err(e.into()),
        };

        if readable {
            self.dispatch();
        }

        self.process_timers();
        Ok(())
    }

    /// Keep polling until every session is gone or `limit` elapses, then
    /// tear down whatever is left
    fn drain(&mut self, limit: Duration) -> Result<()> {
        let deadline = Instant::now() + limit;

        while !self.registry.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.poll_once(Some(deadline - now))?;
        }

        for id in self.registry.ids() {
            self.teardown(&id);
        }
        Ok(())
    }

    /// Earliest armed session deadline, relative to `now`
    fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.registry
            .values()
            .filter_map(|s| s.timer().remaining(now))
            .min()
    }

    // ========================================================================
    // Ingress
    // ========================================================================

    /// Read datagrams until the socket would block
    fn dispatch(&mut self) {
        // Taken out of self so sessions can be borrowed while it is in use
        let mut buf = std::mem::take(&mut self.recv_buf);

        loop {
            let received = match self.remote {
                Some(peer) => self.socket.recv(&mut buf).map(|len| (len, peer)),
                None => self.socket.recv_from(&mut buf),
            };

            let (len, from) = match received {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("Socket read failed, ending dispatch: {:?}", e);
                    break;
                }
            };

            Metrics::incr(&self.metrics.datagrams_received_total);
            self.handle_datagram(&mut buf[..len], from);
        }

        self.recv_buf = buf;

        if self.role == Role::Listener {
            self.sweep();
        }
    }

    fn handle_datagram(&mut self, pkt: &mut [u8], from: SocketAddr) {
        let hdr = match DatagramHeader::inspect(pkt) {
            Ok(hdr) => hdr,
            Err(e) => {
                log::debug!("Failed to parse QUIC header from {}: {}", from, e);
                return;
            }
        };

        log::trace!(
            "Received {} bytes from {} dcid={:?} type={:?}",
            pkt.len(),
            from,
            hdr.dcid,
            hdr.ty
        );

        let id = match self.route(&hdr) {
            Some(id) => id,
            None => match self.admit(&hdr, from) {
                Some(id) => id,
                None => return,
            },
        };

        let Some(session) = self.registry.find_mut(&id) else {
            return;
        };

        let info = quiche::RecvInfo {
            from,
            to: self.local_addr,
        };
        let received = match session.recv(pkt, info) {
            Ok(read) => {
                log::trace!("{}: engine consumed {} bytes", id, read);
                true
            }
            Err(e) => {
                log::debug!("{}: recv failed: {}", id, e);
                false
            }
        };

        self.refresh(&id);

        if received {
            if let Some(session) = self.registry.find_mut(&id) {
                if session.state() == SessionState::Established {
                    streams::notify_readable(session);
                }
            }
        }

        // Listener sessions are flushed by the end-of-pass sweep
        if self.role == Role::Dialer {
            self.flush_session(&id);
            self.reap(&id);
        }
    }

    /// Registered session for this datagram, if any
    fn route(&self, hdr: &DatagramHeader) -> Option<ConnectionId> {
        if let Some(id) = ConnectionId::from_slice(&hdr.dcid) {
            if self.registry.contains(&id) {
                return Some(id);
            }
        }

        // Repeated Initials of a directly accepted session still carry the
        // client's own destination ID
        if self.role == Role::Listener && !self.admission.stateless_retry() {
            let id = self.admission.derived_id(&hdr.dcid);
            if self.registry.contains(&id) {
                return Some(id);
            }
        }

        None
    }

    /// Run admission for a datagram that matched no session, returning the
    /// new session's ID if one was created
    fn admit(&mut self, hdr: &DatagramHeader, from: SocketAddr) -> Option<ConnectionId> {
        if self.role == Role::Dialer {
            log::trace!("Dropping datagram for unknown connection {:?}", hdr.dcid);
            return None;
        }

        match self.admission.decide(hdr, &from, &mut self.send_buf) {
            Admission::NegotiateVersion { len } => {
                Metrics::incr(&self.metrics.version_negotiations_total);
                self.debug.emit(|| {
                    format!("version negotiation to {} (offered {:#010x})", from, hdr.version)
                });
                self.send_reply(len, from);
                None
            }
            Admission::Retry { len, scid } => {
                Metrics::incr(&self.metrics.retries_total);
                self.debug
                    .emit(|| format!("retry to {} new scid={}", from, scid));
                self.send_reply(len, from);
                None
            }
            Admission::Drop(reason) => {
                if reason == DropReason::InvalidToken {
                    Metrics::incr(&self.metrics.retry_token_failures);
                }
                self.debug.emit(|| format!("drop from {}: {}", from, reason));
                None
            }
            Admission::Accept { scid, odcid } => {
                let validated = odcid.is_some();
                let conn = match quiche::accept(
                    &scid.as_quiche(),
                    odcid.as_ref(),
                    self.local_addr,
                    from,
                    &mut self.engine_config,
                ) {
                    Ok(conn) => conn,
                    Err(e) => {
                        log::debug!("Failed to accept connection from {}: {:?}", from, e);
                        return None;
                    }
                };

                let session =
                    Session::new(scid, Role::Listener, from, conn, self.callbacks.clone());
                if let Err(e) = self.registry.insert(scid, session) {
                    log::debug!("Not admitting {}: {}", from, e);
                    return None;
                }
                self.metrics.session_opened();
                if validated {
                    Metrics::incr(&self.metrics.retry_tokens_validated);
                }

                log::info!("New session from {} (scid={})", from, scid);
                self.debug.emit(|| format!("accept {} scid={}", from, scid));
                Some(scid)
            }
        }
    }

    /// Send an admission reply sitting in the send buffer
    fn send_reply(&self, len: usize, to: SocketAddr) {
        match self.socket.send_to(&self.send_buf[..len], to) {
            Ok(sent) if sent == len => Metrics::incr(&self.metrics.datagrams_sent_total),
            Ok(sent) => {
                log::warn!("Short reply to {}: {} of {} bytes", to, sent, len);
                Metrics::incr(&self.metrics.send_failures_total);
            }
            Err(e) => log::debug!("Failed to reply to {}: {:?}", to, e),
        }
    }

    // ========================================================================
    // Timers / Egress
    // ========================================================================

    fn process_timers(&mut self) {
        let now = Instant::now();
        let expired: Vec<ConnectionId> = self
            .registry
            .iter()
            .filter(|(_, s)| s.timer().is_expired(now))
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            if let Some(session) = self.registry.find_mut(&id) {
                log::trace!("{}: timer fired", id);
                session.on_timeout();
            }
            self.refresh(&id);
            self.flush_session(&id);
            self.reap(&id);
        }
    }

    /// Flush and reap every session once
    fn sweep(&mut self) {
        for id in self.registry.ids() {
            self.flush_session(&id);
            self.reap(&id);
        }
    }

    /// Drain one session's egress. A failed send tears a dialer down.
    fn flush_session(&mut self, id: &ConnectionId) -> Option<FlushOutcome> {
        let session = self.registry.find_mut(id)?;
        let outcome = egress::flush(session, &self.socket, &mut self.send_buf, Instant::now());

        self.metrics
            .datagrams_sent_total
            .fetch_add(outcome.datagrams() as u64, Ordering::Relaxed);

        if outcome.is_send_failure() {
            Metrics::incr(&self.metrics.send_failures_total);
            if self.role == Role::Dialer {
                log::warn!("{}: send failed on dialer socket, tearing down", id);
                self.teardown(id);
            }
        }

        Some(outcome)
    }

    /// Re-derive a session's state, reacting to the first establishment
    fn refresh(&mut self, id: &ConnectionId) {
        let Some(session) = self.registry.find_mut(id) else {
            return;
        };
        let Some(prev) = session.refresh_state() else {
            return;
        };
        let state = session.state();

        log::debug!("{}: {} -> {}", id, prev, state);
        self.debug
            .emit(|| format!("session {} {} -> {}", id, prev, state));

        if state == SessionState::Established {
            log::info!(
                "Session {} established (alpn={})",
                id,
                String::from_utf8_lossy(session.conn().application_proto())
            );
            streams::announce_established(session);
        }
    }

    /// Tear a session down if the engine reports it closed
    fn reap(&mut self, id: &ConnectionId) -> bool {
        self.refresh(id);
        match self.registry.find(id) {
            Some(session) if session.is_closed() => self.teardown(id),
            _ => false,
        }
    }

    // ========================================================================
    // Session Operations
    // ========================================================================

    /// Remove a session, cancel its timer and free its engine connection.
    ///
    /// Returns `false` if the session was already gone.
    pub fn teardown(&mut self, id: &ConnectionId) -> bool {
        let Some(session) = self.registry.remove(id) else {
            return false;
        };

        let peer = session.peer();
        let stats = session.release();
        self.metrics.session_closed();

        log::info!(
            "Session {} with {} closed: recv={} sent={} lost={}",
            id,
            peer,
            stats.recv,
            stats.sent,
            stats.lost
        );
        self.debug.emit(|| {
            format!(
                "closed {} recv={} sent={} lost={}",
                id, stats.recv, stats.sent, stats.lost
            )
        });
        true
    }

    /// Start closing one session
    pub fn close(&mut self, id: &ConnectionId, app: bool, err: u64, reason: &[u8]) -> Result<()> {
        let session = self
            .registry
            .find_mut(id)
            .ok_or(Error::UnknownConnection(*id))?;
        session.close(app, err, reason)?;

        self.flush_session(id);
        self.reap(id);
        Ok(())
    }

    /// Start closing every session
    pub fn close_all(&mut self) {
        for id in self.registry.ids() {
            if let Err(e) = self.close(&id, false, 0, b"shutdown") {
                log::debug!("{}: close failed: {}", id, e);
            }
        }
    }

    /// Queue data on a stream and flush it
    pub fn stream_send(
        &mut self,
        id: &ConnectionId,
        stream_id: u64,
        data: &[u8],
        fin: bool,
    ) -> Result<usize> {
        let session = self
            .registry
            .find_mut(id)
            .ok_or(Error::UnknownConnection(*id))?;
        let written = session.conn_mut().stream_send(stream_id, data, fin)?;

        self.flush_session(id);
        Ok(written)
    }

    /// Read buffered stream data, returning `(len, fin)`.
    ///
    /// Flushes afterwards so flow control credit reaches the peer.
    pub fn stream_recv(
        &mut self,
        id: &ConnectionId,
        stream_id: u64,
        buf: &mut [u8],
    ) -> Result<(usize, bool)> {
        let session = self
            .registry
            .find_mut(id)
            .ok_or(Error::UnknownConnection(*id))?;
        let read = session.conn_mut().stream_recv(stream_id, buf)?;

        self.flush_session(id);
        Ok(read)
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    pub fn session_ids(&self) -> Vec<ConnectionId> {
        self.registry.ids()
    }

    pub fn session_state(&self, id: &ConnectionId) -> Option<SessionState> {
        self.registry.find(id).map(Session::state)
    }

    /// Sessions whose retransmission timer is currently armed
    pub fn armed_timers(&self) -> usize {
        self.registry
            .values()
            .filter(|s| s.timer().is_armed())
            .count()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("role", &self.role)
            .field("local_addr", &self.local_addr)
            .field("remote", &self.remote)
            .field("sessions", &self.registry.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_listener_binds_ephemeral_port() {
        let router = Router::new(Config::listener("127.0.0.1", 0), StreamCallbacks::default())
            .unwrap();

        assert_eq!(router.role(), Role::Listener);
        assert_ne!(router.local_addr().port(), 0);
        assert_eq!(router.session_count(), 0);
        assert_eq!(router.armed_timers(), 0);
    }

    #[test]
    fn test_dialer_starts_with_one_handshaking_session() {
        // Nobody listens; the first flight still goes out on a connected socket
        let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = peer.local_addr().unwrap().port();

        let router = Router::new(Config::dialer("127.0.0.1", port), StreamCallbacks::default())
            .unwrap();

        assert_eq!(router.session_count(), 1);
        let id = router.session_ids()[0];
        assert_eq!(router.session_state(&id), Some(SessionState::Handshaking));
        assert_eq!(router.armed_timers(), 1);
        assert!(router.metrics().datagrams_sent_total.load(Ordering::Relaxed) >= 1);

        let mut buf = [0u8; MAX_BUFFER_SIZE];
        let (len, from) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(from, router.local_addr());
        let hdr = DatagramHeader::inspect(&mut buf[..len]).unwrap();
        assert_eq!(hdr.ty, quiche::Type::Initial);
        assert_eq!(hdr.scid.as_ref(), id.as_bytes());
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = peer.local_addr().unwrap().port();
        let mut router =
            Router::new(Config::dialer("127.0.0.1", port), StreamCallbacks::default()).unwrap();
        let id = router.session_ids()[0];

        assert!(router.teardown(&id));
        assert!(!router.teardown(&id));
        assert_eq!(router.session_count(), 0);
        assert_eq!(router.armed_timers(), 0);
        assert_eq!(router.metrics().sessions_closed_total.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_unknown_session_operations() {
        let mut router = Router::new(Config::listener("127.0.0.1", 0), StreamCallbacks::default())
            .unwrap();
        let id = ConnectionId::new([0xaa; 16]);

        assert!(matches!(
            router.close(&id, false, 0, b""),
            Err(Error::UnknownConnection(_))
        ));
        assert!(matches!(
            router.stream_send(&id, 0, b"x", true),
            Err(Error::UnknownConnection(_))
        ));
        let mut buf = [0u8; 16];
        assert!(matches!(
            router.stream_recv(&id, 0, &mut buf),
            Err(Error::UnknownConnection(_))
        ));
        assert_eq!(router.session_state(&id), None);
    }

    #[test]
    fn test_debug_sink_sees_dial() {
        let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = peer.local_addr().unwrap().port();

        let lines = Rc::new(RefCell::new(Vec::<String>::new()));
        let sink = lines.clone();
        let mut config = Config::dialer("127.0.0.1", port);
        config.debug_log = Some(Rc::new(move |line: &str| sink.borrow_mut().push(line.into())));

        let _router = Router::new(config, StreamCallbacks::default()).unwrap();

        assert!(lines.borrow().iter().any(|l| l.starts_with("dial ")));
    }

    #[test]
    fn test_run_until_returns_on_shutdown() {
        let mut router = Router::new(Config::listener("127.0.0.1", 0), StreamCallbacks::default())
            .unwrap();
        let shutdown = AtomicBool::new(true);

        router.run_until(&shutdown).unwrap();
        assert_eq!(router.session_count(), 0);
    }
}
