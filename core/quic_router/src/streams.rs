//! Stream readiness notification
//!
//! After a datagram is ingested on an established session, every stream the
//! engine reports as readable is handed to the application's receiving
//! callback. A callback error stops the batch; the session stays up.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::config::Role;
use crate::connection_id::ConnectionId;
use crate::error::Result;
use crate::session::Session;

// ============================================================================
// Callback Types
// ============================================================================

/// Application callback invoked for one stream of one session
pub type StreamCallback = Rc<RefCell<dyn FnMut(&mut StreamEvent<'_>) -> Result<()>>>;

/// Wrap a closure as a [`StreamCallback`]
pub fn stream_callback<F>(f: F) -> StreamCallback
where
    F: FnMut(&mut StreamEvent<'_>) -> Result<()> + 'static,
{
    Rc::new(RefCell::new(f))
}

/// The pair of callbacks every session carries
#[derive(Clone, Default)]
pub struct StreamCallbacks {
    /// Invoked once when the session becomes established, with the first
    /// bidirectional stream this side may open
    pub on_sending: Option<StreamCallback>,
    /// Invoked for each readable stream after ingestion
    pub on_receiving: Option<StreamCallback>,
}

impl StreamCallbacks {
    pub fn new(on_sending: Option<StreamCallback>, on_receiving: Option<StreamCallback>) -> Self {
        StreamCallbacks {
            on_sending,
            on_receiving,
        }
    }
}

impl fmt::Debug for StreamCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamCallbacks")
            .field("on_sending", &self.on_sending.is_some())
            .field("on_receiving", &self.on_receiving.is_some())
            .finish()
    }
}

// ============================================================================
// Stream Event
// ============================================================================

/// View of one stream handed to a callback.
///
/// Gives access to the stream's data through the owning session's engine
/// connection for the duration of the call.
pub struct StreamEvent<'a> {
    conn_id: ConnectionId,
    stream_id: u64,
    application_proto: &'a [u8],
    conn: &'a mut quiche::Connection,
}

impl<'a> StreamEvent<'a> {
    pub fn conn_id(&self) -> ConnectionId {
        self.conn_id
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    /// Negotiated ALPN protocol
    pub fn application_proto(&self) -> &[u8] {
        self.application_proto
    }

    /// Read stream data into `buf`, returning `(len, fin)`.
    ///
    /// Returns `Error::Engine(quiche::Error::Done)` when nothing is buffered.
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<(usize, bool)> {
        Ok(self.conn.stream_recv(self.stream_id, buf)?)
    }

    /// Queue data on this stream, returning how much the engine accepted
    pub fn send(&mut self, data: &[u8], fin: bool) -> Result<usize> {
        Ok(self.conn.stream_send(self.stream_id, data, fin)?)
    }

    /// Close the whole session
    pub fn close(&mut self, app: bool, err: u64, reason: &[u8]) -> Result<()> {
        match self.conn.close(app, err, reason) {
            Ok(()) | Err(quiche::Error::Done) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// Notification
// ============================================================================

/// First bidirectional stream ID this role may open
pub fn first_bidi_stream(role: Role) -> u64 {
    match role {
        Role::Dialer => 0,
        Role::Listener => 1,
    }
}

/// Run `f` for each stream ID in order, stopping at the first failure.
///
/// Returns how many calls succeeded.
pub fn deliver<I, F>(stream_ids: I, mut f: F) -> usize
where
    I: IntoIterator<Item = u64>,
    F: FnMut(u64) -> Result<()>,
{
    let mut delivered = 0;
    for stream_id in stream_ids {
        if let Err(e) = f(stream_id) {
            log::debug!("Stream {} callback stopped the batch: {}", stream_id, e);
            break;
        }
        delivered += 1;
    }
    delivered
}

/// Invoke the sending callback for a session that just became established
pub fn announce_established(session: &mut Session) -> bool {
    let Some(callback) = session.callbacks().on_sending.clone() else {
        return false;
    };

    let conn_id = session.id();
    let stream_id = first_bidi_stream(session.role());
    let proto = session.conn().application_proto().to_vec();

    let mut event = StreamEvent {
        conn_id,
        stream_id,
        application_proto: &proto,
        conn: session.conn_mut(),
    };

    let result = (&mut *callback.borrow_mut())(&mut event);
    if let Err(e) = result {
        log::debug!("Sending callback failed for {}: {}", conn_id, e);
        return false;
    }
    true
}

/// Hand every readable stream of an established session to the receiving
/// callback, in the order the engine reports them.
///
/// Returns how many streams were delivered.
pub fn notify_readable(session: &mut Session) -> usize {
    // Without a receiver there is nothing to notify
    let Some(callback) = session.callbacks().on_receiving.clone() else {
        return 0;
    };

    let conn_id = session.id();
    let proto = session.conn().application_proto().to_vec();
    let readable: Vec<u64> = session.conn().readable().collect();

    let conn = session.conn_mut();
    deliver(readable, |stream_id| {
        let mut event = StreamEvent {
            conn_id,
            stream_id,
            application_proto: &proto,
            conn: &mut *conn,
        };
        (&mut *callback.borrow_mut())(&mut event)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_deliver_all_in_order() {
        let mut seen = Vec::new();
        let delivered = deliver(vec![0, 4, 8], |id| {
            seen.push(id);
            Ok(())
        });

        assert_eq!(delivered, 3);
        assert_eq!(seen, vec![0, 4, 8]);
    }

    #[test]
    fn test_deliver_stops_on_failure() {
        let mut seen = Vec::new();
        let delivered = deliver(vec![0, 4, 8], |id| {
            seen.push(id);
            if id == 4 {
                Err(Error::Callback("stop".into()))
            } else {
                Ok(())
            }
        });

        assert_eq!(delivered, 1);
        // 8 is never offered
        assert_eq!(seen, vec![0, 4]);
    }

    #[test]
    fn test_first_bidi_stream_per_role() {
        assert_eq!(first_bidi_stream(Role::Dialer), 0);
        assert_eq!(first_bidi_stream(Role::Listener), 1);
    }

    #[test]
    fn test_stream_callback_is_shared() {
        let counter = Rc::new(RefCell::new(0));
        let c = counter.clone();
        let callback = stream_callback(move |_event| {
            *c.borrow_mut() += 1;
            Ok(())
        });

        let callbacks = StreamCallbacks::new(None, Some(callback));
        let copy = callbacks.clone();
        assert!(Rc::ptr_eq(
            callbacks.on_receiving.as_ref().unwrap(),
            copy.on_receiving.as_ref().unwrap()
        ));
        assert_eq!(*counter.borrow(), 0);
    }
}
