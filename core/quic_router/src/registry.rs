//! Connection registry for routing datagrams to sessions
//!
//! The registry owns every live session of one router instance, keyed by the
//! local connection ID. Insertion happens only on successful admission (or on
//! dialing), removal only on teardown.

use std::collections::hash_map::{self, HashMap};

use crate::connection_id::ConnectionId;
use crate::error::{Error, Result};

// ============================================================================
// Registry Structure
// ============================================================================

/// Map from connection ID to the session that owns it.
///
/// Generic over the stored value so the routing rules can be exercised
/// without live engine connections.
pub struct ConnectionRegistry<S> {
    entries: HashMap<ConnectionId, S>,
}

impl<S> ConnectionRegistry<S> {
    /// Create a new empty registry
    pub fn new() -> Self {
        ConnectionRegistry {
            entries: HashMap::new(),
        }
    }

    /// Register a session under `id`.
    ///
    /// Fails without touching the existing entry if `id` is already live.
    pub fn insert(&mut self, id: ConnectionId, session: S) -> Result<&mut S> {
        match self.entries.entry(id) {
            hash_map::Entry::Occupied(_) => Err(Error::DuplicateConnectionId(id)),
            hash_map::Entry::Vacant(slot) => Ok(slot.insert(session)),
        }
    }

    /// Look up the session owning `id`
    pub fn find(&self, id: &ConnectionId) -> Option<&S> {
        self.entries.get(id)
    }

    /// Look up the session owning `id` for mutation
    pub fn find_mut(&mut self, id: &ConnectionId) -> Option<&mut S> {
        self.entries.get_mut(id)
    }

    /// Remove the entry for `id`. Removing an absent ID is a no-op.
    pub fn remove(&mut self, id: &ConnectionId) -> Option<S> {
        self.entries.remove(id)
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.entries.contains_key(id)
    }

    /// Snapshot of the live IDs, for passes that may remove entries
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.entries.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ConnectionId, &S)> {
        self.entries.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &S> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<S> Default for ConnectionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}
