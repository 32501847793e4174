//! Fixed-length connection IDs used as registry keys

use std::fmt;

use ring::rand::SecureRandom;

use crate::error::{Error, Result};
use crate::LOCAL_CONN_ID_LEN;

/// A 16-byte connection ID chosen by this side of a session.
///
/// Packets carrying any other destination ID length can never match a
/// registered session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId([u8; LOCAL_CONN_ID_LEN]);

impl ConnectionId {
    /// Wrap raw bytes
    pub const fn new(bytes: [u8; LOCAL_CONN_ID_LEN]) -> Self {
        ConnectionId(bytes)
    }

    /// Generate a random connection ID
    pub fn generate(rng: &dyn SecureRandom) -> Result<Self> {
        let mut bytes = [0u8; LOCAL_CONN_ID_LEN];
        rng.fill(&mut bytes).map_err(|_| Error::Rng)?;
        Ok(ConnectionId(bytes))
    }

    /// Convert from a slice, returning `None` unless it is exactly 16 bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; LOCAL_CONN_ID_LEN]>::try_from(bytes).ok().map(ConnectionId)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Borrow as the engine's connection ID type
    pub fn as_quiche(&self) -> quiche::ConnectionId<'_> {
        quiche::ConnectionId::from_ref(&self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ring::rand::SystemRandom;

    #[test]
    fn test_from_slice_requires_exact_length() {
        assert!(ConnectionId::from_slice(&[0u8; 16]).is_some());
        assert!(ConnectionId::from_slice(&[0u8; 15]).is_none());
        assert!(ConnectionId::from_slice(&[0u8; 20]).is_none());
        assert!(ConnectionId::from_slice(&[]).is_none());
    }

    #[test]
    fn test_generate_is_random() {
        let rng = SystemRandom::new();
        let a = ConnectionId::generate(&rng).unwrap();
        let b = ConnectionId::generate(&rng).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_display_hex() {
        let mut bytes = [0u8; 16];
        bytes[0] = 0xab;
        bytes[15] = 0x01;
        let id = ConnectionId::new(bytes);
        assert_eq!(id.to_string(), "ab000000000000000000000000000001");
    }

    #[test]
    fn test_quiche_view_matches_bytes() {
        let id = ConnectionId::new([7u8; 16]);
        assert_eq!(&id.as_quiche()[..], id.as_bytes());
    }
}
