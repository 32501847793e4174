//! Address validation tokens for stateless retry
//!
//! A token proves, on the second round trip, that the claimed source address
//! previously received our retry packet.
//!
//! # Format
//!
//! ```text
//! +----------+--------+----------------------+-----------+----------------+
//! | "quiche" | Family | IP (4 or 16 bytes)   | Port (BE) | Original DCID  |
//! | 6 bytes  | 4 / 6  |                      | 2 bytes   | 1..=20 bytes   |
//! +----------+--------+----------------------+-----------+----------------+
//! ```
//!
//! The token is NOT authenticated: anyone who can observe a retry can forge
//! one for the same address. Changing that would change what peers echo back
//! during retry, so the scheme is kept as is.

use std::net::SocketAddr;

/// Marker prefix of every token
pub const TOKEN_MARKER: &[u8] = b"quiche";

/// Upper bound on a token we mint or accept
pub const MAX_TOKEN_LEN: usize =
    TOKEN_MARKER.len() + std::mem::size_of::<libc::sockaddr_storage>() + quiche::MAX_CONN_ID_LEN;

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

/// Serialize a socket address as family tag, IP octets and big-endian port
fn encode_addr(addr: &SocketAddr, out: &mut Vec<u8>) {
    match addr {
        SocketAddr::V4(v4) => {
            out.push(FAMILY_V4);
            out.extend_from_slice(&v4.ip().octets());
        }
        SocketAddr::V6(v6) => {
            out.push(FAMILY_V6);
            out.extend_from_slice(&v6.ip().octets());
        }
    }
    out.extend_from_slice(&addr.port().to_be_bytes());
}

/// Mint a token binding `peer` to the client's original destination ID
pub fn mint(peer: &SocketAddr, odcid: &[u8]) -> Vec<u8> {
    let mut token = Vec::with_capacity(TOKEN_MARKER.len() + 19 + odcid.len());
    token.extend_from_slice(TOKEN_MARKER);
    encode_addr(peer, &mut token);
    token.extend_from_slice(odcid);
    token
}

/// Validate a token presented from `peer`.
///
/// Returns the original destination connection ID embedded in the token, or
/// `None` if the marker or address do not match exactly, or the remaining ID
/// is empty or too long.
pub fn validate(token: &[u8], peer: &SocketAddr) -> Option<quiche::ConnectionId<'static>> {
    if token.len() > MAX_TOKEN_LEN {
        return None;
    }

    let rest = token.strip_prefix(TOKEN_MARKER)?;

    let mut addr = Vec::with_capacity(19);
    encode_addr(peer, &mut addr);
    let odcid = rest.strip_prefix(addr.as_slice())?;

    if odcid.is_empty() || odcid.len() > quiche::MAX_CONN_ID_LEN {
        return None;
    }

    Some(quiche::ConnectionId::from_vec(odcid.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

    fn v4(a: u8, port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, a), port))
    }

    const ODCID: [u8; 16] = [0xaa; 16];

    #[test]
    fn test_token_layout() {
        // 192.0.2.1:4433 -> marker, family, 4 octets, port 0x1151
        let token = mint(&v4(1, 4433), &ODCID);

        assert_eq!(&token[..6], b"quiche");
        assert_eq!(token[6], 4);
        assert_eq!(token[7..11], [192, 0, 2, 1]);
        assert_eq!(token[11..13], [0x11, 0x51]);
        assert_eq!(token[13..], ODCID);
        assert!(token.len() <= MAX_TOKEN_LEN);
    }

    #[test]
    fn test_validates_for_same_peer() {
        let peer = v4(1, 4433);
        let token = mint(&peer, &ODCID);

        let odcid = validate(&token, &peer).expect("token should validate");
        assert_eq!(&odcid[..], &ODCID);
    }

    #[test]
    fn test_rejects_different_address() {
        let token = mint(&v4(1, 4433), &ODCID);

        assert!(validate(&token, &v4(2, 4433)).is_none());
    }

    #[test]
    fn test_rejects_different_port() {
        let token = mint(&v4(1, 4433), &ODCID);

        assert!(validate(&token, &v4(1, 4434)).is_none());
    }

    #[test]
    fn test_rejects_family_mismatch() {
        // ::ffff:192.0.2.1 must not be confused with 192.0.2.1
        let mapped = SocketAddr::V6(SocketAddrV6::new(
            Ipv4Addr::new(192, 0, 2, 1).to_ipv6_mapped(),
            4433,
            0,
            0,
        ));
        let token = mint(&v4(1, 4433), &ODCID);

        assert!(validate(&token, &mapped).is_none());
    }

    #[test]
    fn test_rejects_bad_marker() {
        let peer = v4(1, 4433);
        let mut token = mint(&peer, &ODCID);
        token[0] ^= 0xff;

        assert!(validate(&token, &peer).is_none());
    }

    #[test]
    fn test_rejects_tampered_address_bytes() {
        let peer = v4(1, 4433);
        let mut token = mint(&peer, &ODCID);
        token[9] ^= 0x01;

        assert!(validate(&token, &peer).is_none());
    }

    #[test]
    fn test_rejects_truncated() {
        let peer = v4(1, 4433);
        let token = mint(&peer, &ODCID);

        // Cut inside the address
        assert!(validate(&token[..10], &peer).is_none());
        // Cut right after the address leaves no original DCID
        assert!(validate(&token[..13], &peer).is_none());
        // Only the marker
        assert!(validate(TOKEN_MARKER, &peer).is_none());
        assert!(validate(&[], &peer).is_none());
    }

    #[test]
    fn test_rejects_oversized() {
        let peer = v4(1, 4433);
        let mut token = mint(&peer, &ODCID);
        token.resize(MAX_TOKEN_LEN + 1, 0);

        assert!(validate(&token, &peer).is_none());
    }

    #[test]
    fn test_rejects_overlong_odcid() {
        let peer = v4(1, 4433);
        let token = mint(&peer, &[0u8; quiche::MAX_CONN_ID_LEN + 1]);

        assert!(validate(&token, &peer).is_none());
    }

    #[test]
    fn test_ipv6_roundtrip() {
        let peer = SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::LOCALHOST, 9000, 0, 0));
        let token = mint(&peer, &ODCID);

        assert_eq!(token[6], 6);
        assert_eq!(&validate(&token, &peer).unwrap()[..], &ODCID);
    }
}
