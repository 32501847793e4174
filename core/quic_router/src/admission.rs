//! Connection admission
//!
//! Decides what happens to a datagram whose destination ID matches no live
//! session: answer with version negotiation, answer with a stateless retry,
//! drop it, or accept it as a new session.
//!
//! Nothing here creates sessions or touches the socket. The router acts on
//! the returned [`Admission`].

use std::fmt;
use std::net::SocketAddr;

use ring::hmac;
use ring::rand::SystemRandom;

use crate::connection_id::ConnectionId;
use crate::error::{Error, Result};
use crate::header::DatagramHeader;
use crate::{token, LOCAL_CONN_ID_LEN};

// ============================================================================
// Decisions
// ============================================================================

/// Why a datagram was dropped without a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Version negotiation packets are never answered
    VersionNegotiation,
    /// Only Initial packets may open a session
    NotInitial,
    /// Token marker or address did not match the source
    InvalidToken,
    /// Token was fine but the destination ID is not one of ours
    BadConnectionIdLength,
    /// The engine failed to write the reply
    Engine(quiche::Error),
    /// No connection ID could be generated
    Rng,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::VersionNegotiation => f.write_str("version negotiation packet"),
            DropReason::NotInitial => f.write_str("not an initial packet"),
            DropReason::InvalidToken => f.write_str("invalid address token"),
            DropReason::BadConnectionIdLength => f.write_str("invalid destination id length"),
            DropReason::Engine(e) => write!(f, "engine error: {:?}", e),
            DropReason::Rng => f.write_str("random generator failure"),
        }
    }
}

/// Outcome of admission for one datagram
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// A version negotiation packet of `len` bytes was written to `out`
    NegotiateVersion { len: usize },
    /// A retry packet of `len` bytes carrying a fresh token was written to
    /// `out`; the peer is expected to come back addressed to `scid`
    Retry { len: usize, scid: ConnectionId },
    /// Create a session keyed by `scid`
    Accept {
        scid: ConnectionId,
        odcid: Option<quiche::ConnectionId<'static>>,
    },
    /// Say nothing
    Drop(DropReason),
}

// ============================================================================
// Admission Controller
// ============================================================================

/// Per-router admission state
pub struct AdmissionController {
    rng: SystemRandom,
    /// Keys the IDs handed out when retry is disabled
    conn_id_seed: hmac::Key,
    stateless_retry: bool,
}

impl AdmissionController {
    pub fn new(stateless_retry: bool) -> Result<Self> {
        let rng = SystemRandom::new();
        let conn_id_seed =
            hmac::Key::generate(hmac::HMAC_SHA256, &rng).map_err(|_| Error::Rng)?;

        Ok(AdmissionController {
            rng,
            conn_id_seed,
            stateless_retry,
        })
    }

    pub fn stateless_retry(&self) -> bool {
        self.stateless_retry
    }

    /// Fresh random ID for a session this side opens
    pub fn generate_id(&self) -> Result<ConnectionId> {
        ConnectionId::generate(&self.rng)
    }

    /// ID a directly accepted session gets for a client-chosen `dcid`.
    ///
    /// Repeated Initials carrying the same `dcid` map to the same session
    /// until the client switches to our ID.
    pub fn derived_id(&self, dcid: &[u8]) -> ConnectionId {
        let tag = hmac::sign(&self.conn_id_seed, dcid);
        let mut bytes = [0u8; LOCAL_CONN_ID_LEN];
        bytes.copy_from_slice(&tag.as_ref()[..LOCAL_CONN_ID_LEN]);
        ConnectionId::new(bytes)
    }

    /// Decide what to do with a datagram from `from` that matched no session.
    ///
    /// Any reply packet is written to `out`; the caller sends it to `from`.
    pub fn decide(&self, hdr: &DatagramHeader, from: &SocketAddr, out: &mut [u8]) -> Admission {
        // Never answered, whatever version field it carries
        if hdr.ty == quiche::Type::VersionNegotiation {
            log::trace!("Ignoring version negotiation from {}", from);
            return Admission::Drop(DropReason::VersionNegotiation);
        }

        if hdr.is_long() && !quiche::version_is_supported(hdr.version) {
            log::debug!("Unsupported version {:#010x} from {}", hdr.version, from);

            return match quiche::negotiate_version(&hdr.scid, &hdr.dcid, out) {
                Ok(len) => Admission::NegotiateVersion { len },
                Err(e) => Admission::Drop(DropReason::Engine(e)),
            };
        }

        if hdr.ty != quiche::Type::Initial {
            log::trace!("Dropping {:?} packet for unknown connection", hdr.ty);
            return Admission::Drop(DropReason::NotInitial);
        }

        if hdr.token.is_empty() {
            if !self.stateless_retry {
                return Admission::Accept {
                    scid: self.derived_id(&hdr.dcid),
                    odcid: None,
                };
            }
            return self.retry(hdr, from, out);
        }

        let Some(odcid) = token::validate(&hdr.token, from) else {
            log::debug!("Invalid address token from {}", from);
            return Admission::Drop(DropReason::InvalidToken);
        };

        match ConnectionId::from_slice(&hdr.dcid) {
            Some(scid) => Admission::Accept {
                scid,
                odcid: Some(odcid),
            },
            None => {
                log::debug!(
                    "Destination id of {} bytes from {} is not ours",
                    hdr.dcid.len(),
                    from
                );
                Admission::Drop(DropReason::BadConnectionIdLength)
            }
        }
    }

    fn retry(&self, hdr: &DatagramHeader, from: &SocketAddr, out: &mut [u8]) -> Admission {
        let scid = match self.generate_id() {
            Ok(scid) => scid,
            Err(_) => return Admission::Drop(DropReason::Rng),
        };
        let new_token = token::mint(from, &hdr.dcid);

        log::debug!("Stateless retry for {} with new id {}", from, scid);

        match quiche::retry(
            &hdr.scid,
            &hdr.dcid,
            &scid.as_quiche(),
            &new_token,
            hdr.version,
            out,
        ) {
            Ok(len) => Admission::Retry { len, scid },
            Err(e) => Admission::Drop(DropReason::Engine(e)),
        }
    }
}

impl fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionController")
            .field("stateless_retry", &self.stateless_retry)
            .finish_non_exhaustive()
    }
}
