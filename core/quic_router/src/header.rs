//! Unencrypted header inspection
//!
//! Copies the fields routing and admission need out of the engine's header
//! parser so the datagram buffer is free again for the receive path.

use crate::error::Result;
use crate::LOCAL_CONN_ID_LEN;

/// Header fields of one inbound datagram
#[derive(Debug, Clone, PartialEq)]
pub struct DatagramHeader {
    /// Packet type
    pub ty: quiche::Type,
    /// Declared protocol version (0 for short headers)
    pub version: u32,
    /// Destination connection ID
    pub dcid: quiche::ConnectionId<'static>,
    /// Source connection ID (empty for short headers)
    pub scid: quiche::ConnectionId<'static>,
    /// Address validation token (Initial packets only, may be empty)
    pub token: Vec<u8>,
}

impl DatagramHeader {
    /// Parse the unprotected header fields of `buf`.
    ///
    /// Short-header destination IDs are read as `LOCAL_CONN_ID_LEN` bytes,
    /// the only length this side ever hands out.
    pub fn inspect(buf: &mut [u8]) -> Result<Self> {
        let hdr = quiche::Header::from_slice(buf, LOCAL_CONN_ID_LEN)?;

        Ok(DatagramHeader {
            ty: hdr.ty,
            version: hdr.version,
            dcid: hdr.dcid.into_owned(),
            scid: hdr.scid.into_owned(),
            token: hdr.token.unwrap_or_default(),
        })
    }

    /// Whether the packet carries a long header with a version field
    pub fn is_long(&self) -> bool {
        !matches!(self.ty, quiche::Type::Short)
    }
}
