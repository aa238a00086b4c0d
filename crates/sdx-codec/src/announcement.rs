use bytes::{Buf, BufMut};
use sdx_core::{PeerId, SchemaId};
use sdx_crypto::signing::{verify_signature, IdentitySigner, SignatureBytes};

use crate::error::CodecError;

/// Upper bound on encoded announcement size; a PNM is a small control
/// record, anything larger is malformed by construction.
pub const MAX_ANNOUNCEMENT_LEN: usize = 64 * 1024;

/// A signed publish notification message (PNM).
///
/// Announcements are the trigger for fetches, never the payload: they carry
/// the CID of a record now available from the publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub schema_id: SchemaId,
    pub cid: String,
    pub publisher: PeerId,
    pub timestamp_millis: i64,
    pub route_hint: Option<String>,
    pub signature: SignatureBytes,
}

impl Announcement {
    /// Builds and signs an announcement under the publisher's identity.
    pub fn sign(
        schema_id: SchemaId,
        cid: String,
        timestamp_millis: i64,
        route_hint: Option<String>,
        signer: &dyn IdentitySigner,
    ) -> Self {
        let publisher = signer.peer_id();
        let digest = signing_bytes(&schema_id, &cid, &publisher, timestamp_millis);
        let signature = signer.sign(&digest);
        Self {
            schema_id,
            cid,
            publisher,
            timestamp_millis,
            route_hint,
            signature,
        }
    }

    /// Verifies the signature against the declared publisher.
    ///
    /// The route hint is delivery metadata and intentionally not covered.
    pub fn verify(&self) -> bool {
        let digest = signing_bytes(
            &self.schema_id,
            &self.cid,
            &self.publisher,
            self.timestamp_millis,
        );
        verify_signature(&self.publisher, &digest, &self.signature)
    }

    /// Encodes the announcement for the gossip lane.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let schema = self.schema_id.as_str().as_bytes();
        let cid = self.cid.as_bytes();
        if schema.len() > u16::MAX as usize {
            return Err(CodecError::InvalidAnnouncement("schema name too long"));
        }
        if cid.len() > u16::MAX as usize {
            return Err(CodecError::InvalidAnnouncement("cid too long"));
        }
        let mut out = Vec::with_capacity(2 + schema.len() + 2 + cid.len() + 32 + 8 + 3 + 64);
        out.put_u16(schema.len() as u16);
        out.put_slice(schema);
        out.put_u16(cid.len() as u16);
        out.put_slice(cid);
        out.put_slice(self.publisher.as_bytes());
        out.put_i64(self.timestamp_millis);
        match &self.route_hint {
            Some(hint) => {
                let hint = hint.as_bytes();
                if hint.len() > u16::MAX as usize {
                    return Err(CodecError::InvalidAnnouncement("route hint too long"));
                }
                out.put_u8(1);
                out.put_u16(hint.len() as u16);
                out.put_slice(hint);
            }
            None => out.put_u8(0),
        }
        out.put_slice(&self.signature);
        if out.len() > MAX_ANNOUNCEMENT_LEN {
            return Err(CodecError::InvalidAnnouncement("announcement too large"));
        }
        Ok(out)
    }

    /// Decodes an announcement received on the gossip lane.
    pub fn decode(raw: &[u8]) -> Result<Self, CodecError> {
        if raw.len() > MAX_ANNOUNCEMENT_LEN {
            return Err(CodecError::InvalidAnnouncement("announcement too large"));
        }
        let mut buf = raw;
        let schema_id = SchemaId::new(read_text_block(&mut buf)?);
        let cid = read_text_block(&mut buf)?;
        if buf.remaining() < 32 + 8 + 1 {
            return Err(CodecError::Truncated);
        }
        let mut publisher = [0_u8; 32];
        buf.copy_to_slice(&mut publisher);
        let timestamp_millis = buf.get_i64();
        let route_hint = match buf.get_u8() {
            0 => None,
            1 => Some(read_text_block(&mut buf)?),
            _ => return Err(CodecError::InvalidAnnouncement("bad route hint flag")),
        };
        if buf.remaining() != 64 {
            return Err(CodecError::InvalidAnnouncement("bad signature length"));
        }
        let mut signature = [0_u8; 64];
        buf.copy_to_slice(&mut signature);
        Ok(Self {
            schema_id,
            cid,
            publisher: PeerId(publisher),
            timestamp_millis,
            route_hint,
            signature,
        })
    }
}

/// Canonical byte string covered by the announcement signature:
/// `schema_id || 0x00 || cid || 0x00 || publisher || 0x00 || timestamp_be8`.
pub fn signing_bytes(
    schema_id: &SchemaId,
    cid: &str,
    publisher: &PeerId,
    timestamp_millis: i64,
) -> Vec<u8> {
    let schema = schema_id.as_str().as_bytes();
    let mut out = Vec::with_capacity(schema.len() + 1 + cid.len() + 1 + 32 + 1 + 8);
    out.extend_from_slice(schema);
    out.push(0);
    out.extend_from_slice(cid.as_bytes());
    out.push(0);
    out.extend_from_slice(publisher.as_bytes());
    out.push(0);
    out.extend_from_slice(&timestamp_millis.to_be_bytes());
    out
}

fn read_text_block(buf: &mut &[u8]) -> Result<String, CodecError> {
    if buf.remaining() < 2 {
        return Err(CodecError::Truncated);
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(CodecError::Truncated);
    }
    let raw = buf.copy_to_bytes(len);
    std::str::from_utf8(&raw)
        .map(str::to_string)
        .map_err(|_| CodecError::InvalidAnnouncement("field is not utf-8"))
}
