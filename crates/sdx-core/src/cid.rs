use cid::Cid;
use multihash_codetable::{Code, MultihashDigest};

use crate::error::CoreError;

/// Multicodec code for raw binary content.
pub const RAW_CODEC: u64 = 0x55;

/// Computes the CIDv1 (raw codec, multihash-SHA-256) for a byte string.
pub fn cid_for_bytes(bytes: &[u8]) -> Cid {
    Cid::new_v1(RAW_CODEC, Code::Sha2_256.digest(bytes))
}

/// Computes the canonical multibase-base32-lowercase rendering of the CID.
///
/// The rendering is byte-identical across implementations; it is the key
/// used on the wire, in the store, and in announcement records.
pub fn cid_string(bytes: &[u8]) -> String {
    cid_for_bytes(bytes).to_string()
}

/// Parses a CID string, accepting only CIDv1.
pub fn parse_cid(s: &str) -> Result<Cid, CoreError> {
    let parsed: Cid = s
        .parse()
        .map_err(|_| CoreError::InvalidCid("unparseable cid"))?;
    if parsed.version() != cid::Version::V1 {
        return Err(CoreError::InvalidCid("only cid v1 is supported"));
    }
    Ok(parsed)
}

/// Returns true when `cid` is the canonical CID of `bytes`.
pub fn cid_matches(cid: &str, bytes: &[u8]) -> bool {
    cid_string(bytes) == cid
}
