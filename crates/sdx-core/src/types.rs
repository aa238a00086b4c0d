use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CoreError;

/// 32-byte long-term peer identifier (an Ed25519 public key).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, CoreError> {
        let raw = hex::decode(s).map_err(|_| CoreError::InvalidPeerId)?;
        let bytes: [u8; 32] = raw.try_into().map_err(|_| CoreError::InvalidPeerId)?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.to_hex())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for PeerId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PeerId::from_hex(&s).map_err(D::Error::custom)
    }
}

/// Named record type known to the network-wide schema validator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaId(String);

impl SchemaId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SchemaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SchemaId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::{PeerId, SchemaId};

    #[test]
    fn peer_id_hex_round_trip() {
        let peer = PeerId([0xAB; 32]);
        let parsed = PeerId::from_hex(&peer.to_hex()).expect("hex should parse");
        assert_eq!(parsed, peer);
    }

    #[test]
    fn peer_id_rejects_short_hex() {
        assert!(PeerId::from_hex("abcd").is_err());
        assert!(PeerId::from_hex("not-hex").is_err());
    }

    #[test]
    fn peer_id_serde_uses_hex_strings() {
        let peer = PeerId([0x01; 32]);
        let json = serde_json::to_string(&peer).expect("peer should serialize");
        assert_eq!(json, format!("\"{}\"", peer.to_hex()));
        let back: PeerId = serde_json::from_str(&json).expect("peer should deserialize");
        assert_eq!(back, peer);
    }

    #[test]
    fn schema_id_displays_its_name() {
        let schema = SchemaId::from("OMM");
        assert_eq!(schema.as_str(), "OMM");
        assert_eq!(schema.to_string(), "OMM");
    }
}
