use bytes::{Buf, BufMut};
use sdx_core::SchemaId;

use crate::error::CodecError;

/// Stream protocol identifier for the exchange protocol.
pub const EXCHANGE_PROTOCOL_ID: &str = "/sdx/exchange/1.0.0";

/// Maximum schema name length on the wire, enforced by the u16 length field.
pub const MAX_SCHEMA_NAME_LEN: usize = u16::MAX as usize;

/// Frame opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Request = 1,
    Push = 2,
    Query = 3,
    Response = 4,
    Ack = 5,
    Nack = 6,
}

impl Opcode {
    pub fn from_u8(raw: u8) -> Result<Self, CodecError> {
        match raw {
            1 => Ok(Self::Request),
            2 => Ok(Self::Push),
            3 => Ok(Self::Query),
            4 => Ok(Self::Response),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nack),
            _ => Err(CodecError::InvalidFrame("unknown opcode")),
        }
    }
}

/// Response codes carried on RESPONSE frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseCode {
    Reject = 0,
    Accept = 1,
    RateLimited = 2,
}

impl ResponseCode {
    pub fn from_u8(raw: u8) -> Result<Self, CodecError> {
        match raw {
            0 => Ok(Self::Reject),
            1 => Ok(Self::Accept),
            2 => Ok(Self::RateLimited),
            _ => Err(CodecError::InvalidFrame("unknown response code")),
        }
    }
}

/// Reason codes carried on ACK/NACK frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReasonCode {
    None = 0,
    ProtocolError = 1,
    UnknownSchema = 2,
    NotFound = 3,
    ValidationFailed = 4,
    Oversize = 5,
}

impl ReasonCode {
    pub fn from_u8(raw: u8) -> Result<Self, CodecError> {
        match raw {
            0 => Ok(Self::None),
            1 => Ok(Self::ProtocolError),
            2 => Ok(Self::UnknownSchema),
            3 => Ok(Self::NotFound),
            4 => Ok(Self::ValidationFailed),
            5 => Ok(Self::Oversize),
            _ => Err(CodecError::InvalidFrame("unknown reason code")),
        }
    }
}

/// One exchange-protocol frame.
///
/// Every frame opens with the opcode byte and a length-prefixed schema name;
/// the remainder is opcode-specific.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Pull the payload for a CID previously seen in an announcement.
    Request { schema: SchemaId, cid: String },
    /// Push a full payload for validation and storage.
    Push { schema: SchemaId, payload: Vec<u8> },
    /// Evaluate an opaque filter against the receiver's index.
    Query { schema: SchemaId, query: Vec<u8> },
    /// Terminal reply carrying a response code and payload.
    Response {
        schema: SchemaId,
        code: ResponseCode,
        payload: Vec<u8>,
    },
    /// Positive control acknowledgement.
    Ack {
        schema: SchemaId,
        reason: ReasonCode,
        message: Option<String>,
    },
    /// Negative reply carrying a reason.
    Nack {
        schema: SchemaId,
        reason: ReasonCode,
        message: Option<String>,
    },
}

impl Frame {
    pub fn opcode(&self) -> Opcode {
        match self {
            Frame::Request { .. } => Opcode::Request,
            Frame::Push { .. } => Opcode::Push,
            Frame::Query { .. } => Opcode::Query,
            Frame::Response { .. } => Opcode::Response,
            Frame::Ack { .. } => Opcode::Ack,
            Frame::Nack { .. } => Opcode::Nack,
        }
    }

    pub fn schema(&self) -> &SchemaId {
        match self {
            Frame::Request { schema, .. }
            | Frame::Push { schema, .. }
            | Frame::Query { schema, .. }
            | Frame::Response { schema, .. }
            | Frame::Ack { schema, .. }
            | Frame::Nack { schema, .. } => schema,
        }
    }

    /// Encodes the frame into a fresh byte vector.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let schema = self.schema().as_str().as_bytes();
        if schema.len() > MAX_SCHEMA_NAME_LEN {
            return Err(CodecError::InvalidFrame("schema name exceeds u16 length"));
        }
        let mut out = Vec::with_capacity(3 + schema.len() + 16);
        out.put_u8(self.opcode() as u8);
        out.put_u16(schema.len() as u16);
        out.put_slice(schema);
        match self {
            Frame::Request { cid, .. } => {
                let cid = cid.as_bytes();
                if cid.len() > u16::MAX as usize {
                    return Err(CodecError::InvalidFrame("cid exceeds u16 length"));
                }
                out.put_u16(cid.len() as u16);
                out.put_slice(cid);
            }
            Frame::Push { payload, .. } => {
                if payload.len() > u32::MAX as usize {
                    return Err(CodecError::InvalidFrame("payload exceeds u32 length"));
                }
                out.put_u32(payload.len() as u32);
                out.put_slice(payload);
            }
            Frame::Query { query, .. } => {
                if query.len() > u32::MAX as usize {
                    return Err(CodecError::InvalidFrame("query exceeds u32 length"));
                }
                out.put_u32(query.len() as u32);
                out.put_slice(query);
            }
            Frame::Response { code, payload, .. } => {
                if payload.len() > u32::MAX as usize {
                    return Err(CodecError::InvalidFrame("payload exceeds u32 length"));
                }
                out.put_u8(*code as u8);
                out.put_u32(payload.len() as u32);
                out.put_slice(payload);
            }
            Frame::Ack {
                reason, message, ..
            }
            | Frame::Nack {
                reason, message, ..
            } => {
                out.put_u8(*reason as u8);
                match message {
                    Some(text) => {
                        let text = text.as_bytes();
                        if text.len() > u16::MAX as usize {
                            return Err(CodecError::InvalidFrame("message exceeds u16 length"));
                        }
                        out.put_u16(text.len() as u16);
                        out.put_slice(text);
                    }
                    None => out.put_u16(0),
                }
            }
        }
        Ok(out)
    }

    /// Decodes one frame from a complete buffer, consuming it from `buf`.
    pub fn decode(buf: &mut &[u8]) -> Result<Self, CodecError> {
        if buf.remaining() < 3 {
            return Err(CodecError::Truncated);
        }
        let opcode = Opcode::from_u8(buf.get_u8())?;
        let schema_len = buf.get_u16() as usize;
        if buf.remaining() < schema_len {
            return Err(CodecError::Truncated);
        }
        let schema_raw = buf.copy_to_bytes(schema_len);
        let schema_name = std::str::from_utf8(&schema_raw)
            .map_err(|_| CodecError::InvalidFrame("schema name is not utf-8"))?;
        let schema = SchemaId::new(schema_name);

        match opcode {
            Opcode::Request => {
                if buf.remaining() < 2 {
                    return Err(CodecError::Truncated);
                }
                let cid_len = buf.get_u16() as usize;
                if buf.remaining() < cid_len {
                    return Err(CodecError::Truncated);
                }
                let cid_raw = buf.copy_to_bytes(cid_len);
                let cid = std::str::from_utf8(&cid_raw)
                    .map_err(|_| CodecError::InvalidFrame("cid is not utf-8"))?
                    .to_string();
                Ok(Frame::Request { schema, cid })
            }
            Opcode::Push => {
                let payload = decode_u32_block(buf)?;
                Ok(Frame::Push { schema, payload })
            }
            Opcode::Query => {
                let query = decode_u32_block(buf)?;
                Ok(Frame::Query { schema, query })
            }
            Opcode::Response => {
                if buf.remaining() < 1 {
                    return Err(CodecError::Truncated);
                }
                let code = ResponseCode::from_u8(buf.get_u8())?;
                let payload = decode_u32_block(buf)?;
                Ok(Frame::Response {
                    schema,
                    code,
                    payload,
                })
            }
            Opcode::Ack | Opcode::Nack => {
                if buf.remaining() < 1 {
                    return Err(CodecError::Truncated);
                }
                let reason = ReasonCode::from_u8(buf.get_u8())?;
                // The trailing message is optional on the wire.
                let message = if buf.remaining() == 0 {
                    None
                } else {
                    if buf.remaining() < 2 {
                        return Err(CodecError::Truncated);
                    }
                    let len = buf.get_u16() as usize;
                    if buf.remaining() < len {
                        return Err(CodecError::Truncated);
                    }
                    if len == 0 {
                        None
                    } else {
                        let raw = buf.copy_to_bytes(len);
                        Some(
                            std::str::from_utf8(&raw)
                                .map_err(|_| CodecError::InvalidFrame("message is not utf-8"))?
                                .to_string(),
                        )
                    }
                };
                match opcode {
                    Opcode::Ack => Ok(Frame::Ack {
                        schema,
                        reason,
                        message,
                    }),
                    _ => Ok(Frame::Nack {
                        schema,
                        reason,
                        message,
                    }),
                }
            }
        }
    }
}

fn decode_u32_block(buf: &mut &[u8]) -> Result<Vec<u8>, CodecError> {
    if buf.remaining() < 4 {
        return Err(CodecError::Truncated);
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(CodecError::Truncated);
    }
    let mut out = vec![0_u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

/// Encodes a query result set: u32 record count, then `u32 len, bytes` per
/// record. Carried as the payload of an ACCEPT response to QUERY.
pub fn encode_record_list(records: &[Vec<u8>]) -> Result<Vec<u8>, CodecError> {
    if records.len() > u32::MAX as usize {
        return Err(CodecError::InvalidFrame("record count exceeds u32"));
    }
    let total: usize = records.iter().map(|r| 4 + r.len()).sum();
    let mut out = Vec::with_capacity(4 + total);
    out.put_u32(records.len() as u32);
    for record in records {
        if record.len() > u32::MAX as usize {
            return Err(CodecError::InvalidFrame("record exceeds u32 length"));
        }
        out.put_u32(record.len() as u32);
        out.put_slice(record);
    }
    Ok(out)
}

/// Decodes a query result set encoded by [`encode_record_list`].
pub fn decode_record_list(mut buf: &[u8]) -> Result<Vec<Vec<u8>>, CodecError> {
    if buf.remaining() < 4 {
        return Err(CodecError::Truncated);
    }
    let count = buf.get_u32() as usize;
    let mut records = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        records.push(decode_u32_block(&mut buf)?);
    }
    if buf.has_remaining() {
        return Err(CodecError::InvalidFrame("trailing bytes after record list"));
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::{
        decode_record_list, encode_record_list, Frame, Opcode, ReasonCode, ResponseCode,
        MAX_SCHEMA_NAME_LEN,
    };
    use sdx_core::SchemaId;

    fn round_trip(frame: Frame) {
        let encoded = frame.encode().expect("frame should encode");
        let mut slice = encoded.as_slice();
        let decoded = Frame::decode(&mut slice).expect("frame should decode");
        assert_eq!(decoded, frame);
        assert!(slice.is_empty(), "decode should consume the whole frame");
    }

    #[test]
    fn all_frames_round_trip() {
        round_trip(Frame::Request {
            schema: SchemaId::from("OMM"),
            cid: "bafkreigh2akiscaildc".to_string(),
        });
        round_trip(Frame::Push {
            schema: SchemaId::from("CDM"),
            payload: vec![1, 2, 3, 4],
        });
        round_trip(Frame::Query {
            schema: SchemaId::from("CAT"),
            query: br#"{"limit":10}"#.to_vec(),
        });
        round_trip(Frame::Response {
            schema: SchemaId::from("OMM"),
            code: ResponseCode::Accept,
            payload: vec![0xAA; 32],
        });
        round_trip(Frame::Ack {
            schema: SchemaId::from("OMM"),
            reason: ReasonCode::None,
            message: None,
        });
        round_trip(Frame::Nack {
            schema: SchemaId::from("OMM"),
            reason: ReasonCode::NotFound,
            message: Some("no such record".to_string()),
        });
    }

    #[test]
    fn zero_byte_push_round_trips() {
        round_trip(Frame::Push {
            schema: SchemaId::from("OMM"),
            payload: Vec::new(),
        });
    }

    #[test]
    fn maximum_schema_name_length_is_accepted() {
        let name = "s".repeat(MAX_SCHEMA_NAME_LEN);
        round_trip(Frame::Request {
            schema: SchemaId::new(name),
            cid: "b".to_string(),
        });
    }

    #[test]
    fn oversized_schema_name_is_rejected_at_encode() {
        let name = "s".repeat(MAX_SCHEMA_NAME_LEN + 1);
        let frame = Frame::Request {
            schema: SchemaId::new(name),
            cid: "b".to_string(),
        };
        assert!(frame.encode().is_err());
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let mut raw: &[u8] = &[9, 0, 0];
        assert!(Frame::decode(&mut raw).is_err());
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let frame = Frame::Push {
            schema: SchemaId::from("OMM"),
            payload: vec![1, 2, 3],
        };
        let encoded = frame.encode().expect("frame should encode");
        for cut in 0..encoded.len() {
            let mut slice = &encoded[..cut];
            assert!(Frame::decode(&mut slice).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn nack_without_trailing_message_decodes() {
        // opcode, schema len 0, reason byte only: the message block is optional.
        let mut raw: &[u8] = &[6, 0, 0, 3];
        let decoded = Frame::decode(&mut raw).expect("short nack should decode");
        assert_eq!(
            decoded,
            Frame::Nack {
                schema: SchemaId::from(""),
                reason: ReasonCode::NotFound,
                message: None,
            }
        );
    }

    #[test]
    fn record_list_round_trip() {
        let records = vec![vec![1_u8, 2, 3], Vec::new(), vec![9; 100]];
        let encoded = encode_record_list(&records).expect("list should encode");
        let decoded = decode_record_list(&encoded).expect("list should decode");
        assert_eq!(decoded, records);
    }

    #[test]
    fn record_list_rejects_trailing_bytes() {
        let mut encoded = encode_record_list(&[vec![1_u8]]).expect("list should encode");
        encoded.push(0xFF);
        assert!(decode_record_list(&encoded).is_err());
    }
}
