//! Wire codec for the quire sync protocol.
//!
//! Every frame is a self-describing byte buffer carrying one message. The
//! frame begins with a variable-length unsigned integer message-type tag;
//! sync frames additionally carry the target document guid so that a single
//! connection can multiplex any number of documents under one location.
//!
//! # Wire Format
//!
//! Integers are varUint encoded (7 bits per byte, MSB continuation), byte
//! arrays and strings are length-prefixed:
//!
//! - `varUint(0)`: Sync message
//!   - `varString`: document guid (`location + name`)
//!   - `varUint(0)`: SyncStep1 - contains a state vector
//!   - `varUint(1)`: SyncStep2 - contains the missing updates
//!   - `varUint(2)`: Update - contains an incremental update
//!   - payload as `varUint(length) + raw bytes`
//! - `varUint(1)`: Awareness message - opaque awareness delta blob
//! - `varUint(2)`: Auth message - `varString` reason (permission denied)
//!
//! Ping/pong rides the transport's native control frames and never appears
//! here. Decoding is total: malformed input yields a [`DecodeError`] naming
//! the offending offset, and unknown tags are reported as errors the caller
//! logs and drops without closing the connection.

use thiserror::Error;

/// Message type tags (outer envelope).
mod msg_type {
    /// Sync message (SyncStep1, SyncStep2, Update)
    pub const SYNC: u64 = 0;
    /// Awareness message
    pub const AWARENESS: u64 = 1;
    /// Auth message (read-only permission-denied notice)
    pub const AUTH: u64 = 2;
}

/// Sync sub-message tags.
mod sync_type {
    /// SyncStep1: state vector exchange
    pub const STEP1: u64 = 0;
    /// SyncStep2: missing updates answering a state vector
    pub const STEP2: u64 = 1;
    /// Update: unsolicited incremental update
    pub const UPDATE: u64 = 2;
}

/// Error raised by [`Message::decode`] on malformed or truncated input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of frame at offset {offset}")]
    UnexpectedEof { offset: usize },

    #[error("varint overflow at offset {offset}")]
    VarIntOverflow { offset: usize },

    #[error("invalid UTF-8 string at offset {offset}")]
    InvalidUtf8 { offset: usize },

    #[error("unknown message type {tag} at offset {offset}")]
    UnknownMessageType { tag: u64, offset: usize },

    #[error("unknown sync type {tag} at offset {offset}")]
    UnknownSyncType { tag: u64, offset: usize },
}

/// Cursor over an incoming frame that tracks the current byte offset so
/// errors can name the exact position of the malformed input.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn read_var_uint(&mut self) -> Result<u64, DecodeError> {
        let start = self.pos;
        let mut num: u64 = 0;
        let mut shift = 0;
        loop {
            let byte = *self
                .buf
                .get(self.pos)
                .ok_or(DecodeError::UnexpectedEof { offset: self.pos })?;
            self.pos += 1;
            num |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(num);
            }
            shift += 7;
            if shift > 63 {
                return Err(DecodeError::VarIntOverflow { offset: start });
            }
        }
    }

    pub(crate) fn read_var_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_var_uint()? as usize;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or(DecodeError::UnexpectedEof { offset: self.pos })?;
        let bytes = self.buf[self.pos..end].to_vec();
        self.pos = end;
        Ok(bytes)
    }

    pub(crate) fn read_var_string(&mut self) -> Result<String, DecodeError> {
        let start = self.pos;
        let bytes = self.read_var_bytes()?;
        String::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8 { offset: start })
    }
}

/// Write a variable-length unsigned integer to a buffer.
pub(crate) fn write_var_uint(buf: &mut Vec<u8>, mut num: u64) {
    loop {
        let mut byte = (num & 0x7F) as u8;
        num >>= 7;
        if num > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if num == 0 {
            break;
        }
    }
}

/// Write a byte array with varUint length prefix.
pub(crate) fn write_var_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    write_var_uint(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

/// Write a UTF-8 string with varUint length prefix.
pub(crate) fn write_var_string(buf: &mut Vec<u8>, s: &str) {
    write_var_bytes(buf, s.as_bytes());
}

/// Sync sub-message carried inside a [`Message::Sync`] frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncPayload {
    /// State vector announcing what the sender has seen.
    Step1(Vec<u8>),
    /// Update diff answering a previously received state vector.
    Step2(Vec<u8>),
    /// Unsolicited incremental update.
    Update(Vec<u8>),
}

impl SyncPayload {
    fn tag(&self) -> u64 {
        match self {
            SyncPayload::Step1(_) => sync_type::STEP1,
            SyncPayload::Step2(_) => sync_type::STEP2,
            SyncPayload::Update(_) => sync_type::UPDATE,
        }
    }

    fn body(&self) -> &[u8] {
        match self {
            SyncPayload::Step1(b) | SyncPayload::Step2(b) | SyncPayload::Update(b) => b,
        }
    }
}

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Sync traffic for one document, addressed by guid.
    Sync { guid: String, payload: SyncPayload },
    /// Opaque awareness delta blob.
    Awareness(Vec<u8>),
    /// Permission-denied notice. Read-only; quire never originates these.
    Auth { reason: String },
}

impl Message {
    /// Encode the message to a byte frame.
    ///
    /// Encoding is deterministic and produces no padding, so a frame of one
    /// byte or less is guaranteed to carry no content (see [`has_content`]).
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Message::Sync { guid, payload } => {
                let body = payload.body();
                let mut buf = Vec::with_capacity(guid.len() + body.len() + 12);
                write_var_uint(&mut buf, msg_type::SYNC);
                write_var_string(&mut buf, guid);
                write_var_uint(&mut buf, payload.tag());
                write_var_bytes(&mut buf, body);
                buf
            }
            Message::Awareness(update) => {
                let mut buf = Vec::with_capacity(update.len() + 6);
                write_var_uint(&mut buf, msg_type::AWARENESS);
                write_var_bytes(&mut buf, update);
                buf
            }
            Message::Auth { reason } => {
                let mut buf = Vec::with_capacity(reason.len() + 6);
                write_var_uint(&mut buf, msg_type::AUTH);
                write_var_string(&mut buf, reason);
                buf
            }
        }
    }

    /// Decode one message from a byte frame.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(data);
        let tag_offset = reader.pos;
        let tag = reader.read_var_uint()?;
        match tag {
            msg_type::SYNC => {
                let guid = reader.read_var_string()?;
                let sub_offset = reader.pos;
                let sub_tag = reader.read_var_uint()?;
                let body = reader.read_var_bytes()?;
                let payload = match sub_tag {
                    sync_type::STEP1 => SyncPayload::Step1(body),
                    sync_type::STEP2 => SyncPayload::Step2(body),
                    sync_type::UPDATE => SyncPayload::Update(body),
                    other => {
                        return Err(DecodeError::UnknownSyncType {
                            tag: other,
                            offset: sub_offset,
                        });
                    }
                };
                Ok(Message::Sync { guid, payload })
            }
            msg_type::AWARENESS => Ok(Message::Awareness(reader.read_var_bytes()?)),
            msg_type::AUTH => Ok(Message::Auth {
                reason: reader.read_var_string()?,
            }),
            other => Err(DecodeError::UnknownMessageType {
                tag: other,
                offset: tag_offset,
            }),
        }
    }
}

/// Fast emptiness test used to elide sending reply frames.
///
/// A frame of one byte or less holds at most a bare type tag and therefore
/// no content worth transmitting.
pub fn has_content(frame: &[u8]) -> bool {
    frame.len() > 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_step1_round_trip() {
        let msg = Message::Sync {
            guid: "/data/wikibaseDoc".to_string(),
            payload: SyncPayload::Step1(vec![1, 2, 3, 4]),
        };
        let encoded = msg.encode();
        assert_eq!(Message::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_sync_step2_round_trip() {
        let msg = Message::Sync {
            guid: "/data/wikinotes".to_string(),
            payload: SyncPayload::Step2(vec![5, 6, 7, 8]),
        };
        let encoded = msg.encode();
        assert_eq!(Message::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_sync_update_round_trip() {
        let msg = Message::Sync {
            guid: "locdoc".to_string(),
            payload: SyncPayload::Update(vec![9, 10, 11, 12]),
        };
        let encoded = msg.encode();
        assert_eq!(Message::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_awareness_round_trip() {
        let msg = Message::Awareness(vec![0, 42, 99]);
        let encoded = msg.encode();
        assert_eq!(encoded[0], 1);
        assert_eq!(Message::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_auth_round_trip() {
        let msg = Message::Auth {
            reason: "read only".to_string(),
        };
        let encoded = msg.encode();
        assert_eq!(encoded[0], 2);
        assert_eq!(Message::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_empty_payloads_round_trip() {
        let msg = Message::Sync {
            guid: String::new(),
            payload: SyncPayload::Step1(Vec::new()),
        };
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_unknown_message_type() {
        // Tag 7 is unassigned
        let err = Message::decode(&[7, 0, 0]).unwrap_err();
        assert_eq!(err, DecodeError::UnknownMessageType { tag: 7, offset: 0 });
    }

    #[test]
    fn test_unknown_sync_type() {
        let mut buf = Vec::new();
        write_var_uint(&mut buf, 0);
        write_var_string(&mut buf, "g");
        write_var_uint(&mut buf, 9);
        write_var_bytes(&mut buf, &[1]);
        let err = Message::decode(&buf).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownSyncType { tag: 9, .. }));
    }

    #[test]
    fn test_truncated_frame_names_offset() {
        let msg = Message::Sync {
            guid: "location/doc".to_string(),
            payload: SyncPayload::Update(vec![1, 2, 3]),
        };
        let encoded = msg.encode();
        // Cut the frame mid-payload; the error points into the truncated tail
        let err = Message::decode(&encoded[..encoded.len() - 2]).unwrap_err();
        assert!(matches!(err, DecodeError::UnexpectedEof { .. }));
    }

    #[test]
    fn test_empty_input() {
        let err = Message::decode(&[]).unwrap_err();
        assert_eq!(err, DecodeError::UnexpectedEof { offset: 0 });
    }

    #[test]
    fn test_varint_overflow() {
        // Eleven continuation bytes exceeds 64 bits
        let buf = vec![0xFF; 11];
        let err = Message::decode(&buf).unwrap_err();
        assert_eq!(err, DecodeError::VarIntOverflow { offset: 0 });
    }

    #[test]
    fn test_invalid_utf8_guid() {
        let mut buf = Vec::new();
        write_var_uint(&mut buf, 0);
        write_var_bytes(&mut buf, &[0xFF, 0xFE]);
        let err = Message::decode(&buf).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidUtf8 { offset: 1 }));
    }

    #[test]
    fn test_large_varint_round_trip() {
        let mut buf = Vec::new();
        write_var_uint(&mut buf, u64::MAX);
        let mut reader = Reader::new(&buf);
        assert_eq!(reader.read_var_uint().unwrap(), u64::MAX);
    }

    #[test]
    fn test_has_content() {
        assert!(!has_content(&[]));
        assert!(!has_content(&[0]));
        assert!(has_content(&[0, 0]));
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let msg = Message::Sync {
            guid: "abc".to_string(),
            payload: SyncPayload::Step2(vec![1, 2, 3]),
        };
        assert_eq!(msg.encode(), msg.encode());
    }
}
