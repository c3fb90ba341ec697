use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{BufMut, Bytes, BytesMut};

use super::error::ProtocolError;
use super::types::{ConnectionId, EncryptionLevel, StatelessResetToken, STATELESS_RESET_TOKEN_LENGTH};

/// Length of the PATH_CHALLENGE / PATH_RESPONSE payload
pub const PATH_CHALLENGE_DATA_LEN: usize = 8;

/// Number of frame types this crate decodes
pub const FRAME_TYPE_COUNT: usize = 11;

/// QUIC frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Padding = 0x00,
    Ping = 0x01,
    Ack = 0x02,
    Crypto = 0x06,
    Stream = 0x08,
    NewConnectionId = 0x18,
    RetireConnectionId = 0x19,
    PathChallenge = 0x1a,
    PathResponse = 0x1b,
    ConnectionClose = 0x1c,
    HandshakeDone = 0x1e,
}

impl FrameType {
    pub const ALL: [FrameType; FRAME_TYPE_COUNT] = [
        FrameType::Padding,
        FrameType::Ping,
        FrameType::Ack,
        FrameType::Crypto,
        FrameType::Stream,
        FrameType::NewConnectionId,
        FrameType::RetireConnectionId,
        FrameType::PathChallenge,
        FrameType::PathResponse,
        FrameType::ConnectionClose,
        FrameType::HandshakeDone,
    ];

    pub fn from_type(value: u64) -> Option<Self> {
        match value {
            0x00 => Some(FrameType::Padding),
            0x01 => Some(FrameType::Ping),
            0x02..=0x03 => Some(FrameType::Ack),
            0x06 => Some(FrameType::Crypto),
            0x08..=0x0f => Some(FrameType::Stream),
            0x18 => Some(FrameType::NewConnectionId),
            0x19 => Some(FrameType::RetireConnectionId),
            0x1a => Some(FrameType::PathChallenge),
            0x1b => Some(FrameType::PathResponse),
            0x1c..=0x1d => Some(FrameType::ConnectionClose),
            0x1e => Some(FrameType::HandshakeDone),
            _ => None,
        }
    }

    /// Dense index used by per-type handler tables
    pub fn index(self) -> usize {
        match self {
            FrameType::Padding => 0,
            FrameType::Ping => 1,
            FrameType::Ack => 2,
            FrameType::Crypto => 3,
            FrameType::Stream => 4,
            FrameType::NewConnectionId => 5,
            FrameType::RetireConnectionId => 6,
            FrameType::PathChallenge => 7,
            FrameType::PathResponse => 8,
            FrameType::ConnectionClose => 9,
            FrameType::HandshakeDone => 10,
        }
    }

    /// Whether the frame may appear in a packet of the given level (RFC 9000 Table 3)
    pub fn permitted_at(self, level: EncryptionLevel) -> bool {
        use EncryptionLevel::*;
        match self {
            FrameType::Padding | FrameType::Ping | FrameType::ConnectionClose => true,
            FrameType::Ack | FrameType::Crypto => level != ZeroRtt,
            FrameType::Stream
            | FrameType::NewConnectionId
            | FrameType::RetireConnectionId
            | FrameType::PathChallenge => matches!(level, ZeroRtt | OneRtt),
            FrameType::PathResponse | FrameType::HandshakeDone => level == OneRtt,
        }
    }
}

/// Identifier of an emitted frame, used to route ack/loss feedback back to
/// the generator that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(u64);

impl FrameId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        FrameId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

/// QUIC frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Padding {
        length: usize,
    },
    Ping,
    Ack {
        largest_acknowledged: u64,
        ack_delay: u64,
        first_ack_range: u64,
        /// (gap, range length) pairs following the first range
        ack_ranges: Vec<(u64, u64)>,
        ecn_counts: Option<[u64; 3]>,
    },
    Crypto {
        offset: u64,
        data: Bytes,
    },
    Stream {
        stream_id: u64,
        offset: u64,
        data: Bytes,
        fin: bool,
    },
    NewConnectionId {
        sequence_number: u64,
        retire_prior_to: u64,
        connection_id: ConnectionId,
        stateless_reset_token: StatelessResetToken,
    },
    RetireConnectionId {
        sequence_number: u64,
    },
    PathChallenge {
        data: [u8; PATH_CHALLENGE_DATA_LEN],
    },
    PathResponse {
        data: [u8; PATH_CHALLENGE_DATA_LEN],
    },
    ConnectionClose {
        error_code: u64,
        /// Present for transport closes (0x1c), absent for application closes (0x1d)
        frame_type: Option<u64>,
        reason_phrase: String,
    },
    HandshakeDone,
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Padding { .. } => FrameType::Padding,
            Frame::Ping => FrameType::Ping,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Crypto { .. } => FrameType::Crypto,
            Frame::Stream { .. } => FrameType::Stream,
            Frame::NewConnectionId { .. } => FrameType::NewConnectionId,
            Frame::RetireConnectionId { .. } => FrameType::RetireConnectionId,
            Frame::PathChallenge { .. } => FrameType::PathChallenge,
            Frame::PathResponse { .. } => FrameType::PathResponse,
            Frame::ConnectionClose { .. } => FrameType::ConnectionClose,
            Frame::HandshakeDone => FrameType::HandshakeDone,
        }
    }

    /// Probing frames (RFC 9000 Section 9.1) do not prove liveness of a
    /// whole path, only of the address they arrived from
    pub fn is_probing(&self) -> bool {
        matches!(
            self.frame_type(),
            FrameType::PathChallenge | FrameType::PathResponse | FrameType::Padding | FrameType::NewConnectionId
        )
    }

    pub fn is_flow_controlled(&self) -> bool {
        self.frame_type() == FrameType::Stream
    }

    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self.frame_type(),
            FrameType::Padding | FrameType::Ack | FrameType::ConnectionClose
        )
    }

    /// Encoded size in bytes
    pub fn encoded_len(&self) -> usize {
        match self {
            Frame::Padding { length } => (*length).max(1),
            Frame::Ping | Frame::HandshakeDone => 1,
            Frame::Ack {
                largest_acknowledged,
                ack_delay,
                first_ack_range,
                ack_ranges,
                ecn_counts,
            } => {
                1 + varint_len(*largest_acknowledged)
                    + varint_len(*ack_delay)
                    + varint_len(ack_ranges.len() as u64)
                    + varint_len(*first_ack_range)
                    + ack_ranges
                        .iter()
                        .map(|(gap, len)| varint_len(*gap) + varint_len(*len))
                        .sum::<usize>()
                    + ecn_counts
                        .map(|counts| counts.iter().map(|c| varint_len(*c)).sum())
                        .unwrap_or(0)
            }
            Frame::Crypto { offset, data } => {
                1 + varint_len(*offset) + varint_len(data.len() as u64) + data.len()
            }
            Frame::Stream {
                stream_id,
                offset,
                data,
                ..
            } => {
                let offset_len = if *offset > 0 { varint_len(*offset) } else { 0 };
                1 + varint_len(*stream_id) + offset_len + varint_len(data.len() as u64) + data.len()
            }
            Frame::NewConnectionId {
                sequence_number,
                retire_prior_to,
                connection_id,
                ..
            } => {
                1 + varint_len(*sequence_number)
                    + varint_len(*retire_prior_to)
                    + 1
                    + connection_id.len()
                    + STATELESS_RESET_TOKEN_LENGTH
            }
            Frame::RetireConnectionId { sequence_number } => 1 + varint_len(*sequence_number),
            Frame::PathChallenge { .. } | Frame::PathResponse { .. } => 1 + PATH_CHALLENGE_DATA_LEN,
            Frame::ConnectionClose {
                error_code,
                frame_type,
                reason_phrase,
            } => {
                1 + varint_len(*error_code)
                    + frame_type.map(varint_len).unwrap_or(0)
                    + varint_len(reason_phrase.len() as u64)
                    + reason_phrase.len()
            }
        }
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());

        match self {
            Frame::Padding { length } => {
                buf.put_bytes(0, (*length).max(1));
            }
            Frame::Ping => buf.put_u8(FrameType::Ping as u8),
            Frame::HandshakeDone => buf.put_u8(FrameType::HandshakeDone as u8),
            Frame::Ack {
                largest_acknowledged,
                ack_delay,
                first_ack_range,
                ack_ranges,
                ecn_counts,
            } => {
                buf.put_u8(if ecn_counts.is_some() { 0x03 } else { 0x02 });
                encode_varint(&mut buf, *largest_acknowledged);
                encode_varint(&mut buf, *ack_delay);
                encode_varint(&mut buf, ack_ranges.len() as u64);
                encode_varint(&mut buf, *first_ack_range);
                for (gap, len) in ack_ranges {
                    encode_varint(&mut buf, *gap);
                    encode_varint(&mut buf, *len);
                }
                if let Some(counts) = ecn_counts {
                    for count in counts {
                        encode_varint(&mut buf, *count);
                    }
                }
            }
            Frame::Crypto { offset, data } => {
                buf.put_u8(FrameType::Crypto as u8);
                encode_varint(&mut buf, *offset);
                encode_varint(&mut buf, data.len() as u64);
                buf.extend_from_slice(data);
            }
            Frame::Stream {
                stream_id,
                offset,
                data,
                fin,
            } => {
                let mut frame_type = FrameType::Stream as u8;
                if *fin {
                    frame_type |= 0x01; // FIN bit
                }
                if *offset > 0 {
                    frame_type |= 0x04; // OFF bit
                }
                frame_type |= 0x02; // LEN bit (we always include length)

                buf.put_u8(frame_type);
                encode_varint(&mut buf, *stream_id);
                if *offset > 0 {
                    encode_varint(&mut buf, *offset);
                }
                encode_varint(&mut buf, data.len() as u64);
                buf.extend_from_slice(data);
            }
            Frame::NewConnectionId {
                sequence_number,
                retire_prior_to,
                connection_id,
                stateless_reset_token,
            } => {
                buf.put_u8(FrameType::NewConnectionId as u8);
                encode_varint(&mut buf, *sequence_number);
                encode_varint(&mut buf, *retire_prior_to);
                buf.put_u8(connection_id.len() as u8);
                buf.extend_from_slice(connection_id.as_bytes());
                buf.extend_from_slice(stateless_reset_token.as_bytes());
            }
            Frame::RetireConnectionId { sequence_number } => {
                buf.put_u8(FrameType::RetireConnectionId as u8);
                encode_varint(&mut buf, *sequence_number);
            }
            Frame::PathChallenge { data } => {
                buf.put_u8(FrameType::PathChallenge as u8);
                buf.extend_from_slice(data);
            }
            Frame::PathResponse { data } => {
                buf.put_u8(FrameType::PathResponse as u8);
                buf.extend_from_slice(data);
            }
            Frame::ConnectionClose {
                error_code,
                frame_type,
                reason_phrase,
            } => {
                buf.put_u8(if frame_type.is_some() { 0x1c } else { 0x1d });
                encode_varint(&mut buf, *error_code);
                if let Some(ft) = frame_type {
                    encode_varint(&mut buf, *ft);
                }
                encode_varint(&mut buf, reason_phrase.len() as u64);
                buf.extend_from_slice(reason_phrase.as_bytes());
            }
        }

        buf.freeze()
    }

    /// Decode one frame from the front of `data`, returning it with the
    /// number of bytes consumed
    pub fn decode(data: &[u8]) -> Result<(Self, usize), ProtocolError> {
        let mut reader = Reader::new(data);
        let type_value = reader.varint()?;
        let frame_type = FrameType::from_type(type_value).ok_or(ProtocolError::UnknownFrameType(type_value))?;

        let frame = match frame_type {
            FrameType::Padding => {
                // Coalesce consecutive padding bytes
                let mut length = 1;
                while reader.peek() == Some(0x00) {
                    reader.skip(1)?;
                    length += 1;
                }
                Frame::Padding { length }
            }
            FrameType::Ping => Frame::Ping,
            FrameType::HandshakeDone => Frame::HandshakeDone,
            FrameType::Ack => {
                let largest_acknowledged = reader.varint()?;
                let ack_delay = reader.varint()?;
                let range_count = reader.varint()?;
                let first_ack_range = reader.varint()?;
                if first_ack_range > largest_acknowledged {
                    return Err(ProtocolError::InvalidFrameFormat(
                        "ACK range exceeds largest acknowledged".to_string(),
                    ));
                }
                // Each range needs at least two bytes; refuse counts the buffer cannot hold
                if range_count > (reader.remaining() / 2) as u64 {
                    return Err(ProtocolError::InvalidFrameFormat("ACK range count too large".to_string()));
                }
                let mut ack_ranges = Vec::with_capacity(range_count as usize);
                for _ in 0..range_count {
                    let gap = reader.varint()?;
                    let len = reader.varint()?;
                    ack_ranges.push((gap, len));
                }
                let ecn_counts = if type_value == 0x03 {
                    Some([reader.varint()?, reader.varint()?, reader.varint()?])
                } else {
                    None
                };
                Frame::Ack {
                    largest_acknowledged,
                    ack_delay,
                    first_ack_range,
                    ack_ranges,
                    ecn_counts,
                }
            }
            FrameType::Crypto => {
                let offset = reader.varint()?;
                let length = reader.varint()? as usize;
                let data = Bytes::copy_from_slice(reader.take(length)?);
                Frame::Crypto { offset, data }
            }
            FrameType::Stream => {
                let has_offset = (type_value & 0x04) != 0;
                let has_length = (type_value & 0x02) != 0;
                let fin = (type_value & 0x01) != 0;

                let stream_id = reader.varint()?;
                let offset = if has_offset { reader.varint()? } else { 0 };
                let data = if has_length {
                    let length = reader.varint()? as usize;
                    Bytes::copy_from_slice(reader.take(length)?)
                } else {
                    // Use all remaining data
                    Bytes::copy_from_slice(reader.take(reader.remaining())?)
                };
                Frame::Stream {
                    stream_id,
                    offset,
                    data,
                    fin,
                }
            }
            FrameType::NewConnectionId => {
                let sequence_number = reader.varint()?;
                let retire_prior_to = reader.varint()?;
                if retire_prior_to > sequence_number {
                    return Err(ProtocolError::InvalidFrameFormat(
                        "retire_prior_to greater than sequence number".to_string(),
                    ));
                }
                let cid_len = reader.u8()? as usize;
                let connection_id = ConnectionId::from_slice(reader.take(cid_len)?)?;
                let token_bytes = reader.take(STATELESS_RESET_TOKEN_LENGTH)?;
                let stateless_reset_token = StatelessResetToken::from_slice(token_bytes)
                    .ok_or_else(|| ProtocolError::InvalidFrameFormat("bad reset token".to_string()))?;
                Frame::NewConnectionId {
                    sequence_number,
                    retire_prior_to,
                    connection_id,
                    stateless_reset_token,
                }
            }
            FrameType::RetireConnectionId => Frame::RetireConnectionId {
                sequence_number: reader.varint()?,
            },
            FrameType::PathChallenge => Frame::PathChallenge {
                data: reader.array()?,
            },
            FrameType::PathResponse => Frame::PathResponse {
                data: reader.array()?,
            },
            FrameType::ConnectionClose => {
                let error_code = reader.varint()?;
                let frame_type = if type_value == 0x1c { Some(reader.varint()?) } else { None };
                let length = reader.varint()? as usize;
                let reason_phrase = String::from_utf8_lossy(reader.take(length)?).into_owned();
                Frame::ConnectionClose {
                    error_code,
                    frame_type,
                    reason_phrase,
                }
            }
        };

        Ok((frame, reader.position()))
    }
}

/// Decodes frames out of a packet payload. Injected into the dispatcher so
/// the wire codec can be replaced independently of frame routing.
pub trait FrameFactory: Send {
    fn create(&self, buf: &[u8]) -> Result<(Frame, usize), ProtocolError>;
}

/// Frame factory over the RFC 9000 wire format
#[derive(Debug, Default, Clone, Copy)]
pub struct WireFrameFactory;

impl FrameFactory for WireFrameFactory {
    fn create(&self, buf: &[u8]) -> Result<(Frame, usize), ProtocolError> {
        Frame::decode(buf)
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < len {
            return Err(ProtocolError::Truncated {
                needed: len,
                available: self.remaining(),
            });
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn skip(&mut self, len: usize) -> Result<(), ProtocolError> {
        self.take(len).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn varint(&mut self) -> Result<u64, ProtocolError> {
        let (value, consumed) = decode_varint(&self.data[self.pos..])?;
        self.pos += consumed;
        Ok(value)
    }
}

// QUIC variable-length integer encoding/decoding
fn varint_len(value: u64) -> usize {
    if value < 1 << 6 {
        1
    } else if value < 1 << 14 {
        2
    } else if value < 1 << 30 {
        4
    } else {
        8
    }
}

fn encode_varint(buf: &mut BytesMut, value: u64) {
    match varint_len(value) {
        1 => buf.put_u8(value as u8),
        2 => buf.put_u16(0x4000 | value as u16),
        4 => buf.put_u32(0x8000_0000 | value as u32),
        _ => buf.put_u64(0xc000_0000_0000_0000 | value),
    }
}

fn decode_varint(data: &[u8]) -> Result<(u64, usize), ProtocolError> {
    let first_byte = *data.first().ok_or(ProtocolError::Truncated {
        needed: 1,
        available: 0,
    })?;
    let len = 1usize << (first_byte >> 6);
    if data.len() < len {
        return Err(ProtocolError::Truncated {
            needed: len,
            available: data.len(),
        });
    }

    let mut value = (first_byte & 0x3f) as u64;
    for byte in &data[1..len] {
        value = (value << 8) | *byte as u64;
    }
    Ok((value, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_boundaries() {
        for value in [0u64, 63, 64, 16383, 16384, (1 << 30) - 1, 1 << 30] {
            let mut buf = BytesMut::new();
            encode_varint(&mut buf, value);
            assert_eq!(buf.len(), varint_len(value));
            assert_eq!(decode_varint(&buf).unwrap(), (value, buf.len()));
        }
    }

    #[test]
    fn test_path_challenge_wire_format() {
        let frame = Frame::PathChallenge {
            data: [1, 2, 3, 4, 5, 6, 7, 8],
        };
        let encoded = frame.encode();
        assert_eq!(&encoded[..], &[0x1a, 1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(frame.encoded_len(), encoded.len());

        let (decoded, consumed) = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(consumed, 9);
    }

    #[test]
    fn test_new_connection_id_decode() {
        let frame = Frame::NewConnectionId {
            sequence_number: 3,
            retire_prior_to: 1,
            connection_id: ConnectionId::from_slice(&[0xaa; 8]).unwrap(),
            stateless_reset_token: StatelessResetToken::new([0x55; 16]),
        };
        let encoded = frame.encode();
        assert_eq!(encoded.len(), frame.encoded_len());
        assert_eq!(Frame::decode(&encoded).unwrap(), (frame, encoded.len()));
    }

    #[test]
    fn test_new_connection_id_rejects_bad_retire_prior_to() {
        let frame = Frame::NewConnectionId {
            sequence_number: 1,
            retire_prior_to: 2,
            connection_id: ConnectionId::from_slice(&[0xaa; 4]).unwrap(),
            stateless_reset_token: StatelessResetToken::new([0; 16]),
        };
        assert!(matches!(
            Frame::decode(&frame.encode()),
            Err(ProtocolError::InvalidFrameFormat(_))
        ));
    }

    #[test]
    fn test_padding_is_coalesced() {
        let (frame, consumed) = Frame::decode(&[0, 0, 0, 0, 0x01]).unwrap();
        assert_eq!(frame, Frame::Padding { length: 4 });
        assert_eq!(consumed, 4);
    }

    #[test]
    fn test_truncated_and_unknown_frames() {
        assert!(matches!(
            Frame::decode(&[0x1a, 1, 2, 3]),
            Err(ProtocolError::Truncated { needed: 8, available: 3 })
        ));
        assert_eq!(Frame::decode(&[0x21]), Err(ProtocolError::UnknownFrameType(0x21)));
        assert!(Frame::decode(&[]).is_err());
    }

    #[test]
    fn test_stream_frame_without_length_takes_rest() {
        let (frame, consumed) = Frame::decode(&[0x08, 0x04, b'a', b'b', b'c']).unwrap();
        assert_eq!(consumed, 5);
        assert!(frame.is_flow_controlled());
        match frame {
            Frame::Stream { stream_id, data, fin, .. } => {
                assert_eq!(stream_id, 4);
                assert_eq!(&data[..], b"abc");
                assert!(!fin);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_frame_classification() {
        assert!(Frame::PathChallenge { data: [0; 8] }.is_probing());
        assert!(Frame::Padding { length: 1 }.is_probing());
        assert!(!Frame::Ping.is_probing());
        assert!(!Frame::Padding { length: 3 }.is_ack_eliciting());
        assert!(Frame::RetireConnectionId { sequence_number: 0 }.is_ack_eliciting());
    }

    #[test]
    fn test_level_permissions() {
        assert!(!FrameType::PathChallenge.permitted_at(EncryptionLevel::Initial));
        assert!(FrameType::PathChallenge.permitted_at(EncryptionLevel::ZeroRtt));
        assert!(!FrameType::PathResponse.permitted_at(EncryptionLevel::ZeroRtt));
        assert!(FrameType::Ack.permitted_at(EncryptionLevel::Handshake));
        assert!(!FrameType::Ack.permitted_at(EncryptionLevel::ZeroRtt));
    }

    #[test]
    fn test_frame_ids_are_unique() {
        let a = FrameId::next();
        let b = FrameId::next();
        assert_ne!(a, b);
    }
}
