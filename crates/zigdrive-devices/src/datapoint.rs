/*!
 * Tuya datapoint codec.
 *
 * Tuya devices multiplex most of their functions as datapoints over the
 * manufacturer-specific cluster 0xEF00. A frame is a 2-byte sequence number
 * followed by records of `{id:1, type:1, length:2 BE, value:length}`.
 *
 * The codec is stateless. Decoding never fails outright: a damaged record
 * stops the decode and the datapoints parsed before it are kept.
 */
use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Tuya cluster command identifiers
pub mod command {
    /// Hub → device datapoint write
    pub const DATA_REQUEST: u8 = 0x00;
    /// Device → hub answer to a request
    pub const DATA_RESPONSE: u8 = 0x01;
    /// Device → hub unsolicited report
    pub const DATA_REPORT: u8 = 0x02;

    /// Whether an inbound command carries a datapoint frame
    pub fn carries_datapoints(command: u8) -> bool {
        matches!(command, DATA_RESPONSE | DATA_REPORT)
    }
}

const SEQUENCE_LEN: usize = 2;
const RECORD_HEADER_LEN: usize = 4;

/// Errors found while decoding or encoding a datapoint frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The buffer ended inside a header or value
    #[error("Truncated frame at offset {offset}: need {needed} bytes, {available} left")]
    Truncated {
        /// Offset of the damaged record
        offset: usize,
        /// Bytes the record declared
        needed: usize,
        /// Bytes actually left
        available: usize,
    },

    /// A record carried a type tag outside the known set
    #[error("Unknown datapoint type {tag:#04x} at offset {offset}")]
    UnknownType {
        /// Offset of the damaged record
        offset: usize,
        /// Offending tag
        tag: u8,
    },

    /// A value has the wrong length for its type
    #[error("Datapoint {id} of type {kind} has invalid length {len}")]
    InvalidPayload {
        /// Datapoint id
        id: u8,
        /// Declared type
        kind: DatapointType,
        /// Payload length
        len: usize,
    },

    /// A value does not fit the 16-bit length field
    #[error("Datapoint {id} payload of {len} bytes is too large")]
    Oversized {
        /// Datapoint id
        id: u8,
        /// Payload length
        len: usize,
    },
}

/// Datapoint type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DatapointType {
    /// Opaque bytes
    Raw = 0x00,
    /// Single byte, 0 or 1
    Bool = 0x01,
    /// 4-byte big-endian signed integer
    Value = 0x02,
    /// UTF-8 text
    String = 0x03,
    /// Single byte index
    Enum = 0x04,
    /// 1, 2 or 4 byte bitmap
    Bitmap = 0x05,
}

impl TryFrom<u8> for DatapointType {
    type Error = u8;

    fn try_from(tag: u8) -> std::result::Result<Self, u8> {
        match tag {
            0x00 => Ok(DatapointType::Raw),
            0x01 => Ok(DatapointType::Bool),
            0x02 => Ok(DatapointType::Value),
            0x03 => Ok(DatapointType::String),
            0x04 => Ok(DatapointType::Enum),
            0x05 => Ok(DatapointType::Bitmap),
            other => Err(other),
        }
    }
}

impl fmt::Display for DatapointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DatapointType::Raw => "raw",
            DatapointType::Bool => "bool",
            DatapointType::Value => "value",
            DatapointType::String => "string",
            DatapointType::Enum => "enum",
            DatapointType::Bitmap => "bitmap",
        };
        f.write_str(name)
    }
}

/// Interpreted datapoint value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatapointValue {
    /// Passed through uninterpreted
    Raw(Bytes),
    /// Boolean
    Bool(bool),
    /// Signed integer, unscaled
    Value(i32),
    /// Text
    String(String),
    /// Enum index
    Enum(u8),
    /// Passed through uninterpreted
    Bitmap(Bytes),
}

/// One datapoint record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datapoint {
    /// Datapoint id, meaning is per model
    pub id: u8,
    /// Type tag
    pub kind: DatapointType,
    /// Value bytes as sent on the wire
    pub payload: Bytes,
}

impl Datapoint {
    /// Create a datapoint from raw parts
    pub fn new(id: u8, kind: DatapointType, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            kind,
            payload: payload.into(),
        }
    }

    /// Boolean datapoint
    pub fn bool(id: u8, value: bool) -> Self {
        Self::new(id, DatapointType::Bool, vec![value as u8])
    }

    /// Integer datapoint
    pub fn value(id: u8, value: i32) -> Self {
        Self::new(id, DatapointType::Value, value.to_be_bytes().to_vec())
    }

    /// Enum datapoint
    pub fn enumeration(id: u8, index: u8) -> Self {
        Self::new(id, DatapointType::Enum, vec![index])
    }

    /// Text datapoint
    pub fn string(id: u8, value: &str) -> Self {
        Self::new(id, DatapointType::String, value.as_bytes().to_vec())
    }

    /// Interpret the payload according to the type tag
    pub fn decode_value(&self) -> std::result::Result<DatapointValue, FrameError> {
        let invalid = || FrameError::InvalidPayload {
            id: self.id,
            kind: self.kind,
            len: self.payload.len(),
        };
        let mut payload = self.payload.clone();

        match self.kind {
            DatapointType::Raw => Ok(DatapointValue::Raw(payload)),
            DatapointType::Bitmap => Ok(DatapointValue::Bitmap(payload)),
            DatapointType::Bool if payload.len() == 1 => Ok(DatapointValue::Bool(payload.get_u8() != 0)),
            DatapointType::Enum if payload.len() == 1 => Ok(DatapointValue::Enum(payload.get_u8())),
            DatapointType::Value if payload.len() == 4 => Ok(DatapointValue::Value(payload.get_i32())),
            DatapointType::String => String::from_utf8(payload.to_vec())
                .map(DatapointValue::String)
                .map_err(|_| invalid()),
            _ => Err(invalid()),
        }
    }
}

/// A batch of datapoints sharing one sequence number
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatapointFrame {
    /// Sequence number
    pub sequence: u16,
    /// Datapoints in order of appearance
    pub datapoints: Vec<Datapoint>,
}

impl DatapointFrame {
    /// Create an empty frame
    pub fn new(sequence: u16) -> Self {
        Self {
            sequence,
            datapoints: Vec::new(),
        }
    }

    /// Builder-style helper appending a datapoint
    pub fn with(mut self, datapoint: Datapoint) -> Self {
        self.datapoints.push(datapoint);
        self
    }
}

/// Result of decoding a buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    /// Every complete datapoint before the first damaged record
    pub frame: DatapointFrame,
    /// Why decoding stopped early, if it did
    pub error: Option<FrameError>,
}

/// Stateless datapoint frame codec
#[derive(Debug, Clone, Copy, Default)]
pub struct DatapointCodec;

impl DatapointCodec {
    /// Decode a frame, keeping the longest valid prefix of records
    pub fn decode(buf: &[u8]) -> Decoded {
        let mut frame = DatapointFrame::default();
        let mut cursor = buf;

        if cursor.remaining() < SEQUENCE_LEN {
            return Decoded {
                frame,
                error: Some(FrameError::Truncated {
                    offset: 0,
                    needed: SEQUENCE_LEN,
                    available: cursor.remaining(),
                }),
            };
        }
        frame.sequence = cursor.get_u16();

        while cursor.has_remaining() {
            let offset = buf.len() - cursor.remaining();
            if cursor.remaining() < RECORD_HEADER_LEN {
                return Decoded {
                    frame,
                    error: Some(FrameError::Truncated {
                        offset,
                        needed: RECORD_HEADER_LEN,
                        available: cursor.remaining(),
                    }),
                };
            }

            let id = cursor.get_u8();
            let tag = cursor.get_u8();
            let len = cursor.get_u16() as usize;

            let kind = match DatapointType::try_from(tag) {
                Ok(kind) => kind,
                Err(tag) => {
                    return Decoded {
                        frame,
                        error: Some(FrameError::UnknownType { offset, tag }),
                    }
                }
            };
            if len > cursor.remaining() {
                return Decoded {
                    frame,
                    error: Some(FrameError::Truncated {
                        offset,
                        needed: len,
                        available: cursor.remaining(),
                    }),
                };
            }

            let payload = Bytes::copy_from_slice(&cursor[..len]);
            cursor.advance(len);
            frame.datapoints.push(Datapoint { id, kind, payload });
        }

        Decoded { frame, error: None }
    }

    /// Encode a frame to its wire form
    pub fn encode(frame: &DatapointFrame) -> std::result::Result<Bytes, FrameError> {
        let size = SEQUENCE_LEN
            + frame
                .datapoints
                .iter()
                .map(|dp| RECORD_HEADER_LEN + dp.payload.len())
                .sum::<usize>();
        let mut buf = BytesMut::with_capacity(size);

        buf.put_u16(frame.sequence);
        for dp in &frame.datapoints {
            let len = u16::try_from(dp.payload.len()).map_err(|_| FrameError::Oversized {
                id: dp.id,
                len: dp.payload.len(),
            })?;
            buf.put_u8(dp.id);
            buf.put_u8(dp.kind as u8);
            buf.put_u16(len);
            buf.put_slice(&dp.payload);
        }

        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DatapointFrame {
        DatapointFrame::new(0x0102)
            .with(Datapoint::bool(1, true))
            .with(Datapoint::value(2, -215))
            .with(Datapoint::enumeration(3, 2))
            .with(Datapoint::string(4, "eco"))
            .with(Datapoint::new(5, DatapointType::Bitmap, vec![0x00, 0x81]))
            .with(Datapoint::new(6, DatapointType::Raw, Vec::new()))
    }

    #[test]
    fn test_decode_reference_frame() {
        let buf = [0x00, 0x01, 0x04, 0x02, 0x00, 0x04, 0x00, 0x00, 0x00, 0x32];
        let decoded = DatapointCodec::decode(&buf);

        assert_eq!(decoded.error, None);
        assert_eq!(decoded.frame.sequence, 1);
        assert_eq!(decoded.frame.datapoints, vec![Datapoint::value(4, 50)]);
        assert_eq!(decoded.frame.datapoints[0].decode_value(), Ok(DatapointValue::Value(50)));
    }

    #[test]
    fn test_round_trip_preserves_order() {
        let frame = sample();
        let wire = DatapointCodec::encode(&frame).unwrap();
        let decoded = DatapointCodec::decode(&wire);
        assert_eq!(decoded.error, None);
        assert_eq!(decoded.frame, frame);
    }

    #[test]
    fn test_every_truncation_keeps_a_prefix() {
        let frame = sample();
        let wire = DatapointCodec::encode(&frame).unwrap();

        for cut in 0..wire.len() {
            let decoded = DatapointCodec::decode(&wire[..cut]);
            let kept = &decoded.frame.datapoints;
            assert!(kept.len() < frame.datapoints.len() || cut == wire.len());
            assert_eq!(kept.as_slice(), &frame.datapoints[..kept.len()]);
            if cut >= SEQUENCE_LEN {
                assert_eq!(decoded.frame.sequence, frame.sequence);
            }
        }
    }

    #[test]
    fn test_overlong_record_is_framing_error() {
        // second record claims 8 bytes but only 2 follow
        let buf = [
            0x00, 0x07, 0x01, 0x01, 0x00, 0x01, 0x01, 0x02, 0x02, 0x00, 0x08, 0xAA, 0xBB,
        ];
        let decoded = DatapointCodec::decode(&buf);
        assert_eq!(decoded.frame.datapoints, vec![Datapoint::bool(1, true)]);
        assert_eq!(
            decoded.error,
            Some(FrameError::Truncated {
                offset: 7,
                needed: 8,
                available: 2
            })
        );
    }

    #[test]
    fn test_unknown_type_stops_decode() {
        let buf = [0x00, 0x01, 0x01, 0x09, 0x00, 0x01, 0x00];
        let decoded = DatapointCodec::decode(&buf);
        assert!(decoded.frame.datapoints.is_empty());
        assert_eq!(decoded.error, Some(FrameError::UnknownType { offset: 2, tag: 0x09 }));
    }

    #[test]
    fn test_typed_values() {
        assert_eq!(Datapoint::bool(1, false).decode_value(), Ok(DatapointValue::Bool(false)));
        assert_eq!(Datapoint::enumeration(1, 3).decode_value(), Ok(DatapointValue::Enum(3)));
        assert_eq!(
            Datapoint::string(1, "on").decode_value(),
            Ok(DatapointValue::String("on".into()))
        );
        let short = Datapoint::new(9, DatapointType::Value, vec![0x00, 0x32]);
        assert!(matches!(short.decode_value(), Err(FrameError::InvalidPayload { id: 9, .. })));
    }

    #[test]
    fn test_oversized_payload_is_rejected() {
        let frame = DatapointFrame::new(1).with(Datapoint::new(1, DatapointType::Raw, vec![0u8; 70_000]));
        assert!(matches!(DatapointCodec::encode(&frame), Err(FrameError::Oversized { id: 1, .. })));
    }

    #[test]
    fn test_inbound_commands() {
        assert!(command::carries_datapoints(command::DATA_REPORT));
        assert!(command::carries_datapoints(command::DATA_RESPONSE));
        assert!(!command::carries_datapoints(command::DATA_REQUEST));
    }
}
