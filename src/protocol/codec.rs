//! Frame codec for the Kafka wire protocol.
//!
//! Decodes the fixed-position request header and encodes response frames.
//! All multi-byte integers are big-endian; clients speaking the real
//! protocol depend on it.
//!
//! Only whole frames are decoded: a frame whose declared length exceeds
//! the bytes handed to the decoder is malformed. Reassembly of frames
//! split across reads is not supported.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the `u32` length prefix.
pub const LENGTH_FIELD_SIZE: usize = 4;

/// Length prefix plus api_key, api_version and correlation_id.
pub const REQUEST_HEADER_SIZE: usize = 12;

/// The request body starts right after the fixed header.
pub const BODY_OFFSET: usize = REQUEST_HEADER_SIZE;

/// Smallest legal value of a request's length field
/// (api_key + api_version + correlation_id).
pub const MIN_REQUEST_LENGTH: u32 = 8;

const CORRELATION_ID_SIZE: usize = 4;

/// Malformed frame conditions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("malformed frame: need 12 header bytes, got {available}")]
    HeaderTooShort { available: usize },

    #[error("malformed frame: declared length {length} is below the 8 byte minimum")]
    LengthTooSmall { length: u32 },

    #[error("malformed frame: declared {declared} bytes but only {available} arrived")]
    Truncated { declared: usize, available: usize },

    #[error("frame of {size} bytes does not fit a u32 length field")]
    TooLarge { size: usize },
}

/// Fixed-position fields at the start of every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    /// Byte count of everything after the length field.
    pub length: u32,
    pub api_key: u16,
    pub api_version: u16,
    pub correlation_id: i32,
}

impl RequestHeader {
    /// Decode the header from the first 12 bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < REQUEST_HEADER_SIZE {
            return Err(FrameError::HeaderTooShort {
                available: buf.len(),
            });
        }

        let mut cursor = &buf[..REQUEST_HEADER_SIZE];
        let header = RequestHeader {
            length: cursor.get_u32(),
            api_key: cursor.get_u16(),
            api_version: cursor.get_u16(),
            correlation_id: cursor.get_i32(),
        };

        if header.length < MIN_REQUEST_LENGTH {
            return Err(FrameError::LengthTooSmall {
                length: header.length,
            });
        }

        Ok(header)
    }

    /// Write the 12 header bytes back out, exactly as they were decoded.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(REQUEST_HEADER_SIZE);
        dst.put_u32(self.length);
        dst.put_u16(self.api_key);
        dst.put_u16(self.api_version);
        dst.put_i32(self.correlation_id);
    }

    /// Number of body bytes the header declares.
    pub fn body_len(&self) -> usize {
        self.length.saturating_sub(MIN_REQUEST_LENGTH) as usize
    }

    /// Total frame size on the wire, length prefix included.
    pub fn frame_len(&self) -> usize {
        LENGTH_FIELD_SIZE.saturating_add(self.length as usize)
    }
}

/// Decode a complete request frame, returning the header and its body.
///
/// Bytes past the end of the declared frame are not part of the result.
pub fn decode_request(buf: &[u8]) -> Result<(RequestHeader, &[u8]), FrameError> {
    let header = RequestHeader::decode(buf)?;
    let frame_len = header.frame_len();

    if buf.len() < frame_len {
        return Err(FrameError::Truncated {
            declared: frame_len,
            available: buf.len(),
        });
    }

    Ok((header, &buf[BODY_OFFSET..frame_len]))
}

/// Best-effort correlation id for answering a request that failed to decode.
///
/// Returns zero when the bytes never arrived.
pub fn peek_correlation_id(buf: &[u8]) -> i32 {
    match buf.get(8..REQUEST_HEADER_SIZE) {
        Some(mut bytes) => bytes.get_i32(),
        None => 0,
    }
}

/// Value of a length field covering `fixed` header bytes plus `body`.
fn length_field(fixed: usize, body: &[u8]) -> Result<u32, FrameError> {
    let size = fixed.saturating_add(body.len());
    u32::try_from(size).map_err(|_| FrameError::TooLarge { size })
}

/// Encode a response frame: `[u32 length][i32 correlation_id][body]`.
pub fn encode_response(correlation_id: i32, body: &[u8]) -> Result<Bytes, FrameError> {
    let length = length_field(CORRELATION_ID_SIZE, body)?;

    let mut buf = BytesMut::with_capacity(LENGTH_FIELD_SIZE + length as usize);
    buf.put_u32(length);
    buf.put_i32(correlation_id);
    buf.put_slice(body);
    Ok(buf.freeze())
}

/// Encode a request frame, the client side of `decode_request`.
pub fn encode_request(
    api_key: u16,
    api_version: u16,
    correlation_id: i32,
    body: &[u8],
) -> Result<Bytes, FrameError> {
    let header = RequestHeader {
        length: length_field(MIN_REQUEST_LENGTH as usize, body)?,
        api_key,
        api_version,
        correlation_id,
    };

    let mut buf = BytesMut::with_capacity(header.frame_len());
    header.encode(&mut buf);
    buf.put_slice(body);
    Ok(buf.freeze())
}

/// Decode the nullable `client_id` string that opens the body of
/// version 1+ request headers.
///
/// Returns `None` for a null id or when the bytes don't form one.
pub fn client_id(body: &[u8]) -> Option<&str> {
    let mut cursor = body;
    if cursor.remaining() < 2 {
        return None;
    }

    let len = cursor.get_i16();
    if len < 0 || cursor.remaining() < len as usize {
        return None;
    }

    std::str::from_utf8(&cursor[..len as usize]).ok()
}
