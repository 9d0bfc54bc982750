//! Request dispatch.
//!
//! Maps a decoded request header to a response body. Dispatch is a pure
//! function of the header: no I/O, no shared state.
//!
//! ## ApiVersions body encoding
//!
//! ```text
//! v0:    [i16 error_code][i32 N]{N x [i16 key][i16 min][i16 max]}
//! v1-v2: v0 followed by [i32 throttle_time_ms]
//! v3-v4: [i16 error_code][uvarint N+1]{N x [i16 key][i16 min][i16 max][u8 tags]}
//!        [i32 throttle_time_ms][u8 tags]
//! ```

use super::codec::RequestHeader;
use super::{api_key, error_code, supported_range, SUPPORTED_APIS};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// First ApiVersions version using compact arrays and tagged fields.
const FIRST_FLEXIBLE_VERSION: u16 = 3;

/// Requests the dispatcher refuses to answer with a regular body.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    #[error("unsupported api key {0}")]
    UnsupportedApiKey(u16),

    #[error("unsupported version {api_version} for api key {api_key}")]
    UnsupportedApiVersion { api_key: u16, api_version: u16 },
}

impl DispatchError {
    /// Protocol error code reported to the client.
    pub fn error_code(&self) -> i16 {
        match self {
            DispatchError::UnsupportedApiKey(_) => error_code::UNSUPPORTED_VERSION,
            DispatchError::UnsupportedApiVersion { .. } => error_code::UNSUPPORTED_VERSION,
        }
    }
}

/// Build the response body for a request.
pub fn dispatch(header: &RequestHeader) -> Result<Bytes, DispatchError> {
    let range = supported_range(header.api_key)
        .ok_or(DispatchError::UnsupportedApiKey(header.api_key))?;

    if !range.contains(header.api_version) {
        return Err(DispatchError::UnsupportedApiVersion {
            api_key: header.api_key,
            api_version: header.api_version,
        });
    }

    match range.api_key {
        api_key::API_VERSIONS => Ok(api_versions_body(header.api_version, error_code::NONE)),
        _ => Err(DispatchError::UnsupportedApiKey(header.api_key)),
    }
}

/// Body sent in place of a regular response when dispatch fails.
///
/// An ApiVersions request at too high a version gets the v0 layout with
/// the full API list, so the client can pick a version and retry.
pub fn error_body(err: &DispatchError) -> Bytes {
    match err {
        DispatchError::UnsupportedApiVersion { api_key: key, .. }
            if *key == api_key::API_VERSIONS as u16 =>
        {
            api_versions_body(0, err.error_code())
        }
        _ => error_code_body(err.error_code()),
    }
}

/// A body holding nothing but an error code.
pub fn error_code_body(code: i16) -> Bytes {
    let mut buf = BytesMut::with_capacity(2);
    buf.put_i16(code);
    buf.freeze()
}

fn api_versions_body(version: u16, error_code: i16) -> Bytes {
    let flexible = version >= FIRST_FLEXIBLE_VERSION;
    let mut buf = BytesMut::with_capacity(16 + SUPPORTED_APIS.len() * 7);

    buf.put_i16(error_code);

    if flexible {
        put_unsigned_varint(&mut buf, SUPPORTED_APIS.len() as u32 + 1);
    } else {
        buf.put_i32(SUPPORTED_APIS.len() as i32);
    }

    for range in SUPPORTED_APIS {
        buf.put_i16(range.api_key);
        buf.put_i16(range.min_version);
        buf.put_i16(range.max_version);
        if flexible {
            buf.put_u8(0); // tagged fields
        }
    }

    if version >= 1 {
        buf.put_i32(0); // throttle_time_ms
    }

    if flexible {
        buf.put_u8(0); // tagged fields
    }

    buf.freeze()
}

fn put_unsigned_varint(buf: &mut BytesMut, mut value: u32) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}
