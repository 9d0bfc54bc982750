//! Kafka wire protocol implementation.
//!
//! Every frame on the wire is a big-endian `u32` length followed by that
//! many bytes. Requests carry a fixed header:
//!
//! ```text
//! Request:  [u32 length][u16 api_key][u16 api_version][i32 correlation_id][body]
//! Response: [u32 length][i32 correlation_id][body]
//! ```
//!
//! - `codec`: frame and header decode/encode
//! - `dispatch`: maps a decoded header to a response body

pub mod codec;
pub mod dispatch;

pub use codec::{FrameError, RequestHeader};
pub use dispatch::DispatchError;

/// API keys understood by this broker.
pub mod api_key {
    /// Capability discovery: which API keys and versions the broker supports.
    pub const API_VERSIONS: i16 = 18;
}

/// Error codes placed in response bodies.
pub mod error_code {
    pub const NONE: i16 = 0;
    pub const UNSUPPORTED_VERSION: i16 = 35;
    pub const INVALID_REQUEST: i16 = 42;
}

/// Inclusive version range advertised for one API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiVersionRange {
    pub api_key: i16,
    pub min_version: i16,
    pub max_version: i16,
}

impl ApiVersionRange {
    pub fn contains(&self, version: u16) -> bool {
        i32::from(self.min_version) <= i32::from(version)
            && i32::from(version) <= i32::from(self.max_version)
    }
}

/// Every API this broker answers.
pub const SUPPORTED_APIS: &[ApiVersionRange] = &[ApiVersionRange {
    api_key: api_key::API_VERSIONS,
    min_version: 0,
    max_version: 4,
}];

/// Look up the advertised range for a request's API key.
pub fn supported_range(api_key: u16) -> Option<&'static ApiVersionRange> {
    SUPPORTED_APIS
        .iter()
        .find(|range| i32::from(range.api_key) == i32::from(api_key))
}
