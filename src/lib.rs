//! kafka-lite: the connection-handling and framing core of a Kafka-style broker.
//!
//! Speaks the length-prefixed, big-endian Kafka client protocol over TCP.
//! The only request answered with a regular body is ApiVersions; every
//! other request gets a well-formed error frame.
//!
//! - `protocol`: frame codec and request dispatch
//! - `connection`: per-connection read/decode/dispatch/write loop
//! - `server`: listener and accept loop
//! - `shutdown`: one-shot process-wide shutdown signal
//! - `config`: CLI and TOML configuration

pub mod config;
pub mod connection;
pub mod protocol;
pub mod server;
pub mod shutdown;
