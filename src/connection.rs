//! Per-connection request/response cycle.
//!
//! A connection owns its stream and walks through
//! `Reading -> Decoding -> Dispatching -> Encoding -> Writing` for every
//! request until the peer disconnects or an error ends it in `Closed`.
//! Requests are served strictly one at a time: the next read is not
//! issued until the previous response is written.
//!
//! Each iteration performs a single bounded read and expects exactly one
//! whole frame in it. A frame split across reads fails to decode and is
//! answered with `INVALID_REQUEST` before the connection is closed. The
//! close is orderly: the write side is shut down and pending input is
//! drained briefly so the peer sees the error frame and a FIN, not a reset.

use crate::protocol::{codec, dispatch, error_code};
use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

/// Longest wait for more input while closing after a malformed frame.
const CLOSE_LINGER: Duration = Duration::from_millis(100);

/// Most input discarded while closing after a malformed frame.
const CLOSE_DRAIN_LIMIT: usize = 64 * 1024;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for the next request bytes.
    Reading,
    /// Parsing the frame header.
    Decoding,
    /// Building the response body.
    Dispatching,
    /// Framing the response.
    Encoding,
    /// Sending the response.
    Writing,
    /// Terminal: the stream is released.
    Closed,
}

/// Why a connection ended without an I/O error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed its side.
    PeerClosed,
    /// A frame failed to decode; it was answered, then the connection closed.
    MalformedFrame,
}

/// Connection-fatal I/O errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("read failed: {0}")]
    Read(#[source] io::Error),

    #[error("write failed: {0}")]
    Write(#[source] io::Error),

    #[error("failed to encode response: {0}")]
    Encode(#[source] codec::FrameError),
}

/// A single client connection.
pub struct Connection<S> {
    stream: S,
    peer: SocketAddr,
    buffer: BytesMut,
    state: ConnState,
    requests: u64,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an accepted stream. `read_buffer_size` bounds each read.
    pub fn new(stream: S, peer: SocketAddr, read_buffer_size: usize) -> Self {
        Self {
            stream,
            peer,
            buffer: BytesMut::with_capacity(read_buffer_size),
            state: ConnState::Reading,
            requests: 0,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Number of requests answered so far.
    pub fn requests(&self) -> u64 {
        self.requests
    }

    /// Serve requests until the connection ends. Always leaves the
    /// connection in `Closed`.
    pub async fn run(&mut self) -> Result<CloseReason, ConnectionError> {
        let result = self.serve().await;
        self.transition(ConnState::Closed);
        result
    }

    async fn serve(&mut self) -> Result<CloseReason, ConnectionError> {
        loop {
            self.transition(ConnState::Reading);
            self.buffer.clear();

            let n = self
                .stream
                .read_buf(&mut self.buffer)
                .await
                .map_err(ConnectionError::Read)?;
            if n == 0 {
                trace!(peer = %self.peer, "Connection closed by client");
                return Ok(CloseReason::PeerClosed);
            }

            self.transition(ConnState::Decoding);
            let header = match codec::decode_request(&self.buffer) {
                Ok((header, body)) => {
                    trace!(
                        peer = %self.peer,
                        api_key = header.api_key,
                        api_version = header.api_version,
                        correlation_id = header.correlation_id,
                        body_len = header.body_len(),
                        client_id = codec::client_id(body),
                        "Decoded request"
                    );
                    if self.buffer.len() > header.frame_len() {
                        debug!(
                            peer = %self.peer,
                            discarded = self.buffer.len() - header.frame_len(),
                            "Ignoring bytes past the first frame"
                        );
                    }
                    header
                }
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "Malformed frame");
                    let correlation_id = codec::peek_correlation_id(&self.buffer);
                    let body = dispatch::error_code_body(error_code::INVALID_REQUEST);

                    self.transition(ConnState::Encoding);
                    let response = codec::encode_response(correlation_id, &body)
                        .map_err(ConnectionError::Encode)?;
                    self.transition(ConnState::Writing);
                    self.write(&response).await?;
                    self.close_gracefully().await;
                    return Ok(CloseReason::MalformedFrame);
                }
            };

            self.transition(ConnState::Dispatching);
            let body = match dispatch::dispatch(&header) {
                Ok(body) => body,
                Err(e) => {
                    debug!(
                        peer = %self.peer,
                        correlation_id = header.correlation_id,
                        error = %e,
                        "Answering with error code"
                    );
                    dispatch::error_body(&e)
                }
            };

            self.transition(ConnState::Encoding);
            let response = codec::encode_response(header.correlation_id, &body)
                .map_err(ConnectionError::Encode)?;

            self.transition(ConnState::Writing);
            self.write(&response).await?;
            self.requests += 1;
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        self.stream
            .write_all(data)
            .await
            .map_err(ConnectionError::Write)?;
        self.stream.flush().await.map_err(ConnectionError::Write)
    }

    /// Send FIN, then discard whatever the peer still has in flight.
    ///
    /// Closing a socket with unread input makes the kernel answer with a
    /// reset, which can destroy the error frame before the peer reads it.
    async fn close_gracefully(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!(peer = %self.peer, error = %e, "Shutdown of write side failed");
            return;
        }

        let mut discarded = 0;
        while discarded < CLOSE_DRAIN_LIMIT {
            self.buffer.clear();
            let read = self.stream.read_buf(&mut self.buffer);
            match tokio::time::timeout(CLOSE_LINGER, read).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
                Ok(Ok(n)) => discarded += n,
            }
        }

        if discarded > 0 {
            trace!(peer = %self.peer, discarded, "Discarded input while closing");
        }
    }

    fn transition(&mut self, next: ConnState) {
        trace!(peer = %self.peer, from = ?self.state, to = ?next, "Connection state");
        self.state = next;
    }
}

/// Serve one accepted connection to completion.
///
/// Errors stay here: they are logged and the stream is dropped, which
/// closes it.
pub async fn handle_connection<S>(stream: S, peer: SocketAddr, read_buffer_size: usize)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut connection = Connection::new(stream, peer, read_buffer_size);

    match connection.run().await {
        Ok(reason) => {
            debug!(peer = %peer, requests = connection.requests(), ?reason, "Connection closed");
        }
        Err(e @ ConnectionError::Read(_)) => {
            debug!(peer = %peer, requests = connection.requests(), error = %e, "Connection closed");
        }
        Err(e @ (ConnectionError::Write(_) | ConnectionError::Encode(_))) => {
            warn!(peer = %peer, requests = connection.requests(), error = %e, "Connection closed");
        }
    }
}
