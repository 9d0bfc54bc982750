//! TCP listener and accept loop.
//!
//! Binds the listening socket, spawns one task per accepted connection
//! and stops accepting once shutdown is triggered. Connections already
//! accepted are left to finish on their own for up to
//! `shutdown_timeout`; whatever is still running after that is aborted.

use crate::config::Config;
use crate::connection::handle_connection;
use crate::shutdown::Shutdown;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{lookup_host, TcpListener};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

/// Pause after a failed accept before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Errors that end the process.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to resolve listen address {address}: {source}")]
    Resolve {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to install signal handlers: {0}")]
    Signal(#[source] io::Error),

    #[error("failed to start runtime: {0}")]
    Runtime(#[source] io::Error),
}

/// A bound server, ready to accept connections.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: Config,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Resolve the configured address and bind the listening socket.
    ///
    /// Nothing is left behind on failure.
    pub async fn bind(config: Config) -> Result<Self, ServerError> {
        let address = config.listen_address();
        let addr = lookup_host(&address)
            .await
            .map_err(|source| ServerError::Resolve {
                address: address.clone(),
                source,
            })?
            .next()
            .ok_or_else(|| ServerError::Resolve {
                address: address.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "no addresses found"),
            })?;

        let bind_error = |source| ServerError::Bind { addr, source };
        let listener = create_listener(addr, config.backlog).map_err(bind_error)?;
        let listener = TcpListener::from_std(listener).map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        info!(address = %local_addr, "Server listening");

        Ok(Server {
            listener,
            local_addr,
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            config,
        })
    }

    /// Address the listener is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until `shutdown` is triggered.
    pub async fn run(self, shutdown: Shutdown) {
        let Server {
            listener,
            config,
            connection_limit,
            ..
        } = self;
        let mut connections = JoinSet::new();

        loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                _ = shutdown.triggered() => break,
                permit = Arc::clone(&connection_limit).acquire_owned() => permit,
            };
            let Ok(permit) = permit else {
                error!("Connection limit closed");
                break;
            };

            let (stream, peer) = tokio::select! {
                _ = shutdown.triggered() => break,
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    log_join(joined);
                    continue;
                }
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        if backoff(&shutdown).await {
                            break;
                        }
                        continue;
                    }
                },
            };

            info!(peer = %peer, "New connection");

            let read_buffer_size = config.read_buffer_size;
            connections.spawn(async move {
                handle_connection(stream, peer, read_buffer_size).await;
                drop(permit);
            });
        }

        if shutdown.is_triggered() {
            info!("Shutdown requested, no longer accepting connections");
        }
        drop(listener);

        drain(connections, config.shutdown_timeout).await;
        info!("Accept loop stopped");
    }
}

/// Sleep for `ACCEPT_ERROR_BACKOFF`. Returns `true` if shutdown was
/// triggered in the meantime.
async fn backoff(shutdown: &Shutdown) -> bool {
    tokio::select! {
        _ = shutdown.triggered() => true,
        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => false,
    }
}

/// Wait up to `timeout` for open connections, then abort the rest.
async fn drain(mut connections: JoinSet<()>, timeout: Duration) {
    if connections.is_empty() {
        return;
    }

    info!(open = connections.len(), "Waiting for open connections to finish");

    let finished = tokio::time::timeout(timeout, async {
        while let Some(joined) = connections.join_next().await {
            log_join(joined);
        }
    })
    .await
    .is_ok();

    if !finished {
        warn!(
            open = connections.len(),
            "Shutdown timeout elapsed, aborting open connections"
        );
        connections.shutdown().await;
    }
}

fn log_join(joined: Result<(), JoinError>) {
    match joined {
        Ok(()) => {}
        Err(e) if e.is_panic() => error!(error = %e, "Connection task panicked"),
        Err(e) => debug!(error = %e, "Connection task cancelled"),
    }
}

fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::encode_request;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;

    fn test_config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            shutdown_timeout: Duration::from_millis(200),
            ..Config::default()
        }
    }

    async fn start() -> (SocketAddr, Shutdown, JoinHandle<()>) {
        let server = Server::bind(test_config()).await.unwrap();
        let addr = server.local_addr();
        let shutdown = Shutdown::new();
        let handle = tokio::spawn(server.run(shutdown.clone()));
        (addr, shutdown, handle)
    }

    /// Send one request and read back one whole response frame.
    async fn round_trip(stream: &mut TcpStream, request: &[u8]) -> Vec<u8> {
        stream.write_all(request).await.unwrap();

        let mut length = [0u8; 4];
        stream.read_exact(&mut length).await.unwrap();
        let mut rest = vec![0u8; u32::from_be_bytes(length) as usize];
        stream.read_exact(&mut rest).await.unwrap();

        let mut frame = length.to_vec();
        frame.extend_from_slice(&rest);
        frame
    }

    #[tokio::test]
    async fn test_api_versions_over_tcp() {
        let (addr, shutdown, handle) = start().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let response = round_trip(
            &mut client,
            &[0x00, 0x00, 0x00, 0x08, 0x00, 0x12, 0x00, 0x04, 0x00, 0x00, 0x00, 0x2A],
        )
        .await;

        assert_eq!(
            response,
            vec![
                0x00, 0x00, 0x00, 0x13, // length
                0x00, 0x00, 0x00, 0x2A, // correlation_id
                0x00, 0x00, 0x02, 0x00, 0x12, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00,
                0x00, 0x00,
            ]
        );

        drop(client);
        shutdown.trigger();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_unsupported_key_then_valid_request() {
        let (addr, shutdown, handle) = start().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let response = round_trip(&mut client, &encode_request(3, 12, 100, &[]).unwrap()).await;
        assert_eq!(
            response,
            vec![0x00, 0x00, 0x00, 0x06, 0x00, 0x00, 0x00, 0x64, 0x00, 0x23]
        );

        let response = round_trip(&mut client, &encode_request(18, 0, 101, &[]).unwrap()).await;
        assert_eq!(&response[4..8], &101i32.to_be_bytes());
        assert_eq!(&response[8..10], &[0x00, 0x00]);

        drop(client);
        shutdown.trigger();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_clients_see_only_their_responses() {
        let (addr, shutdown, handle) = start().await;

        let clients: Vec<_> = (0..2)
            .map(|client_id: i32| {
                tokio::spawn(async move {
                    let mut stream = TcpStream::connect(addr).await.unwrap();
                    for i in 0..10 {
                        let correlation_id = client_id * 1000 + i;
                        let request = encode_request(18, 4, correlation_id, &[]).unwrap();
                        let response = round_trip(&mut stream, &request).await;
                        assert_eq!(&response[4..8], &correlation_id.to_be_bytes());
                    }
                })
            })
            .collect();

        for client in clients {
            client.await.unwrap();
        }

        shutdown.trigger();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_short_request_does_not_stop_listener() {
        let (addr, shutdown, handle) = start().await;

        let mut bad = TcpStream::connect(addr).await.unwrap();
        bad.write_all(&[0x00, 0x00, 0x00]).await.unwrap();
        drop(bad);

        let mut good = TcpStream::connect(addr).await.unwrap();
        let response = round_trip(&mut good, &encode_request(18, 2, 9, &[]).unwrap()).await;
        assert_eq!(&response[4..8], &9i32.to_be_bytes());

        drop(good);
        shutdown.trigger();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_unsupported_version_then_valid_request() {
        let (addr, shutdown, handle) = start().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let response = round_trip(&mut client, &encode_request(18, 9, 3, &[]).unwrap()).await;
        assert_eq!(
            response,
            vec![
                0x00, 0x00, 0x00, 0x10, // length
                0x00, 0x00, 0x00, 0x03, // correlation_id
                0x00, 0x23, 0x00, 0x00, 0x00, 0x01, 0x00, 0x12, 0x00, 0x00, 0x00, 0x04,
            ]
        );

        let response = round_trip(&mut client, &encode_request(18, 0, 4, &[]).unwrap()).await;
        assert_eq!(&response[4..8], &4i32.to_be_bytes());
        assert_eq!(&response[8..10], &[0x00, 0x00]);

        drop(client);
        shutdown.trigger();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_frame_answered_then_closed_cleanly() {
        let (addr, shutdown, handle) = start().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        // Declares 4000 body bytes, far more than one 1024 byte read holds
        let frame = encode_request(18, 4, 77, &[0xAB; 4000]).unwrap();
        client.write_all(&frame).await.unwrap();

        let mut response = [0u8; 10];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(
            response,
            [0x00, 0x00, 0x00, 0x06, 0x00, 0x00, 0x00, 0x4D, 0x00, 0x2A]
        );

        // An orderly close, not a reset
        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
            .await
            .expect("server closed the connection")
            .unwrap();
        assert_eq!(n, 0);

        shutdown.trigger();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_backoff_waits_unless_shutdown() {
        let shutdown = Shutdown::new();
        let started = tokio::time::Instant::now();
        assert!(!backoff(&shutdown).await);
        assert!(started.elapsed() >= ACCEPT_ERROR_BACKOFF);

        shutdown.trigger();
        let triggered = tokio::time::timeout(ACCEPT_ERROR_BACKOFF / 2, backoff(&shutdown))
            .await
            .expect("backoff cut short by shutdown");
        assert!(triggered);
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting_and_aborts_idle_connections() {
        let (addr, shutdown, handle) = start().await;

        // An idle client that never sends anything
        let _idle = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("accept loop stopped")
            .unwrap();

        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let server = Server::bind(test_config()).await.unwrap();
        let taken = server.local_addr();

        let config = Config {
            port: taken.port(),
            ..test_config()
        };

        match Server::bind(config).await {
            Err(ServerError::Bind { addr, .. }) => assert_eq!(addr, taken),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("second bind succeeded"),
        }
    }

    #[tokio::test]
    async fn test_unresolvable_host() {
        let config = Config {
            host: "host.invalid".to_string(),
            ..test_config()
        };

        assert!(matches!(
            Server::bind(config).await,
            Err(ServerError::Resolve { .. })
        ));
    }
}
