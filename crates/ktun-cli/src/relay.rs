//! Local TCP relay over guarded connections
//!
//! Every accepted connection is wrapped in a [`GuardedConnection`] and paired
//! with an upstream connection dialed through a [`DialWrapper`]. A pair stays
//! open while bytes move in either direction and is closed once nothing has
//! moved for longer than the configured idle timeout.

use ktun_connection::{
    ConnectionConfig, ConnectionError, ConnectionResult, DialWrapper, GuardedConnection,
    TcpConnection, TcpDialer,
};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Errors that can occur while relaying
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Failed to bind relay listener on {address}: {source}")]
    Bind {
        address: String,
        source: io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to accept connections on
    pub listen: String,
    /// Upstream address every connection is relayed to
    pub target: String,
    /// Idle policy applied to both legs
    pub connection: ConnectionConfig,
    pub connect_timeout: Duration,
}

/// A bound relay, ready to run
pub struct Relay {
    listener: TcpListener,
    target: String,
    inbound: ConnectionConfig,
    dialer: Arc<DialWrapper<TcpDialer>>,
}

impl Relay {
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(&config.listen)
            .await
            .map_err(|source| RelayError::Bind {
                address: config.listen.clone(),
                source,
            })?;

        let dialer = DialWrapper::new(TcpDialer, config.connection.clone())
            .with_connect_timeout(config.connect_timeout);

        Ok(Self {
            listener,
            target: config.target,
            inbound: config.connection,
            dialer: Arc::new(dialer),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Upstream connections established so far
    pub fn connection_count(&self) -> u64 {
        self.dialer.connection_count()
    }

    /// Accept and relay connections until `shutdown` is cancelled.
    ///
    /// Accept failures are logged and the loop keeps going. Cancelling
    /// `shutdown` also aborts in-flight dials and closes every relayed
    /// connection.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            "Relaying {} -> {}",
            self.local_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "?".to_string()),
            self.target
        );

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            debug!("Accepted relay connection from {}", peer);

            let dialer = self.dialer.clone();
            let target = self.target.clone();
            let inbound = self.inbound.clone();
            let shutdown = shutdown.child_token();

            tokio::spawn(async move {
                match relay_connection(stream, &inbound, &dialer, &target, &shutdown).await {
                    Ok(()) => debug!("Relay connection from {} finished", peer),
                    Err(e) if is_disconnect(&e) => {
                        debug!("Relay connection from {} ended: {}", peer, e)
                    }
                    Err(e) => warn!("Relay connection from {} failed: {}", peer, e),
                }
            });
        }

        info!(
            "Relay stopped after {} upstream connection(s)",
            self.connection_count()
        );
    }
}

async fn relay_connection(
    stream: TcpStream,
    inbound_config: &ConnectionConfig,
    dialer: &DialWrapper<TcpDialer>,
    target: &str,
    shutdown: &CancellationToken,
) -> ConnectionResult<()> {
    let inbound = GuardedConnection::new(TcpConnection::new(stream)?, inbound_config);

    let upstream = match dialer.dial(shutdown, "tcp", target).await {
        Ok(upstream) => upstream,
        Err(e) => {
            let _ = inbound.close().await;
            return Err(e);
        }
    };

    // Without half-close, the first direction to finish ends the pair
    let activity = PairActivity::new();
    let result = tokio::select! {
        _ = shutdown.cancelled() => Ok(()),
        sent = pump(&inbound, &upstream, &activity) => sent,
        received = pump(&upstream, &inbound, &activity) => received,
    };

    let _ = inbound.close().await;
    let _ = upstream.close().await;

    result
}

/// Peer went away or the connection was closed under us
fn is_disconnect(err: &ConnectionError) -> bool {
    match err {
        ConnectionError::Io(e) => matches!(
            e.kind(),
            io::ErrorKind::NotConnected
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::TimedOut
        ),
        other => other.is_closed(),
    }
}

/// When bytes last moved in either direction of a relayed pair
struct PairActivity {
    started: Instant,
    last_transfer_ms: AtomicU64,
}

impl PairActivity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_transfer_ms: AtomicU64::new(0),
        }
    }

    fn record(&self) {
        let elapsed = self.started.elapsed().as_millis();
        self.last_transfer_ms
            .store(u64::try_from(elapsed).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_transfer_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }
}

/// Copy from `from` to `to` until EOF.
///
/// A read deadline on `from` only ends the copy once the whole pair has been
/// quiet for the idle timeout; the silent side of a one-way stream keeps
/// waiting.
async fn pump(
    from: &GuardedConnection<TcpConnection>,
    to: &GuardedConnection<TcpConnection>,
    activity: &PairActivity,
) -> ConnectionResult<()> {
    let mut buffer = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = match from.read(&mut buffer).await {
            Ok(n) => n,
            Err(e) if e.is_timeout() && activity.idle_for() < from.idle_timeout() => continue,
            Err(e) => return Err(e),
        };
        if n == 0 {
            debug!("Relayed {} bytes from {}", total, from.remote_addr());
            return Ok(());
        }
        to.write_all(&buffer[..n]).await?;
        activity.record();
        total += n as u64;
    }
}
