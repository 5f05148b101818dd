//! Bounded-timeout dialing that produces guarded connections

use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ConnectionError, ConnectionResult};
use crate::guarded::{ConnectionConfig, GuardedConnection};
use crate::raw::{RawConnection, TcpConnection};

/// Upper bound on connection setup, applied on top of the caller's cancellation
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Dial capability supplied by the environment (e.g. a tunnel stack)
#[async_trait]
pub trait Dialer: Send + Sync {
    type Connection: RawConnection;

    async fn dial(&self, network: &str, address: &str) -> io::Result<Self::Connection>;
}

/// Plain TCP dialer
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    type Connection = TcpConnection;

    async fn dial(&self, network: &str, address: &str) -> io::Result<TcpConnection> {
        match network {
            "tcp" | "tcp4" | "tcp6" => {}
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unsupported network '{}'", other),
                ))
            }
        }

        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        TcpConnection::new(stream)
    }
}

/// Wraps a [`Dialer`] with a connect timeout and hands out
/// [`GuardedConnection`]s configured with the wrapper's idle policy.
///
/// [`DialWrapper::connection_count`] is a monotonic count of successful
/// dials. It is not decremented when connections close.
#[derive(Debug)]
pub struct DialWrapper<D> {
    dialer: D,
    config: ConnectionConfig,
    connect_timeout: Duration,
    dial_count: AtomicU64,
}

impl<D: Dialer> DialWrapper<D> {
    pub fn new(dialer: D, config: ConnectionConfig) -> Self {
        Self {
            dialer,
            config,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            dial_count: AtomicU64::new(0),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Dial `address`, giving up when either `cancel` fires or the connect
    /// timeout elapses, whichever comes first.
    ///
    /// Failed dials leave the counter untouched.
    pub async fn dial(
        &self,
        cancel: &CancellationToken,
        network: &str,
        address: &str,
    ) -> ConnectionResult<GuardedConnection<D::Connection>> {
        let attempt =
            tokio::time::timeout(self.connect_timeout, self.dialer.dial(network, address));

        let conn = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Dial to {} cancelled", address);
                return Err(ConnectionError::DialCancelled {
                    address: address.to_string(),
                });
            }
            result = attempt => match result {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => {
                    debug!("Failed to dial {}: {}", address, e);
                    return Err(ConnectionError::Io(e));
                }
                Err(_) => {
                    debug!("Dial to {} timed out after {:?}", address, self.connect_timeout);
                    return Err(ConnectionError::DialTimeout {
                        address: address.to_string(),
                        timeout: self.connect_timeout,
                    });
                }
            }
        };

        let count = self.dial_count.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Established connection #{} to {}", count, address);

        Ok(GuardedConnection::new(conn, &self.config))
    }

    /// Number of successful dials performed through this wrapper
    pub fn connection_count(&self) -> u64 {
        self.dial_count.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}
