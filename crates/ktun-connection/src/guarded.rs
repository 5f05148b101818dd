//! Idle-guarded connection wrapper
//!
//! [`GuardedConnection`] owns exactly one [`RawConnection`] and adds:
//!
//! - **Closed-access protection**: once closed, `read`/`write` fail with
//!   [`ConnectionError::Closed`] without touching the transport.
//! - **Idempotent close**: concurrent `close` calls (caller and idle monitor)
//!   race on a check-and-set under the state lock; exactly one of them
//!   closes the transport, the others return `Ok(())`.
//! - **Idle eviction**: when an idle timeout is configured, every read/write
//!   is bounded by a deadline of `now + idle_timeout`, and a background
//!   monitor closes the connection once it has been idle for longer than the
//!   timeout.
//!
//! The monitor wakes every [`ConnectionConfig::idle_check_interval`], so an
//! idle connection is closed at most one interval after the timeout elapses.
//! It also stops as soon as the connection is closed or the last handle is
//! dropped.

use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ConnectionError, ConnectionResult};
use crate::raw::RawConnection;

/// How often the idle monitor checks for inactivity
pub const DEFAULT_IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Bounds applied to the idle monitor's wake-up period
const MIN_IDLE_CHECK_INTERVAL: Duration = Duration::from_millis(1);
const MAX_IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Idle policy for guarded connections
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Maximum time without read/write activity. `Duration::ZERO` disables
    /// both the I/O deadline and the idle monitor.
    pub idle_timeout: Duration,
    /// Wake-up period of the idle monitor
    pub idle_check_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::ZERO,
            idle_check_interval: DEFAULT_IDLE_CHECK_INTERVAL,
        }
    }
}

impl ConnectionConfig {
    pub fn with_idle_timeout(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            ..Self::default()
        }
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.idle_check_interval = interval;
        self
    }

    pub fn idle_timeout_enabled(&self) -> bool {
        !self.idle_timeout.is_zero()
    }
}

#[derive(Debug)]
struct ActivityState {
    closed: bool,
    last_activity: Instant,
}

struct Shared<C> {
    conn: C,
    state: RwLock<ActivityState>,
    idle_timeout: Duration,
    remote_addr: String,
    /// Fired once on close; wakes the idle monitor
    closed_signal: CancellationToken,
}

impl<C: RawConnection> Shared<C> {
    async fn close(&self) -> ConnectionResult<()> {
        {
            let mut state = self.state.write().await;
            if state.closed {
                return Ok(());
            }
            state.closed = true;
        }
        self.closed_signal.cancel();

        debug!("Closing connection to {}", self.remote_addr);
        self.conn.close().await.map_err(|e| {
            warn!("Failed to close connection to {}: {}", self.remote_addr, e);
            ConnectionError::Io(e)
        })
    }
}

impl<C> Drop for Shared<C> {
    fn drop(&mut self) {
        self.closed_signal.cancel();
    }
}

/// Connection wrapper enforcing an idle timeout and idempotent close.
///
/// Cloning yields another handle to the same connection, which is how a
/// reader task and a writer task share it. Must be created inside a Tokio
/// runtime when the idle timeout is enabled.
pub struct GuardedConnection<C> {
    shared: Arc<Shared<C>>,
}

impl<C> Clone for GuardedConnection<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C> fmt::Debug for GuardedConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardedConnection")
            .field("remote_addr", &self.shared.remote_addr)
            .field("idle_timeout", &self.shared.idle_timeout)
            .finish()
    }
}

impl<C: RawConnection> GuardedConnection<C> {
    /// Wrap `conn`, starting the idle monitor if an idle timeout is set
    pub fn new(conn: C, config: &ConnectionConfig) -> Self {
        let remote_addr = conn.remote_addr();
        let shared = Arc::new(Shared {
            conn,
            state: RwLock::new(ActivityState {
                closed: false,
                last_activity: Instant::now(),
            }),
            idle_timeout: config.idle_timeout,
            remote_addr,
            closed_signal: CancellationToken::new(),
        });

        if config.idle_timeout_enabled() {
            tokio::spawn(idle_monitor(
                Arc::downgrade(&shared),
                config.idle_timeout,
                config.idle_check_interval,
                shared.closed_signal.clone(),
            ));
        }

        Self { shared }
    }

    /// Read into `buf`, refreshing the activity timestamp
    pub async fn read(&self, buf: &mut [u8]) -> ConnectionResult<usize> {
        self.touch().await?;
        let result = self.with_deadline(self.shared.conn.read(buf)).await;
        self.observe("Read", result)
    }

    /// Write from `buf`, refreshing the activity timestamp
    pub async fn write(&self, buf: &[u8]) -> ConnectionResult<usize> {
        self.touch().await?;
        let result = self.with_deadline(self.shared.conn.write(buf)).await;
        self.observe("Write", result)
    }

    /// Write the whole buffer, looping over partial writes
    pub async fn write_all(&self, mut buf: &[u8]) -> ConnectionResult<()> {
        while !buf.is_empty() {
            match self.write(buf).await? {
                0 => {
                    return Err(ConnectionError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write whole buffer",
                    )))
                }
                n => buf = &buf[n..],
            }
        }
        Ok(())
    }

    /// Close the connection.
    ///
    /// Only the first call closes the transport and returns its result;
    /// later or concurrent calls return `Ok(())`.
    pub async fn close(&self) -> ConnectionResult<()> {
        self.shared.close().await
    }

    pub async fn is_closed(&self) -> bool {
        self.shared.state.read().await.closed
    }

    /// Time since the last read or write started
    pub async fn idle_for(&self) -> Duration {
        self.shared.state.read().await.last_activity.elapsed()
    }

    pub fn idle_timeout(&self) -> Duration {
        self.shared.idle_timeout
    }

    pub fn remote_addr(&self) -> &str {
        &self.shared.remote_addr
    }

    /// Access to the wrapped transport for metadata queries
    pub fn get_ref(&self) -> &C {
        &self.shared.conn
    }

    async fn touch(&self) -> ConnectionResult<()> {
        let mut state = self.shared.state.write().await;
        if state.closed {
            return Err(ConnectionError::Closed);
        }
        state.last_activity = Instant::now();
        Ok(())
    }

    async fn with_deadline<T>(&self, fut: impl Future<Output = io::Result<T>>) -> io::Result<T> {
        if self.shared.idle_timeout.is_zero() {
            return fut.await;
        }

        match tokio::time::timeout(self.shared.idle_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no activity within {:?}", self.shared.idle_timeout),
            )),
        }
    }

    fn observe<T>(&self, op: &str, result: io::Result<T>) -> ConnectionResult<T> {
        result.map_err(|e| {
            if e.kind() != io::ErrorKind::TimedOut {
                debug!("{} error on connection to {}: {}", op, self.shared.remote_addr, e);
            }
            ConnectionError::Io(e)
        })
    }
}

async fn idle_monitor<C: RawConnection>(
    shared: Weak<Shared<C>>,
    idle_timeout: Duration,
    check_interval: Duration,
    closed_signal: CancellationToken,
) {
    let check_interval = check_interval.clamp(MIN_IDLE_CHECK_INTERVAL, MAX_IDLE_CHECK_INTERVAL);
    let mut ticker = interval_at(Instant::now() + check_interval, check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = closed_signal.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let Some(shared) = shared.upgrade() else {
            return;
        };

        let idle = {
            let state = shared.state.read().await;
            if state.closed {
                return;
            }
            state.last_activity.elapsed()
        };

        if idle > idle_timeout {
            debug!(
                "Connection to {} idle for {:?}, closing",
                shared.remote_addr, idle
            );
            // Failure is already logged by close
            let _ = shared.close().await;
            return;
        }
    }
}

#[async_trait]
impl<C: RawConnection> RawConnection for GuardedConnection<C> {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        GuardedConnection::read(self, buf).await.map_err(Into::into)
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        GuardedConnection::write(self, buf).await.map_err(Into::into)
    }

    async fn close(&self) -> io::Result<()> {
        GuardedConnection::close(self).await.map_err(Into::into)
    }

    fn remote_addr(&self) -> String {
        self.shared.remote_addr.clone()
    }

    fn local_addr(&self) -> Option<String> {
        self.shared.conn.local_addr()
    }
}
