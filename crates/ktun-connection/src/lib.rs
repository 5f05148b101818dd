//! Lifecycle-managed connections for tunnel sessions
//!
//! Wraps an already-established byte-stream connection with idle-timeout
//! enforcement and idempotent teardown, and wraps a dial capability with a
//! bounded connect timeout and a per-wrapper dial counter.
//!
//! # Components
//!
//! - [`RawConnection`]: capability trait every transport implements
//!   (read/write/close/remote address). [`TcpConnection`] is the default.
//! - [`GuardedConnection`]: idle monitor + race-safe close over one
//!   [`RawConnection`]. Itself implements [`RawConnection`], so it is a
//!   drop-in replacement for the transport it wraps.
//! - [`DialWrapper`]: bounds a [`Dialer`] to a fixed connect timeout and
//!   hands out [`GuardedConnection`]s.

pub mod dialer;
pub mod error;
pub mod guarded;
pub mod raw;

pub use dialer::{DialWrapper, Dialer, TcpDialer, DEFAULT_CONNECT_TIMEOUT};
pub use error::{ConnectionError, ConnectionResult};
pub use guarded::{ConnectionConfig, GuardedConnection, DEFAULT_IDLE_CHECK_INTERVAL};
pub use raw::{RawConnection, TcpConnection};
