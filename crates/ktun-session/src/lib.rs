//! Session orchestration for exchange, mesh and preview sessions
//!
//! A session sets itself up, runs pre-checks, dispatches to exactly one
//! strategy, then blocks until a single termination event arrives, either
//! from the session's signal file or from an interrupt. Cleanup (removing
//! the signal file) runs on every exit path.

pub mod cluster;
pub mod kind;
pub mod orchestrator;
pub mod ports;
pub mod signal_file;

pub use cluster::{Cluster, ServiceRef};
pub use kind::{ExchangeMode, MeshMode, ParseModeError, SessionKind, Strategy};
pub use orchestrator::{Session, SessionError, SessionOptions, SessionState, TerminationSender};
pub use ports::{PortMapping, PortSpecError};
pub use signal_file::{SignalFile, SignalFileConfig, Termination};
