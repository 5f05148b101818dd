//! ktun command-line support: persisted configuration, session discovery and
//! the guarded TCP relay

pub mod config;
pub mod relay;
pub mod sessions;
