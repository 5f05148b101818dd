//! Session kinds and their strategies

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Kind of traffic-redirection session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// Redirect all traffic of a cluster resource to local
    Exchange,
    /// Redirect marked traffic of a cluster service to local
    Mesh,
    /// Expose a local service inside the cluster
    Preview,
}

impl SessionKind {
    pub const ALL: [SessionKind; 3] = [
        SessionKind::Exchange,
        SessionKind::Mesh,
        SessionKind::Preview,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Exchange => "exchange",
            SessionKind::Mesh => "mesh",
            SessionKind::Preview => "preview",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionKind {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SessionKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ParseModeError {
                what: "session kind",
                value: s.to_string(),
                supported: "exchange, mesh, preview",
            })
    }
}

/// Unknown strategy tag
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {what} '{value}', supported are {supported}")]
pub struct ParseModeError {
    what: &'static str,
    value: String,
    supported: &'static str,
}

/// How an exchange session takes over the target workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeMode {
    Scale,
    Ephemeral,
    Selector,
}

impl ExchangeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeMode::Scale => "scale",
            ExchangeMode::Ephemeral => "ephemeral",
            ExchangeMode::Selector => "selector",
        }
    }
}

impl FromStr for ExchangeMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scale" => Ok(ExchangeMode::Scale),
            "ephemeral" => Ok(ExchangeMode::Ephemeral),
            "selector" => Ok(ExchangeMode::Selector),
            other => Err(ParseModeError {
                what: "exchange method",
                value: other.to_string(),
                supported: "selector, scale, ephemeral",
            }),
        }
    }
}

/// How a mesh session routes marked traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeshMode {
    Manual,
    Auto,
}

impl MeshMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeshMode::Manual => "manual",
            MeshMode::Auto => "auto",
        }
    }
}

impl FromStr for MeshMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(MeshMode::Manual),
            "auto" => Ok(MeshMode::Auto),
            other => Err(ParseModeError {
                what: "mesh method",
                value: other.to_string(),
                supported: "auto, manual",
            }),
        }
    }
}

/// The single strategy a session dispatches to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    Exchange(ExchangeMode),
    Mesh(MeshMode),
    Preview,
}

impl Strategy {
    /// Select the strategy for `kind` from its configured tag.
    ///
    /// Preview has a single strategy and ignores the tag.
    pub fn select(kind: SessionKind, tag: &str) -> Result<Self, ParseModeError> {
        match kind {
            SessionKind::Exchange => tag.parse().map(Strategy::Exchange),
            SessionKind::Mesh => tag.parse().map(Strategy::Mesh),
            SessionKind::Preview => Ok(Strategy::Preview),
        }
    }

    pub fn kind(&self) -> SessionKind {
        match self {
            Strategy::Exchange(_) => SessionKind::Exchange,
            Strategy::Mesh(_) => SessionKind::Mesh,
            Strategy::Preview => SessionKind::Preview,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Exchange(mode) => mode.as_str(),
            Strategy::Mesh(mode) => mode.as_str(),
            Strategy::Preview => "expose",
        }
    }
}
