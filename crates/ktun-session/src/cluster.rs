//! Cluster-side collaborators a session drives

use async_trait::async_trait;

use crate::kind::{ExchangeMode, MeshMode, SessionKind};

/// A service resolved from a resource name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRef {
    /// Resource kind, e.g. "Service"
    pub kind: String,
    pub name: String,
    pub namespace: String,
    /// Ports the service routes to
    pub target_ports: Vec<u16>,
}

/// Everything a session needs from the cluster.
///
/// Implementations own resource lookup and the concrete redirection
/// strategies. Strategies return once the redirection is in place; the
/// session keeps running until it is told to terminate.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Per-process setup before any session work
    async fn prepare(&self, kind: SessionKind) -> anyhow::Result<()>;

    /// Resolve a resource name (`name` or `type/name`) to a service
    async fn resolve_service(&self, resource: &str, namespace: &str) -> anyhow::Result<ServiceRef>;

    async fn exchange(&self, mode: ExchangeMode, resource: &str) -> anyhow::Result<()>;

    async fn mesh(&self, mode: MeshMode, service: &ServiceRef) -> anyhow::Result<()>;

    async fn preview(&self, service_name: &str) -> anyhow::Result<()>;
}
