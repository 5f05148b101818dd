//! Session orchestrator
//!
//! Drives one exchange/mesh/preview session through
//! `Initializing -> Dispatching -> Running -> Terminating -> Done`:
//!
//! 1. **Initializing**: cluster setup, signal file creation, pre-checks
//!    (local ports are listening; for mesh, the service exists and has every
//!    exposed remote port).
//! 2. **Dispatching**: exactly one strategy, selected by its tag, is run.
//! 3. **Running**: the redirect banner is logged and the session waits for
//!    one termination event, from the signal file or an interrupt.
//! 4. **Terminating/Done**: the signal file is removed.
//!
//! Errors before `Running` are fatal for the session: the signal file is
//! removed and the error returned. Nothing is retried.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cluster::{Cluster, ServiceRef};
use crate::kind::{ExchangeMode, MeshMode, ParseModeError, SessionKind, Strategy};
use crate::ports::{find_broken_local_port, find_invalid_remote_port, PortMapping};
use crate::signal_file::{stop_instructions, SignalFile, SignalFileConfig, Termination};

const BANNER_RULE: &str = "---------------------------------------------------------------";

/// Sender side of a session's termination channel
pub type TerminationSender = mpsc::Sender<Termination>;

/// Session errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to set up {kind} session: {source}")]
    Setup {
        kind: SessionKind,
        #[source]
        source: anyhow::Error,
    },

    #[error("no application is running on port {port}")]
    LocalPortNotListening { port: u16 },

    #[error("failed to find service '{resource}': {source}")]
    ServiceNotFound {
        resource: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("target port {port} not exists in service {service}")]
    TargetPortMissing { port: u16, service: String },

    #[error(transparent)]
    InvalidStrategy(#[from] ParseModeError),

    #[error("{kind} by {strategy} failed: {source}")]
    Strategy {
        kind: SessionKind,
        strategy: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// Every termination source went away without sending, e.g. the signal
    /// file poller panicked. `run` does not hold a sender while it waits.
    #[error("termination channel closed unexpectedly")]
    TerminationChannelClosed,
}

/// Lifecycle states of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Dispatching,
    Running,
    Terminating,
    Done,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Initializing => "initializing",
            SessionState::Dispatching => "dispatching",
            SessionState::Running => "running",
            SessionState::Terminating => "terminating",
            SessionState::Done => "done",
        };
        f.write_str(name)
    }
}

/// Per-session settings
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Strategy tag; `None` picks the kind's default (`selector` for
    /// exchange, `auto` for mesh)
    pub mode: Option<String>,
    /// Exposed ports
    pub expose: Vec<PortMapping>,
    /// Skip probing that local ports are listening
    pub skip_port_checking: bool,
    pub namespace: String,
    pub signal: SignalFileConfig,
    /// Feed Ctrl+C into the termination channel
    pub forward_interrupts: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            mode: None,
            expose: Vec::new(),
            skip_port_checking: false,
            namespace: "default".to_string(),
            signal: SignalFileConfig::default(),
            forward_interrupts: true,
        }
    }
}

/// One exchange, mesh or preview invocation
pub struct Session {
    core: SessionCore,
    termination_tx: TerminationSender,
    termination_rx: mpsc::Receiver<Termination>,
}

/// Everything a running session needs besides its termination channel
struct SessionCore {
    id: String,
    kind: SessionKind,
    cluster: Arc<dyn Cluster>,
    options: SessionOptions,
    state: watch::Sender<SessionState>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.core.id)
            .field("kind", &self.core.kind)
            .field("state", &*self.core.state.borrow())
            .finish()
    }
}

impl Session {
    pub fn new(cluster: Arc<dyn Cluster>, kind: SessionKind, options: SessionOptions) -> Self {
        // Single slot: only the first termination matters
        let (termination_tx, termination_rx) = mpsc::channel(1);
        let (state, _) = watch::channel(SessionState::Initializing);

        Self {
            core: SessionCore {
                id: format!("{}-{}", kind, uuid::Uuid::new_v4()),
                kind,
                cluster,
                options,
                state,
            },
            termination_tx,
            termination_rx,
        }
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn kind(&self) -> SessionKind {
        self.core.kind
    }

    /// Sender for delivering external interrupts to this session
    pub fn termination_sender(&self) -> TerminationSender {
        self.termination_tx.clone()
    }

    /// Watch the session's state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.core.state.subscribe()
    }

    /// Run the session against `target` until it is told to terminate.
    ///
    /// `target` is the resource to redirect (exchange, mesh) or the name to
    /// publish the local service under (preview). Returns what ended the
    /// session.
    pub async fn run(self, target: &str) -> Result<Termination, SessionError> {
        let Session {
            core,
            termination_tx,
            mut termination_rx,
        } = self;
        info!(session_id = %core.id, "Starting {} session for '{}'", core.kind, target);

        if let Err(source) = core.cluster.prepare(core.kind).await {
            return Err(SessionError::Setup {
                kind: core.kind,
                source,
            });
        }

        let interrupts = core
            .options
            .forward_interrupts
            .then(|| forward_interrupts(termination_tx.clone()));
        let signal_file =
            SignalFile::start(&core.id, core.kind, &core.options.signal, termination_tx);

        let redirect = match core.establish(target).await {
            Ok(redirect) => redirect,
            Err(e) => {
                error!(session_id = %core.id, "Session failed: {}", e);
                core.cleanup(&signal_file, interrupts);
                return Err(e);
            }
        };

        core.transition(SessionState::Running);
        info!("{}", BANNER_RULE);
        info!(" {}", redirect);
        info!("{}", BANNER_RULE);
        for line in stop_instructions(core.kind, signal_file.path()) {
            info!("{}", line);
        }

        // Only the poller, the interrupt forwarder and senders handed out
        // before `run` can still end the session. If all of them are gone the
        // channel closes instead of blocking forever.
        let received = termination_rx.recv().await;
        core.transition(SessionState::Terminating);
        match received {
            Some(termination) => info!("Terminal signal is {}", termination),
            None => warn!(session_id = %core.id, "Every termination source is gone"),
        }

        core.cleanup(&signal_file, interrupts);
        core.transition(SessionState::Done);

        received.ok_or(SessionError::TerminationChannelClosed)
    }
}

impl SessionCore {
    /// Pre-checks and strategy dispatch. Returns the banner line.
    async fn establish(&self, target: &str) -> Result<String, SessionError> {
        if !self.options.skip_port_checking {
            if let Some(port) = find_broken_local_port(&self.options.expose).await {
                return Err(SessionError::LocalPortNotListening { port });
            }
        }

        let strategy = Strategy::select(self.kind, self.strategy_tag())?;
        match strategy {
            Strategy::Exchange(mode) => {
                self.transition(SessionState::Dispatching);
                self.execute(strategy, self.cluster.exchange(mode, target))
                    .await?;

                let (resource_type, name) = split_resource(target);
                Ok(format!(
                    "Now all request to {} '{}' will be redirected to local",
                    resource_type, name
                ))
            }
            Strategy::Mesh(mode) => {
                let service = self.resolve_mesh_target(target).await?;

                self.transition(SessionState::Dispatching);
                self.execute(strategy, self.cluster.mesh(mode, &service))
                    .await?;

                Ok(format!(
                    "Now all request to {} '{}' will be redirected to local",
                    service.kind, service.name
                ))
            }
            Strategy::Preview => {
                self.transition(SessionState::Dispatching);
                self.execute(strategy, self.cluster.preview(target))
                    .await?;

                Ok(format!(
                    "Now you can access your local service in cluster by name '{}'",
                    target
                ))
            }
        }
    }

    async fn resolve_mesh_target(&self, resource: &str) -> Result<ServiceRef, SessionError> {
        let service = self
            .cluster
            .resolve_service(resource, &self.options.namespace)
            .await
            .map_err(|source| SessionError::ServiceNotFound {
                resource: resource.to_string(),
                source,
            })?;

        if let Some(port) = find_invalid_remote_port(&self.options.expose, &service.target_ports) {
            return Err(SessionError::TargetPortMissing {
                port,
                service: service.name,
            });
        }

        Ok(service)
    }

    async fn execute(
        &self,
        strategy: Strategy,
        run: impl std::future::Future<Output = anyhow::Result<()>>,
    ) -> Result<(), SessionError> {
        info!("Using {} mode", strategy.name());
        run.await.map_err(|source| SessionError::Strategy {
            kind: strategy.kind(),
            strategy: strategy.name(),
            source,
        })
    }

    fn strategy_tag(&self) -> &str {
        match (&self.options.mode, self.kind) {
            (Some(mode), _) => mode,
            (None, SessionKind::Exchange) => ExchangeMode::Selector.as_str(),
            (None, SessionKind::Mesh) => MeshMode::Auto.as_str(),
            (None, SessionKind::Preview) => "",
        }
    }

    fn transition(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        debug!(session_id = %self.id, "Session state {} -> {}", previous, next);
    }

    fn cleanup(&self, signal_file: &SignalFile, interrupts: Option<JoinHandle<()>>) {
        if let Some(handle) = interrupts {
            handle.abort();
        }
        if let Err(e) = signal_file.remove() {
            warn!(
                "Failed to remove signal file {}: {}",
                signal_file.path().display(),
                e
            );
        }
    }
}

/// Split `type/name` into its parts; bare names are services
fn split_resource(resource: &str) -> (&str, &str) {
    match resource.split_once('/') {
        Some((resource_type, name)) => (resource_type, name),
        None => ("service", resource),
    }
}

fn forward_interrupts(termination: TerminationSender) -> JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = termination.try_send(Termination::Interrupt);
            }
            Err(e) => warn!("Failed to listen for interrupts: {}", e),
        }
    })
}
