//! File-based termination requests
//!
//! Each running session owns a marker file at
//! `<temp dir>/<prefix>-<kind>-signal-<pid>`. The file is created empty when
//! the session starts, so its presence tells other processes the session is
//! up. Writing `stop` into it (surrounding whitespace is ignored) makes the
//! session's poller deliver one [`Termination::SignalFile`] event; any other
//! content is ignored.
//!
//! The poller never removes the file. The owning session removes it through
//! [`SignalFile::remove`], and dropping a [`SignalFile`] removes it as well.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::kind::SessionKind;

/// The only recognized command
pub const STOP_COMMAND: &str = "stop";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(60 * 60);

pub const DEFAULT_SIGNAL_PREFIX: &str = "ktun";

/// Why a session was asked to terminate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// `stop` was written to the session's signal file
    SignalFile,
    /// An interrupt (Ctrl+C) was delivered to the process
    Interrupt,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::SignalFile => f.write_str("signal file stop request"),
            Termination::Interrupt => f.write_str("interrupt"),
        }
    }
}

/// Where signal files live and how often they are polled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalFileConfig {
    pub dir: PathBuf,
    pub prefix: String,
    pub poll_interval: Duration,
}

impl Default for SignalFileConfig {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir(),
            prefix: DEFAULT_SIGNAL_PREFIX.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl SignalFileConfig {
    pub fn path_for(&self, kind: SessionKind, pid: u32) -> PathBuf {
        signal_file_path(&self.dir, &self.prefix, kind, pid)
    }
}

/// Deterministic signal file path for a session of `kind` in process `pid`
pub fn signal_file_path(dir: &Path, prefix: &str, kind: SessionKind, pid: u32) -> PathBuf {
    dir.join(format!("{}-{}-signal-{}", prefix, kind, pid))
}

/// Whether file content is a stop request
pub fn is_stop_request(content: &[u8]) -> bool {
    String::from_utf8_lossy(content).trim() == STOP_COMMAND
}

/// Ask the session owning `path` to stop
pub async fn request_stop(path: &Path) -> io::Result<()> {
    tokio::fs::write(path, format!("{}\n", STOP_COMMAND)).await
}

/// Signal files of running `kind` sessions in `dir`, as `(pid, path)` sorted by pid
pub fn find_signal_files(
    dir: &Path,
    prefix: &str,
    kind: SessionKind,
) -> io::Result<Vec<(u32, PathBuf)>> {
    let marker = format!("{}-{}-signal-", prefix, kind);
    let mut found = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(pid) = name
            .to_str()
            .and_then(|name| name.strip_prefix(&marker))
            .and_then(|pid| pid.parse::<u32>().ok())
        else {
            continue;
        };
        found.push((pid, entry.path()));
    }

    found.sort_by_key(|(pid, _)| *pid);
    Ok(found)
}

/// Human-readable instructions for stopping a session through its signal file
pub fn stop_instructions(kind: SessionKind, path: &Path) -> Vec<String> {
    if cfg!(windows) {
        vec![
            format!("You can stop the {} by creating a signal file:", kind),
            format!(
                "PowerShell:   \"stop\" | Out-File -FilePath {} -Encoding ASCII",
                path.display()
            ),
            format!("Command Prompt: echo stop > {}", path.display()),
        ]
    } else {
        vec![format!(
            "You can stop the {} by creating a signal file: echo stop > {}",
            kind,
            path.display()
        )]
    }
}

/// A session's signal file and its poller
#[derive(Debug)]
pub struct SignalFile {
    path: PathBuf,
    kind: SessionKind,
    cancel: CancellationToken,
}

impl SignalFile {
    /// Create the marker file for this process and start polling it.
    ///
    /// At most one [`Termination::SignalFile`] is sent on `termination`.
    /// Failing to create the marker is logged, not fatal: an external actor
    /// can still create the file with `stop` in it.
    pub fn start(
        session_id: &str,
        kind: SessionKind,
        config: &SignalFileConfig,
        termination: mpsc::Sender<Termination>,
    ) -> Self {
        let path = config.path_for(kind, std::process::id());

        match std::fs::File::create(&path) {
            Ok(_) => debug!(session_id, "Created signal file {}", path.display()),
            Err(e) => warn!(
                session_id,
                "Failed to create signal file {}: {}",
                path.display(),
                e
            ),
        }

        let cancel = CancellationToken::new();
        tokio::spawn(watch(
            path.clone(),
            config.poll_interval,
            termination,
            cancel.clone(),
        ));

        Self { path, kind, cancel }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    /// Stop polling and delete the file. Absence of the file is not an error.
    pub fn remove(&self) -> io::Result<()> {
        self.cancel.cancel();
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("Removed signal file {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for SignalFile {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            warn!("Failed to remove signal file {}: {}", self.path.display(), e);
        }
    }
}

async fn watch(
    path: PathBuf,
    poll_interval: Duration,
    termination: mpsc::Sender<Termination>,
    cancel: CancellationToken,
) {
    let poll_interval = poll_interval.clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL);
    let mut ticker = interval_at(Instant::now() + poll_interval, poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = termination.closed() => return,
            _ = ticker.tick() => {}
        }

        // Missing or unreadable file means no request yet
        match tokio::fs::read(&path).await {
            Ok(content) if is_stop_request(&content) => {
                info!("Stop requested through signal file {}", path.display());
                // A full slot means a termination is already pending
                let _ = termination.try_send(Termination::SignalFile);
                return;
            }
            Ok(_) => {}
            Err(e) => trace!("Signal file {} not readable: {}", path.display(), e),
        }
    }
}
