//! Discovery of running sessions through their signal files

use anyhow::{bail, Context, Result};
use ktun_session::signal_file::find_signal_files;
use ktun_session::{SessionKind, SignalFileConfig};
use serde::Serialize;
use std::path::PathBuf;

/// A session found on this machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunningSession {
    pub kind: SessionKind,
    pub pid: u32,
    pub signal_file: PathBuf,
}

/// Every running session, grouped by kind and sorted by pid
pub fn running_sessions(signal: &SignalFileConfig) -> Result<Vec<RunningSession>> {
    let mut sessions = Vec::new();
    for kind in SessionKind::ALL {
        for (pid, signal_file) in scan(signal, kind)? {
            sessions.push(RunningSession {
                kind,
                pid,
                signal_file,
            });
        }
    }
    Ok(sessions)
}

/// Signal file of the running `kind` session.
///
/// Without a pid, exactly one session of that kind must be running.
pub fn locate_session(
    signal: &SignalFileConfig,
    kind: SessionKind,
    pid: Option<u32>,
) -> Result<PathBuf> {
    let sessions = scan(signal, kind)?;

    match (pid, sessions.as_slice()) {
        (Some(pid), _) => sessions
            .iter()
            .find(|(found, _)| *found == pid)
            .map(|(_, path)| path.clone())
            .context(format!("No running {} session with pid {}", kind, pid)),
        (None, []) => bail!("No running {} session found", kind),
        (None, [(_, path)]) => Ok(path.clone()),
        (None, many) => {
            let pids: Vec<String> = many.iter().map(|(pid, _)| pid.to_string()).collect();
            bail!(
                "Multiple {} sessions are running (pids {}), pass --pid",
                kind,
                pids.join(", ")
            )
        }
    }
}

fn scan(signal: &SignalFileConfig, kind: SessionKind) -> Result<Vec<(u32, PathBuf)>> {
    find_signal_files(&signal.dir, &signal.prefix, kind)
        .context(format!("Failed to scan {:?} for signal files", signal.dir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn signal_config(dir: &TempDir) -> SignalFileConfig {
        SignalFileConfig {
            dir: dir.path().to_path_buf(),
            prefix: "ktun".to_string(),
            ..SignalFileConfig::default()
        }
    }

    fn touch(config: &SignalFileConfig, kind: SessionKind, pid: u32) -> PathBuf {
        let path = config.path_for(kind, pid);
        fs::write(&path, "").unwrap();
        path
    }

    #[test]
    fn test_locate_single_session() {
        let dir = TempDir::new().unwrap();
        let config = signal_config(&dir);
        let path = touch(&config, SessionKind::Mesh, 4242);
        touch(&config, SessionKind::Exchange, 1000);

        assert_eq!(
            locate_session(&config, SessionKind::Mesh, None).unwrap(),
            path
        );
    }

    #[test]
    fn test_locate_requires_pid_when_ambiguous() {
        let dir = TempDir::new().unwrap();
        let config = signal_config(&dir);
        touch(&config, SessionKind::Exchange, 300);
        let second = touch(&config, SessionKind::Exchange, 20);

        let err = locate_session(&config, SessionKind::Exchange, None).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Multiple exchange sessions are running (pids 20, 300), pass --pid"
        );

        assert_eq!(
            locate_session(&config, SessionKind::Exchange, Some(20)).unwrap(),
            second
        );
    }

    #[test]
    fn test_locate_missing_session() {
        let dir = TempDir::new().unwrap();
        let config = signal_config(&dir);

        let err = locate_session(&config, SessionKind::Preview, None).unwrap_err();
        assert_eq!(err.to_string(), "No running preview session found");

        touch(&config, SessionKind::Preview, 7);
        let err = locate_session(&config, SessionKind::Preview, Some(8)).unwrap_err();
        assert_eq!(err.to_string(), "No running preview session with pid 8");
    }

    #[test]
    fn test_running_sessions_lists_every_kind() {
        let dir = TempDir::new().unwrap();
        let config = signal_config(&dir);
        touch(&config, SessionKind::Preview, 9);
        touch(&config, SessionKind::Exchange, 11);
        fs::write(dir.path().join("unrelated-file"), "").unwrap();

        let sessions = running_sessions(&config).unwrap();
        let found: Vec<(SessionKind, u32)> = sessions.iter().map(|s| (s.kind, s.pid)).collect();
        assert_eq!(
            found,
            vec![(SessionKind::Exchange, 11), (SessionKind::Preview, 9)]
        );
    }

    #[test]
    fn test_running_session_json_uses_lowercase_kind() {
        let dir = TempDir::new().unwrap();
        let config = signal_config(&dir);
        let path = touch(&config, SessionKind::Mesh, 31);

        let json = serde_json::to_value(running_sessions(&config).unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!([{
                "kind": "mesh",
                "pid": 31,
                "signal_file": path,
            }])
        );
    }
}
