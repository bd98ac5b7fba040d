//! On-disk runtime records.
//!
//! One JSON file per live session under `<home>/runtime/<id>.json`. The
//! record is the projection `status` and `stop` read; it is rewritten with a
//! temp-file + rename on every observable change so concurrent readers never
//! see a torn write. Records whose owning pid is gone are pruned on the next
//! command start.

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config;

/// Serialized projection of a live session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionState {
    pub id: String,
    pub mode: String,
    pub source: String,
    pub readonly: bool,
    pub pid: u32,
    pub addr: String,
    pub url: String,
    pub local_url: String,
    pub public_url: String,
    pub tunnel: String,
    pub tunnel_mode: String,
    pub token_in_url: bool,
    pub access_code_auth: bool,
    pub client_count: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub idle_deadline: Option<DateTime<Utc>>,
    pub idle_timeout_seconds: u64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub settings_file: String,
    pub cloudflared_pid: u32,
    pub caffeinate_pid: u32,
}

/// Access to the per-session record directory.
#[derive(Debug, Clone)]
pub struct Registry {
    dir: PathBuf,
}

impl Registry {
    pub fn open_default() -> Result<Self> {
        Ok(Self {
            dir: config::runtime_dir()?,
        })
    }

    pub fn at(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Rewrite the record atomically, stamping `updated_at` and defaulting
    /// `started_at` on first save.
    pub fn save(&self, state: &SessionState) -> Result<()> {
        let id = state.id.trim();
        if id.is_empty() {
            bail!("session id is required");
        }
        config::create_private_dir(&self.dir)?;
        let mut state = state.clone();
        let now = Utc::now();
        if state.started_at.is_none() {
            state.started_at = Some(now);
        }
        state.updated_at = Some(now);
        let data = serde_json::to_vec_pretty(&state).context("serialize session record")?;
        let tmp = self.dir.join(format!(".session-{}-{id}.tmp", std::process::id()));
        fs::write(&tmp, data).with_context(|| format!("write record temp {}", tmp.display()))?;
        config::restrict_file_mode(&tmp)?;
        let path = self.record_path(id);
        fs::rename(&tmp, &path)
            .with_context(|| format!("install session record {}", path.display()))?;
        Ok(())
    }

    pub fn load(&self, id: &str) -> Result<SessionState> {
        let id = id.trim();
        if id.is_empty() {
            bail!("session id is required");
        }
        let path = self.record_path(id);
        let data =
            fs::read(&path).with_context(|| format!("read session record {}", path.display()))?;
        serde_json::from_slice(&data)
            .with_context(|| format!("parse session record {}", path.display()))
    }

    /// Removing a record that is already gone is not an error.
    pub fn remove(&self, id: &str) -> Result<()> {
        let id = id.trim();
        if id.is_empty() {
            bail!("session id is required");
        }
        match fs::remove_file(self.record_path(id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).context("remove session record"),
        }
    }

    /// All parseable records, newest first. Malformed entries are skipped.
    pub fn list(&self) -> Result<Vec<SessionState>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).context("read runtime directory"),
        };
        let mut states: Vec<SessionState> = entries
            .flatten()
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".json")
            })
            .filter_map(|entry| {
                let data = fs::read(entry.path()).ok()?;
                serde_json::from_slice(&data).ok()
            })
            .collect();
        states.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(states)
    }

    /// Drop records whose owning process no longer exists. Returns removed
    /// ids; calling this twice is indistinguishable from once.
    pub fn prune_stale(&self) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for state in self.list()? {
            if state.id.trim().is_empty() {
                continue;
            }
            if process_alive(state.pid) {
                continue;
            }
            self.remove(&state.id)?;
            removed.push(state.id);
        }
        Ok(removed)
    }
}

/// Null-signal liveness probe. Windows has no equivalent probe here, so a
/// known pid is optimistically considered alive.
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    #[cfg(unix)]
    {
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn state(id: &str, pid: u32) -> SessionState {
        SessionState {
            id: id.into(),
            mode: "cmd".into(),
            source: "bash".into(),
            pid,
            addr: "127.0.0.1:8080".into(),
            url: "http://127.0.0.1:8080/".into(),
            local_url: "http://127.0.0.1:8080/".into(),
            tunnel: "local".into(),
            tunnel_mode: "ephemeral".into(),
            idle_timeout_seconds: 900,
            ..SessionState::default()
        }
    }

    #[test]
    fn save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::at(dir.path().to_path_buf());
        let mut original = state("rc-1", std::process::id());
        original.token_expires_at = Some(Utc::now() + chrono::Duration::hours(1));
        original.idle_deadline = Some(Utc::now() + chrono::Duration::minutes(15));
        original.client_count = 2;
        registry.save(&original).unwrap();

        let loaded = registry.load("rc-1").unwrap();
        assert_eq!(loaded.id, "rc-1");
        assert_eq!(loaded.client_count, 2);
        assert_eq!(loaded.token_expires_at, original.token_expires_at);
        assert_eq!(loaded.idle_deadline, original.idle_deadline);
        assert_eq!(loaded.idle_timeout_seconds, 900);
        assert!(loaded.started_at.is_some());
        assert!(loaded.updated_at.is_some());
    }

    #[test]
    fn save_requires_an_id() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::at(dir.path().to_path_buf());
        assert!(registry.save(&SessionState::default()).is_err());
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::at(dir.path().to_path_buf());
        registry.save(&state("rc-2", 1)).unwrap();
        registry.remove("rc-2").unwrap();
        registry.remove("rc-2").unwrap();
        assert!(registry.load("rc-2").is_err());
    }

    #[test]
    fn list_skips_malformed_entries() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::at(dir.path().to_path_buf());
        registry.save(&state("rc-3", std::process::id())).unwrap();
        std::fs::write(dir.path().join("broken.json"), b"{not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
        let states = registry.list().unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].id, "rc-3");
    }

    #[test]
    fn list_on_missing_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::at(dir.path().join("never-created"));
        assert!(registry.list().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn prune_removes_dead_pids_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::at(dir.path().to_path_buf());
        registry.save(&state("alive", std::process::id())).unwrap();
        // Pid far above pid_max on typical systems.
        registry.save(&state("dead", 999_999_999)).unwrap();

        let removed = registry.prune_stale().unwrap();
        assert_eq!(removed, vec!["dead".to_string()]);
        let removed_again = registry.prune_stale().unwrap();
        assert!(removed_again.is_empty());
        assert_eq!(registry.list().unwrap().len(), 1);
    }

    #[test]
    fn process_alive_rejects_pid_zero() {
        assert!(!process_alive(0));
    }

    #[cfg(unix)]
    #[test]
    fn process_alive_sees_this_process() {
        assert!(process_alive(std::process::id()));
    }
}
