use std::process::Command;

use anyhow::{bail, Context, Result};
use portable_pty::CommandBuilder;

/// One row of `tmux list-sessions` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TmuxSession {
    pub name: String,
    pub attached: u32,
    pub windows: u32,
    pub created: String,
}

const LIST_FORMAT: &str =
    "#{session_name}|#{session_attached}|#{session_windows}|#{session_created_string}";

/// Verify tmux is available by running `tmux -V`.
pub fn ensure_installed() -> Result<()> {
    let probe = Command::new("tmux").arg("-V").output();
    match probe {
        Ok(output) if output.status.success() => Ok(()),
        Ok(_) => bail!("tmux command failed; ensure tmux is installed and working"),
        Err(_) => bail!("tmux not found in PATH"),
    }
}

/// List tmux sessions. A tmux server that is simply not running is reported
/// as an empty list, not an error.
pub fn list_sessions() -> Result<Vec<TmuxSession>> {
    ensure_installed()?;
    let output = Command::new("tmux")
        .args(["list-sessions", "-F", LIST_FORMAT])
        .output()
        .context("run tmux list-sessions")?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !output.status.success() {
        let combined = format!("{stdout}{stderr}");
        let lower = combined.trim().to_lowercase();
        if lower.contains("no server running")
            || lower.contains("failed to connect to server")
            || lower.contains("error connecting to")
        {
            return Ok(Vec::new());
        }
        if output.status.code() == Some(1) && combined.trim().is_empty() {
            return Ok(Vec::new());
        }
        bail!("tmux list-sessions failed: {}", combined.trim());
    }
    Ok(parse_sessions_output(&stdout))
}

/// Build the `tmux attach-session -t <name>` invocation to run on a fresh pty.
pub fn attach_command(session: &str) -> Result<CommandBuilder> {
    let session = session.trim();
    if session.is_empty() {
        bail!("tmux session is required");
    }
    ensure_installed()?;
    let mut cmd = CommandBuilder::new("tmux");
    cmd.args(["attach-session", "-t", session]);
    Ok(cmd)
}

fn parse_sessions_output(text: &str) -> Vec<TmuxSession> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                return None;
            }
            let mut parts = line.splitn(4, '|');
            let name = parts.next()?.trim();
            if name.is_empty() {
                return None;
            }
            let attached = parts.next()?.trim().parse().unwrap_or(0);
            // Entries missing the windows column are skipped entirely.
            let windows = parts.next()?.trim().parse().unwrap_or(0);
            let created = parts.next().unwrap_or("").trim().to_string();
            Some(TmuxSession {
                name: name.to_string(),
                attached,
                windows,
                created,
            })
        })
        .collect()
}
