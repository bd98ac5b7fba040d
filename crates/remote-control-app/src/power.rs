//! macOS sleep prevention.
//!
//! While a session is live the supervisor keeps a `caffeinate -dimsu` child
//! alive so the laptop does not suspend mid-share. Other platforms have no
//! helper; `start()` reports that by returning `None`.

use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::process::Command;

pub struct PowerHandle {
    child: tokio::process::Child,
    pid: Option<u32>,
    stopped: bool,
}

impl PowerHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

/// Start the keep-awake helper. Returns `Ok(None)` on non-macOS platforms.
pub async fn start() -> Result<Option<PowerHandle>> {
    if !cfg!(target_os = "macos") {
        return Ok(None);
    }
    let mut child = Command::new("caffeinate")
        .arg("-dimsu")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .context("start caffeinate")?;
    let pid = child.id();
    // A helper that dies instantly (e.g. sandboxed) should not be recorded.
    if let Ok(Some(_)) = child.try_wait() {
        anyhow::bail!("caffeinate exited immediately");
    }
    Ok(Some(PowerHandle {
        child,
        pid,
        stopped: false,
    }))
}
