use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Condvar, Mutex};

use anyhow::{bail, Context, Result};
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, ExitStatus, MasterPty, PtySize};

use crate::tmux;
use crate::{DEFAULT_COLS, DEFAULT_ROWS};

/// How the terminal was attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalMode {
    /// `tmux attach-session -t <name>` running on a fresh pty.
    AttachTmux,
    /// An arbitrary command spawned under `/bin/sh -lc` on a fresh pty.
    Cmd,
    /// An already-open tty device path; no child process of our own.
    AttachTty,
}

impl TerminalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AttachTmux => "attach-tmux",
            Self::Cmd => "cmd",
            Self::AttachTty => "attach-tty",
        }
    }
}

impl std::fmt::Display for TerminalMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

enum Inner {
    Pty {
        // Options drop to None on close so later writes/resizes fail cleanly.
        master: Mutex<Option<Box<dyn MasterPty + Send>>>,
        writer: Mutex<Option<Box<dyn Write + Send>>>,
        child: Mutex<Box<dyn Child + Send + Sync>>,
        killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    },
    Tty {
        file: Mutex<Option<File>>,
        writer: Mutex<Option<File>>,
        // wait() blocks on this pair until close() flips the flag.
        closed: Mutex<bool>,
        closed_cv: Condvar,
    },
}

/// A terminal the bridge can read from, write to, and resize.
///
/// All operations take `&self`; input writes are serialized by an internal
/// mutex and `close()` is idempotent.
pub struct Terminal {
    mode: TerminalMode,
    source: String,
    inner: Inner,
}

impl Terminal {
    /// Spawn `command` under the platform shell on a fresh pty.
    pub fn start_command(command: &str) -> Result<Self> {
        let command = command.trim();
        if command.is_empty() {
            bail!("command is required");
        }
        let (shell, flag) = if cfg!(windows) {
            ("cmd", "/C")
        } else {
            ("/bin/sh", "-lc")
        };
        let mut cmd = CommandBuilder::new(shell);
        cmd.args([flag, command]);
        Self::start(TerminalMode::Cmd, command.to_string(), cmd)
    }

    /// Attach to an existing tmux session on a fresh pty.
    pub fn start_attach(session: &str) -> Result<Self> {
        let cmd = tmux::attach_command(session)?;
        Self::start(TerminalMode::AttachTmux, session.trim().to_string(), cmd)
    }

    /// Use an already-open tty device as both read and write end.
    pub fn open_tty_path(path: &str) -> Result<Self> {
        let path = path.trim();
        if path.is_empty() {
            bail!("tty path is required");
        }
        if !Path::new(path).exists() {
            bail!("tty path {path:?} does not exist");
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("open tty path {path:?}"))?;
        let writer = file
            .try_clone()
            .with_context(|| format!("clone tty writer for {path:?}"))?;
        Ok(Self {
            mode: TerminalMode::AttachTty,
            source: path.to_string(),
            inner: Inner::Tty {
                file: Mutex::new(Some(file)),
                writer: Mutex::new(Some(writer)),
                closed: Mutex::new(false),
                closed_cv: Condvar::new(),
            },
        })
    }

    fn start(mode: TerminalMode, source: String, cmd: CommandBuilder) -> Result<Self> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: DEFAULT_ROWS,
                cols: DEFAULT_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| anyhow::anyhow!("open pty: {e}"))?;
        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| anyhow::anyhow!("spawn terminal process: {e}"))?;
        drop(pair.slave);
        let killer = child.clone_killer();
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| anyhow::anyhow!("take pty writer: {e}"))?;
        Ok(Self {
            mode,
            source,
            inner: Inner::Pty {
                master: Mutex::new(Some(pair.master)),
                writer: Mutex::new(Some(writer)),
                child: Mutex::new(child),
                killer: Mutex::new(killer),
            },
        })
    }

    pub fn mode(&self) -> TerminalMode {
        self.mode
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Pid of the attached process, if there is one.
    pub fn pid(&self) -> Option<u32> {
        match &self.inner {
            Inner::Pty { child, .. } => child.lock().unwrap().process_id(),
            Inner::Tty { .. } => None,
        }
    }

    /// Clone a blocking reader over the terminal output. The read pump thread
    /// takes one of these; reads return EOF or an error once the attached
    /// process exits or the device is closed.
    pub fn clone_reader(&self) -> Result<Box<dyn Read + Send>> {
        match &self.inner {
            Inner::Pty { master, .. } => {
                let guard = master.lock().unwrap();
                let master = guard.as_ref().context("terminal is closed")?;
                master
                    .try_clone_reader()
                    .map_err(|e| anyhow::anyhow!("clone pty reader: {e}"))
            }
            Inner::Tty { file, .. } => {
                let guard = file.lock().unwrap();
                let file = guard.as_ref().context("terminal is closed")?;
                let clone = file.try_clone().context("clone tty reader")?;
                Ok(Box::new(clone))
            }
        }
    }

    /// Write raw input bytes. Empty input is a no-op.
    pub fn write_input(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        match &self.inner {
            Inner::Pty { writer, .. } => {
                let mut guard = writer.lock().unwrap();
                let w = guard.as_mut().context("terminal is closed")?;
                w.write_all(data).context("write to pty")?;
                w.flush().context("flush pty writer")?;
            }
            Inner::Tty { writer, .. } => {
                let mut guard = writer.lock().unwrap();
                let w = guard.as_mut().context("terminal is closed")?;
                w.write_all(data).context("write to tty")?;
                w.flush().context("flush tty writer")?;
            }
        }
        Ok(())
    }

    /// Propagate a viewport change. Non-positive dimensions are ignored; tty
    /// mode has no pty to resize and accepts the call silently.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        if cols == 0 || rows == 0 {
            return Ok(());
        }
        match &self.inner {
            Inner::Pty { master, .. } => {
                let guard = master.lock().unwrap();
                let master = guard.as_ref().context("terminal is closed")?;
                master
                    .resize(PtySize {
                        rows,
                        cols,
                        pixel_width: 0,
                        pixel_height: 0,
                    })
                    .map_err(|e| anyhow::anyhow!("resize pty: {e}"))
            }
            Inner::Tty { .. } => Ok(()),
        }
    }

    /// Block until the attached process exits. In tty mode this blocks until
    /// `close()` is called and then reports success.
    pub fn wait(&self) -> Result<ExitStatus> {
        match &self.inner {
            Inner::Pty { child, .. } => {
                let mut child = child.lock().unwrap();
                child.wait().context("wait for terminal process")
            }
            Inner::Tty {
                closed, closed_cv, ..
            } => {
                let mut done = closed.lock().unwrap();
                while !*done {
                    done = closed_cv.wait(done).unwrap();
                }
                Ok(ExitStatus::with_exit_code(0))
            }
        }
    }

    /// Kill the attached process (if any) and release the fds. Safe to call
    /// more than once.
    pub fn close(&self) {
        match &self.inner {
            Inner::Pty {
                master,
                writer,
                killer,
                ..
            } => {
                let _ = killer.lock().unwrap().kill();
                writer.lock().unwrap().take();
                master.lock().unwrap().take();
            }
            Inner::Tty {
                file,
                writer,
                closed,
                closed_cv,
            } => {
                // Drop our fds; no further readers can be cloned. A reader
                // already handed out holds its own dup of the device and may
                // stay blocked in read(2) until the device produces bytes or
                // the process exits; teardown does not wait on it.
                file.lock().unwrap().take();
                writer.lock().unwrap().take();
                let mut done = closed.lock().unwrap();
                *done = true;
                closed_cv.notify_all();
            }
        }
    }
}

impl Drop for Terminal {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn read_until(reader: &mut Box<dyn Read + Send>, needle: &str, timeout: Duration) -> String {
        let mut collected = Vec::new();
        let mut buf = [0u8; 4096];
        let start = Instant::now();
        while start.elapsed() < timeout {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    collected.extend_from_slice(&buf[..n]);
                    if String::from_utf8_lossy(&collected).contains(needle) {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        String::from_utf8_lossy(&collected).to_string()
    }

    #[test]
    fn command_mode_round_trip() {
        let term = Terminal::start_command("printf 'ready\\n'; cat").unwrap();
        assert_eq!(term.mode(), TerminalMode::Cmd);
        assert!(term.pid().is_some());

        let mut reader = term.clone_reader().unwrap();
        let seen = read_until(&mut reader, "ready", Duration::from_secs(5));
        assert!(seen.contains("ready"), "missing banner in {seen:?}");

        term.write_input(b"hello-pty\n").unwrap();
        let echoed = read_until(&mut reader, "hello-pty", Duration::from_secs(5));
        assert!(echoed.contains("hello-pty"), "missing echo in {echoed:?}");

        term.close();
        term.close(); // second close is a no-op
        assert!(term.write_input(b"late").is_err());
    }

    #[test]
    fn empty_command_rejected() {
        assert!(Terminal::start_command("   ").is_err());
    }

    #[test]
    fn empty_input_is_noop() {
        let term = Terminal::start_command("cat").unwrap();
        term.write_input(b"").unwrap();
        term.close();
        // Still a no-op after close: nothing to write, nothing to fail.
        term.write_input(b"").unwrap();
    }

    #[test]
    fn resize_ignores_non_positive_dimensions() {
        let term = Terminal::start_command("cat").unwrap();
        term.resize(0, 24).unwrap();
        term.resize(80, 0).unwrap();
        term.resize(120, 40).unwrap();
        term.close();
        assert!(term.resize(80, 24).is_err());
    }

    #[test]
    fn wait_reports_child_exit_code() {
        let term = Terminal::start_command("exit 3").unwrap();
        let status = term.wait().unwrap();
        assert_eq!(status.exit_code(), 3);
    }

    #[cfg(unix)]
    #[test]
    fn tty_mode_waits_for_close() {
        let term = Arc::new(Terminal::open_tty_path("/dev/null").unwrap());
        assert_eq!(term.mode(), TerminalMode::AttachTty);
        assert_eq!(term.pid(), None);
        term.resize(80, 24).unwrap(); // accepted no-op

        let waiter = {
            let term = Arc::clone(&term);
            std::thread::spawn(move || term.wait().map(|s| s.success()))
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished(), "wait returned before close");
        term.close();
        let result = waiter.join().unwrap().unwrap();
        assert!(result);
        assert!(term.clone_reader().is_err());
    }

    #[test]
    fn missing_tty_path_rejected() {
        assert!(Terminal::open_tty_path("/dev/definitely-not-a-tty-9x").is_err());
    }
}
