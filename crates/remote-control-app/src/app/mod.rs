//! Command implementations around the session supervisor.

pub mod launch;

use anyhow::Result;
use colored::Colorize;

use remote_control_terminal as terminal;

use crate::config::Settings;
use crate::registry::{process_alive, Registry};

pub use launch::{run_server, LaunchOptions};

use crate::cli::CommonFlags;
use remote_control_terminal::Terminal;

/// `attach [--tmux-session <name> | --tty-path <path>]`
pub async fn cmd_attach(
    settings: &Settings,
    tmux_session: Option<String>,
    tty_path: Option<String>,
    common: &CommonFlags,
) -> i32 {
    let ui = Ui::from_settings(settings);
    prune_stale_runtime_state(ui);
    let tty = tty_path.unwrap_or_default().trim().to_string();
    let name = tmux_session.unwrap_or_default().trim().to_string();
    if !tty.is_empty() && !name.is_empty() {
        eprintln!(
            "{}{}",
            ui.prefix("❌"),
            "Choose either --tmux-session or --tty-path, not both.".red()
        );
        return 1;
    }

    let term = if !tty.is_empty() {
        match Terminal::open_tty_path(&tty) {
            Ok(term) => {
                println!("{}Using tty path: {tty}", ui.prefix("ℹ️"));
                term
            }
            Err(err) => {
                eprintln!(
                    "{}{} {err:#}",
                    ui.prefix("❌"),
                    format!("Could not attach tty path {tty:?}:").red()
                );
                return 1;
            }
        }
    } else {
        let list = match terminal::list_sessions() {
            Ok(list) => list,
            Err(err) => {
                eprintln!(
                    "{}{} {err:#}",
                    ui.prefix("❌"),
                    "Could not discover tmux sessions:".red()
                );
                return 1;
            }
        };
        if list.is_empty() {
            eprintln!(
                "{}{}",
                ui.prefix("❌"),
                "No tmux sessions found. Start one with: tmux new -s my-session".red()
            );
            return 1;
        }
        let name = if name.is_empty() {
            let first = list[0].name.clone();
            println!("{}Using tmux session: {first}", ui.prefix("ℹ️"));
            first
        } else {
            if !list.iter().any(|s| s.name == name) {
                let mut names: Vec<&str> = list.iter().map(|s| s.name.as_str()).collect();
                names.sort_unstable();
                eprintln!(
                    "{}{}",
                    ui.prefix("❌"),
                    format!(
                        "tmux session {name:?} not found. Available: {}",
                        names.join(", ")
                    )
                    .red()
                );
                return 1;
            }
            name
        };
        match Terminal::start_attach(&name) {
            Ok(term) => term,
            Err(err) => {
                eprintln!(
                    "{}{} {err:#}",
                    ui.prefix("❌"),
                    format!("Could not attach tmux session {name:?}:").red()
                );
                return 1;
            }
        }
    };

    let opts = LaunchOptions::resolve(settings, common);
    finish(run_server(term, opts).await, ui)
}

/// `start --cmd "<command>"`
pub async fn cmd_start(settings: &Settings, cmd: &str, common: &CommonFlags) -> i32 {
    let ui = Ui::from_settings(settings);
    prune_stale_runtime_state(ui);
    let command = cmd.trim();
    if command.is_empty() {
        eprintln!("{}{}", ui.prefix("❌"), "--cmd is required".red());
        return 1;
    }
    let term = match Terminal::start_command(command) {
        Ok(term) => term,
        Err(err) => {
            eprintln!(
                "{}{} {err:#}",
                ui.prefix("❌"),
                "Could not start command session:".red()
            );
            return 1;
        }
    };
    let opts = LaunchOptions::resolve(settings, common);
    finish(run_server(term, opts).await, ui)
}

fn finish(result: Result<i32>, ui: Ui) -> i32 {
    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{}{} {err:#}", ui.prefix("❌"), "error:".red());
            1
        }
    }
}

/// Emoji gate for user-facing lines. When `[ui].emoji` is off the prefixes
/// collapse to nothing.
#[derive(Debug, Clone, Copy)]
pub struct Ui {
    pub emoji: bool,
}

impl Ui {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            emoji: settings.ui.emoji,
        }
    }

    /// Prefix for a message line: `"✅ "` or `""`.
    pub fn prefix(&self, emoji: &str) -> String {
        if self.emoji {
            format!("{emoji} ")
        } else {
            String::new()
        }
    }
}

/// `sessions [--all]`
pub fn cmd_sessions(settings: &Settings, all: bool) -> i32 {
    let ui = Ui::from_settings(settings);

    let mut sessions = match terminal::list_sessions() {
        Ok(sessions) => sessions,
        Err(err) => {
            if !all {
                eprintln!(
                    "{}{} {err:#}",
                    ui.prefix("❌"),
                    "Could not list tmux sessions:".red()
                );
                return 1;
            }
            eprintln!(
                "{}{} {err:#}",
                ui.prefix("⚠️"),
                "Could not list tmux sessions:".yellow()
            );
            Vec::new()
        }
    };

    if sessions.is_empty() {
        println!("{}No tmux sessions found.", ui.prefix("ℹ️"));
    } else {
        sessions.sort_by(|a, b| a.name.cmp(&b.name));
        println!("{}Available tmux sessions", ui.prefix("🧭"));
        for session in &sessions {
            println!(
                "- {} (windows={}, attached={}, created={})",
                session.name, session.windows, session.attached, session.created
            );
        }
    }
    if !all {
        return 0;
    }

    let candidates = match terminal::list_tty_candidates() {
        Ok(candidates) => candidates,
        Err(err) => {
            eprintln!(
                "{}{} {err:#}",
                ui.prefix("⚠️"),
                "Could not discover TTY candidates:".yellow()
            );
            return 1;
        }
    };
    if candidates.is_empty() {
        println!("{}No direct TTY candidates found.", ui.prefix("ℹ️"));
        return 0;
    }
    println!("{}Direct TTY candidates", ui.prefix("🔎"));
    for candidate in &candidates {
        println!(
            "- pid={} tty={} cmd={} args={}",
            candidate.pid,
            candidate.tty,
            candidate.command,
            candidate.args.trim()
        );
    }
    0
}

/// `status`
pub fn cmd_status(settings: &Settings) -> i32 {
    let ui = Ui::from_settings(settings);
    prune_stale_runtime_state(ui);
    let registry = match Registry::open_default() {
        Ok(registry) => registry,
        Err(err) => {
            eprintln!("{}{} {err:#}", ui.prefix("❌"), "Could not read runtime state:".red());
            return 1;
        }
    };
    let states = match registry.list() {
        Ok(states) => states,
        Err(err) => {
            eprintln!("{}{} {err:#}", ui.prefix("❌"), "Could not read runtime state:".red());
            return 1;
        }
    };
    if states.is_empty() {
        println!("{}No active remote-control sessions found.", ui.prefix("ℹ️"));
        return 0;
    }
    println!("{}remote-control sessions", ui.prefix("📋"));
    for state in &states {
        let status = if process_alive(state.pid) {
            "running"
        } else {
            "stopped"
        };
        let local = some_or_dash(if state.local_url.is_empty() {
            &state.url
        } else {
            &state.local_url
        });
        let public = some_or_dash(&state.public_url);
        let tunnel_mode = some_or_dash(&state.tunnel_mode);
        let started = state
            .started_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".into());
        let token_expires = state
            .token_expires_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".into());
        let idle_deadline = state
            .idle_deadline
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".into());
        println!(
            "- {} [{}] mode={} readonly={} code_auth={} token_in_url={} clients={} local={} public={} tunnel_mode={} started={} token_expires={} idle_deadline={} pids(parent={} cf={} caf={})",
            state.id,
            status,
            state.mode,
            state.readonly,
            state.access_code_auth,
            state.token_in_url,
            state.client_count,
            local,
            public,
            tunnel_mode,
            started,
            token_expires,
            idle_deadline,
            state.pid,
            state.cloudflared_pid,
            state.caffeinate_pid,
        );
    }
    0
}

/// `stop [--id <session-id>]`
pub fn cmd_stop(settings: &Settings, id: Option<String>) -> i32 {
    let ui = Ui::from_settings(settings);
    prune_stale_runtime_state(ui);
    let registry = match Registry::open_default() {
        Ok(registry) => registry,
        Err(err) => {
            eprintln!("{}{} {err:#}", ui.prefix("❌"), "Could not read runtime state:".red());
            return 1;
        }
    };
    let states = match registry.list() {
        Ok(states) => states,
        Err(err) => {
            eprintln!("{}{} {err:#}", ui.prefix("❌"), "Could not read runtime state:".red());
            return 1;
        }
    };
    if states.is_empty() {
        println!("{}No active sessions to stop.", ui.prefix("ℹ️"));
        return 0;
    }
    let target_id = match id.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()) {
        Some(id) => id,
        None if states.len() == 1 => states[0].id.clone(),
        None => {
            eprintln!(
                "{}{}",
                ui.prefix("❌"),
                "Multiple sessions found. Use --id <session-id>.".red()
            );
            return 1;
        }
    };
    let Some(target) = states.iter().find(|s| s.id == target_id) else {
        eprintln!(
            "{}{}",
            ui.prefix("❌"),
            format!("Session {target_id:?} not found").red()
        );
        return 1;
    };
    if !process_alive(target.pid) {
        let _ = registry.remove(&target.id);
        println!(
            "{}Session {} already stopped; cleaned stale state.",
            ui.prefix("ℹ️"),
            target.id
        );
        return 0;
    }
    if let Err(err) = terminate_pid(target.pid) {
        eprintln!(
            "{}{} {err:#}",
            ui.prefix("❌"),
            format!("Could not stop session {}:", target.id).red()
        );
        return 1;
    }
    if target.cloudflared_pid > 0 && target.cloudflared_pid != target.pid {
        let _ = terminate_pid(target.cloudflared_pid);
    }
    if target.caffeinate_pid > 0 && target.caffeinate_pid != target.pid {
        let _ = terminate_pid(target.caffeinate_pid);
    }
    println!(
        "{}Stop signal sent to {} (pid {})",
        ui.prefix("✅"),
        target.id,
        target.pid
    );
    0
}

/// Every command begins by sweeping records whose process is gone.
pub fn prune_stale_runtime_state(ui: Ui) {
    let registry = match Registry::open_default() {
        Ok(registry) => registry,
        Err(_) => return,
    };
    match registry.prune_stale() {
        Ok(removed) if !removed.is_empty() => {
            println!(
                "{}Cleaned stale session state: {}",
                ui.prefix("🧹"),
                removed.join(", ")
            );
        }
        Ok(_) => {}
        Err(err) => {
            eprintln!(
                "{}{} {err:#}",
                ui.prefix("⚠️"),
                "Could not prune stale session state:".yellow()
            );
        }
    }
}

/// Compose the user-facing URL: token iff it belongs in the URL, and a
/// `require_code=1` marker so the UI knows to prompt.
pub fn build_share_url(base_url: &str, token: &str, include_token: bool, require_code: bool) -> String {
    let base = base_url.trim();
    if base.is_empty() {
        return String::new();
    }
    let mut out = format!("{}/", base.trim_end_matches('/'));
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    let mut has_query = false;
    if include_token {
        query.append_pair("token", token);
        has_query = true;
    }
    if require_code {
        query.append_pair("require_code", "1");
        has_query = true;
    }
    if has_query {
        out.push('?');
        out.push_str(&query.finish());
    }
    out
}

pub fn normalize_tunnel_mode(mode: &str) -> String {
    let mode = mode.trim().to_lowercase();
    if mode == "named" {
        mode
    } else {
        "ephemeral".to_string()
    }
}

fn some_or_dash(value: &str) -> &str {
    let value = value.trim();
    if value.is_empty() {
        "-"
    } else {
        value
    }
}

/// Best-effort SIGTERM. Stop never escalates; a stuck process is the
/// operator's call.
fn terminate_pid(pid: u32) -> Result<()> {
    if pid == 0 {
        return Ok(());
    }
    #[cfg(unix)]
    {
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error()).map_err(anyhow::Error::from);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_url_composition() {
        assert_eq!(
            build_share_url("http://127.0.0.1:8080", "tok", true, false),
            "http://127.0.0.1:8080/?token=tok"
        );
        assert_eq!(
            build_share_url("https://abc.trycloudflare.com/", "tok", true, true),
            "https://abc.trycloudflare.com/?token=tok&require_code=1"
        );
        assert_eq!(
            build_share_url("http://127.0.0.1:8080", "tok", false, true),
            "http://127.0.0.1:8080/?require_code=1"
        );
        // No query at all when neither part applies.
        assert_eq!(
            build_share_url("http://127.0.0.1:8080", "tok", false, false),
            "http://127.0.0.1:8080/"
        );
        assert_eq!(build_share_url("   ", "tok", true, false), "");
    }

    #[test]
    fn share_url_escapes_token() {
        let url = build_share_url("http://h", "a b&c", true, false);
        assert_eq!(url, "http://h/?token=a+b%26c");
    }

    #[test]
    fn tunnel_mode_normalization() {
        assert_eq!(normalize_tunnel_mode("named"), "named");
        assert_eq!(normalize_tunnel_mode(" NAMED "), "named");
        assert_eq!(normalize_tunnel_mode("ephemeral"), "ephemeral");
        assert_eq!(normalize_tunnel_mode("bogus"), "ephemeral");
        assert_eq!(normalize_tunnel_mode(""), "ephemeral");
    }

    #[test]
    fn ui_prefix_respects_emoji_gate() {
        let on = Ui { emoji: true };
        let off = Ui { emoji: false };
        assert_eq!(on.prefix("✅"), "✅ ");
        assert_eq!(off.prefix("✅"), "");
    }
}
