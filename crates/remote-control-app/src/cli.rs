//! Command-line surface.

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "remote-control",
    version,
    about = "Share a local terminal with a browser over an authenticated WebSocket"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List tmux sessions; with --all, also direct tty candidates
    Sessions {
        /// Include direct TTY process candidates
        #[arg(long)]
        all: bool,
    },
    /// Share an existing tmux session or an already-open tty device
    Attach {
        /// tmux session name (defaults to the first session found)
        #[arg(long)]
        tmux_session: Option<String>,
        /// Direct tty path (example: /dev/pts/3)
        #[arg(long)]
        tty_path: Option<String>,
        #[command(flatten)]
        common: CommonFlags,
    },
    /// Run a command in a fresh pty and share it
    #[command(alias = "run")]
    Start {
        /// Command to run in a pty
        #[arg(long)]
        cmd: String,
        #[command(flatten)]
        common: CommonFlags,
    },
    /// Show the runtime state of known sessions
    Status,
    /// Stop a running session
    Stop {
        /// Session id to stop (optional when exactly one session is live)
        #[arg(long)]
        id: Option<String>,
    },
}

/// Flags shared by `attach` and `start`. Unset flags fall back to the
/// settings file; the `--x`/`--no-x` pairs let either direction override it.
#[derive(Args)]
pub struct CommonFlags {
    /// Server bind address
    #[arg(long)]
    pub bind: Option<String>,

    /// Server port
    #[arg(long)]
    pub port: Option<u16>,

    /// Runtime session id
    #[arg(long)]
    pub id: Option<String>,

    /// Enable remote typing
    #[arg(long)]
    pub readwrite: bool,

    /// Start the public tunnel
    #[arg(long)]
    pub tunnel: bool,

    /// Disable the public tunnel
    #[arg(long, conflicts_with = "tunnel")]
    pub no_tunnel: bool,

    /// Fail if the tunnel cannot start
    #[arg(long)]
    pub tunnel_required: bool,

    /// Tunnel mode (ephemeral|named)
    #[arg(long)]
    pub tunnel_mode: Option<String>,

    /// Named tunnel hostname
    #[arg(long)]
    pub tunnel_hostname: Option<String>,

    /// Named tunnel name
    #[arg(long)]
    pub tunnel_name: Option<String>,

    /// Named tunnel token
    #[arg(long)]
    pub tunnel_token: Option<String>,

    /// cloudflared binary path
    #[arg(long)]
    pub cloudflared_bin: Option<String>,

    /// cloudflared config file path
    #[arg(long)]
    pub cloudflared_config: Option<String>,

    /// cloudflared credentials file path
    #[arg(long)]
    pub cloudflared_credentials: Option<String>,

    /// Extra access code required during browser auth
    #[arg(long)]
    pub access_code: Option<String>,

    /// Embed the access token in the share URL
    #[arg(long)]
    pub token_in_url: bool,

    /// Do not embed the access token in the share URL
    #[arg(long, conflicts_with = "token_in_url")]
    pub no_token_in_url: bool,

    /// Prevent macOS sleep while the session is active
    #[arg(long)]
    pub caffeinate: bool,

    /// Disable caffeinate even if enabled in settings
    #[arg(long, conflicts_with = "caffeinate")]
    pub no_caffeinate: bool,
}

/// `--x` / `--no-x` pair against a settings default.
pub fn resolve_toggle(on: bool, off: bool, default: bool) -> bool {
    if off {
        false
    } else if on {
        true
    } else {
        default
    }
}
