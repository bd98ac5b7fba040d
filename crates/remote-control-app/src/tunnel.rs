//! Cloudflare tunnel child supervision.
//!
//! Ephemeral mode spawns `cloudflared tunnel --url … --no-autoupdate` and
//! scrapes the first `https://…` URL from its stdout/stderr. Named mode runs
//! against a pre-registered tunnel (`tunnel run --token …`, or
//! `tunnel --url … --hostname …`) and derives the public URL from the
//! configured hostname; readiness there is just "still alive shortly after
//! start", since cloudflared logs no URL for named tunnels.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use url::Url;

static TUNNEL_URL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https://[A-Za-z0-9.-]+(?::[0-9]+)?(?:/\S*)?").unwrap());

const NAMED_READY_AFTER: Duration = Duration::from_millis(800);
const NAMED_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Default)]
pub struct TunnelOptions {
    pub binary: String,
    pub local_url: String,
    pub startup_timeout: Duration,
    pub mode: String,
    pub hostname: String,
    pub tunnel_name: String,
    pub tunnel_token: String,
    pub config_file: String,
    pub credentials_file: String,
}

/// A running cloudflared child. `stop()` is idempotent.
#[derive(Debug)]
pub struct TunnelHandle {
    child: tokio::process::Child,
    pid: Option<u32>,
    public_url: String,
    stopped: bool,
}

impl TunnelHandle {
    pub fn public_url(&self) -> &str {
        &self.public_url
    }

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

/// Start the tunnel child and resolve its public URL.
pub async fn start(opts: TunnelOptions) -> Result<TunnelHandle> {
    let binary = if opts.binary.trim().is_empty() {
        "cloudflared"
    } else {
        opts.binary.trim()
    };
    let local_url = opts.local_url.trim();
    if local_url.is_empty() {
        bail!("local url is required");
    }
    let startup_timeout = if opts.startup_timeout.is_zero() {
        Duration::from_secs(20)
    } else {
        opts.startup_timeout
    };
    let (args, expected_url) = build_invocation(local_url, &opts)?;

    let mut command = Command::new(binary);
    command.args(&args).stdin(Stdio::null()).kill_on_drop(true);
    if expected_url.is_empty() {
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
    } else {
        // Named mode discards output; nobody reads the pipes.
        command.stdout(Stdio::null()).stderr(Stdio::null());
    }
    let mut child = command.spawn().map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            anyhow::anyhow!("cloudflare tunnel binary not found: {binary}")
        } else {
            anyhow::Error::from(err).context(format!("start {binary}"))
        }
    })?;
    let pid = child.id();

    if !expected_url.is_empty() {
        if let Err(err) = wait_for_process_startup(&mut child, startup_timeout).await {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(err);
        }
        tracing::info!(url = %expected_url, "named tunnel ready");
        return Ok(TunnelHandle {
            child,
            pid,
            public_url: expected_url,
            stopped: false,
        });
    }

    // Ephemeral mode: both pipes feed one line channel; the first line with
    // an https URL wins.
    let (line_tx, mut line_rx) = mpsc::channel::<String>(32);
    if let Some(stdout) = child.stdout.take() {
        spawn_line_reader(stdout, line_tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_line_reader(stderr, line_tx.clone());
    }
    drop(line_tx);

    let deadline = Instant::now() + startup_timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            let _ = child.start_kill();
            let _ = child.wait().await;
            bail!("timed out waiting for cloudflare tunnel url");
        }
        match timeout(remaining, line_rx.recv()).await {
            Ok(Some(line)) => {
                if let Some(url) = parse_public_url(&line) {
                    tracing::info!(url = %url, "ephemeral tunnel ready");
                    return Ok(TunnelHandle {
                        child,
                        pid,
                        public_url: url,
                        stopped: false,
                    });
                }
            }
            Ok(None) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                bail!("cloudflared exited before reporting a tunnel url");
            }
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                bail!("timed out waiting for cloudflare tunnel url");
            }
        }
    }
}

fn spawn_line_reader(
    pipe: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    tx: mpsc::Sender<String>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }
            // A full channel means the waiter already has what it needs.
            if tx.try_send(line).is_err() && tx.is_closed() {
                break;
            }
        }
    });
}

/// Build the cloudflared argument list and, for named mode, the public URL
/// already known from configuration.
fn build_invocation(local_url: &str, opts: &TunnelOptions) -> Result<(Vec<String>, String)> {
    let mode = opts.mode.trim().to_lowercase();
    let mode = if mode.is_empty() { "ephemeral".to_string() } else { mode };
    match mode.as_str() {
        "ephemeral" => Ok((
            vec![
                "tunnel".into(),
                "--url".into(),
                local_url.into(),
                "--no-autoupdate".into(),
            ],
            String::new(),
        )),
        "named" => {
            let mut public_url = String::new();
            if !opts.hostname.trim().is_empty() {
                public_url = normalize_public_url_from_hostname(&opts.hostname)
                    .context("named tunnel requires a valid hostname")?;
            }
            let token = opts.tunnel_token.trim();
            if !token.is_empty() {
                return Ok((
                    vec!["tunnel".into(), "run".into(), "--token".into(), token.into()],
                    public_url,
                ));
            }
            if public_url.is_empty() {
                bail!("named tunnel requires --tunnel-hostname unless --tunnel-token is provided");
            }
            let mut args = vec![
                "tunnel".into(),
                "--url".into(),
                local_url.into(),
                "--hostname".into(),
                opts.hostname.trim().into(),
                "--no-autoupdate".into(),
            ];
            let config = opts.config_file.trim();
            if !config.is_empty() {
                args.push("--config".into());
                args.push(config.into());
            }
            let creds = opts.credentials_file.trim();
            if !creds.is_empty() {
                args.push("--credentials-file".into());
                args.push(creds.into());
            }
            let name = opts.tunnel_name.trim();
            if !name.is_empty() {
                args.push("--name".into());
                args.push(name.into());
            }
            Ok((args, public_url))
        }
        other => bail!("unsupported tunnel mode {other:?} (expected ephemeral|named)"),
    }
}

fn normalize_public_url_from_hostname(raw: &str) -> Result<String> {
    let mut host = raw.trim().to_string();
    if host.is_empty() {
        bail!("hostname is required");
    }
    if host.contains("://") {
        let parsed = Url::parse(&host).context("parse hostname")?;
        host = parsed
            .host_str()
            .map(str::to_string)
            .unwrap_or_default();
    }
    if let Some(idx) = host.find('/') {
        host.truncate(idx);
    }
    let host = host.trim().trim_matches('/').to_string();
    if host.is_empty() {
        bail!("hostname is empty");
    }
    Ok(format!("https://{host}"))
}

async fn wait_for_process_startup(
    child: &mut tokio::process::Child,
    startup_timeout: Duration,
) -> Result<()> {
    let started_at = Instant::now();
    let deadline = started_at + startup_timeout;
    loop {
        if child
            .try_wait()
            .context("poll cloudflared")?
            .is_some()
        {
            bail!("cloudflared exited before startup completed");
        }
        if started_at.elapsed() >= NAMED_READY_AFTER {
            return Ok(());
        }
        if Instant::now() >= deadline {
            bail!("timed out waiting for cloudflared startup");
        }
        sleep(NAMED_POLL_INTERVAL).await;
    }
}

fn parse_public_url(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    TUNNEL_URL_PATTERN
        .find(line)
        .map(|m| m.as_str().to_string())
}
