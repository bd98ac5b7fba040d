//! Session supervisor.
//!
//! Wires one terminal to one WebSocket bridge and one HTTP listener, then
//! blocks until the first of: a signal, terminal exit, listener failure, or
//! the idle deadline. Shutdown order: cancel, close client sockets, close
//! the pty, stop the tunnel child, stop the keep-awake child, remove the
//! runtime record, then give the HTTP server three seconds to drain.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use colored::Colorize;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use remote_control_terminal::Terminal;

use crate::app::{build_share_url, normalize_tunnel_mode, Ui};
use crate::auth;
use crate::cli::{resolve_toggle, CommonFlags};
use crate::config::{self, Settings};
use crate::power;
use crate::registry::{Registry, SessionState};
use crate::tunnel::{self, TunnelOptions};
use crate::web::bridge::{BridgeOptions, ClientCountCallback, WsBridge};
use crate::web::routes::{create_router, AppState};

const HEALTH_WAIT_BUDGET: Duration = Duration::from_secs(5);
const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(150);
const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_millis(1500);
const GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(3);

/// Everything one `attach`/`start` invocation resolved from settings and
/// flags before the supervisor takes over.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub id: String,
    pub bind: String,
    pub port: u16,
    pub readonly: bool,
    pub max_clients: usize,
    pub flow_low_bytes: i64,
    pub flow_high_bytes: i64,
    pub flow_ack_bytes: i64,
    pub token_ttl: Duration,
    pub idle_timeout: Duration,
    pub enable_tunnel: bool,
    pub tunnel_required: bool,
    pub cloudflared_binary: String,
    pub cloudflare_timeout: Duration,
    pub tunnel_mode: String,
    pub tunnel_hostname: String,
    pub tunnel_name: String,
    pub tunnel_token: String,
    pub tunnel_config_file: String,
    pub tunnel_credentials_file: String,
    pub enable_caffeinate: bool,
    pub access_code: String,
    pub token_in_url: bool,
    pub emoji: bool,
    pub mask_tokens: bool,
}

impl LaunchOptions {
    /// Merge settings-file defaults with command-line overrides.
    pub fn resolve(settings: &Settings, flags: &CommonFlags) -> Self {
        Self {
            id: flags.id.clone().unwrap_or_default().trim().to_string(),
            bind: flags
                .bind
                .clone()
                .unwrap_or_else(|| settings.server.bind.clone())
                .trim()
                .to_string(),
            port: flags.port.unwrap_or(settings.server.port),
            readonly: if flags.readwrite {
                false
            } else {
                settings.security.readonly_default
            },
            max_clients: settings.session.max_clients,
            flow_low_bytes: settings.flow.low_watermark_bytes,
            flow_high_bytes: settings.flow.high_watermark_bytes,
            flow_ack_bytes: settings.flow.ack_quantum_bytes,
            token_ttl: Duration::from_secs(settings.session.token_ttl_seconds),
            idle_timeout: Duration::from_secs(settings.session.idle_timeout_seconds),
            enable_tunnel: resolve_toggle(flags.tunnel, flags.no_tunnel, settings.tunnel.enabled),
            tunnel_required: flags.tunnel_required || settings.tunnel.required,
            cloudflared_binary: flags
                .cloudflared_bin
                .clone()
                .unwrap_or_else(|| settings.tunnel.cloudflare.binary.clone())
                .trim()
                .to_string(),
            cloudflare_timeout: Duration::from_secs(
                settings.tunnel.cloudflare.startup_timeout_seconds,
            ),
            tunnel_mode: flags
                .tunnel_mode
                .clone()
                .unwrap_or_else(|| settings.tunnel.mode.clone())
                .trim()
                .to_string(),
            tunnel_hostname: flags
                .tunnel_hostname
                .clone()
                .unwrap_or_else(|| settings.tunnel.named.hostname.clone())
                .trim()
                .to_string(),
            tunnel_name: flags
                .tunnel_name
                .clone()
                .unwrap_or_else(|| settings.tunnel.named.tunnel_name.clone())
                .trim()
                .to_string(),
            tunnel_token: flags
                .tunnel_token
                .clone()
                .unwrap_or_else(|| settings.tunnel.named.tunnel_token.clone())
                .trim()
                .to_string(),
            tunnel_config_file: flags
                .cloudflared_config
                .clone()
                .unwrap_or_else(|| settings.tunnel.named.config_file.clone())
                .trim()
                .to_string(),
            tunnel_credentials_file: flags
                .cloudflared_credentials
                .clone()
                .unwrap_or_else(|| settings.tunnel.named.credentials_file.clone())
                .trim()
                .to_string(),
            enable_caffeinate: resolve_toggle(
                flags.caffeinate,
                flags.no_caffeinate,
                settings.macos.caffeinate,
            ),
            access_code: flags
                .access_code
                .clone()
                .unwrap_or_else(|| settings.security.access_code.clone())
                .trim()
                .to_string(),
            token_in_url: resolve_toggle(
                flags.token_in_url,
                flags.no_token_in_url,
                settings.token_in_url(),
            ),
            emoji: settings.ui.emoji,
            mask_tokens: settings.security.mask_tokens_in_logs,
        }
    }
}

enum RuntimeEvent {
    /// Terminal process finished; `Some` carries the failure description.
    Terminal(Option<String>),
    Server(String),
    Idle,
}

/// Run one session to completion. Returns the process exit code.
pub async fn run_server(terminal: Terminal, opts: LaunchOptions) -> Result<i32> {
    let ui = Ui { emoji: opts.emoji };
    if opts.port == 0 {
        bail!("invalid --port value 0 (expected 1-65535)");
    }
    let bind = if opts.bind.trim().is_empty() {
        "127.0.0.1".to_string()
    } else {
        opts.bind.trim().to_string()
    };
    let id = if opts.id.is_empty() {
        format!("rc-{}", Utc::now().timestamp())
    } else {
        opts.id.clone()
    };
    let issued = auth::new_token_with_ttl(opts.token_ttl);
    tracing::info!(
        session = %id,
        token = %auth::display_token(&issued.value, opts.mask_tokens),
        expires_at = %issued.expires_at.to_rfc3339(),
        "session token issued"
    );

    let addr = format!("{bind}:{}", opts.port);
    let local_url = format!("http://{addr}/");
    let require_code = !opts.access_code.is_empty();
    let mut share_url = build_share_url(&local_url, &issued.value, opts.token_in_url, require_code);
    let settings_file = config::settings_path()
        .map(|p| p.display().to_string())
        .unwrap_or_default();

    let registry = Registry::open_default()?;
    let terminal = Arc::new(terminal);
    let started_at = Utc::now();
    let idle_delta = chrono::Duration::from_std(opts.idle_timeout).ok();
    let mut initial_state = SessionState {
        id: id.clone(),
        mode: terminal.mode().as_str().to_string(),
        source: terminal.source().to_string(),
        readonly: opts.readonly,
        pid: std::process::id(),
        addr: addr.clone(),
        url: local_url.clone(),
        local_url: local_url.clone(),
        public_url: String::new(),
        tunnel: "local".into(),
        tunnel_mode: normalize_tunnel_mode(&opts.tunnel_mode),
        token_in_url: opts.token_in_url,
        access_code_auth: require_code,
        client_count: 0,
        started_at: Some(started_at),
        updated_at: None,
        token_expires_at: Some(issued.expires_at),
        idle_deadline: None,
        idle_timeout_seconds: opts.idle_timeout.as_secs(),
        settings_file,
        cloudflared_pid: 0,
        caffeinate_pid: 0,
    };
    if !opts.idle_timeout.is_zero() {
        initial_state.idle_deadline = idle_delta.map(|d| started_at + d);
    }
    if let Err(err) = registry.save(&initial_state) {
        eprintln!(
            "{}{} {err:#}",
            ui.prefix("⚠️"),
            "Could not persist runtime state:".yellow()
        );
    }
    let shared_state = Arc::new(StdMutex::new(initial_state));

    let bridge = {
        let callback_state = Arc::clone(&shared_state);
        let callback_registry = registry.clone();
        let idle_timeout = opts.idle_timeout;
        let on_count: ClientCountCallback = Box::new(move |count: usize| {
            let mut state = callback_state.lock().unwrap();
            state.client_count = count;
            if !idle_timeout.is_zero() {
                state.idle_deadline = if count == 0 {
                    chrono::Duration::from_std(idle_timeout)
                        .ok()
                        .map(|d| Utc::now() + d)
                } else {
                    None
                };
            }
            let _ = callback_registry.save(&state);
        });
        Arc::new(WsBridge::new(
            Arc::clone(&terminal),
            issued.value.clone(),
            BridgeOptions {
                read_only: opts.readonly,
                max_clients: opts.max_clients,
                low_watermark_bytes: opts.flow_low_bytes,
                high_watermark_bytes: opts.flow_high_bytes,
                ack_quantum_bytes: opts.flow_ack_bytes,
                token_expires_at: Some(issued.expires_at),
                access_code: opts.access_code.clone(),
                on_client_count_change: Some(on_count),
                ..BridgeOptions::default()
            },
        ))
    };
    bridge.start();

    let router = create_router(AppState {
        bridge: Arc::clone(&bridge),
        session_id: id.clone(),
    });
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;

    let run_cancel = CancellationToken::new();
    let (events_tx, mut events_rx) = mpsc::channel::<RuntimeEvent>(4);

    let server_task = {
        let run_cancel = run_cancel.clone();
        let events_tx = events_tx.clone();
        tokio::spawn(async move {
            let shutdown = async move { run_cancel.cancelled().await };
            if let Err(err) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                let _ = events_tx.send(RuntimeEvent::Server(err.to_string())).await;
            }
        })
    };

    {
        let terminal = Arc::clone(&terminal);
        let events_tx = events_tx.clone();
        tokio::task::spawn_blocking(move || {
            let outcome = match terminal.wait() {
                Ok(status) if status.success() => None,
                Ok(status) => Some(format!("exit status {}", status.exit_code())),
                Err(err) => Some(format!("{err:#}")),
            };
            let _ = events_tx.blocking_send(RuntimeEvent::Terminal(outcome));
        });
    }

    if !opts.idle_timeout.is_zero() {
        let shared = Arc::clone(&shared_state);
        let run_cancel = run_cancel.clone();
        let events_tx = events_tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = run_cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let (count, deadline) = {
                            let state = shared.lock().unwrap();
                            (state.client_count, state.idle_deadline)
                        };
                        if count > 0 {
                            continue;
                        }
                        let Some(deadline) = deadline else { continue };
                        if Utc::now() >= deadline {
                            let _ = events_tx.send(RuntimeEvent::Idle).await;
                            return;
                        }
                    }
                }
            }
        });
    }

    let mut tunnel_handle = None;
    if opts.enable_tunnel {
        let health_url = format!("{}healthz", local_url);
        match wait_for_local_health(&health_url, HEALTH_WAIT_BUDGET).await {
            Err(err) if opts.tunnel_required => {
                shutdown_early(&bridge, &terminal, &registry, &id, &run_cancel).await;
                return Err(err.context("local server did not become ready for tunnel startup"));
            }
            Err(err) => {
                eprintln!(
                    "{}{} {err:#}",
                    ui.prefix("⚠️"),
                    "Tunnel skipped because local server readiness check failed:".yellow()
                );
            }
            Ok(()) => {
                let result = tunnel::start(TunnelOptions {
                    binary: opts.cloudflared_binary.clone(),
                    local_url: local_url.trim_end_matches('/').to_string(),
                    startup_timeout: opts.cloudflare_timeout,
                    mode: opts.tunnel_mode.clone(),
                    hostname: opts.tunnel_hostname.clone(),
                    tunnel_name: opts.tunnel_name.clone(),
                    tunnel_token: opts.tunnel_token.clone(),
                    config_file: opts.tunnel_config_file.clone(),
                    credentials_file: opts.tunnel_credentials_file.clone(),
                })
                .await;
                match result {
                    Err(err) if opts.tunnel_required => {
                        shutdown_early(&bridge, &terminal, &registry, &id, &run_cancel).await;
                        return Err(err.context("tunnel startup failed"));
                    }
                    Err(err) => {
                        eprintln!(
                            "{}{} {err:#}",
                            ui.prefix("⚠️"),
                            "Tunnel unavailable; continuing in local mode:".yellow()
                        );
                    }
                    Ok(handle) => {
                        let public_base = handle.public_url().trim().to_string();
                        share_url = build_share_url(
                            &public_base,
                            &issued.value,
                            opts.token_in_url,
                            require_code,
                        );
                        {
                            let mut state = shared_state.lock().unwrap();
                            state.tunnel =
                                format!("cloudflare-{}", normalize_tunnel_mode(&opts.tunnel_mode));
                            state.public_url = public_base.clone();
                            state.url = public_base;
                            state.cloudflared_pid = handle.pid().unwrap_or(0);
                            let _ = registry.save(&state);
                        }
                        tunnel_handle = Some(handle);
                    }
                }
            }
        }
    }

    let mut power_handle = None;
    if opts.enable_caffeinate {
        match power::start().await {
            Err(err) => {
                eprintln!(
                    "{}{} {err:#}",
                    ui.prefix("⚠️"),
                    "Could not start caffeinate:".yellow()
                );
            }
            Ok(Some(handle)) => {
                let mut state = shared_state.lock().unwrap();
                state.caffeinate_pid = handle.pid().unwrap_or(0);
                let _ = registry.save(&state);
                drop(state);
                power_handle = Some(handle);
            }
            Ok(None) => {}
        }
    }

    println!("{}{}", ui.prefix("✅"), "SI remote-control is live".green());
    println!("{}Session ID: {id}", ui.prefix("🆔"));
    println!("{}Share URL: {}", ui.prefix("🌐"), share_url.bold());
    println!("{}Local URL: {local_url}", ui.prefix("🏠"));
    if !opts.token_in_url {
        println!("{}Access Token: {}", ui.prefix("🔑"), issued.value);
    }
    if require_code {
        println!("{}Access Code: {}", ui.prefix("🔐"), opts.access_code);
    }
    println!(
        "{}Token expires: {}",
        ui.prefix("⏳"),
        issued.expires_at.to_rfc3339()
    );
    {
        let public = shared_state.lock().unwrap().public_url.clone();
        if !public.is_empty() {
            println!("{}Tunnel URL: {public}", ui.prefix("☁️"));
        }
    }
    if opts.readonly {
        println!("{}Mode: read-only", ui.prefix("🔒"));
    } else {
        println!("{}Mode: read-write", ui.prefix("✍️"));
    }
    if !opts.idle_timeout.is_zero() {
        println!(
            "{}Idle timeout: {}s",
            ui.prefix("🕒"),
            opts.idle_timeout.as_secs()
        );
    }
    println!("{}Open the URL in Chrome or Safari.", ui.prefix("📱"));
    println!("{}Press Ctrl+C to stop sharing.", ui.prefix("🛑"));

    let exit_code = tokio::select! {
        _ = tokio::signal::ctrl_c() => 0,
        _ = sigterm() => 0,
        event = events_rx.recv() => match event {
            Some(RuntimeEvent::Terminal(None)) => {
                println!("{}Terminal process exited.", ui.prefix("ℹ️"));
                0
            }
            Some(RuntimeEvent::Terminal(Some(detail))) => {
                eprintln!(
                    "{}{} {detail}",
                    ui.prefix("❌"),
                    "Terminal process exited with error:".red()
                );
                1
            }
            Some(RuntimeEvent::Idle) => {
                println!("{}Idle timeout reached. Session stopped.", ui.prefix("⏱️"));
                0
            }
            Some(RuntimeEvent::Server(detail)) => {
                eprintln!("{}{} {detail}", ui.prefix("❌"), "Server error:".red());
                1
            }
            None => 0,
        },
    };

    run_cancel.cancel();
    bridge.close().await;
    terminal.close();
    if let Some(mut handle) = tunnel_handle {
        handle.stop().await;
    }
    if let Some(mut handle) = power_handle {
        handle.stop().await;
    }
    let _ = registry.remove(&id);
    let _ = timeout(GRACEFUL_SHUTDOWN, server_task).await;
    Ok(exit_code)
}

/// Teardown used when startup fails after the record and bridge exist.
async fn shutdown_early(
    bridge: &Arc<WsBridge>,
    terminal: &Arc<Terminal>,
    registry: &Registry,
    id: &str,
    run_cancel: &CancellationToken,
) {
    run_cancel.cancel();
    bridge.close().await;
    terminal.close();
    let _ = registry.remove(id);
}

async fn wait_for_local_health(health_url: &str, budget: Duration) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(HEALTH_REQUEST_TIMEOUT)
        .build()
        .context("build readiness probe client")?;
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        if let Ok(response) = client.get(health_url).send().await {
            let status = response.status().as_u16();
            if (200..500).contains(&status) {
                return Ok(());
            }
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("timed out waiting for {health_url}");
        }
        tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
    }
}

#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(_) => std::future::pending::<()>().await,
    }
}

#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending::<()>().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::CommonFlags;

    fn flags() -> CommonFlags {
        CommonFlags {
            bind: None,
            port: None,
            id: None,
            readwrite: false,
            tunnel: false,
            no_tunnel: false,
            tunnel_required: false,
            tunnel_mode: None,
            tunnel_hostname: None,
            tunnel_name: None,
            tunnel_token: None,
            cloudflared_bin: None,
            cloudflared_config: None,
            cloudflared_credentials: None,
            access_code: None,
            token_in_url: false,
            no_token_in_url: false,
            caffeinate: false,
            no_caffeinate: false,
        }
    }

    #[test]
    fn options_default_from_settings() {
        let settings = Settings::default();
        let opts = LaunchOptions::resolve(&settings, &flags());
        assert_eq!(opts.bind, "127.0.0.1");
        assert_eq!(opts.port, 8080);
        assert!(opts.readonly);
        assert!(opts.enable_tunnel);
        assert!(opts.token_in_url);
        assert_eq!(opts.token_ttl, Duration::from_secs(3600));
        assert_eq!(opts.idle_timeout, Duration::from_secs(900));
        assert_eq!(opts.cloudflared_binary, "cloudflared");
    }

    #[test]
    fn flag_overrides_win() {
        let settings = Settings::default();
        let mut f = flags();
        f.readwrite = true;
        f.no_tunnel = true;
        f.no_token_in_url = true;
        f.port = Some(9443);
        f.bind = Some("0.0.0.0".into());
        f.access_code = Some(" 1234 ".into());
        let opts = LaunchOptions::resolve(&settings, &f);
        assert!(!opts.readonly);
        assert!(!opts.enable_tunnel);
        assert!(!opts.token_in_url);
        assert_eq!(opts.port, 9443);
        assert_eq!(opts.bind, "0.0.0.0");
        assert_eq!(opts.access_code, "1234");
    }

    #[tokio::test]
    async fn port_zero_is_rejected() {
        let settings = Settings::default();
        let mut opts = LaunchOptions::resolve(&settings, &flags());
        opts.port = 0;
        let terminal = Terminal::start_command("cat").unwrap();
        let err = run_server(terminal, opts).await.unwrap_err();
        assert!(err.to_string().contains("expected 1-65535"), "{err}");
    }
}
