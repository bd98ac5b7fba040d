//! Settings file handling.
//!
//! Settings live at `<home>/settings.toml` where `<home>` is
//! `$SI_REMOTE_CONTROL_HOME` or `~/.si/remote-control`. The file is created
//! with defaults on first load, unknown keys are tolerated, and every value
//! is trimmed/clamped here so the rest of the tool never re-validates.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

pub const HOME_ENV: &str = "SI_REMOTE_CONTROL_HOME";
pub const SETTINGS_ENV: &str = "SI_REMOTE_CONTROL_SETTINGS_FILE";
pub const RUNTIME_DIR_ENV: &str = "SI_REMOTE_CONTROL_RUNTIME_DIR";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub schema_version: u32,
    pub server: ServerSettings,
    pub session: SessionSettings,
    pub flow: FlowSettings,
    pub tunnel: TunnelSettings,
    pub security: SecuritySettings,
    pub ui: UiSettings,
    pub logging: LoggingSettings,
    pub macos: MacOsSettings,
    #[serde(skip_serializing_if = "MetadataSettings::is_empty")]
    pub metadata: MetadataSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub default_mode: String,
    pub token_ttl_seconds: u64,
    pub idle_timeout_seconds: u64,
    pub max_clients: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowSettings {
    pub low_watermark_bytes: i64,
    pub high_watermark_bytes: i64,
    pub ack_quantum_bytes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSettings {
    pub enabled: bool,
    pub provider: String,
    pub required: bool,
    pub mode: String,
    pub named: NamedTunnelSettings,
    pub cloudflare: CloudflareTunnelSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NamedTunnelSettings {
    pub hostname: String,
    pub tunnel_name: String,
    pub tunnel_token: String,
    pub config_file: String,
    pub credentials_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudflareTunnelSettings {
    pub enabled: bool,
    pub binary: String,
    pub startup_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySettings {
    pub readonly_default: bool,
    pub mask_tokens_in_logs: bool,
    pub access_code: String,
    pub token_in_url: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiSettings {
    pub emoji: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MacOsSettings {
    pub caffeinate: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataSettings {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub updated_at: String,
}

impl MetadataSettings {
    fn is_empty(&self) -> bool {
        self.updated_at.is_empty()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            schema_version: 1,
            server: ServerSettings::default(),
            session: SessionSettings::default(),
            flow: FlowSettings::default(),
            tunnel: TunnelSettings::default(),
            security: SecuritySettings::default(),
            ui: UiSettings::default(),
            logging: LoggingSettings::default(),
            macos: MacOsSettings::default(),
            metadata: MetadataSettings::default(),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 8080,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_mode: "attach".into(),
            token_ttl_seconds: 3600,
            idle_timeout_seconds: 900,
            max_clients: 1,
        }
    }
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            low_watermark_bytes: 512 * 1024,
            high_watermark_bytes: 2 * 1024 * 1024,
            ack_quantum_bytes: 256 * 1024,
        }
    }
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: "cloudflare".into(),
            required: false,
            mode: "ephemeral".into(),
            named: NamedTunnelSettings::default(),
            cloudflare: CloudflareTunnelSettings::default(),
        }
    }
}

impl Default for CloudflareTunnelSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: "cloudflared".into(),
            startup_timeout_seconds: 20,
        }
    }
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            readonly_default: true,
            mask_tokens_in_logs: true,
            access_code: String::new(),
            token_in_url: Some(true),
        }
    }
}

impl Default for UiSettings {
    fn default() -> Self {
        Self { emoji: true }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: String::new(),
        }
    }
}

impl Default for MacOsSettings {
    fn default() -> Self {
        Self { caffeinate: true }
    }
}

impl Settings {
    pub fn token_in_url(&self) -> bool {
        self.security.token_in_url.unwrap_or(true)
    }
}

fn apply_defaults(s: &mut Settings) {
    if s.schema_version == 0 {
        s.schema_version = 1;
    }
    s.server.bind = s.server.bind.trim().to_string();
    if s.server.bind.is_empty() {
        s.server.bind = "127.0.0.1".into();
    }
    if s.server.port == 0 {
        s.server.port = 8080;
    }
    s.session.default_mode = s.session.default_mode.trim().to_lowercase();
    if s.session.default_mode != "attach" && s.session.default_mode != "cmd" {
        s.session.default_mode = "attach".into();
    }
    if s.session.token_ttl_seconds == 0 {
        s.session.token_ttl_seconds = 3600;
    }
    if s.session.idle_timeout_seconds == 0 {
        s.session.idle_timeout_seconds = 900;
    }
    if s.session.max_clients == 0 {
        s.session.max_clients = 1;
    }
    if s.flow.low_watermark_bytes <= 0 {
        s.flow.low_watermark_bytes = 512 * 1024;
    }
    if s.flow.high_watermark_bytes <= 0 {
        s.flow.high_watermark_bytes = 2 * 1024 * 1024;
    }
    if s.flow.low_watermark_bytes > s.flow.high_watermark_bytes {
        s.flow.low_watermark_bytes = (s.flow.high_watermark_bytes / 2).max(1);
    }
    if s.flow.ack_quantum_bytes <= 0 {
        s.flow.ack_quantum_bytes = 256 * 1024;
    }
    s.tunnel.provider = s.tunnel.provider.trim().to_lowercase();
    if s.tunnel.provider.is_empty() {
        s.tunnel.provider = "cloudflare".into();
    }
    s.tunnel.mode = s.tunnel.mode.trim().to_lowercase();
    if s.tunnel.mode != "named" && s.tunnel.mode != "ephemeral" {
        s.tunnel.mode = "ephemeral".into();
    }
    let named = &mut s.tunnel.named;
    named.hostname = named.hostname.trim().to_string();
    named.tunnel_name = named.tunnel_name.trim().to_string();
    named.tunnel_token = named.tunnel_token.trim().to_string();
    named.config_file = named.config_file.trim().to_string();
    named.credentials_file = named.credentials_file.trim().to_string();
    s.tunnel.cloudflare.binary = s.tunnel.cloudflare.binary.trim().to_string();
    if s.tunnel.cloudflare.binary.is_empty() {
        s.tunnel.cloudflare.binary = "cloudflared".into();
    }
    if s.tunnel.cloudflare.startup_timeout_seconds == 0 {
        s.tunnel.cloudflare.startup_timeout_seconds = 20;
    }
    s.security.access_code = s.security.access_code.trim().to_string();
    if s.security.token_in_url.is_none() {
        s.security.token_in_url = Some(true);
    }
    s.logging.level = s.logging.level.trim().to_lowercase();
    if s.logging.level.is_empty() {
        s.logging.level = "info".into();
    }
    s.logging.file = s.logging.file.trim().to_string();
}

/// Tool home directory (`$SI_REMOTE_CONTROL_HOME` or `~/.si/remote-control`).
pub fn home_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(HOME_ENV) {
        let dir = dir.trim();
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    let home = std::env::var("HOME").unwrap_or_default();
    if home.trim().is_empty() {
        bail!("could not determine home directory");
    }
    Ok(PathBuf::from(home).join(".si").join("remote-control"))
}

pub fn settings_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(SETTINGS_ENV) {
        let path = path.trim();
        if !path.is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    Ok(home_dir()?.join("settings.toml"))
}

pub fn runtime_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(RUNTIME_DIR_ENV) {
        let dir = dir.trim();
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    Ok(home_dir()?.join("runtime"))
}

/// Load settings, creating the file with defaults on first run. A file that
/// fails to parse is an error for the caller; nothing is rewritten.
pub fn load() -> Result<Settings> {
    let path = settings_path()?;
    load_from(&path)
}

pub fn load_from(path: &Path) -> Result<Settings> {
    match fs::read_to_string(path) {
        Ok(data) => {
            let mut settings: Settings = toml::from_str(&data)
                .with_context(|| format!("parse settings file {}", path.display()))?;
            apply_defaults(&mut settings);
            Ok(settings)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let settings = Settings::default();
            save_to(path, settings.clone())?;
            Ok(settings)
        }
        Err(err) => Err(err).with_context(|| format!("read settings file {}", path.display())),
    }
}

pub fn save(settings: Settings) -> Result<()> {
    let path = settings_path()?;
    save_to(&path, settings)
}

/// Atomic save: write a temp file next to the target, chmod 0600, rename.
pub fn save_to(path: &Path, mut settings: Settings) -> Result<()> {
    apply_defaults(&mut settings);
    settings.metadata.updated_at = Utc::now().to_rfc3339();
    let data = toml::to_string_pretty(&settings).context("serialize settings")?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    create_private_dir(dir)?;
    let tmp = dir.join(format!(".settings-{}.tmp", std::process::id()));
    fs::write(&tmp, data).with_context(|| format!("write settings temp {}", tmp.display()))?;
    restrict_file_mode(&tmp)?;
    fs::rename(&tmp, path).with_context(|| format!("install settings file {}", path.display()))?;
    Ok(())
}

pub(crate) fn create_private_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
            .with_context(|| format!("restrict directory {}", dir.display()))?;
    }
    Ok(())
}

pub(crate) fn restrict_file_mode(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("restrict file {}", path.display()))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
