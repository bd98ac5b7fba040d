// SI remote-control: share a locally attached terminal with a browser over
// one authenticated WebSocket, with credit-based output flow control, an
// idle-timeout lifecycle, on-disk runtime records, and an optional
// cloudflared tunnel.

pub mod app;
pub mod auth;
pub mod cli;
pub mod config;
pub mod power;
pub mod registry;
pub mod tunnel;
pub mod web;

pub use cli::{Cli, Commands};
pub use config::Settings;
