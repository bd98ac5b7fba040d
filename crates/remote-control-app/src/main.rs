use clap::Parser;
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use remote_control_app::{app, config, Cli, Commands};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let settings = match config::load() {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("{} {err:#}", "error:".red());
            std::process::exit(1);
        }
    };
    init_tracing(&settings);

    let code = match cli.command {
        Commands::Sessions { all } => app::cmd_sessions(&settings, all),
        Commands::Attach {
            tmux_session,
            tty_path,
            common,
        } => app::cmd_attach(&settings, tmux_session, tty_path, &common).await,
        Commands::Start { cmd, common } => app::cmd_start(&settings, &cmd, &common).await,
        Commands::Status => app::cmd_status(&settings),
        Commands::Stop { id } => app::cmd_stop(&settings, id),
    };
    std::process::exit(code);
}

/// Diagnostics go to stderr (or the configured log file); user-facing lines
/// stay on plain stdout.
fn init_tracing(settings: &remote_control_app::Settings) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if settings.logging.file.is_empty() {
        builder.with_writer(std::io::stderr).init();
    } else {
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&settings.logging.file)
        {
            Ok(file) => builder.with_ansi(false).with_writer(std::sync::Arc::new(file)).init(),
            Err(_) => builder.with_writer(std::io::stderr).init(),
        }
    }
}
