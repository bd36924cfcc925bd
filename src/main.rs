use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tracing::error;

use humo::runtime::{Platform, Runtime, Services};
use humo::AppConfig;

#[derive(Copy, Clone, Debug, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing_subscriber::filter::LevelFilter {
    fn from(level: LogLevel) -> Self {
        use tracing_subscriber::filter::LevelFilter;
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// `humod` — runtime daemon for the Humo companion robot
#[derive(Parser, Debug)]
#[command(name = "humod", version, about = "Companion robot runtime")]
struct Cli {
    /// Path to the JSON application config
    #[arg(long, default_value = "config/app.json")]
    config: PathBuf,

    /// Logging verbosity level
    #[arg(long, default_value = "info")]
    log_level: LogLevel,

    /// Override the WebSocket bind host
    #[arg(long)]
    ws_host: Option<String>,

    /// Override the WebSocket bind port
    #[arg(long)]
    ws_port: Option<u16>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(tracing_subscriber::filter::LevelFilter::from(cli.log_level))
        .init();

    let mut cfg = match AppConfig::from_path(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, config = %cli.config.display(), "failed to load config");
            return ExitCode::from(1);
        }
    };
    if let Some(host) = cli.ws_host {
        cfg.ws.host = host;
    }
    if let Some(port) = cli.ws_port {
        cfg.ws.port = port;
    }

    // Real device drivers live outside this crate; the daemon runs against
    // the headless stand-ins until they are plugged in here.
    let services = match Services::build(cfg, Platform::headless()) {
        Ok(services) => services,
        Err(e) => {
            error!(error = %e, "failed to build services");
            return ExitCode::from(1);
        }
    };

    let runtime = Runtime::new(services);
    match runtime.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "runtime failed");
            runtime.stop().await;
            ExitCode::from(1)
        }
    }
}
