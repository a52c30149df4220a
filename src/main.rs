use std::path::PathBuf;

use clap::Parser;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use irccd::bot::Bot;
use irccd::config;

#[derive(Debug, Error)]
enum RunnerErr {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

type Result<T> = core::result::Result<T, RunnerErr>;

/// IRC client daemon.
#[derive(Debug, Parser)]
#[command(name = "irccd", version)]
struct Args {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", default_value = "irccd.conf")]
    config: PathBuf,

    /// Force verbose logging regardless of the [logs] section.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn init_logging(logs: &config::LogsSection, verbose: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose || logs.verbose {
            EnvFilter::new("irccd=debug,info")
        } else {
            EnvFilter::new("info")
        }
    });

    match (logs.sink.as_deref(), &logs.path) {
        (Some("syslog"), _) => {
            // no syslog sink in this build; console keeps the messages
            eprintln!("irccd: syslog logging is not supported, using console");
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
        (Some("file"), Some(path)) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let document = config::load(&args.config)?;
    init_logging(&document.logs, args.verbose)?;

    if let Some(pid_file) = &document.general.pid_file {
        std::fs::write(pid_file, format!("{}\n", std::process::id()))?;
    }
    if document.general.user.is_some() || document.general.group.is_some() {
        tracing::warn!("privilege dropping is not supported, user/group ignored");
    }

    info!(config = %args.config.display(), "starting irccd");

    let bot = Bot::new();
    config::apply(&bot, &document).await?;

    let stopper = bot.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            stopper.stop().await;
        }
    });

    bot.run().await;

    if let Some(pid_file) = &document.general.pid_file {
        let _ = std::fs::remove_file(pid_file);
    }

    Ok(())
}
