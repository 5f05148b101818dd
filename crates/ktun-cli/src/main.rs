//! ktun CLI - stop running sessions, inspect them, and relay TCP over guarded connections

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ktun_cli::config::{ConfigManager, KtunConfig};
use ktun_cli::relay::{Relay, RelayConfig};
use ktun_cli::sessions;
use ktun_session::signal_file::request_stop;
use ktun_session::SessionKind;

/// ktun - manage tunnel sessions
#[derive(Parser, Debug)]
#[command(name = "ktun")]
#[command(about = "Manage tunnel sessions and guarded connections", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "KTUN_LOG")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ask a running session to stop through its signal file
    ///
    /// Sessions are started by tools embedding the ktun-session library with
    /// their own cluster integration; this command only talks to them through
    /// the signal files they leave in the temp directory.
    Stop {
        /// Session kind (exchange, mesh, preview)
        kind: SessionKind,
        /// Process id of the session; required when several are running
        #[arg(long)]
        pid: Option<u32>,
    },
    /// List running sessions
    ///
    /// Sessions are discovered through their signal files. ktun itself does
    /// not start sessions; they are run by tools embedding the ktun-session
    /// library with a cluster integration.
    Status {
        /// Print the sessions as JSON
        #[arg(long)]
        json: bool,
    },
    /// Relay local TCP connections to a target with idle timeouts
    Forward {
        /// Address to listen on (host:port)
        #[arg(short, long)]
        listen: String,
        /// Address to relay to (host:port)
        #[arg(short, long)]
        target: String,
        /// Idle timeout in seconds, 0 disables it (defaults to the configured value)
        #[arg(long)]
        idle_timeout: Option<u64>,
    },
    /// Manage global configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Show the current configuration
    Show,
    /// Set the default idle timeout for relayed connections
    SetIdleTimeout {
        /// Seconds, 0 disables the timeout
        seconds: u64,
    },
    /// Set how often sessions poll their signal file
    SetPollInterval {
        /// Milliseconds
        millis: u64,
    },
    /// Restore the default configuration
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    match cli.command {
        Commands::Stop { kind, pid } => handle_stop(kind, pid).await,
        Commands::Status { json } => handle_status(json),
        Commands::Forward {
            listen,
            target,
            idle_timeout,
        } => handle_forward(listen, target, idle_timeout).await,
        Commands::Config { command } => handle_config_command(command),
    }
}

async fn handle_stop(kind: SessionKind, pid: Option<u32>) -> Result<()> {
    let signal = ConfigManager::load()?.signal_config();
    let path = sessions::locate_session(&signal, kind, pid)?;

    request_stop(&path)
        .await
        .context(format!("Failed to write stop request to {:?}", path))?;

    println!("✅ Stop requested for {} session ({})", kind, path.display());
    Ok(())
}

fn handle_status(json: bool) -> Result<()> {
    let signal = ConfigManager::load()?.signal_config();
    let sessions = sessions::running_sessions(&signal)?;

    if json {
        let json =
            serde_json::to_string_pretty(&sessions).context("Failed to serialize sessions")?;
        println!("{}", json);
        return Ok(());
    }

    if sessions.is_empty() {
        println!("No running sessions");
        return Ok(());
    }

    for session in sessions {
        println!(
            "  {:<9} pid {:<8} {}",
            session.kind,
            session.pid,
            session.signal_file.display()
        );
    }
    Ok(())
}

async fn handle_forward(listen: String, target: String, idle_timeout: Option<u64>) -> Result<()> {
    let mut config = ConfigManager::load()?;
    if let Some(seconds) = idle_timeout {
        config.idle_timeout_secs = seconds;
    }

    let relay = Relay::bind(RelayConfig {
        listen,
        target,
        connection: config.connection_config(),
        connect_timeout: config.connect_timeout(),
    })
    .await?;

    let shutdown = CancellationToken::new();
    let interrupt = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupt received, stopping relay"),
            Err(e) => warn!("Failed to listen for interrupts: {}", e),
        }
        interrupt.cancel();
    });

    relay.run(shutdown).await;
    Ok(())
}

fn handle_config_command(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            let path = ConfigManager::config_path()?;
            let config = ConfigManager::load()?;
            println!("Configuration ({})", path.display());
            print_config(&config);
        }
        ConfigCommands::SetIdleTimeout { seconds } => {
            ConfigManager::update(|config| config.idle_timeout_secs = seconds)?;
            if seconds == 0 {
                println!("✅ Idle timeout disabled");
            } else {
                println!("✅ Idle timeout set to {}s", seconds);
            }
        }
        ConfigCommands::SetPollInterval { millis } => {
            if millis == 0 {
                bail!("Poll interval must be greater than 0");
            }
            ConfigManager::update(|config| config.signal_poll_interval_ms = millis)?;
            println!("✅ Signal file poll interval set to {}ms", millis);
        }
        ConfigCommands::Reset => {
            let config = ConfigManager::reset()?;
            println!("✅ Configuration reset to defaults");
            print_config(&config);
        }
    }
    Ok(())
}

fn print_config(config: &KtunConfig) {
    let signal = config.signal_config();
    println!("  Signal prefix:         {}", config.signal_prefix);
    println!("  Signal directory:      {}", signal.dir.display());
    println!("  Poll interval:         {:?}", signal.poll_interval);
    println!("  Idle timeout:          {}s", config.idle_timeout_secs);
    println!("  Idle check interval:   {}s", config.idle_check_interval_secs);
    println!("  Connect timeout:       {}s", config.connect_timeout_secs);
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
