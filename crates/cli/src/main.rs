mod config;
mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use common::{Result, TracingSink};
use config::{TunnelEntry, TunnelFile};
use forward::{Supervisor, TunnelState};
use logging::LogFormat;
use ssh::SshConnector;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(
    author,
    version,
    about = "Run SSH local, remote and dynamic (SOCKS5 / HTTP CONNECT) tunnels"
)]
struct Cli {
    /// Tunnel definition file (defaults to the platform config dir)
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long = "log-level", default_value = "info", global = true)]
    log_level: String,

    /// Log output format
    #[arg(long = "log-format", value_enum, default_value = "pretty", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start tunnels and keep them up until interrupted
    Run {
        /// Only start these tunnel ids (repeatable)
        #[arg(short = 't', long = "tunnel")]
        tunnels: Vec<String>,
    },
    /// Check the tunnel file and print each forwarding rule
    Validate,
}

impl Cli {
    fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(config::default_path)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let path = cli.config_path();

    match &cli.command {
        Command::Validate => match config::load(&path) {
            Ok(file) => {
                for entry in &file.tunnels {
                    println!(
                        "{} ({}): {} via {}@{}",
                        entry.tunnel.id,
                        entry.tunnel.mode,
                        entry.tunnel.rule(),
                        entry.ssh.credential.username,
                        common::format_target(&entry.ssh.credential.host, entry.ssh.credential.port),
                    );
                }
                println!("ok: {} tunnel(s) in {}", file.tunnels.len(), path.display());
            }
            Err(e) => {
                eprintln!("error: {e}");
                std::process::exit(1);
            }
        },
        Command::Run { tunnels } => {
            let _guard = logging::init_logging(&cli.log_level, cli.log_format);
            match run(&path, tunnels).await {
                Ok(true) => {}
                Ok(false) => std::process::exit(1),
                Err(e) => {
                    error!("Error: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }
}

fn supervisor(entry: &TunnelEntry) -> Supervisor<SshConnector> {
    let connector = SshConnector::new(entry.ssh.credential.clone())
        .host_key(entry.ssh.host_key.clone())
        .proxy(entry.ssh.proxy.clone())
        .keepalive(entry.tunnel.keepalive)
        .timeouts(entry.tunnel.timeouts);
    Supervisor::new(entry.tunnel.clone(), connector, Arc::new(TracingSink))
}

/// Runs the selected tunnels until Ctrl-C. Returns `false` when every tunnel
/// ended up Failed.
async fn run(path: &std::path::Path, only: &[String]) -> Result<bool> {
    let file: TunnelFile = config::load(path)?;
    let entries = file.select(only)?;
    if entries.is_empty() {
        warn!(path = %path.display(), "no tunnels defined");
        return Ok(true);
    }

    let supervisors: Vec<Arc<Supervisor<SshConnector>>> =
        entries.iter().map(|e| Arc::new(supervisor(e))).collect();

    for sup in &supervisors {
        let id = sup.config().id.clone();
        if let Err(e) = sup.start().await {
            error!(tunnel = %id, error = %e, "tunnel did not start");
            continue;
        }
        let mut status = sup.subscribe();
        tokio::spawn(async move {
            let mut last = status.borrow().state;
            while status.changed().await.is_ok() {
                let current = status.borrow_and_update().clone();
                if current.state == last {
                    continue;
                }
                last = current.state;
                match (&current.state, &current.last_error) {
                    (TunnelState::Failed, Some(e)) => {
                        error!(tunnel = %id, state = %current.state, error = %e, "tunnel state changed")
                    }
                    _ => info!(tunnel = %id, state = %current.state, "tunnel state changed"),
                }
            }
        });
    }

    let all_failed = async {
        for sup in &supervisors {
            sup.wait_for(|s| s.state == TunnelState::Failed).await;
        }
    };

    let failed = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, stopping tunnels");
            false
        }
        _ = all_failed => true,
    };

    for sup in &supervisors {
        sup.stop().await;
    }

    if failed {
        error!("every tunnel failed, exiting");
    }
    Ok(!failed)
}
