//! jived - work-management engine daemon binary.

use clap::Parser;
use jive_core::Config;
use jived::Daemon;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "jived", about = "Agile work-management engine daemon")]
struct Args {
    /// Workspace root; relative data paths resolve against it.
    #[arg(long, default_value = ".", env = "JIVE_WORKSPACE")]
    workspace_root: PathBuf,

    /// Optional key=value config file.
    #[arg(long, env = "JIVE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the listen port from config.
    #[arg(long)]
    port: Option<u16>,
}

fn main() {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    let exit_code = runtime.block_on(async {
        match Daemon::new(config).await {
            Ok(daemon) => {
                tokio::select! {
                    result = daemon.run() => {
                        match result {
                            Ok(()) => 0,
                            Err(e) => {
                                error!("daemon error: {e}");
                                1
                            }
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("received SIGINT");
                        daemon.shutdown().await;
                        130
                    }
                }
            }
            Err(e) => {
                error!("failed to initialize daemon: {e}");
                1
            }
        }
    });

    std::process::exit(exit_code);
}

fn load_config(args: &Args) -> Result<Config, jive_core::ConfigError> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(port) = args.port {
        config.listen_port = port;
    }
    config.resolve_paths(&args.workspace_root);
    Ok(config)
}
