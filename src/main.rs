use clap::Parser;
use coinbasechain::config::{Cli, Config};
use coinbasechain::node::Node;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match Config::resolve(cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(1);
        }
    };

    // RUST_LOG wins over --loglevel/--debug when set
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("cannot start runtime: {err}");
            return ExitCode::from(1);
        }
    };

    runtime.block_on(async {
        let node = match Node::start(config).await {
            Ok(node) => node,
            Err(err) => {
                error!(%err, "startup failed");
                return ExitCode::from(1);
            }
        };
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, "signal handler failed");
        } else {
            info!("interrupt received");
        }
        match node.shutdown().await {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                error!(%err, "shutdown failed");
                ExitCode::from(1)
            }
        }
    })
}
