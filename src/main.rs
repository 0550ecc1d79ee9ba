//! clusterbus - primary/worker process supervisor

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use clusterbus::ClusterConfig;
use clusterbus::cluster::shutdown::{install_panic_hook, listen_for_signals};
use clusterbus::cluster::{Primary, ProcessSpawner, ShutdownCoordinator, run_standalone, run_worker_main};
use clusterbus::config::ClusterMode;
use clusterbus::hooks::{LoggingHooks, ServiceHooks};
use clusterbus::logging::{self, LogConfig};
use owo_colors::{OwoColorize, Stream::Stderr};
use std::sync::Arc;
use tracing::Level;

use cli::{Cli, Commands, ServeArgs, WorkerArgs};

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    let result = match &cli.command {
        Commands::Serve(args) => cmd_serve(&cli, args),
        Commands::Worker(args) => cmd_worker(args),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!(
                "{}: {}",
                "error"
                    .if_supports_color(Stderr, |text| text.red())
                    .if_supports_color(Stderr, |text| text.bold()),
                e
            );
            for cause in e.chain().skip(1) {
                eprintln!(
                    "  {}: {}",
                    "caused by".if_supports_color(Stderr, |text| text.yellow()),
                    cause
                );
            }
            std::process::exit(1);
        }
    }
}

fn init_logging(cli: &Cli) {
    let mut config = LogConfig::new();
    if cli.quiet {
        config = config.with_level(Level::ERROR).with_filter("error".into());
    } else if cli.verbose > 0 {
        let level = if cli.verbose > 1 {
            Level::TRACE
        } else {
            Level::DEBUG
        };
        config = config
            .with_level(level)
            .with_filter(level.as_str().to_lowercase());
    }
    if let Some(format) = cli.log_format {
        config = config.with_format(format);
    }
    if let Some(path) = &cli.log_file {
        config = config.with_file(path.clone());
    }
    config = config.with_env_overrides();
    if let Commands::Worker(args) = &cli.command {
        config = config.for_worker(args.worker_id);
    }
    logging::init(config);
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create Tokio runtime")
}

fn cmd_serve(cli: &Cli, args: &ServeArgs) -> Result<i32> {
    let mut config = ClusterConfig::new().with_env_overrides();
    if let Some(workers) = args.workers {
        config = config.with_workers(workers);
    }
    if let Some(port) = args.port {
        config = config.with_port(port);
    }
    if args.standalone {
        config = config.with_mode(ClusterMode::Standalone);
    }
    config.validate()?;

    let hooks: Arc<dyn ServiceHooks> = Arc::new(LoggingHooks::new(config.port));
    let rt = runtime()?;
    let code = rt.block_on(async {
        let coordinator = ShutdownCoordinator::new();
        let handle = coordinator.handle();
        listen_for_signals(handle.clone()).context("Failed to install signal handlers")?;
        install_panic_hook(handle);

        let report = match config.mode {
            ClusterMode::Standalone => run_standalone(&config, hooks, coordinator).await?,
            ClusterMode::Cluster => {
                let spawner = ProcessSpawner::current_exe(cli.worker_args())?;
                Primary::new(config, hooks, Box::new(spawner), coordinator)
                    .run()
                    .await?
            }
        };
        Ok::<_, anyhow::Error>(report.exit_code())
    })?;
    rt.shutdown_background();
    Ok(code)
}

fn cmd_worker(args: &WorkerArgs) -> Result<i32> {
    let config = ClusterConfig::new().with_env_overrides();
    let hooks: Arc<dyn ServiceHooks> = Arc::new(LoggingHooks::new(config.port));
    let rt = runtime()?;
    let code = rt.block_on(run_worker_main(config, hooks, args.worker_id));
    // The stdin reader sits in a blocking read that would stall a normal drop.
    rt.shutdown_background();
    Ok(code)
}
