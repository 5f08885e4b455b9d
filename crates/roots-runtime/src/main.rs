//! roots: anomaly detection daemon.
//! Loads the configuration, starts one detector per application and runs
//! until ctrl-c or SIGTERM.

use clap::Parser;

mod cli;
mod config;
mod environment;

use config::RootsConfig;
use environment::RootsEnvironment;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    let filter = std::env::var("ROOTS_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();

    match args.command {
        cli::Command::Run(opts) => {
            let config = RootsConfig::load(&opts.config)?;
            tracing::info!(id = %config.id, config = %opts.config.display(), "roots starting");

            let env = RootsEnvironment::init(&config)?;
            let summary = match env.load_detectors(&config) {
                Ok(summary) => summary,
                Err(e) => {
                    env.destroy().await;
                    return Err(e);
                }
            };
            if summary.scheduled.is_empty() {
                tracing::warn!("no detectors scheduled");
            }

            let shutdown = environment::wait_for_shutdown().await;
            env.destroy().await;
            shutdown?;
        }
        cli::Command::Check(opts) => {
            let config = RootsConfig::load(&opts.config)?;
            let env = RootsEnvironment::init(&config)?;
            let results = env.check_detectors(&config);
            env.destroy().await;

            let mut failures = 0;
            for (application, result) in results? {
                match result {
                    Ok(()) => println!("ok     {application}"),
                    Err(e) => {
                        failures += 1;
                        println!("error  {application}: {e:#}");
                    }
                }
            }
            if failures > 0 {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}
