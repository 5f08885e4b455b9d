//! CLI definition using clap derive.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "roots", about = "Anomaly detection for application telemetry")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the detectors and run until interrupted
    Run(ConfigOpts),
    /// Validate the configuration and every detector descriptor, then exit
    Check(ConfigOpts),
}

#[derive(clap::Args)]
pub struct ConfigOpts {
    /// Main configuration file
    #[arg(long, short = 'c', env = "ROOTS_CONFIG", default_value = "conf/roots.toml")]
    pub config: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_config() {
        let cli = Cli::try_parse_from(["roots", "run", "--config", "/etc/roots.toml"]).expect("parse");
        let Command::Run(opts) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(opts.config, PathBuf::from("/etc/roots.toml"));
    }

    #[test]
    fn subcommand_is_required() {
        assert!(Cli::try_parse_from(["roots"]).is_err());
    }
}
