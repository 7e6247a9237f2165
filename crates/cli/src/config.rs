//! Command line configuration.

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::commands::Command;

/// Node mesh tools: identities, persistent bootstrap and an in-process
/// multi-node simulation.
#[derive(Parser, Debug)]
#[command(name = "nodemesh", version, about)]
pub struct CliConfig {
    /// Log filter, e.g. `info` or `replication=debug,messaging=info`.
    /// `RUST_LOG` takes precedence when set.
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

impl CliConfig {
    /// Install logging, run the command on a tokio runtime and print its
    /// JSON output.
    pub fn run(&self) -> anyhow::Result<()> {
        self.init_tracing()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to start the tokio runtime")?;
        let output = runtime.block_on(self.command.execute())?;
        println!("{}", serde_json::to_string_pretty(&output)?);
        Ok(())
    }

    fn init_tracing(&self) -> anyhow::Result<()> {
        let filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::try_new(&self.log_level)
                .with_context(|| format!("invalid log level '{}'", self.log_level))?,
        };
        tracing_subscriber::fmt()
            .compact()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to install the log subscriber: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        CliConfig::command().debug_assert();
    }

    #[test]
    fn test_parse_simulate() {
        let config = CliConfig::parse_from(["nodemesh", "--log-level", "debug", "simulate", "--nodes", "4", "--relay"]);
        assert_eq!(config.log_level, "debug");
        match config.command {
            Command::Simulate { nodes, relay, chain } => {
                assert_eq!(nodes, 4);
                assert!(relay);
                assert!(!chain);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
