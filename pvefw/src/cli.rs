use clap::{Parser, Subcommand};

use std::path::PathBuf;
use std::time::Duration;

use pvefw_lib::{firewall, inventory, lock};

pub const ENV_VAR_CONFIG_DIR: &str = "PVEFW_CONFIG_DIR";
pub const ENV_VAR_HOST_FW: &str = "PVEFW_HOST_FW";
pub const ENV_VAR_VM_CONFIG_DIR: &str = "PVEFW_VM_CONFIG_DIR";
pub const ENV_VAR_LOCKFILE: &str = "PVEFW_LOCKFILE";
pub const ENV_VAR_PIDFILE: &str = "PVEFW_PIDFILE";
pub const ENV_VAR_INTERVAL: &str = "PVEFW_INTERVAL";

pub const DEFAULT_PIDFILE: &str = "/run/pvefw.pid";

/// Host firewall service: compiles rule files into the kernel filter and
/// keeps the live ruleset converged
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Directory holding per-VM rule files and groups.fw
    #[arg(long, env = ENV_VAR_CONFIG_DIR, default_value = firewall::CONFIG_DIR)]
    pub config_dir: PathBuf,

    /// Host rule file
    #[arg(long, env = ENV_VAR_HOST_FW, default_value = firewall::HOST_FW_PATH)]
    pub host_fw: PathBuf,

    /// Directory holding VM machine configs
    #[arg(long, env = ENV_VAR_VM_CONFIG_DIR, default_value = inventory::VM_CONFIG_DIR)]
    pub vm_config_dir: PathBuf,

    /// Lock file serializing compile and apply across invocations
    #[arg(long, env = ENV_VAR_LOCKFILE, default_value = lock::DEFAULT_LOCKFILE)]
    pub lockfile: PathBuf,

    /// PID file of the running daemon
    #[arg(long, env = ENV_VAR_PIDFILE, default_value = DEFAULT_PIDFILE)]
    pub pidfile: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the reconcile daemon in the foreground
    #[command()]
    Start {
        /// Verbose logging
        #[arg(long)]
        debug: bool,

        /// Delay between reconcile cycles
        #[arg(long, env = ENV_VAR_INTERVAL, default_value = "10s", value_parser = humantime::parse_duration)]
        interval: Duration,
    },

    /// Signal the running daemon to shut down
    #[command()]
    Stop {},

    /// Compile the ruleset and report whether the kernel needs changes
    #[command()]
    Compile {
        /// Also print the restore script an apply would install
        #[arg(long)]
        verbose: bool,
    },

    /// Query firewall status and pending changes
    #[command()]
    Status {
        /// Format output as json
        #[arg(long)]
        json: bool,
    },
}

pub fn parse() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cli_with_minimum_arguments() -> anyhow::Result<()> {
        let args = Cli::try_parse_from(["pvefw", "status"])?;
        assert!(matches!(args.command, Command::Status { json: false }));
        assert_eq!(args.config_dir, PathBuf::from(firewall::CONFIG_DIR));
        Ok(())
    }

    #[test]
    fn start_accepts_a_custom_interval() -> anyhow::Result<()> {
        let args = Cli::try_parse_from(["pvefw", "start", "--interval", "30s", "--debug"])?;
        match args.command {
            Command::Start { debug, interval } => {
                assert!(debug);
                assert_eq!(interval, Duration::from_secs(30));
            }
            other => panic!("unexpected command {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn path_options_override_the_defaults() -> anyhow::Result<()> {
        let args = Cli::try_parse_from(["pvefw", "--config-dir", "/tmp/fw", "compile"])?;
        assert_eq!(args.config_dir, PathBuf::from("/tmp/fw"));
        Ok(())
    }
}
