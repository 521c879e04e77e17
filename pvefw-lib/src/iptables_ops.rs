//! Abstraction over the kernel filter binaries for testability.
//!
//! Defines the [`IptablesOps`] trait covering the three operations the
//! reconciler needs: dumping the live table, applying a bulk restore
//! script, and single-rule existence checks for the built-in chain jumps.
//! Production code uses [`RealIptablesOps`]; tests use the stateful mock
//! in the `mocks` module. No policy lives here.

use thiserror::Error;

use std::process::Command;

use crate::shell_command_ext::{self, Logs, ShellCommandExt};

pub const IPTABLES_CMD: &str = "iptables";
pub const IPTABLES_SAVE_CMD: &str = "iptables-save";
pub const IPTABLES_RESTORE_CMD: &str = "iptables-restore";

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    ShellCommand(#[from] shell_command_ext::Error),
    #[error("General error: {0}")]
    General(String),
}

pub trait IptablesOps {
    /// Dump the current filter table in save format.
    fn save(&self) -> Result<String, Error>;

    /// Feed a restore script to the bulk-restore interface without
    /// flushing unrelated chains (`iptables-restore -n`). Atomic at the
    /// table level.
    fn restore(&self, script: &str) -> Result<(), Error>;

    /// True iff the exact rule exists in `chain` (`iptables -C`).
    fn rule_exists(&self, chain: &str, rule: &str) -> Result<bool, Error>;

    fn append_rule(&self, chain: &str, rule: &str) -> Result<(), Error>;

    fn delete_rule(&self, chain: &str, rule: &str) -> Result<(), Error>;
}

/// Production [`IptablesOps`] shelling out to the iptables binaries.
pub struct RealIptablesOps;

impl IptablesOps for RealIptablesOps {
    fn save(&self) -> Result<String, Error> {
        Ok(Command::new(IPTABLES_SAVE_CMD).run_stdout(Logs::Print)?)
    }

    fn restore(&self, script: &str) -> Result<(), Error> {
        Command::new(IPTABLES_RESTORE_CMD)
            .arg("-n")
            .run_stdin(script, Logs::Print)?;
        Ok(())
    }

    fn rule_exists(&self, chain: &str, rule: &str) -> Result<bool, Error> {
        Ok(Command::new(IPTABLES_CMD)
            .arg("-C")
            .arg(chain)
            .args(rule.split_whitespace())
            .run_success()?)
    }

    fn append_rule(&self, chain: &str, rule: &str) -> Result<(), Error> {
        Command::new(IPTABLES_CMD)
            .arg("-A")
            .arg(chain)
            .args(rule.split_whitespace())
            .run(Logs::Print)?;
        Ok(())
    }

    fn delete_rule(&self, chain: &str, rule: &str) -> Result<(), Error> {
        Command::new(IPTABLES_CMD)
            .arg("-D")
            .arg(chain)
            .args(rule.split_whitespace())
            .run(Logs::Suppress)?;
        Ok(())
    }
}
