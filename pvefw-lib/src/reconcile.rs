//! Content-addressed reconciliation against the live filter table.
//!
//! The kernel's current chains are discovered by parsing the save format;
//! each managed chain carries its signature in a trailing canary comment.
//! The diff works at chain granularity: a changed chain is flushed and
//! fully rewritten inside one atomic restore script.

use regex::Regex;
use thiserror::Error;

use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::compiler::{CHAIN_FORWARD, CHAIN_INPUT, CHAIN_OUTPUT, TOP_CHAINS};
use crate::iptables_ops::{self, IptablesOps};
use crate::ruleset::{Ruleset, signature};

/// Signature reported for managed chains lacking a canary.
pub const SIG_UNKNOWN: &str = "unknown";

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Iptables(#[from] iptables_ops::Error),
    #[error("chain `{chain}` did not converge after apply")]
    VerifyFailed { chain: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainAction {
    Create,
    Update,
    Exists,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainStatus {
    pub sig: String,
    pub action: ChainAction,
}

static MANAGED_CHAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:PVEFW-\S+|tap\d+i\d+-(?:IN|OUT)|vmbr\d+-(?:FW|IN|OUT)|GROUP-(\S+)-(?:IN|OUT))$").unwrap()
});

static CANARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^-A (\S+) -m comment --comment "?PVESIG:([A-Za-z0-9+/=]+)"?$"#).unwrap()
});

pub fn is_managed_chain(name: &str) -> bool {
    MANAGED_CHAIN_RE.is_match(name)
}

/// Parse save-format output into `{managed chain -> signature}`. Chains
/// without a canary register as [`SIG_UNKNOWN`].
pub fn parse_save(save_output: &str) -> BTreeMap<String, String> {
    let mut live = BTreeMap::new();
    let mut in_filter = false;
    for line in save_output.lines() {
        if let Some(table) = line.strip_prefix('*') {
            in_filter = table == "filter";
            continue;
        }
        if !in_filter {
            continue;
        }
        if let Some(decl) = line.strip_prefix(':') {
            if let Some(name) = decl.split_whitespace().next() {
                if is_managed_chain(name) {
                    live.insert(name.to_string(), SIG_UNKNOWN.to_string());
                }
            }
        } else if let Some(captures) = CANARY_RE.captures(line) {
            let chain = &captures[1];
            if let Some(sig) = live.get_mut(chain) {
                *sig = captures[2].to_string();
            }
        }
    }
    live
}

/// Compute the per-chain action plan for converging `live` toward
/// `ruleset`. The signature carried by each status is the target one for
/// kept chains and the last seen one for deletions.
pub fn diff(ruleset: &Ruleset, live: &BTreeMap<String, String>) -> BTreeMap<String, ChainStatus> {
    let mut plan = BTreeMap::new();
    for (chain, rules) in ruleset.chains() {
        let sig = signature(rules);
        let action = match live.get(chain) {
            None => ChainAction::Create,
            Some(live_sig) if *live_sig == sig => ChainAction::Exists,
            Some(_) => ChainAction::Update,
        };
        plan.insert(chain.to_string(), ChainStatus { sig, action });
    }
    for (chain, live_sig) in live {
        if !ruleset.has_chain(chain) {
            plan.insert(
                chain.clone(),
                ChainStatus {
                    sig: live_sig.clone(),
                    action: ChainAction::Delete,
                },
            );
        }
    }
    plan
}

pub fn has_changes(plan: &BTreeMap<String, ChainStatus>) -> bool {
    plan.values().any(|status| status.action != ChainAction::Exists)
}

fn canary_line(chain: &str, sig: &str) -> String {
    format!("-A {chain} -m comment --comment \"PVESIG:{sig}\"")
}

/// Render the single atomic restore script for the plan.
pub fn emit_restore_script(ruleset: &Ruleset, plan: &BTreeMap<String, ChainStatus>) -> String {
    let mut script = String::from("*filter\n");

    for (chain, status) in plan {
        if status.action == ChainAction::Create {
            script.push_str(&format!(":{chain} - [0:0]\n"));
        }
    }
    for (chain, status) in plan {
        if matches!(status.action, ChainAction::Create | ChainAction::Update) {
            script.push_str(&format!("-F {chain}\n"));
            for rule in ruleset.rules(chain).unwrap_or(&[]) {
                script.push_str(rule);
                script.push('\n');
            }
            script.push_str(&canary_line(chain, &status.sig));
            script.push('\n');
        }
    }
    for (chain, status) in plan {
        if status.action == ChainAction::Delete {
            script.push_str(&format!("-F {chain}\n"));
        }
    }
    for (chain, status) in plan {
        if status.action == ChainAction::Delete && !TOP_CHAINS.contains(&chain.as_str()) {
            script.push_str(&format!("-X {chain}\n"));
        }
    }
    script.push_str("COMMIT\n");
    script
}

/// Make sure the built-in chains dispatch into the managed entry chains.
pub fn ensure_base_jumps(ops: &dyn IptablesOps) -> Result<(), Error> {
    for (builtin, target) in [
        ("INPUT", CHAIN_INPUT),
        ("OUTPUT", CHAIN_OUTPUT),
        ("FORWARD", CHAIN_FORWARD),
    ] {
        let rule = format!("-j {target}");
        if !ops.rule_exists(builtin, &rule)? {
            ops.append_rule(builtin, &rule)?;
        }
    }
    Ok(())
}

/// Apply the plan through the bulk-restore interface. Returns whether
/// anything had to change.
pub fn apply(ops: &dyn IptablesOps, ruleset: &Ruleset, plan: &BTreeMap<String, ChainStatus>) -> Result<bool, Error> {
    if !has_changes(plan) {
        return Ok(false);
    }
    let script = emit_restore_script(ruleset, plan);
    ops.restore(&script)?;
    Ok(true)
}

/// Re-discover the live table and fail unless every chain converged.
pub fn verify(ops: &dyn IptablesOps, ruleset: &Ruleset) -> Result<(), Error> {
    let live = parse_save(&ops.save()?);
    let plan = diff(ruleset, &live);
    for (chain, status) in &plan {
        if status.action != ChainAction::Exists {
            return Err(Error::VerifyFailed { chain: chain.clone() });
        }
    }
    Ok(())
}
