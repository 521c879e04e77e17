//! Firewall façade: owns paths, inventory and the kernel adapter, and
//! drives the parse -> compile -> diff -> apply -> verify cycle.

use serde::Serialize;
use thiserror::Error;

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::path::{Path, PathBuf};

use crate::compiler::{self, VmEntry};
use crate::inventory::{self, Inventory};
use crate::iptables_ops::{self, IptablesOps};
use crate::reconcile::{self, ChainStatus};
use crate::rulefile::{self, GroupsFile, HostRuleFile};
use crate::ruleset::Ruleset;
use crate::services::ServiceDirectory;

pub const CONFIG_DIR: &str = "/etc/pve/firewall";
pub const HOST_FW_PATH: &str = "/etc/pve/local/host.fw";
pub const GROUPS_FILE: &str = "groups.fw";
pub const BRIDGE_NF_DIR: &str = "/proc/sys/net/bridge";

const BRIDGE_NF_FILES: [&str; 2] = ["bridge-nf-call-iptables", "bridge-nf-call-ip6tables"];

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Compile(#[from] compiler::Error),
    #[error(transparent)]
    Reconcile(#[from] reconcile::Error),
    #[error(transparent)]
    Iptables(#[from] iptables_ops::Error),
    #[error(transparent)]
    Inventory(#[from] inventory::Error),
    #[error(transparent)]
    RuleFile(#[from] rulefile::Error),
}

#[derive(Clone, Debug)]
pub struct Paths {
    pub config_dir: PathBuf,
    pub host_fw: PathBuf,
    pub bridge_nf_dir: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Paths {
            config_dir: PathBuf::from(CONFIG_DIR),
            host_fw: PathBuf::from(HOST_FW_PATH),
            bridge_nf_dir: PathBuf::from(BRIDGE_NF_DIR),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Unknown,
    Stopped,
    Active,
}

impl Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Unknown => write!(f, "unknown"),
            Status::Stopped => write!(f, "stopped"),
            Status::Active => write!(f, "active"),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusReport {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changes: Option<bool>,
}

pub struct Firewall {
    paths: Paths,
    services: ServiceDirectory,
    inventory: Box<dyn Inventory>,
    ops: Box<dyn IptablesOps>,
}

impl Firewall {
    pub fn new(paths: Paths, inventory: Box<dyn Inventory>, ops: Box<dyn IptablesOps>) -> Self {
        Self::with_services(paths, inventory, ops, ServiceDirectory::shared().clone())
    }

    pub fn with_services(
        paths: Paths,
        inventory: Box<dyn Inventory>,
        ops: Box<dyn IptablesOps>,
        services: ServiceDirectory,
    ) -> Self {
        Firewall {
            paths,
            services,
            inventory,
            ops,
        }
    }

    /// Parse all rule files and build the target ruleset.
    pub fn compile(&self) -> Result<Ruleset, Error> {
        let groups = self.read_groups()?;
        let host = self.read_host()?;

        let mut vms: BTreeMap<u32, VmEntry> = BTreeMap::new();
        for (vmid, net) in self.inventory.list_vms()? {
            let path = self.paths.config_dir.join(format!("{vmid}.fw"));
            let rules = match read_optional(&path)? {
                Some(content) => Some(rulefile::parse_vm_config(
                    &path.display().to_string(),
                    &content,
                    &self.services,
                )),
                None => None,
            };
            vms.insert(vmid, VmEntry { net, rules });
        }

        Ok(compiler::compile(&vms, host.as_ref(), &groups)?)
    }

    fn read_groups(&self) -> Result<GroupsFile, Error> {
        let path = self.paths.config_dir.join(GROUPS_FILE);
        match read_optional(&path)? {
            Some(content) => Ok(rulefile::parse_groups_config(
                &path.display().to_string(),
                &content,
                &self.services,
            )),
            None => Ok(GroupsFile::default()),
        }
    }

    fn read_host(&self) -> Result<Option<HostRuleFile>, Error> {
        match read_optional(&self.paths.host_fw)? {
            Some(content) => Ok(Some(rulefile::parse_host_config(
                &self.paths.host_fw.display().to_string(),
                &content,
                &self.services,
            ))),
            None => Ok(None),
        }
    }

    /// Compile and diff against the live table.
    pub fn plan(&self) -> Result<(Ruleset, BTreeMap<String, ChainStatus>), Error> {
        let ruleset = self.compile()?;
        let live = reconcile::parse_save(&self.ops.save()?);
        let plan = reconcile::diff(&ruleset, &live);
        Ok((ruleset, plan))
    }

    pub fn detect_changes(&self) -> Result<bool, Error> {
        let (_, plan) = self.plan()?;
        Ok(reconcile::has_changes(&plan))
    }

    /// Install a compiled ruleset: bridge firewalling on, plan applied
    /// atomically, built-in jumps present, convergence verified. The jumps
    /// go in after the restore so their target chains exist on first run.
    pub fn apply(&self, ruleset: &Ruleset, plan: &BTreeMap<String, ChainStatus>) -> Result<bool, Error> {
        self.enable_bridge_firewall();
        let changed = reconcile::apply(self.ops.as_ref(), ruleset, plan)?;
        reconcile::ensure_base_jumps(self.ops.as_ref())?;
        if changed {
            reconcile::verify(self.ops.as_ref(), ruleset)?;
            tracing::info!("firewall rules updated");
        } else {
            tracing::debug!("no changes to apply");
        }
        Ok(changed)
    }

    /// One full reconcile cycle. Locking is the caller's concern.
    pub fn cycle(&self) -> Result<bool, Error> {
        let (ruleset, plan) = self.plan()?;
        self.apply(&ruleset, &plan)
    }

    /// Tear the firewall down: detach the built-in jumps, flush every
    /// managed chain and remove all but the entry chains.
    pub fn clear(&self) -> Result<(), Error> {
        use crate::compiler::{CHAIN_FORWARD, CHAIN_INPUT, CHAIN_OUTPUT, TOP_CHAINS};

        for (builtin, target) in [
            ("INPUT", CHAIN_INPUT),
            ("OUTPUT", CHAIN_OUTPUT),
            ("FORWARD", CHAIN_FORWARD),
        ] {
            let rule = format!("-j {target}");
            if self.ops.rule_exists(builtin, &rule)? {
                self.ops.delete_rule(builtin, &rule)?;
            }
        }

        let live = reconcile::parse_save(&self.ops.save()?);
        if live.is_empty() {
            return Ok(());
        }
        let mut script = String::from("*filter\n");
        for chain in live.keys() {
            script.push_str(&format!("-F {chain}\n"));
        }
        for chain in live.keys() {
            if !TOP_CHAINS.contains(&chain.as_str()) {
                script.push_str(&format!("-X {chain}\n"));
            }
        }
        for chain in TOP_CHAINS {
            if live.contains_key(chain) {
                script.push_str(&format!("-X {chain}\n"));
            }
        }
        script.push_str("COMMIT\n");
        self.ops.restore(&script)?;
        tracing::info!("firewall rules cleared");
        Ok(())
    }

    pub fn status(&self) -> StatusReport {
        let save = match self.ops.save() {
            Ok(save) => save,
            Err(error) => {
                tracing::warn!(%error, "unable to read kernel filter state");
                return StatusReport {
                    status: Status::Unknown,
                    changes: None,
                };
            }
        };
        let live = reconcile::parse_save(&save);
        let status = if live.contains_key(crate::compiler::CHAIN_INPUT) {
            Status::Active
        } else {
            Status::Stopped
        };
        let changes = match self.compile() {
            Ok(ruleset) => Some(reconcile::has_changes(&reconcile::diff(&ruleset, &live))),
            Err(error) => {
                tracing::warn!(%error, "unable to compile ruleset for status");
                None
            }
        };
        StatusReport { status, changes }
    }

    /// Let bridged traffic pass the filter table. Idempotent; a missing
    /// bridge module only logs.
    fn enable_bridge_firewall(&self) {
        for name in BRIDGE_NF_FILES {
            let path = self.paths.bridge_nf_dir.join(name);
            if let Err(error) = std::fs::write(&path, "1") {
                tracing::warn!(path = %path.display(), %error, "unable to enable bridge firewalling");
            }
        }
    }
}

fn read_optional(path: &Path) -> Result<Option<String>, Error> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(rulefile::Error::from(error).into()),
    }
}
