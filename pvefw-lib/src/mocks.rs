//! Stateful mocks for the kernel filter and the VM inventory.
//!
//! These mocks track actual state (chains that exist, rules inside them)
//! rather than just recording call sequences, so tests can assert on the
//! simulated kernel's _state_ after a reconcile cycle, not just on which
//! calls happened. The kernel mock implements enough of the save/restore
//! wire format to feed discovery back from its own applied scripts.
//!
//! Available outside `cfg(test)` so the integration suites can drive full
//! cycles against a simulated kernel.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::inventory::{Error as InventoryError, Inventory, VmNetConfig};
use crate::iptables_ops::{Error, IptablesOps};

// ============================================================================
// MockIptablesOps
// ============================================================================

#[derive(Debug)]
pub struct KernelState {
    /// Built-in chains and their rules.
    pub builtins: BTreeMap<String, Vec<String>>,
    /// User-defined chains and their rules.
    pub chains: BTreeMap<String, Vec<String>>,
    /// Every script handed to restore, in order.
    pub applied_scripts: Vec<String>,
    /// Map of operation name -> error message. If set, the operation fails.
    pub fail_on: HashMap<String, String>,
}

impl Default for KernelState {
    fn default() -> Self {
        let builtins = ["INPUT", "FORWARD", "OUTPUT"]
            .into_iter()
            .map(|name| (name.to_string(), Vec::new()))
            .collect();
        KernelState {
            builtins,
            chains: BTreeMap::new(),
            applied_scripts: Vec::new(),
            fail_on: HashMap::new(),
        }
    }
}

impl KernelState {
    fn check_fail(&self, op: &str) -> Result<(), Error> {
        if let Some(msg) = self.fail_on.get(op) {
            Err(Error::General(msg.clone()))
        } else {
            Ok(())
        }
    }

    fn chain_rules_mut(&mut self, chain: &str) -> Option<&mut Vec<String>> {
        if self.builtins.contains_key(chain) {
            return self.builtins.get_mut(chain);
        }
        self.chains.get_mut(chain)
    }

    fn render_save(&self) -> String {
        let mut out = String::from("*filter\n");
        for name in self.builtins.keys() {
            out.push_str(&format!(":{name} ACCEPT [0:0]\n"));
        }
        for name in self.chains.keys() {
            out.push_str(&format!(":{name} - [0:0]\n"));
        }
        for rules in self.builtins.values().chain(self.chains.values()) {
            for rule in rules {
                out.push_str(rule);
                out.push('\n');
            }
        }
        out.push_str("COMMIT\n");
        out
    }

    fn apply_script(&mut self, script: &str) -> Result<(), Error> {
        for line in script.lines() {
            let line = line.trim();
            if line.is_empty() || line == "*filter" || line == "COMMIT" {
                continue;
            }
            if let Some(decl) = line.strip_prefix(':') {
                let name = decl.split_whitespace().next().unwrap_or("");
                if !self.builtins.contains_key(name) {
                    self.chains.entry(name.to_string()).or_default();
                }
            } else if let Some(name) = line.strip_prefix("-F ") {
                let rules = self
                    .chain_rules_mut(name)
                    .ok_or_else(|| Error::General(format!("flush of unknown chain {name}")))?;
                rules.clear();
            } else if let Some(name) = line.strip_prefix("-X ") {
                self.chains
                    .remove(name)
                    .ok_or_else(|| Error::General(format!("removal of unknown chain {name}")))?;
            } else if let Some(rest) = line.strip_prefix("-A ") {
                let chain = rest.split_whitespace().next().unwrap_or("").to_string();
                let rules = self
                    .chain_rules_mut(&chain)
                    .ok_or_else(|| Error::General(format!("append to unknown chain {chain}")))?;
                rules.push(line.to_string());
            } else {
                return Err(Error::General(format!("unsupported restore line `{line}`")));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MockIptablesOps {
    pub state: Arc<Mutex<KernelState>>,
}

impl MockIptablesOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: KernelState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }
}

impl IptablesOps for MockIptablesOps {
    fn save(&self) -> Result<String, Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("save")?;
        Ok(s.render_save())
    }

    fn restore(&self, script: &str) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("restore")?;
        s.applied_scripts.push(script.to_string());
        s.apply_script(script)
    }

    fn rule_exists(&self, chain: &str, rule: &str) -> Result<bool, Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("rule_exists")?;
        let full = format!("-A {chain} {rule}");
        let found = s
            .builtins
            .get(chain)
            .or_else(|| s.chains.get(chain))
            .map(|rules| rules.iter().any(|r| *r == full))
            .unwrap_or(false);
        Ok(found)
    }

    fn append_rule(&self, chain: &str, rule: &str) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("append_rule")?;
        let full = format!("-A {chain} {rule}");
        let rules = s
            .chain_rules_mut(chain)
            .ok_or_else(|| Error::General(format!("append to unknown chain {chain}")))?;
        rules.push(full);
        Ok(())
    }

    fn delete_rule(&self, chain: &str, rule: &str) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("delete_rule")?;
        let full = format!("-A {chain} {rule}");
        let rules = s
            .chain_rules_mut(chain)
            .ok_or_else(|| Error::General(format!("delete from unknown chain {chain}")))?;
        let before = rules.len();
        rules.retain(|r| *r != full);
        if rules.len() == before {
            return Err(Error::General(format!("rule not found in {chain}: {rule}")));
        }
        Ok(())
    }
}

// ============================================================================
// MockInventory
// ============================================================================

#[derive(Debug, Default)]
pub struct InventoryState {
    pub vms: BTreeMap<u32, VmNetConfig>,
    pub fail_on: HashMap<String, String>,
}

#[derive(Clone, Default)]
pub struct MockInventory {
    pub state: Arc<Mutex<InventoryState>>,
}

impl MockInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vms(vms: BTreeMap<u32, VmNetConfig>) -> Self {
        Self {
            state: Arc::new(Mutex::new(InventoryState {
                vms,
                fail_on: HashMap::new(),
            })),
        }
    }
}

impl Inventory for MockInventory {
    fn list_vms(&self) -> Result<BTreeMap<u32, VmNetConfig>, InventoryError> {
        let s = self.state.lock().unwrap();
        if let Some(msg) = s.fail_on.get("list_vms") {
            return Err(InventoryError::General(msg.clone()));
        }
        Ok(s.vms.clone())
    }
}
