//! Ruleset compiler.
//!
//! Builds the complete named-chain ruleset from the parsed rule files and
//! the VM inventory: top-level entry chains, per-bridge forwarding
//! plumbing, per-tap chains, host chains, security group chains and the
//! mark-based cross-bridge accept protocol.

use thiserror::Error;

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use crate::inventory::VmNetConfig;
use crate::rule::{self, Action, Policy, Rule};
use crate::rulefile::{GroupsFile, HostRuleFile, VmRuleFile};
use crate::ruleset::{self, Ruleset};

pub const CHAIN_INPUT: &str = "PVEFW-INPUT";
pub const CHAIN_OUTPUT: &str = "PVEFW-OUTPUT";
pub const CHAIN_FORWARD: &str = "PVEFW-FORWARD";
pub const CHAIN_SET_ACCEPT_MARK: &str = "PVEFW-SET-ACCEPT-MARK";
pub const CHAIN_HOST_IN: &str = "PVEFW-HOST-IN";
pub const CHAIN_HOST_OUT: &str = "PVEFW-HOST-OUT";

/// Entry chains spliced into the kernel's built-in chains. Never removed
/// by the reconciler.
pub const TOP_CHAINS: [&str; 3] = [CHAIN_INPUT, CHAIN_OUTPUT, CHAIN_FORWARD];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => write!(f, "IN"),
            Direction::Out => write!(f, "OUT"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Ruleset(#[from] ruleset::Error),
}

/// One VM as seen by the compiler: its network interfaces plus its parsed
/// rule file, when one exists.
#[derive(Clone, Debug, Default)]
pub struct VmEntry {
    pub net: VmNetConfig,
    pub rules: Option<VmRuleFile>,
}

pub fn compile(
    vms: &BTreeMap<u32, VmEntry>,
    host: Option<&HostRuleFile>,
    groups: &GroupsFile,
) -> Result<Ruleset, Error> {
    let mut compiler = Compiler {
        ruleset: Ruleset::new(),
        groups,
        forward_fastpath_done: false,
    };

    compiler.ruleset.create_chain(CHAIN_INPUT)?;
    compiler.ruleset.create_chain(CHAIN_OUTPUT)?;
    compiler.ruleset.create_chain(CHAIN_FORWARD)?;
    compiler.ruleset.create_chain(CHAIN_SET_ACCEPT_MARK)?;
    compiler.ruleset.addrule(
        CHAIN_SET_ACCEPT_MARK,
        format!("-A {CHAIN_SET_ACCEPT_MARK} -j MARK --set-mark 1"),
    )?;

    if let Some(host) = host {
        compiler.generate_host_chains(host)?;
    }

    for (vmid, entry) in vms {
        for (netid, netconf) in &entry.net {
            let Ok(netindex) = rule::parse_iface(netid) else {
                tracing::warn!(vmid = *vmid, netid = %netid, "skipping interface with unexpected name");
                continue;
            };
            // only vmbr<N> chains are discoverable by the reconciler
            if !valid_bridge_name(&netconf.bridge) {
                tracing::warn!(vmid = *vmid, netid = %netid, bridge = %netconf.bridge, "skipping interface on unsupported bridge");
                continue;
            }
            compiler.generate_bridge_chains(&netconf.bridge)?;
            if let Some(rules) = &entry.rules {
                if rules.options.enable {
                    compiler.generate_tap_chains(*vmid, netid, netindex, netconf, rules)?;
                }
            }
        }
    }

    // Host jumps come last so tap-to-host traffic passes its tap OUT chain
    // before the host input rules.
    if host.is_some() {
        compiler
            .ruleset
            .addrule(CHAIN_INPUT, format!("-A {CHAIN_INPUT} -j {CHAIN_HOST_IN}"))?;
        compiler
            .ruleset
            .addrule(CHAIN_OUTPUT, format!("-A {CHAIN_OUTPUT} -j {CHAIN_HOST_OUT}"))?;
    }

    Ok(compiler.ruleset)
}

struct Compiler<'a> {
    ruleset: Ruleset,
    groups: &'a GroupsFile,
    forward_fastpath_done: bool,
}

fn tap_iface(vmid: u32, netindex: u8) -> String {
    format!("tap{vmid}i{netindex}")
}

fn valid_bridge_name(bridge: &str) -> bool {
    bridge
        .strip_prefix("vmbr")
        .is_some_and(|digits| !digits.is_empty() && digits.len() <= 4 && digits.bytes().all(|b| b.is_ascii_digit()))
}

fn group_chain(name: &str, dir: Direction) -> String {
    format!("GROUP-{name}-{dir}")
}

impl Compiler<'_> {
    /// Create the `<bridge>-FW/-IN/-OUT` chains and their forwarding
    /// plumbing. Idempotent per bridge.
    fn generate_bridge_chains(&mut self, bridge: &str) -> Result<(), Error> {
        let fw_chain = format!("{bridge}-FW");
        if self.ruleset.has_chain(&fw_chain) {
            return Ok(());
        }

        if !self.forward_fastpath_done {
            self.ruleset.addrule(
                CHAIN_FORWARD,
                format!("-A {CHAIN_FORWARD} -m state --state RELATED,ESTABLISHED -j ACCEPT"),
            )?;
            self.forward_fastpath_done = true;
        }

        let in_chain = format!("{bridge}-IN");
        let out_chain = format!("{bridge}-OUT");
        self.ruleset.create_chain(&fw_chain)?;
        self.ruleset.create_chain(&in_chain)?;
        self.ruleset.create_chain(&out_chain)?;

        self.ruleset.addrule(
            CHAIN_FORWARD,
            format!("-A {CHAIN_FORWARD} -o {bridge} -m physdev --physdev-is-bridged -j {fw_chain}"),
        )?;
        self.ruleset.addrule(
            CHAIN_FORWARD,
            format!("-A {CHAIN_FORWARD} -i {bridge} -m physdev --physdev-is-bridged -j {fw_chain}"),
        )?;
        // anything else touching the bridge must not be routed elsewhere
        self.ruleset
            .addrule(CHAIN_FORWARD, format!("-A {CHAIN_FORWARD} -o {bridge} -j DROP"))?;
        self.ruleset
            .addrule(CHAIN_FORWARD, format!("-A {CHAIN_FORWARD} -i {bridge} -j DROP"))?;

        self.ruleset.addrule(
            &fw_chain,
            format!("-A {fw_chain} -m physdev --physdev-is-in -j {out_chain}"),
        )?;
        self.ruleset.addrule(
            &fw_chain,
            format!("-A {fw_chain} -m physdev --physdev-is-out -j {in_chain}"),
        )?;
        Ok(())
    }

    fn generate_tap_chains(
        &mut self,
        vmid: u32,
        netid: &str,
        netindex: u8,
        netconf: &crate::inventory::NetConfig,
        rules: &VmRuleFile,
    ) -> Result<(), Error> {
        let iface = tap_iface(vmid, netindex);
        for dir in [Direction::In, Direction::Out] {
            let chain = format!("{iface}-{dir}");
            self.ruleset.create_chain(&chain)?;
            self.ruleset
                .addrule(&chain, format!("-A {chain} -m state --state INVALID -j DROP"))?;
            self.ruleset.addrule(
                &chain,
                format!("-A {chain} -m state --state RELATED,ESTABLISHED -j ACCEPT"),
            )?;

            if dir == Direction::Out && rules.options.macfilter {
                if let Some(mac) = &netconf.macaddr {
                    self.ruleset
                        .addrule(&chain, format!("-A {chain} -m mac ! --mac-source {mac} -j DROP"))?;
                }
            }

            let user_rules = match dir {
                Direction::In => &rules.rules_in,
                Direction::Out => &rules.rules_out,
            };
            for user_rule in user_rules {
                if let Some(rule_iface) = &user_rule.iface {
                    if rule_iface != netid {
                        continue;
                    }
                }
                self.emit_user_rule(&chain, user_rule, dir, false)?;
            }

            let policy = match dir {
                Direction::In => rules.options.policy_in,
                Direction::Out => rules.options.policy_out,
            };
            self.emit_default_policy(&chain, dir, policy)?;
        }

        // splice the tap chains into the bridge plumbing
        let bridge = &netconf.bridge;
        self.ruleset.insertrule(
            &format!("{bridge}-IN"),
            format!("-A {bridge}-IN -m physdev --physdev-is-bridged --physdev-out {iface} -j {iface}-IN"),
        )?;
        self.ruleset.insertrule(
            &format!("{bridge}-OUT"),
            format!("-A {bridge}-OUT -m physdev --physdev-is-bridged --physdev-in {iface} -j {iface}-OUT"),
        )?;
        // tap to host traffic is not bridged but must pass the OUT chain too
        self.ruleset.addrule(
            CHAIN_INPUT,
            format!("-A {CHAIN_INPUT} -m physdev --physdev-in {iface} -j {iface}-OUT"),
        )?;
        Ok(())
    }

    /// Emit one user rule into `chain`, applying the direction rewrites:
    /// OUT accepts become RETURN (on a clone, the shared parsed rule is
    /// never mutated) and group references target the per-direction group
    /// chain, with the mark post-check on OUT.
    fn emit_user_rule(&mut self, chain: &str, user_rule: &Rule, dir: Direction, host: bool) -> Result<(), Error> {
        match &user_rule.action {
            Action::Group(name) => {
                if !self.generate_group_chains(name)? {
                    tracing::warn!(chain, group = %name, "skipping reference to undefined group");
                    return Ok(());
                }
                let mut jump = user_rule.clone();
                jump.action = Action::Group(format!("{name}-{dir}"));
                self.addrule_for(chain, &jump, dir, host)?;
                if dir == Direction::Out {
                    self.ruleset
                        .addrule(chain, format!("-A {chain} -m mark --mark 1 -j RETURN"))?;
                }
            }
            Action::Accept if dir == Direction::Out => {
                let mut rewritten = user_rule.clone();
                rewritten.action = Action::Return;
                self.addrule_for(chain, &rewritten, dir, host)?;
            }
            _ => self.addrule_for(chain, user_rule, dir, host)?,
        }
        Ok(())
    }

    fn addrule_for(&mut self, chain: &str, user_rule: &Rule, dir: Direction, host: bool) -> Result<(), Error> {
        let cmd = if host {
            let flag = match dir {
                Direction::In => "-i",
                Direction::Out => "-o",
            };
            user_rule.to_command_with_iface(chain, flag, false)
        } else {
            user_rule.to_command(chain, false)
        };
        self.ruleset.addrule(chain, cmd)?;
        Ok(())
    }

    fn emit_default_policy(&mut self, chain: &str, dir: Direction, policy: Policy) -> Result<(), Error> {
        match policy {
            Policy::Accept => {
                let verdict = match dir {
                    Direction::In => "ACCEPT",
                    Direction::Out => "RETURN",
                };
                self.ruleset.addrule(chain, format!("-A {chain} -j {verdict}"))?;
            }
            Policy::Drop => {
                self.ruleset.addrule(
                    chain,
                    format!("-A {chain} -j LOG --log-prefix \"{chain}-dropped: \" --log-level 4"),
                )?;
                self.ruleset.addrule(chain, format!("-A {chain} -j DROP"))?;
            }
            Policy::Reject => {
                self.ruleset.addrule(
                    chain,
                    format!("-A {chain} -j LOG --log-prefix \"{chain}-reject: \" --log-level 4"),
                )?;
                self.ruleset.addrule(chain, format!("-A {chain} -j REJECT"))?;
            }
        }
        Ok(())
    }

    /// Build both directional chains of a security group on first
    /// reference. Returns false when the group is not defined.
    fn generate_group_chains(&mut self, name: &str) -> Result<bool, Error> {
        let Some(group) = self.groups.groups.get(name) else {
            return Ok(false);
        };

        let in_chain = group_chain(name, Direction::In);
        if !self.ruleset.has_chain(&in_chain) {
            self.ruleset.create_chain(&in_chain)?;
            for group_rule in &group.rules_in {
                self.ruleset
                    .addrule(&in_chain, group_rule.to_command(&in_chain, false))?;
            }
        }

        let out_chain = group_chain(name, Direction::Out);
        if !self.ruleset.has_chain(&out_chain) {
            self.ruleset.create_chain(&out_chain)?;
            // clear the cross-bridge accept signal on entry
            self.ruleset
                .addrule(&out_chain, format!("-A {out_chain} -j MARK --set-mark 0"))?;
            for group_rule in &group.rules_out {
                if group_rule.action == Action::Accept {
                    let mut rewritten = group_rule.clone();
                    rewritten.action = Action::SetAcceptMark;
                    self.ruleset
                        .addrule(&out_chain, rewritten.to_command(&out_chain, false))?;
                } else {
                    self.ruleset
                        .addrule(&out_chain, group_rule.to_command(&out_chain, false))?;
                }
            }
        }
        Ok(true)
    }

    fn generate_host_chains(&mut self, host: &HostRuleFile) -> Result<(), Error> {
        // host firewall present: loopback traffic bypasses everything
        self.ruleset
            .insertrule(CHAIN_INPUT, format!("-A {CHAIN_INPUT} -i lo -j ACCEPT"))?;

        for (dir, chain, user_rules) in [
            (Direction::In, CHAIN_HOST_IN, &host.rules_in),
            (Direction::Out, CHAIN_HOST_OUT, &host.rules_out),
        ] {
            self.ruleset.create_chain(chain)?;
            self.ruleset
                .addrule(chain, format!("-A {chain} -m state --state INVALID -j DROP"))?;
            self.ruleset.addrule(
                chain,
                format!("-A {chain} -m state --state RELATED,ESTABLISHED -j ACCEPT"),
            )?;
            let lo = match dir {
                Direction::In => "-i lo",
                Direction::Out => "-o lo",
            };
            self.ruleset.addrule(chain, format!("-A {chain} {lo} -j ACCEPT"))?;
            self.ruleset
                .addrule(chain, format!("-A {chain} -d 224.0.0.0/24 -j ACCEPT"))?;
            // cluster heartbeat and corosync
            self.ruleset
                .addrule(chain, format!("-A {chain} -p udp --dport 5404:5405 -j ACCEPT"))?;
            self.ruleset
                .addrule(chain, format!("-A {chain} -p udp --dport 9000 -j ACCEPT"))?;

            for user_rule in user_rules {
                self.emit_user_rule(chain, user_rule, dir, true)?;
            }

            self.ruleset.addrule(
                chain,
                format!("-A {chain} -j LOG --log-prefix \"{chain}-dropped: \" --log-level 4"),
            )?;
            self.ruleset.addrule(chain, format!("-A {chain} -j DROP"))?;
        }
        Ok(())
    }
}
