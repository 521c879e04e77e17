//! VM inventory provider.
//!
//! Enumerates the configured VMs and their network interfaces by scanning
//! a directory of VM config files (`<vmid>.conf` with `net<N>:` lines).
//! A VM whose config cannot be read is skipped; it simply gets no tap
//! chains on the next compile.

use regex::Regex;
use thiserror::Error;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::LazyLock;

pub const VM_CONFIG_DIR: &str = "/etc/pve/qemu-server";

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("invalid net config `{0}`")]
    InvalidNet(String),
    #[error("General error: {0}")]
    General(String),
}

/// One VM network interface as the compiler needs it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetConfig {
    pub bridge: String,
    pub tag: Option<u16>,
    pub macaddr: Option<String>,
}

/// `net<N>` -> interface config.
pub type VmNetConfig = BTreeMap<String, NetConfig>;

pub trait Inventory {
    fn list_vms(&self) -> Result<BTreeMap<u32, VmNetConfig>, Error>;
}

static MAC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9A-Fa-f]{2}:){5}[0-9A-Fa-f]{2}$").unwrap());

const NIC_MODELS: [&str; 4] = ["virtio", "e1000", "rtl8139", "vmxnet3"];

/// Parse a `model=MAC,bridge=vmbrX[,tag=N]` interface description.
pub fn parse_net(value: &str) -> Result<NetConfig, Error> {
    let invalid = || Error::InvalidNet(value.to_string());

    let mut bridge = None;
    let mut tag = None;
    let mut macaddr = None;
    for token in value.split(',') {
        let (key, val) = token.split_once('=').ok_or_else(invalid)?;
        match key {
            "bridge" => bridge = Some(val.to_string()),
            "tag" => tag = Some(val.parse::<u16>().map_err(|_| invalid())?),
            _ if NIC_MODELS.contains(&key) => {
                if !MAC_RE.is_match(val) {
                    return Err(invalid());
                }
                macaddr = Some(val.to_lowercase());
            }
            // other keys (firewall=, queues=, rate=, ...) are not ours
            _ => {}
        }
    }
    Ok(NetConfig {
        bridge: bridge.ok_or_else(invalid)?,
        tag,
        macaddr,
    })
}

/// Production [`Inventory`] scanning a VM config directory.
pub struct VmConfigDir {
    dir: PathBuf,
}

impl VmConfigDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        VmConfigDir { dir: dir.into() }
    }
}

static NET_LINE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(net\d+):\s*(\S+)\s*$").unwrap());

impl Inventory for VmConfigDir {
    fn list_vms(&self) -> Result<BTreeMap<u32, VmNetConfig>, Error> {
        let mut vms = BTreeMap::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(vmid) = name
                .to_str()
                .and_then(|n| n.strip_suffix(".conf"))
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            let content = match std::fs::read_to_string(entry.path()) {
                Ok(content) => content,
                Err(error) => {
                    tracing::debug!(vmid, %error, "skipping unreadable VM config");
                    continue;
                }
            };
            let mut net = VmNetConfig::new();
            for line in content.lines() {
                let Some(captures) = NET_LINE_RE.captures(line) else {
                    continue;
                };
                match parse_net(&captures[2]) {
                    Ok(config) => {
                        net.insert(captures[1].to_string(), config);
                    }
                    Err(error) => {
                        tracing::warn!(vmid, netid = &captures[1], %error, "skipping interface");
                    }
                }
            }
            vms.insert(vmid, net);
        }
        Ok(vms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_net_extracts_bridge_tag_and_mac() -> anyhow::Result<()> {
        let net = parse_net("virtio=AA:BB:CC:DD:EE:01,bridge=vmbr0,tag=100,firewall=1")?;
        assert_eq!(net.bridge, "vmbr0");
        assert_eq!(net.tag, Some(100));
        assert_eq!(net.macaddr.as_deref(), Some("aa:bb:cc:dd:ee:01"));
        Ok(())
    }

    #[test]
    fn parse_net_requires_a_bridge() {
        assert!(parse_net("virtio=AA:BB:CC:DD:EE:01").is_err());
    }

    #[test]
    fn parse_net_rejects_malformed_macs() {
        assert!(parse_net("virtio=AA:BB:CC:DD:EE,bridge=vmbr0").is_err());
        assert!(parse_net("virtio=ZZ:BB:CC:DD:EE:01,bridge=vmbr0").is_err());
    }

    #[test]
    fn config_dir_scan_collects_interfaces_per_vmid() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(
            dir.path().join("100.conf"),
            "memory: 2048\nnet0: virtio=AA:BB:CC:DD:EE:01,bridge=vmbr0\nnet1: e1000=AA:BB:CC:DD:EE:02,bridge=vmbr1,tag=5\n",
        )?;
        std::fs::write(dir.path().join("101.conf"), "memory: 512\n")?;
        std::fs::write(dir.path().join("notes.txt"), "ignored\n")?;

        let inventory = VmConfigDir::new(dir.path());
        let vms = inventory.list_vms()?;
        assert_eq!(vms.len(), 2);
        assert_eq!(vms[&100].len(), 2);
        assert_eq!(vms[&100]["net1"].tag, Some(5));
        assert!(vms[&101].is_empty());
        Ok(())
    }

    #[test]
    fn malformed_interfaces_are_skipped_not_fatal() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(
            dir.path().join("100.conf"),
            "net0: virtio=not-a-mac,bridge=vmbr0\nnet1: virtio=AA:BB:CC:DD:EE:02,bridge=vmbr0\n",
        )?;
        let vms = VmConfigDir::new(dir.path()).list_vms()?;
        assert_eq!(vms[&100].len(), 1);
        assert!(vms[&100].contains_key("net1"));
        Ok(())
    }
}
