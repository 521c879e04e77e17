use tempfile::TempDir;

use std::collections::BTreeMap;
use std::path::PathBuf;

use pvefw_lib::firewall::{Firewall, Paths};
use pvefw_lib::inventory::{NetConfig, VmNetConfig};
use pvefw_lib::mocks::{MockInventory, MockIptablesOps};
use pvefw_lib::services::ServiceDirectory;

const SERVICES_FIXTURE: &str = "\
ssh             22/tcp
domain          53/tcp
domain          53/udp
http            80/tcp            www
https           443/tcp
ntp             123/udp
";

const PROTOCOLS_FIXTURE: &str = "\
icmp    1       ICMP
tcp     6       TCP
udp     17      UDP
esp     50      ESP
ah      51      AH
";

/// A simulated host: rule files on disk, a mock inventory and a stateful
/// mock kernel, all wired into one [`Firewall`].
pub struct TestHost {
    pub fw: Firewall,
    pub kernel: MockIptablesOps,
    pub config_dir: PathBuf,
    _dir: TempDir,
}

pub fn net(bridge: &str, mac: Option<&str>) -> NetConfig {
    NetConfig {
        bridge: bridge.to_string(),
        tag: None,
        macaddr: mac.map(str::to_string),
    }
}

pub fn single_net(netid: &str, config: NetConfig) -> VmNetConfig {
    let mut net = VmNetConfig::new();
    net.insert(netid.to_string(), config);
    net
}

/// Build a test host. `files` are written into the firewall config
/// directory (e.g. `("100.fw", "...")`, `("groups.fw", "...")`); a
/// `host.fw` entry becomes the host rule file instead.
pub fn build_host(vms: BTreeMap<u32, VmNetConfig>, files: &[(&str, &str)]) -> TestHost {
    let dir = tempfile::tempdir().expect("tempdir");
    let config_dir = dir.path().join("firewall");
    let bridge_nf_dir = dir.path().join("bridge-nf");
    std::fs::create_dir_all(&config_dir).expect("config dir");
    std::fs::create_dir_all(&bridge_nf_dir).expect("bridge-nf dir");

    let host_fw = dir.path().join("host.fw");
    for (name, content) in files {
        let path = if *name == "host.fw" {
            host_fw.clone()
        } else {
            config_dir.join(name)
        };
        std::fs::write(path, content).expect("rule file");
    }

    let services_path = dir.path().join("services");
    let protocols_path = dir.path().join("protocols");
    std::fs::write(&services_path, SERVICES_FIXTURE).expect("services fixture");
    std::fs::write(&protocols_path, PROTOCOLS_FIXTURE).expect("protocols fixture");
    let services = ServiceDirectory::load_from(&services_path, &protocols_path);

    let kernel = MockIptablesOps::new();
    let paths = Paths {
        config_dir: config_dir.clone(),
        host_fw,
        bridge_nf_dir,
    };
    let fw = Firewall::with_services(
        paths,
        Box::new(MockInventory::with_vms(vms)),
        Box::new(kernel.clone()),
        services,
    );

    TestHost {
        fw,
        kernel,
        config_dir,
        _dir: dir,
    }
}

/// Rules of one chain as currently present in the mock kernel.
pub fn kernel_chain(host: &TestHost, chain: &str) -> Option<Vec<String>> {
    let state = host.kernel.state.lock().unwrap();
    state.chains.get(chain).cloned()
}

pub fn kernel_builtin(host: &TestHost, chain: &str) -> Vec<String> {
    let state = host.kernel.state.lock().unwrap();
    state.builtins.get(chain).cloned().unwrap_or_default()
}
