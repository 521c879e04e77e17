//! Name directory for `/etc/services` and `/etc/protocols`.
//!
//! Loaded once per process and immutable afterwards. Missing files degrade
//! to empty tables with a warning; lookups against user input then fail for
//! anything that needs them.

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

pub const SERVICES_PATH: &str = "/etc/services";
pub const PROTOCOLS_PATH: &str = "/etc/protocols";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ServiceEntry {
    pub port: u16,
    pub tcp: bool,
    pub udp: bool,
}

impl ServiceEntry {
    pub fn supports(&self, proto: &str) -> bool {
        match proto {
            "tcp" => self.tcp,
            "udp" => self.udp,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ServiceDirectory {
    services_by_name: HashMap<String, ServiceEntry>,
    services_by_port: HashMap<u16, String>,
    protocols_by_name: HashMap<String, u8>,
    protocols_by_number: HashMap<u8, String>,
}

static SHARED: LazyLock<ServiceDirectory> =
    LazyLock::new(|| ServiceDirectory::load_from(Path::new(SERVICES_PATH), Path::new(PROTOCOLS_PATH)));

impl ServiceDirectory {
    /// The process-wide directory backed by the OS tables.
    pub fn shared() -> &'static ServiceDirectory {
        &SHARED
    }

    pub fn load_from(services_path: &Path, protocols_path: &Path) -> Self {
        let mut dir = ServiceDirectory::default();
        match std::fs::read_to_string(services_path) {
            Ok(content) => dir.parse_services(&content),
            Err(error) => {
                tracing::warn!(path = %services_path.display(), %error, "unable to read services table");
            }
        }
        match std::fs::read_to_string(protocols_path) {
            Ok(content) => dir.parse_protocols(&content),
            Err(error) => {
                tracing::warn!(path = %protocols_path.display(), %error, "unable to read protocols table");
            }
        }
        dir
    }

    fn parse_services(&mut self, content: &str) {
        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("");
            let mut fields = line.split_whitespace();
            let (Some(name), Some(portproto)) = (fields.next(), fields.next()) else {
                continue;
            };
            let Some((port, proto)) = portproto.split_once('/') else {
                continue;
            };
            let Ok(port) = port.parse::<u16>() else {
                continue;
            };
            let entry = self.services_by_name.entry(name.to_string()).or_default();
            entry.port = port;
            match proto {
                "tcp" => entry.tcp = true,
                "udp" => entry.udp = true,
                _ => continue,
            }
            self.services_by_port.entry(port).or_insert_with(|| name.to_string());
        }
    }

    fn parse_protocols(&mut self, content: &str) {
        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("");
            let mut fields = line.split_whitespace();
            let (Some(name), Some(number)) = (fields.next(), fields.next()) else {
                continue;
            };
            let Ok(number) = number.parse::<u8>() else {
                continue;
            };
            self.protocols_by_name.insert(name.to_string(), number);
            self.protocols_by_number
                .entry(number)
                .or_insert_with(|| name.to_string());
        }
    }

    pub fn service(&self, name: &str) -> Option<&ServiceEntry> {
        self.services_by_name.get(name)
    }

    pub fn service_name(&self, port: u16) -> Option<&str> {
        self.services_by_port.get(&port).map(String::as_str)
    }

    pub fn protocol(&self, name: &str) -> Option<u8> {
        self.protocols_by_name.get(name).copied()
    }

    pub fn protocol_name(&self, number: u8) -> Option<&str> {
        self.protocols_by_number.get(&number).map(String::as_str)
    }
}

#[cfg(test)]
pub(crate) fn test_directory() -> ServiceDirectory {
    let mut dir = ServiceDirectory::default();
    dir.parse_services(
        "# fixture\n\
         ssh             22/tcp\n\
         domain          53/tcp\n\
         domain          53/udp\n\
         http            80/tcp            www\n\
         https           443/tcp\n\
         ntp             123/udp\n\
         snmp            161/udp\n",
    );
    dir.parse_protocols(
        "# fixture\n\
         icmp    1       ICMP\n\
         tcp     6       TCP\n\
         udp     17      UDP\n\
         esp     50      ESP\n\
         ah      51      AH\n\
         ospf    89      OSPFIGP\n",
    );
    dir
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn services_merge_tcp_and_udp_lines() -> anyhow::Result<()> {
        let dir = test_directory();
        let domain = dir.service("domain").expect("domain entry");
        assert_eq!(domain.port, 53);
        assert!(domain.tcp);
        assert!(domain.udp);

        let http = dir.service("http").expect("http entry");
        assert!(http.tcp);
        assert!(!http.udp);
        Ok(())
    }

    #[test]
    fn lookups_are_case_sensitive() -> anyhow::Result<()> {
        let dir = test_directory();
        assert!(dir.service("ssh").is_some());
        assert!(dir.service("SSH").is_none());
        Ok(())
    }

    #[test]
    fn protocol_lookup_by_name_and_number() -> anyhow::Result<()> {
        let dir = test_directory();
        assert_eq!(dir.protocol("tcp"), Some(6));
        assert_eq!(dir.protocol_name(17), Some("udp"));
        assert_eq!(dir.protocol("nosuch"), None);
        Ok(())
    }

    #[test]
    fn missing_files_degrade_to_empty_tables() -> anyhow::Result<()> {
        let dir = ServiceDirectory::load_from(Path::new("/nonexistent/services"), Path::new("/nonexistent/protocols"));
        assert!(dir.service("ssh").is_none());
        assert!(dir.protocol("tcp").is_none());
        Ok(())
    }

    #[test]
    fn reverse_service_lookup_keeps_first_name() -> anyhow::Result<()> {
        let dir = test_directory();
        assert_eq!(dir.service_name(80), Some("http"));
        assert_eq!(dir.service_name(1234), None);
        Ok(())
    }
}
