use thiserror::Error;

use std::fmt::{self, Display};
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::services::ServiceDirectory;

/// Terminal or chain-targeting action of a single rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Accept,
    Drop,
    Reject,
    Return,
    SetAcceptMark,
    Group(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid action `{0}`")]
    InvalidAction(String),
    #[error("invalid interface `{0}`, expected net0..net31")]
    InvalidInterface(String),
    #[error("invalid address `{0}`")]
    InvalidAddress(String),
    #[error("invalid port `{0}`")]
    InvalidPort(String),
    #[error("port {0} out of range")]
    PortOutOfRange(i64),
    #[error("backwards port range {0}:{1}")]
    BackwardsPortRange(u16, u16),
    #[error("unknown service `{0}`")]
    UnknownService(String),
    #[error("service `{service}` does not support protocol {proto}")]
    ServiceProtocolMismatch { service: String, proto: String },
    #[error("unknown protocol `{0}`")]
    UnknownProtocol(String),
    #[error("port list without tcp or udp protocol")]
    PortWithoutProtocol,
}

impl Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Accept => write!(f, "ACCEPT"),
            Action::Drop => write!(f, "DROP"),
            Action::Reject => write!(f, "REJECT"),
            Action::Return => write!(f, "RETURN"),
            Action::SetAcceptMark => write!(f, "PVEFW-SET-ACCEPT-MARK"),
            Action::Group(name) => write!(f, "GROUP-{name}"),
        }
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACCEPT" => Ok(Action::Accept),
            "DROP" => Ok(Action::Drop),
            "REJECT" => Ok(Action::Reject),
            "RETURN" => Ok(Action::Return),
            "PVEFW-SET-ACCEPT-MARK" => Ok(Action::SetAcceptMark),
            other => match other.strip_prefix("GROUP-") {
                Some(name) if !name.is_empty() => Ok(Action::Group(name.to_string())),
                _ => Err(Error::InvalidAction(other.to_string())),
            },
        }
    }
}

/// Default verdict applied after all user rules of a chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Policy {
    Accept,
    Drop,
    Reject,
}

impl Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Policy::Accept => write!(f, "ACCEPT"),
            Policy::Drop => write!(f, "DROP"),
            Policy::Reject => write!(f, "REJECT"),
        }
    }
}

impl FromStr for Policy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACCEPT" => Ok(Policy::Accept),
            "DROP" => Ok(Policy::Drop),
            "REJECT" => Ok(Policy::Reject),
            other => Err(Error::InvalidAction(other.to_string())),
        }
    }
}

impl From<Policy> for Action {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::Accept => Action::Accept,
            Policy::Drop => Action::Drop,
            Policy::Reject => Action::Reject,
        }
    }
}

/// Canonical intermediate form of a single firewall rule.
///
/// Address and port lists are kept in their configuration spelling; the
/// cardinalities are derived during [`Rule::validate`] and drive the choice
/// of the multiport and iprange matchers when the rule is rendered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rule {
    pub action: Action,
    pub iface: Option<String>,
    pub source: Option<String>,
    pub dest: Option<String>,
    pub proto: Option<String>,
    pub dport: Option<String>,
    pub sport: Option<String>,
    pub nbsource: usize,
    pub nbdest: usize,
    pub nbdport: usize,
    pub nbsport: usize,
}

impl Rule {
    pub fn new(action: Action) -> Self {
        Rule {
            action,
            iface: None,
            source: None,
            dest: None,
            proto: None,
            dport: None,
            sport: None,
            nbsource: 0,
            nbdest: 0,
            nbdport: 0,
            nbsport: 0,
        }
    }

    /// Validate every present field and derive the cardinality counts.
    pub fn validate(&mut self, services: &ServiceDirectory) -> Result<(), Error> {
        if let Some(iface) = &self.iface {
            parse_iface(iface)?;
        }
        self.nbsource = match &self.source {
            Some(source) => parse_address_list(source)?,
            None => 0,
        };
        self.nbdest = match &self.dest {
            Some(dest) => parse_address_list(dest)?,
            None => 0,
        };
        if let Some(proto) = &self.proto {
            parse_protocol(proto, services)?;
        }
        if self.dport.is_some() || self.sport.is_some() {
            let proto = self.proto.as_deref().ok_or(Error::PortWithoutProtocol)?;
            self.nbdport = match &self.dport {
                Some(dport) => parse_port_list(dport, proto, services)?,
                None => 0,
            };
            self.nbsport = match &self.sport {
                Some(sport) => parse_port_list(sport, proto, services)?,
                None => 0,
            };
        } else {
            self.nbdport = 0;
            self.nbsport = 0;
        }
        Ok(())
    }

    /// Render one fully formed filter command appending to `chain`.
    ///
    /// Matcher order is fixed: source, dest, protocol, destination ports,
    /// source ports, terminator. Lists with more than one entry select the
    /// iprange respectively multiport matcher. The `iface` field is a
    /// compiler concern and not rendered here.
    pub fn to_command(&self, chain: &str, goto: bool) -> String {
        format!("-A {chain}{}{}", self.matcher_string(), self.terminator(goto))
    }

    /// Like [`Rule::to_command`] but with the rule's interface rendered as
    /// an `-i`/`-o` match right after the chain. Used for host rules, where
    /// the interface is part of the match instead of selecting a chain.
    pub fn to_command_with_iface(&self, chain: &str, iface_flag: &str, goto: bool) -> String {
        match &self.iface {
            Some(iface) => format!(
                "-A {chain} {iface_flag} {iface}{}{}",
                self.matcher_string(),
                self.terminator(goto)
            ),
            None => self.to_command(chain, goto),
        }
    }

    fn matcher_string(&self) -> String {
        let mut cmd = String::new();
        if let Some(source) = &self.source {
            if self.nbsource > 1 {
                cmd.push_str(&format!(" -m iprange --src-range {source}"));
            } else {
                cmd.push_str(&format!(" -s {source}"));
            }
        }
        if let Some(dest) = &self.dest {
            if self.nbdest > 1 {
                cmd.push_str(&format!(" -m iprange --dst-range {dest}"));
            } else {
                cmd.push_str(&format!(" -d {dest}"));
            }
        }
        if let Some(proto) = &self.proto {
            cmd.push_str(&format!(" -p {proto}"));
        }
        if let Some(dport) = &self.dport {
            if self.nbdport > 1 {
                cmd.push_str(" --match multiport");
            }
            cmd.push_str(&format!(" --dport {dport}"));
        }
        if let Some(sport) = &self.sport {
            if self.nbsport > 1 {
                cmd.push_str(" --match multiport");
            }
            cmd.push_str(&format!(" --sport {sport}"));
        }
        cmd
    }

    fn terminator(&self, goto: bool) -> String {
        let goto = goto || self.action == Action::SetAcceptMark;
        let flag = if goto { "-g" } else { "-j" };
        format!(" {flag} {}", self.action)
    }

    /// Render the rule back into its configuration-file spelling.
    pub fn to_config_line(&self, with_iface: bool) -> String {
        let field = |value: &Option<String>| value.clone().unwrap_or_else(|| "-".to_string());
        let mut out = self.action.to_string();
        if with_iface {
            out.push_str(&format!(" {}", field(&self.iface)));
        }
        out.push_str(&format!(
            " {} {} {} {} {}",
            field(&self.source),
            field(&self.dest),
            field(&self.proto),
            field(&self.dport),
            field(&self.sport)
        ));
        out
    }
}

impl Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_config_line(true))
    }
}

pub fn parse_iface(token: &str) -> Result<u8, Error> {
    let invalid = || Error::InvalidInterface(token.to_string());
    let index = token.strip_prefix("net").ok_or_else(invalid)?;
    if index.is_empty() || index.len() > 2 || !index.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let index: u8 = index.parse().map_err(|_| invalid())?;
    if index > 31 {
        return Err(invalid());
    }
    Ok(index)
}

/// Validate a comma-separated list of IPv4 addresses or CIDR networks and
/// return the number of entries.
pub fn parse_address_list(list: &str) -> Result<usize, Error> {
    let invalid = |token: &str| Error::InvalidAddress(token.to_string());
    let mut count = 0;
    for token in list.split(',') {
        let (addr, prefix) = match token.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (token, None),
        };
        Ipv4Addr::from_str(addr).map_err(|_| invalid(token))?;
        if let Some(prefix) = prefix {
            let bits: u8 = prefix.parse().map_err(|_| invalid(token))?;
            if bits > 32 {
                return Err(invalid(token));
            }
        }
        count += 1;
    }
    Ok(count)
}

/// Validate a comma-separated port list and return its multiport weight:
/// single ports count one, a `lo:hi` range counts two.
pub fn parse_port_list(list: &str, proto: &str, services: &ServiceDirectory) -> Result<usize, Error> {
    let mut count = 0;
    for token in list.split(',') {
        count += parse_port_name_number_or_range(token, proto, services)?;
    }
    Ok(count)
}

fn parse_port_name_number_or_range(
    token: &str,
    proto: &str,
    services: &ServiceDirectory,
) -> Result<usize, Error> {
    match token.split_once(':') {
        Some((lo, hi)) => {
            let lo = parse_port_name_or_number(lo, proto, services)?;
            let hi = parse_port_name_or_number(hi, proto, services)?;
            if lo > hi {
                return Err(Error::BackwardsPortRange(lo, hi));
            }
            Ok(2)
        }
        None => {
            parse_port_name_or_number(token, proto, services)?;
            Ok(1)
        }
    }
}

fn parse_port_name_or_number(token: &str, proto: &str, services: &ServiceDirectory) -> Result<u16, Error> {
    if token.is_empty() {
        return Err(Error::InvalidPort(token.to_string()));
    }
    if token.bytes().all(|b| b.is_ascii_digit()) {
        let pon: i64 = token.parse().map_err(|_| Error::InvalidPort(token.to_string()))?;
        if pon < 1 || pon > 65535 {
            return Err(Error::PortOutOfRange(pon));
        }
        return Ok(pon as u16);
    }
    let entry = services
        .service(token)
        .ok_or_else(|| Error::UnknownService(token.to_string()))?;
    if matches!(proto, "tcp" | "udp") && !entry.supports(proto) {
        return Err(Error::ServiceProtocolMismatch {
            service: token.to_string(),
            proto: proto.to_string(),
        });
    }
    Ok(entry.port)
}

fn parse_protocol(token: &str, services: &ServiceDirectory) -> Result<(), Error> {
    if token.bytes().all(|b| b.is_ascii_digit()) {
        let number: i64 = token.parse().map_err(|_| Error::UnknownProtocol(token.to_string()))?;
        if number > 255 {
            return Err(Error::UnknownProtocol(token.to_string()));
        }
        return Ok(());
    }
    services
        .protocol(token)
        .map(|_| ())
        .ok_or_else(|| Error::UnknownProtocol(token.to_string()))
}
