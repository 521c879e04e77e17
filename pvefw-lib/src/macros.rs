//! Service macro registry.
//!
//! Macros are data: each entry expands into one or more partial rule
//! templates. A template field is either a literal or a sentinel referring
//! back to the invoking rule ([`Field::Param`], [`Field::Source`],
//! [`Field::Dest`]); swapping source and dest in a template expresses the
//! reverse direction of a bidirectional flow. Lookup is case-insensitive,
//! diagnostics echo the canonical capitalization.

use std::collections::HashMap;
use std::sync::LazyLock;

use crate::rule::{Action, Rule};

#[derive(Clone, Copy, Debug)]
pub enum Field {
    Lit(&'static str),
    Param,
    Source,
    Dest,
}

#[derive(Clone, Copy, Debug)]
pub struct Template {
    pub proto: Option<Field>,
    pub dport: Option<Field>,
    pub sport: Option<Field>,
    pub source: Option<Field>,
    pub dest: Option<Field>,
}

pub struct MacroDef {
    /// Preferred-case name, echoed in diagnostics.
    pub name: &'static str,
    pub templates: &'static [Template],
}

const fn lit(value: &'static str) -> Option<Field> {
    Some(Field::Lit(value))
}

const fn tcp(dport: &'static str) -> Template {
    Template {
        proto: lit("tcp"),
        dport: lit(dport),
        sport: None,
        source: None,
        dest: None,
    }
}

const fn udp(dport: &'static str) -> Template {
    Template {
        proto: lit("udp"),
        dport: lit(dport),
        sport: None,
        source: None,
        dest: None,
    }
}

const fn proto(name: &'static str) -> Template {
    Template {
        proto: lit(name),
        dport: None,
        sport: None,
        source: None,
        dest: None,
    }
}

static MACROS: &[MacroDef] = &[
    MacroDef { name: "Amanda", templates: &[udp("10080"), tcp("10080")] },
    MacroDef { name: "Auth", templates: &[tcp("113")] },
    MacroDef { name: "BGP", templates: &[tcp("179")] },
    MacroDef { name: "BitTorrent", templates: &[tcp("6881:6889"), udp("6881")] },
    MacroDef { name: "CVS", templates: &[tcp("2401")] },
    MacroDef { name: "Citrix", templates: &[tcp("1494"), udp("1604"), tcp("2598")] },
    MacroDef { name: "DAAP", templates: &[tcp("3689"), udp("3689")] },
    MacroDef { name: "DCC", templates: &[tcp("6277")] },
    MacroDef {
        name: "DHCPfwd",
        templates: &[Template {
            proto: lit("udp"),
            dport: lit("67:68"),
            sport: lit("67:68"),
            source: None,
            dest: None,
        }],
    },
    MacroDef { name: "DNS", templates: &[udp("53"), tcp("53")] },
    MacroDef { name: "Distcc", templates: &[tcp("3632")] },
    MacroDef { name: "FTP", templates: &[tcp("21")] },
    MacroDef { name: "Finger", templates: &[tcp("79")] },
    MacroDef { name: "GNUnet", templates: &[tcp("2086"), udp("2086")] },
    MacroDef { name: "Git", templates: &[tcp("9418")] },
    MacroDef { name: "HKP", templates: &[tcp("11371")] },
    MacroDef { name: "HTTP", templates: &[tcp("80")] },
    MacroDef { name: "HTTPS", templates: &[tcp("443")] },
    MacroDef { name: "ICPV2", templates: &[udp("3130")] },
    MacroDef { name: "ICQ", templates: &[tcp("5190")] },
    MacroDef { name: "IMAP", templates: &[tcp("143")] },
    MacroDef { name: "IMAPS", templates: &[tcp("993")] },
    MacroDef { name: "IPsec", templates: &[proto("ah"), proto("esp"), udp("500")] },
    MacroDef { name: "IPsecah", templates: &[proto("ah"), udp("500")] },
    MacroDef { name: "IPsecnat", templates: &[udp("500"), udp("4500"), proto("esp")] },
    MacroDef { name: "IRC", templates: &[tcp("6667")] },
    MacroDef { name: "Jetdirect", templates: &[tcp("9100")] },
    MacroDef { name: "L2TP", templates: &[udp("1701")] },
    MacroDef { name: "LDAP", templates: &[tcp("389")] },
    MacroDef { name: "LDAPS", templates: &[tcp("636")] },
    MacroDef { name: "MSNP", templates: &[tcp("1863")] },
    MacroDef { name: "MSSQL", templates: &[tcp("1433")] },
    MacroDef { name: "Mail", templates: &[tcp("25"), tcp("465"), tcp("587")] },
    MacroDef { name: "Munin", templates: &[tcp("4949")] },
    MacroDef { name: "MySQL", templates: &[tcp("3306")] },
    MacroDef { name: "NNTP", templates: &[tcp("119")] },
    MacroDef { name: "NNTPS", templates: &[tcp("563")] },
    MacroDef { name: "NTP", templates: &[udp("123")] },
    MacroDef { name: "OSPF", templates: &[proto("89")] },
    MacroDef { name: "OpenVPN", templates: &[udp("1194")] },
    MacroDef { name: "PCA", templates: &[udp("5632"), tcp("5631")] },
    MacroDef { name: "POP3", templates: &[tcp("110")] },
    MacroDef { name: "POP3S", templates: &[tcp("995")] },
    MacroDef { name: "Ping", templates: &[proto("icmp")] },
    MacroDef { name: "PostgreSQL", templates: &[tcp("5432")] },
    MacroDef { name: "Printer", templates: &[tcp("515")] },
    MacroDef { name: "RDP", templates: &[tcp("3389")] },
    MacroDef { name: "RIP", templates: &[udp("520")] },
    MacroDef { name: "Rdate", templates: &[tcp("37")] },
    MacroDef { name: "Rsync", templates: &[tcp("873")] },
    MacroDef { name: "SANE", templates: &[tcp("6566")] },
    MacroDef {
        name: "SMB",
        templates: &[udp("135"), udp("445"), udp("137:139"), tcp("135:139"), tcp("445")],
    },
    MacroDef { name: "SMTP", templates: &[tcp("25")] },
    MacroDef { name: "SMTPS", templates: &[tcp("465")] },
    MacroDef { name: "SNMP", templates: &[udp("161:162"), tcp("161")] },
    MacroDef { name: "SSH", templates: &[tcp("22")] },
    MacroDef { name: "SVN", templates: &[tcp("3690")] },
    MacroDef { name: "Squid", templates: &[tcp("3128")] },
    MacroDef { name: "Submission", templates: &[tcp("587")] },
    MacroDef { name: "Syslog", templates: &[udp("514"), tcp("514")] },
    MacroDef { name: "TFTP", templates: &[udp("69")] },
    MacroDef { name: "Telnet", templates: &[tcp("23")] },
    MacroDef { name: "Telnets", templates: &[tcp("992")] },
    MacroDef { name: "Time", templates: &[tcp("37"), udp("37")] },
    MacroDef { name: "Trcrt", templates: &[udp("33434:33524"), proto("icmp")] },
    MacroDef { name: "VNC", templates: &[tcp("5900:5909")] },
    MacroDef { name: "VNCL", templates: &[tcp("5500")] },
    MacroDef { name: "Web", templates: &[tcp("80"), tcp("443")] },
    MacroDef { name: "Webcache", templates: &[tcp("8080")] },
    MacroDef { name: "Webmin", templates: &[tcp("10000")] },
    MacroDef { name: "Whois", templates: &[tcp("43")] },
];

static BY_LOWER_NAME: LazyLock<HashMap<String, &'static MacroDef>> = LazyLock::new(|| {
    MACROS
        .iter()
        .map(|def| (def.name.to_ascii_lowercase(), def))
        .collect()
});

/// Case-insensitive macro lookup.
pub fn find(name: &str) -> Option<&'static MacroDef> {
    BY_LOWER_NAME.get(&name.to_ascii_lowercase()).copied()
}

impl MacroDef {
    /// Expand the macro against a parsed rule. Pure: one rule per template,
    /// each carrying the invocation's terminal action.
    pub fn expand(&self, invocation: &Rule, action: &Action) -> Vec<Rule> {
        expand_templates(self.templates, invocation, action)
    }
}

fn expand_templates(templates: &[Template], invocation: &Rule, action: &Action) -> Vec<Rule> {
    templates
        .iter()
        .map(|template| {
            let mut rule = Rule::new(action.clone());
            rule.iface = invocation.iface.clone();
            rule.source = resolve_addr(template.source, invocation, invocation.source.as_deref());
            rule.dest = resolve_addr(template.dest, invocation, invocation.dest.as_deref());
            rule.proto = resolve_service(template.proto, invocation.proto.as_deref());
            rule.dport = resolve_service(template.dport, invocation.dport.as_deref());
            rule.sport = resolve_service(template.sport, invocation.sport.as_deref());
            rule
        })
        .collect()
}

/// Address slots inherit the invoking rule's value unless the template
/// overrides them (including the cross-direction swap via `Source`/`Dest`).
fn resolve_addr(field: Option<Field>, invocation: &Rule, inherited: Option<&str>) -> Option<String> {
    match field {
        None | Some(Field::Param) => inherited.map(str::to_string),
        Some(Field::Lit(value)) => Some(value.to_string()),
        Some(Field::Source) => invocation.source.clone(),
        Some(Field::Dest) => invocation.dest.clone(),
    }
}

/// Service slots (proto and ports) are defined by the template alone;
/// `Param` copies the same-named field from the invoking rule.
fn resolve_service(field: Option<Field>, param: Option<&str>) -> Option<String> {
    match field {
        None => None,
        Some(Field::Lit(value)) => Some(value.to_string()),
        Some(Field::Param) | Some(Field::Source) | Some(Field::Dest) => param.map(str::to_string),
    }
}
