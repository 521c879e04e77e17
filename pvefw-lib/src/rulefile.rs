//! Parser for the three firewall rule file schemas.
//!
//! VM files carry `[in]`, `[out]` and `[options]` sections, host files
//! `[in]` and `[out]`, group files `[in:<group>]` and `[out:<group>]`.
//! A malformed line never fails the file: it is skipped with a warning
//! carrying file name and line number, and prior lines stay valid.

use regex::Regex;
use thiserror::Error;

use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::macros;
use crate::rule::{self, Action, Policy, Rule};
use crate::services::ServiceDirectory;

/// Longest group name that still keeps `GROUP-<name>-OUT` within the
/// kernel's 28 byte chain name limit.
const MAX_GROUP_NAME_LEN: usize = 18;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}

#[derive(Debug, Error)]
enum LineError {
    #[error(transparent)]
    Rule(#[from] rule::Error),
    #[error("too many fields")]
    TooManyFields,
    #[error("unknown macro `{0}`")]
    UnknownMacro(String),
    #[error("macro {0}: {1}")]
    MacroExpansion(&'static str, rule::Error),
    #[error("group references are not allowed here")]
    GroupNotAllowed,
    #[error("invalid group name `{0}`")]
    InvalidGroupName(String),
    #[error("unknown option `{0}`")]
    UnknownOption(String),
    #[error("invalid value `{value}` for option `{option}`")]
    InvalidOptionValue { option: String, value: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmOptions {
    pub enable: bool,
    pub policy_in: Policy,
    pub policy_out: Policy,
    pub macfilter: bool,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions {
            enable: true,
            policy_in: Policy::Drop,
            policy_out: Policy::Accept,
            macfilter: true,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct VmRuleFile {
    pub rules_in: Vec<Rule>,
    pub rules_out: Vec<Rule>,
    pub options: VmOptions,
}

#[derive(Clone, Debug, Default)]
pub struct HostRuleFile {
    pub rules_in: Vec<Rule>,
    pub rules_out: Vec<Rule>,
}

#[derive(Clone, Debug, Default)]
pub struct GroupRules {
    pub rules_in: Vec<Rule>,
    pub rules_out: Vec<Rule>,
}

#[derive(Clone, Debug, Default)]
pub struct GroupsFile {
    pub groups: BTreeMap<String, GroupRules>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum VmSection {
    In,
    Out,
    Options,
}

pub fn parse_vm_config(file: &str, content: &str, services: &ServiceDirectory) -> VmRuleFile {
    let mut parsed = VmRuleFile::default();
    let mut section: Option<VmSection> = None;

    for (lineno, raw) in numbered_lines(content) {
        match raw {
            "[in]" => {
                section = Some(VmSection::In);
                continue;
            }
            "[out]" => {
                section = Some(VmSection::Out);
                continue;
            }
            "[options]" => {
                section = Some(VmSection::Options);
                continue;
            }
            _ => {}
        }
        match section {
            None => warn_skipped(file, lineno, "line outside any section"),
            Some(VmSection::Options) => match parse_option_line(raw, &mut parsed.options) {
                Ok(()) => {}
                Err(error) => warn_line(file, lineno, &error),
            },
            Some(which @ (VmSection::In | VmSection::Out)) => {
                match parse_rule_line(raw, true, true, services) {
                    Ok(mut rules) => {
                        if which == VmSection::In {
                            parsed.rules_in.append(&mut rules);
                        } else {
                            parsed.rules_out.append(&mut rules);
                        }
                    }
                    Err(error) => warn_line(file, lineno, &error),
                }
            }
        }
    }
    parsed
}

pub fn parse_host_config(file: &str, content: &str, services: &ServiceDirectory) -> HostRuleFile {
    let mut parsed = HostRuleFile::default();
    let mut section: Option<bool> = None; // Some(is_in)

    for (lineno, raw) in numbered_lines(content) {
        match raw {
            "[in]" => {
                section = Some(true);
                continue;
            }
            "[out]" => {
                section = Some(false);
                continue;
            }
            _ => {}
        }
        match section {
            None => warn_skipped(file, lineno, "line outside any section"),
            Some(is_in) => match parse_rule_line(raw, true, true, services) {
                Ok(mut rules) => {
                    if is_in {
                        parsed.rules_in.append(&mut rules);
                    } else {
                        parsed.rules_out.append(&mut rules);
                    }
                }
                Err(error) => warn_line(file, lineno, &error),
            },
        }
    }
    parsed
}

static GROUP_SECTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[(in|out):(\S+)\]$").unwrap());

pub fn parse_groups_config(file: &str, content: &str, services: &ServiceDirectory) -> GroupsFile {
    let mut parsed = GroupsFile::default();
    let mut section: Option<(bool, String)> = None; // (is_in, group)

    for (lineno, raw) in numbered_lines(content) {
        if let Some(captures) = GROUP_SECTION_RE.captures(raw) {
            let name = captures[2].to_string();
            if !valid_group_name(&name) {
                warn_line(file, lineno, &LineError::InvalidGroupName(name));
                section = None;
                continue;
            }
            section = Some((&captures[1] == "in", name));
            continue;
        }
        match &section {
            None => warn_skipped(file, lineno, "line outside any section"),
            Some((is_in, group)) => match parse_rule_line(raw, false, false, services) {
                Ok(mut rules) => {
                    let entry = parsed.groups.entry(group.clone()).or_default();
                    if *is_in {
                        entry.rules_in.append(&mut rules);
                    } else {
                        entry.rules_out.append(&mut rules);
                    }
                }
                Err(error) => warn_line(file, lineno, &error),
            },
        }
    }
    parsed
}

/// Strip comments and blank lines, keeping one-based line numbers.
fn numbered_lines(content: &str) -> impl Iterator<Item = (usize, &str)> {
    content
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.split('#').next().unwrap_or("").trim()))
        .filter(|(_, line)| !line.is_empty())
}

fn warn_line(file: &str, lineno: usize, error: &LineError) {
    tracing::warn!(file, line = lineno, %error, "skipping invalid line");
}

fn warn_skipped(file: &str, lineno: usize, reason: &str) {
    tracing::warn!(file, line = lineno, reason, "skipping line");
}

enum ActionSpec {
    Direct(Action),
    Macro(&'static macros::MacroDef, Policy),
}

static MACRO_INVOCATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z][A-Za-z0-9]*)\((ACCEPT|DROP|REJECT)\)$").unwrap());

fn parse_action_spec(token: &str, allow_groups: bool) -> Result<ActionSpec, LineError> {
    if let Some(captures) = MACRO_INVOCATION_RE.captures(token) {
        let name = &captures[1];
        let def = macros::find(name).ok_or_else(|| LineError::UnknownMacro(name.to_string()))?;
        let policy: Policy = captures[2].parse()?;
        return Ok(ActionSpec::Macro(def, policy));
    }
    match token.parse::<Action>()? {
        action @ (Action::Accept | Action::Drop | Action::Reject) => Ok(ActionSpec::Direct(action)),
        Action::Group(name) => {
            if !allow_groups {
                return Err(LineError::GroupNotAllowed);
            }
            if !valid_group_name(&name) {
                return Err(LineError::InvalidGroupName(name));
            }
            Ok(ActionSpec::Direct(Action::Group(name)))
        }
        other => Err(rule::Error::InvalidAction(other.to_string()).into()),
    }
}

fn valid_group_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_GROUP_NAME_LEN
        && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        && name.as_bytes()[0].is_ascii_alphanumeric()
}

fn parse_rule_line(
    line: &str,
    has_iface: bool,
    allow_groups: bool,
    services: &ServiceDirectory,
) -> Result<Vec<Rule>, LineError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let max_fields = if has_iface { 7 } else { 6 };
    if tokens.len() > max_fields {
        return Err(LineError::TooManyFields);
    }

    let spec = parse_action_spec(tokens[0], allow_groups)?;

    let field = |index: usize| {
        tokens
            .get(index)
            .filter(|token| **token != "-")
            .map(|token| token.to_string())
    };
    let offset = if has_iface { 1 } else { 0 };

    // scratch rule carrying the raw fields; the action is settled below
    let mut base = Rule::new(Action::Drop);
    if has_iface {
        base.iface = field(1);
    }
    base.source = field(offset + 1);
    base.dest = field(offset + 2);
    base.proto = field(offset + 3);
    base.dport = field(offset + 4);
    base.sport = field(offset + 5);

    match spec {
        ActionSpec::Direct(action) => {
            base.action = action;
            base.validate(services)?;
            Ok(vec![base])
        }
        ActionSpec::Macro(def, policy) => {
            let mut rules = def.expand(&base, &Action::from(policy));
            for expanded in &mut rules {
                expanded
                    .validate(services)
                    .map_err(|error| LineError::MacroExpansion(def.name, error))?;
            }
            Ok(rules)
        }
    }
}

fn parse_option_line(line: &str, options: &mut VmOptions) -> Result<(), LineError> {
    let (key, value) = line
        .split_once(':')
        .map(|(k, v)| (k.trim(), v.trim()))
        .ok_or_else(|| LineError::UnknownOption(line.to_string()))?;

    let invalid = |option: &str, value: &str| LineError::InvalidOptionValue {
        option: option.to_string(),
        value: value.to_string(),
    };

    match key {
        "enable" => match value {
            "0" => options.enable = false,
            "1" => options.enable = true,
            _ => return Err(invalid(key, value)),
        },
        "macfilter" => match value {
            "0" => options.macfilter = false,
            "1" => options.macfilter = true,
            _ => return Err(invalid(key, value)),
        },
        "policy-in" => options.policy_in = value.parse().map_err(|_| invalid(key, value))?,
        "policy-out" => options.policy_out = value.parse().map_err(|_| invalid(key, value))?,
        _ => return Err(LineError::UnknownOption(key.to_string())),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_directory;

    #[test]
    fn vm_file_sections_split_rules_and_options() -> anyhow::Result<()> {
        let dir = test_directory();
        let content = "\
# demo vm rules
[in]
ACCEPT - - - tcp 22 -
HTTP(ACCEPT) - - - - - -

[out]
DROP - - 10.7.7.7 - - -

[options]
policy-in: REJECT
enable: 1
";
        let parsed = parse_vm_config("100.fw", content, &dir);
        assert_eq!(parsed.rules_in.len(), 2);
        assert_eq!(parsed.rules_out.len(), 1);
        assert_eq!(parsed.options.policy_in, Policy::Reject);
        assert_eq!(parsed.options.policy_out, Policy::Accept);
        assert!(parsed.options.enable);
        Ok(())
    }

    #[test]
    fn malformed_lines_are_skipped_and_the_rest_survives() -> anyhow::Result<()> {
        let dir = test_directory();
        let content = "\
[in]
ACCEPT - - - tcp 22 -
ACCEPT - - - tcp 99999 -
NOSUCH(ACCEPT) - - - - - -
ACCEPT - - - tcp 80 - extra-field
ACCEPT - - - tcp 443 -
";
        let parsed = parse_vm_config("100.fw", content, &dir);
        assert_eq!(parsed.rules_in.len(), 2);
        assert_eq!(parsed.rules_in[1].dport.as_deref(), Some("443"));
        Ok(())
    }

    #[test]
    fn lines_outside_sections_are_ignored() -> anyhow::Result<()> {
        let dir = test_directory();
        let content = "ACCEPT - - - tcp 22 -\n[in]\nACCEPT - - - tcp 80 -\n";
        let parsed = parse_vm_config("100.fw", content, &dir);
        assert_eq!(parsed.rules_in.len(), 1);
        Ok(())
    }

    #[test]
    fn macro_invocation_expands_into_validated_rules() -> anyhow::Result<()> {
        let dir = test_directory();
        let parsed = parse_vm_config("100.fw", "[in]\ndns(ACCEPT) - - - - - -\n", &dir);
        assert_eq!(parsed.rules_in.len(), 2);
        assert_eq!(parsed.rules_in[0].action, Action::Accept);
        assert_eq!(parsed.rules_in[0].nbdport, 1);
        Ok(())
    }

    #[test]
    fn short_lines_leave_trailing_fields_unset() -> anyhow::Result<()> {
        let dir = test_directory();
        let parsed = parse_vm_config("100.fw", "[in]\nACCEPT net0\n", &dir);
        assert_eq!(parsed.rules_in.len(), 1);
        assert_eq!(parsed.rules_in[0].iface.as_deref(), Some("net0"));
        assert!(parsed.rules_in[0].source.is_none());
        Ok(())
    }

    #[test]
    fn unknown_options_fail_their_line_only() -> anyhow::Result<()> {
        let dir = test_directory();
        let content = "[options]\nnosuch: 1\nenable: 0\npolicy-out: same\n";
        let parsed = parse_vm_config("100.fw", content, &dir);
        assert!(!parsed.options.enable);
        assert_eq!(parsed.options.policy_out, Policy::Accept);
        Ok(())
    }

    #[test]
    fn group_references_are_rejected_inside_group_files() -> anyhow::Result<()> {
        let dir = test_directory();
        let content = "[in:web]\nGROUP-other - - - - -\nACCEPT - - tcp 80 -\n";
        let parsed = parse_groups_config("groups.fw", content, &dir);
        let web = parsed.groups.get("web").expect("web group");
        assert_eq!(web.rules_in.len(), 1);
        assert_eq!(web.rules_in[0].dport.as_deref(), Some("80"));
        Ok(())
    }

    #[test]
    fn groups_file_sections_carry_direction_and_name() -> anyhow::Result<()> {
        let dir = test_directory();
        let content = "\
[in:web]
ACCEPT - - tcp 80 -
[out:web]
ACCEPT - - tcp 80 -
[in:db]
ACCEPT 10.0.0.0/24 - tcp 5432 -
";
        let parsed = parse_groups_config("groups.fw", content, &dir);
        assert_eq!(parsed.groups.len(), 2);
        assert_eq!(parsed.groups["web"].rules_out.len(), 1);
        assert_eq!(parsed.groups["db"].rules_in[0].source.as_deref(), Some("10.0.0.0/24"));
        Ok(())
    }

    #[test]
    fn overlong_group_names_are_rejected() -> anyhow::Result<()> {
        let dir = test_directory();
        let content = "[in:averylonggroupnamethatwontfit]\nACCEPT - - tcp 80 -\n";
        let parsed = parse_groups_config("groups.fw", content, &dir);
        assert!(parsed.groups.is_empty());
        Ok(())
    }

    #[test]
    fn host_file_accepts_group_references() -> anyhow::Result<()> {
        let dir = test_directory();
        let content = "[in]\nGROUP-mgmt - - - - - -\n";
        let parsed = parse_host_config("host.fw", content, &dir);
        assert_eq!(parsed.rules_in.len(), 1);
        assert_eq!(parsed.rules_in[0].action, Action::Group("mgmt".to_string()));
        Ok(())
    }

    #[test]
    fn parse_render_round_trip_preserves_the_rule() -> anyhow::Result<()> {
        let dir = test_directory();
        let content = "[in]\nACCEPT net0 10.0.0.0/24 - tcp 80,443 22\n";
        let parsed = parse_vm_config("100.fw", content, &dir);
        let rendered = parsed.rules_in[0].to_config_line(true);

        let reparsed = parse_vm_config("100.fw", &format!("[in]\n{rendered}\n"), &dir);
        assert_eq!(reparsed.rules_in[0], parsed.rules_in[0]);
        Ok(())
    }
}
