//! End-to-end compile scenarios: rule files on disk plus inventory in,
//! compiled chains out.

use std::collections::BTreeMap;

mod common;
use common::{build_host, net, single_net};

fn vm100(mac: Option<&str>) -> BTreeMap<u32, pvefw_lib::inventory::VmNetConfig> {
    let mut vms = BTreeMap::new();
    vms.insert(100, single_net("net0", net("vmbr0", mac)));
    vms
}

#[test]
fn empty_vm_file_with_defaults_builds_the_full_plumbing() -> anyhow::Result<()> {
    let host = build_host(vm100(Some("aa:bb:cc:dd:ee:01")), &[("100.fw", "")]);
    let ruleset = host.fw.compile()?;

    for chain in ["vmbr0-FW", "vmbr0-IN", "vmbr0-OUT", "tap100i0-IN", "tap100i0-OUT"] {
        assert!(ruleset.has_chain(chain), "missing chain {chain}");
    }

    let tap_in = ruleset.rules("tap100i0-IN").unwrap();
    let len = tap_in.len();
    assert!(tap_in[len - 2].contains("-j LOG --log-prefix \"tap100i0-IN-dropped: \" --log-level 4"));
    assert_eq!(tap_in[len - 1], "-A tap100i0-IN -j DROP");

    let tap_out = ruleset.rules("tap100i0-OUT").unwrap();
    assert_eq!(tap_out.last().map(String::as_str), Some("-A tap100i0-OUT -j RETURN"));
    assert!(
        tap_out
            .iter()
            .any(|r| r == "-A tap100i0-OUT -m mac ! --mac-source aa:bb:cc:dd:ee:01 -j DROP")
    );
    Ok(())
}

#[test]
fn http_macro_expands_to_port_80_accept() -> anyhow::Result<()> {
    let host = build_host(vm100(None), &[("100.fw", "[in]\nHTTP(ACCEPT) - - - - - -\n")]);
    let ruleset = host.fw.compile()?;

    let tap_in = ruleset.rules("tap100i0-IN").unwrap();
    assert!(
        tap_in.iter().any(|r| r == "-A tap100i0-IN -p tcp --dport 80 -j ACCEPT"),
        "tap100i0-IN was: {tap_in:?}"
    );
    Ok(())
}

#[test]
fn group_mark_protocol_spans_group_and_tap_chains() -> anyhow::Result<()> {
    let host = build_host(
        vm100(None),
        &[
            ("100.fw", "[in]\nGROUP-web - - - - - -\n[out]\nGROUP-web - - - - - -\n"),
            ("groups.fw", "[in:web]\nACCEPT - - tcp 80 -\n[out:web]\nACCEPT - - tcp 80 -\n"),
        ],
    );
    let ruleset = host.fw.compile()?;

    let group_out = ruleset.rules("GROUP-web-OUT").unwrap();
    assert_eq!(group_out[0], "-A GROUP-web-OUT -j MARK --set-mark 0");
    assert!(
        group_out
            .iter()
            .any(|r| r == "-A GROUP-web-OUT -p tcp --dport 80 -g PVEFW-SET-ACCEPT-MARK")
    );

    let tap_out = ruleset.rules("tap100i0-OUT").unwrap();
    let jump = tap_out
        .iter()
        .position(|r| r == "-A tap100i0-OUT -j GROUP-web-OUT")
        .expect("group jump in tap OUT chain");
    assert_eq!(tap_out[jump + 1], "-A tap100i0-OUT -m mark --mark 1 -j RETURN");
    Ok(())
}

#[test]
fn reject_policy_logs_then_rejects() -> anyhow::Result<()> {
    let host = build_host(vm100(None), &[("100.fw", "[options]\npolicy-in: REJECT\n")]);
    let ruleset = host.fw.compile()?;

    let tap_in = ruleset.rules("tap100i0-IN").unwrap();
    let len = tap_in.len();
    assert_eq!(
        tap_in[len - 2],
        "-A tap100i0-IN -j LOG --log-prefix \"tap100i0-IN-reject: \" --log-level 4"
    );
    assert_eq!(tap_in[len - 1], "-A tap100i0-IN -j REJECT");
    Ok(())
}

#[test]
fn multiport_lists_use_the_multiport_matcher() -> anyhow::Result<()> {
    let host = build_host(
        vm100(None),
        &[("100.fw", "[in]\nACCEPT - - - tcp 80,443,8080:8090 -\n")],
    );
    let ruleset = host.fw.compile()?;

    let tap_in = ruleset.rules("tap100i0-IN").unwrap();
    assert!(
        tap_in
            .iter()
            .any(|r| r == "-A tap100i0-IN -p tcp --match multiport --dport 80,443,8080:8090 -j ACCEPT")
    );
    Ok(())
}

#[test]
fn vm_without_rule_file_gets_no_tap_chains() -> anyhow::Result<()> {
    let host = build_host(vm100(Some("aa:bb:cc:dd:ee:01")), &[]);
    let ruleset = host.fw.compile()?;

    assert!(ruleset.has_chain("vmbr0-FW"));
    assert!(!ruleset.has_chain("tap100i0-IN"));
    assert!(!ruleset.has_chain("tap100i0-OUT"));
    Ok(())
}

#[test]
fn host_rules_build_the_host_chains() -> anyhow::Result<()> {
    let host = build_host(
        BTreeMap::new(),
        &[("host.fw", "[in]\nACCEPT - - - tcp ssh -\n[out]\n")],
    );
    let ruleset = host.fw.compile()?;

    let host_in = ruleset.rules("PVEFW-HOST-IN").unwrap();
    assert!(host_in.iter().any(|r| r == "-A PVEFW-HOST-IN -p tcp --dport ssh -j ACCEPT"));
    assert_eq!(host_in.last().map(String::as_str), Some("-A PVEFW-HOST-IN -j DROP"));

    let input = ruleset.rules("PVEFW-INPUT").unwrap();
    assert_eq!(input.first().map(String::as_str), Some("-A PVEFW-INPUT -i lo -j ACCEPT"));
    assert_eq!(
        input.last().map(String::as_str),
        Some("-A PVEFW-INPUT -j PVEFW-HOST-IN")
    );
    Ok(())
}

#[test]
fn chain_names_stay_within_the_kernel_limit() -> anyhow::Result<()> {
    let host = build_host(
        vm100(None),
        &[
            ("100.fw", "[in]\nGROUP-longgroupname18 - - - - - -\n"),
            ("groups.fw", "[in:longgroupname18]\nACCEPT - - tcp 80 -\n"),
        ],
    );
    let ruleset = host.fw.compile()?;
    for chain in ruleset.chain_names() {
        assert!(chain.len() <= 28, "chain {chain} exceeds the name limit");
    }
    assert!(ruleset.has_chain("GROUP-longgroupname18-IN"));
    Ok(())
}

#[test]
fn compile_twice_yields_identical_rulesets() -> anyhow::Result<()> {
    let host = build_host(
        vm100(Some("de:ad:be:ef:00:01")),
        &[
            ("100.fw", "[in]\nSSH(ACCEPT) - - - - - -\nGROUP-web - - - - - -\n"),
            ("groups.fw", "[in:web]\nACCEPT - - tcp http,https -\n"),
        ],
    );
    assert_eq!(host.fw.compile()?, host.fw.compile()?);
    Ok(())
}
