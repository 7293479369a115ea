// SPDX-License-Identifier: Apache-2.0
//! CLI integration: exit codes and headline output per scenario.

use assert_cmd::Command;
use predicates::prelude::*;

fn cli() -> Command {
    Command::cargo_bin("dominium-cli").expect("binary builds")
}

#[test]
fn collapse_expand_roundtrips_each_kind() {
    for kind in ["resources", "network", "agents"] {
        cli()
            .args(["scale", "collapse-expand", kind])
            .assert()
            .success()
            .stdout(predicate::str::contains("roundtrip: OK"));
    }
}

#[test]
fn unknown_kind_is_a_setup_error() {
    cli()
        .args(["scale", "collapse-expand", "weather"])
        .assert()
        .code(2);
}

#[test]
fn inspect_emits_json_summary() {
    cli()
        .args(["scale", "inspect", "agents"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"statistic_count\": 2"))
        .stdout(predicate::str::contains("rng.state.noise.stream.scale.agents.reconstruct"));
}

#[test]
fn diff_detects_perturbation() {
    cli()
        .args(["scale", "diff", "resources"])
        .assert()
        .success()
        .stdout(predicate::str::contains("identity same"));
}

#[test]
fn refusal_cases_pass() {
    cli()
        .args(["scale", "refusal", "all"])
        .assert()
        .success()
        .stdout(predicate::str::contains("case commit: OK"))
        .stdout(predicate::str::contains("case budget: OK"));
}

#[test]
fn macro_compare_is_neutral_with_workers() {
    cli()
        .args([
            "scale",
            "macro-compare",
            "--ticks",
            "4096",
            "--interval",
            "128",
            "--workers",
            "8",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("macro-compare: OK"));
}

#[test]
fn macro_replay_agrees() {
    cli()
        .args(["scale", "macro-replay", "--ticks", "4096", "--interval", "128"])
        .assert()
        .success()
        .stdout(predicate::str::contains("macro-replay: OK"));
}

#[test]
fn constcost_holds_for_doubled_domains() {
    cli()
        .args(["scale", "constcost", "64", "--ticks", "64"])
        .assert()
        .success()
        .stdout(predicate::str::contains("constcost: OK"));
}

#[test]
fn mmo_two_node_hashes_agree() {
    cli()
        .args(["mmo", "two-node", "--workers", "4"])
        .assert()
        .success()
        .stdout(predicate::str::contains("two-node: OK"));
}

#[test]
fn mmo_abuse_and_legacy() {
    cli()
        .args(["mmo", "abuse"])
        .assert()
        .success()
        .stdout(predicate::str::contains("abuse: OK"));
    cli()
        .args(["mmo", "legacy"])
        .assert()
        .success()
        .stdout(predicate::str::contains("legacy: OK"));
}
