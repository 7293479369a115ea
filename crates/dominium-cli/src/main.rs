// SPDX-License-Identifier: Apache-2.0
//! Dominium scenario CLI.
//!
//! Drives the scale engine and the shard runtime through the scenario
//! suite: collapse/expand roundtrips, refusal and budget probes, long
//! macro timelines with replay and compaction comparison, and the
//! multi-shard determinism scenarios.
//!
//! Exit codes: 0 on success, 1 on a determinism or invariant failure,
//! 2 on a setup error.
#![allow(clippy::print_stdout)]

mod fixtures;
mod mmo;
mod scale;

use std::process::ExitCode;

use clap::{Parser, Subcommand};

/// Top-level arguments.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Scenario family to run.
    #[clap(subcommand)]
    cmd: Command,
}

/// Scenario families.
#[derive(Subcommand, Debug)]
enum Command {
    /// Scale-engine scenarios (collapse/expand, macro timelines, budgets).
    #[clap(subcommand)]
    Scale(scale::ScaleCmd),
    /// Multi-shard runtime scenarios (determinism, abuse, legacy clients).
    #[clap(subcommand)]
    Mmo(mmo::MmoCmd),
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();
    let outcome = match args.cmd {
        Command::Scale(cmd) => scale::run(&cmd),
        Command::Mmo(cmd) => mmo::run(&cmd),
    };
    match outcome {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            tracing::error!("setup error: {err:#}");
            ExitCode::from(2)
        }
    }
}
