// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
// SPDX-License-Identifier: MPL-2.0

#[macro_use]
extern crate log;

use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use structopt::StructOpt;

use gradebox::{CorePolicy, ExecutionCore, Sandbox, SandboxImplementation, SubmissionRequest};

/// Command line arguments of the program
#[derive(Debug, Clone, StructOpt)]
#[structopt(
    name = "gradebox",
    about = "Run learner submissions in disposable sandboxes",
    setting = structopt::clap::AppSettings::ColoredHelp)
]
struct Args {
    /// Policy file (JSON). The built-in policy is used when missing
    #[structopt(long, short)]
    config: Option<PathBuf>,

    /// Submission file (JSON): one request or an array of requests. Read
    /// from stdin when missing
    #[structopt(long, short)]
    request: Option<PathBuf>,

    /// Pretty-print the output
    #[structopt(long, short)]
    pretty: bool,

    /// Print the built-in policy and exit
    #[structopt(long)]
    print_default_config: bool,

    /// Start even if the platform has no secure sandbox. Executions still fail
    #[structopt(long)]
    allow_insecure: bool,
}

/// Either a single submission or a batch, run concurrently
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum Submissions {
    One(SubmissionRequest),
    Many(Vec<SubmissionRequest>),
}

fn print_json<T: Serialize>(value: &T, pretty: bool) -> anyhow::Result<()> {
    let json = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{}", json);
    Ok(())
}

fn read_submissions(path: Option<&PathBuf>) -> anyhow::Result<Submissions> {
    let content = match path {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("Cannot read {}", path.display()))?,
        None => {
            let mut content = String::new();
            io::stdin()
                .read_to_string(&mut content)
                .context("Cannot read the request from stdin")?;
            content
        }
    };
    serde_json::from_str(&content).context("Invalid submission")
}

fn run(args: Args) -> anyhow::Result<()> {
    if args.print_default_config {
        return print_json(&CorePolicy::default(), true);
    }

    if !SandboxImplementation::is_secure() && !args.allow_insecure {
        eprintln!("Your platform doesn't support a secure sandbox!");
        eprintln!("Run with --allow-insecure to start anyway: every execution will be refused");
        process::exit(2);
    }

    let policy = match &args.config {
        Some(path) => CorePolicy::from_file(path)?,
        None => CorePolicy::default(),
    };
    let submissions = read_submissions(args.request.as_ref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Cannot start the runtime")?;

    runtime.block_on(async {
        let core = Arc::new(ExecutionCore::start(policy)?);
        match submissions {
            Submissions::One(request) => {
                let response = core.submit(request).await;
                print_json(&response, args.pretty)
            }
            Submissions::Many(requests) => {
                let handles: Vec<_> = requests
                    .into_iter()
                    .map(|request| {
                        let core = core.clone();
                        tokio::spawn(async move { core.submit(request).await })
                    })
                    .collect();
                let mut responses = Vec::with_capacity(handles.len());
                for handle in handles {
                    responses.push(handle.await?);
                }
                print_json(&responses, args.pretty)
            }
        }
    })
}

fn main() {
    env_logger::init();

    let args = Args::from_args();
    trace!("Arguments: {:?}", args);

    if let Err(e) = run(args) {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}
