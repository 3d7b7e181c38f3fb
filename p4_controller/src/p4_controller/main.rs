/*
Copyright (c) 2021 VMware, Inc.
SPDX-License-Identifier: MIT
Permission is hereby granted, free of charge, to any person obtaining a copy
of this software and associated documentation files (the "Software"), to deal
in the Software without restriction, including without limitation the rights
to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
copies of the Software, and to permit persons to whom the Software is
furnished to do so, subject to the following conditions:
The above copyright notice and this permission notice shall be included in all
copies or substantial portions of the Software.
THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
SOFTWARE.
*/

//! Installs the demonstration program on a set of BMv2 switches, writes
//! forwarding, filtering and mirroring rules, and prints what the switches
//! report back.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use futures::StreamExt;
use p4_controller::program::{self, counter_line};
use p4_controller::{Controller, Targets, Topology};
use p4ext::sim::SimNetwork;
use p4ext::{build_mirror_session, Connector, GrpcConnector, MacAddr, PipelineConfig, SchemaRegistry, SessionOptions, UpdateType};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use tracing::{event, Level};

#[derive(Parser, Debug)]
#[clap(version, about)]
struct Args {
    /// P4Info file from p4c, in binary protobuf format
    #[clap(long, default_value = "./build/p4dpi.p4.p4info.bin")]
    p4info: PathBuf,

    /// BMv2 JSON file from p4c
    #[clap(long = "bmv2-json", default_value = "./build/p4dpi.json")]
    bmv2_json: PathBuf,

    /// Switches and rules, as JSON.  Defaults to the three-switch demo.
    #[clap(long)]
    topology: Option<PathBuf>,

    /// Talk to in-process simulated switches instead of BMv2
    #[clap(long)]
    simulate: bool,

    /// Election id to request mastership with
    #[clap(long, default_value = "1")]
    election_id: u64,

    /// Deadline for reaching each switch, in milliseconds
    #[clap(long, default_value = "10000")]
    timeout_ms: u64,

    /// Log at debug level
    #[clap(short, long)]
    verbose: bool,
}

fn check_artifact(path: &Path, what: &str) {
    if !path.exists() {
        let _ = Args::command().print_help();
        eprintln!("\n{} file not found: {}\nHave you run 'make'?", what, path.display());
        exit(1);
    }
}

fn load_pipeline(args: &Args) -> Result<PipelineConfig> {
    if args.simulate && !args.p4info.exists() {
        event!(Level::INFO, "{} not found, simulating the built-in program", args.p4info.display());
        return Ok(PipelineConfig::new(p4ext::testing::demo_p4info_bytes(), b"{}".to_vec()));
    }
    check_artifact(&args.p4info, "p4info");
    check_artifact(&args.bmv2_json, "BMv2 JSON");
    Ok(PipelineConfig::from_files(&args.p4info, &args.bmv2_json)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .init();

    let pipeline = load_pipeline(&args)?;
    let registry = SchemaRegistry::load(&pipeline.p4info).context("loading P4Info")?;
    let topology = match &args.topology {
        Some(path) => Topology::load(path)?,
        None => Topology::demo(),
    };
    topology.validate()?;

    let connector: Arc<dyn Connector> = if args.simulate {
        let network = SimNetwork::new();
        for switch in &topology.switches {
            network.add_switch(&switch.address, switch.device_id);
        }
        Arc::new(network)
    } else {
        Arc::new(GrpcConnector::default())
    };
    let options = SessionOptions {
        election_id: u128::from(args.election_id).into(),
        arbitration_timeout: Duration::from_millis(args.timeout_ms),
        ..Default::default()
    };
    let mut controller = Controller::new(Arc::new(registry), connector, topology.switches.clone(), options)?;

    let outcome = tokio::select! {
        result = run(&mut controller, &topology, &pipeline) => result,
        _ = tokio::signal::ctrl_c() => {
            println!(" Shutting down.");
            Ok(())
        }
    };
    if let Err(report) = controller.shutdown().await {
        event!(Level::WARN, "{}", report);
    }
    outcome
}

async fn run(controller: &mut Controller, topology: &Topology, pipeline: &PipelineConfig) -> Result<()> {
    if let Err(e) = controller.connect_all().await {
        event!(Level::WARN, "{}", e);
    }

    let report = controller.install_program(Targets::All, pipeline).await?;
    let installed: HashSet<String> = report.succeeded().map(String::from).collect();
    for switch in &topology.switches {
        if installed.contains(&switch.name) {
            println!("Installed P4 Program using SetForwardingPipelineConfig on {}", switch.name);
        }
    }

    for rule in topology.forwarding.iter().filter(|r| installed.contains(&r.switch)) {
        let dst_mac: MacAddr = rule.dst_mac.parse()?;
        let entry = program::forwarding_rule(controller.registry(), rule.dst_ip, dst_mac, rule.port)?;
        controller.write(&rule.switch, &entry, UpdateType::Insert).await?;
        event!(Level::INFO, switch = %rule.switch, "installed forwarding rule for {}", rule.dst_ip);
    }

    for rule in topology.filtering.iter().filter(|r| installed.contains(&r.switch)) {
        for entry in program::filtering_rules(controller.registry(), rule.protocol, rule.port)? {
            controller.write(&rule.switch, &entry, UpdateType::Insert).await?;
        }
        event!(Level::INFO, switch = %rule.switch, "installed {} filtering rules for port {}", rule.protocol, rule.port);
    }

    for mirror in topology.mirror_sessions.iter().filter(|m| installed.contains(&m.switch)) {
        let session = build_mirror_session(mirror.session_id, mirror.egress_port, mirror.truncate)?;
        controller
            .write_mirror_session(&mirror.switch, &session, mirror.dry_run)
            .await?;
    }

    for switch in &topology.switches {
        if !controller.is_connected(&switch.name) {
            continue;
        }
        println!("\n----- Reading tables rules for {} -----", switch.name);
        let mut entries = controller.read_table_entries(&switch.name, None).await?;
        while let Some(entry) = entries.next().await {
            println!("{}", controller.describe(&entry?)?);
            println!("-----");
        }
    }

    for query in topology.counters.iter().filter(|q| controller.is_connected(&q.switch)) {
        let mut samples = controller
            .read_counters(&query.switch, &query.counter, query.index)
            .await?;
        while let Some(sample) = samples.next().await {
            println!("{}", counter_line(&query.switch, &query.counter, &sample?));
        }
    }
    Ok(())
}
