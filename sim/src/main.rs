use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use structopt::StructOpt;
use tracing::{error, info, warn};

use fabricsim::{build_fat_tree, read_flow_trace, FatTreeParams, FctWriter, RunSummary};
use fabricsim_proto::{CcMode, Nanos, PfcMode, SimConfig, Simulator};

#[derive(StructOpt)]
#[structopt(name = "fabricsim")]
struct Opt {
    /// Flow trace name; flows are read from <trace-dir>/<flow>.tr
    #[structopt(long = "flow", default_value = "test")]
    flow: String,
    /// Total run time after the start time, in seconds
    #[structopt(long = "time", default_value = "1.0")]
    time: f64,
    /// Simulated time at which the trace begins, in seconds
    #[structopt(long = "startTime", default_value = "2.0")]
    start_time: f64,
    /// Congestion control: 0 = none, 1 = MLX/DCQCN, 2 = HPCC telemetry
    #[structopt(long = "cc", default_value = "0")]
    cc: u32,
    /// Backpressure: 0 = lossy, 1 = PFC, 2 = Bubble
    #[structopt(long = "pfc", default_value = "0")]
    pfc: u32,
    /// Fat-tree radix
    #[structopt(long = "k", default_value = "4")]
    k: u32,
    /// Number of pods
    #[structopt(long = "blocks", default_value = "5")]
    num_block: u32,
    /// Servers per ToR downlink
    #[structopt(long = "ratio", default_value = "4")]
    ratio: u32,
    /// Directory holding flow traces
    #[structopt(long, parse(from_os_str), default_value = "trace")]
    trace_dir: PathBuf,
    /// Directory for FCT logs
    #[structopt(long, parse(from_os_str), default_value = "logs")]
    log_dir: PathBuf,
    /// Print the run summary as JSON
    #[cfg(feature = "json-output")]
    #[structopt(long)]
    json: bool,
}

fn main() {
    let opt = Opt::from_args();

    tracing_subscriber::fmt::init();

    if let Err(e) = run(opt) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(opt: Opt) -> Result<()> {
    let mut cfg = SimConfig::default();
    cfg.cc(CcMode::try_from(opt.cc).context("parsing --cc")?);
    cfg.pfc(PfcMode::try_from(opt.pfc).context("parsing --pfc")?);

    let mut sim = Simulator::new(cfg);
    let tree = build_fat_tree(
        &mut sim,
        &FatTreeParams {
            k: opt.k,
            num_block: opt.num_block,
            ratio: opt.ratio,
            ..FatTreeParams::default()
        },
    );
    info!(
        servers = tree.num_servers,
        tors = tree.tors.len(),
        aggs = tree.aggs.len(),
        cores = tree.cores.len(),
        "built topology"
    );

    let trace_path = opt.trace_dir.join(format!("{}.tr", opt.flow));
    let flows = read_flow_trace(&trace_path)?;
    info!(flows = flows.len(), trace = %trace_path.display(), "scheduled flows");

    fs::create_dir_all(&opt.log_dir).context("creating log directory")?;
    let fct_path = opt
        .log_dir
        .join(format!("{}s_PFC{}_CC{}.fct", opt.flow, opt.pfc, opt.cc));
    let mut writer = FctWriter::create(&fct_path)?;
    sim.set_fct_sink(move |rec| writer.write(rec));

    let admitted = flows.len();
    for flow in flows {
        sim.install_flow(flow);
    }

    // Give stragglers the same five-second grace the trace format
    // assumes before declaring the run over.
    let deadline = ((opt.start_time + opt.time + 5.0) * 1e9) as Nanos;
    let wall = Instant::now();
    sim.run_until(deadline);
    info!(
        simulated_ns = sim.now(),
        wall_s = wall.elapsed().as_secs_f64(),
        "simulation finished"
    );

    let summary = RunSummary::collect(&sim);
    summary.log();
    if summary.completed_flows != admitted {
        warn!(
            admitted,
            completed = summary.completed_flows,
            "not every flow completed before the deadline"
        );
    }
    for problem in sim.check_quiesced() {
        warn!(%problem, "quiesce violation");
    }

    #[cfg(feature = "json-output")]
    if opt.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    Ok(())
}
