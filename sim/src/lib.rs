//! Driver pieces around the simulator core: the K-ary fat-tree
//! builder, flow-trace parsing, FCT log writing and run summaries. The
//! binary in `main.rs` glues these to a CLI.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use hdrhistogram::Histogram;
use tracing::info;

use fabricsim_proto::{FctRecord, FlowInfo, Nanos, Rate, Simulator, SwitchId};

/// Geometry of a K-ary fat-tree with `num_block` pods and `ratio`
/// servers per ToR downlink.
#[derive(Copy, Clone, Debug)]
pub struct FatTreeParams {
    pub k: u32,
    pub num_block: u32,
    pub ratio: u32,
    pub host_rate: Rate,
    pub fabric_rate: Rate,
    pub link_delay: Nanos,
}

impl Default for FatTreeParams {
    fn default() -> Self {
        FatTreeParams {
            k: 4,
            num_block: 5,
            ratio: 4,
            host_rate: Rate::from_gbps(100),
            fabric_rate: Rate::from_gbps(400),
            link_delay: 1_000,
        }
    }
}

/// Handles to the switches of a built fat-tree.
pub struct FatTree {
    pub num_servers: u32,
    pub tors: Vec<SwitchId>,
    pub aggs: Vec<SwitchId>,
    pub cores: Vec<SwitchId>,
}

/// Build servers, the three switch tiers, links and routing tables.
///
/// Port numbering per switch follows attach order: a ToR has its
/// `k * ratio` server ports first, then `k` aggregation uplinks; an
/// aggregation switch has `k` ToR downlinks then `k` core uplinks; a
/// core switch has one port per pod, in pod order. Routes express
/// next hops as these port positions, ECMP spreading over all uplinks
/// for traffic that must go up a tier.
pub fn build_fat_tree(sim: &mut Simulator, p: &FatTreeParams) -> FatTree {
    let num_servers = p.k * p.k * p.num_block * p.ratio;
    let per_rack = p.k * p.ratio;
    let num_tors = p.k * p.num_block;
    let num_aggs = p.k * p.num_block;
    let num_cores = p.k * p.k;

    let nics: Vec<_> = (0..num_servers).map(|s| sim.add_host(s)).collect();
    let tors: Vec<_> = (0..num_tors)
        .map(|i| sim.add_switch(2000 + i, 1))
        .collect();
    let aggs: Vec<_> = (0..num_aggs)
        .map(|i| sim.add_switch(3000 + i, 2))
        .collect();
    let cores: Vec<_> = (0..num_cores)
        .map(|i| sim.add_switch(4000 + i, 3))
        .collect();

    for tor in 0..num_tors {
        for j in 0..per_rack {
            let server = tor * per_rack + j;
            sim.link_host(
                nics[server as usize],
                tors[tor as usize],
                p.host_rate,
                p.link_delay,
            );
        }
    }

    for block in 0..p.num_block {
        for j in 0..p.k {
            for k in 0..p.k {
                let tor = block * p.k + j;
                let agg = block * p.k + k;
                sim.link_switches(
                    tors[tor as usize],
                    aggs[agg as usize],
                    p.fabric_rate,
                    p.link_delay,
                );
            }
        }
    }

    for block in 0..p.num_block {
        for j in 0..p.k {
            for k in 0..p.k {
                let agg = block * p.k + j;
                let core = j * p.k + k;
                sim.link_switches(
                    aggs[agg as usize],
                    cores[core as usize],
                    p.fabric_rate,
                    p.link_delay,
                );
            }
        }
    }

    let tree = FatTree {
        num_servers,
        tors,
        aggs,
        cores,
    };
    install_routes(sim, p, &tree);
    tree
}

fn install_routes(sim: &mut Simulator, p: &FatTreeParams, t: &FatTree) {
    let per_rack = p.k * p.ratio;
    let per_block = p.k * p.k * p.ratio;

    for &core in &t.cores {
        for server in 0..t.num_servers {
            let block = server / per_block;
            sim.add_route(core, server, block);
        }
    }

    for (agg_idx, &agg) in t.aggs.iter().enumerate() {
        for server in 0..t.num_servers {
            let block = server / per_block;
            if block != agg_idx as u32 / p.k {
                for up in 0..p.k {
                    sim.add_route(agg, server, p.k + up);
                }
            } else {
                sim.add_route(agg, server, (server / per_rack) % p.k);
            }
        }
    }

    for (tor_idx, &tor) in t.tors.iter().enumerate() {
        for server in 0..t.num_servers {
            let rack = server / per_rack;
            if rack != tor_idx as u32 {
                for up in 0..p.k {
                    sim.add_route(tor, server, per_rack + up);
                }
            } else {
                sim.add_route(tor, server, server % per_rack);
            }
        }
    }
}

/// Parse a flow trace: one `src dst size startTimeNs` line per flow,
/// whitespace separated. Flow ids are assigned from 1 in file order.
pub fn read_flow_trace(path: &Path) -> Result<Vec<FlowInfo>> {
    let file = File::open(path).with_context(|| format!("opening trace {}", path.display()))?;
    let mut flows = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line.context("reading trace")?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let mut next = |name: &str| -> Result<u64> {
            fields
                .next()
                .with_context(|| format!("trace line {}: missing {name}", lineno + 1))?
                .parse::<u64>()
                .with_context(|| format!("trace line {}: bad {name}", lineno + 1))
        };
        let src = next("src")? as u32;
        let dst = next("dst")? as u32;
        let size = next("size")? as u32;
        let start_time = next("startTime")? as Nanos;
        if src == dst {
            bail!("trace line {}: src == dst", lineno + 1);
        }
        flows.push(FlowInfo {
            id: flows.len() as u32 + 1,
            src,
            dst,
            size,
            start_time,
            end_time: 0,
        });
    }
    Ok(flows)
}

/// Streams completed-flow records to a CSV log, one line per flow,
/// flushed as they arrive so a killed run still has its data.
pub struct FctWriter {
    out: BufWriter<File>,
}

impl FctWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let file =
            File::create(path).with_context(|| format!("creating FCT log {}", path.display()))?;
        Ok(FctWriter {
            out: BufWriter::new(file),
        })
    }

    pub fn write(&mut self, rec: &FctRecord) {
        let _ = writeln!(
            self.out,
            "{},{},{},{},{},{},{}",
            rec.id,
            rec.src,
            rec.dst,
            rec.size,
            rec.start_time,
            rec.end_time,
            rec.duration()
        );
        let _ = self.out.flush();
    }
}

/// Aggregate statistics over one run.
#[cfg_attr(feature = "json-output", derive(serde::Serialize))]
#[derive(Debug)]
pub struct RunSummary {
    pub completed_flows: usize,
    pub drops: u64,
    pub ecn_marks: u64,
    pub pauses_sent: u64,
    pub accounting_violations: u64,
    pub fct_p50_ns: u64,
    pub fct_p90_ns: u64,
    pub fct_p99_ns: u64,
    pub fct_max_ns: u64,
}

impl RunSummary {
    pub fn collect(sim: &Simulator) -> Self {
        let mut hist = Histogram::<u64>::new(3).expect("histogram");
        for rec in sim.completed_flows() {
            hist.record(rec.duration().max(0) as u64).expect("record");
        }
        RunSummary {
            completed_flows: sim.completed_flows().len(),
            drops: sim.total_drops(),
            ecn_marks: sim.total_ecn_marks(),
            pauses_sent: sim.total_pauses_sent(),
            accounting_violations: sim.total_violations(),
            fct_p50_ns: hist.value_at_quantile(0.50),
            fct_p90_ns: hist.value_at_quantile(0.90),
            fct_p99_ns: hist.value_at_quantile(0.99),
            fct_max_ns: hist.max(),
        }
    }

    pub fn log(&self) {
        info!(
            flows = self.completed_flows,
            drops = self.drops,
            ecn = self.ecn_marks,
            pauses = self.pauses_sent,
            p50 = self.fct_p50_ns,
            p99 = self.fct_p99_ns,
            max = self.fct_max_ns,
            "run summary"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn trace_parses_and_numbers_flows() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0 15 1000000 2000000000").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "1 15 100000 2000000000").unwrap();
        let flows = read_flow_trace(file.path()).unwrap();
        assert_eq!(flows.len(), 2);
        assert_eq!(flows[0].id, 1);
        assert_eq!(flows[1].id, 2);
        assert_eq!(flows[0].size, 1_000_000);
        assert_eq!(flows[1].src, 1);
    }

    #[test]
    fn trace_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0 15 garbage 2000000000").unwrap();
        assert!(read_flow_trace(file.path()).is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "3 3 1000 0").unwrap();
        assert!(read_flow_trace(file.path()).is_err());
    }

    #[test]
    fn fct_writer_emits_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.fct");
        let mut w = FctWriter::create(&path).unwrap();
        w.write(&FctRecord {
            id: 1,
            src: 0,
            dst: 15,
            size: 1000,
            start_time: 100,
            end_time: 350,
        });
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "1,0,15,1000,100,350,250\n");
    }
}
