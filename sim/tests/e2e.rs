//! End-to-end scenarios over the fat-tree, driving the public API the
//! way the CLI does.

use fabricsim::{build_fat_tree, FatTreeParams};
use fabricsim_proto::{CcMode, FlowInfo, Nanos, PfcMode, SimConfig, Simulator};

const START: Nanos = 2_000_000_000;

/// 16 servers: K=4 with one pod and one server per ToR downlink.
fn small_tree() -> FatTreeParams {
    FatTreeParams {
        k: 4,
        num_block: 1,
        ratio: 1,
        ..FatTreeParams::default()
    }
}

fn flow(id: u32, src: u32, dst: u32, size: u32) -> FlowInfo {
    FlowInfo {
        id,
        src,
        dst,
        size,
        start_time: START,
        end_time: 0,
    }
}

#[test]
fn default_fat_tree_geometry() {
    let mut sim = Simulator::new(SimConfig::default());
    let tree = build_fat_tree(&mut sim, &FatTreeParams::default());
    assert_eq!(tree.num_servers, 4 * 4 * 5 * 4);
    assert_eq!(tree.tors.len(), 20);
    assert_eq!(tree.aggs.len(), 20);
    assert_eq!(tree.cores.len(), 16);
    assert!(sim.nic_of(tree.num_servers - 1).is_some());
    assert!(sim.nic_of(tree.num_servers).is_none());
}

/// One uncongested 1MB flow across the tree: the flow completion time
/// is serialization plus per-hop store-and-forward and propagation.
#[test]
fn s1_single_flow_baseline_fct() {
    let mut sim = Simulator::new(SimConfig::default());
    let tree = build_fat_tree(&mut sim, &small_tree());
    assert_eq!(tree.num_servers, 16);

    sim.install_flow(flow(1, 0, 15, 1_000_000));
    sim.run();

    assert_eq!(sim.completed_flows().len(), 1);
    assert_eq!(sim.total_drops(), 0);
    let fct = sim.completed_flows()[0].duration();
    // ~80us of serialization at 100Gbps plus propagation and
    // store-and-forward on the 4-link path, each way
    assert!(
        (87_400..=96_600).contains(&fct),
        "baseline FCT out of envelope: {fct}"
    );
    assert!(sim.check_quiesced().is_empty());
}

/// Two flows collide on one egress port under PFC: lossless, with
/// pause frames observed and near-identical completion times.
#[test]
fn s2_shared_egress_under_pfc_is_lossless() {
    let mut cfg = SimConfig::default();
    cfg.pfc(PfcMode::Pfc);
    // shrink switch buffers so the collision actually fills the
    // shared pool
    cfg.buffer_per_gbps(500).unwrap();
    let mut sim = Simulator::new(cfg);
    build_fat_tree(&mut sim, &small_tree());

    sim.install_flow(flow(1, 0, 15, 300_000));
    sim.install_flow(flow(2, 1, 15, 300_000));
    sim.run();

    assert_eq!(sim.completed_flows().len(), 2);
    assert_eq!(sim.total_drops(), 0, "PFC fabric must not drop");
    assert!(sim.total_pauses_sent() >= 1);
    assert!(sim.check_quiesced().is_empty());

    let d1 = sim.completed_flows()[0].duration() as f64;
    let d2 = sim.completed_flows()[1].duration() as f64;
    assert!(
        (d1 / d2 - 1.0).abs() < 0.1,
        "colliding flows should finish together: {d1} vs {d2}"
    );
}

/// The same collision without PFC drops packets; NACK-driven rewind
/// still completes every flow.
#[test]
fn s3_lossy_overload_recovers_via_nack() {
    let mut cfg = SimConfig::default();
    cfg.buffer_per_gbps(500).unwrap();
    let mut sim = Simulator::new(cfg);
    build_fat_tree(&mut sim, &small_tree());

    sim.install_flow(flow(1, 0, 15, 300_000));
    sim.install_flow(flow(2, 1, 15, 300_000));
    sim.run();

    assert!(sim.total_drops() > 0, "expected drops without PFC");
    assert_eq!(sim.completed_flows().len(), 2);
    assert!(sim.check_quiesced().is_empty());
}

/// HPCC mode: telemetry rides every packet without perturbing
/// delivery; the growing per-hop stack shows up only as a few extra
/// wire bytes. The slight store-and-forward imbalance it creates at
/// the last hop is enough for ECN to mark.
#[test]
fn s4_hpcc_telemetry_flow_completes() {
    let mut cfg = SimConfig::default();
    cfg.cc(CcMode::Hpcc);
    cfg.pfc(PfcMode::Pfc);
    let mut sim = Simulator::new(cfg);
    build_fat_tree(&mut sim, &small_tree());

    sim.install_flow(flow(1, 0, 15, 10_000_000));
    sim.run();

    assert_eq!(sim.completed_flows().len(), 1);
    assert_eq!(sim.total_drops(), 0);
    let fct = sim.completed_flows()[0].duration();
    assert!(
        (800_000..=920_000).contains(&fct),
        "10MB at 100Gbps should take ~840us: {fct}"
    );
    assert!(sim.check_quiesced().is_empty());
}

/// DCQCN reacts to marking: with two flows squeezing one egress the
/// switch marks CE, receivers echo CNPs, and the senders come off
/// line rate yet still finish.
#[test]
fn s5_dcqcn_flows_complete_under_marking() {
    let mut cfg = SimConfig::default();
    cfg.cc(CcMode::Dcqcn);
    cfg.pfc(PfcMode::Pfc);
    cfg.buffer_per_gbps(500).unwrap();
    let mut sim = Simulator::new(cfg);
    build_fat_tree(&mut sim, &small_tree());

    sim.install_flow(flow(1, 0, 15, 300_000));
    sim.install_flow(flow(2, 1, 15, 300_000));
    sim.run();

    assert_eq!(sim.completed_flows().len(), 2);
    assert!(sim.total_ecn_marks() > 0, "collision should trigger marking");
    assert_eq!(sim.total_drops(), 0);
    assert!(sim.check_quiesced().is_empty());
}

/// Bubble mode emits backpressure codes but nothing throttles on
/// them, so the overload behaves like the lossy fabric and still
/// completes.
#[test]
fn s6_bubble_mode_overload_completes() {
    let mut cfg = SimConfig::default();
    cfg.pfc(PfcMode::Bubble);
    cfg.buffer_per_gbps(500).unwrap();
    let mut sim = Simulator::new(cfg);
    build_fat_tree(&mut sim, &small_tree());

    sim.install_flow(flow(1, 0, 15, 100_000));
    sim.install_flow(flow(2, 1, 15, 100_000));
    sim.run();

    assert_eq!(sim.completed_flows().len(), 2);
    assert!(sim.check_quiesced().is_empty());
}
