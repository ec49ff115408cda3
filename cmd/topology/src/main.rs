//! Print the probed machine topology and the worker masks each placement
//! policy would produce on it.
//!
//! ```text
//! cargo run -p weft-topology -- [num_threads] [affinity]
//! ```
//!
//! Without an affinity argument every policy is shown. `WEFT_USED_CORES`,
//! `WEFT_MAX_CORES` and `WEFT_USE_PROCESS_MASK` apply as they do for the
//! runtime.

use weft::topology::{try_get_topology, Topology};
use weft::RuntimeConfig;
use weft::affinity::compute_affinity;

const POLICIES: &[&str] = &["compact", "scatter", "balanced", "numa-balanced"];

fn show(topo: &Topology, config: &RuntimeConfig, spec: &str) {
    match compute_affinity(
        topo,
        spec,
        config.used_cores,
        config.max_cores,
        config.num_threads,
        config.use_process_mask,
    ) {
        Ok(masks) => {
            println!("{}:", spec);
            for (worker, mask) in masks.iter().enumerate() {
                let cores: Vec<String> = mask
                    .iter()
                    .filter_map(|pu| topo.core_of_pu(pu))
                    .map(|c| c.to_string())
                    .collect();
                println!("  worker {:>3}: PUs {} (cores {})", worker, mask, cores.join(","));
            }
        }
        Err(e) => println!("{}: {}", spec, e),
    }
}

fn main() {
    weft::init_logging();

    let topo = match try_get_topology() {
        Ok(t) => t,
        Err(e) => {
            eprintln!("topology discovery failed: {}", e);
            std::process::exit(1);
        }
    };
    print!("{}", topo);

    let mut args = std::env::args().skip(1);
    let mut config = RuntimeConfig::from_env();
    if let Some(n) = args.next() {
        match n.parse() {
            Ok(n) => config.num_threads = n,
            Err(_) => {
                eprintln!("not a thread count: {}", n);
                std::process::exit(2);
            }
        }
    }
    println!("\n{} worker(s)", config.num_threads);

    match args.next() {
        Some(spec) => show(&topo, &config, &spec),
        None => POLICIES.iter().for_each(|spec| show(&topo, &config, spec)),
    }
}
