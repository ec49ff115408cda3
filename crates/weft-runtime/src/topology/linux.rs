//! Linux topology discovery from sysfs, affinity through sched_*affinity

use std::fs;
use std::path::Path;

use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
use nix::unistd::Pid;

use weft_core::error::{RuntimeError, RuntimeResult, WorkerError};
use weft_core::{kdebug, Mask, MAX_PUS};

use super::{parse_index_list, PuEntry};

const CPU_ROOT: &str = "/sys/devices/system/cpu";
const NODE_ROOT: &str = "/sys/devices/system/node";

fn read_trimmed(path: impl AsRef<Path>) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn read_usize(path: impl AsRef<Path>) -> Option<usize> {
    read_trimmed(path)?.parse().ok()
}

/// OS node number per PU, or empty when the kernel has no NUMA sysfs
fn node_map() -> Vec<(usize, usize)> {
    let Ok(dir) = fs::read_dir(NODE_ROOT) else {
        return Vec::new();
    };
    let mut map = Vec::new();
    for entry in dir.flatten() {
        let name = entry.file_name();
        let Some(node) = name.to_str().and_then(|n| n.strip_prefix("node")).and_then(|n| n.parse().ok()) else {
            continue;
        };
        if let Some(pus) = read_trimmed(entry.path().join("cpulist")).and_then(|l| parse_index_list(&l)) {
            map.extend(pus.into_iter().map(|pu| (pu, node)));
        }
    }
    map
}

pub(super) fn probe() -> RuntimeResult<(Vec<PuEntry>, Option<Mask>)> {
    let online = match read_trimmed(format!("{}/online", CPU_ROOT)).and_then(|l| parse_index_list(&l)) {
        Some(pus) => pus,
        None => {
            kdebug!("topology: {}/online unreadable, assuming a flat machine", CPU_ROOT);
            let n = std::thread::available_parallelism()
                .map_err(|e| RuntimeError::TopologyProbe(e.to_string()))?
                .get();
            (0..n).collect()
        }
    };

    let nodes = node_map();
    let entries = online
        .into_iter()
        .map(|pu| {
            let topo_dir = format!("{}/cpu{}/topology", CPU_ROOT, pu);
            let package = read_usize(format!("{}/physical_package_id", topo_dir)).unwrap_or(0);
            let core_id = read_usize(format!("{}/core_id", topo_dir)).unwrap_or(pu);
            let node = nodes.iter().find(|(p, _)| *p == pu).map(|(_, n)| *n).unwrap_or(0);
            PuEntry { pu, node, core_key: (package, core_id) }
        })
        .collect();

    Ok((entries, process_mask()))
}

/// Affinity mask the process inherited
fn process_mask() -> Option<Mask> {
    let set = sched_getaffinity(Pid::from_raw(0)).ok()?;
    let limit = CpuSet::count().min(MAX_PUS);
    Some((0..limit).filter(|&pu| set.is_set(pu).unwrap_or(false)).collect())
}

pub(super) fn bind_current_thread(mask: &Mask) -> Result<(), WorkerError> {
    let mut set = CpuSet::new();
    for pu in mask {
        set.set(pu).map_err(|_| WorkerError::AffinityFailed)?;
    }
    sched_setaffinity(Pid::from_raw(0), &set).map_err(|_| WorkerError::AffinityFailed)
}

pub(super) fn current_pu() -> Option<usize> {
    // Safety: sched_getcpu has no preconditions
    let cpu = unsafe { libc::sched_getcpu() };
    (cpu >= 0).then_some(cpu as usize)
}
