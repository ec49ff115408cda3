//! Hardware topology: NUMA nodes -> cores -> processing units
//!
//! One process-wide [`Topology`] is built on first access by probing the
//! platform and stays read-only until [`release_topology`] drops it at
//! runtime shutdown. Tests and demos can [`install_topology`] a synthetic
//! layout built with [`Topology::uniform`] instead.
//!
//! PU numbers are operating system processor numbers. Cores and NUMA nodes
//! get dense logical indices: nodes in ascending OS order, cores ordered by
//! node and then by their lowest PU.

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod linux;
        use linux as platform;
    } else {
        mod fallback;
        use fallback as platform;
    }
}

use std::fmt;
use std::sync::Arc;

use weft_core::error::{RuntimeResult, WorkerError};
use weft_core::{kdebug, kerror, kwarn, Mask, SpinLock, MAX_PUS};

/// A physical core and the PUs (hardware threads) it carries
#[derive(Debug, Clone)]
pub struct Core {
    pub index: usize,
    /// Logical NUMA node index
    pub node: usize,
    /// OS PU numbers, ascending
    pub pus: Vec<usize>,
    pub mask: Mask,
}

#[derive(Debug, Clone)]
pub struct NumaNode {
    pub index: usize,
    /// Node number as reported by the OS
    pub os_index: usize,
    /// Logical core indices, ascending
    pub cores: Vec<usize>,
    pub mask: Mask,
}

/// One probed processing unit
#[derive(Debug, Clone, Copy)]
pub struct PuEntry {
    pub pu: usize,
    /// OS NUMA node number
    pub node: usize,
    /// Anything that is equal for sibling hyperthreads of one core
    pub core_key: (usize, usize),
}

#[derive(Debug, Clone)]
pub struct Topology {
    nodes: Vec<NumaNode>,
    cores: Vec<Core>,
    /// Indexed by OS PU number
    pu_core: Vec<Option<usize>>,
    machine_mask: Mask,
    process_mask: Mask,
}

impl Topology {
    /// Build from a flat PU listing
    ///
    /// PUs beyond [`MAX_PUS`] are dropped with a warning. `process_mask`
    /// defaults to every listed PU.
    pub fn from_entries(entries: &[PuEntry], process_mask: Option<Mask>) -> Topology {
        let mut entries: Vec<PuEntry> = entries
            .iter()
            .copied()
            .filter(|e| {
                if e.pu >= MAX_PUS {
                    kwarn!("PU {} beyond MAX_PUS={}, ignored", e.pu, MAX_PUS);
                    false
                } else {
                    true
                }
            })
            .collect();
        entries.sort_by_key(|e| e.pu);
        entries.dedup_by_key(|e| e.pu);

        let mut os_nodes: Vec<usize> = entries.iter().map(|e| e.node).collect();
        os_nodes.sort_unstable();
        os_nodes.dedup();

        // Group sibling PUs into cores, keyed by (node, core_key)
        let mut groups: Vec<(usize, (usize, usize), Vec<usize>)> = Vec::new();
        for e in &entries {
            let node = os_nodes.binary_search(&e.node).unwrap_or(0);
            match groups.iter_mut().find(|(n, k, _)| *n == node && *k == e.core_key) {
                Some((_, _, pus)) => pus.push(e.pu),
                None => groups.push((node, e.core_key, vec![e.pu])),
            }
        }
        groups.sort_by_key(|(node, _, pus)| (*node, pus[0]));

        let mut nodes: Vec<NumaNode> = os_nodes
            .iter()
            .enumerate()
            .map(|(index, &os_index)| NumaNode { index, os_index, cores: Vec::new(), mask: Mask::EMPTY })
            .collect();
        let max_pu = entries.last().map(|e| e.pu + 1).unwrap_or(0);
        let mut pu_core = vec![None; max_pu];
        let mut cores = Vec::with_capacity(groups.len());
        let mut machine_mask = Mask::EMPTY;

        for (index, (node, _, pus)) in groups.into_iter().enumerate() {
            let mask = Mask::from_pus(pus.iter().copied());
            for &pu in &pus {
                pu_core[pu] = Some(index);
            }
            nodes[node].cores.push(index);
            nodes[node].mask |= mask;
            machine_mask |= mask;
            cores.push(Core { index, node, pus, mask });
        }

        let process_mask = process_mask.map(|m| m & machine_mask).unwrap_or(machine_mask);
        Topology { nodes, cores, pu_core, machine_mask, process_mask }
    }

    /// Synthetic symmetric machine with consecutive PU numbers:
    /// node 0 holds PUs `0..cores_per_node * pus_per_core`, and so on.
    pub fn uniform(nodes: usize, cores_per_node: usize, pus_per_core: usize) -> Topology {
        let mut entries = Vec::with_capacity(nodes * cores_per_node * pus_per_core);
        let mut pu = 0;
        for node in 0..nodes {
            for core in 0..cores_per_node {
                for _ in 0..pus_per_core {
                    entries.push(PuEntry { pu, node, core_key: (node, core) });
                    pu += 1;
                }
            }
        }
        Topology::from_entries(&entries, None)
    }

    /// Probe the running machine
    pub fn probe() -> RuntimeResult<Topology> {
        let (entries, process_mask) = platform::probe()?;
        let topo = Topology::from_entries(&entries, process_mask);
        if topo.num_pus() == 0 {
            return Err(weft_core::RuntimeError::TopologyProbe("no processing units found".into()));
        }
        Ok(topo)
    }

    /// Same topology with a different inherited process mask
    #[must_use]
    pub fn with_process_mask(mut self, mask: Mask) -> Topology {
        self.process_mask = mask & self.machine_mask;
        self
    }

    pub fn num_numa_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_cores(&self) -> usize {
        self.cores.len()
    }

    pub fn num_pus(&self) -> usize {
        self.machine_mask.count()
    }

    pub fn numa_nodes(&self) -> &[NumaNode] {
        &self.nodes
    }

    pub fn cores(&self) -> &[Core] {
        &self.cores
    }

    pub fn core(&self, core: usize) -> Option<&Core> {
        self.cores.get(core)
    }

    pub fn numa_node(&self, node: usize) -> Option<&NumaNode> {
        self.nodes.get(node)
    }

    pub fn pus_of_core(&self, core: usize) -> &[usize] {
        self.cores.get(core).map(|c| c.pus.as_slice()).unwrap_or(&[])
    }

    pub fn cores_of_node(&self, node: usize) -> &[usize] {
        self.nodes.get(node).map(|n| n.cores.as_slice()).unwrap_or(&[])
    }

    pub fn core_of_pu(&self, pu: usize) -> Option<usize> {
        self.pu_core.get(pu).copied().flatten()
    }

    pub fn numa_node_of_pu(&self, pu: usize) -> Option<usize> {
        self.core_of_pu(pu).map(|c| self.cores[c].node)
    }

    pub fn core_mask(&self, core: usize) -> Mask {
        self.cores.get(core).map(|c| c.mask).unwrap_or_default()
    }

    pub fn numa_node_mask(&self, node: usize) -> Mask {
        self.nodes.get(node).map(|n| n.mask).unwrap_or_default()
    }

    /// Mask of the core enclosing `pu` (empty for unknown PUs)
    pub fn core_affinity_mask(&self, pu: usize) -> Mask {
        self.core_of_pu(pu).map(|c| self.cores[c].mask).unwrap_or_default()
    }

    /// Mask of the NUMA node enclosing `pu` (empty for unknown PUs)
    pub fn numa_node_affinity_mask(&self, pu: usize) -> Mask {
        self.numa_node_of_pu(pu).map(|n| self.nodes[n].mask).unwrap_or_default()
    }

    /// NUMA nodes touched by `mask`
    pub fn numa_nodes_of_mask(&self, mask: &Mask) -> Vec<usize> {
        self.nodes.iter().filter(|n| n.mask.intersects(mask)).map(|n| n.index).collect()
    }

    /// Every PU of the machine
    pub fn machine_mask(&self) -> Mask {
        self.machine_mask
    }

    /// PUs the process was allowed to run on at probe time
    pub fn process_mask(&self) -> Mask {
        self.process_mask
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "machine: {} numa node(s), {} core(s), {} PU(s), process mask {}",
            self.num_numa_nodes(),
            self.num_cores(),
            self.num_pus(),
            self.process_mask
        )?;
        for node in &self.nodes {
            writeln!(f, "  node {} (os {}): PUs {}", node.index, node.os_index, node.mask)?;
            for &c in &node.cores {
                writeln!(f, "    core {}: PUs {}", c, self.cores[c].mask)?;
            }
        }
        Ok(())
    }
}

/// Parse `0-3,8,10-11` style lists into ascending, deduplicated indices
pub fn parse_index_list(s: &str) -> Option<Vec<usize>> {
    let mut out = expand_index_list(s)?;
    out.sort_unstable();
    out.dedup();
    Some(out)
}

/// Expand a `0-3,8,10-11` style list in the order written, repeats kept
pub fn expand_index_list(s: &str) -> Option<Vec<usize>> {
    let mut out = Vec::new();
    for part in s.split(',').map(str::trim) {
        if part.is_empty() {
            continue;
        }
        match part.split_once('-') {
            Some((a, b)) => {
                let (a, b): (usize, usize) = (a.trim().parse().ok()?, b.trim().parse().ok()?);
                if a > b {
                    return None;
                }
                out.extend(a..=b);
            }
            None => out.push(part.parse().ok()?),
        }
    }
    (!out.is_empty()).then_some(out)
}

// ============================================================================
// Process-wide instance
// ============================================================================

static TOPOLOGY: SpinLock<Option<Arc<Topology>>> = SpinLock::new(None);

/// Shared topology, probing the machine on first call
pub fn try_get_topology() -> RuntimeResult<Arc<Topology>> {
    let mut slot = TOPOLOGY.lock();
    if let Some(topo) = slot.as_ref() {
        return Ok(Arc::clone(topo));
    }
    let topo = Arc::new(Topology::probe()?);
    kdebug!(
        "topology: {} node(s), {} core(s), {} PU(s)",
        topo.num_numa_nodes(),
        topo.num_cores(),
        topo.num_pus()
    );
    *slot = Some(Arc::clone(&topo));
    Ok(topo)
}

/// Shared topology; a failed probe is fatal
///
/// # Panics
///
/// Panics when the platform cannot be probed. Use [`try_get_topology`] to
/// handle that case.
pub fn get_topology() -> Arc<Topology> {
    match try_get_topology() {
        Ok(topo) => topo,
        Err(e) => {
            kerror!("{}", e);
            panic!("weft: hardware topology unavailable: {}", e);
        }
    }
}

/// Replace the shared topology (synthetic layouts, tests)
pub fn install_topology(topo: Topology) -> Arc<Topology> {
    let topo = Arc::new(topo);
    *TOPOLOGY.lock() = Some(Arc::clone(&topo));
    topo
}

/// Drop the shared topology; the next access probes again
///
/// Holders of an `Arc` keep their copy alive.
pub fn release_topology() {
    TOPOLOGY.lock().take();
}

/// Pin the calling OS thread to `mask`
pub fn bind_current_thread(mask: &Mask) -> Result<(), WorkerError> {
    if mask.is_empty() {
        return Err(WorkerError::AffinityFailed);
    }
    platform::bind_current_thread(mask)
}

/// OS PU the calling thread runs on right now, when the platform says
pub fn current_pu() -> Option<usize> {
    platform::current_pu()
}
