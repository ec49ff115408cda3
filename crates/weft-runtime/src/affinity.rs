//! Affinity policies: from a textual spec to one PU mask per worker
//!
//! Accepted specs:
//!
//! | spec            | placement                                                   |
//! |-----------------|-------------------------------------------------------------|
//! | `compact`       | fill each core's PUs before moving to the next core         |
//! | `scatter`       | round robin over NUMA nodes, then cores, then PUs           |
//! | `balanced`      | same number of workers on every core, numbered core by core |
//! | `numa-balanced` | share per node proportional to its PUs, balanced inside     |
//! | `none`          | every worker may run anywhere                               |
//! | `pu:<list>`     | worker *i* on the *i*-th listed OS PU                       |
//! | `core:<list>`   | worker *i* on all PUs of the *i*-th listed core             |
//!
//! `<list>` is comma separated indices and `a-b` ranges.

use std::fmt;
use std::str::FromStr;

use weft_core::error::{RuntimeError, RuntimeResult};
use weft_core::{kdebug, Mask};

use crate::topology::{expand_index_list, get_topology, Topology};

/// Placement policy produced by [`parse_mappings`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mapping {
    Compact,
    Scatter,
    Balanced,
    NumaBalanced,
}

impl Mapping {
    pub const fn as_str(self) -> &'static str {
        match self {
            Mapping::Compact => "compact",
            Mapping::Scatter => "scatter",
            Mapping::Balanced => "balanced",
            Mapping::NumaBalanced => "numa-balanced",
        }
    }
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mapping {
    type Err = RuntimeError;

    fn from_str(s: &str) -> RuntimeResult<Mapping> {
        parse_mappings(s)
    }
}

/// Recognize one of the four policy tokens
pub fn parse_mappings(spec: &str) -> RuntimeResult<Mapping> {
    match spec.trim() {
        "compact" => Ok(Mapping::Compact),
        "scatter" => Ok(Mapping::Scatter),
        "balanced" => Ok(Mapping::Balanced),
        "numa-balanced" => Ok(Mapping::NumaBalanced),
        other => Err(RuntimeError::invalid_argument(format!(
            "unknown affinity mapping {:?} (expected compact, scatter, balanced or numa-balanced)",
            other
        ))),
    }
}

/// Any accepted affinity spec
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AffinitySpec {
    None,
    Policy(Mapping),
    Pus(Vec<usize>),
    Cores(Vec<usize>),
}

impl AffinitySpec {
    pub fn parse(spec: &str) -> RuntimeResult<AffinitySpec> {
        let spec = spec.trim();
        // Worker i takes the i-th listed entry
        let list = |body: &str| -> RuntimeResult<Vec<usize>> {
            let indices = expand_index_list(body).ok_or_else(|| {
                RuntimeError::invalid_argument(format!("malformed affinity list {:?}", spec))
            })?;
            let repeated = indices.iter().enumerate().find(|(i, x)| indices[..*i].contains(*x)).map(|(_, x)| *x);
            if let Some(index) = repeated {
                return Err(RuntimeError::invalid_argument(format!("{} listed twice in affinity {:?}", index, spec)));
            }
            Ok(indices)
        };
        if spec == "none" {
            Ok(AffinitySpec::None)
        } else if let Some(body) = spec.strip_prefix("pu:") {
            Ok(AffinitySpec::Pus(list(body)?))
        } else if let Some(body) = spec.strip_prefix("core:") {
            Ok(AffinitySpec::Cores(list(body)?))
        } else {
            parse_mappings(spec).map(AffinitySpec::Policy)
        }
    }

    pub fn mapping(&self) -> Option<Mapping> {
        match self {
            AffinitySpec::Policy(m) => Some(*m),
            _ => None,
        }
    }
}

/// Masks for `num_threads` workers on the shared topology
///
/// See [`compute_affinity`].
pub fn parse_affinity_options(
    spec: &str,
    used_cores: usize,
    max_cores: Option<usize>,
    num_threads: usize,
    use_process_mask: bool,
) -> RuntimeResult<Vec<Mask>> {
    let topo = get_topology();
    compute_affinity(&topo, spec, used_cores, max_cores, num_threads, use_process_mask)
}

/// Masks for `num_threads` workers, exactly one per worker
///
/// Policies consider cores `used_cores .. used_cores + max_cores`. With
/// `use_process_mask` the window is the whole machine, only PUs of the
/// inherited process mask are eligible, and every resulting mask is
/// intersected with that mask; an empty intersection is an error.
pub fn compute_affinity(
    topo: &Topology,
    spec: &str,
    used_cores: usize,
    max_cores: Option<usize>,
    num_threads: usize,
    use_process_mask: bool,
) -> RuntimeResult<Vec<Mask>> {
    if num_threads == 0 {
        return Err(RuntimeError::invalid_argument("number of threads must be > 0"));
    }
    let parsed = AffinitySpec::parse(spec)?;
    let eligible = if use_process_mask { topo.process_mask() } else { topo.machine_mask() };

    let masks = match &parsed {
        AffinitySpec::None => vec![eligible; num_threads],
        AffinitySpec::Policy(mapping) => {
            let window = CoreWindow::new(topo, used_cores, max_cores, use_process_mask)?;
            let pus = match mapping {
                Mapping::Compact => window.compact(num_threads)?,
                Mapping::Scatter => window.scatter(num_threads)?,
                Mapping::Balanced => window.balanced(num_threads)?,
                Mapping::NumaBalanced => window.numa_balanced(num_threads)?,
            };
            pus.into_iter().map(Mask::single).collect()
        }
        AffinitySpec::Pus(pus) => {
            check_list_len("pu", pus.len(), num_threads)?;
            pus.iter()
                .take(num_threads)
                .map(|&pu| {
                    if topo.machine_mask().test(pu) {
                        Ok(Mask::single(pu))
                    } else {
                        Err(RuntimeError::invalid_argument(format!("PU {} does not exist", pu)))
                    }
                })
                .collect::<RuntimeResult<Vec<_>>>()?
        }
        AffinitySpec::Cores(cores) => {
            check_list_len("core", cores.len(), num_threads)?;
            cores
                .iter()
                .take(num_threads)
                .map(|&core| {
                    topo.core(core).map(|c| c.mask).ok_or_else(|| {
                        RuntimeError::invalid_argument(format!("core {} does not exist", core))
                    })
                })
                .collect::<RuntimeResult<Vec<_>>>()?
        }
    };

    if use_process_mask {
        let process = topo.process_mask();
        return masks
            .into_iter()
            .enumerate()
            .map(|(thread, m)| {
                let m = m & process;
                if m.is_empty() {
                    Err(RuntimeError::EmptyAffinityMask { thread })
                } else {
                    Ok(m)
                }
            })
            .collect();
    }
    Ok(masks)
}

fn check_list_len(kind: &str, listed: usize, num_threads: usize) -> RuntimeResult<()> {
    if listed < num_threads {
        return Err(RuntimeError::invalid_argument(format!(
            "{} list names {} entries for {} threads",
            kind, listed, num_threads
        )));
    }
    Ok(())
}

/// Cores a policy may place on, each with its eligible PUs
struct CoreWindow<'a> {
    topo: &'a Topology,
    /// (logical core, eligible PUs) in core order
    cores: Vec<(usize, Vec<usize>)>,
}

impl<'a> CoreWindow<'a> {
    fn new(
        topo: &'a Topology,
        used_cores: usize,
        max_cores: Option<usize>,
        use_process_mask: bool,
    ) -> RuntimeResult<Self> {
        let (first, count) = if use_process_mask {
            (0, topo.num_cores())
        } else {
            if used_cores >= topo.num_cores() {
                return Err(RuntimeError::invalid_argument(format!(
                    "used_cores={} leaves none of the {} cores",
                    used_cores,
                    topo.num_cores()
                )));
            }
            let remaining = topo.num_cores() - used_cores;
            (used_cores, max_cores.unwrap_or(remaining).min(remaining))
        };

        let process = topo.process_mask();
        let cores = topo.cores()[first..first + count]
            .iter()
            .map(|c| {
                let pus = c
                    .pus
                    .iter()
                    .copied()
                    .filter(|&pu| !use_process_mask || process.test(pu))
                    .collect::<Vec<_>>();
                (c.index, pus)
            })
            .filter(|(_, pus)| !pus.is_empty())
            .collect();
        Ok(Self { topo, cores })
    }

    fn available(&self) -> usize {
        self.cores.iter().map(|(_, pus)| pus.len()).sum()
    }

    fn ensure_capacity(&self, num_threads: usize) -> RuntimeResult<()> {
        let available = self.available();
        if num_threads > available {
            return Err(RuntimeError::invalid_argument(format!(
                "{} threads requested but only {} processing units are available",
                num_threads, available
            )));
        }
        Ok(())
    }

    fn compact(&self, num_threads: usize) -> RuntimeResult<Vec<usize>> {
        self.ensure_capacity(num_threads)?;
        Ok(self
            .cores
            .iter()
            .flat_map(|(_, pus)| pus.iter().copied())
            .take(num_threads)
            .collect())
    }

    fn scatter(&self, num_threads: usize) -> RuntimeResult<Vec<usize>> {
        self.ensure_capacity(num_threads)?;
        // Per node: the window's cores on that node, in core order
        let mut per_node: Vec<Vec<&Vec<usize>>> = vec![Vec::new(); self.topo.num_numa_nodes()];
        for (core, pus) in &self.cores {
            per_node[self.topo.cores()[*core].node].push(pus);
        }
        let max_cores = per_node.iter().map(Vec::len).max().unwrap_or(0);
        let max_pus = self.cores.iter().map(|(_, p)| p.len()).max().unwrap_or(0);

        let mut out = Vec::with_capacity(num_threads);
        'fill: for pu_rank in 0..max_pus {
            for core_rank in 0..max_cores {
                for node in &per_node {
                    if let Some(pu) = node.get(core_rank).and_then(|pus| pus.get(pu_rank)) {
                        out.push(*pu);
                        if out.len() == num_threads {
                            break 'fill;
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    fn balanced(&self, num_threads: usize) -> RuntimeResult<Vec<usize>> {
        self.ensure_capacity(num_threads)?;
        let cores: Vec<&Vec<usize>> = self.cores.iter().map(|(_, pus)| pus).collect();
        Ok(balance_over(&cores, num_threads))
    }

    fn numa_balanced(&self, num_threads: usize) -> RuntimeResult<Vec<usize>> {
        self.ensure_capacity(num_threads)?;
        let mut per_node: Vec<Vec<&Vec<usize>>> = vec![Vec::new(); self.topo.num_numa_nodes()];
        for (core, pus) in &self.cores {
            per_node[self.topo.cores()[*core].node].push(pus);
        }
        let capacity: Vec<usize> = per_node
            .iter()
            .map(|cores| cores.iter().map(|p| p.len()).sum())
            .collect();
        let shares = proportional_shares(&capacity, num_threads);
        kdebug!("numa-balanced shares {:?} over capacities {:?}", shares, capacity);

        Ok(per_node
            .iter()
            .zip(shares)
            .flat_map(|(cores, share)| balance_over(cores, share))
            .collect())
    }
}

/// Spread `n` threads over `cores` one PU per core per pass, then number
/// them core by core
fn balance_over(cores: &[&Vec<usize>], n: usize) -> Vec<usize> {
    let mut per_core = vec![0usize; cores.len()];
    let mut placed = 0;
    let mut pass = 0;
    while placed < n {
        let before = placed;
        for (i, pus) in cores.iter().enumerate() {
            if placed == n {
                break;
            }
            if pass < pus.len() {
                per_core[i] += 1;
                placed += 1;
            }
        }
        if placed == before {
            break;
        }
        pass += 1;
    }
    cores
        .iter()
        .zip(per_core)
        .flat_map(|(pus, k)| pus[..k].iter().copied())
        .collect()
}

/// Split `n` proportionally to `capacity`, rounding to nearest, never
/// exceeding a node's capacity and always summing to `n` (when it fits)
fn proportional_shares(capacity: &[usize], n: usize) -> Vec<usize> {
    let total: usize = capacity.iter().sum();
    if total == 0 {
        return vec![0; capacity.len()];
    }
    let mut shares: Vec<usize> = capacity
        .iter()
        .map(|&c| ((n * c + total / 2) / total).min(c))
        .collect();

    let mut assigned: usize = shares.iter().sum();
    // Trim from the back, then top up from the front
    for i in (0..shares.len()).rev() {
        while assigned > n && shares[i] > 0 {
            shares[i] -= 1;
            assigned -= 1;
        }
    }
    for i in 0..shares.len() {
        while assigned < n && shares[i] < capacity[i] {
            shares[i] += 1;
            assigned += 1;
        }
    }
    shares
}

/// Masks per worker plus how they were produced
///
/// Built once by the partitioner and then shared read-only with every pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffinityData {
    masks: Vec<Mask>,
    spec: AffinitySpec,
    use_process_mask: bool,
}

impl AffinityData {
    pub fn new(
        topo: &Topology,
        num_threads: usize,
        affinity: &str,
        used_cores: usize,
        max_cores: Option<usize>,
        use_process_mask: bool,
    ) -> RuntimeResult<AffinityData> {
        let spec = AffinitySpec::parse(affinity)?;
        let masks = compute_affinity(topo, affinity, used_cores, max_cores, num_threads, use_process_mask)?;
        Ok(AffinityData { masks, spec, use_process_mask })
    }

    /// Wrap masks computed elsewhere
    pub fn from_masks(masks: Vec<Mask>, spec: AffinitySpec, use_process_mask: bool) -> AffinityData {
        AffinityData { masks, spec, use_process_mask }
    }

    pub fn num_threads(&self) -> usize {
        self.masks.len()
    }

    pub fn masks(&self) -> &[Mask] {
        &self.masks
    }

    /// Mask of global worker `thread` (empty when out of range)
    pub fn mask(&self, thread: usize) -> Mask {
        self.masks.get(thread).copied().unwrap_or_default()
    }

    /// Policy that produced the masks; `None` for explicit lists and "none"
    pub fn mapping(&self) -> Option<Mapping> {
        self.spec.mapping()
    }

    pub fn spec(&self) -> &AffinitySpec {
        &self.spec
    }

    pub fn use_process_mask(&self) -> bool {
        self.use_process_mask
    }

    /// Lowest PU of each worker's mask
    pub fn pu_num(&self, thread: usize) -> Option<usize> {
        self.masks.get(thread).and_then(Mask::first)
    }

    /// Workers whose mask includes `pu`
    pub fn thread_occupancy(&self, pu: usize) -> usize {
        self.masks.iter().filter(|m| m.test(pu)).count()
    }

    /// Union of all worker masks
    pub fn used_pus_mask(&self) -> Mask {
        self.masks.iter().fold(Mask::EMPTY, |acc, m| acc | *m)
    }

}
