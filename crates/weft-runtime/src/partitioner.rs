//! Resource partitioner
//!
//! Splits the configured workers over thread pools. Pool 0 is the default
//! pool; it keeps every worker of the configured affinity whose PU no
//! explicit pool claims. An explicit pool gets one worker per PU handed to
//! it with [`add_resource`](ResourcePartitioner::add_resource).
//!
//! ```rust,ignore
//! let mut rp = ResourcePartitioner::new(config, PartitionerMode::DEFAULT)?;
//! rp.create_thread_pool("io", SchedulingPolicy::Local, SchedulerMode::DEFAULT_MODE)?;
//! rp.add_resource(Resource::Core(0), "io", true)?;
//! let pools = rp.configure_pools()?;
//! ```

use std::fmt;
use std::sync::Arc;

use weft_core::constants::MAX_WORKERS;
use weft_core::error::{RuntimeError, RuntimeResult};
use weft_core::{kdebug, kprintln, Mask, PartitionerMode, SchedulerMode};

use crate::affinity::AffinityData;
use crate::config::RuntimeConfig;
use crate::notifier::CallbackNotifier;
use crate::pool::PoolInitParameters;
use crate::scheduler::{SchedulerFactory, SchedulingPolicy};
use crate::topology::{self, Topology};

/// Name of pool 0 unless renamed
pub const DEFAULT_POOL_NAME: &str = "default";

/// Hardware handed to a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// One PU, by OS number
    Pu(usize),
    /// Every PU of a core, by logical index
    Core(usize),
    /// Every PU of a NUMA node, by logical index
    NumaNode(usize),
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Pu(i) => write!(f, "pu {}", i),
            Resource::Core(i) => write!(f, "core {}", i),
            Resource::NumaNode(i) => write!(f, "numa node {}", i),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Claim {
    pu: usize,
    exclusive: bool,
}

struct PoolDescription {
    name: String,
    policy: SchedulingPolicy,
    factory: Option<SchedulerFactory>,
    mode: SchedulerMode,
    claims: Vec<Claim>,
}

pub struct ResourcePartitioner {
    config: RuntimeConfig,
    mode: PartitionerMode,
    topology: Arc<Topology>,
    affinity: AffinityData,
    pools: Vec<PoolDescription>,
    notifier: CallbackNotifier,
    /// Workers handed out so far
    assigned: Option<Arc<AffinityData>>,
    /// Pools whose parameters have been produced
    configured: Vec<usize>,
}

impl ResourcePartitioner {
    /// Partition the shared topology
    pub fn new(config: RuntimeConfig, mode: PartitionerMode) -> RuntimeResult<ResourcePartitioner> {
        Self::with_topology(config, mode, topology::try_get_topology()?)
    }

    pub fn with_topology(
        config: RuntimeConfig,
        mode: PartitionerMode,
        topology: Arc<Topology>,
    ) -> RuntimeResult<ResourcePartitioner> {
        config.validate()?;
        let affinity = AffinityData::new(
            &topology,
            config.num_threads,
            &config.affinity,
            config.used_cores,
            config.max_cores,
            config.use_process_mask,
        )?;
        let default_pool = PoolDescription {
            name: DEFAULT_POOL_NAME.to_owned(),
            policy: config.scheduler,
            factory: None,
            mode: config.scheduler_mode,
            claims: Vec::new(),
        };
        Ok(ResourcePartitioner {
            config,
            mode,
            topology,
            affinity,
            pools: vec![default_pool],
            notifier: CallbackNotifier::new(),
            assigned: None,
            configured: Vec::new(),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn mode(&self) -> PartitionerMode {
        self.mode
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// Masks of the configured workers before pools claim any of them
    pub fn affinity(&self) -> &AffinityData {
        &self.affinity
    }

    /// Callbacks handed to every pool
    pub fn notifier_mut(&mut self) -> &mut CallbackNotifier {
        &mut self.notifier
    }

    pub fn num_pools(&self) -> usize {
        self.pools.len()
    }

    pub fn pool_index(&self, name: &str) -> Option<usize> {
        self.pools.iter().position(|p| p.name == name)
    }

    pub fn pool_name(&self, index: usize) -> Option<&str> {
        self.pools.get(index).map(|p| p.name.as_str())
    }

    pub fn default_pool_name(&self) -> &str {
        &self.pools[0].name
    }

    pub fn set_default_pool_name(&mut self, name: &str) -> RuntimeResult<()> {
        self.check_new_name(name)?;
        self.pools[0].name = name.to_owned();
        Ok(())
    }

    /// Declare a pool run by a built-in scheduler; returns its index
    pub fn create_thread_pool(
        &mut self,
        name: &str,
        policy: SchedulingPolicy,
        mode: SchedulerMode,
    ) -> RuntimeResult<usize> {
        if policy == SchedulingPolicy::UserDefined {
            return Err(RuntimeError::invalid_argument(
                "user-defined pools are created with create_thread_pool_with",
            ));
        }
        self.add_pool(PoolDescription { name: name.to_owned(), policy, factory: None, mode, claims: Vec::new() })
    }

    /// Declare a pool whose scheduler `factory` builds; returns its index
    pub fn create_thread_pool_with(
        &mut self,
        name: &str,
        factory: SchedulerFactory,
        mode: SchedulerMode,
    ) -> RuntimeResult<usize> {
        self.add_pool(PoolDescription {
            name: name.to_owned(),
            policy: SchedulingPolicy::UserDefined,
            factory: Some(factory),
            mode,
            claims: Vec::new(),
        })
    }

    fn add_pool(&mut self, pool: PoolDescription) -> RuntimeResult<usize> {
        self.check_open()?;
        self.check_new_name(&pool.name)?;
        self.pools.push(pool);
        Ok(self.pools.len() - 1)
    }

    fn check_new_name(&self, name: &str) -> RuntimeResult<()> {
        if name.is_empty() {
            return Err(RuntimeError::invalid_argument("pool name must not be empty"));
        }
        if self.pool_index(name).is_some() {
            return Err(RuntimeError::invalid_argument(format!("pool '{}' already exists", name)));
        }
        Ok(())
    }

    /// Pools are fixed once configured unless dynamic pools are allowed
    fn check_open(&self) -> RuntimeResult<()> {
        if self.assigned.is_some() && !self.mode.contains(PartitionerMode::ALLOW_DYNAMIC_POOLS) {
            return Err(RuntimeError::InvalidStatus);
        }
        Ok(())
    }

    /// Hand `resource` to the explicit pool `pool`
    ///
    /// A PU may end up in more than one pool only with
    /// `ALLOW_OVERSUBSCRIPTION` and non-exclusive claims; that is checked by
    /// [`configure_pools`](Self::configure_pools).
    pub fn add_resource(&mut self, resource: Resource, pool: &str, exclusive: bool) -> RuntimeResult<()> {
        self.check_open()?;
        let index = self.pool_index(pool).ok_or(RuntimeError::PoolNotFound)?;
        if index == 0 {
            return Err(RuntimeError::invalid_argument(format!(
                "the default pool '{}' takes the unclaimed workers; resources go to explicit pools",
                pool
            )));
        }
        let pus = self.resource_pus(resource)?;
        let claims = &mut self.pools[index].claims;
        for pu in pus {
            if !claims.iter().any(|c| c.pu == pu) {
                claims.push(Claim { pu, exclusive });
            }
        }
        Ok(())
    }

    fn resource_pus(&self, resource: Resource) -> RuntimeResult<Vec<usize>> {
        let topo = &self.topology;
        let pus = match resource {
            Resource::Pu(pu) if topo.machine_mask().test(pu) => vec![pu],
            Resource::Core(core) if core < topo.num_cores() => topo.pus_of_core(core).to_vec(),
            Resource::NumaNode(node) if node < topo.num_numa_nodes() => {
                topo.numa_node_mask(node).iter().collect()
            }
            _ => return Err(RuntimeError::invalid_argument(format!("no {} on this machine", resource))),
        };
        Ok(pus)
    }

    /// Produce the init parameters of every pool, default pool first
    pub fn configure_pools(&mut self) -> RuntimeResult<Vec<PoolInitParameters>> {
        if self.assigned.is_some() {
            return Err(RuntimeError::AlreadyInitialized);
        }
        let oversubscribe = self.mode.contains(PartitionerMode::ALLOW_OVERSUBSCRIPTION);

        // PU -> claims across explicit pools
        let mut claimed: Vec<(usize, Vec<Claim>)> = Vec::new();
        for (index, pool) in self.pools.iter().enumerate().skip(1) {
            if pool.claims.is_empty() {
                return Err(RuntimeError::invalid_argument(format!("pool '{}' has no resources", pool.name)));
            }
            for claim in &pool.claims {
                match claimed.iter_mut().find(|(pu, _)| *pu == claim.pu) {
                    Some((_, others)) => {
                        if !oversubscribe || claim.exclusive || others.iter().any(|c| c.exclusive) {
                            return Err(RuntimeError::invalid_argument(format!(
                                "pu {} is claimed by more than one pool (pool '{}')",
                                claim.pu, pool.name
                            )));
                        }
                        others.push(*claim);
                    }
                    None => claimed.push((claim.pu, vec![*claim])),
                }
            }
            kdebug!("pool #{} '{}' claims {} pu(s)", index, pool.name, pool.claims.len());
        }
        // PUs the default pool must stay off
        let reserved: Mask = claimed
            .iter()
            .filter(|(_, claims)| !oversubscribe || claims.iter().any(|c| c.exclusive))
            .map(|(pu, _)| *pu)
            .collect();

        // Workers keep the rest of their mask; one left with nothing is dropped
        let mut masks: Vec<Mask> = (0..self.affinity.num_threads())
            .filter_map(|w| {
                let mask = self.affinity.mask(w);
                if reserved.is_empty() {
                    return Some(mask);
                }
                let mask = if mask.is_empty() { self.topology.machine_mask() } else { mask };
                let free = mask & !reserved;
                (!free.is_empty()).then_some(free)
            })
            .collect();
        if masks.is_empty() {
            return Err(RuntimeError::invalid_argument(format!(
                "default pool '{}' has no workers left",
                self.pools[0].name
            )));
        }
        let mut counts = vec![masks.len()];
        for pool in &self.pools[1..] {
            masks.extend(pool.claims.iter().map(|c| Mask::single(c.pu)));
            counts.push(pool.claims.len());
        }
        if masks.len() > MAX_WORKERS {
            return Err(RuntimeError::invalid_argument(format!(
                "{} workers requested, at most {} supported",
                masks.len(),
                MAX_WORKERS
            )));
        }

        let affinity = Arc::new(AffinityData::from_masks(
            masks,
            self.affinity.spec().clone(),
            self.affinity.use_process_mask(),
        ));
        let mut offset = 0;
        let mut params = Vec::with_capacity(self.pools.len());
        for (index, count) in counts.into_iter().enumerate() {
            params.push(self.init_parameters(index, offset, count, &affinity)?);
            offset += count;
        }
        self.assigned = Some(affinity);
        self.configured = (0..self.pools.len()).collect();
        Ok(params)
    }

    /// Parameters of a pool declared after [`configure_pools`](Self::configure_pools)
    ///
    /// Needs `ALLOW_DYNAMIC_POOLS`. The new workers are numbered after every
    /// worker handed out so far.
    pub fn configure_dynamic_pool(&mut self, name: &str) -> RuntimeResult<PoolInitParameters> {
        if !self.mode.contains(PartitionerMode::ALLOW_DYNAMIC_POOLS) {
            return Err(RuntimeError::InvalidStatus);
        }
        let assigned = self.assigned.as_ref().ok_or(RuntimeError::NotInitialized)?;
        let index = self.pool_index(name).ok_or(RuntimeError::PoolNotFound)?;
        if self.configured.contains(&index) {
            return Err(RuntimeError::AlreadyInitialized);
        }
        let pool = &self.pools[index];
        if pool.claims.is_empty() {
            return Err(RuntimeError::invalid_argument(format!("pool '{}' has no resources", name)));
        }
        let oversubscribe = self.mode.contains(PartitionerMode::ALLOW_OVERSUBSCRIPTION);
        let used = assigned.used_pus_mask();
        if let Some(c) = pool.claims.iter().find(|c| used.test(c.pu) && (!oversubscribe || c.exclusive)) {
            return Err(RuntimeError::invalid_argument(format!("pu {} is already in use", c.pu)));
        }

        let offset = assigned.num_threads();
        if offset + pool.claims.len() > MAX_WORKERS {
            return Err(RuntimeError::invalid_argument("too many workers"));
        }
        let masks: Vec<Mask> = assigned
            .masks()
            .iter()
            .copied()
            .chain(pool.claims.iter().map(|c| Mask::single(c.pu)))
            .collect();
        let affinity = Arc::new(AffinityData::from_masks(
            masks,
            assigned.spec().clone(),
            assigned.use_process_mask(),
        ));
        let params = self.init_parameters(index, offset, pool.claims.len(), &affinity)?;
        self.assigned = Some(affinity);
        self.configured.push(index);
        Ok(params)
    }

    fn init_parameters(
        &self,
        index: usize,
        thread_offset: usize,
        num_threads: usize,
        affinity: &Arc<AffinityData>,
    ) -> RuntimeResult<PoolInitParameters> {
        let pool = &self.pools[index];
        let policy = match pool.policy {
            SchedulingPolicy::Unspecified => self.config.scheduler,
            other => other,
        };
        let scheduler = match (&pool.factory, policy.factory()) {
            (Some(factory), _) => Arc::clone(factory),
            (None, Some(factory)) => factory,
            (None, None) => {
                return Err(RuntimeError::invalid_argument(format!(
                    "pool '{}': no scheduler for policy {}",
                    pool.name, policy
                )))
            }
        };
        Ok(PoolInitParameters {
            index,
            name: pool.name.clone(),
            thread_offset,
            num_threads,
            affinity: Arc::clone(affinity),
            notifier: self.notifier.clone(),
            scheduler,
            mode: pool.mode,
            stack_size: self.config.stack_size,
            stack_pool_limit: self.config.stack_pool_limit,
            idle_spins: self.config.idle_spins,
            park_timeout: self.config.park_timeout,
        })
    }

    /// Workers handed out so far, once configured
    pub fn assigned(&self) -> Option<&Arc<AffinityData>> {
        self.assigned.as_ref()
    }

    /// Print the pool layout
    pub fn print(&self) {
        kprintln!("[weft] partitioner mode {}", self.mode);
        for (index, pool) in self.pools.iter().enumerate() {
            kprintln!("  pool #{} '{}' ({}, {})", index, pool.name, pool.policy, pool.mode);
            for c in &pool.claims {
                kprintln!("    pu {}{}", c.pu, if c.exclusive { "" } else { " (shared)" });
            }
        }
    }
}

impl fmt::Debug for ResourcePartitioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePartitioner")
            .field("mode", &self.mode)
            .field("pools", &self.pools.iter().map(|p| p.name.as_str()).collect::<Vec<_>>())
            .field("configured", &self.assigned.is_some())
            .finish()
    }
}
