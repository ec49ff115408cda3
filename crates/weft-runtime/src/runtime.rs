//! Runtime lifecycle
//!
//! ```text
//! Invalid -> Initialized -> PreStartup -> Startup -> PreMain -> Starting -> Running
//! Running <-> Suspended
//! Running -> PreSleep -> Sleeping -> Running
//! Running -> PreShutdown -> Shutdown -> Stopping -> Terminating -> Stopped
//! ```
//!
//! One runtime exists per process at a time. It is registered in a global
//! slot on construction and leaves it when stopped; [`get_runtime`] and
//! [`thread_manager_is`] read that slot.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use weft_core::error::{RuntimeError, RuntimeResult};
use weft_core::kprint::{self, LogLevel};
use weft_core::{kdebug, kerror, AtomicRuntimeState, PartitionerMode, RuntimeState, SchedulerMode};

use crate::config::RuntimeConfig;
use crate::partitioner::{Resource, ResourcePartitioner};
use crate::pool::{self, ThreadPool};
use crate::scheduler::SchedulingPolicy;
use crate::thread_manager::ThreadManager;
use crate::topology;

/// Function run once at a lifecycle point
pub type Hook = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Hooks {
    pre_startup: Vec<Hook>,
    startup: Vec<Hook>,
    pre_shutdown: Vec<Hook>,
    shutdown: Vec<Hook>,
}

pub struct Runtime {
    state: AtomicRuntimeState,
    config: RuntimeConfig,
    partitioner: Mutex<ResourcePartitioner>,
    manager: ThreadManager,
    hooks: Mutex<Hooks>,
}

static RUNTIME: RwLock<Option<Arc<Runtime>>> = RwLock::new(None);

/// The registered runtime, if any
pub fn get_runtime() -> Option<Arc<Runtime>> {
    RUNTIME.read().unwrap_or_else(PoisonError::into_inner).clone()
}

pub fn try_get_runtime() -> RuntimeResult<Arc<Runtime>> {
    get_runtime().ok_or(RuntimeError::NotInitialized)
}

/// Whether the runtime is in `state`
///
/// Without a runtime, states up to `Starting` and from `Stopping` on are
/// reported as current.
pub fn thread_manager_is(state: RuntimeState) -> bool {
    match get_runtime() {
        Some(rt) => rt.state() == state,
        None => state.assumed_without_runtime(),
    }
}

/// Build a runtime from `config` with default partitioning and start it
pub fn init(config: RuntimeConfig) -> RuntimeResult<Arc<Runtime>> {
    let rt = Runtime::new(ResourcePartitioner::new(config, PartitionerMode::DEFAULT)?)?;
    rt.start()?;
    Ok(rt)
}

impl Runtime {
    /// Configure the pools and register the runtime; nothing runs yet
    pub fn new(mut partitioner: ResourcePartitioner) -> RuntimeResult<Arc<Runtime>> {
        let mut slot = RUNTIME.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(RuntimeError::AlreadyInitialized);
        }

        let config = partitioner.config().clone();
        if config.debug {
            kprint::set_log_level(LogLevel::Debug);
        }
        let params = partitioner.configure_pools().map_err(|e| {
            kerror!("runtime configuration rejected: {}", e);
            e
        })?;
        let manager = ThreadManager::new(params, config.max_tasks, config.retry_on_active_limit);

        let rt = Arc::new(Runtime {
            state: AtomicRuntimeState::new(RuntimeState::Invalid),
            config,
            partitioner: Mutex::new(partitioner),
            manager,
            hooks: Mutex::new(Hooks::default()),
        });
        rt.move_to(RuntimeState::Initialized)?;
        *slot = Some(Arc::clone(&rt));
        Ok(rt)
    }

    pub fn state(&self) -> RuntimeState {
        self.state.load()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn thread_manager(&self) -> &ThreadManager {
        &self.manager
    }

    pub fn pool(&self, name: &str) -> RuntimeResult<Arc<ThreadPool>> {
        self.manager.pool_by_name(name)
    }

    pub fn add_pre_startup_function(&self, f: impl FnOnce() + Send + 'static) {
        self.hooks().pre_startup.push(Box::new(f));
    }

    pub fn add_startup_function(&self, f: impl FnOnce() + Send + 'static) {
        self.hooks().startup.push(Box::new(f));
    }

    pub fn add_pre_shutdown_function(&self, f: impl FnOnce() + Send + 'static) {
        self.hooks().pre_shutdown.push(Box::new(f));
    }

    pub fn add_shutdown_function(&self, f: impl FnOnce() + Send + 'static) {
        self.hooks().shutdown.push(Box::new(f));
    }

    fn hooks(&self) -> std::sync::MutexGuard<'_, Hooks> {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run_hooks(&self, state: RuntimeState) {
        let hooks = {
            let mut hooks = self.hooks();
            match state {
                RuntimeState::PreStartup => std::mem::take(&mut hooks.pre_startup),
                RuntimeState::Startup => std::mem::take(&mut hooks.startup),
                RuntimeState::PreShutdown => std::mem::take(&mut hooks.pre_shutdown),
                RuntimeState::Shutdown => std::mem::take(&mut hooks.shutdown),
                _ => Vec::new(),
            }
        };
        for hook in hooks {
            hook();
        }
    }

    fn move_to(&self, next: RuntimeState) -> RuntimeResult<()> {
        let current = self.state();
        self.state.transition(current, next).map_err(|_| RuntimeError::InvalidTransition)?;
        kdebug!("runtime: {} -> {}", current, next);
        Ok(())
    }

    /// Run the startup hooks and start every pool
    pub fn start(&self) -> RuntimeResult<()> {
        self.state
            .advance_to(RuntimeState::PreMain, |s| {
                kdebug!("runtime: entering {}", s);
                self.run_hooks(s);
            })
            .map_err(|_| RuntimeError::InvalidTransition)?;
        self.move_to(RuntimeState::Starting)?;
        if let Err(e) = self.manager.run() {
            kerror!("runtime failed to start its pools: {}", e);
            self.manager.abort();
            return Err(e);
        }
        self.move_to(RuntimeState::Running)
    }

    /// Block until no task is pending or active
    pub fn wait(&self) {
        self.manager.wait_quiescent(None);
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`
    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.manager.wait_quiescent(Some(timeout))
    }

    /// Shut down: hooks, drain and join the pools, unregister
    ///
    /// Tasks still suspended once the pools are drained are terminated. Must
    /// not be called from a worker thread.
    pub fn stop(&self) -> RuntimeResult<()> {
        if pool::current_worker_index().is_some() {
            return Err(RuntimeError::InvalidStatus);
        }
        match self.state() {
            RuntimeState::Suspended => self.resume()?,
            RuntimeState::Sleeping => self.wake()?,
            s if s < RuntimeState::Running => {
                // Never started: the pools have no threads
                self.manager.stop();
                self.unregister();
                return Ok(());
            }
            _ => {}
        }
        self.state
            .advance_to(RuntimeState::Stopped, |s| {
                kdebug!("runtime: entering {}", s);
                match s {
                    RuntimeState::PreShutdown | RuntimeState::Shutdown => self.run_hooks(s),
                    RuntimeState::Stopping => {
                        self.manager.stop();
                    }
                    _ => {}
                }
            })
            .map_err(|_| RuntimeError::InvalidTransition)?;
        self.unregister();
        topology::release_topology();
        Ok(())
    }

    fn unregister(&self) {
        let mut slot = RUNTIME.write().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|rt| std::ptr::eq(Arc::as_ptr(rt), self)) {
            *slot = None;
        }
    }

    /// Pause every pool
    pub fn suspend(&self) -> RuntimeResult<()> {
        self.move_to_from(RuntimeState::Running, RuntimeState::Suspended)?;
        self.manager.suspend()
    }

    pub fn resume(&self) -> RuntimeResult<()> {
        if self.state() != RuntimeState::Suspended {
            return Err(RuntimeError::InvalidTransition);
        }
        self.manager.resume()?;
        self.move_to_from(RuntimeState::Suspended, RuntimeState::Running)
    }

    /// Pause every pool through `PreSleep`
    pub fn sleep(&self) -> RuntimeResult<()> {
        self.move_to_from(RuntimeState::Running, RuntimeState::PreSleep)?;
        self.manager.suspend()?;
        self.move_to_from(RuntimeState::PreSleep, RuntimeState::Sleeping)
    }

    pub fn wake(&self) -> RuntimeResult<()> {
        if self.state() != RuntimeState::Sleeping {
            return Err(RuntimeError::InvalidTransition);
        }
        self.manager.resume()?;
        self.move_to_from(RuntimeState::Sleeping, RuntimeState::Running)
    }

    fn move_to_from(&self, from: RuntimeState, to: RuntimeState) -> RuntimeResult<()> {
        self.state.transition(from, to).map_err(|_| RuntimeError::InvalidTransition)?;
        kdebug!("runtime: {} -> {}", from, to);
        Ok(())
    }

    /// Add and start a pool while running
    ///
    /// Needs a partitioner built with `ALLOW_DYNAMIC_POOLS`.
    pub fn create_pool(
        &self,
        name: &str,
        policy: SchedulingPolicy,
        mode: SchedulerMode,
        resources: &[Resource],
    ) -> RuntimeResult<Arc<ThreadPool>> {
        let params = {
            let mut rp = self.partitioner.lock().unwrap_or_else(PoisonError::into_inner);
            if !rp.mode().contains(PartitionerMode::ALLOW_DYNAMIC_POOLS) {
                return Err(RuntimeError::InvalidStatus);
            }
            rp.create_thread_pool(name, policy, mode)?;
            for resource in resources {
                rp.add_resource(*resource, name, true)?;
            }
            rp.configure_dynamic_pool(name)?
        };
        self.manager.add_pool(params)
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("state", &self.state())
            .field("manager", &self.manager)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::topology::Topology;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Runtime tests share the global slot
    pub(crate) static SERIAL: Mutex<()> = Mutex::new(());

    fn eventually(f: impl Fn() -> bool) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            if f() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    fn partitioner(mode: PartitionerMode) -> ResourcePartitioner {
        let config = RuntimeConfig::new().num_threads(2).affinity("compact");
        ResourcePartitioner::with_topology(config, mode, Arc::new(Topology::uniform(2, 2, 2))).unwrap()
    }

    #[test]
    fn test_lifecycle_and_hooks() {
        let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        assert!(get_runtime().is_none());
        assert!(thread_manager_is(RuntimeState::Starting));
        assert!(!thread_manager_is(RuntimeState::Running));

        let rt = Runtime::new(partitioner(PartitionerMode::DEFAULT)).unwrap();
        assert_eq!(rt.state(), RuntimeState::Initialized);
        let log = Arc::new(Mutex::new(Vec::new()));
        let record = |name: &'static str| {
            let log = Arc::clone(&log);
            move || log.lock().unwrap().push((name, get_runtime().unwrap().state()))
        };
        rt.add_shutdown_function(record("shutdown"));
        rt.add_pre_shutdown_function(record("pre_shutdown"));
        rt.add_startup_function(record("startup"));
        rt.add_pre_startup_function(record("pre_startup"));

        rt.start().unwrap();
        assert!(thread_manager_is(RuntimeState::Running));
        assert_eq!(rt.start(), Err(RuntimeError::InvalidTransition));
        rt.stop().unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                ("pre_startup", RuntimeState::PreStartup),
                ("startup", RuntimeState::Startup),
                ("pre_shutdown", RuntimeState::PreShutdown),
                ("shutdown", RuntimeState::Shutdown),
            ]
        );
        assert_eq!(rt.state(), RuntimeState::Stopped);
        assert!(get_runtime().is_none());
        assert!(thread_manager_is(RuntimeState::Stopped));
    }

    #[test]
    fn test_one_runtime_at_a_time() {
        let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        let rt = Runtime::new(partitioner(PartitionerMode::DEFAULT)).unwrap();
        assert_eq!(
            Runtime::new(partitioner(PartitionerMode::DEFAULT)).unwrap_err(),
            RuntimeError::AlreadyInitialized
        );
        // Stopping a runtime that never started just releases it
        rt.stop().unwrap();
        assert!(get_runtime().is_none());
    }

    #[test]
    fn test_suspend_and_sleep_detours() {
        let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        let rt = Runtime::new(partitioner(PartitionerMode::DEFAULT)).unwrap();
        assert_eq!(rt.suspend(), Err(RuntimeError::InvalidTransition));
        rt.start().unwrap();

        rt.suspend().unwrap();
        assert!(thread_manager_is(RuntimeState::Suspended));
        assert_eq!(rt.sleep(), Err(RuntimeError::InvalidTransition));
        rt.resume().unwrap();

        rt.sleep().unwrap();
        assert_eq!(rt.state(), RuntimeState::Sleeping);
        assert_eq!(rt.resume(), Err(RuntimeError::InvalidTransition));

        // Work queued while asleep runs after wake
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        rt.thread_manager()
            .create_thread(
                move |_| {
                    r.fetch_add(1, Ordering::SeqCst);
                },
                Default::default(),
            )
            .unwrap();
        rt.wake().unwrap();
        assert!(eventually(|| ran.load(Ordering::SeqCst) == 1));

        rt.suspend().unwrap();
        // stop resumes first
        rt.stop().unwrap();
        assert_eq!(rt.state(), RuntimeState::Stopped);
    }

    #[test]
    fn test_dynamic_pool() {
        let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        let rt = Runtime::new(partitioner(PartitionerMode::ALLOW_DYNAMIC_POOLS)).unwrap();
        rt.start().unwrap();
        let pool = rt
            .create_pool("late", SchedulingPolicy::StaticPriority, SchedulerMode::NOTHING_SPECIAL, &[Resource::Core(3)])
            .unwrap();
        assert_eq!(pool.index(), 1);
        assert_eq!(pool.num_threads(), 2);
        assert_eq!(rt.thread_manager().num_threads(), 4);
        assert!(rt.pool("late").is_ok());

        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        rt.thread_manager()
            .create_thread(
                move |_| {
                    r.fetch_add(1, Ordering::SeqCst);
                },
                crate::thread_manager::TaskInit::new().pool(1),
            )
            .unwrap();
        assert!(eventually(|| ran.load(Ordering::SeqCst) == 1));
        rt.stop().unwrap();
    }
}
