//! Runtime configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder methods
//! 2. Environment variables (`WEFT_*`)
//! 3. User's config file named by `WEFT_CONFIG_RS` at build time
//! 4. Library defaults
//!
//! # Example
//!
//! ```rust,ignore
//! use weft_runtime::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_env()
//!     .num_threads(8)
//!     .affinity("numa-balanced");
//! config.validate()?;
//! ```

pub mod defaults {
    include!(concat!(env!("OUT_DIR"), "/weft_defaults.rs"));
}

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use weft_core::constants::{MAX_WORKERS, MIN_STACK_SIZE};
use weft_core::env::{env_get, env_get_bool, env_get_checked, env_get_millis, env_get_str};
use weft_core::{kprintln, kwarn, RuntimeError, SchedulerMode};

use crate::affinity::AffinitySpec;
use crate::scheduler::SchedulingPolicy;

/// Resolved runtime configuration, consumed by the partitioner
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Worker threads across all pools
    pub num_threads: usize,
    /// Affinity policy: compact, scatter, balanced, numa-balanced, none,
    /// or an explicit `pu:`/`core:` list
    pub affinity: String,
    /// Cores to skip before placing the first worker
    pub used_cores: usize,
    /// Cores available after `used_cores`; `None` means all remaining
    pub max_cores: Option<usize>,
    /// Intersect every worker mask with the inherited process mask
    pub use_process_mask: bool,
    /// Usable stack bytes per task (rounded up to whole pages)
    pub stack_size: usize,
    /// Capacity of the task table
    pub max_tasks: usize,
    /// Empty polls before a worker parks
    pub idle_spins: u32,
    /// Longest a parked worker sleeps before polling again
    pub park_timeout: Duration,
    /// Attempts `set_thread_state` makes while a task is still Active
    pub retry_on_active_limit: u32,
    /// Scheduler used by pools that do not pick one
    pub scheduler: SchedulingPolicy,
    /// Mode flags handed to every scheduler
    pub scheduler_mode: SchedulerMode,
    /// Released stacks kept for reuse
    pub stack_pool_limit: usize,
    /// Raise the log level to debug
    pub debug: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Compile-time defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `WEFT_NUM_THREADS`
    /// - `WEFT_AFFINITY`
    /// - `WEFT_USED_CORES`
    /// - `WEFT_MAX_CORES` (0 = all)
    /// - `WEFT_USE_PROCESS_MASK` (0/1)
    /// - `WEFT_STACK_SIZE`
    /// - `WEFT_MAX_TASKS`
    /// - `WEFT_IDLE_SPINS`
    /// - `WEFT_PARK_TIMEOUT_MS`
    /// - `WEFT_RETRY_ON_ACTIVE_LIMIT`
    /// - `WEFT_SCHEDULER` (local, static-priority)
    /// - `WEFT_SCHEDULER_MODE` (flag names joined by `|`)
    /// - `WEFT_STACK_POOL_LIMIT`
    /// - `WEFT_DEBUG` (0/1)
    pub fn from_env() -> Self {
        let base = Self::new();
        Self {
            num_threads: env_get("WEFT_NUM_THREADS", base.num_threads),
            affinity: env_get_str("WEFT_AFFINITY", &base.affinity),
            used_cores: env_get("WEFT_USED_CORES", base.used_cores),
            max_cores: match env_get("WEFT_MAX_CORES", base.max_cores.unwrap_or(0)) {
                0 => None,
                n => Some(n),
            },
            use_process_mask: env_get_bool("WEFT_USE_PROCESS_MASK", base.use_process_mask),
            stack_size: env_get("WEFT_STACK_SIZE", base.stack_size),
            max_tasks: env_get("WEFT_MAX_TASKS", base.max_tasks),
            idle_spins: env_get("WEFT_IDLE_SPINS", base.idle_spins),
            park_timeout: env_get_millis("WEFT_PARK_TIMEOUT_MS", base.park_timeout),
            retry_on_active_limit: env_get("WEFT_RETRY_ON_ACTIVE_LIMIT", base.retry_on_active_limit),
            scheduler: env_checked("WEFT_SCHEDULER", base.scheduler),
            scheduler_mode: match std::env::var("WEFT_SCHEDULER_MODE") {
                Ok(raw) => parse_mode(&raw).unwrap_or_else(|| {
                    kwarn!("WEFT_SCHEDULER_MODE={:?} not understood, using default", raw);
                    base.scheduler_mode
                }),
                Err(_) => base.scheduler_mode,
            },
            stack_pool_limit: env_get("WEFT_STACK_POOL_LIMIT", base.stack_pool_limit),
            debug: env_get_bool("WEFT_DEBUG", base.debug),
        }
    }

    /// Compile-time defaults only, no environment
    pub fn new() -> Self {
        Self {
            num_threads: defaults::NUM_THREADS,
            affinity: defaults::AFFINITY.to_string(),
            used_cores: defaults::USED_CORES,
            max_cores: match defaults::MAX_CORES {
                0 => None,
                n => Some(n),
            },
            use_process_mask: defaults::USE_PROCESS_MASK,
            stack_size: defaults::STACK_SIZE,
            max_tasks: defaults::MAX_TASKS,
            idle_spins: defaults::IDLE_SPINS,
            park_timeout: Duration::from_millis(defaults::PARK_TIMEOUT_MS),
            retry_on_active_limit: defaults::RETRY_ON_ACTIVE_LIMIT,
            scheduler: defaults::SCHEDULER.parse().unwrap_or_default(),
            scheduler_mode: parse_mode(defaults::SCHEDULER_MODE).unwrap_or(SchedulerMode::DEFAULT_MODE),
            stack_pool_limit: defaults::STACK_POOL_LIMIT,
            debug: defaults::DEBUG,
        }
    }

    // Builder methods

    pub fn num_threads(mut self, n: usize) -> Self {
        self.num_threads = n;
        self
    }

    pub fn affinity(mut self, spec: impl Into<String>) -> Self {
        self.affinity = spec.into();
        self
    }

    pub fn used_cores(mut self, n: usize) -> Self {
        self.used_cores = n;
        self
    }

    pub fn max_cores(mut self, n: Option<usize>) -> Self {
        self.max_cores = n;
        self
    }

    pub fn use_process_mask(mut self, enable: bool) -> Self {
        self.use_process_mask = enable;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn max_tasks(mut self, n: usize) -> Self {
        self.max_tasks = n;
        self
    }

    pub fn idle_spins(mut self, spins: u32) -> Self {
        self.idle_spins = spins;
        self
    }

    pub fn park_timeout(mut self, d: Duration) -> Self {
        self.park_timeout = d;
        self
    }

    pub fn retry_on_active_limit(mut self, n: u32) -> Self {
        self.retry_on_active_limit = n;
        self
    }

    pub fn scheduler(mut self, policy: SchedulingPolicy) -> Self {
        self.scheduler = policy;
        self
    }

    pub fn scheduler_mode(mut self, mode: SchedulerMode) -> Self {
        self.scheduler_mode = mode;
        self
    }

    pub fn stack_pool_limit(mut self, n: usize) -> Self {
        self.stack_pool_limit = n;
        self
    }

    pub fn debug(mut self, enable: bool) -> Self {
        self.debug = enable;
        self
    }

    /// Check values the partitioner cannot repair
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_threads == 0 {
            return Err(ConfigError::InvalidValue("num_threads must be > 0"));
        }
        if self.num_threads > MAX_WORKERS {
            return Err(ConfigError::InvalidValue("num_threads exceeds MAX_WORKERS"));
        }
        if self.max_cores == Some(0) {
            return Err(ConfigError::InvalidValue("max_cores must be > 0 when set"));
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(ConfigError::InvalidValue("stack_size must be >= 4 pages"));
        }
        if self.max_tasks == 0 {
            return Err(ConfigError::InvalidValue("max_tasks must be > 0"));
        }
        if self.retry_on_active_limit == 0 {
            return Err(ConfigError::InvalidValue("retry_on_active_limit must be > 0"));
        }
        if matches!(self.scheduler, SchedulingPolicy::Unspecified | SchedulingPolicy::UserDefined) {
            return Err(ConfigError::InvalidValue("default scheduler must be a built-in policy"));
        }
        AffinitySpec::parse(&self.affinity)
            .map_err(|_| ConfigError::Unparsable { key: "affinity", value: self.affinity.clone() })?;
        Ok(())
    }

    pub fn print(&self) {
        kprintln!("weft configuration:");
        kprintln!("  num_threads:            {}", self.num_threads);
        kprintln!("  affinity:               {}", self.affinity);
        kprintln!("  used_cores:             {}", self.used_cores);
        kprintln!("  max_cores:              {:?}", self.max_cores);
        kprintln!("  use_process_mask:       {}", self.use_process_mask);
        kprintln!("  stack_size:             {}", self.stack_size);
        kprintln!("  max_tasks:              {}", self.max_tasks);
        kprintln!("  idle_spins:             {}", self.idle_spins);
        kprintln!("  park_timeout:           {:?}", self.park_timeout);
        kprintln!("  retry_on_active_limit:  {}", self.retry_on_active_limit);
        kprintln!("  scheduler:              {}", self.scheduler);
        kprintln!("  scheduler_mode:         {}", self.scheduler_mode);
        kprintln!("  stack_pool_limit:       {}", self.stack_pool_limit);
        kprintln!("  debug:                  {}", self.debug);
    }
}

fn parse_mode(raw: &str) -> Option<SchedulerMode> {
    if raw.trim().eq_ignore_ascii_case("default_mode") {
        return Some(SchedulerMode::DEFAULT_MODE);
    }
    SchedulerMode::parse(raw)
}

fn env_checked<T: FromStr + fmt::Display>(key: &str, default: T) -> T {
    match env_get_checked(key) {
        Ok(Some(v)) => v,
        Ok(None) => default,
        Err(raw) => {
            kwarn!("{}={:?} not understood, using {}", key, raw, default);
            default
        }
    }
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue(&'static str),
    Unparsable { key: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "invalid config: {}", msg),
            ConfigError::Unparsable { key, value } => {
                write!(f, "invalid config: {} = {:?}", key, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for RuntimeError {
    fn from(e: ConfigError) -> Self {
        RuntimeError::InvalidArgument(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = RuntimeConfig::new();
        assert_eq!(config.num_threads, defaults::NUM_THREADS);
        assert_eq!(config.scheduler_mode, SchedulerMode::DEFAULT_MODE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::new()
            .num_threads(8)
            .affinity("scatter")
            .park_timeout(Duration::from_millis(5))
            .scheduler(SchedulingPolicy::StaticPriority);

        assert_eq!(config.num_threads, 8);
        assert_eq!(config.affinity, "scatter");
        assert_eq!(config.park_timeout, Duration::from_millis(5));
        assert_eq!(config.scheduler, SchedulingPolicy::StaticPriority);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert!(RuntimeConfig::new().num_threads(0).validate().is_err());
        assert!(RuntimeConfig::new().num_threads(MAX_WORKERS + 1).validate().is_err());
        assert!(RuntimeConfig::new().stack_size(1024).validate().is_err());
        assert!(RuntimeConfig::new().max_cores(Some(0)).validate().is_err());
        assert_eq!(
            RuntimeConfig::new().affinity("diagonal").validate(),
            Err(ConfigError::Unparsable { key: "affinity", value: "diagonal".into() })
        );
        assert!(RuntimeConfig::new()
            .scheduler(SchedulingPolicy::UserDefined)
            .validate()
            .is_err());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("WEFT_NUM_THREADS", "3");
        std::env::set_var("WEFT_SCHEDULER_MODE", "enable_stealing|enable_idle_backoff");
        std::env::set_var("WEFT_MAX_CORES", "0");
        let config = RuntimeConfig::from_env();
        std::env::remove_var("WEFT_NUM_THREADS");
        std::env::remove_var("WEFT_SCHEDULER_MODE");
        std::env::remove_var("WEFT_MAX_CORES");

        assert_eq!(config.num_threads, 3);
        assert_eq!(
            config.scheduler_mode,
            SchedulerMode::ENABLE_STEALING | SchedulerMode::ENABLE_IDLE_BACKOFF
        );
        assert_eq!(config.max_cores, None);
    }

    #[test]
    fn test_config_error_into_runtime_error() {
        let e: RuntimeError = ConfigError::InvalidValue("num_threads must be > 0").into();
        assert!(e.is_fatal_config());
    }
}
