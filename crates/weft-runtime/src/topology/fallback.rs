//! Flat topology for platforms without a discovery backend
//!
//! Every PU is its own core on a single NUMA node; binding is a no-op.

use weft_core::error::{RuntimeError, RuntimeResult, WorkerError};
use weft_core::{kdebug, Mask};

use super::PuEntry;

pub(super) fn probe() -> RuntimeResult<(Vec<PuEntry>, Option<Mask>)> {
    let n = std::thread::available_parallelism()
        .map_err(|e| RuntimeError::TopologyProbe(e.to_string()))?
        .get();
    let entries = (0..n).map(|pu| PuEntry { pu, node: 0, core_key: (0, pu) }).collect();
    Ok((entries, None))
}

pub(super) fn bind_current_thread(mask: &Mask) -> Result<(), WorkerError> {
    kdebug!("thread binding unsupported on this platform, mask {} ignored", mask);
    Ok(())
}

pub(super) fn current_pu() -> Option<usize> {
    None
}
