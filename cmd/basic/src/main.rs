//! Basic weft example
//!
//! Spawns a handful of tasks on the default pool: some yield, one runs at
//! high priority, and one parks itself until the main thread wakes it.
//!
//! # Environment Variables
//!
//! - `WEFT_NUM_THREADS=4` - Worker threads
//! - `WEFT_AFFINITY=compact` - Placement policy (compact, scatter, balanced, numa-balanced, none)
//! - `WEFT_FLUSH_EPRINT=1` - Flush debug output immediately (useful for crash debugging)
//! - `WEFT_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use weft::{current_id, spawn, spawn_with_priority, suspend, wake, yield_now};
use weft::{init_logging, kdebug, kinfo, Priority, RuntimeConfig, ScheduleState};

// WEFT_LOG_LEVEL=debug WEFT_FLUSH_EPRINT=1 cargo run -p weft-basic
fn main() -> weft::RuntimeResult<()> {
    println!("=== weft basic example ===\n");
    init_logging();

    let config = RuntimeConfig::from_env();
    config.print();

    let completed = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&completed);

    weft::run(config, move |rt| -> weft::RuntimeResult<()> {
        for i in 1..=3 {
            let c = Arc::clone(&c);
            let id = spawn(move || {
                kdebug!("[task {}] started as {}", i, current_id());
                for j in 0..3 {
                    kdebug!("[task {}] iteration {}", i, j);
                    yield_now();
                }
                c.fetch_add(1, Ordering::SeqCst);
            })?;
            println!("spawned normal task {} (id={})", i, id);
        }

        let hc = Arc::clone(&c);
        let high = spawn_with_priority(
            move || {
                kdebug!("[high] started");
                yield_now();
                hc.fetch_add(1, Ordering::SeqCst);
            },
            Priority::High,
        )?;
        println!("spawned high priority task (id={})", high);

        let (tx, rx) = mpsc::channel();
        let sc = Arc::clone(&c);
        spawn(move || {
            let _ = tx.send(current_id());
            match suspend() {
                Ok(reason) => kinfo!("[sleeper] restarted: {:?}", reason),
                Err(e) => kinfo!("[sleeper] could not suspend: {}", e),
            }
            sc.fetch_add(1, Ordering::SeqCst);
        })?;

        if let Ok(sleeper) = rx.recv() {
            let tm = rt.thread_manager();
            let deadline = Instant::now() + Duration::from_secs(5);
            while tm.thread_state(sleeper) != Ok(ScheduleState::Suspended) && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(1));
            }
            println!("waking task {}", sleeper);
            wake(sleeper)?;
        }
        Ok(())
    })??;

    kinfo!("{} task(s) completed", completed.load(Ordering::SeqCst));
    println!("\n=== example complete ===");
    Ok(())
}
