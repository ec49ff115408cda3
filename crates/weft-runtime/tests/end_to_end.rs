//! One pool, four workers, compact affinity on a synthetic two-node machine:
//! a hundred tasks suspend themselves and are woken from outside.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use weft_core::{get_global_activity_count, Mask, PartitionerMode, RestartState, ScheduleHint, ScheduleState};
use weft_runtime::topology::{install_topology, Topology};
use weft_runtime::{Mapping, ResourcePartitioner, Runtime, RuntimeConfig, TaskInit};

const TASKS: usize = 100;

fn wait_until(what: &str, mut f: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !f() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn suspend_resume_hundred_tasks() {
    let topo = install_topology(Topology::uniform(2, 2, 2));
    assert_eq!(topo.num_pus(), 8);

    let config = RuntimeConfig::new().num_threads(4).affinity("compact");
    let rp = ResourcePartitioner::with_topology(config, PartitionerMode::DEFAULT, topo).unwrap();
    assert_eq!(rp.affinity().mapping(), Some(Mapping::Compact));
    let rt = Runtime::new(rp).unwrap();

    let pool = rt.thread_manager().default_pool().unwrap();
    assert_eq!(pool.num_threads(), 4);
    let masks: Vec<Mask> = (0..4).map(|w| pool.mask(w)).collect();
    assert_eq!(masks, vec![Mask::single(0), Mask::single(1), Mask::single(2), Mask::single(3)]);

    rt.start().unwrap();

    let before = Arc::new(AtomicUsize::new(0));
    let after = Arc::new(AtomicUsize::new(0));
    let signaled = Arc::new(AtomicUsize::new(0));
    let mut ids = Vec::with_capacity(TASKS);
    for i in 0..TASKS {
        let (before, after, signaled) = (Arc::clone(&before), Arc::clone(&after), Arc::clone(&signaled));
        let rt2 = Arc::clone(&rt);
        let id = rt
            .thread_manager()
            .create_thread(
                move |_| {
                    let tm = rt2.thread_manager();
                    let me = tm.current_task().unwrap();
                    before.fetch_add(1, Ordering::SeqCst);
                    let r = tm.set_thread_state(
                        me.id(),
                        ScheduleState::Suspended,
                        RestartState::Unknown,
                        None,
                        ScheduleHint::None,
                        false,
                    );
                    assert_eq!(r, Ok(ScheduleState::Active));
                    if me.restart_state() == RestartState::Signaled {
                        signaled.fetch_add(1, Ordering::SeqCst);
                    }
                    after.fetch_add(1, Ordering::SeqCst);
                },
                TaskInit::new().description(format!("e2e-{}", i)),
            )
            .unwrap();
        ids.push(id);
    }

    let tm = rt.thread_manager();
    wait_until("every task to suspend", || {
        ids.iter().all(|&id| tm.thread_state(id) == Ok(ScheduleState::Suspended))
    });
    assert_eq!(before.load(Ordering::SeqCst), TASKS);
    assert_eq!(after.load(Ordering::SeqCst), 0);
    assert_eq!(get_global_activity_count(), 0);

    for &id in &ids {
        let prev = tm
            .set_thread_state(id, ScheduleState::Pending, RestartState::Signaled, None, ScheduleHint::None, false)
            .unwrap();
        assert_eq!(prev, ScheduleState::Suspended);
    }

    assert!(rt.wait_for(Duration::from_secs(10)));
    wait_until("the task table to empty", || tm.num_tasks() == 0);
    assert_eq!(after.load(Ordering::SeqCst), TASKS);
    assert_eq!(signaled.load(Ordering::SeqCst), TASKS);
    assert_eq!(get_global_activity_count(), 0);
    assert!(pool.tasks_executed() >= 2 * TASKS as u64);

    rt.stop().unwrap();
    assert!(weft_runtime::get_runtime().is_none());
}
