//! Task control blocks and the id-indexed task table

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use weft_core::error::{RuntimeError, RuntimeResult};
use weft_core::{
    Backoff, Priority, RestartState, ScheduleHint, ScheduleState, SlotAllocator, SpinLock, TaskId,
};

use crate::coroutine::Coroutine;

/// Shared handle to a task
pub type TaskRef = Arc<TaskControlBlock>;

/// What a task asked for when it last switched back to its worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum SwitchRequest {
    /// Plain coroutine suspend; treated as a yield
    None = 0,
    Yield = 1,
    YieldBoost = 2,
    Suspend = 3,
}

impl From<u8> for SwitchRequest {
    fn from(v: u8) -> Self {
        match v {
            1 => SwitchRequest::Yield,
            2 => SwitchRequest::YieldBoost,
            3 => SwitchRequest::Suspend,
            _ => SwitchRequest::None,
        }
    }
}

/// Per-task bookkeeping
///
/// State changes are compare-and-swap on `state`. The `running` flag is
/// owned by whichever worker resumes the coroutine, so a task executes on
/// at most one worker at a time.
pub struct TaskControlBlock {
    id: TaskId,
    pool: usize,
    state: AtomicU8,
    priority: AtomicU8,
    restart: AtomicU8,
    request: AtomicU8,
    boost: AtomicBool,
    running: AtomicBool,
    hint: SpinLock<ScheduleHint>,
    description: Option<String>,
    coroutine: SpinLock<Option<Coroutine>>,
}

impl TaskControlBlock {
    pub(crate) fn new(
        id: TaskId,
        pool: usize,
        coroutine: Coroutine,
        priority: Priority,
        hint: ScheduleHint,
        description: Option<String>,
    ) -> TaskControlBlock {
        TaskControlBlock {
            id,
            pool,
            state: AtomicU8::new(ScheduleState::Pending as u8),
            priority: AtomicU8::new(priority as u8),
            restart: AtomicU8::new(RestartState::Unknown as u8),
            request: AtomicU8::new(SwitchRequest::None as u8),
            boost: AtomicBool::new(false),
            running: AtomicBool::new(false),
            hint: SpinLock::new(hint),
            description,
            coroutine: SpinLock::new(Some(coroutine)),
        }
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Index of the owning pool
    #[inline]
    pub fn pool(&self) -> usize {
        self.pool
    }

    #[inline]
    pub fn state(&self) -> ScheduleState {
        ScheduleState::from(self.state.load(Ordering::SeqCst))
    }

    pub fn priority(&self) -> Priority {
        Priority::from(self.priority.load(Ordering::Relaxed))
    }

    pub(crate) fn set_priority(&self, priority: Priority) {
        self.priority.store(priority as u8, Ordering::Relaxed);
    }

    pub fn hint(&self) -> ScheduleHint {
        *self.hint.lock()
    }

    pub(crate) fn set_hint(&self, hint: ScheduleHint) {
        *self.hint.lock() = hint;
    }

    /// Why the task was last restarted
    pub fn restart_state(&self) -> RestartState {
        RestartState::from(self.restart.load(Ordering::Acquire))
    }

    pub(crate) fn set_restart_state(&self, restart: RestartState) {
        self.restart.store(restart as u8, Ordering::Release);
    }

    pub fn description(&self) -> &str {
        self.description.as_deref().unwrap_or("<unknown>")
    }

    /// A boost was requested while the task was active
    pub fn boost_requested(&self) -> bool {
        self.boost.load(Ordering::SeqCst)
    }

    pub(crate) fn request_boost(&self) {
        self.boost.store(true, Ordering::SeqCst);
    }

    pub(crate) fn take_boost(&self) -> bool {
        self.boost.swap(false, Ordering::SeqCst)
    }

    /// Executing on a worker right now
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn cas_state(&self, from: ScheduleState, to: ScheduleState) -> Result<ScheduleState, ScheduleState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(ScheduleState::from)
            .map_err(ScheduleState::from)
    }

    /// Claim the task for one worker, waiting out a previous worker that is
    /// still switching away from it
    pub(crate) fn claim(&self) {
        let mut backoff = Backoff::new();
        while self
            .running
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }
    }

    pub(crate) fn unclaim(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub(crate) fn set_request(&self, request: SwitchRequest) {
        self.request.store(request as u8, Ordering::Release);
    }

    pub(crate) fn take_request(&self) -> SwitchRequest {
        SwitchRequest::from(self.request.swap(SwitchRequest::None as u8, Ordering::AcqRel))
    }

    pub(crate) fn take_coroutine(&self) -> Option<Coroutine> {
        self.coroutine.lock().take()
    }

    pub(crate) fn put_coroutine(&self, coroutine: Coroutine) {
        *self.coroutine.lock() = Some(coroutine);
    }
}

impl fmt::Debug for TaskControlBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskControlBlock")
            .field("id", &self.id)
            .field("pool", &self.pool)
            .field("state", &self.state())
            .field("priority", &self.priority())
            .field("description", &self.description())
            .finish()
    }
}

/// Live tasks by id
pub struct TaskTable {
    slots: SlotAllocator,
    tasks: SpinLock<Vec<Option<TaskRef>>>,
}

impl TaskTable {
    pub fn new(max_tasks: usize) -> TaskTable {
        TaskTable { slots: SlotAllocator::new(max_tasks), tasks: SpinLock::new(Vec::new()) }
    }

    /// Allocate an id, build the block for it and register it
    pub(crate) fn insert(&self, make: impl FnOnce(TaskId) -> TaskControlBlock) -> RuntimeResult<TaskRef> {
        let id = self.slots.allocate()?;
        let task = Arc::new(make(id));
        let mut tasks = self.tasks.lock();
        let idx = id.as_usize();
        if tasks.len() <= idx {
            tasks.resize(idx + 1, None);
        }
        tasks[idx] = Some(Arc::clone(&task));
        Ok(task)
    }

    /// The live task with exactly this id; a stale id from a recycled slot
    /// finds nothing
    pub fn get(&self, id: TaskId) -> Option<TaskRef> {
        self.tasks.lock().get(id.as_usize()).cloned().flatten().filter(|t| t.id == id)
    }

    pub fn try_get(&self, id: TaskId) -> RuntimeResult<TaskRef> {
        self.get(id).ok_or(RuntimeError::TaskNotFound)
    }

    /// Drop the table's reference to a terminated task and recycle its id
    pub(crate) fn remove(&self, task: &TaskControlBlock) {
        let removed = {
            let mut tasks = self.tasks.lock();
            match tasks.get_mut(task.id.as_usize()) {
                Some(slot) if slot.as_ref().is_some_and(|t| std::ptr::eq(&**t, task)) => slot.take(),
                _ => None,
            }
        };
        if removed.is_some() {
            self.slots.release(task.id);
        }
    }

    /// Number of live tasks
    pub fn len(&self) -> usize {
        self.slots.allocated_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (id, state, description) of every live task
    pub fn snapshot(&self) -> Vec<(TaskId, ScheduleState, String)> {
        self.tasks
            .lock()
            .iter()
            .flatten()
            .map(|t| (t.id(), t.state(), t.description().to_owned()))
            .collect()
    }
}
