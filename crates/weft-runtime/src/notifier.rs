//! Callbacks fired by pool workers
//!
//! Start/stop callbacks get `(local worker, global worker, pool name,
//! postfix)`. The error callback decides whether a worker keeps going after
//! a task panicked; without one, workers log and continue.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

pub type OnStartStop = Arc<dyn Fn(usize, usize, &str, &str) + Send + Sync>;
pub type OnError = Arc<dyn Fn(usize, &(dyn Any + Send)) -> bool + Send + Sync>;
pub type OnTaskAdded = Arc<dyn Fn(&str) + Send + Sync>;
pub type OnWorkerIdle = Arc<dyn Fn(usize, usize) + Send + Sync>;

#[derive(Clone, Default)]
pub struct CallbackNotifier {
    on_start_thread: Vec<OnStartStop>,
    on_stop_thread: Vec<OnStartStop>,
    on_task_added: Vec<OnTaskAdded>,
    on_worker_idle: Vec<OnWorkerIdle>,
    on_error: Option<OnError>,
}

impl CallbackNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_on_start_thread(&mut self, f: impl Fn(usize, usize, &str, &str) + Send + Sync + 'static) {
        self.on_start_thread.push(Arc::new(f));
    }

    pub fn add_on_stop_thread(&mut self, f: impl Fn(usize, usize, &str, &str) + Send + Sync + 'static) {
        self.on_stop_thread.push(Arc::new(f));
    }

    pub fn add_on_task_added(&mut self, f: impl Fn(&str) + Send + Sync + 'static) {
        self.on_task_added.push(Arc::new(f));
    }

    pub fn add_on_worker_idle(&mut self, f: impl Fn(usize, usize) + Send + Sync + 'static) {
        self.on_worker_idle.push(Arc::new(f));
    }

    /// Replace the error callback
    pub fn set_on_error(&mut self, f: impl Fn(usize, &(dyn Any + Send)) -> bool + Send + Sync + 'static) {
        self.on_error = Some(Arc::new(f));
    }

    pub fn on_start_thread(&self, local: usize, global: usize, pool: &str, postfix: &str) {
        for f in &self.on_start_thread {
            f(local, global, pool, postfix);
        }
    }

    pub fn on_stop_thread(&self, local: usize, global: usize, pool: &str, postfix: &str) {
        for f in &self.on_stop_thread {
            f(local, global, pool, postfix);
        }
    }

    pub fn on_task_added(&self, pool: &str) {
        for f in &self.on_task_added {
            f(pool);
        }
    }

    pub fn on_worker_idle(&self, local: usize, global: usize) {
        for f in &self.on_worker_idle {
            f(local, global);
        }
    }

    /// True when the worker should keep running
    pub fn on_error(&self, global: usize, payload: &(dyn Any + Send)) -> bool {
        match &self.on_error {
            Some(f) => f(global, payload),
            None => true,
        }
    }
}

impl fmt::Debug for CallbackNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackNotifier")
            .field("on_start_thread", &self.on_start_thread.len())
            .field("on_stop_thread", &self.on_stop_thread.len())
            .field("on_task_added", &self.on_task_added.len())
            .field("on_worker_idle", &self.on_worker_idle.len())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Best-effort text of a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_callbacks_run_in_order() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut n = CallbackNotifier::new();
        for tag in ["a", "b"] {
            let log = Arc::clone(&log);
            n.add_on_start_thread(move |local, global, pool, postfix| {
                log.lock().unwrap().push(format!("{}:{}/{}@{}{}", tag, local, global, pool, postfix));
            });
        }
        n.on_start_thread(1, 5, "io", "#1");
        assert_eq!(*log.lock().unwrap(), vec!["a:1/5@io#1", "b:1/5@io#1"]);
    }

    #[test]
    fn test_counters_and_error_default() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut n = CallbackNotifier::new();
        let h = Arc::clone(&hits);
        n.add_on_task_added(move |_| {
            h.fetch_add(1, Ordering::Relaxed);
        });
        let h = Arc::clone(&hits);
        n.add_on_worker_idle(move |_, _| {
            h.fetch_add(10, Ordering::Relaxed);
        });
        n.on_task_added("default");
        n.on_worker_idle(0, 0);
        n.on_stop_thread(0, 0, "default", "");
        assert_eq!(hits.load(Ordering::Relaxed), 11);

        let payload: Box<dyn Any + Send> = Box::new("oops");
        assert!(n.on_error(0, payload.as_ref()));
        n.set_on_error(|_, p| panic_message(p) != "oops");
        assert!(!n.on_error(0, payload.as_ref()));
    }

    #[test]
    fn test_panic_message() {
        let s: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(s.as_ref()), "owned");
        let n: Box<dyn Any + Send> = Box::new(7);
        assert_eq!(panic_message(n.as_ref()), "<non-string panic payload>");
    }
}
