use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::{debug, error};

use super::Task;

const IDLE_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Elastic overflow executor for dispatches the ring rejected.
///
/// Threads are created on demand up to the configured maximum, hand work
/// over directly (an item is queued only when an idle thread is already
/// waiting for it), and exit after 60s without work.
pub struct ReservePool {
    inner: Arc<ReserveShared>,
}

struct ReserveShared {
    name: String,
    max_workers: usize,
    state: Mutex<ReserveState>,
    cond: Condvar,
    thread_seq: AtomicUsize,
}

struct ReserveState {
    /// workers currently parked in the hand-off wait
    idle: usize,
    /// workers alive in total
    live: usize,
    /// hand-off slots; never grows past `idle`
    pending: VecDeque<Box<dyn Task>>,
    shutdown: bool,
}

impl ReservePool {
    pub fn new(name: &str, max_workers: usize) -> Self {
        assert!(max_workers > 0);
        Self {
            inner: Arc::new(ReserveShared {
                name: name.to_string(),
                max_workers,
                state: Mutex::new(ReserveState {
                    idle: 0,
                    live: 0,
                    pending: VecDeque::new(),
                    shutdown: false,
                }),
                cond: Condvar::new(),
                thread_seq: AtomicUsize::new(0),
            }),
        }
    }

    /// Hand the task to an idle worker, or spawn one. `Err` returns the task
    /// when every worker slot is busy; the rejection is reported with the
    /// pool counters before surfacing.
    pub fn execute(&self, task: Box<dyn Task>) -> Result<(), Box<dyn Task>> {
        let mut state = self.inner.state.lock().unwrap();
        if state.shutdown {
            return Err(task);
        }
        if state.pending.len() < state.idle {
            state.pending.push_back(task);
            self.inner.cond.notify_one();
            return Ok(());
        }
        if state.live < self.inner.max_workers {
            state.live += 1;
            drop(state);
            self.spawn_worker(task);
            return Ok(());
        }
        error!(
            "{} rejected a task: live={} max={} idle={}",
            self.inner.name, state.live, self.inner.max_workers, state.idle
        );
        Err(task)
    }

    fn spawn_worker(&self, first: Box<dyn Task>) {
        let shared = self.inner.clone();
        let seq = shared.thread_seq.fetch_add(1, Ordering::Relaxed);
        std::thread::Builder::new()
            .name(format!("{}-{}", self.inner.name, seq))
            .spawn(move || shared.worker_loop(first))
            .expect("spawn reserve worker");
    }

    /// Wake every worker; each exits once its current item finishes.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if state.shutdown {
            return;
        }
        state.shutdown = true;
        state.pending.clear();
        self.inner.cond.notify_all();
    }

    #[inline]
    pub fn max_workers(&self) -> usize {
        self.inner.max_workers
    }

    #[cfg(test)]
    fn live_workers(&self) -> usize {
        self.inner.state.lock().unwrap().live
    }
}

impl Drop for ReservePool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ReserveShared {
    fn worker_loop(self: Arc<Self>, first: Box<dyn Task>) {
        self.run_item(first);
        loop {
            let next = {
                let mut state = self.state.lock().unwrap();
                state.idle += 1;
                let mut timed_out = false;
                loop {
                    if let Some(task) = state.pending.pop_front() {
                        state.idle -= 1;
                        break Some(task);
                    }
                    if state.shutdown || timed_out {
                        state.idle -= 1;
                        state.live -= 1;
                        debug!("{} worker exits, {} left", self.name, state.live);
                        break None;
                    }
                    let (guard, wait) = self.cond.wait_timeout(state, IDLE_KEEP_ALIVE).unwrap();
                    state = guard;
                    timed_out = wait.timed_out();
                }
            };
            match next {
                Some(task) => self.run_item(task),
                None => return,
            }
        }
    }

    fn run_item(&self, task: Box<dyn Task>) {
        if let Err(e) = std::panic::catch_unwind(AssertUnwindSafe(move || task.run())) {
            if let Some(msg) = e.downcast_ref::<&str>() {
                error!("{} task panicked: {}", self.name, msg);
            } else if let Some(msg) = e.downcast_ref::<String>() {
                error!("{} task panicked: {}", self.name, msg);
            } else {
                error!("{} task panicked", self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_reserve_runs_and_reuses() {
        let pool = ReservePool::new("reserve.test", 2);
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let c = count.clone();
            let mut task: Box<dyn Task> = Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
            loop {
                match pool.execute(task) {
                    Ok(()) => break,
                    Err(back) => {
                        task = back;
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
            }
        }
        while count.load(Ordering::SeqCst) < 8 {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(pool.live_workers() <= 2);
    }

    #[test]
    fn test_reserve_rejects_when_saturated() {
        let pool = ReservePool::new("reserve.full", 1);
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        pool.execute(Box::new(move || {
            let _ = rx.recv();
        }))
        .map_err(|_| ())
        .expect("first task occupies the only worker");
        // worker busy, no idle thread waiting: the hand-off must fail
        std::thread::sleep(Duration::from_millis(20));
        assert!(pool.execute(Box::new(|| {})).is_err());
        tx.send(()).unwrap();
    }

    #[test]
    fn test_reserve_shutdown_rejects() {
        let pool = ReservePool::new("reserve.stop", 1);
        pool.shutdown();
        pool.shutdown();
        assert!(pool.execute(Box::new(|| {})).is_err());
    }
}
