//! Bounded task dispatch: the boundary between the I/O side and user code.
//!
//! Inbound work is claimed into a power-of-two ring consumed by a fixed pool
//! of worker threads; an optional elastic reserve pool absorbs overflow.

mod reserve;
mod ring;
mod wait;

pub use reserve::ReservePool;
pub use ring::RingDispatcher;
pub use wait::WaitStrategy;

use crate::config::DispatcherConfig;
use crate::error::DispatchError;

/// Upper bound on the dispatcher worker pool.
pub const MAX_NUM_WORKERS: usize = 32;

/// A unit of work the dispatcher runs on one of its worker threads.
pub trait Task: Send + 'static {
    fn run(self: Box<Self>);
}

impl<F: FnOnce() + Send + 'static> Task for F {
    #[inline]
    fn run(self: Box<Self>) {
        (*self)()
    }
}

/// The submit-or-fallback surface in front of [RingDispatcher] and
/// [ReservePool]. This is the only entry point the I/O handlers and user
/// code see.
pub struct TaskDispatcher {
    ring: RingDispatcher,
    reserve: Option<ReservePool>,
}

impl TaskDispatcher {
    pub fn new(config: DispatcherConfig) -> Result<Self, DispatchError> {
        if config.buf_size == 0 {
            return Err(DispatchError::InvalidArgument("bufSize must be larger than 0"));
        }
        let capacity = config.buf_size.next_power_of_two();
        // abs() pass-through on the worker count is kept on purpose:
        // negative inputs are silently accepted.
        let num_workers =
            (config.num_workers.unsigned_abs() as usize).clamp(1, MAX_NUM_WORKERS);
        let reserve = if config.num_reserve_workers > 0 {
            Some(ReservePool::new("reserve.processor", config.num_reserve_workers))
        } else {
            None
        };
        Ok(Self {
            ring: RingDispatcher::new(
                num_workers,
                &config.thread_name,
                capacity,
                config.wait_strategy,
            ),
            reserve,
        })
    }

    /// Dispatcher with default buffer, no reserve, blocking wait.
    pub fn with_workers(num_workers: i32) -> Result<Self, DispatchError> {
        Self::new(DispatcherConfig { num_workers, ..Default::default() })
    }

    /// Non-blocking claim into the ring. `Err` hands the task back on
    /// insufficient capacity (or after shutdown), without blocking or
    /// allocating.
    #[inline]
    pub fn dispatch(&self, task: Box<dyn Task>) -> Result<(), Box<dyn Task>> {
        self.ring.dispatch(task)
    }

    /// Ring first, reserve pool on overflow, error when neither can take it.
    pub fn execute(&self, task: Box<dyn Task>) -> Result<(), DispatchError> {
        match self.ring.dispatch(task) {
            Ok(()) => Ok(()),
            Err(task) => match self.reserve.as_ref() {
                Some(pool) => pool
                    .execute(task)
                    .map_err(|_| DispatchError::Rejected("reserve pool is full")),
                None => Err(DispatchError::Rejected("ring buffer is full")),
            },
        }
    }

    /// Idempotent: stops intake, drains claimed items, joins workers.
    pub fn shutdown(&self) {
        self.ring.shutdown();
        if let Some(pool) = self.reserve.as_ref() {
            pool.shutdown();
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    #[inline]
    pub fn num_workers(&self) -> usize {
        self.ring.num_workers()
    }

    #[inline]
    pub fn reserve_workers(&self) -> usize {
        self.reserve.as_ref().map(|p| p.max_workers()).unwrap_or(0)
    }
}
