use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{debug, error};

use super::wait::Waiter;
use super::{Task, WaitStrategy};

#[repr(align(64))]
struct CachePadded<T> {
    value: T,
}

impl<T> CachePadded<T> {
    const fn new(value: T) -> Self {
        CachePadded { value }
    }
}

/// Slot protocol: `sequence == ticket` means the slot is writable by the
/// producer holding `ticket`; `sequence == ticket + 1` means it is readable
/// by the consumer holding `ticket`; after the value is moved out the
/// sequence jumps ahead by the capacity. A slot therefore is empty, owned by
/// exactly one producer, or readable by exactly one consumer; the consumer
/// moves the value out before advancing, so no reference lingers in the
/// cell.
struct Slot<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

unsafe impl<T: Send> Send for Slot<T> {}
unsafe impl<T: Send> Sync for Slot<T> {}

pub(crate) struct RingBuffer<T> {
    slots: Box<[Slot<T>]>,
    mask: usize,
    tail: CachePadded<AtomicUsize>,
    head: CachePadded<AtomicUsize>,
}

unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

impl<T> RingBuffer<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity >= 1 && capacity.is_power_of_two());
        let mut slots = Vec::with_capacity(capacity);
        for i in 0..capacity {
            slots.push(Slot {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            });
        }
        Self {
            slots: slots.into_boxed_slice(),
            mask: capacity - 1,
            tail: CachePadded::new(AtomicUsize::new(0)),
            head: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tail.value.load(Ordering::Acquire) == self.head.value.load(Ordering::Acquire)
    }

    /// Claim the next producer sequence if capacity permits, write and
    /// publish. Non-blocking: a full ring hands the value back untouched.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        loop {
            let head = self.head.value.load(Ordering::Acquire);
            let tail = self.tail.value.load(Ordering::Relaxed);
            if tail.wrapping_sub(head) >= self.slots.len() {
                return Err(value);
            }
            if self
                .tail
                .value
                .compare_exchange_weak(
                    tail,
                    tail.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                let slot = &self.slots[tail & self.mask];
                while slot.sequence.load(Ordering::Acquire) != tail {
                    std::hint::spin_loop();
                }
                unsafe { (*slot.value.get()).write(value) };
                slot.sequence.store(tail.wrapping_add(1), Ordering::Release);
                return Ok(());
            }
            std::hint::spin_loop();
        }
    }

    /// Work-pool take: each published value is handed to exactly one caller.
    pub fn try_pop(&self) -> Option<T> {
        loop {
            let tail = self.tail.value.load(Ordering::Acquire);
            let head = self.head.value.load(Ordering::Relaxed);
            if tail == head {
                return None;
            }
            if self
                .head
                .value
                .compare_exchange_weak(
                    head,
                    head.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                let slot = &self.slots[head & self.mask];
                while slot.sequence.load(Ordering::Acquire) != head.wrapping_add(1) {
                    std::hint::spin_loop();
                }
                let value = unsafe { (*slot.value.get()).assume_init_read() };
                slot.sequence.store(head.wrapping_add(self.slots.len()), Ordering::Release);
                return Some(value);
            }
            std::hint::spin_loop();
        }
    }

    /// Fast path when a single consumer owns the read cursor: no CAS.
    pub fn pop_single(&self) -> Option<T> {
        let head = self.head.value.load(Ordering::Relaxed);
        let slot = &self.slots[head & self.mask];
        if slot.sequence.load(Ordering::Acquire) != head.wrapping_add(1) {
            return None;
        }
        let value = unsafe { (*slot.value.get()).assume_init_read() };
        slot.sequence.store(head.wrapping_add(self.slots.len()), Ordering::Release);
        self.head.value.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }
}

impl<T> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        let tail = self.tail.value.load(Ordering::Relaxed);
        let mut pos = self.head.value.load(Ordering::Relaxed);
        while pos != tail {
            let slot = &self.slots[pos & self.mask];
            unsafe { (*slot.value.get()).assume_init_drop() };
            pos = pos.wrapping_add(1);
        }
    }
}

/// Bounded MPMC work queue with a fixed pool of consumer threads.
///
/// `dispatch` never blocks and never allocates on the rejection path;
/// consumers park according to the configured [WaitStrategy]. Any panic
/// escaping an item is absorbed and logged, a worker thread never dies.
pub struct RingDispatcher {
    inner: Arc<DispatchShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    num_workers: usize,
}

struct DispatchShared {
    ring: RingBuffer<Box<dyn Task>>,
    waiter: Waiter,
    shutdown: AtomicBool,
    single_consumer: bool,
}

impl DispatchShared {
    fn worker_loop(&self) {
        loop {
            let taken =
                if self.single_consumer { self.ring.pop_single() } else { self.ring.try_pop() };
            if let Some(task) = taken {
                self.run_item(task);
                continue;
            }
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            self.waiter
                .wait_for(|| !self.ring.is_empty() || self.shutdown.load(Ordering::Acquire));
        }
    }

    fn run_item(&self, task: Box<dyn Task>) {
        if let Err(e) = std::panic::catch_unwind(AssertUnwindSafe(move || task.run())) {
            if let Some(msg) = e.downcast_ref::<&str>() {
                error!("dispatcher task panicked: {}", msg);
            } else if let Some(msg) = e.downcast_ref::<String>() {
                error!("dispatcher task panicked: {}", msg);
            } else {
                error!("dispatcher task panicked");
            }
        }
    }
}

impl RingDispatcher {
    /// `num_workers` and `capacity` must already be normalized by the caller
    /// (worker count clamped, capacity a power of two).
    pub(crate) fn new(
        num_workers: usize, thread_name: &str, capacity: usize, strategy: WaitStrategy,
    ) -> Self {
        let inner = Arc::new(DispatchShared {
            ring: RingBuffer::with_capacity(capacity),
            waiter: Waiter::new(strategy),
            shutdown: AtomicBool::new(false),
            single_consumer: num_workers == 1,
        });
        let mut workers = Vec::with_capacity(num_workers);
        for i in 0..num_workers {
            let shared = inner.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", thread_name, i))
                .spawn(move || shared.worker_loop())
                .expect("spawn dispatcher worker");
            workers.push(handle);
        }
        debug!(
            "ring dispatcher up: {} workers, capacity {}, {} wait",
            num_workers,
            capacity,
            inner.waiter.strategy()
        );
        Self { inner, workers: Mutex::new(workers), num_workers }
    }

    /// Claim, write and publish in one call. `Err` hands the task back when
    /// the ring is out of capacity or the dispatcher has shut down.
    pub fn dispatch(&self, task: Box<dyn Task>) -> Result<(), Box<dyn Task>> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(task);
        }
        match self.inner.ring.try_push(task) {
            Ok(()) => {
                self.inner.waiter.signal();
                Ok(())
            }
            Err(task) => Err(task),
        }
    }

    /// Stop intake, drain published items, join the workers. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.waiter.signal_all();
        let handles: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for h in handles {
            let _ = h.join();
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.ring.capacity()
    }

    #[inline]
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }
}

impl Drop for RingDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
