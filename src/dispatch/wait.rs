use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Consumer park strategies, performance from low to high:
///
/// `Blocking` parks on a condition variable and the producer signals on every
/// publish. Slowest wake-up, lowest CPU, the most consistent behaviour across
/// deployments. The default.
///
/// `LiteBlocking` is `Blocking` with the signal elided whenever the producer
/// can prove no consumer is parked.
///
/// `PhasedBackoff` spins for a bounded period, yields for a bounded period,
/// then falls back to the blocking path.
///
/// `Sleeping` spins with a ~60us park between iterations. The producing side
/// pays nothing; mean hand-off latency is higher. Fits asynchronous logging
/// style workloads.
///
/// `Yielding` busy spins with a cooperative yield each iteration. Use when
/// worker threads are fewer than logical cores.
///
/// `BusySpin` is a pure busy spin, the fastest and the most demanding: worker
/// threads must be fewer than physical cores.
#[derive(strum::Display, Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitStrategy {
    Blocking,
    LiteBlocking,
    PhasedBackoff,
    Sleeping,
    Yielding,
    BusySpin,
}

const PHASED_SPIN_TIMEOUT: Duration = Duration::from_millis(1);
const PHASED_YIELD_TIMEOUT: Duration = Duration::from_millis(1);
const SLEEP_PARK: Duration = Duration::from_micros(60);
const PRE_PARK_SPINS: u32 = 100;

/// One waiter is shared by all consumers of a ring; producers signal through
/// the same object after a publish.
pub(crate) struct Waiter {
    strategy: WaitStrategy,
    lock: Mutex<()>,
    cond: Condvar,
    parked: AtomicUsize,
}

impl Waiter {
    pub fn new(strategy: WaitStrategy) -> Self {
        Self { strategy, lock: Mutex::new(()), cond: Condvar::new(), parked: AtomicUsize::new(0) }
    }

    #[inline]
    pub fn strategy(&self) -> WaitStrategy {
        self.strategy
    }

    /// Park the calling consumer until `ready()` holds. `ready` must observe
    /// every publish that `signal` announces (it reads the ring cursors).
    pub fn wait_for<F: Fn() -> bool>(&self, ready: F) {
        match self.strategy {
            WaitStrategy::Blocking | WaitStrategy::LiteBlocking => self.block_on(&ready),
            WaitStrategy::PhasedBackoff => {
                let start = Instant::now();
                loop {
                    if ready() {
                        return;
                    }
                    let waited = start.elapsed();
                    if waited < PHASED_SPIN_TIMEOUT {
                        std::hint::spin_loop();
                    } else if waited < PHASED_SPIN_TIMEOUT + PHASED_YIELD_TIMEOUT {
                        std::thread::yield_now();
                    } else {
                        self.block_on(&ready);
                        return;
                    }
                }
            }
            WaitStrategy::Sleeping => {
                let mut spins = 0u32;
                loop {
                    if ready() {
                        return;
                    }
                    if spins < PRE_PARK_SPINS {
                        spins += 1;
                        std::hint::spin_loop();
                    } else {
                        std::thread::sleep(SLEEP_PARK);
                    }
                }
            }
            WaitStrategy::Yielding => loop {
                if ready() {
                    return;
                }
                std::thread::yield_now();
            },
            WaitStrategy::BusySpin => loop {
                if ready() {
                    return;
                }
                std::hint::spin_loop();
            },
        }
    }

    fn block_on<F: Fn() -> bool>(&self, ready: &F) {
        let mut guard = self.lock.lock().unwrap();
        // The parked count must be visible before the final readiness check,
        // so a producer publishing in between cannot skip the signal.
        self.parked.fetch_add(1, Ordering::SeqCst);
        while !ready() {
            guard = self.cond.wait(guard).unwrap();
        }
        self.parked.fetch_sub(1, Ordering::SeqCst);
    }

    /// Publish-side hook. Cheap for the spinning strategies.
    #[inline]
    pub fn signal(&self) {
        match self.strategy {
            WaitStrategy::Blocking | WaitStrategy::PhasedBackoff => {
                let _guard = self.lock.lock().unwrap();
                self.cond.notify_all();
            }
            WaitStrategy::LiteBlocking => {
                if self.parked.load(Ordering::SeqCst) > 0 {
                    let _guard = self.lock.lock().unwrap();
                    self.cond.notify_all();
                }
            }
            _ => {}
        }
    }

    /// Shutdown hook: wake every parked consumer regardless of strategy.
    pub fn signal_all(&self) {
        let _guard = self.lock.lock().unwrap();
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    fn wakes_up(strategy: WaitStrategy) {
        let waiter = Arc::new(Waiter::new(strategy));
        let flag = Arc::new(AtomicBool::new(false));
        let t = {
            let waiter = waiter.clone();
            let flag = flag.clone();
            std::thread::spawn(move || {
                waiter.wait_for(|| flag.load(Ordering::Acquire));
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        flag.store(true, Ordering::Release);
        waiter.signal();
        t.join().expect("waiter thread");
    }

    #[test]
    fn test_all_strategies_wake() {
        for s in [
            WaitStrategy::Blocking,
            WaitStrategy::LiteBlocking,
            WaitStrategy::PhasedBackoff,
            WaitStrategy::Sleeping,
            WaitStrategy::Yielding,
            WaitStrategy::BusySpin,
        ] {
            wakes_up(s);
        }
    }

    #[test]
    fn test_ready_short_circuit() {
        let waiter = Waiter::new(WaitStrategy::Blocking);
        waiter.wait_for(|| true);
    }
}
