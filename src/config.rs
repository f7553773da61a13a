use std::sync::LazyLock;
use std::time::Duration;

use crate::dispatch::WaitStrategy;

/// Process-wide default for the dispatcher worker count, read once at
/// startup. Falls back to the number of available cores.
pub static DEFAULT_NUM_WORKERS: LazyLock<i32> = LazyLock::new(|| {
    std::env::var("COURIER_EXECUTOR_NUM_WORKERS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| {
            std::thread::available_parallelism().map(|n| n.get() as i32).unwrap_or(1)
        })
});

/// Process-wide default for the ring capacity, read once at startup.
pub static DEFAULT_BUF_SIZE: LazyLock<usize> = LazyLock::new(|| {
    std::env::var("COURIER_EXECUTOR_BUF_SIZE")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(32768)
});

/// Construction parameters of the task dispatcher.
#[derive(Clone)]
pub struct DispatcherConfig {
    /// Worker count. Passed through `abs()` and clamped to
    /// `[1, MAX_NUM_WORKERS]`; negative inputs are accepted, zero means one.
    pub num_workers: i32,
    /// Prefix for named worker threads.
    pub thread_name: String,
    /// Ring capacity, rounded up to the next power of two. Zero is invalid.
    pub buf_size: usize,
    /// Max threads of the overflow reserve pool; zero disables the reserve.
    pub num_reserve_workers: usize,
    /// How consumers park when the ring is empty.
    pub wait_strategy: WaitStrategy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            num_workers: *DEFAULT_NUM_WORKERS,
            thread_name: "task.dispatcher".to_string(),
            buf_size: *DEFAULT_BUF_SIZE,
            num_reserve_workers: 0,
            wait_strategy: WaitStrategy::Blocking,
        }
    }
}

#[derive(Clone)]
pub struct ClientConfig {
    pub timeout: TimeoutSetting,
    pub dispatcher: DispatcherConfig,
    /// Outbound bytes queued beyond this make the channel non-writable.
    pub write_high_watermark: usize,
    /// Quiet period on the write side before an idle ping is sent.
    pub writer_idle: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: TimeoutSetting::default(),
            dispatcher: DispatcherConfig::default(),
            write_high_watermark: 64 * 1024,
            writer_idle: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Copy)]
pub struct TimeoutSetting {
    /// Bound on establishing a connection.
    pub connect_timeout: Duration,
    /// Socket read timeout, applied while the middle of a frame is pending.
    pub read_timeout: Duration,
    /// Socket write timeout.
    pub write_timeout: Duration,
}

impl Default for TimeoutSetting {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(3000),
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
        }
    }
}
