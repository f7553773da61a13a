use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::channel::{Channel, ChannelGroup, Stream};
use crate::connector::Bootstrap;
use crate::error::ConnectError;
use crate::net;
use crate::pipeline::{self, SharedHandlers};
use crate::registry;

/// Connection lifecycle of one logical endpoint. At most one live stream is
/// bound at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[repr(u8)]
pub enum EndpointState {
    Idle = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
    Closed = 4,
}

impl EndpointState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Reconnecting,
            _ => Self::Closed,
        }
    }
}

const RECONNECT_CAP_SECS: u64 = 30;

/// Delay before retry `n`: 1s doubling up to the cap.
fn backoff_delay(n: u32) -> Duration {
    Duration::from_secs((1u64 << n.min(5)).min(RECONNECT_CAP_SECS))
}

/// Owns the reconnect policy for one `(endpoint, channel group)` pair.
///
/// Rebinds the logical endpoint to a fresh stream after disconnects,
/// reinstalling the full pipeline each time, and keeps the channel group in
/// step (add on connect, remove on close). Failed dials are retried under
/// the same policy as lost connections. Sharable across the streams it
/// creates over time; all coordination goes through one atomic state.
pub struct ConnectionWatchdog {
    boot: Bootstrap,
    addr: String,
    group: Arc<ChannelGroup>,
    shared: Arc<SharedHandlers>,
    state: AtomicU8,
    reconnect: AtomicBool,
    attempts: AtomicU32,
}

impl ConnectionWatchdog {
    pub(crate) fn new(
        boot: Bootstrap, addr: &str, group: Arc<ChannelGroup>, shared: Arc<SharedHandlers>,
    ) -> Arc<Self> {
        Arc::new(Self {
            boot,
            addr: addr.to_string(),
            group,
            shared,
            state: AtomicU8::new(EndpointState::Idle as u8),
            reconnect: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
        })
    }

    /// Idempotent, observable immediately by any in-flight retry.
    #[inline]
    pub fn set_reconnect(&self, on: bool) {
        self.reconnect.store(on, Ordering::SeqCst);
    }

    #[inline]
    pub fn reconnect_enabled(&self) -> bool {
        self.reconnect.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn state(&self) -> EndpointState {
        EndpointState::from_u8(self.state.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    #[inline]
    pub fn group(&self) -> &Arc<ChannelGroup> {
        &self.group
    }

    /// Stop reconnecting and close whatever is live. Any state goes to
    /// `Closed`.
    pub fn shutdown(&self) {
        self.reconnect.store(false, Ordering::SeqCst);
        self.state.store(EndpointState::Closed as u8, Ordering::SeqCst);
        for channel in self.group.snapshot() {
            channel.close();
        }
    }

    /// One connect attempt. On success the pipeline is installed and the
    /// group updated before returning; on failure the retry policy takes
    /// over (when enabled) and the error still propagates to the caller.
    pub(crate) async fn connect(self: &Arc<Self>) -> Result<Channel, ConnectError> {
        if self.state() == EndpointState::Closed {
            return Err(ConnectError::Closed);
        }
        self.state.store(EndpointState::Connecting as u8, Ordering::SeqCst);
        match net::dial(&self.boot, &self.addr).await {
            Ok(socket) => match Stream::new(socket) {
                Ok(stream) => {
                    let channel = Channel::attach(&stream);
                    self.state.store(EndpointState::Connected as u8, Ordering::SeqCst);
                    self.attempts.store(0, Ordering::SeqCst);
                    self.group.add(channel.clone());
                    info!("connects to {}: {}", self.addr, channel);
                    pipeline::install(stream, channel.clone(), self.shared.clone(), self.clone());
                    Ok(channel)
                }
                Err(e) => {
                    warn!("connects to {} failed: {}", self.addr, e);
                    self.on_connect_failure();
                    Err(e.into())
                }
            },
            Err(e) => {
                warn!("connects to {} failed: {}", self.addr, e);
                self.on_connect_failure();
                Err(e)
            }
        }
    }

    pub(crate) fn spawn_connect(self: &Arc<Self>) {
        let wd = self.clone();
        tokio::spawn(async move {
            let _ = wd.connect().await;
        });
    }

    fn on_connect_failure(self: &Arc<Self>) {
        if self.state() == EndpointState::Closed {
            return;
        }
        if self.reconnect_enabled() {
            self.state.store(EndpointState::Reconnecting as u8, Ordering::SeqCst);
            self.schedule_retry();
        } else {
            self.state.store(EndpointState::Closed as u8, Ordering::SeqCst);
        }
    }

    fn schedule_retry(self: &Arc<Self>) {
        let n = self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = backoff_delay(n);
        debug!("{} retry #{} in {:?}", self.addr, n + 1, delay);
        let wd = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if wd.reconnect_enabled() && wd.state() != EndpointState::Closed {
                wd.spawn_connect();
            }
        });
    }

    /// Reader teardown path: the stream died or was closed. Drops the
    /// handle from the group, fails its pending invocations, then either
    /// schedules the next attempt or settles in `Closed`.
    pub(crate) async fn channel_inactive(self: &Arc<Self>, channel: &Channel) {
        info!("{} inactive", channel);
        self.group.remove(channel);
        registry::purge_channel(channel.id());
        if self.state() == EndpointState::Closed {
            return;
        }
        if self.reconnect_enabled() {
            self.state.store(EndpointState::Reconnecting as u8, Ordering::SeqCst);
            self.schedule_retry();
        } else {
            self.state.store(EndpointState::Closed as u8, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_bounded() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(4), Duration::from_secs(16));
        assert_eq!(backoff_delay(5), Duration::from_secs(30));
        assert_eq!(backoff_delay(100), Duration::from_secs(30));
    }

    #[test]
    fn test_state_roundtrip() {
        for s in [
            EndpointState::Idle,
            EndpointState::Connecting,
            EndpointState::Connected,
            EndpointState::Reconnecting,
            EndpointState::Closed,
        ] {
            assert_eq!(EndpointState::from_u8(s as u8), s);
        }
    }
}
