use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::info;

use crate::channel::ChannelGroup;
use crate::config::ClientConfig;
use crate::dispatch::TaskDispatcher;
use crate::error::{ConnectError, DispatchError};
use crate::pipeline::{Encoder, IdleTrigger, ResponseHandler, SharedHandlers};
use crate::watchdog::{ConnectionWatchdog, EndpointState};

/// Socket options applied to every dial. Mutation goes through
/// [Connector::configure] under the connector's lock; each connect takes a
/// snapshot, so concurrent connects never race on the options.
#[derive(Clone, Debug)]
pub struct Bootstrap {
    pub reuse_addr: bool,
    pub connect_timeout: Duration,
    pub nodelay: bool,
    /// Dial through an explicitly configured socket (reuse-address applied
    /// before connect) instead of the portable plain connect.
    pub native_poll: bool,
}

impl Default for Bootstrap {
    fn default() -> Self {
        Self {
            reuse_addr: true,
            connect_timeout: Duration::from_millis(3000),
            nodelay: true,
            native_poll: cfg!(target_os = "linux"),
        }
    }
}

/// Client-side entry point: owns the executor, the sharable pipeline
/// handlers, the per-address channel groups and the bootstrap options.
pub struct Connector {
    executor: Arc<TaskDispatcher>,
    shared: Arc<SharedHandlers>,
    bootstrap: Mutex<Bootstrap>,
    groups: Mutex<HashMap<String, Arc<ChannelGroup>>>,
    watchdogs: Mutex<Vec<Arc<ConnectionWatchdog>>>,
}

impl Connector {
    pub fn new(config: ClientConfig) -> Result<Self, DispatchError> {
        let executor = Arc::new(TaskDispatcher::new(config.dispatcher.clone())?);
        let bootstrap =
            Bootstrap { connect_timeout: config.timeout.connect_timeout, ..Default::default() };
        let shared = Arc::new(SharedHandlers {
            encoder: Encoder::default(),
            handler: ResponseHandler::new(executor.clone()),
            idle_trigger: IdleTrigger::default(),
            timeout: config.timeout,
            writer_idle: config.writer_idle,
            write_high_watermark: config.write_high_watermark,
        });
        Ok(Self {
            executor,
            shared,
            bootstrap: Mutex::new(bootstrap),
            groups: Mutex::new(HashMap::new()),
            watchdogs: Mutex::new(Vec::new()),
        })
    }

    /// As [Connector::new], explicitly choosing the native or portable
    /// socket path.
    pub fn with_native(config: ClientConfig, native_poll: bool) -> Result<Self, DispatchError> {
        let connector = Self::new(config)?;
        connector.bootstrap.lock().unwrap().native_poll = native_poll;
        Ok(connector)
    }

    /// Adjust socket options; serialized against concurrent connects.
    pub fn configure(&self, f: impl FnOnce(&mut Bootstrap)) {
        f(&mut self.bootstrap.lock().unwrap());
    }

    /// The live-channel set for a remote address, created on first use.
    pub fn group(&self, addr: &str) -> Arc<ChannelGroup> {
        self.groups
            .lock()
            .unwrap()
            .entry(addr.to_string())
            .or_insert_with(|| ChannelGroup::new(addr))
            .clone()
    }

    #[inline]
    pub fn executor(&self) -> &Arc<TaskDispatcher> {
        &self.executor
    }

    /// Open a connection to `addr` with reconnect enabled.
    ///
    /// The synchronous path (`async_mode == false`) waits for the first
    /// attempt and propagates its failure; the asynchronous path returns at
    /// once, completion is observable through the channel group.
    pub async fn connect(&self, addr: &str, async_mode: bool) -> Result<Connection, ConnectError> {
        let group = self.group(addr);
        // snapshot under the bootstrap lock; the dial is awaited outside it
        let boot = self.bootstrap.lock().unwrap().clone();
        let watchdog = ConnectionWatchdog::new(boot, addr, group, self.shared.clone());
        watchdog.set_reconnect(true);
        self.watchdogs.lock().unwrap().push(watchdog.clone());
        if async_mode {
            watchdog.spawn_connect();
        } else {
            watchdog.connect().await?;
        }
        Ok(Connection { addr: addr.to_string(), watchdog })
    }

    /// Close every connection and stop the executor. Joins dispatcher
    /// workers, so call it from a context that may block briefly.
    pub fn shutdown(&self) {
        info!("connector shutting down");
        for wd in self.watchdogs.lock().unwrap().drain(..) {
            wd.shutdown();
        }
        self.executor.shutdown();
    }
}

/// Handle over one logical endpoint; the watchdog behind it keeps the
/// binding alive across disconnects.
pub struct Connection {
    addr: String,
    watchdog: Arc<ConnectionWatchdog>,
}

impl Connection {
    #[inline]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    #[inline]
    pub fn set_reconnect(&self, on: bool) {
        self.watchdog.set_reconnect(on);
    }

    #[inline]
    pub fn state(&self) -> EndpointState {
        self.watchdog.state()
    }

    #[inline]
    pub fn group(&self) -> &Arc<ChannelGroup> {
        self.watchdog.group()
    }

    /// Stop reconnecting and close the live stream, if any.
    pub fn close(&self) {
        self.watchdog.shutdown();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "connection[{} {}]", self.addr, self.watchdog.state())
    }
}
