use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crossfire::{mpmc, mpsc, AsyncRx, MAsyncRx, MTx};
use tokio::net::TcpStream;

use crate::proto::Frame;

/// Completion callback for write/close, invoked with the channel and
/// whether the operation succeeded.
pub type FutureListener = Box<dyn FnOnce(&Channel, bool) + Send + 'static>;

pub(crate) enum WriteOp {
    Frame(Frame, Option<FutureListener>),
    Close(Option<FutureListener>),
}

static CHANNEL_SEQ: AtomicU32 = AtomicU32::new(1);

const DEFAULT_WRITE_HIGH_WATERMARK: usize = 64 * 1024;

/// One live TCP stream, from dial until its I/O tasks take it over, plus
/// the per-stream attribute slot the channel handle is attached through.
pub struct Stream {
    peer: SocketAddr,
    local: SocketAddr,
    write_tx: MTx<WriteOp>,
    close_tx: MTx<()>,
    io: Mutex<Option<StreamIo>>,
    attr: OnceLock<Channel>,
}

pub(crate) struct StreamIo {
    pub socket: TcpStream,
    pub write_rx: AsyncRx<WriteOp>,
    pub close_rx: MAsyncRx<()>,
}

impl Stream {
    pub fn new(socket: TcpStream) -> std::io::Result<Arc<Self>> {
        let peer = socket.peer_addr()?;
        let local = socket.local_addr()?;
        let (write_tx, write_rx) = mpsc::unbounded_async::<WriteOp>();
        let (close_tx, close_rx) = mpmc::unbounded_async::<()>();
        Ok(Arc::new(Self {
            peer,
            local,
            write_tx,
            close_tx,
            io: Mutex::new(Some(StreamIo { socket, write_rx, close_rx })),
            attr: OnceLock::new(),
        }))
    }

    /// Handed to the pipeline exactly once at install time.
    pub(crate) fn take_io(&self) -> Option<StreamIo> {
        self.io.lock().unwrap().take()
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "stream {} -> {}", self.local, self.peer)
    }
}

struct ChannelCore {
    id: u32,
    peer: SocketAddr,
    local: SocketAddr,
    write_tx: MTx<WriteOp>,
    close_tx: MTx<()>,
    active: AtomicBool,
    pending_bytes: AtomicUsize,
    write_high_watermark: AtomicUsize,
}

/// The identity-preserving handle over a live stream.
///
/// Obtained with [Channel::attach]; for any stream the attach returns the
/// same handle for the stream's lifetime, no matter how many callers race.
/// Clones share identity; equality and hash follow the underlying stream.
#[derive(Clone)]
pub struct Channel {
    core: Arc<ChannelCore>,
}

tokio::task_local! {
    /// Channel id the current I/O task serves, if any.
    pub(crate) static IO_CHANNEL: u32;
}

impl Channel {
    /// Get the unique handle for `stream`, creating it on the first call.
    /// Safe under concurrent callers: the per-stream slot is assigned once
    /// and racing callers all receive the winner.
    pub fn attach(stream: &Arc<Stream>) -> Channel {
        stream
            .attr
            .get_or_init(|| Channel {
                core: Arc::new(ChannelCore {
                    id: CHANNEL_SEQ.fetch_add(1, Ordering::Relaxed),
                    peer: stream.peer,
                    local: stream.local,
                    write_tx: stream.write_tx.clone(),
                    close_tx: stream.close_tx.clone(),
                    active: AtomicBool::new(true),
                    pending_bytes: AtomicUsize::new(0),
                    write_high_watermark: AtomicUsize::new(DEFAULT_WRITE_HIGH_WATERMARK),
                }),
            })
            .clone()
    }

    /// Short id, unique within the process (not globally), stable for the
    /// handle's life.
    #[inline]
    pub fn id(&self) -> u32 {
        self.core.id
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.core.active.load(Ordering::Acquire)
    }

    /// Honors the write-buffer watermark: false once queued output passes
    /// the high mark. Backpressure surfaces here, writes never block.
    #[inline]
    pub fn is_writable(&self) -> bool {
        self.core.pending_bytes.load(Ordering::Acquire)
            < self.core.write_high_watermark.load(Ordering::Relaxed)
    }

    /// True iff the caller runs inside this channel's own I/O tasks.
    #[inline]
    pub fn is_io_task(&self) -> bool {
        IO_CHANNEL.try_with(|id| *id == self.core.id).unwrap_or(false)
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.core.local
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.core.peer
    }

    /// Enqueue a write-and-flush.
    pub fn write(&self, frame: Frame) -> &Self {
        self.write_inner(frame, None);
        self
    }

    /// As [Channel::write]; on completion `listener` is invoked with
    /// whether the write (including the flush) succeeded.
    pub fn write_with(&self, frame: Frame, listener: FutureListener) -> &Self {
        self.write_inner(frame, Some(listener));
        self
    }

    fn write_inner(&self, frame: Frame, listener: Option<FutureListener>) {
        if !self.is_active() {
            if let Some(l) = listener {
                l(self, false);
            }
            return;
        }
        let len = frame.wire_len();
        self.core.pending_bytes.fetch_add(len, Ordering::AcqRel);
        if let Err(e) = self.core.write_tx.send(WriteOp::Frame(frame, listener)) {
            // writer task is gone
            self.core.pending_bytes.fetch_sub(len, Ordering::AcqRel);
            if let WriteOp::Frame(_, Some(l)) = e.0 {
                l(self, false);
            }
        }
    }

    /// Initiate close; non-blocking, returns self.
    pub fn close(&self) -> &Self {
        self.close_inner(None);
        self
    }

    /// As [Channel::close]; `listener` fires when the close completes.
    pub fn close_with(&self, listener: FutureListener) -> &Self {
        self.close_inner(Some(listener));
        self
    }

    fn close_inner(&self, listener: Option<FutureListener>) {
        let _ = self.core.close_tx.send(());
        if let Err(e) = self.core.write_tx.send(WriteOp::Close(listener)) {
            // already torn down; close of a closed channel still completes
            if let WriteOp::Close(Some(l)) = e.0 {
                l(self, true);
            }
        }
    }

    pub(crate) fn set_inactive(&self) {
        self.core.active.store(false, Ordering::Release);
    }

    pub(crate) fn sub_pending(&self, len: usize) {
        self.core.pending_bytes.fetch_sub(len, Ordering::AcqRel);
    }

    pub(crate) fn set_write_high_watermark(&self, mark: usize) {
        self.core.write_high_watermark.store(mark, Ordering::Relaxed);
    }

    pub(crate) fn signal_close(&self) {
        let _ = self.core.close_tx.send(());
    }

    /// Reader-teardown path: stop the writer task even though user handles
    /// may still be alive.
    pub(crate) fn shutdown_writer(&self) {
        let _ = self.core.write_tx.send(WriteOp::Close(None));
    }
}

impl PartialEq for Channel {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl Eq for Channel {}

impl std::hash::Hash for Channel {
    #[inline]
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.core.id.hash(state);
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "channel[{:08x} {} -> {}]", self.core.id, self.core.local, self.core.peer)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// The set of live channels sharing one remote address. The watchdog adds
/// on connect and removes on close; pick with [ChannelGroup::next].
pub struct ChannelGroup {
    addr: String,
    channels: Mutex<Vec<Channel>>,
    index: AtomicUsize,
}

impl ChannelGroup {
    pub fn new(addr: &str) -> Arc<Self> {
        Arc::new(Self {
            addr: addr.to_string(),
            channels: Mutex::new(Vec::new()),
            index: AtomicUsize::new(0),
        })
    }

    #[inline]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn add(&self, channel: Channel) -> bool {
        let mut chans = self.channels.lock().unwrap();
        if chans.iter().any(|c| *c == channel) {
            return false;
        }
        chans.push(channel);
        true
    }

    pub fn remove(&self, channel: &Channel) -> bool {
        let mut chans = self.channels.lock().unwrap();
        let before = chans.len();
        chans.retain(|c| c != channel);
        chans.len() != before
    }

    /// Round-robin pick of a live channel.
    pub fn next(&self) -> Option<Channel> {
        let chans = self.channels.lock().unwrap();
        if chans.is_empty() {
            return None;
        }
        let i = self.index.fetch_add(1, Ordering::Relaxed) % chans.len();
        Some(chans[i].clone())
    }

    pub fn snapshot(&self) -> Vec<Channel> {
        self.channels.lock().unwrap().clone()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.channels.lock().unwrap().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for ChannelGroup {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "group[{} x{}]", self.addr, self.len())
    }
}
