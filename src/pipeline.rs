//! Pipeline entries installed on every new stream, in order: watchdog,
//! idle checker, idle trigger, decoder, encoder, response handler. The
//! decoder is per-connection (it holds framing state); everything else is a
//! sharable singleton reused across streams.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use crossfire::{AsyncRx, MAsyncRx};
use log::{debug, error, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::{timeout, Instant};
use zerocopy::AsBytes;

use crate::channel::{Channel, FutureListener, Stream, StreamIo, WriteOp, IO_CHANNEL};
use crate::config::TimeoutSetting;
use crate::dispatch::TaskDispatcher;
use crate::error::FrameError;
use crate::proto::{Frame, FrameHead, FrameKind, ResponseEnvelope, FRAME_HEAD_LEN};
use crate::recycle::ResponseTask;
use crate::registry;
use crate::watchdog::ConnectionWatchdog;

/// Per-connection inbound framing: buffers socket bytes and cuts complete
/// frames. Holds state across reads, never shared between streams.
pub struct Decoder {
    buf: BytesMut,
    read_timeout: Duration,
}

impl Decoder {
    pub fn new(read_timeout: Duration) -> Self {
        Self { buf: BytesMut::with_capacity(8 * 1024), read_timeout }
    }

    /// Read until one complete frame is buffered. Blocks without timeout
    /// while idle between frames; once a partial frame is pending the read
    /// timeout applies.
    pub async fn read_frame(&mut self, io: &mut OwnedReadHalf) -> Result<Frame, FrameError> {
        loop {
            if let Some(frame) = self.try_decode()? {
                return Ok(frame);
            }
            let mid_frame = !self.buf.is_empty();
            let n = if mid_frame && !self.read_timeout.is_zero() {
                match timeout(self.read_timeout, io.read_buf(&mut self.buf)).await {
                    Ok(r) => r?,
                    Err(_) => return Err(FrameError::Timeout),
                }
            } else {
                io.read_buf(&mut self.buf).await?
            };
            if n == 0 {
                return Err(FrameError::Eof);
            }
        }
    }

    fn try_decode(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.len() < FRAME_HEAD_LEN {
            return Ok(None);
        }
        let (kind, seq, body_len) = {
            let head = FrameHead::decode(&self.buf[..FRAME_HEAD_LEN])?;
            (FrameKind::try_from(head.kind)?, head.seq, head.body_len as usize)
        };
        if self.buf.len() < FRAME_HEAD_LEN + body_len {
            self.buf.reserve(FRAME_HEAD_LEN + body_len - self.buf.len());
            return Ok(None);
        }
        self.buf.advance(FRAME_HEAD_LEN);
        let body = self.buf.split_to(body_len).to_vec();
        Ok(Some(Frame { kind, seq, body }))
    }
}

/// Stateless outbound framing, shared across streams.
#[derive(Default)]
pub struct Encoder();

impl Encoder {
    pub async fn write_frame(
        &self, io: &mut BufWriter<OwnedWriteHalf>, frame: &Frame, write_timeout: Duration,
    ) -> io::Result<()> {
        let head = frame.head();
        write_all_timeout(io, head.as_bytes(), write_timeout).await?;
        if !frame.body.is_empty() {
            write_all_timeout(io, &frame.body, write_timeout).await?;
        }
        Ok(())
    }
}

async fn write_all_timeout(
    io: &mut BufWriter<OwnedWriteHalf>, buf: &[u8], write_timeout: Duration,
) -> io::Result<()> {
    if write_timeout.is_zero() {
        io.write_all(buf).await
    } else {
        match timeout(write_timeout, io.write_all(buf)).await {
            Ok(r) => r,
            Err(_) => Err(io::ErrorKind::TimedOut.into()),
        }
    }
}

async fn flush_timeout(
    io: &mut BufWriter<OwnedWriteHalf>, write_timeout: Duration,
) -> io::Result<()> {
    if write_timeout.is_zero() {
        io.flush().await
    } else {
        match timeout(write_timeout, io.flush()).await {
            Ok(r) => r,
            Err(_) => Err(io::ErrorKind::TimedOut.into()),
        }
    }
}

/// Terminal inbound handler, shared across streams: wraps each response
/// into a pooled task and hands it to the executor so deserialization and
/// user callbacks stay off the I/O task.
pub struct ResponseHandler {
    executor: Arc<TaskDispatcher>,
}

impl ResponseHandler {
    pub fn new(executor: Arc<TaskDispatcher>) -> Self {
        Self { executor }
    }

    pub fn channel_read(&self, channel: &Channel, frame: Frame) {
        match frame.kind {
            FrameKind::Response => {
                let envelope = ResponseEnvelope::new(frame.seq, frame.body);
                let task = ResponseTask::acquire(channel.clone(), envelope);
                if let Err(e) = self.executor.execute(task) {
                    error!("{} response seq {} dropped: {}", channel, frame.seq, e);
                }
            }
            FrameKind::Ping => {
                channel.write(Frame::pong(frame.seq));
            }
            FrameKind::Pong => {
                debug!("{} pong seq {}", channel, frame.seq);
            }
            FrameKind::Request => {
                warn!("{} unexpected request frame seq {}", channel, frame.seq);
            }
        }
    }
}

/// Writer-idle trigger, shared across streams: pings after a quiet period
/// so half-dead connections are noticed before a request strands on them.
#[derive(Default)]
pub struct IdleTrigger();

impl IdleTrigger {
    pub fn on_writer_idle(&self, channel: &Channel) {
        debug!("{} writer idle, sending ping", channel);
        channel.write(Frame::ping(registry::next_seq()));
    }
}

/// The sharable pipeline singletons one connector owns.
pub(crate) struct SharedHandlers {
    pub encoder: Encoder,
    pub handler: ResponseHandler,
    pub idle_trigger: IdleTrigger,
    pub timeout: TimeoutSetting,
    pub writer_idle: Duration,
    pub write_high_watermark: usize,
}

static EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);

fn now_millis() -> u64 {
    EPOCH.elapsed().as_millis() as u64
}

/// Wire a fresh stream up: split the socket and spawn the reader, writer
/// and idle-checker tasks under the channel's I/O scope. The reader owns
/// stream teardown and reports to the watchdog.
pub(crate) fn install(
    stream: Arc<Stream>, channel: Channel, shared: Arc<SharedHandlers>,
    watchdog: Arc<ConnectionWatchdog>,
) {
    let Some(io) = stream.take_io() else {
        warn!("{} pipeline already installed", channel);
        return;
    };
    let StreamIo { socket, write_rx, close_rx } = io;
    channel.set_write_high_watermark(shared.write_high_watermark);
    let (rd, wr) = socket.into_split();
    let last_write = Arc::new(AtomicU64::new(now_millis()));

    {
        let channel = channel.clone();
        let shared = shared.clone();
        let last_write = last_write.clone();
        let id = channel.id();
        tokio::spawn(IO_CHANNEL.scope(id, async move {
            writer_loop(BufWriter::new(wr), write_rx, channel, shared, last_write).await;
        }));
    }
    {
        let channel = channel.clone();
        let shared = shared.clone();
        let id = channel.id();
        tokio::spawn(IO_CHANNEL.scope(id, async move {
            if let Err(e) = reader_loop(rd, close_rx, &channel, &shared).await {
                debug!("{} reader exits: {}", channel, e);
            }
            channel.set_inactive();
            channel.shutdown_writer();
            watchdog.channel_inactive(&channel).await;
            // keeps the attribute slot alive for the stream's whole life
            drop(stream);
        }));
    }
    tokio::spawn(idle_loop(channel, last_write, shared));
}

async fn reader_loop(
    mut rd: OwnedReadHalf, close_rx: MAsyncRx<()>, channel: &Channel, shared: &SharedHandlers,
) -> Result<(), FrameError> {
    let mut decoder = Decoder::new(shared.timeout.read_timeout);
    loop {
        tokio::select! {
            r = decoder.read_frame(&mut rd) => {
                let frame = r?;
                shared.handler.channel_read(channel, frame);
            }
            _ = close_rx.recv() => {
                debug!("{} close requested", channel);
                return Ok(());
            }
        }
    }
}

async fn writer_loop(
    mut wr: BufWriter<OwnedWriteHalf>, rx: AsyncRx<WriteOp>, channel: Channel,
    shared: Arc<SharedHandlers>, last_write: Arc<AtomicU64>,
) {
    let write_timeout = shared.timeout.write_timeout;
    'serve: loop {
        let first = match rx.recv().await {
            Ok(op) => op,
            Err(_) => return,
        };
        let mut ops = vec![first];
        while ops.len() < 64 {
            match rx.try_recv() {
                Ok(op) => ops.push(op),
                Err(_) => break,
            }
        }
        let mut listeners: Vec<FutureListener> = Vec::new();
        let mut close_op: Option<Option<FutureListener>> = None;
        let mut failed = false;
        for op in ops {
            match op {
                WriteOp::Frame(frame, listener) => {
                    if failed || close_op.is_some() {
                        channel.sub_pending(frame.wire_len());
                        if let Some(l) = listener {
                            l(&channel, false);
                        }
                        continue;
                    }
                    let r = shared.encoder.write_frame(&mut wr, &frame, write_timeout).await;
                    channel.sub_pending(frame.wire_len());
                    match r {
                        Ok(()) => {
                            if let Some(l) = listener {
                                listeners.push(l);
                            }
                        }
                        Err(e) => {
                            warn!("{} write failed: {}", channel, e);
                            failed = true;
                            if let Some(l) = listener {
                                l(&channel, false);
                            }
                        }
                    }
                }
                WriteOp::Close(listener) => {
                    close_op = Some(listener);
                }
            }
        }
        let mut ok = !failed;
        if ok {
            if let Err(e) = flush_timeout(&mut wr, write_timeout).await {
                warn!("{} flush failed: {}", channel, e);
                ok = false;
                failed = true;
            }
        }
        for l in listeners {
            l(&channel, ok);
        }
        if ok {
            last_write.store(now_millis(), Ordering::Relaxed);
        }
        if let Some(listener) = close_op {
            let r = wr.shutdown().await;
            if let Some(l) = listener {
                l(&channel, r.is_ok());
            }
            channel.signal_close();
            break 'serve;
        }
        if failed {
            channel.signal_close();
            break 'serve;
        }
    }
    // fail whatever is still queued so no listener is stranded
    while let Ok(op) = rx.try_recv() {
        match op {
            WriteOp::Frame(frame, listener) => {
                channel.sub_pending(frame.wire_len());
                if let Some(l) = listener {
                    l(&channel, false);
                }
            }
            WriteOp::Close(listener) => {
                if let Some(l) = listener {
                    l(&channel, true);
                }
            }
        }
    }
}

async fn idle_loop(channel: Channel, last_write: Arc<AtomicU64>, shared: Arc<SharedHandlers>) {
    let idle = shared.writer_idle;
    if idle.is_zero() {
        return;
    }
    let period = std::cmp::max(idle / 2, Duration::from_millis(500));
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        if !channel.is_active() {
            return;
        }
        let quiet = now_millis().saturating_sub(last_write.load(Ordering::Relaxed));
        if quiet >= idle.as_millis() as u64 {
            shared.idle_trigger.on_writer_idle(&channel);
        }
    }
}
