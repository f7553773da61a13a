use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{LazyLock, Mutex};

use crossfire::{spsc, AsyncRx, Tx};
use log::debug;

use crate::channel::Channel;
use crate::error::InvokeError;
use crate::proto::{Frame, ResponseEnvelope};

static INVOKE_SEQ: AtomicU64 = AtomicU64::new(1);

static PENDING: LazyLock<Mutex<HashMap<u64, PendingCall>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

struct PendingCall {
    channel_id: u32,
    tx: Tx<ResponseEnvelope>,
}

/// Next process-unique invocation sequence, stamped into request frames.
#[inline]
pub fn next_seq() -> u64 {
    INVOKE_SEQ.fetch_add(1, Ordering::Relaxed)
}

/// The waiting side of one outstanding invocation.
pub struct InvokeFuture {
    seq: u64,
    rx: AsyncRx<ResponseEnvelope>,
}

impl InvokeFuture {
    /// Register interest in `seq` before the request leaves the process.
    pub fn register(seq: u64, channel: &Channel) -> Self {
        let (tx, rx) = spsc::bounded_tx_blocking_rx_async::<ResponseEnvelope>(1);
        PENDING.lock().unwrap().insert(seq, PendingCall { channel_id: channel.id(), tx });
        Self { seq, rx }
    }

    /// Register, then enqueue the request on the channel. A write that
    /// cannot complete fails the invocation instead of stranding it.
    pub fn submit(channel: &Channel, payload: Vec<u8>) -> Self {
        let seq = next_seq();
        let fut = Self::register(seq, channel);
        channel.write_with(
            Frame::request(seq, payload),
            Box::new(move |ch, ok| {
                if !ok {
                    received(ch, ResponseEnvelope::failed(seq, InvokeError::Unreachable));
                }
            }),
        );
        fut
    }

    #[inline]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub async fn wait(self) -> Result<ResponseEnvelope, InvokeError> {
        match self.rx.recv().await {
            Ok(envelope) => match envelope.error {
                Some(e) => Err(e),
                None => Ok(envelope),
            },
            Err(_) => Err(InvokeError::Closed),
        }
    }
}

impl Drop for InvokeFuture {
    fn drop(&mut self) {
        // gone un-awaited: forget the pending entry
        PENDING.lock().unwrap().remove(&self.seq);
    }
}

/// Deliver an inbound response to whoever is waiting on its sequence.
/// Called from dispatcher workers; a response nobody waits for is dropped.
pub fn received(channel: &Channel, envelope: ResponseEnvelope) {
    let entry = PENDING.lock().unwrap().remove(&envelope.seq);
    match entry {
        Some(call) => {
            if call.channel_id != channel.id() {
                debug!(
                    "seq {} answered by {} but was sent on channel {:08x}",
                    envelope.seq,
                    channel,
                    call.channel_id
                );
            }
            let _ = call.tx.send(envelope);
        }
        None => {
            debug!("{} no pending invocation for seq {}", channel, envelope.seq);
        }
    }
}

/// Fail every invocation still waiting on a channel that went inactive.
pub fn purge_channel(channel_id: u32) {
    let purged: Vec<(u64, PendingCall)> = {
        let mut pending = PENDING.lock().unwrap();
        let seqs: Vec<u64> = pending
            .iter()
            .filter(|(_, call)| call.channel_id == channel_id)
            .map(|(seq, _)| *seq)
            .collect();
        seqs.into_iter().filter_map(|seq| pending.remove(&seq).map(|c| (seq, c))).collect()
    };
    for (seq, call) in purged {
        let _ = call.tx.send(ResponseEnvelope::failed(seq, InvokeError::Unreachable));
    }
}
