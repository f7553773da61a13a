use std::cell::RefCell;
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;

use crate::channel::Channel;
use crate::codec::{serializer, Codec};
use crate::dispatch::Task;
use crate::error::InvokeError;
use crate::proto::{ResponseEnvelope, ResultWrapper};
use crate::registry;

/// Cap on cached tasks per shard.
const MAX_POOLED: usize = 256;

type Shelf = Arc<Mutex<Vec<Box<ResponseTask>>>>;

/// Opaque token a task carries so it finds its way back to the pool shard
/// that created it, even when released on another thread.
struct RecycleHandle {
    origin: ThreadId,
    shelf: Shelf,
}

struct LocalPool {
    cache: Vec<Box<ResponseTask>>,
    /// cross-thread returns land here and are drained into `cache`
    shelf: Shelf,
}

thread_local! {
    static LOCAL: RefCell<LocalPool> = RefCell::new(LocalPool {
        cache: Vec::new(),
        shelf: Arc::new(Mutex::new(Vec::new())),
    });
}

/// The unit of work carrying `(channel, response)` from the I/O task to a
/// dispatcher worker. Pooled: obtain with [ResponseTask::acquire]; after
/// `run` both fields are cleared and the allocation returns to the pool on
/// every exit path.
pub struct ResponseTask {
    channel: Option<Channel>,
    response: Option<ResponseEnvelope>,
    handle: RecycleHandle,
}

impl ResponseTask {
    pub fn acquire(channel: Channel, response: ResponseEnvelope) -> Box<ResponseTask> {
        LOCAL.with(|p| {
            let mut pool = p.borrow_mut();
            if pool.cache.is_empty() {
                let LocalPool { cache, shelf } = &mut *pool;
                cache.append(&mut shelf.lock().unwrap());
            }
            match pool.cache.pop() {
                Some(mut task) => {
                    task.channel = Some(channel);
                    task.response = Some(response);
                    task
                }
                None => Box::new(ResponseTask {
                    channel: Some(channel),
                    response: Some(response),
                    handle: RecycleHandle {
                        origin: std::thread::current().id(),
                        shelf: pool.shelf.clone(),
                    },
                }),
            }
        })
    }

    /// Both fields must already be cleared. Returns the allocation to the
    /// owning shard; a full shard simply drops it.
    fn recycle(self: Box<Self>) {
        debug_assert!(self.channel.is_none() && self.response.is_none());
        if std::thread::current().id() == self.handle.origin {
            LOCAL.with(|p| {
                let mut pool = p.borrow_mut();
                if pool.cache.len() < MAX_POOLED {
                    pool.cache.push(self);
                }
            });
        } else {
            let shelf = self.handle.shelf.clone();
            let mut parked = shelf.lock().unwrap();
            if parked.len() < MAX_POOLED {
                parked.push(self);
            }
        }
    }

    #[cfg(test)]
    fn as_ptr(task: &ResponseTask) -> *const ResponseTask {
        task as *const _
    }
}

impl Task for ResponseTask {
    /// Deserialize on the worker thread to keep the I/O task light, free the
    /// raw payload promptly, then notify the pending invocation.
    fn run(mut self: Box<Self>) {
        let channel = self.channel.take();
        let response = self.response.take();
        // fields are clear; give the allocation back before any fallible work
        self.recycle();
        let (Some(channel), Some(mut envelope)) = (channel, response) else {
            return;
        };
        if envelope.error.is_none() {
            if let Some(bytes) = envelope.bytes.take() {
                match serializer().decode::<ResultWrapper>(&bytes) {
                    Ok(wrapper) => envelope.result = Some(wrapper),
                    Err(()) => envelope.error = Some(InvokeError::Decode),
                }
            }
        }
        registry::received(&channel, envelope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, Stream};
    use crate::proto::ResponseEnvelope;

    fn socket_stream() -> (tokio::runtime::Runtime, Arc<Stream>) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let stream = rt.block_on(async {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let client = tokio::net::TcpStream::connect(addr).await.unwrap();
            let _peer = listener.accept().await.unwrap();
            Stream::new(client).unwrap()
        });
        (rt, stream)
    }

    #[test]
    fn test_pool_reuses_allocation() {
        let (_rt, stream) = socket_stream();
        let channel = Channel::attach(&stream);
        let task = ResponseTask::acquire(channel.clone(), ResponseEnvelope::new(1, Vec::new()));
        let ptr = ResponseTask::as_ptr(&task);
        // nothing is registered for seq 1; delivery is a no-op
        task.run();
        let task2 = ResponseTask::acquire(channel, ResponseEnvelope::new(2, Vec::new()));
        assert_eq!(ptr, ResponseTask::as_ptr(&task2));
        assert!(task2.channel.is_some());
        assert!(task2.response.is_some());
    }
}
