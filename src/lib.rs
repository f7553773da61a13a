//! # courier-rpc
//!
//! Client-side transport and task-dispatch core for service-oriented
//! systems: persistent TCP connections with automatic reconnection, frame
//! (de)serialization at the message boundary, and a bounded work-stealing
//! executor that keeps deserialization and user callbacks off the I/O path.
//!
//! ## Components
//!
//! - [dispatch]: the bounded MPMC ring executor with selectable
//!   [WaitStrategy] and an elastic reserve pool behind the
//!   [TaskDispatcher] façade
//! - [channel]: the identity-preserving [Channel] handle attached once per
//!   stream, and the per-address [ChannelGroup]
//! - [watchdog]: the [ConnectionWatchdog] state machine that rebinds an
//!   endpoint to a fresh stream after disconnects
//! - [connector]: the [Connector] bootstrap (socket options, sync/async
//!   connect) producing [Connection] handles
//! - [pipeline]: the handlers installed on every stream (per-connection
//!   decoder, sharable encoder / response handler / idle trigger)
//! - [registry]: the pending-invocation map responses are delivered into
//!
//! ## Usage
//!
//! ```no_run
//! use courier_rpc::{ClientConfig, Connector, InvokeFuture};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let connector = Connector::new(ClientConfig::default())?;
//! let conn = connector.connect("127.0.0.1:8090", false).await?;
//! let channel = conn.group().next().expect("live channel");
//! let resp = InvokeFuture::submit(&channel, b"payload".to_vec()).wait().await?;
//! println!("result bytes: {:?}", resp.result);
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod codec;
pub mod config;
pub mod connector;
pub mod dispatch;
pub mod error;
mod net;
pub mod pipeline;
pub mod proto;
pub mod recycle;
pub mod registry;
pub mod watchdog;

pub use channel::{Channel, ChannelGroup, FutureListener, Stream};
pub use codec::{Codec, MsgpCodec};
pub use config::{ClientConfig, DispatcherConfig, TimeoutSetting};
pub use connector::{Bootstrap, Connection, Connector};
pub use dispatch::{Task, TaskDispatcher, WaitStrategy, MAX_NUM_WORKERS};
pub use error::{ConnectError, DispatchError, FrameError, InvokeError};
pub use proto::{Frame, FrameKind, ResponseEnvelope, ResultWrapper};
pub use recycle::ResponseTask;
pub use registry::InvokeFuture;
pub use watchdog::{ConnectionWatchdog, EndpointState};
