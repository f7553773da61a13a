#![allow(dead_code)]

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use captains_log::*;
use rstest::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;

use courier_rpc::proto::{FrameHead, FRAME_HEAD_LEN};
use courier_rpc::{Codec, Frame, FrameKind, MsgpCodec, ResultWrapper};

pub fn log_setup() {
    recipe::raw_file_logger("/tmp/courier_rpc_test.log", Level::Trace)
        .test()
        .build()
        .expect("log");
}

#[fixture]
pub fn runner() -> TestRunner {
    TestRunner::new()
}

pub struct TestRunner {
    rt: Runtime,
}

impl fmt::Debug for TestRunner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "")
    }
}

impl TestRunner {
    pub fn new() -> Self {
        log_setup();
        Self {
            rt: tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .enable_all()
                .build()
                .unwrap(),
        }
    }

    pub fn block_on<F: Future<Output = ()> + Send + 'static>(&self, f: F) {
        self.rt.block_on(f);
    }
}

/// Echo server: answers each request with its own payload wrapped in a
/// [ResultWrapper], and each ping with a pong.
pub struct TestServer {
    pub addr: String,
    accept: JoinHandle<()>,
    conns: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TestServer {
    pub async fn bind(addr: &str) -> TestServer {
        let sa: std::net::SocketAddr = addr.parse().expect("addr");
        let socket = if sa.is_ipv4() { TcpSocket::new_v4() } else { TcpSocket::new_v6() }.unwrap();
        socket.set_reuseaddr(true).unwrap();
        socket.bind(sa).unwrap();
        let listener = socket.listen(64).unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let conns = Arc::new(Mutex::new(Vec::new()));
        let accepted = conns.clone();
        let accept = tokio::spawn(async move {
            loop {
                let Ok((sock, _)) = listener.accept().await else { return };
                accepted.lock().unwrap().push(tokio::spawn(serve_conn(sock)));
            }
        });
        TestServer { addr, accept, conns }
    }

    /// Drop the listener and every live connection.
    pub fn kill(&self) {
        self.accept.abort();
        for conn in self.conns.lock().unwrap().drain(..) {
            conn.abort();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn serve_conn(mut sock: TcpStream) {
    let codec = MsgpCodec::default();
    let mut head_buf = [0u8; FRAME_HEAD_LEN];
    loop {
        if sock.read_exact(&mut head_buf).await.is_err() {
            return;
        }
        let (kind, seq, body_len) = match FrameHead::decode(&head_buf) {
            Ok(head) => {
                let kind = head.kind;
                let seq = head.seq;
                let body_len = head.body_len;
                (kind, seq, body_len as usize)
            }
            Err(_) => return,
        };
        let mut body = vec![0u8; body_len];
        if body_len > 0 && sock.read_exact(&mut body).await.is_err() {
            return;
        }
        let reply = match FrameKind::try_from(kind) {
            Ok(FrameKind::Request) => {
                let wrapper = ResultWrapper { error: None, value: body };
                Some(Frame::response(seq, codec.encode(&wrapper).expect("encode")))
            }
            Ok(FrameKind::Ping) => Some(Frame::pong(seq)),
            _ => None,
        };
        if let Some(frame) = reply {
            if sock.write_all(&frame.to_wire()).await.is_err() {
                return;
            }
        }
    }
}
