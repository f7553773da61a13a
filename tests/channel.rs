mod common;

use std::sync::{Arc, Barrier};

use rstest::*;

use common::{runner, TestRunner, TestServer};
use courier_rpc::{Channel, Stream};

#[rstest]
fn test_concurrent_attach(runner: TestRunner) {
    runner.block_on(async move {
        let server = TestServer::bind("127.0.0.1:0").await;
        let sock = tokio::net::TcpStream::connect(&server.addr).await.expect("connect");
        let stream = Stream::new(sock).expect("stream");

        let barrier = Arc::new(Barrier::new(16));
        let threads: Vec<_> = (0..16)
            .map(|_| {
                let stream = stream.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    Channel::attach(&stream)
                })
            })
            .collect();
        let handles: Vec<Channel> = threads.into_iter().map(|t| t.join().unwrap()).collect();

        let first = handles[0].clone();
        for h in &handles {
            assert_eq!(*h, first);
            assert_eq!(h.id(), first.id());
        }
        // attach stays idempotent afterwards
        assert_eq!(Channel::attach(&stream), first);
    });
}

#[rstest]
fn test_attach_is_per_stream(runner: TestRunner) {
    runner.block_on(async move {
        let server = TestServer::bind("127.0.0.1:0").await;
        let sock_a = tokio::net::TcpStream::connect(&server.addr).await.expect("connect");
        let sock_b = tokio::net::TcpStream::connect(&server.addr).await.expect("connect");
        let stream_a = Stream::new(sock_a).expect("stream");
        let stream_b = Stream::new(sock_b).expect("stream");

        let a = Channel::attach(&stream_a);
        let b = Channel::attach(&stream_b);
        assert_ne!(a, b);
        assert_ne!(a.id(), b.id());
        assert_eq!(a, a.clone());
    });
}

#[rstest]
fn test_channel_flags(runner: TestRunner) {
    runner.block_on(async move {
        let server = TestServer::bind("127.0.0.1:0").await;
        let sock = tokio::net::TcpStream::connect(&server.addr).await.expect("connect");
        let stream = Stream::new(sock).expect("stream");
        let channel = Channel::attach(&stream);

        assert!(channel.is_active());
        assert!(channel.is_writable());
        // the test thread is not the channel's I/O task
        assert!(!channel.is_io_task());
        assert_eq!(channel.peer_addr().to_string(), server.addr);
    });
}

#[rstest]
fn test_group_membership(runner: TestRunner) {
    runner.block_on(async move {
        let server = TestServer::bind("127.0.0.1:0").await;
        let group = courier_rpc::ChannelGroup::new(&server.addr);
        assert!(group.is_empty());
        assert!(group.next().is_none());

        let sock_a = tokio::net::TcpStream::connect(&server.addr).await.expect("connect");
        let sock_b = tokio::net::TcpStream::connect(&server.addr).await.expect("connect");
        let a = Channel::attach(&Stream::new(sock_a).expect("stream"));
        let b = Channel::attach(&Stream::new(sock_b).expect("stream"));

        assert!(group.add(a.clone()));
        assert!(!group.add(a.clone()), "same identity is not added twice");
        assert!(group.add(b.clone()));
        assert_eq!(group.len(), 2);

        let picks: Vec<Channel> =
            (0..4).map(|_| group.next().expect("round robin pick")).collect();
        assert!(picks.contains(&a) && picks.contains(&b));

        assert!(group.remove(&a));
        assert!(!group.remove(&a));
        assert_eq!(group.len(), 1);
    });
}

