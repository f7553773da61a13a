mod common;

use std::time::Duration;

use rstest::*;
use tokio::time::sleep;

use common::{runner, TestRunner, TestServer};
use courier_rpc::{ClientConfig, ConnectError, Connector, EndpointState, Frame, InvokeFuture};

async fn wait_for_channel(group: &courier_rpc::ChannelGroup, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if !group.is_empty() {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}

#[rstest]
fn test_roundtrip_and_reconnect(runner: TestRunner) {
    runner.block_on(async move {
        let server = TestServer::bind("127.0.0.1:0").await;
        let addr = server.addr.clone();

        let connector = Connector::new(ClientConfig::default()).expect("connector");
        let conn = connector.connect(&addr, false).await.expect("connect");
        let group = conn.group().clone();
        assert_eq!(conn.state(), EndpointState::Connected);
        assert_eq!(group.len(), 1);

        let old = group.next().expect("live channel");
        let resp =
            InvokeFuture::submit(&old, b"hello".to_vec()).wait().await.expect("roundtrip");
        assert_eq!(resp.result.expect("result").value, b"hello");

        // kill the server, restart it on the same port after 500ms
        server.kill();
        drop(server);
        sleep(Duration::from_millis(500)).await;
        let _server2 = TestServer::bind(&addr).await;

        // backoff starts at 1s: a fresh handle must appear within backoff + 1s
        assert!(
            wait_for_channel(&group, Duration::from_secs(3)).await,
            "no reconnect within backoff window"
        );
        let fresh = group.next().expect("fresh channel");
        assert_ne!(fresh, old);
        assert_ne!(fresh.id(), old.id());
        assert!(!old.is_active());
        assert!(fresh.is_active());

        // the rebuilt pipeline serves invocations again
        let resp =
            InvokeFuture::submit(&fresh, b"again".to_vec()).wait().await.expect("roundtrip");
        assert_eq!(resp.result.expect("result").value, b"again");

        connector.shutdown();
    });
}

#[rstest]
fn test_no_reconnect_when_disabled(runner: TestRunner) {
    runner.block_on(async move {
        let server = TestServer::bind("127.0.0.1:0").await;
        let addr = server.addr.clone();

        let connector = Connector::new(ClientConfig::default()).expect("connector");
        let conn = connector.connect(&addr, false).await.expect("connect");
        let group = conn.group().clone();
        conn.set_reconnect(false);
        conn.set_reconnect(false);

        server.kill();
        drop(server);
        sleep(Duration::from_secs(2)).await;

        assert!(group.is_empty(), "no handle may come back");
        assert_eq!(conn.state(), EndpointState::Closed);

        connector.shutdown();
    });
}

#[rstest]
fn test_async_connect_observed_through_group(runner: TestRunner) {
    runner.block_on(async move {
        let server = TestServer::bind("127.0.0.1:0").await;
        let addr = server.addr.clone();

        let connector = Connector::new(ClientConfig::default()).expect("connector");
        let conn = connector.connect(&addr, true).await.expect("connect returns at once");
        let group = conn.group().clone();
        assert!(wait_for_channel(&group, Duration::from_secs(3)).await, "async connect");
        assert_eq!(conn.state(), EndpointState::Connected);

        connector.shutdown();
    });
}

#[rstest]
fn test_sync_connect_failure(runner: TestRunner) {
    runner.block_on(async move {
        // grab a port, then free it so the dial is refused
        let probe = TestServer::bind("127.0.0.1:0").await;
        let addr = probe.addr.clone();
        drop(probe);
        sleep(Duration::from_millis(50)).await;

        let connector = Connector::new(ClientConfig::default()).expect("connector");
        match connector.connect(&addr, false).await {
            Err(ConnectError::Failed(_)) | Err(ConnectError::Timeout) => {}
            other => panic!("expected connect failure, got {:?}", other.map(|c| c.state())),
        }
        connector.shutdown();
    });
}

#[rstest]
fn test_pending_invocations_fail_on_disconnect(runner: TestRunner) {
    runner.block_on(async move {
        let server = TestServer::bind("127.0.0.1:0").await;
        let addr = server.addr.clone();

        let connector = Connector::new(ClientConfig::default()).expect("connector");
        let conn = connector.connect(&addr, false).await.expect("connect");
        conn.set_reconnect(false);
        let channel = conn.group().next().expect("live channel");

        // kill before submitting; the write goes nowhere and the pending
        // invocation must fail instead of hanging
        server.kill();
        drop(server);
        sleep(Duration::from_millis(200)).await;

        let r = InvokeFuture::submit(&channel, b"void".to_vec()).wait().await;
        assert!(r.is_err(), "invocation on a dead channel must fail");

        connector.shutdown();
    });
}

#[rstest]
fn test_writer_idle_ping(runner: TestRunner) {
    runner.block_on(async move {
        let server = TestServer::bind("127.0.0.1:0").await;
        let addr = server.addr.clone();

        let mut config = ClientConfig::default();
        config.writer_idle = Duration::from_millis(200);
        let connector = Connector::new(config).expect("connector");
        let conn = connector.connect(&addr, false).await.expect("connect");
        let channel = conn.group().next().expect("live channel");

        // stay quiet long enough for several idle pings; the connection must
        // survive them and still serve requests
        sleep(Duration::from_secs(1)).await;
        assert!(channel.is_active());
        let resp =
            InvokeFuture::submit(&channel, b"after idle".to_vec()).wait().await.expect("call");
        assert_eq!(resp.result.expect("result").value, b"after idle");

        connector.shutdown();
    });
}

#[rstest]
fn test_write_listener_reports_completion(runner: TestRunner) {
    runner.block_on(async move {
        let server = TestServer::bind("127.0.0.1:0").await;
        let addr = server.addr.clone();

        let connector = Connector::new(ClientConfig::default()).expect("connector");
        let conn = connector.connect(&addr, false).await.expect("connect");
        let channel = conn.group().next().expect("live channel");

        let (tx, rx) = std::sync::mpsc::channel::<bool>();
        channel.write_with(
            Frame::ping(courier_rpc::registry::next_seq()),
            Box::new(move |_ch, ok| {
                let _ = tx.send(ok);
            }),
        );
        let ok = rx.recv_timeout(Duration::from_secs(5)).expect("listener fired");
        assert!(ok, "write on a live channel completes");

        let (tx, rx) = std::sync::mpsc::channel::<bool>();
        channel.close_with(Box::new(move |_ch, ok| {
            let _ = tx.send(ok);
        }));
        let ok = rx.recv_timeout(Duration::from_secs(5)).expect("close listener fired");
        assert!(ok);

        connector.shutdown();
    });
}
