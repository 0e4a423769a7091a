use std::{sync::Arc, time::Duration};

use muxrpc::{
    Client, ClientOptions, ErrorKind, MsgpackSerializer, Protocol, ResourceLimits, Server,
    ServerOptions,
};
use tokio_util::sync::CancellationToken;

fn slow_proto() -> (
    Arc<Protocol<MsgpackSerializer>>,
    muxrpc::Stub<(u32,), u32>,
    muxrpc::Stub<(u32,), u32>,
) {
    let proto = Arc::new(Protocol::new(MsgpackSerializer));
    let slow = proto.register(1, |(x,): (u32,)| async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok::<_, String>(x)
    });
    let echo = proto.register(2, |(x,): (u32,)| async move { Ok::<_, String>(x) });
    (proto, slow, echo)
}

#[tokio::test]
async fn test_deadline_expiry() {
    let (proto, slow, echo) = slow_proto();
    let server = Server::create(proto, ResourceLimits::default(), ServerOptions::default());
    let addr = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let client = Client::connect(addr, ClientOptions::default(), MsgpackSerializer)
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let err = slow
        .call_with_timeout(&client, Duration::from_millis(50), (1,))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(40), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(300), "{elapsed:?}");
    assert_eq!(client.stats().timed_out, 1);
    assert_eq!(client.stats().pending, 0);

    // The late reply arrives afterwards and is silently discarded.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(echo.call(&client, (2,)).await.unwrap(), 2);
    assert_eq!(client.stats().replied, 1);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_cancellation() {
    let (proto, slow, echo) = slow_proto();
    let server = Server::create(proto, ResourceLimits::default(), ServerOptions::default());
    let addr = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let client = Client::connect(addr, ClientOptions::default(), MsgpackSerializer)
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel.cancel();
        });
    }
    let err = slow
        .call_cancellable(&client, &cancel, (1,))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Cancelled);
    assert_eq!(client.stats().pending, 0);

    // The wire request was not rescinded; the connection stays usable.
    assert_eq!(echo.call(&client, (9,)).await.unwrap(), 9);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_deadline_without_negotiated_timeout() {
    // The peer never sees expire_ms, but the client-local deadline still
    // fires.
    let (proto, slow, _echo) = slow_proto();
    let server = Server::create(proto, ResourceLimits::default(), ServerOptions::default());
    let addr = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let options = ClientOptions {
        send_timeout_data: false,
        ..ClientOptions::default()
    };
    let client = Client::connect(addr, options, MsgpackSerializer).await.unwrap();

    let err = slow
        .call_with_timeout(&client, Duration::from_millis(50), (1,))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);

    client.stop().await;
    server.stop().await;
}
