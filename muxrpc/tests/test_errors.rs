use std::sync::Arc;

use muxrpc::{
    Client, ClientOptions, ErrorKind, MsgpackSerializer, Protocol, ResourceLimits, Server,
    ServerOptions,
};

#[tokio::test]
async fn test_unknown_verb() {
    let proto = Arc::new(Protocol::new(MsgpackSerializer));
    let echo = proto.register(1, |(x,): (u32,)| async move { Ok::<_, String>(x) });

    let server = Server::create(proto.clone(), ResourceLimits::default(), ServerOptions::default());
    let addr = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let client = Client::connect(addr, ClientOptions::default(), MsgpackSerializer)
        .await
        .unwrap();

    let missing = proto.client::<(), u64>(42);
    let err = missing.call(&client, ()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::UnknownVerb);
    assert_eq!(err.msg, "42");

    // Unknown verbs fail only their call; the connection stays usable.
    assert_eq!(echo.call(&client, (7,)).await.unwrap(), 7);

    let stats = client.stats();
    assert_eq!(stats.exception_received, 1);
    assert_eq!(stats.replied, 1);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_user_exception() {
    let proto = Arc::new(Protocol::new(MsgpackSerializer));
    let boom = proto.register(1, |(): ()| async move { Err::<u32, _>("boom") });
    let echo = proto.register(2, |(x,): (u32,)| async move { Ok::<_, String>(x) });

    let server = Server::create(proto, ResourceLimits::default(), ServerOptions::default());
    let addr = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let client = Client::connect(addr, ClientOptions::default(), MsgpackSerializer)
        .await
        .unwrap();

    let err = boom.call(&client, ()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Remote);
    assert_eq!(err.msg, "boom");

    // Handler errors fail only their call.
    assert_eq!(echo.call(&client, (3,)).await.unwrap(), 3);
    let err = boom.call(&client, ()).await.unwrap_err();
    assert_eq!(err.msg, "boom");

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_missing_required_argument_surfaces_remotely() {
    let proto = Arc::new(Protocol::new(MsgpackSerializer));
    let _concat = proto.register(1, |(a, b): (u32, String)| async move {
        Ok::<_, String>(format!("{a}{b}"))
    });

    let server = Server::create(proto.clone(), ResourceLimits::default(), ServerOptions::default());
    let addr = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let client = Client::connect(addr, ClientOptions::default(), MsgpackSerializer)
        .await
        .unwrap();

    // A caller that omits a non-optional trailing argument.
    let short = proto.client::<(u32,), String>(1);
    let err = short.call(&client, (5,)).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Remote);
    assert!(err.msg.contains("missing non-optional argument"));

    client.stop().await;
    server.stop().await;
}
