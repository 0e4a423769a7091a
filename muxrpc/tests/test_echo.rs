use std::sync::Arc;

use muxrpc::{
    Client, ClientOptions, ErrorKind, MsgpackSerializer, Protocol, ResourceLimits, Server,
    ServerOptions,
};

#[tokio::test]
async fn test_echo() {
    let proto = Arc::new(Protocol::new(MsgpackSerializer));
    let echo = proto.register(1, |(x,): (u32,)| async move { Ok::<_, String>(x ^ 0xA5A5_A5A5) });

    let server = Server::create(proto, ResourceLimits::default(), ServerOptions::default());
    let addr = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let client = Client::connect(addr, ClientOptions::default(), MsgpackSerializer)
        .await
        .unwrap();
    let rsp = echo.call(&client, (0x0102_0304,)).await.unwrap();
    assert_eq!(rsp, 0xA4A7_A6A1);

    for i in 0..10u32 {
        assert_eq!(echo.call(&client, (i,)).await.unwrap(), i ^ 0xA5A5_A5A5);
    }

    let stats = client.stats();
    assert_eq!(stats.sent_messages, 11);
    assert_eq!(stats.replied, 11);
    assert_eq!(stats.exception_received, 0);
    assert_eq!(stats.pending, 0);

    client.stop().await;
    assert_eq!(
        echo.call(&client, (1,)).await.unwrap_err().kind,
        ErrorKind::Closed
    );
    server.stop().await;
}

#[tokio::test]
async fn test_concurrent_calls_share_one_connection() {
    let proto = Arc::new(Protocol::new(MsgpackSerializer));
    let double = proto.register(1, |(x,): (u64,)| async move {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        Ok::<_, String>(x * 2)
    });

    let server = Server::create(proto, ResourceLimits::default(), ServerOptions::default());
    let addr = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let client = Client::connect(addr, ClientOptions::default(), MsgpackSerializer)
        .await
        .unwrap();

    let mut tasks = vec![];
    for i in 0..32u64 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            double.call(&client, (i,)).await.unwrap()
        }));
    }
    for (i, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await.unwrap(), i as u64 * 2);
    }

    client.stop().await;
    server.stop().await;
}
