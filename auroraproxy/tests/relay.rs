use std::net::SocketAddr;
use std::time::Duration;

use auroraproxy::proxy::{PlainConnector, ProxyServer, SessionConfig};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

const WAIT: Duration = Duration::from_secs(5);
const PATH: &str = "/student/arm/";

async fn start_proxy(upstream_port: u16) -> SocketAddr {
    let mut config = SessionConfig::new("127.0.0.1");
    config.path = PATH.to_string();
    let connector = PlainConnector::new("127.0.0.1", upstream_port);
    let server = ProxyServer::bind("127.0.0.1:0", config, connector)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    addr
}

async fn accept_upstream(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    tokio_tungstenite::accept_hdr_async(stream, |request: &Request, response: Response| {
        assert_eq!(request.uri().path(), PATH);
        assert_eq!(request.headers()["Host"], "127.0.0.1");
        assert_eq!(request.headers()["Origin"], "https://127.0.0.1");
        assert!(request.headers().get("Sec-WebSocket-Extensions").is_none());
        Ok::<_, ErrorResponse>(response)
    })
    .await
    .unwrap()
}

async fn connect_client(proxy: SocketAddr) -> WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>> {
    let (client, response) = tokio_tungstenite::connect_async(format!("ws://{proxy}{PATH}"))
        .await
        .unwrap();
    assert_eq!(response.status(), 101);
    client
}

async fn next<S>(ws: &mut WebSocketStream<S>) -> Message
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    timeout(WAIT, ws.next())
        .await
        .expect("timed out waiting for a message")
        .expect("stream ended")
        .expect("websocket error")
}

#[tokio::test]
async fn test_text_messages_are_relayed_both_ways() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy = start_proxy(upstream.local_addr().unwrap().port()).await;

    let mut client = connect_client(proxy).await;
    let mut server = accept_upstream(&upstream).await;

    client.send(Message::text("hello upstream")).await.unwrap();
    assert_eq!(next(&mut server).await, Message::text("hello upstream"));

    server.send(Message::text("hello client")).await.unwrap();
    assert_eq!(next(&mut client).await, Message::text("hello client"));
}

#[tokio::test]
async fn test_upstream_ping_is_answered_and_propagated() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy = start_proxy(upstream.local_addr().unwrap().port()).await;

    let mut client = connect_client(proxy).await;
    let mut server = accept_upstream(&upstream).await;

    server
        .send(Message::Ping(Bytes::from_static(&[1, 2, 3])))
        .await
        .unwrap();
    assert_eq!(
        next(&mut server).await,
        Message::Pong(Bytes::from_static(&[1, 2, 3]))
    );
    assert_eq!(next(&mut client).await, Message::Ping(Bytes::new()));
}

#[tokio::test]
async fn test_large_text_and_dropped_binary() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy = start_proxy(upstream.local_addr().unwrap().port()).await;

    let mut client = connect_client(proxy).await;
    let mut server = accept_upstream(&upstream).await;

    client
        .send(Message::binary(vec![0u8, 1, 2, 3]))
        .await
        .unwrap();
    let large = "x".repeat(200_000);
    client.send(Message::text(large.clone())).await.unwrap();

    assert_eq!(next(&mut server).await, Message::text(large));
}

#[tokio::test]
async fn test_listener_rearms_after_client_leaves() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy = start_proxy(upstream.local_addr().unwrap().port()).await;

    let mut client = connect_client(proxy).await;
    let mut server = accept_upstream(&upstream).await;
    client.send(Message::text("first")).await.unwrap();
    assert_eq!(next(&mut server).await, Message::text("first"));

    drop(client);
    let ended = timeout(WAIT, server.next()).await.unwrap();
    assert!(matches!(ended, None | Some(Err(_))));

    let mut client = connect_client(proxy).await;
    let mut server = accept_upstream(&upstream).await;
    client.send(Message::text("second")).await.unwrap();
    assert_eq!(next(&mut server).await, Message::text("second"));
    server.send(Message::text("reply")).await.unwrap();
    assert_eq!(next(&mut client).await, Message::text("reply"));
}

#[tokio::test]
async fn test_unreachable_upstream_drops_client() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = upstream.local_addr().unwrap().port();
    drop(upstream);
    let proxy = start_proxy(port).await;

    // The client handshake may or may not complete before the upstream
    // failure tears the session down; either way the stream must end.
    if let Ok((mut client, _)) = tokio_tungstenite::connect_async(format!("ws://{proxy}{PATH}")).await {
        let ended = timeout(WAIT, client.next()).await.unwrap();
        assert!(matches!(ended, None | Some(Err(_))));
    }
}
