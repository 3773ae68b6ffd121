//! End-to-end test of a plain ws:// link against a local tungstenite server

use futures_util::{SinkExt, StreamExt};
use gridrelay_transport::{FrameConnector, InboundFrame};
use gridrelay_transport_websocket::{WebSocketConfig, WebSocketConnector};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

#[tokio::test]
async fn test_text_frames_and_close_code() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (stream, peer) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        let first = ws.next().await.unwrap().unwrap();
        assert_eq!(first, Message::Text("{\"action\":\"PING\"}".to_string()));

        ws.send(Message::Text("{\"action\":\"PONG\"}".to_string()))
            .await
            .unwrap();
        ws.send(Message::Close(Some(CloseFrame {
            code: CloseCode::Away,
            reason: "maintenance".into(),
        })))
        .await
        .unwrap();

        peer
    });

    let connector = WebSocketConnector::new(Arc::new(WebSocketConfig::client_default())).unwrap();
    let local: IpAddr = "127.0.0.1".parse().unwrap();
    let link = connector
        .connect(&format!("ws://127.0.0.1:{}/", port), local)
        .await
        .unwrap();
    let (sender, mut receiver) = link.into_parts();

    sender
        .send_text("{\"action\":\"PING\"}".to_string())
        .await
        .unwrap();

    let frame = receiver.recv().await.unwrap().unwrap();
    assert_eq!(frame, InboundFrame::Text("{\"action\":\"PONG\"}".to_string()));

    let closed = receiver.recv().await.unwrap().unwrap();
    assert_eq!(
        closed,
        InboundFrame::Closed {
            code: Some(1001),
            reason: "maintenance".to_string()
        }
    );

    let peer = server.await.unwrap();
    assert_eq!(peer.ip(), local);
}

#[tokio::test]
async fn test_connection_refused_is_an_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let connector = WebSocketConnector::new(Arc::new(WebSocketConfig::client_default())).unwrap();
    let result = connector
        .connect(
            &format!("ws://127.0.0.1:{}/", port),
            "127.0.0.1".parse().unwrap(),
        )
        .await;

    assert!(result.is_err());
}
