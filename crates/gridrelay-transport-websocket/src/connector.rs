//! WebSocket connector bound to a local source address

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use gridrelay_transport::{
    FrameConnector, FrameLink, FrameSender, InboundFrame, OutboundFrame, TransportError,
    TransportResult,
};
use rustls::pki_types::ServerName;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig as WsProtocolConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::MaybeTlsStream;
use tracing::{debug, error, trace};
use url::Url;

use crate::config::WebSocketConfig;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens `ws://`/`wss://` links from a chosen local address
pub struct WebSocketConnector {
    tls_connector: TlsConnector,
    config: Arc<WebSocketConfig>,
}

impl std::fmt::Debug for WebSocketConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnector")
            .field("verify_server_cert", &self.config.verify_server_cert)
            .finish()
    }
}

impl WebSocketConnector {
    pub fn new(config: Arc<WebSocketConfig>) -> TransportResult<Self> {
        config.validate()?;

        let tls_connector = TlsConnector::from(config.build_tls_config()?);

        debug!("WebSocket connector created");

        Ok(Self {
            tls_connector,
            config,
        })
    }

    async fn handshake(&self, url: &Url, local_addr: IpAddr) -> TransportResult<WsStream> {
        let secure = match url.scheme() {
            "wss" => true,
            "ws" => false,
            other => {
                return Err(TransportError::ConfigurationError(format!(
                    "Unsupported scheme '{}' in {}",
                    other, url
                )))
            }
        };

        let host = url
            .host_str()
            .ok_or_else(|| TransportError::ConfigurationError(format!("No host in {}", url)))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| TransportError::ConfigurationError(format!("No port in {}", url)))?;

        let remote = resolve_remote(host, port, local_addr).await?;
        let tcp_stream = connect_from(local_addr, remote).await?;

        let stream = if secure {
            let dns_name = ServerName::try_from(host.to_string())
                .map_err(|e| TransportError::TlsError(format!("Invalid server name: {}", e)))?;

            let tls_stream = self
                .tls_connector
                .connect(dns_name, tcp_stream)
                .await
                .map_err(|e| TransportError::TlsError(format!("TLS handshake failed: {}", e)))?;

            MaybeTlsStream::Rustls(tls_stream)
        } else {
            MaybeTlsStream::Plain(tcp_stream)
        };

        let mut ws_config = WsProtocolConfig::default();
        ws_config.max_message_size = Some(self.config.max_message_size);

        let (ws_stream, _response) =
            tokio_tungstenite::client_async_with_config(url.as_str(), stream, Some(ws_config))
                .await
                .map_err(|e| {
                    TransportError::ProtocolError(format!("WebSocket handshake failed: {}", e))
                })?;

        Ok(ws_stream)
    }

    /// Writer task - drains queued frames into the WebSocket
    async fn writer_task(
        mut sink: SplitSink<WsStream, Message>,
        mut rx: mpsc::Receiver<OutboundFrame>,
        link_id: String,
    ) {
        while let Some(frame) = rx.recv().await {
            match frame {
                OutboundFrame::Text(text) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        error!("[{}] WebSocket send error: {}", link_id, e);
                        break;
                    }
                }
                OutboundFrame::Close => {
                    debug!("[{}] Closing WebSocket", link_id);
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }

        let _ = sink.close().await;
        debug!("[{}] WebSocket writer task ended", link_id);
    }

    /// Reader task - forwards WebSocket messages as inbound frames
    async fn reader_task(
        mut source: SplitStream<WsStream>,
        tx: mpsc::Sender<TransportResult<InboundFrame>>,
        link_id: String,
    ) {
        let mut closed = InboundFrame::Closed {
            code: None,
            reason: String::new(),
        };

        while let Some(msg) = source.next().await {
            let frame = match msg {
                Ok(Message::Text(text)) => InboundFrame::Text(text),
                Ok(Message::Binary(data)) => InboundFrame::Binary(data),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {
                    trace!("[{}] Control frame", link_id);
                    continue;
                }
                Ok(Message::Close(frame)) => {
                    debug!("[{}] WebSocket close received", link_id);
                    if let Some(frame) = frame {
                        closed = InboundFrame::Closed {
                            code: Some(u16::from(frame.code)),
                            reason: frame.reason.into_owned(),
                        };
                    }
                    break;
                }
                Err(e) => {
                    let _ = tx
                        .send(Err(TransportError::ConnectionError(e.to_string())))
                        .await;
                    debug!("[{}] WebSocket reader task ended with error", link_id);
                    return;
                }
            };

            if tx.send(Ok(frame)).await.is_err() {
                debug!("[{}] Link receiver dropped", link_id);
                return;
            }
        }

        let _ = tx.send(Ok(closed)).await;
        debug!("[{}] WebSocket reader task ended", link_id);
    }
}

#[async_trait]
impl FrameConnector for WebSocketConnector {
    async fn connect(&self, endpoint: &str, local_addr: IpAddr) -> TransportResult<FrameLink> {
        let url = Url::parse(endpoint)
            .map_err(|e| TransportError::ConfigurationError(format!("Invalid URL: {}", e)))?;

        debug!("Connecting to {} from {}", url, local_addr);

        let ws_stream = tokio::time::timeout(
            self.config.connect_timeout,
            self.handshake(&url, local_addr),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;

        let link_id = format!("{}->{}", local_addr, url.host_str().unwrap_or_default());
        let (sink, source) = ws_stream.split();

        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.queue_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.queue_capacity);

        tokio::spawn(Self::writer_task(sink, outbound_rx, link_id.clone()));
        tokio::spawn(Self::reader_task(source, inbound_tx, link_id));

        Ok(FrameLink::new(FrameSender::new(outbound_tx), inbound_rx))
    }

    fn name(&self) -> &str {
        "WebSocket"
    }
}

/// Resolve `host:port` to an address of the same family as the source address
async fn resolve_remote(host: &str, port: u16, local_addr: IpAddr) -> TransportResult<SocketAddr> {
    let mut candidates = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| TransportError::ConnectionError(format!("DNS lookup for {} failed: {}", host, e)))?;

    candidates
        .find(|addr| addr.is_ipv4() == local_addr.is_ipv4())
        .ok_or_else(|| {
            TransportError::ConnectionError(format!(
                "{} has no address reachable from {}",
                host, local_addr
            ))
        })
}

/// Open a TCP connection whose source address is `local_addr`
async fn connect_from(local_addr: IpAddr, remote: SocketAddr) -> TransportResult<TcpStream> {
    let socket = if local_addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    socket.bind(SocketAddr::new(local_addr, 0)).map_err(|e| {
        TransportError::ConnectionError(format!("Failed to bind {}: {}", local_addr, e))
    })?;

    socket
        .connect(remote)
        .await
        .map_err(|e| TransportError::ConnectionError(format!("TCP connect failed: {}", e)))
}
