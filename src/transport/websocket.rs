//! WebSocket-tunneled transport.
//!
//! The TLS leg is established exactly as for the direct transport (same
//! trust verification, different ALPN), then the binary protocol is
//! tunneled through a WebSocket upgrade on that stream: one frame per
//! binary WebSocket message.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use crate::error::{Result, ServiceError};
use crate::wire::{self, Frame};

pub(crate) struct WebSocketTransport {
    ws: WebSocketStream<TlsStream<TcpStream>>,
}

impl WebSocketTransport {
    pub(crate) async fn connect(
        host: &str,
        port: u16,
        server_name: &str,
        path: &str,
        tls: Arc<ClientConfig>,
    ) -> Result<Self> {
        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|e| ServiceError::Connection(format!("TCP connect to {host}:{port}: {e}")))?;
        tcp.set_nodelay(true).ok();

        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| ServiceError::Configuration(format!("invalid server name: {server_name}")))?;

        let connector = TlsConnector::from(tls);
        let tls_stream = connector
            .connect(name, tcp)
            .await
            .map_err(|e| ServiceError::from_handshake(&e))?;

        let url = format!("wss://{server_name}:{port}{path}");
        let (ws, _response) = tokio_tungstenite::client_async(&url, tls_stream)
            .await
            .map_err(|e| ServiceError::Connection(format!("WebSocket upgrade failed: {e}")))?;

        tracing::debug!(host = %host, port = port, path = %path, "websocket transport connected");
        Ok(Self { ws })
    }

    pub(crate) async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let encoded = frame.encode()?;
        self.ws
            .send(WsMessage::Binary(encoded.to_vec()))
            .await
            .map_err(|e| ServiceError::Connection(format!("WebSocket send failed: {e}")))
    }

    pub(crate) async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            let msg = self
                .ws
                .next()
                .await
                .ok_or_else(|| ServiceError::Connection("connection closed by peer".into()))?
                .map_err(|e| ServiceError::Connection(format!("WebSocket receive failed: {e}")))?;

            match msg {
                WsMessage::Binary(data) => return wire::decode_buffer(&data),
                WsMessage::Ping(payload) => {
                    self.ws
                        .send(WsMessage::Pong(payload))
                        .await
                        .map_err(|e| ServiceError::Connection(format!("pong failed: {e}")))?;
                }
                WsMessage::Pong(_) => {}
                WsMessage::Close(_) => {
                    return Err(ServiceError::Connection("connection closed by peer".into()))
                }
                other => {
                    return Err(ServiceError::Protocol(format!(
                        "unexpected WebSocket message: {other:?}"
                    )))
                }
            }
        }
    }

    pub(crate) async fn shutdown(&mut self) -> Result<()> {
        // A failed close handshake means the peer is already gone.
        self.ws.close(None).await.ok();
        Ok(())
    }
}
