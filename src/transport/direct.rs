//! Direct binary-protocol transport: frames straight over a TLS stream.

use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::error::{Result, ServiceError};
use crate::wire::{self, Frame};

pub(crate) struct DirectTransport {
    stream: TlsStream<TcpStream>,
}

impl DirectTransport {
    /// Establishes TCP + TLS to `host:port`, verifying the hub's
    /// certificate for `server_name` before any frame is exchanged.
    pub(crate) async fn connect(
        host: &str,
        port: u16,
        server_name: &str,
        tls: Arc<ClientConfig>,
    ) -> Result<Self> {
        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|e| ServiceError::Connection(format!("TCP connect to {host}:{port}: {e}")))?;
        tcp.set_nodelay(true).ok();

        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| ServiceError::Configuration(format!("invalid server name: {server_name}")))?;

        let connector = TlsConnector::from(tls);
        let stream = connector
            .connect(name, tcp)
            .await
            .map_err(|e| ServiceError::from_handshake(&e))?;

        tracing::debug!(host = %host, port = port, "direct transport connected");
        Ok(Self { stream })
    }

    pub(crate) async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        wire::write_frame(&mut self.stream, frame).await
    }

    pub(crate) async fn read_frame(&mut self) -> Result<Frame> {
        wire::read_frame(&mut self.stream).await
    }

    pub(crate) async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
