//! Transport selection and the two wire transports.
//!
//! [`Protocol`] picks between the direct binary-protocol connection and the
//! same frames tunneled through a WebSocket upgrade; both run over a
//! trust-verified TLS stream built from the client's
//! [`TrustConfig`](crate::TrustConfig).

pub(crate) mod direct;
pub(crate) mod websocket;

use crate::error::Result;
use crate::wire::Frame;

pub(crate) use direct::DirectTransport;
pub(crate) use websocket::WebSocketTransport;

/// Default port for the direct binary protocol.
pub const DIRECT_PORT: u16 = 9550;
/// Default port for the WebSocket-tunneled variant.
pub const WEBSOCKET_PORT: u16 = 443;
/// ALPN identifier for the direct binary protocol.
pub const DIRECT_ALPN: &[u8] = b"hubmsg/1";
/// ALPN for the HTTP upgrade leg of the WebSocket variant.
pub const WEBSOCKET_ALPN: &[u8] = b"http/1.1";
/// Request path of the WebSocket messaging endpoint.
pub const WEBSOCKET_PATH: &str = "/messaging";

/// Wire transport variant, chosen once at client construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Binary protocol frames directly over TLS.
    Direct,
    /// The same frames as binary messages inside a WebSocket, itself over TLS.
    WebSocket,
}

/// Connection parameters derived from a [`Protocol`]. Pure data; computed
/// once during open.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TransportParams {
    pub default_port: u16,
    pub websocket: bool,
    pub alpn: &'static [u8],
    pub ws_path: &'static str,
}

impl Protocol {
    pub(crate) fn params(self) -> TransportParams {
        match self {
            Self::Direct => TransportParams {
                default_port: DIRECT_PORT,
                websocket: false,
                alpn: DIRECT_ALPN,
                ws_path: "",
            },
            Self::WebSocket => TransportParams {
                default_port: WEBSOCKET_PORT,
                websocket: true,
                alpn: WEBSOCKET_ALPN,
                ws_path: WEBSOCKET_PATH,
            },
        }
    }
}

/// An established connection to the hub, either variant.
pub(crate) enum Connection {
    Direct(DirectTransport),
    WebSocket(Box<WebSocketTransport>),
}

impl Connection {
    pub(crate) async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        match self {
            Self::Direct(t) => t.write_frame(frame).await,
            Self::WebSocket(t) => t.write_frame(frame).await,
        }
    }

    pub(crate) async fn read_frame(&mut self) -> Result<Frame> {
        match self {
            Self::Direct(t) => t.read_frame().await,
            Self::WebSocket(t) => t.read_frame().await,
        }
    }

    pub(crate) async fn shutdown(&mut self) -> Result<()> {
        match self {
            Self::Direct(t) => t.shutdown().await,
            Self::WebSocket(t) => t.shutdown().await,
        }
    }
}
