//! Service client: the open/send/close state machine.
//!
//! A client is bound at construction to a credential, a transport
//! [`Protocol`] and a trust configuration. `open` performs the transport
//! handshake (TLS trust verification included) and the authentication
//! exchange; `send` submits cloud-to-device messages and suspends until
//! the hub acknowledges acceptance; `close` shuts the connection down
//! gracefully and is idempotent.
//!
//! Concurrent sends on one client are serialized onto the single
//! connection by a fair FIFO mutex, so completions preserve submission
//! order. `open` and `close` must not be invoked concurrently on the same
//! client without external serialization.

mod state;

pub use state::ConnectionState;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};

use crate::credential::SharedAccessCredential;
use crate::error::{Result, ServiceError};
use crate::message::Message;
use crate::transport::{Connection, DirectTransport, Protocol, WebSocketTransport};
use crate::trust::TrustConfig;
use crate::wire::{Frame, SendStatus};

/// Tunables for a [`ServiceClient`]. Trust roots and per-operation
/// default deadlines; every operation also has a `*_with_deadline`
/// variant for a one-off override.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub trust: TrustConfig,
    pub open_timeout: Duration,
    pub send_timeout: Duration,
    pub close_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            trust: TrustConfig::default(),
            open_timeout: Duration::from_secs(30),
            send_timeout: Duration::from_secs(30),
            close_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientOptions {
    #[must_use]
    pub fn with_trust(mut self, trust: TrustConfig) -> Self {
        self.trust = trust;
        self
    }

    #[must_use]
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }
}

/// Asynchronous service-side client for cloud-to-device messaging.
///
/// Cheap to clone; clones share the same connection and state.
///
/// # Examples
///
/// ```rust,no_run
/// use hublink::{Message, Protocol, ServiceClient};
///
/// #[tokio::main]
/// async fn main() -> hublink::Result<()> {
///     let client = ServiceClient::from_connection_string(
///         "HostName=hub.example.com;SharedAccessKeyName=service;SharedAccessKey=czNjcjN0",
///         Protocol::Direct,
///     )?;
///
///     client.open().await?;
///     client.send("device-1", Message::from("hello")).await?;
///     client.close().await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct ServiceClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceClient")
            .field("protocol", &self.inner.protocol)
            .finish_non_exhaustive()
    }
}

struct ClientInner {
    credential: SharedAccessCredential,
    protocol: Protocol,
    options: ClientOptions,
    state: RwLock<ConnectionState>,
    conn: Mutex<Option<Connection>>,
}

impl ServiceClient {
    /// Constructs a client bound to a credential and transport protocol,
    /// with default options. Synchronous and fatal on bad input: no
    /// partial client is ever returned.
    ///
    /// # Errors
    ///
    /// Returns `MalformedCredential` if the connection string is invalid.
    pub fn from_connection_string(connection_string: &str, protocol: Protocol) -> Result<Self> {
        Self::with_options(connection_string, protocol, ClientOptions::default())
    }

    /// Constructs a client with explicit options.
    ///
    /// # Errors
    ///
    /// Returns `MalformedCredential` for a bad connection string, or
    /// `Configuration` for unusable trust roots (checked eagerly so the
    /// mistake surfaces before any network activity).
    pub fn with_options(
        connection_string: &str,
        protocol: Protocol,
        options: ClientOptions,
    ) -> Result<Self> {
        let credential = SharedAccessCredential::parse(connection_string)?;
        // Validate the trust configuration up front; open() rebuilds it.
        options.trust.client_config(protocol.params().alpn)?;

        Ok(Self {
            inner: Arc::new(ClientInner {
                credential,
                protocol,
                options,
                state: RwLock::new(ConnectionState::Closed),
                conn: Mutex::new(None),
            }),
        })
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.inner.protocol
    }

    /// Opens the connection: transport handshake, TLS trust verification,
    /// then the authentication exchange.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless the client is `Closed` (a faulted client can
    /// never be reopened). On failure the client transitions to `Faulted`
    /// and the causal error is returned: `CertificateTrust` for a
    /// rejected certificate chain, `Connection` for network or
    /// authentication failure, `Timeout` on deadline expiry.
    pub async fn open(&self) -> Result<()> {
        self.open_with_deadline(self.inner.options.open_timeout).await
    }

    /// [`open`](Self::open) with a one-off deadline.
    pub async fn open_with_deadline(&self, deadline: Duration) -> Result<()> {
        {
            let mut state = self.inner.state.write().await;
            match *state {
                ConnectionState::Closed => *state = ConnectionState::Opening,
                ConnectionState::Faulted => {
                    return Err(ServiceError::InvalidState(
                        "open on a faulted client; construct a new client".into(),
                    ))
                }
                other => return Err(ServiceError::InvalidState(format!("open while {other}"))),
            }
        }

        tracing::info!(
            host = %self.inner.credential.host(),
            protocol = ?self.inner.protocol,
            "opening service client"
        );

        match tokio::time::timeout(deadline, self.establish()).await {
            Ok(Ok(conn)) => {
                *self.inner.conn.lock().await = Some(conn);
                *self.inner.state.write().await = ConnectionState::Open;
                tracing::info!(host = %self.inner.credential.host(), "service client open");
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "open failed");
                *self.inner.state.write().await = ConnectionState::Faulted;
                Err(e)
            }
            Err(_) => {
                tracing::error!("open deadline expired mid-handshake");
                *self.inner.state.write().await = ConnectionState::Faulted;
                Err(ServiceError::Timeout)
            }
        }
    }

    async fn establish(&self) -> Result<Connection> {
        let params = self.inner.protocol.params();
        let tls = self.inner.options.trust.client_config(params.alpn)?;
        let credential = &self.inner.credential;
        let host = credential.host_name();
        let port = credential.port().unwrap_or(params.default_port);

        let mut conn = if params.websocket {
            Connection::WebSocket(Box::new(
                WebSocketTransport::connect(host, port, host, params.ws_path, tls).await?,
            ))
        } else {
            Connection::Direct(DirectTransport::connect(host, port, host, tls).await?)
        };

        conn.write_frame(&Frame::Auth {
            key_name: credential.key_name().to_string(),
            signature: credential.sign_token(),
            expiry: credential.expiry(),
        })
        .await?;

        match conn.read_frame().await? {
            Frame::AuthOk => Ok(conn),
            Frame::AuthErr { reason } => Err(ServiceError::Connection(format!(
                "authentication rejected: {reason}"
            ))),
            other => Err(ServiceError::Protocol(format!(
                "expected auth response, got {other:?}"
            ))),
        }
    }

    /// Sends a cloud-to-device message and suspends until the hub
    /// acknowledges acceptance.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the client is not `Open` (advisory; no state
    /// change, no registry side effect). `NotFound` if the hub does not
    /// know the device. `Connection`/`Timeout` fault the client: the
    /// connection can no longer be assumed in sync.
    ///
    /// Dropping the returned future after the frame was written is
    /// ambiguous: the hub may or may not have received the message.
    /// At-most-once delivery is not promised on cancellation.
    pub async fn send(&self, device_id: &str, message: Message) -> Result<()> {
        self.send_with_deadline(device_id, message, self.inner.options.send_timeout)
            .await
    }

    /// [`send`](Self::send) with a one-off deadline.
    pub async fn send_with_deadline(
        &self,
        device_id: &str,
        message: Message,
        deadline: Duration,
    ) -> Result<()> {
        {
            let state = *self.inner.state.read().await;
            if state != ConnectionState::Open {
                return Err(ServiceError::InvalidState(format!("send while {state}")));
            }
        }

        let mut guard = self.inner.conn.lock().await;
        let Some(conn) = guard.as_mut() else {
            return Err(ServiceError::InvalidState("send while closed".into()));
        };

        let frame = Frame::Send {
            device_id: device_id.to_string(),
            message,
        };
        let exchange = async {
            conn.write_frame(&frame).await?;
            match conn.read_frame().await? {
                Frame::SendAck { status } => Ok(status),
                other => Err(ServiceError::Protocol(format!(
                    "expected send ack, got {other:?}"
                ))),
            }
        };

        match tokio::time::timeout(deadline, exchange).await {
            Ok(Ok(SendStatus::Accepted)) => {
                tracing::debug!(device_id = %device_id, "send acknowledged");
                Ok(())
            }
            // Clean negative acks: the connection stays in sync, the
            // client stays Open.
            Ok(Ok(SendStatus::UnknownDevice)) => {
                Err(ServiceError::NotFound(device_id.to_string()))
            }
            Ok(Ok(SendStatus::Rejected(reason))) => Err(ServiceError::Protocol(format!(
                "hub rejected send: {reason}"
            ))),
            Ok(Err(e)) => {
                guard.take();
                drop(guard);
                tracing::error!(device_id = %device_id, error = %e, "send failed, faulting client");
                *self.inner.state.write().await = ConnectionState::Faulted;
                Err(e)
            }
            Err(_) => {
                // The ack never arrived; the stream position is unknown.
                guard.take();
                drop(guard);
                tracing::error!(device_id = %device_id, "send deadline expired, faulting client");
                *self.inner.state.write().await = ConnectionState::Faulted;
                Err(ServiceError::Timeout)
            }
        }
    }

    /// Closes the connection gracefully. Idempotent: closing a `Closed`
    /// client succeeds immediately, and closing a `Faulted` client
    /// releases its resources without resurrecting it.
    ///
    /// # Errors
    ///
    /// `InvalidState` while an open or another close is in flight.
    pub async fn close(&self) -> Result<()> {
        self.close_with_deadline(self.inner.options.close_timeout)
            .await
    }

    /// [`close`](Self::close) with a one-off deadline.
    pub async fn close_with_deadline(&self, deadline: Duration) -> Result<()> {
        let faulted = {
            let mut state = self.inner.state.write().await;
            match *state {
                ConnectionState::Closed => return Ok(()),
                ConnectionState::Faulted => true,
                ConnectionState::Open => {
                    *state = ConnectionState::Closing;
                    false
                }
                other => {
                    return Err(ServiceError::InvalidState(format!("close while {other}")))
                }
            }
        };

        if faulted {
            self.inner.conn.lock().await.take();
            return Ok(());
        }

        let conn = self.inner.conn.lock().await.take();
        if let Some(mut conn) = conn {
            // Best effort: if the transport is already gone the close
            // still succeeds.
            let _ = tokio::time::timeout(deadline, async {
                conn.write_frame(&Frame::Close).await.ok();
                conn.shutdown().await.ok();
            })
            .await;
        }

        *self.inner.state.write().await = ConnectionState::Closed;
        tracing::info!(host = %self.inner.credential.host(), "service client closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONN: &str =
        "HostName=localhost:9999;SharedAccessKeyName=service;SharedAccessKey=c2VjcmV0";

    #[tokio::test]
    async fn starts_closed() {
        let client = ServiceClient::from_connection_string(CONN, Protocol::Direct).unwrap();
        assert_eq!(client.state().await, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn send_while_closed_is_invalid_state() {
        let client = ServiceClient::from_connection_string(CONN, Protocol::Direct).unwrap();
        let err = client.send("d1", Message::from("x")).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));
        assert_eq!(client.state().await, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn close_while_closed_is_idempotent() {
        let client = ServiceClient::from_connection_string(CONN, Protocol::Direct).unwrap();
        client.close().await.unwrap();
        client.close().await.unwrap();
        assert_eq!(client.state().await, ConnectionState::Closed);
    }

    #[test]
    fn bad_connection_string_returns_no_client() {
        let err = ServiceClient::from_connection_string("HostName=only", Protocol::Direct)
            .unwrap_err();
        assert!(matches!(err, ServiceError::MalformedCredential(_)));
    }

    #[test]
    fn empty_trust_store_is_caught_at_construction() {
        let options = ClientOptions::default().with_trust(TrustConfig::with_root_certs(vec![]));
        let err = ServiceClient::with_options(CONN, Protocol::Direct, options).unwrap_err();
        assert!(matches!(err, ServiceError::Configuration(_)));
    }
}
