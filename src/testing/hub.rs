//! In-process hub: TLS-terminated direct and WebSocket listeners, a
//! shared-access-key authentication gate, and a device registry with
//! per-device delivery counters.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use base64::prelude::*;
use futures_util::{SinkExt, StreamExt};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::credential::SharedAccessCredential;
use crate::error::{Result, ServiceError};
use crate::registry::DeviceRecord;
use crate::transport::{Protocol, DIRECT_ALPN, WEBSOCKET_ALPN};
use crate::trust::TrustConfig;
use crate::wire::{self, DeviceError, Frame, SendStatus};

const TEST_KEY: &[u8] = b"hublink-test-shared-access-key";
const TEST_KEY_NAME: &str = "service";

/// What certificate chain the hub presents during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertProfile {
    /// Chain for `localhost` signed by a CA the hub hands to clients.
    Valid,
    /// Chain for `localhost` signed by a CA the hub does NOT expose;
    /// any honest client must reject it.
    UntrustedRoot,
    /// Chain signed by the exposed CA but issued for a different
    /// hostname, so server-name verification must fail.
    WrongHostname,
}

#[derive(Default)]
struct HubState {
    devices: Mutex<HashMap<String, u64>>,
    /// Accepted sends in arrival order: (device_id, payload).
    received: Mutex<Vec<(String, Vec<u8>)>>,
    /// When set, send frames are read and dropped without an ack.
    stall_sends: bool,
}

/// A live loopback hub. Listeners shut down when the hub is dropped.
pub struct TestHub {
    direct_addr: SocketAddr,
    ws_addr: SocketAddr,
    ca: Option<CertificateDer<'static>>,
    state: Arc<HubState>,
    tasks: Vec<JoinHandle<()>>,
}

impl TestHub {
    /// Starts a hub with a trustworthy certificate chain.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if certificate generation or binding fails.
    pub async fn start() -> Result<Self> {
        Self::start_with(CertProfile::Valid).await
    }

    /// Starts a hub presenting the given certificate profile.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if certificate generation or binding fails.
    pub async fn start_with(profile: CertProfile) -> Result<Self> {
        Self::start_inner(profile, false).await
    }

    /// Starts a hub that authenticates and serves registry operations
    /// normally but never acknowledges sends, leaving the sender waiting
    /// on its deadline.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if certificate generation or binding fails.
    pub async fn start_unresponsive() -> Result<Self> {
        Self::start_inner(CertProfile::Valid, true).await
    }

    async fn start_inner(profile: CertProfile, stall_sends: bool) -> Result<Self> {
        let san = match profile {
            CertProfile::WrongHostname => "wrong.host.test",
            _ => "localhost",
        };
        let (cert_chain, key, ca) = generate_chain(san)?;
        let ca = match profile {
            CertProfile::UntrustedRoot => None,
            _ => Some(ca),
        };

        let direct_listener = TcpListener::bind("127.0.0.1:0").await?;
        let ws_listener = TcpListener::bind("127.0.0.1:0").await?;
        let direct_addr = direct_listener.local_addr()?;
        let ws_addr = ws_listener.local_addr()?;

        let state = Arc::new(HubState {
            stall_sends,
            ..HubState::default()
        });
        let mut tasks = Vec::new();

        let direct_acceptor =
            TlsAcceptor::from(server_config(cert_chain.clone(), key.clone_key(), DIRECT_ALPN)?);
        let direct_cred = credential_for(direct_addr.port())?;
        tasks.push(tokio::spawn(accept_loop(
            direct_listener,
            direct_acceptor,
            direct_cred,
            Arc::clone(&state),
            false,
        )));

        let ws_acceptor = TlsAcceptor::from(server_config(cert_chain, key, WEBSOCKET_ALPN)?);
        let ws_cred = credential_for(ws_addr.port())?;
        tasks.push(tokio::spawn(accept_loop(
            ws_listener,
            ws_acceptor,
            ws_cred,
            Arc::clone(&state),
            true,
        )));

        tracing::info!(
            direct = %direct_addr,
            websocket = %ws_addr,
            profile = ?profile,
            "test hub listening"
        );

        Ok(Self {
            direct_addr,
            ws_addr,
            ca,
            state,
            tasks,
        })
    }

    /// Connection string for the listener matching `protocol`.
    #[must_use]
    pub fn connection_string(&self, protocol: Protocol) -> String {
        let port = match protocol {
            Protocol::Direct => self.direct_addr.port(),
            Protocol::WebSocket => self.ws_addr.port(),
        };
        connection_string_for(port)
    }

    /// Connection string with a key the hub will not accept.
    #[must_use]
    pub fn connection_string_with_wrong_key(&self, protocol: Protocol) -> String {
        let port = match protocol {
            Protocol::Direct => self.direct_addr.port(),
            Protocol::WebSocket => self.ws_addr.port(),
        };
        format!(
            "HostName=localhost:{port};SharedAccessKeyName={TEST_KEY_NAME};SharedAccessKey={}",
            BASE64_STANDARD.encode(b"not-the-right-key")
        )
    }

    /// Trust configuration for connecting clients: the hub's CA when it
    /// is exposed, otherwise the system roots, which will not trust a
    /// freshly generated loopback CA.
    #[must_use]
    pub fn trust_config(&self) -> TrustConfig {
        match &self.ca {
            Some(ca) => TrustConfig::with_root_certs(vec![ca.clone()]),
            None => TrustConfig::default(),
        }
    }

    /// Payloads of accepted sends for a device, in arrival order.
    #[must_use]
    pub fn received(&self, device_id: &str) -> Vec<Vec<u8>> {
        self.state
            .received
            .lock()
            .expect("hub state lock")
            .iter()
            .filter(|(id, _)| id == device_id)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

impl Drop for TestHub {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn connection_string_for(port: u16) -> String {
    format!(
        "HostName=localhost:{port};SharedAccessKeyName={TEST_KEY_NAME};SharedAccessKey={}",
        BASE64_STANDARD.encode(TEST_KEY)
    )
}

fn credential_for(port: u16) -> Result<SharedAccessCredential> {
    SharedAccessCredential::parse(&connection_string_for(port))
}

/// CA plus end-entity chain for `san`, freshly generated.
fn generate_chain(
    san: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>, CertificateDer<'static>)> {
    let ca_key = rcgen::KeyPair::generate().map_err(cert_err)?;
    let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new()).map_err(cert_err)?;
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "hublink test CA");
    let ca_cert = ca_params.self_signed(&ca_key).map_err(cert_err)?;

    let ee_key = rcgen::KeyPair::generate().map_err(cert_err)?;
    let ee_params = rcgen::CertificateParams::new(vec![san.to_string()]).map_err(cert_err)?;
    let ee_cert = ee_params.signed_by(&ee_key, &ca_cert, &ca_key).map_err(cert_err)?;

    let chain = vec![ee_cert.der().clone(), ca_cert.der().clone()];
    let key = PrivateKeyDer::try_from(ee_key.serialize_der())
        .map_err(|e| ServiceError::Configuration(format!("bad generated key: {e}")))?;
    Ok((chain, key, ca_cert.der().clone()))
}

fn cert_err(e: rcgen::Error) -> ServiceError {
    ServiceError::Configuration(format!("certificate generation failed: {e}"))
}

fn server_config(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    alpn: &[u8],
) -> Result<Arc<ServerConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ServiceError::Configuration(format!("TLS server config: {e}")))?
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| ServiceError::Configuration(format!("TLS server certificate: {e}")))?;
    config.alpn_protocols = vec![alpn.to_vec()];
    Ok(Arc::new(config))
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    credential: SharedAccessCredential,
    state: Arc<HubState>,
    websocket: bool,
) {
    loop {
        let (tcp, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "hub accept failed");
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let credential = credential.clone();
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(tcp, acceptor, credential, state, websocket).await {
                tracing::debug!(peer = %peer, error = %e, "hub session ended with error");
            }
        });
    }
}

async fn handle_connection(
    tcp: TcpStream,
    acceptor: TlsAcceptor,
    credential: SharedAccessCredential,
    state: Arc<HubState>,
    websocket: bool,
) -> Result<()> {
    let tls = acceptor
        .accept(tcp)
        .await
        .map_err(|e| ServiceError::Connection(format!("TLS accept: {e}")))?;

    if websocket {
        serve_websocket(tls, credential, state).await
    } else {
        serve_direct(tls, credential, state).await
    }
}

async fn serve_direct<S>(
    mut stream: S,
    credential: SharedAccessCredential,
    state: Arc<HubState>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let first = wire::read_frame(&mut stream).await?;
    let response = authenticate(&first, &credential);
    let authed = matches!(response, Frame::AuthOk);
    wire::write_frame(&mut stream, &response).await?;
    if !authed {
        return Ok(());
    }

    loop {
        let frame = match wire::read_frame(&mut stream).await {
            Ok(frame) => frame,
            // Peer hung up without a Close frame; nothing left to do.
            Err(ServiceError::Connection(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        if state.stall_sends && matches!(frame, Frame::Send { .. }) {
            continue;
        }
        match handle_frame(frame, &state) {
            Some(response) => wire::write_frame(&mut stream, &response).await?,
            None => return Ok(()),
        }
    }
}

async fn serve_websocket<S>(
    stream: S,
    credential: SharedAccessCredential,
    state: Arc<HubState>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| ServiceError::Connection(format!("WebSocket accept: {e}")))?;

    let mut authed = false;
    while let Some(msg) = ws.next().await {
        let msg = msg.map_err(|e| ServiceError::Connection(format!("WebSocket receive: {e}")))?;
        let frame = match msg {
            WsMessage::Binary(data) => wire::decode_buffer(&data)?,
            WsMessage::Ping(payload) => {
                ws.send(WsMessage::Pong(payload))
                    .await
                    .map_err(|e| ServiceError::Connection(format!("pong: {e}")))?;
                continue;
            }
            WsMessage::Close(_) => break,
            _ => continue,
        };

        let response = if authed {
            if state.stall_sends && matches!(frame, Frame::Send { .. }) {
                continue;
            }
            match handle_frame(frame, &state) {
                Some(response) => response,
                None => break,
            }
        } else {
            let response = authenticate(&frame, &credential);
            authed = matches!(response, Frame::AuthOk);
            response
        };

        let encoded = response.encode()?;
        ws.send(WsMessage::Binary(encoded.to_vec()))
            .await
            .map_err(|e| ServiceError::Connection(format!("WebSocket send: {e}")))?;

        if !authed {
            break;
        }
    }
    Ok(())
}

fn authenticate(frame: &Frame, credential: &SharedAccessCredential) -> Frame {
    match frame {
        Frame::Auth {
            key_name,
            signature,
            expiry,
        } => {
            if credential.verify_token(key_name, signature, *expiry) {
                Frame::AuthOk
            } else {
                tracing::debug!(key_name = %key_name, "hub rejected credentials");
                Frame::AuthErr {
                    reason: "signature mismatch".into(),
                }
            }
        }
        _ => Frame::AuthErr {
            reason: "expected auth frame first".into(),
        },
    }
}

/// Applies one post-auth frame; `None` ends the session.
fn handle_frame(frame: Frame, state: &HubState) -> Option<Frame> {
    let response = match frame {
        Frame::Send { device_id, message } => {
            let mut devices = state.devices.lock().expect("hub state lock");
            match devices.get_mut(&device_id) {
                Some(count) => {
                    *count += 1;
                    state
                        .received
                        .lock()
                        .expect("hub state lock")
                        .push((device_id, message.payload.to_vec()));
                    Frame::SendAck {
                        status: SendStatus::Accepted,
                    }
                }
                None => Frame::SendAck {
                    status: SendStatus::UnknownDevice,
                },
            }
        }
        Frame::DeviceCreate { device_id } => {
            let mut devices = state.devices.lock().expect("hub state lock");
            if devices.contains_key(&device_id) {
                Frame::DeviceErr {
                    error: DeviceError::AlreadyExists(device_id),
                }
            } else {
                devices.insert(device_id.clone(), 0);
                Frame::DeviceOk {
                    record: DeviceRecord {
                        device_id,
                        cloud_to_device_message_count: 0,
                    },
                }
            }
        }
        Frame::DeviceGet { device_id } => {
            let devices = state.devices.lock().expect("hub state lock");
            match devices.get(&device_id) {
                Some(count) => Frame::DeviceOk {
                    record: DeviceRecord {
                        device_id,
                        cloud_to_device_message_count: *count,
                    },
                },
                None => Frame::DeviceErr {
                    error: DeviceError::NotFound(device_id),
                },
            }
        }
        Frame::DeviceRemove { device_id } => {
            let mut devices = state.devices.lock().expect("hub state lock");
            match devices.remove(&device_id) {
                Some(count) => Frame::DeviceOk {
                    record: DeviceRecord {
                        device_id,
                        cloud_to_device_message_count: count,
                    },
                },
                None => Frame::DeviceErr {
                    error: DeviceError::NotFound(device_id),
                },
            }
        }
        Frame::Close => return None,
        other => {
            tracing::debug!(frame = ?other, "hub dropping session on unexpected frame");
            return None;
        }
    };
    Some(response)
}
