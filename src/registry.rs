//! Device-registry collaborator client.
//!
//! The registry creates, queries and removes device records, and exposes
//! the per-device cloud-to-device delivery counter the hub increments for
//! every acknowledged send. It shares the credential and trust machinery
//! with [`ServiceClient`](crate::ServiceClient) but is not in the send
//! path: it observes side effects, it does not cause them.

use std::time::Duration;

use tokio::sync::Mutex;

use crate::credential::SharedAccessCredential;
use crate::error::{Result, ServiceError};
use crate::transport::{Connection, DirectTransport, Protocol};
use crate::trust::TrustConfig;
use crate::wire::{DeviceError, Frame};

/// A device's registry record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub device_id: String,
    /// Number of cloud-to-device messages the hub has accepted for this
    /// device. Reads 0 immediately after creation.
    pub cloud_to_device_message_count: u64,
}

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub trust: TrustConfig,
    pub operation_timeout: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            trust: TrustConfig::default(),
            operation_timeout: Duration::from_secs(30),
        }
    }
}

impl RegistryOptions {
    #[must_use]
    pub fn with_trust(mut self, trust: TrustConfig) -> Self {
        self.trust = trust;
        self
    }

    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }
}

/// Registry client. Connects lazily over the direct transport on first
/// use and reconnects transparently after a transport failure.
pub struct RegistryClient {
    credential: SharedAccessCredential,
    options: RegistryOptions,
    conn: Mutex<Option<Connection>>,
}

impl RegistryClient {
    /// # Errors
    ///
    /// Returns `MalformedCredential` if the connection string is invalid.
    pub fn from_connection_string(connection_string: &str) -> Result<Self> {
        Self::with_options(connection_string, RegistryOptions::default())
    }

    /// # Errors
    ///
    /// Returns `MalformedCredential` for a bad connection string, or
    /// `Configuration` for unusable trust roots.
    pub fn with_options(connection_string: &str, options: RegistryOptions) -> Result<Self> {
        let credential = SharedAccessCredential::parse(connection_string)?;
        options
            .trust
            .client_config(Protocol::Direct.params().alpn)?;
        Ok(Self {
            credential,
            options,
            conn: Mutex::new(None),
        })
    }

    /// Creates a device record; its delivery counter starts at zero.
    ///
    /// # Errors
    ///
    /// `Protocol` if the device already exists; transport errors as usual.
    pub async fn create_device(&self, device_id: &str) -> Result<DeviceRecord> {
        match self
            .roundtrip(Frame::DeviceCreate {
                device_id: device_id.to_string(),
            })
            .await?
        {
            Frame::DeviceOk { record } => {
                tracing::debug!(device_id = %record.device_id, "device created");
                Ok(record)
            }
            Frame::DeviceErr {
                error: DeviceError::AlreadyExists(id),
            } => Err(ServiceError::Protocol(format!("device already exists: {id}"))),
            other => Err(unexpected(&other)),
        }
    }

    /// Fetches a device record.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown device.
    pub async fn get_device(&self, device_id: &str) -> Result<DeviceRecord> {
        match self
            .roundtrip(Frame::DeviceGet {
                device_id: device_id.to_string(),
            })
            .await?
        {
            Frame::DeviceOk { record } => Ok(record),
            Frame::DeviceErr {
                error: DeviceError::NotFound(id),
            } => Err(ServiceError::NotFound(id)),
            other => Err(unexpected(&other)),
        }
    }

    /// Removes a device record. Removing a device that does not exist is
    /// treated as success: cleanup is idempotent by contract.
    pub async fn remove_device(&self, device_id: &str) -> Result<()> {
        match self
            .roundtrip(Frame::DeviceRemove {
                device_id: device_id.to_string(),
            })
            .await?
        {
            Frame::DeviceOk { .. } => {
                tracing::debug!(device_id = %device_id, "device removed");
                Ok(())
            }
            Frame::DeviceErr {
                error: DeviceError::NotFound(_),
            } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Shuts the registry connection down. Subsequent operations
    /// reconnect.
    pub async fn close(&self) -> Result<()> {
        if let Some(mut conn) = self.conn.lock().await.take() {
            conn.write_frame(&Frame::Close).await.ok();
            conn.shutdown().await.ok();
        }
        Ok(())
    }

    async fn roundtrip(&self, request: Frame) -> Result<Frame> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let conn = guard.as_mut().expect("connection established above");

        let exchange = async {
            conn.write_frame(&request).await?;
            conn.read_frame().await
        };
        match tokio::time::timeout(self.options.operation_timeout, exchange).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(e)) => {
                // Drop the broken connection; the next operation redials.
                guard.take();
                Err(e)
            }
            Err(_) => {
                guard.take();
                Err(ServiceError::Timeout)
            }
        }
    }

    async fn connect(&self) -> Result<Connection> {
        let params = Protocol::Direct.params();
        let tls = self.options.trust.client_config(params.alpn)?;
        let host = self.credential.host_name();
        let port = self.credential.port().unwrap_or(params.default_port);

        let mut conn =
            Connection::Direct(DirectTransport::connect(host, port, host, tls).await?);

        conn.write_frame(&Frame::Auth {
            key_name: self.credential.key_name().to_string(),
            signature: self.credential.sign_token(),
            expiry: self.credential.expiry(),
        })
        .await?;

        match conn.read_frame().await? {
            Frame::AuthOk => Ok(conn),
            Frame::AuthErr { reason } => Err(ServiceError::Connection(format!(
                "authentication rejected: {reason}"
            ))),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(frame: &Frame) -> ServiceError {
    ServiceError::Protocol(format!("unexpected registry response: {frame:?}"))
}
