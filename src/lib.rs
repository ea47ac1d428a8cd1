//! # hublink
//!
//! Service-side client for a cloud IoT message hub: open a long-lived,
//! authenticated connection and send cloud-to-device messages addressed
//! by device identity, with fail-closed TLS trust verification built into
//! the transport handshake.
//!
//! Two wire variants carry the same binary frame protocol: a direct TLS
//! connection ([`Protocol::Direct`]) or the frames tunneled through a
//! WebSocket upgrade ([`Protocol::WebSocket`]). The companion
//! [`RegistryClient`] manages device records and exposes the per-device
//! delivery counter the hub increments for every acknowledged send.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use hublink::{Message, Protocol, RegistryClient, ServiceClient};
//!
//! #[tokio::main]
//! async fn main() -> hublink::Result<()> {
//!     let conn = "HostName=hub.example.com;SharedAccessKeyName=service;SharedAccessKey=czNjcjN0";
//!
//!     let registry = RegistryClient::from_connection_string(conn)?;
//!     registry.create_device("device-1").await?;
//!
//!     let client = ServiceClient::from_connection_string(conn, Protocol::Direct)?;
//!     client.open().await?;
//!     client.send("device-1", Message::from("wake up")).await?;
//!     client.close().await?;
//!
//!     let record = registry.get_device("device-1").await?;
//!     assert_eq!(record.cloud_to_device_message_count, 1);
//!     Ok(())
//! }
//! ```
//!
//! ## Lifecycle
//!
//! A client moves through `Closed → Opening → Open → Closing → Closed`;
//! any unrecoverable transport error lands it in the terminal `Faulted`
//! state, where it can only be closed and replaced. `send` is valid only
//! while `Open` and completes once the hub acknowledges acceptance.
//! Certificate trust failures are never downgraded: a handshake against
//! an untrusted endpoint fails with
//! [`ServiceError::CertificateTrust`] before any application data moves.

#![warn(clippy::pedantic)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod client;
pub mod credential;
pub mod error;
pub mod message;
pub mod registry;
pub mod testing;
pub mod transport;
pub mod trust;
pub mod wire;

pub use client::{ClientOptions, ConnectionState, ServiceClient};
pub use credential::SharedAccessCredential;
pub use error::{Result, ServiceError};
pub use message::Message;
pub use registry::{DeviceRecord, RegistryClient, RegistryOptions};
pub use transport::Protocol;
pub use trust::TrustConfig;
