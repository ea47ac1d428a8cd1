//! TLS trust configuration.
//!
//! The verifier policy is fail closed: the handshake aborts on an expired
//! certificate, hostname mismatch, untrusted root, or any other
//! chain-validation error, and the failure surfaces as
//! [`ServiceError::CertificateTrust`](crate::ServiceError::CertificateTrust).
//! There is deliberately no way to install a permissive verifier.

use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore};

use crate::error::{Result, ServiceError};

/// Trusted-root configuration used when verifying the hub's certificate
/// chain during the transport handshake.
#[derive(Debug, Clone)]
pub struct TrustConfig {
    use_system_roots: bool,
    additional_roots: Vec<CertificateDer<'static>>,
}

impl Default for TrustConfig {
    /// System (webpki) roots, no extras.
    fn default() -> Self {
        Self {
            use_system_roots: true,
            additional_roots: Vec::new(),
        }
    }
}

impl TrustConfig {
    /// Trust only the supplied roots, dropping the system set. Used by
    /// tests against a locally generated CA.
    #[must_use]
    pub fn with_root_certs(certs: Vec<CertificateDer<'static>>) -> Self {
        Self {
            use_system_roots: false,
            additional_roots: certs,
        }
    }

    /// Adds a root alongside whatever is already trusted.
    #[must_use]
    pub fn add_root(mut self, cert: CertificateDer<'static>) -> Self {
        self.additional_roots.push(cert);
        self
    }

    /// Builds the rustls client configuration for a handshake.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the resulting trust store would be empty
    /// or a supplied root is not a usable certificate; these are caller
    /// mistakes caught before any network activity.
    pub(crate) fn client_config(&self, alpn: &[u8]) -> Result<Arc<ClientConfig>> {
        let mut root_store = RootCertStore::empty();

        if self.use_system_roots {
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.to_vec());
        }
        for cert in &self.additional_roots {
            root_store.add(cert.clone()).map_err(|e| {
                ServiceError::Configuration(format!("unusable trust root: {e}"))
            })?;
        }
        if root_store.is_empty() {
            return Err(ServiceError::Configuration(
                "trust store is empty: no roots to verify the hub against".into(),
            ));
        }

        let crypto_provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = ClientConfig::builder_with_provider(crypto_provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| {
                ServiceError::Configuration(format!("failed to set protocol versions: {e}"))
            })?
            .with_root_certificates(root_store)
            .with_no_client_auth();

        config.alpn_protocols = vec![alpn.to_vec()];
        Ok(Arc::new(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_trust_store_is_a_configuration_error() {
        let trust = TrustConfig::with_root_certs(Vec::new());
        let err = trust.client_config(b"hubmsg/1").unwrap_err();
        assert!(matches!(err, ServiceError::Configuration(_)));
    }

    #[test]
    fn system_roots_build_with_alpn() {
        let config = TrustConfig::default().client_config(b"hubmsg/1").unwrap();
        assert_eq!(config.alpn_protocols, vec![b"hubmsg/1".to_vec()]);
    }

    #[test]
    fn garbage_root_is_rejected() {
        let trust =
            TrustConfig::with_root_certs(vec![CertificateDer::from(vec![0u8; 16])]);
        let err = trust.client_config(b"hubmsg/1").unwrap_err();
        assert!(matches!(err, ServiceError::Configuration(_)));
    }
}
