use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServiceError>;

/// Error taxonomy for the service client and registry collaborator.
///
/// Callers are expected to distinguish recoverable kinds (`InvalidState`,
/// `NotFound`) from kinds that fault the client; see [`ServiceError::is_fatal`].
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    /// Bad protocol/endpoint configuration, detected before any I/O.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Connection string missing a required field or otherwise unparseable.
    #[error("malformed connection string: {0}")]
    MalformedCredential(String),

    /// The remote certificate chain failed validation. Never downgraded:
    /// a handshake that trips this error is aborted before any
    /// application data is exchanged.
    #[error("server certificate rejected: {0}")]
    CertificateTrust(String),

    /// Transport-level failure: TCP connect, handshake (other than trust),
    /// authentication rejection, or a connection lost mid-operation.
    #[error("connection error: {0}")]
    Connection(String),

    /// The operation is not valid in the client's current state.
    /// Purely advisory; the client state is left untouched.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The operation's deadline expired.
    #[error("operation timed out")]
    Timeout,

    /// Registry lookup for an unknown device. Advisory, never faults.
    #[error("device not found: {0}")]
    NotFound(String),

    /// The peer violated the wire protocol (bad frame, unexpected kind,
    /// oversized frame) or rejected an operation outright.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl ServiceError {
    /// Whether this error kind moves a client to `Faulted` when it occurs
    /// on an established or in-progress connection.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::InvalidState(_) | Self::NotFound(_))
    }

    /// Classifies a handshake I/O failure, surfacing certificate problems
    /// as `CertificateTrust` instead of a generic connection error.
    ///
    /// rustls reports verification failures through the connector as an
    /// `io::Error` wrapping `rustls::Error::InvalidCertificate`.
    pub(crate) fn from_handshake(err: &std::io::Error) -> Self {
        if let Some(tls_err) = err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        {
            if let rustls::Error::InvalidCertificate(reason) = tls_err {
                return Self::CertificateTrust(format!("{reason:?}"));
            }
            return Self::Connection(format!("TLS handshake failed: {tls_err}"));
        }
        Self::Connection(format!("handshake failed: {err}"))
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(err: std::io::Error) -> Self {
        ServiceError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trust_errors_are_fatal_and_distinct() {
        let err = ServiceError::CertificateTrust("UnknownIssuer".into());
        assert!(err.is_fatal());
        assert!(err.to_string().contains("certificate rejected"));
    }

    #[test]
    fn advisory_errors_are_not_fatal() {
        assert!(!ServiceError::InvalidState("send while Closed".into()).is_fatal());
        assert!(!ServiceError::NotFound("d1".into()).is_fatal());
        assert!(ServiceError::Timeout.is_fatal());
    }

    #[test]
    fn handshake_classification_recognizes_invalid_certificate() {
        let tls = rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer);
        let io = std::io::Error::new(std::io::ErrorKind::InvalidData, tls);
        match ServiceError::from_handshake(&io) {
            ServiceError::CertificateTrust(reason) => assert!(reason.contains("UnknownIssuer")),
            other => panic!("expected CertificateTrust, got {other:?}"),
        }
    }

    #[test]
    fn handshake_classification_falls_back_to_connection() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(
            ServiceError::from_handshake(&io),
            ServiceError::Connection(_)
        ));
    }
}
