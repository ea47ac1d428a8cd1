//! Test tooling: an in-process hub endpoint.
//!
//! Not part of the service surface. Integration tests start a [`TestHub`]
//! on loopback to exercise the client against a live, TLS-terminated
//! endpoint with a real registry behind it.

mod hub;

pub use hub::{CertProfile, TestHub};
