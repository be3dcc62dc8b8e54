//! Crate-wide error type.
//!
//! Every fallible public operation resolves with [`Error`]. Transient proxy
//! failures are absorbed by the health monitor (demote + rehab); callers only
//! see an error when dispatch itself cannot proceed.

use thiserror::Error;

/// A single proxy's failure during an authentication fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    /// `host:port` of the proxy that rejected the credential.
    pub name: String,
    /// Stringified error returned by the proxy.
    pub error: String,
}

#[derive(Error, Debug)]
pub enum Error {
    /// The topology was destroyed before the operation could be dispatched.
    #[error("topology was destroyed")]
    Destroyed,

    /// No connected proxy passes the latency eligibility window.
    #[error("no mongos proxy available")]
    NoProxyAvailable,

    /// The requested authentication mechanism is not registered.
    #[error("auth provider {0} does not exist")]
    AuthProviderMissing(String),

    /// An authentication fan-out is already in flight.
    #[error("authentication or logout already in process")]
    AuthInProgress,

    /// One or more proxies rejected the credential during a fan-out.
    #[error("authentication fail")]
    Authentication {
        /// Per-proxy failures collected during the fan-out.
        failures: Vec<AuthFailure>,
    },

    /// Transport-level failure reported by a proxy connection.
    #[error("connection error: {0}")]
    Connection(String),

    /// A proxy reply did not have the expected shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// A namespace string was not of the form `db.collection`.
    #[error("invalid namespace: {0}")]
    InvalidNamespace(String),

    /// A configuration value failed validation.
    #[error("configuration error: {field}: {reason}")]
    Config {
        field: &'static str,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_dispatch_messages() {
        assert_eq!(Error::Destroyed.to_string(), "topology was destroyed");
        assert_eq!(
            Error::NoProxyAvailable.to_string(),
            "no mongos proxy available"
        );
        assert_eq!(
            Error::AuthProviderMissing("sspi2".into()).to_string(),
            "auth provider sspi2 does not exist"
        );
    }

    #[test]
    fn authentication_keeps_per_proxy_failures() {
        let err = Error::Authentication {
            failures: vec![AuthFailure {
                name: "localhost:27017".into(),
                error: "bad credential".into(),
            }],
        };
        match err {
            Error::Authentication { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].name, "localhost:27017");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
