//! Error types for certificate issuance
//!
//! Every failure of a pipeline step is wrapped by the controller into
//! [`Error::Issuance`], which names the identity and the step. The wrapped cause
//! keeps the signer's reason, the decode detail or the deadline, so an operator
//! can tell a refusal from a corrupt stored key from a timeout.

use std::time::Duration;

use thiserror::Error;

use crate::controller::IssuanceStep;

/// Main error type for issuance operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The `key.pem` entry of an existing secret is not a usable RSA key
    #[error("failed to decode stored private key: {0}")]
    KeyDecode(String),

    /// Key generation or PKCS#10 encoding failed
    #[error("failed to construct certificate request: {0}")]
    CsrConstruction(String),

    /// A signed certificate returned by the signer could not be parsed
    #[error("failed to parse signed certificate: {0}")]
    CertificateParse(String),

    /// A signing request with the requested name already exists
    #[error("signing request {name} already exists")]
    DuplicateRequest {
        /// Name of the colliding CertificateSigningRequest
        name: String,
    },

    /// The approval condition could not be set
    #[error("failed to approve signing request {name}: {message}")]
    Approval {
        /// Name of the CertificateSigningRequest
        name: String,
        /// Why approval failed
        message: String,
    },

    /// No certificate was attached before the deadline
    #[error("timed out after {waited:?} waiting for signing request {name} to be signed")]
    Timeout {
        /// Name of the CertificateSigningRequest, left in place for inspection
        name: String,
        /// How long the waiter polled
        waited: Duration,
    },

    /// The signer denied or failed the request
    #[error("signing request {name} {condition}: {reason}")]
    SigningDenied {
        /// Name of the CertificateSigningRequest
        name: String,
        /// Condition type reported by the signer ("Denied" or "Failed")
        condition: String,
        /// Reason and message reported by the signer
        reason: String,
    },

    /// The secret could not be persisted because of a concurrent write
    #[error("conflict persisting secret {namespace}/{name}: {message}")]
    Conflict {
        /// Secret namespace
        namespace: String,
        /// Secret name
        name: String,
        /// Server message
        message: String,
    },

    /// Kubernetes API error not covered by a more specific variant
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The service account watch stream reported an error
    #[error("watch error: {0}")]
    Watch(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Writing secret entries to local files failed
    #[error("export error: {0}")]
    Export(String),

    /// A pipeline step failed for a specific identity
    #[error("issuance for {identity} failed while {step}: {source}")]
    Issuance {
        /// `namespace/name` of the service account
        identity: String,
        /// Step that failed
        step: IssuanceStep,
        /// Underlying cause
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create a key decode error with the given detail
    pub fn key_decode(msg: impl Into<String>) -> Self {
        Self::KeyDecode(msg.into())
    }

    /// Create a CSR construction error with the given detail
    pub fn csr_construction(msg: impl Into<String>) -> Self {
        Self::CsrConstruction(msg.into())
    }

    /// Create a certificate parse error with the given detail
    pub fn certificate_parse(msg: impl Into<String>) -> Self {
        Self::CertificateParse(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an export error with the given message
    pub fn export(msg: impl Into<String>) -> Self {
        Self::Export(msg.into())
    }

    /// Attribute this error to a step of an identity's issuance
    pub fn during(self, identity: impl Into<String>, step: IssuanceStep) -> Self {
        Self::Issuance {
            identity: identity.into(),
            step,
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through [`Error::Issuance`] wrappers
    pub fn root(&self) -> &Error {
        match self {
            Self::Issuance { source, .. } => source.root(),
            other => other,
        }
    }

    /// The step this error was attributed to, if any
    pub fn step(&self) -> Option<IssuanceStep> {
        match self {
            Self::Issuance { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// Whether re-running the whole issuance may succeed.
    ///
    /// Signer refusals, corrupt keys and bad configuration are permanent.
    /// A duplicate request name is only worth retrying when the next attempt
    /// picks a new name, which the caller decides.
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            Self::Kube(_)
            | Self::Conflict { .. }
            | Self::Timeout { .. }
            | Self::Approval { .. }
            | Self::Watch(_) => true,
            Self::KeyDecode(_)
            | Self::CsrConstruction(_)
            | Self::CertificateParse(_)
            | Self::SigningDenied { .. }
            | Self::DuplicateRequest { .. }
            | Self::Config(_)
            | Self::Export(_)
            | Self::Issuance { .. } => false,
        }
    }
}

/// Whether a kube error is an API status with the given HTTP code
pub(crate) fn is_api_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == code)
}
