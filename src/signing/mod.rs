//! Signing requests against the cluster's certificates API
//!
//! [`CsrSubmitter`] creates and approves a CertificateSigningRequest;
//! [`CertificateWaiter`] polls it until the signer attaches a certificate, denies
//! it, or the deadline passes. Neither retries: a failure is returned at once and
//! the controller decides whether the whole issuance is repeated.

mod submitter;
mod waiter;

pub use submitter::{CsrSubmitter, APPROVAL_MESSAGE, APPROVAL_REASON};
pub use waiter::{CertificateWaiter, DEFAULT_POLL_INTERVAL, DEFAULT_SIGNING_TIMEOUT};

/// Key usages requested for every workload certificate
pub const SERVER_USAGES: &[&str] = &["digital signature", "key encipherment", "server auth"];

/// Condition type set on approval
pub const CONDITION_APPROVED: &str = "Approved";

/// Condition type set by an approver that refused the request
pub const CONDITION_DENIED: &str = "Denied";

/// Condition type set by a signer that could not sign
pub const CONDITION_FAILED: &str = "Failed";

/// Lifecycle of a signing request as seen by this client
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SigningState {
    /// Created, not yet approved
    Pending,
    /// Approved, waiting for the signer
    Approved,
    /// Certificate attached
    Signed,
    /// Denied or failed by the approver or signer
    Failed,
    /// Deadline elapsed before a certificate was attached
    TimedOut,
}

impl SigningState {
    /// Whether no further transition is possible
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Signed | Self::Failed | Self::TimedOut)
    }
}

/// A signing request created by this client
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigningRequestHandle {
    name: String,
    state: SigningState,
}

impl SigningRequestHandle {
    /// Handle for a freshly created request
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: SigningState::Pending,
        }
    }

    /// Resource name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last known state
    pub fn state(&self) -> SigningState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: SigningState) {
        self.state = state;
    }
}

/// What is sent to the API server when creating a request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigningRequestSpec {
    /// Resource name
    pub name: String,
    /// PEM-encoded PKCS#10 request
    pub request_pem: Vec<u8>,
    /// Signer expected to sign the request
    pub signer_name: String,
    /// Requested key usages
    pub usages: Vec<String>,
}

/// A status condition reported on a request
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SigningCondition {
    /// Condition type ("Approved", "Denied", "Failed")
    pub type_: String,
    /// "True", "False" or "Unknown"
    pub status: String,
    /// Machine-readable reason
    pub reason: Option<String>,
    /// Human-readable message
    pub message: Option<String>,
}

impl SigningCondition {
    fn is_true(&self, type_: &str) -> bool {
        self.type_ == type_ && self.status == "True"
    }

    /// Reason and message joined for error reporting
    pub fn describe(&self) -> String {
        match (self.reason.as_deref(), self.message.as_deref()) {
            (Some(r), Some(m)) if !m.is_empty() => format!("{}: {}", r, m),
            (Some(r), _) => r.to_string(),
            (None, Some(m)) => m.to_string(),
            (None, None) => "no reason given".to_string(),
        }
    }
}

/// Observed status of a request
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SigningRequestStatus {
    /// Signed certificate, once attached
    pub certificate: Option<Vec<u8>>,
    /// Status conditions
    pub conditions: Vec<SigningCondition>,
}

impl SigningRequestStatus {
    /// The denial or failure condition, if the request was refused
    pub fn refusal(&self) -> Option<&SigningCondition> {
        self.conditions
            .iter()
            .find(|c| c.is_true(CONDITION_DENIED) || c.is_true(CONDITION_FAILED))
    }

    /// Whether the request carries an Approved condition
    pub fn is_approved(&self) -> bool {
        self.conditions.iter().any(|c| c.is_true(CONDITION_APPROVED))
    }

    /// The attached certificate, ignoring an empty field
    pub fn signed_certificate(&self) -> Option<&[u8]> {
        self.certificate.as_deref().filter(|c| !c.is_empty())
    }

    /// State implied by this status
    pub fn state(&self) -> SigningState {
        if self.signed_certificate().is_some() {
            SigningState::Signed
        } else if self.refusal().is_some() {
            SigningState::Failed
        } else if self.is_approved() {
            SigningState::Approved
        } else {
            SigningState::Pending
        }
    }
}
