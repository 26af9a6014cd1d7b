//! Issuer configuration
//!
//! Resolved once at startup and shared read-only with every issuance.

use std::collections::HashSet;
use std::time::Duration;

use crate::retry::RetryConfig;
use crate::secret::cert_entry_key;
use crate::signing::{DEFAULT_POLL_INTERVAL, DEFAULT_SIGNING_TIMEOUT};
use crate::{Error, Result, DEFAULT_CHAIN_PREFIX, DEFAULT_SIGNER_NAME, DEFAULT_TRUST_DOMAIN};

/// Settings shared by every issuance
#[derive(Clone, Debug, PartialEq)]
pub struct IssuerConfig {
    /// Trust domain used in SPIFFE ids
    pub trust_domain: String,
    /// Prefix of the certificate chain entry
    pub chain_prefix: String,
    /// Namespaces to issue for; empty means all
    pub namespaces: HashSet<String>,
    /// signerName requested on every signing request
    pub signer_name: String,
    /// Interval between signing request status reads
    pub poll_interval: Duration,
    /// How long to wait for the signer
    pub signing_timeout: Duration,
    /// Append a random suffix to request names so re-issuance never collides
    pub unique_request_names: bool,
    /// Add the SPIFFE id as a URI SAN
    pub include_spiffe_san: bool,
    /// Retry policy for a whole issuance
    pub retry: RetryConfig,
    /// Issuances allowed to run at once across distinct identities
    pub max_concurrent_issuances: usize,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            trust_domain: DEFAULT_TRUST_DOMAIN.to_string(),
            chain_prefix: DEFAULT_CHAIN_PREFIX.to_string(),
            namespaces: HashSet::new(),
            signer_name: DEFAULT_SIGNER_NAME.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            signing_timeout: DEFAULT_SIGNING_TIMEOUT,
            unique_request_names: true,
            include_spiffe_san: false,
            retry: RetryConfig::default(),
            max_concurrent_issuances: 1,
        }
    }
}

impl IssuerConfig {
    /// Restrict issuance to the given namespaces. Empty names are dropped.
    pub fn with_namespaces<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.namespaces = namespaces
            .into_iter()
            .map(|ns| ns.as_ref().trim().to_string())
            .filter(|ns| !ns.is_empty())
            .collect();
        self
    }

    /// Whether identities in `namespace` are issued for
    pub fn allows_namespace(&self, namespace: &str) -> bool {
        self.namespaces.is_empty() || self.namespaces.contains(namespace)
    }

    /// Secret entry holding the certificate chain
    pub fn cert_entry(&self) -> String {
        cert_entry_key(&self.chain_prefix)
    }

    /// Reject settings that would make every issuance fail
    pub fn validate(&self) -> Result<()> {
        if self.trust_domain.trim().is_empty() {
            return Err(Error::config("trust domain must not be empty"));
        }
        if self.chain_prefix.contains('/') {
            return Err(Error::config(format!(
                "chain prefix {:?} must not contain '/'",
                self.chain_prefix
            )));
        }
        if !self.signer_name.contains('/') {
            return Err(Error::config(format!(
                "signer name {:?} must be of the form <domain>/<path>",
                self.signer_name
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::config("poll interval must be greater than zero"));
        }
        if self.signing_timeout.is_zero() {
            return Err(Error::config("signing timeout must be greater than zero"));
        }
        if self.max_concurrent_issuances == 0 {
            return Err(Error::config("at least one concurrent issuance is required"));
        }
        Ok(())
    }
}
