//! Service account identities
//!
//! An [`Identity`] is resolved once from a `(namespace, account)` pair and never
//! changes afterwards. Every name the pipeline needs - the service name used in
//! DNS SANs, the secret name, the signing request name - is derived from it here.

use std::fmt;

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::{SECRET_NAME_PREFIX, SERVICE_ACCOUNT_SUFFIX};

/// Length of the random suffix appended to unique signing request names
const REQUEST_SUFFIX_LEN: usize = 5;

/// A namespace-scoped workload account for which a certificate is issued
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Identity {
    namespace: String,
    account_name: String,
    service_name: String,
}

impl Identity {
    /// Resolve an identity from a service account's namespace and name.
    ///
    /// The service name drops a trailing `-service-account`, a common naming
    /// pattern where the account and its service share a stem.
    pub fn new(namespace: impl Into<String>, account_name: impl Into<String>) -> Self {
        let account_name = account_name.into();
        let service_name = derive_service_name(&account_name).to_string();
        Self {
            namespace: namespace.into(),
            account_name,
            service_name,
        }
    }

    /// Build an identity whose service name is given explicitly rather than derived
    pub fn with_service_name(
        namespace: impl Into<String>,
        account_name: impl Into<String>,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            account_name: account_name.into(),
            service_name: service_name.into(),
        }
    }

    /// Namespace of the service account
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Name of the service account
    pub fn account_name(&self) -> &str {
        &self.account_name
    }

    /// Service name used for the subject and DNS SANs
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Name of the secret that holds this identity's key and certificate
    pub fn secret_name(&self) -> String {
        format!("{}{}", SECRET_NAME_PREFIX, self.account_name)
    }

    /// Fixed signing request name, `<service>.<namespace>`
    pub fn request_name(&self) -> String {
        format!("{}.{}", self.service_name, self.namespace)
    }

    /// Signing request name with a random suffix, unique per attempt
    pub fn unique_request_name(&self) -> String {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .map(|b| (b as char).to_ascii_lowercase())
            .take(REQUEST_SUFFIX_LEN)
            .collect();
        format!("{}-{}", self.request_name(), suffix)
    }

    /// SPIFFE identifier for this account in the given trust domain
    pub fn spiffe_id(&self, trust_domain: &str) -> String {
        format!(
            "spiffe://{}/ns/{}/sa/{}",
            trust_domain, self.namespace, self.account_name
        )
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.account_name)
    }
}

/// Strip the service account suffix, if present
pub fn derive_service_name(account_name: &str) -> &str {
    match account_name.strip_suffix(SERVICE_ACCOUNT_SUFFIX) {
        Some(stem) if !stem.is_empty() => stem,
        _ => account_name,
    }
}
