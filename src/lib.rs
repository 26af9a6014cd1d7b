//! sa-certgen - cluster-signed workload certificates for Kubernetes service accounts
//!
//! For every service account it is pointed at, sa-certgen produces an RSA key and a
//! PKCS#10 request, submits the request to the cluster's certificates.k8s.io API,
//! approves it, waits for the signer to attach a certificate and stores key and
//! certificate in an `istio.io/key-and-cert` Secret next to the account.
//!
//! # Architecture
//!
//! Issuance for one identity is a strictly linear pipeline:
//!
//! ```text
//! fetch secret -> build CSR -> submit -> approve -> await signature -> persist
//! ```
//!
//! Each step talks to the cluster only through the traits in [`client`], so the
//! whole pipeline runs against an in-memory cluster in tests.
//!
//! # Modules
//!
//! - [`identity`] - Service account identities and the names derived from them
//! - [`pki`] - Key reuse/generation and certificate request encoding
//! - [`secret`] - Key-and-cert secret records and their persistence
//! - [`client`] - Cluster API seams (signing requests, secrets, service accounts)
//! - [`signing`] - Signing request submission, approval and polling
//! - [`controller`] - The per-identity issuance state machine
//! - [`feeder`] - Batch and watch drivers that feed identities to the controller
//! - [`export`] - Writing secret entries to local files
//! - [`config`] - Issuer configuration
//! - [`retry`] - Retry with exponential backoff
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod export;
pub mod feeder;
pub mod identity;
pub mod pki;
pub mod retry;
pub mod secret;
pub mod signing;

#[cfg(test)]
pub(crate) mod testing;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Secret data entry holding the PKCS#1 private key
pub const KEY_PEM_ENTRY: &str = "key.pem";

/// Suffix of the secret data entry holding the signed certificate.
///
/// The full entry name is `<prefix>cert-chain.pem`.
pub const CERT_CHAIN_SUFFIX: &str = "cert-chain.pem";

/// Secret type tag for key-and-cert secrets consumed by the mesh sidecar
pub const KEY_AND_CERT_SECRET_TYPE: &str = "istio.io/key-and-cert";

/// Prefix of the secret name derived from a service account name
pub const SECRET_NAME_PREFIX: &str = "istio.";

/// Service account suffix stripped when deriving the service name
pub const SERVICE_ACCOUNT_SUFFIX: &str = "-service-account";

/// Trust domain used when `TRUST_DOMAIN` is not set
pub const DEFAULT_TRUST_DOMAIN: &str = "cluster.local";

/// Prefix of the certificate chain entry when `CHAIN_PREFIX` is not set
pub const DEFAULT_CHAIN_PREFIX: &str = "k8s.";

/// Signer name requested when none is configured
pub const DEFAULT_SIGNER_NAME: &str = "sa-certgen.io/workload";

/// Field manager used for approval patches
pub const FIELD_MANAGER: &str = "sa-certgen";

/// RSA modulus size for generated keys
pub const RSA_KEY_BITS: usize = 2048;
