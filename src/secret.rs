//! Key-and-cert secret records
//!
//! A [`SecretRecord`] is the in-memory form of the identity's Secret. It is fetched
//! (or created empty) once per issuance, gains `key.pem` when a key is generated,
//! gains the certificate entry once the signer answers, and is persisted exactly
//! once at the end through [`SecretApi::upsert`].

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use tracing::{debug, info};

use crate::client::SecretApi;
use crate::{Error, Result, CERT_CHAIN_SUFFIX, KEY_AND_CERT_SECRET_TYPE, KEY_PEM_ENTRY};

/// Label marking secrets written by this tool
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`]
pub const MANAGED_BY_VALUE: &str = "sa-certgen";

/// Name of the certificate chain entry for the given prefix
pub fn cert_entry_key(prefix: &str) -> String {
    format!("{}{}", prefix, CERT_CHAIN_SUFFIX)
}

/// The persisted container holding a private key and its signed certificate
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SecretRecord {
    /// Secret namespace
    pub namespace: String,
    /// Secret name
    pub name: String,
    /// Secret type
    pub type_: String,
    /// Data entries keyed by file name
    pub data: BTreeMap<String, Vec<u8>>,
    /// Resource version of the stored object; `None` until persisted
    pub resource_version: Option<String>,
}

impl SecretRecord {
    /// An empty key-and-cert record that does not exist in the cluster yet
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            type_: KEY_AND_CERT_SECRET_TYPE.to_string(),
            data: BTreeMap::new(),
            resource_version: None,
        }
    }

    /// Whether this record was read from the cluster
    pub fn exists(&self) -> bool {
        self.resource_version.is_some()
    }

    /// The stored private key, if present and non-empty
    pub fn key_pem(&self) -> Option<&[u8]> {
        self.data
            .get(KEY_PEM_ENTRY)
            .map(Vec::as_slice)
            .filter(|b| !b.is_empty())
    }

    /// Convert a Secret read from the API server
    pub fn from_secret(secret: Secret) -> Self {
        let data = secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect();
        Self {
            namespace: secret.metadata.namespace.unwrap_or_default(),
            name: secret.metadata.name.unwrap_or_default(),
            type_: secret.type_.unwrap_or_default(),
            data,
            resource_version: secret.metadata.resource_version,
        }
    }

    /// Convert into a Secret for create or replace
    pub fn to_secret(&self) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version: self.resource_version.clone(),
                labels: Some(BTreeMap::from([(
                    MANAGED_BY_LABEL.to_string(),
                    MANAGED_BY_VALUE.to_string(),
                )])),
                ..Default::default()
            },
            type_: Some(self.type_.clone()),
            data: Some(
                self.data
                    .iter()
                    .map(|(k, v)| (k.clone(), ByteString(v.clone())))
                    .collect(),
            ),
            ..Default::default()
        }
    }
}

/// Resolve a lost update on persist.
///
/// `stored` is what the API server holds now, `ours` what we tried to write. The
/// result is `stored` with our certificate entry and type applied. Our key is
/// only carried over when `stored` has none; if `stored` holds a different key,
/// our certificate does not match it and the merge is refused with
/// [`Error::Conflict`].
pub fn merge_on_conflict(
    stored: SecretRecord,
    ours: &SecretRecord,
    cert_entry: &str,
) -> Result<SecretRecord> {
    let mut merged = stored;

    match (merged.key_pem(), ours.key_pem()) {
        (Some(theirs), Some(mine)) if theirs != mine => {
            return Err(Error::Conflict {
                namespace: merged.namespace.clone(),
                name: merged.name.clone(),
                message: "stored key changed while the certificate was being issued".to_string(),
            });
        }
        (None, Some(mine)) => {
            merged.data.insert(KEY_PEM_ENTRY.to_string(), mine.to_vec());
        }
        _ => {}
    }

    if let Some(cert) = ours.data.get(cert_entry) {
        merged.data.insert(cert_entry.to_string(), cert.clone());
    }
    merged.type_ = ours.type_.clone();
    Ok(merged)
}

/// Writes the signed certificate into the record and persists it
pub struct SecretMaterializer {
    secrets: Arc<dyn SecretApi>,
}

impl SecretMaterializer {
    /// Create a materializer backed by the given secret store
    pub fn new(secrets: Arc<dyn SecretApi>) -> Self {
        Self { secrets }
    }

    /// Store `cert_pem` under `cert_entry` and create-or-update the secret.
    ///
    /// Any previous certificate entry is overwritten; `key.pem` is left as is.
    /// On success `record` is replaced by what the API server stored.
    pub async fn materialize(
        &self,
        record: &mut SecretRecord,
        cert_pem: &[u8],
        cert_entry: &str,
    ) -> Result<()> {
        record
            .data
            .insert(cert_entry.to_string(), cert_pem.to_vec());

        let created = !record.exists();
        debug!(
            namespace = %record.namespace,
            name = %record.name,
            created,
            "persisting secret"
        );

        let stored = self.secrets.upsert(record, cert_entry).await?;
        info!(
            namespace = %stored.namespace,
            name = %stored.name,
            created,
            "secret persisted"
        );
        *record = stored;
        Ok(())
    }
}
