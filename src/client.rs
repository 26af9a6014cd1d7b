//! Cluster API seams
//!
//! The pipeline reaches the cluster only through these traits so that each step
//! can be tested against mocks and the whole issuance against an in-memory
//! cluster. [`KubeClusterClient`] is the production implementation over kube-rs.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use k8s_openapi::api::certificates::v1::{CertificateSigningRequest, CertificateSigningRequestSpec};
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::error::is_api_status;
use crate::feeder::IdentityEvent;
use crate::identity::Identity;
use crate::secret::{merge_on_conflict, SecretRecord, MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use crate::signing::{SigningCondition, SigningRequestSpec, SigningRequestStatus};
use crate::{Error, Result, FIELD_MANAGER};

/// Operations on cluster-scoped CertificateSigningRequests
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SigningRequestApi: Send + Sync {
    /// Create a request.
    ///
    /// Fails with [`Error::DuplicateRequest`] if the name is taken.
    async fn create(&self, spec: &SigningRequestSpec) -> Result<()>;

    /// Add an Approved condition to the request
    async fn approve(&self, name: &str, reason: &str, message: &str) -> Result<()>;

    /// Read the current status of the request
    async fn status(&self, name: &str) -> Result<SigningRequestStatus>;
}

/// Operations on key-and-cert Secrets
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretApi: Send + Sync {
    /// Read a secret, `None` if it does not exist
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<SecretRecord>>;

    /// Create the secret, or replace it if it already exists.
    ///
    /// A lost update is resolved with [`merge_on_conflict`] against the stored
    /// object and written once more; a second conflict fails with
    /// [`Error::Conflict`]. A secret deleted since it was read is created
    /// again. Returns what was stored.
    async fn upsert(&self, record: &SecretRecord, cert_entry: &str) -> Result<SecretRecord>;
}

/// Enumeration of service accounts
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IdentityApi: Send + Sync {
    /// All service accounts in all namespaces, in list order
    async fn list_identities(&self) -> Result<Vec<Identity>>;
}

/// kube-rs backed implementation of all cluster seams
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Create a new KubeClusterClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Stream of service account changes across all namespaces
    pub fn watch_identities(&self) -> impl Stream<Item = Result<IdentityEvent>> + Send + 'static {
        watch_identities(self.client.clone())
    }

    fn csr_api(&self) -> Api<CertificateSigningRequest> {
        Api::all(self.client.clone())
    }

    fn secret_api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl SigningRequestApi for KubeClusterClient {
    async fn create(&self, spec: &SigningRequestSpec) -> Result<()> {
        let csr = CertificateSigningRequest {
            metadata: ObjectMeta {
                name: Some(spec.name.clone()),
                labels: Some(
                    [(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string())].into(),
                ),
                ..Default::default()
            },
            spec: CertificateSigningRequestSpec {
                request: ByteString(spec.request_pem.clone()),
                signer_name: spec.signer_name.clone(),
                usages: Some(spec.usages.clone()),
                ..Default::default()
            },
            status: None,
        };

        match self.csr_api().create(&PostParams::default(), &csr).await {
            Ok(_) => Ok(()),
            Err(e) if is_api_status(&e, 409) => Err(Error::DuplicateRequest {
                name: spec.name.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn approve(&self, name: &str, reason: &str, message: &str) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let patch = serde_json::json!({
            "status": {
                "conditions": [{
                    "type": crate::signing::CONDITION_APPROVED,
                    "status": "True",
                    "reason": reason,
                    "message": message,
                    "lastUpdateTime": now,
                }]
            }
        });

        self.csr_api()
            .patch_subresource(
                "approval",
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn status(&self, name: &str) -> Result<SigningRequestStatus> {
        let csr = self.csr_api().get(name).await?;
        let status = csr.status.unwrap_or_default();

        Ok(SigningRequestStatus {
            certificate: status.certificate.map(|c| c.0),
            conditions: status
                .conditions
                .unwrap_or_default()
                .into_iter()
                .map(|c| SigningCondition {
                    type_: c.type_,
                    status: c.status,
                    reason: c.reason,
                    message: c.message,
                })
                .collect(),
        })
    }
}

#[async_trait]
impl SecretApi for KubeClusterClient {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<SecretRecord>> {
        let secret = self.secret_api(namespace).get_opt(name).await?;
        Ok(secret.map(SecretRecord::from_secret))
    }

    async fn upsert(&self, record: &SecretRecord, cert_entry: &str) -> Result<SecretRecord> {
        let api = self.secret_api(&record.namespace);
        let params = PostParams::default();

        let first = if record.exists() {
            api.replace(&record.name, &params, &record.to_secret()).await
        } else {
            api.create(&params, &record.to_secret()).await
        };

        let err = match first {
            Ok(stored) => return Ok(SecretRecord::from_secret(stored)),
            Err(e) => e,
        };

        let second = match write_recovery(&err, record.exists()) {
            Some(WriteRecovery::Merge) => {
                warn!(
                    namespace = %record.namespace,
                    name = %record.name,
                    error = %err,
                    "secret changed concurrently, merging certificate into stored copy"
                );
                match api.get_opt(&record.name).await? {
                    Some(stored) => {
                        let merged = merge_on_conflict(
                            SecretRecord::from_secret(stored),
                            record,
                            cert_entry,
                        )?;
                        api.replace(&record.name, &params, &merged.to_secret()).await
                    }
                    None => api.create(&params, &recreated(record)).await,
                }
            }
            Some(WriteRecovery::Recreate) => {
                debug!(
                    namespace = %record.namespace,
                    name = %record.name,
                    "secret vanished, recreating"
                );
                api.create(&params, &recreated(record)).await
            }
            None => return Err(err.into()),
        };

        match second {
            Ok(stored) => Ok(SecretRecord::from_secret(stored)),
            Err(e) if is_api_status(&e, 409) => Err(Error::Conflict {
                namespace: record.namespace.clone(),
                name: record.name.clone(),
                message: e.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

/// How a failed secret write is recovered
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WriteRecovery {
    /// Someone else wrote first: re-read and merge
    Merge,
    /// The secret was deleted after it was read: create it again
    Recreate,
}

fn write_recovery(err: &kube::Error, replacing: bool) -> Option<WriteRecovery> {
    if is_api_status(err, 409) {
        Some(WriteRecovery::Merge)
    } else if replacing && is_api_status(err, 404) {
        Some(WriteRecovery::Recreate)
    } else {
        None
    }
}

/// The record as a new object, without the stale resourceVersion
fn recreated(record: &SecretRecord) -> Secret {
    let mut fresh = record.clone();
    fresh.resource_version = None;
    fresh.to_secret()
}

#[async_trait]
impl IdentityApi for KubeClusterClient {
    async fn list_identities(&self) -> Result<Vec<Identity>> {
        let api: Api<ServiceAccount> = Api::all(self.client.clone());
        let accounts = api.list(&ListParams::default()).await?;
        Ok(accounts.items.iter().filter_map(identity_of).collect())
    }
}

/// Stream of service account changes, with the watcher's default backoff
pub fn watch_identities(
    client: Client,
) -> impl Stream<Item = Result<IdentityEvent>> + Send + 'static {
    let api: Api<ServiceAccount> = Api::all(client);
    watcher(api, watcher::Config::default())
        .default_backoff()
        .filter_map(|event| async move {
            match event {
                Ok(watcher::Event::Apply(sa)) | Ok(watcher::Event::InitApply(sa)) => {
                    identity_of(&sa).map(|id| Ok(IdentityEvent::Applied(id)))
                }
                Ok(watcher::Event::Delete(sa)) => {
                    identity_of(&sa).map(|id| Ok(IdentityEvent::Deleted(id)))
                }
                Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => None,
                Err(e) => Some(Err(Error::Watch(e.to_string()))),
            }
        })
}

fn identity_of(sa: &ServiceAccount) -> Option<Identity> {
    let namespace = sa.namespace()?;
    Some(Identity::new(namespace, sa.name_any()))
}
