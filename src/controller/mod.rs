//! Per-identity issuance
//!
//! [`IssuanceOrchestrator`] runs one identity through the pipeline:
//!
//! ```text
//! Fetching -> BuildingCsr -> Submitted -> Approved -> AwaitingSignature -> Materializing -> Done
//! ```
//!
//! The transitions are strictly linear. A failing step moves straight to
//! `Failed` and the error, attributed to the step and the identity, is returned.
//! Whether a failed issuance is repeated is decided by the configured
//! [`RetryConfig`](crate::retry::RetryConfig); a key generated by a failed
//! attempt is carried into the next so retries never mint a second key.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::client::{SecretApi, SigningRequestApi};
use crate::config::IssuerConfig;
use crate::identity::Identity;
use crate::pki::{self, CertificateRequest, CertificateSummary};
use crate::retry::retry_with_backoff_if;
use crate::secret::{SecretMaterializer, SecretRecord};
use crate::signing::{CertificateWaiter, CsrSubmitter, SERVER_USAGES};
use crate::{Error, Result, KEY_PEM_ENTRY};

/// Namespace of the intermediary CA secret
pub const INTERMEDIARY_NAMESPACE: &str = "istio-system";

/// Name of the intermediary CA secret
pub const INTERMEDIARY_SECRET_NAME: &str = "intermediary2";

/// Service name the intermediary CA certificate is issued for
pub const INTERMEDIARY_SERVICE_NAME: &str = "intermediary-ca2";

/// A step of the pipeline, used to attribute errors
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IssuanceStep {
    /// Reading the identity's secret
    Fetch,
    /// Loading or generating the key and encoding the request
    BuildCsr,
    /// Creating the signing request
    Submit,
    /// Approving the signing request
    Approve,
    /// Waiting for the signer
    AwaitSignature,
    /// Persisting key and certificate
    Materialize,
}

impl fmt::Display for IssuanceStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Fetch => "fetching secret",
            Self::BuildCsr => "building certificate request",
            Self::Submit => "submitting signing request",
            Self::Approve => "approving signing request",
            Self::AwaitSignature => "awaiting signature",
            Self::Materialize => "persisting secret",
        };
        f.write_str(s)
    }
}

/// States an issuance passes through
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IssuanceState {
    /// Reading the secret
    Fetching,
    /// Building the request
    BuildingCsr,
    /// Request created
    Submitted,
    /// Request approved
    Approved,
    /// Polling for the certificate
    AwaitingSignature,
    /// Writing the secret
    Materializing,
    /// Secret persisted
    Done,
    /// A step failed
    Failed,
}

/// Wall-clock time spent in each step. Diagnostic only.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StepTimings {
    /// Reading the secret
    pub fetch: Duration,
    /// Key handling and request encoding
    pub build_csr: Duration,
    /// Creating the signing request
    pub submit: Duration,
    /// Approving it
    pub approve: Duration,
    /// Waiting for the signer
    pub sign: Duration,
    /// Persisting the secret
    pub persist: Duration,
}

impl StepTimings {
    /// Sum of all steps
    pub fn total(&self) -> Duration {
        self.fetch + self.build_csr + self.submit + self.approve + self.sign + self.persist
    }
}

/// What to issue: the identity, where its secret lives and how the request is named
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuanceTarget {
    identity: Identity,
    secret_name: String,
    fixed_request_name: Option<String>,
    is_ca: bool,
}

impl IssuanceTarget {
    /// Workload certificate for a service account, stored in `istio.<account>`
    pub fn for_identity(identity: Identity) -> Self {
        let secret_name = identity.secret_name();
        Self {
            identity,
            secret_name,
            fixed_request_name: None,
            is_ca: false,
        }
    }

    /// The intermediary CA: fixed secret, fixed request name, always CA
    pub fn intermediary() -> Self {
        let identity = Identity::with_service_name(
            INTERMEDIARY_NAMESPACE,
            INTERMEDIARY_SECRET_NAME,
            INTERMEDIARY_SERVICE_NAME,
        );
        let fixed_request_name = Some(identity.request_name());
        Self {
            identity,
            secret_name: INTERMEDIARY_SECRET_NAME.to_string(),
            fixed_request_name,
            is_ca: true,
        }
    }

    /// The identity being issued for
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Name of the secret in the identity's namespace
    pub fn secret_name(&self) -> &str {
        &self.secret_name
    }

    /// Whether a CA certificate is requested
    pub fn is_ca(&self) -> bool {
        self.is_ca
    }

    fn request_name(&self, unique: bool) -> String {
        match &self.fixed_request_name {
            Some(name) => name.clone(),
            None if unique => self.identity.unique_request_name(),
            None => self.identity.request_name(),
        }
    }
}

/// Result of a successful issuance
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuanceReport {
    /// `namespace/account`
    pub identity: String,
    /// Secret that was written
    pub secret_name: String,
    /// Signing request of the successful attempt
    pub request_name: String,
    /// Whether `key.pem` is new rather than read from the stored secret
    pub key_generated: bool,
    /// States passed through by the successful attempt
    pub states: Vec<IssuanceState>,
    /// Step durations of the successful attempt
    pub timings: StepTimings,
    /// Attempts made, including the successful one
    pub attempts: u32,
    /// Subject, issuer and expiry of the certificate, if it could be parsed
    pub certificate: Option<CertificateSummary>,
}

/// What [`IssuanceOrchestrator::issue`] did for an identity
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IssuanceOutcome {
    /// A certificate was issued and persisted
    Issued(IssuanceReport),
    /// The identity's namespace is not on the allow-list; nothing was touched
    Skipped,
}

/// Tracks the state history and step timings of one attempt
struct Progress {
    states: Vec<IssuanceState>,
    timings: StepTimings,
    mark: Instant,
}

impl Progress {
    fn start() -> Self {
        Self {
            states: vec![IssuanceState::Fetching],
            timings: StepTimings::default(),
            mark: Instant::now(),
        }
    }

    fn enter(&mut self, state: IssuanceState) {
        self.states.push(state);
    }

    /// Time since the previous lap
    fn lap(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now - self.mark;
        self.mark = now;
        elapsed
    }
}

/// Sequences fetch, build, submit, approve, wait and persist for one identity
pub struct IssuanceOrchestrator {
    config: Arc<IssuerConfig>,
    secrets: Arc<dyn SecretApi>,
    submitter: CsrSubmitter,
    waiter: CertificateWaiter,
    materializer: SecretMaterializer,
}

impl IssuanceOrchestrator {
    /// Create an orchestrator over the given cluster seams
    pub fn new(
        config: Arc<IssuerConfig>,
        signing: Arc<dyn SigningRequestApi>,
        secrets: Arc<dyn SecretApi>,
    ) -> Self {
        let submitter = CsrSubmitter::new(signing.clone(), config.signer_name.clone());
        let waiter = CertificateWaiter::new(signing, config.poll_interval);
        let materializer = SecretMaterializer::new(secrets.clone());
        Self {
            config,
            secrets,
            submitter,
            waiter,
            materializer,
        }
    }

    /// The configuration every issuance runs with
    pub fn config(&self) -> &IssuerConfig {
        &self.config
    }

    /// Issue a workload certificate for `identity`.
    ///
    /// Identities outside a non-empty namespace allow-list are skipped without
    /// touching the cluster.
    #[instrument(skip_all, fields(identity = %identity))]
    pub async fn issue(&self, identity: &Identity) -> Result<IssuanceOutcome> {
        if !self.config.allows_namespace(identity.namespace()) {
            debug!("namespace not in allow-list, skipping");
            return Ok(IssuanceOutcome::Skipped);
        }

        let target = IssuanceTarget::for_identity(identity.clone());
        self.run(&target).await.map(IssuanceOutcome::Issued)
    }

    /// Issue the intermediary CA certificate into `istio-system/intermediary2`.
    ///
    /// The allow-list does not apply.
    #[instrument(skip(self))]
    pub async fn issue_intermediary(&self) -> Result<IssuanceReport> {
        self.run(&IssuanceTarget::intermediary()).await
    }

    /// Run `target` under the retry policy
    pub async fn run(&self, target: &IssuanceTarget) -> Result<IssuanceReport> {
        let attempts = AtomicU32::new(0);
        let carried_key = Mutex::new(None);
        let unique = self.config.unique_request_names && target.fixed_request_name.is_none();
        let operation = format!("issue {}", target.identity);

        let mut report = retry_with_backoff_if(
            &self.config.retry,
            &operation,
            |e: &Error| {
                e.is_retryable() || (unique && matches!(e.root(), Error::DuplicateRequest { .. }))
            },
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                self.attempt(target, &carried_key)
            },
        )
        .await?;

        report.attempts = attempts.load(Ordering::SeqCst);
        Ok(report)
    }

    async fn attempt(
        &self,
        target: &IssuanceTarget,
        carried_key: &Mutex<Option<Vec<u8>>>,
    ) -> Result<IssuanceReport> {
        let mut progress = Progress::start();
        let result = self.pipeline(target, carried_key, &mut progress).await;

        if let Err(e) = &result {
            progress.enter(IssuanceState::Failed);
            error!(
                identity = %target.identity,
                step = ?e.step(),
                states = ?progress.states,
                error = %e,
                "issuance failed"
            );
        }
        result
    }

    async fn pipeline(
        &self,
        target: &IssuanceTarget,
        carried_key: &Mutex<Option<Vec<u8>>>,
        progress: &mut Progress,
    ) -> Result<IssuanceReport> {
        let identity = &target.identity;
        let namespace = identity.namespace();
        let fail = |step: IssuanceStep| move |e: Error| e.during(identity.to_string(), step);

        let mut record = self
            .secrets
            .get(namespace, &target.secret_name)
            .await
            .map_err(fail(IssuanceStep::Fetch))?
            .unwrap_or_else(|| SecretRecord::new(namespace, target.secret_name.as_str()));
        let mut carried_over = false;
        if record.key_pem().is_none() {
            let carried = lock(carried_key).clone();
            if let Some(key) = carried {
                debug!("reusing key generated by a previous attempt");
                record.data.insert(KEY_PEM_ENTRY.to_string(), key);
                carried_over = true;
            }
        }
        progress.timings.fetch = progress.lap();

        progress.enter(IssuanceState::BuildingCsr);
        let key = pki::load_or_generate_key(&mut record).map_err(fail(IssuanceStep::BuildCsr))?;
        let key_generated = key.was_generated() || carried_over;
        if key.was_generated() {
            *lock(carried_key) = Some(key.encoded_pem().to_vec());
        }
        let mut request =
            CertificateRequest::for_service(namespace, identity.service_name(), target.is_ca);
        if self.config.include_spiffe_san && !target.is_ca {
            request = request.with_uri_san(identity.spiffe_id(&self.config.trust_domain));
        }
        let csr_pem = request
            .encode(key.private_key())
            .map_err(fail(IssuanceStep::BuildCsr))?;
        debug!(csr = %csr_pem, "encoded certificate request");
        progress.timings.build_csr = progress.lap();

        let request_name = target.request_name(self.config.unique_request_names);
        let mut handle = self
            .submitter
            .submit(csr_pem.as_bytes(), &request_name, SERVER_USAGES)
            .await
            .map_err(fail(IssuanceStep::Submit))?;
        progress.enter(IssuanceState::Submitted);
        progress.timings.submit = progress.lap();

        self.submitter
            .approve(&mut handle)
            .await
            .map_err(fail(IssuanceStep::Approve))?;
        progress.enter(IssuanceState::Approved);
        progress.timings.approve = progress.lap();

        progress.enter(IssuanceState::AwaitingSignature);
        let cert = self
            .waiter
            .wait_for_certificate(&mut handle, self.config.signing_timeout)
            .await
            .map_err(fail(IssuanceStep::AwaitSignature))?;
        progress.timings.sign = progress.lap();

        progress.enter(IssuanceState::Materializing);
        self.materializer
            .materialize(&mut record, &cert, &self.config.cert_entry())
            .await
            .map_err(fail(IssuanceStep::Materialize))?;
        progress.timings.persist = progress.lap();
        progress.enter(IssuanceState::Done);

        let certificate = match pki::describe_certificate(&cert) {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!(request = %request_name, error = %e, "signed certificate could not be parsed");
                None
            }
        };

        let timings = progress.timings;
        info!(
            namespace = %namespace,
            name = %target.secret_name,
            request = %request_name,
            key_generated,
            fetch_ms = timings.fetch.as_millis() as u64,
            build_ms = timings.build_csr.as_millis() as u64,
            submit_ms = timings.submit.as_millis() as u64,
            approve_ms = timings.approve.as_millis() as u64,
            sign_ms = timings.sign.as_millis() as u64,
            persist_ms = timings.persist.as_millis() as u64,
            elapsed_ms = timings.total().as_millis() as u64,
            "certificate issued"
        );

        Ok(IssuanceReport {
            identity: identity.to_string(),
            secret_name: target.secret_name.clone(),
            request_name,
            key_generated,
            states: progress.states.clone(),
            timings,
            attempts: 1,
            certificate,
        })
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
