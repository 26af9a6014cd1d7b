//! In-memory cluster for pipeline tests
//!
//! [`FakeCluster`] implements every client trait over plain maps and signs
//! approved requests with a throwaway CA according to a scripted
//! [`SignerBehavior`].

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, DnValue, IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::*;

use crate::client::{IdentityApi, SecretApi, SigningRequestApi};
use crate::identity::Identity;
use crate::secret::{merge_on_conflict, SecretRecord};
use crate::signing::{
    SigningCondition, SigningRequestSpec, SigningRequestStatus, CONDITION_APPROVED,
    CONDITION_DENIED,
};
use crate::{Error, Result};

/// How the fake signer answers approved requests
#[derive(Clone, Debug)]
pub(crate) enum SignerBehavior {
    /// Sign with the test CA on the first poll after approval
    Sign,
    /// Sign once the request has been polled more than this many times
    SignAfterPolls(u32),
    /// Attach these bytes as the certificate
    Attach(Vec<u8>),
    /// Deny with this message
    Deny(String),
    /// Never answer
    Never,
}

struct FakeRequest {
    spec: SigningRequestSpec,
    approved: bool,
    certificate: Option<Vec<u8>>,
    refusal: Option<SigningCondition>,
    polls: u32,
}

struct FakeState {
    behavior: SignerBehavior,
    requests: BTreeMap<String, FakeRequest>,
    secrets: BTreeMap<(String, String), SecretRecord>,
    accounts: Vec<Identity>,
    next_version: u64,
    secret_writes: u32,
    merged_writes: u32,
    failing_upserts: u32,
}

impl FakeState {
    fn bump_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

/// Self-signed CA for the fake signer
struct TestAuthority {
    cert_pem: String,
    key_pem: String,
}

impl TestAuthority {
    fn new() -> Self {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String("fake cluster signer".to_string()),
        );
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::DigitalSignature];

        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        Self {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        }
    }

    fn sign(&self, csr_pem: &[u8]) -> std::result::Result<Vec<u8>, String> {
        let csr_pem = std::str::from_utf8(csr_pem).map_err(|e| e.to_string())?;
        let csr = CertificateSigningRequestParams::from_pem(csr_pem).map_err(|e| e.to_string())?;
        let key = KeyPair::from_pem(&self.key_pem).map_err(|e| e.to_string())?;
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &key).map_err(|e| e.to_string())?;
        let cert = csr.signed_by(&issuer).map_err(|e| e.to_string())?;
        Ok(cert.pem().into_bytes())
    }
}

/// In-memory stand-in for the API server and the cluster signer
pub(crate) struct FakeCluster {
    state: Mutex<FakeState>,
    authority: TestAuthority,
}

impl FakeCluster {
    pub(crate) fn new() -> Self {
        Self::with_behavior(SignerBehavior::Sign)
    }

    pub(crate) fn with_behavior(behavior: SignerBehavior) -> Self {
        Self {
            state: Mutex::new(FakeState {
                behavior,
                requests: BTreeMap::new(),
                secrets: BTreeMap::new(),
                accounts: Vec::new(),
                next_version: 0,
                secret_writes: 0,
                merged_writes: 0,
                failing_upserts: 0,
            }),
            authority: TestAuthority::new(),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn set_behavior(&self, behavior: SignerBehavior) {
        self.state().behavior = behavior;
    }

    /// Reject the next `n` secret writes with a conflict
    pub(crate) fn fail_next_upserts(&self, n: u32) {
        self.state().failing_upserts = n;
    }

    pub(crate) fn add_account(&self, namespace: &str, name: &str) {
        self.state().accounts.push(Identity::new(namespace, name));
    }

    /// Store a secret as if another client had written it
    pub(crate) fn put_secret(&self, mut record: SecretRecord) -> SecretRecord {
        let mut state = self.state();
        record.resource_version = Some(state.bump_version());
        state.secrets.insert(
            (record.namespace.clone(), record.name.clone()),
            record.clone(),
        );
        record
    }

    pub(crate) fn secret(&self, namespace: &str, name: &str) -> Option<SecretRecord> {
        self.state()
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub(crate) fn secret_writes(&self) -> u32 {
        self.state().secret_writes
    }

    pub(crate) fn merged_writes(&self) -> u32 {
        self.state().merged_writes
    }

    /// Submitted requests, by name
    pub(crate) fn requests(&self) -> Vec<SigningRequestSpec> {
        self.state()
            .requests
            .values()
            .map(|r| r.spec.clone())
            .collect()
    }

    pub(crate) fn request_polls(&self, name: &str) -> u32 {
        self.state().requests.get(name).map_or(0, |r| r.polls)
    }
}

fn not_found(name: &str) -> Error {
    Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("certificatesigningrequests {:?} not found", name),
        reason: "NotFound".to_string(),
        code: 404,
    }))
}

#[async_trait]
impl SigningRequestApi for FakeCluster {
    async fn create(&self, spec: &SigningRequestSpec) -> Result<()> {
        let mut state = self.state();
        if state.requests.contains_key(&spec.name) {
            return Err(Error::DuplicateRequest {
                name: spec.name.clone(),
            });
        }
        state.requests.insert(
            spec.name.clone(),
            FakeRequest {
                spec: spec.clone(),
                approved: false,
                certificate: None,
                refusal: None,
                polls: 0,
            },
        );
        Ok(())
    }

    async fn approve(&self, name: &str, _reason: &str, _message: &str) -> Result<()> {
        let mut state = self.state();
        let request = state.requests.get_mut(name).ok_or_else(|| not_found(name))?;
        request.approved = true;
        Ok(())
    }

    async fn status(&self, name: &str) -> Result<SigningRequestStatus> {
        let mut state = self.state();
        let behavior = state.behavior.clone();
        let request = state.requests.get_mut(name).ok_or_else(|| not_found(name))?;
        request.polls += 1;

        if request.approved && request.certificate.is_none() && request.refusal.is_none() {
            let sign_now = match behavior {
                SignerBehavior::Sign => true,
                SignerBehavior::SignAfterPolls(n) => request.polls > n,
                SignerBehavior::Attach(bytes) => {
                    request.certificate = Some(bytes);
                    false
                }
                SignerBehavior::Deny(message) => {
                    request.refusal = Some(SigningCondition {
                        type_: CONDITION_DENIED.to_string(),
                        status: "True".to_string(),
                        reason: Some("PolicyViolation".to_string()),
                        message: Some(message),
                    });
                    false
                }
                SignerBehavior::Never => false,
            };
            if sign_now {
                match self.authority.sign(&request.spec.request_pem) {
                    Ok(cert) => request.certificate = Some(cert),
                    Err(e) => {
                        request.refusal = Some(SigningCondition {
                            type_: crate::signing::CONDITION_FAILED.to_string(),
                            status: "True".to_string(),
                            reason: Some("SignerError".to_string()),
                            message: Some(e),
                        })
                    }
                }
            }
        }

        let mut conditions = Vec::new();
        if request.approved {
            conditions.push(SigningCondition {
                type_: CONDITION_APPROVED.to_string(),
                status: "True".to_string(),
                reason: Some("AutoApproved".to_string()),
                message: None,
            });
        }
        conditions.extend(request.refusal.clone());

        Ok(SigningRequestStatus {
            certificate: request.certificate.clone(),
            conditions,
        })
    }
}

#[async_trait]
impl SecretApi for FakeCluster {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<SecretRecord>> {
        Ok(self.secret(namespace, name))
    }

    async fn upsert(&self, record: &SecretRecord, cert_entry: &str) -> Result<SecretRecord> {
        let mut state = self.state();
        if state.failing_upserts > 0 {
            state.failing_upserts -= 1;
            return Err(Error::Conflict {
                namespace: record.namespace.clone(),
                name: record.name.clone(),
                message: "the object has been modified".to_string(),
            });
        }
        state.secret_writes += 1;
        let key = (record.namespace.clone(), record.name.clone());

        let mut stored = match state.secrets.get(&key).cloned() {
            Some(current) if current.resource_version != record.resource_version => {
                state.merged_writes += 1;
                merge_on_conflict(current, record, cert_entry)?
            }
            _ => record.clone(),
        };
        stored.resource_version = Some(state.bump_version());
        state.secrets.insert(key, stored.clone());
        Ok(stored)
    }
}

#[async_trait]
impl IdentityApi for FakeCluster {
    async fn list_identities(&self) -> Result<Vec<Identity>> {
        Ok(self.state().accounts.clone())
    }
}

fn pem_contents(pem_bytes: &[u8]) -> Vec<u8> {
    ::pem::parse(pem_bytes).unwrap().contents().to_vec()
}

/// DNS SANs of a PEM certificate, in order
pub(crate) fn certificate_dns_names(cert_pem: &[u8]) -> Vec<String> {
    let der = pem_contents(cert_pem);
    let (_, cert) = X509Certificate::from_der(&der).unwrap();
    let mut names = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                names.push(dns.to_string());
            }
        }
    }
    names
}

/// SubjectPublicKeyInfo DER of a PEM certificate
pub(crate) fn certificate_public_key(cert_pem: &[u8]) -> Vec<u8> {
    let der = pem_contents(cert_pem);
    let (_, cert) = X509Certificate::from_der(&der).unwrap();
    cert.public_key().raw.to_vec()
}

/// `(critical, ca)` of the Basic Constraints requested by a PEM CSR
pub(crate) fn requested_basic_constraints(csr_pem: &[u8]) -> Option<(bool, bool)> {
    let der = pem_contents(csr_pem);
    let (_, csr) = X509CertificationRequest::from_der(&der).unwrap();
    for attr in csr.certification_request_info.iter_attributes() {
        if let ParsedCriAttribute::ExtensionRequest(req) = attr.parsed_attribute() {
            for ext in &req.extensions {
                if let ParsedExtension::BasicConstraints(bc) = ext.parsed_extension() {
                    return Some((ext.critical, bc.ca));
                }
            }
        }
    }
    None
}

/// URI SANs requested by a PEM CSR
pub(crate) fn requested_uris(csr_pem: &[u8]) -> Vec<String> {
    let der = pem_contents(csr_pem);
    let (_, csr) = X509CertificationRequest::from_der(&der).unwrap();
    let mut uris = Vec::new();
    for ext in csr.requested_extensions().into_iter().flatten() {
        if let ParsedExtension::SubjectAlternativeName(san) = ext {
            for name in &san.general_names {
                if let GeneralName::URI(uri) = name {
                    uris.push(uri.to_string());
                }
            }
        }
    }
    uris
}

/// SubjectPublicKeyInfo DER of a PEM CSR
pub(crate) fn requested_public_key(csr_pem: &[u8]) -> Vec<u8> {
    let der = pem_contents(csr_pem);
    let (_, csr) = X509CertificationRequest::from_der(&der).unwrap();
    csr.certification_request_info.subject_pki.raw.to_vec()
}
