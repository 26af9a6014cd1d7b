//! Key handling and certificate request encoding
//!
//! The private key lives in the identity's secret under `key.pem`. Once present it
//! is reused for every later request, so re-issuing only ever replaces the
//! certificate. A key is generated only when the entry is missing or empty, and
//! the new key is written back into the record for the caller to persist.
//!
//! Requests are PKCS#10, signed with the RSA key (SHA-256), and carry:
//! - CN `<service>.<namespace>.svc`
//! - DNS SANs `<service>`, `<service>.<namespace>`, `<service>.<namespace>.svc`
//! - optionally URI SANs (SPIFFE ids); some signers drop these
//! - a critical Basic Constraints extension when a CA certificate is requested

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    IsCa, KeyPair, SanType,
};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use tracing::debug;
use x509_parser::prelude::*;

use crate::secret::SecretRecord;
use crate::{Error, Result, KEY_PEM_ENTRY, RSA_KEY_BITS};

/// Path length written into CA requests
pub const CA_PATH_LEN: u8 = 0;

/// A private key together with the PEM bytes stored in the secret
pub struct KeyMaterial {
    private_key: RsaPrivateKey,
    encoded_pem: Vec<u8>,
    generated: bool,
}

impl KeyMaterial {
    /// The RSA private key
    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    /// PEM bytes as stored under `key.pem`
    pub fn encoded_pem(&self) -> &[u8] {
        &self.encoded_pem
    }

    /// Whether the key was generated by this call rather than loaded
    pub fn was_generated(&self) -> bool {
        self.generated
    }
}

/// Reuse the key stored in the record, or generate one and store it.
///
/// A stored key is never replaced. If it cannot be decoded the call fails with
/// [`Error::KeyDecode`] instead of silently generating a new key.
pub fn load_or_generate_key(record: &mut SecretRecord) -> Result<KeyMaterial> {
    if let Some(stored) = record.data.get(KEY_PEM_ENTRY).filter(|b| !b.is_empty()) {
        let private_key = decode_private_key(stored)?;
        return Ok(KeyMaterial {
            private_key,
            encoded_pem: stored.clone(),
            generated: false,
        });
    }

    let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_KEY_BITS).map_err(|e| {
        Error::csr_construction(format!("failed to generate RSA key: {}", e))
    })?;
    let encoded_pem = encode_private_key(&private_key)?;
    record
        .data
        .insert(KEY_PEM_ENTRY.to_string(), encoded_pem.clone());

    debug!(
        namespace = %record.namespace,
        name = %record.name,
        bits = RSA_KEY_BITS,
        "generated new private key"
    );

    Ok(KeyMaterial {
        private_key,
        encoded_pem,
        generated: true,
    })
}

/// Decode a PEM-encoded RSA private key.
///
/// Accepts PKCS#1 (`RSA PRIVATE KEY`) and PKCS#8 (`PRIVATE KEY`). Older secrets
/// carry PKCS#1 bytes under a `PRIVATE KEY` label, so that label falls back to
/// PKCS#1 when PKCS#8 parsing fails.
pub fn decode_private_key(pem_bytes: &[u8]) -> Result<RsaPrivateKey> {
    let block = ::pem::parse(pem_bytes)
        .map_err(|e| Error::key_decode(format!("failed to parse PEM: {}", e)))?;

    match block.tag() {
        "RSA PRIVATE KEY" => RsaPrivateKey::from_pkcs1_der(block.contents())
            .map_err(|e| Error::key_decode(format!("invalid PKCS#1 key: {}", e))),
        "PRIVATE KEY" => RsaPrivateKey::from_pkcs8_der(block.contents())
            .or_else(|_| RsaPrivateKey::from_pkcs1_der(block.contents()))
            .map_err(|e| Error::key_decode(format!("invalid private key: {}", e))),
        other => Err(Error::key_decode(format!(
            "unexpected PEM block type {:?}",
            other
        ))),
    }
}

/// Encode a private key as PKCS#1 PEM for storage
pub fn encode_private_key(key: &RsaPrivateKey) -> Result<Vec<u8>> {
    let pem = key
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| Error::csr_construction(format!("failed to encode private key: {}", e)))?;
    Ok(pem.as_bytes().to_vec())
}

/// The contents of a certificate request for one identity
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateRequest {
    /// Subject common name
    pub common_name: String,
    /// DNS SANs, in order
    pub dns_names: Vec<String>,
    /// URI SANs, in order
    pub uri_names: Vec<String>,
    /// Whether a CA certificate is requested
    pub is_ca: bool,
}

impl CertificateRequest {
    /// Request for `<service>` in `<namespace>`
    pub fn for_service(namespace: &str, service_name: &str, is_ca: bool) -> Self {
        Self {
            common_name: format!("{}.{}.svc", service_name, namespace),
            dns_names: vec![
                service_name.to_string(),
                format!("{}.{}", service_name, namespace),
                format!("{}.{}.svc", service_name, namespace),
            ],
            uri_names: Vec::new(),
            is_ca,
        }
    }

    /// Add a URI SAN
    pub fn with_uri_san(mut self, uri: impl Into<String>) -> Self {
        self.uri_names.push(uri.into());
        self
    }

    /// Sign the request with the given key and return it as PEM
    pub fn encode(&self, key: &RsaPrivateKey) -> Result<String> {
        let key_pair = signing_key_pair(key)?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(self.common_name.clone()),
        );
        params.distinguished_name = dn;

        let mut sans = Vec::with_capacity(self.dns_names.len() + self.uri_names.len());
        for name in &self.dns_names {
            let value = Ia5String::try_from(name.clone()).map_err(|e| {
                Error::csr_construction(format!("invalid DNS name {:?}: {}", name, e))
            })?;
            sans.push(SanType::DnsName(value));
        }
        for uri in &self.uri_names {
            let value = Ia5String::try_from(uri.clone())
                .map_err(|e| Error::csr_construction(format!("invalid URI {:?}: {}", uri, e)))?;
            sans.push(SanType::URI(value));
        }
        params.subject_alt_names = sans;

        // rcgen requests Basic Constraints (critical) for CA params
        if self.is_ca {
            params.is_ca = IsCa::Ca(BasicConstraints::Constrained(CA_PATH_LEN));
        }

        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| Error::csr_construction(format!("failed to create CSR: {}", e)))?;

        csr.pem()
            .map_err(|e| Error::csr_construction(format!("failed to serialize CSR: {}", e)))
    }
}

/// Convert an RSA key into an rcgen signing key (RSA PKCS#1 v1.5 with SHA-256)
fn signing_key_pair(key: &RsaPrivateKey) -> Result<KeyPair> {
    let pkcs8 = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| Error::csr_construction(format!("failed to encode signing key: {}", e)))?;
    KeyPair::from_pem_and_sign_algo(&pkcs8, &rcgen::PKCS_RSA_SHA256)
        .map_err(|e| Error::csr_construction(format!("failed to load signing key: {}", e)))
}

/// Build a certificate request for `<service>.<namespace>`, reusing or creating
/// the key held in `record`.
///
/// A newly generated key is inserted into `record.data["key.pem"]`; persisting
/// the record is the caller's job.
pub fn build_request(
    record: &mut SecretRecord,
    namespace: &str,
    service_name: &str,
    is_ca: bool,
) -> Result<String> {
    let key = load_or_generate_key(record)?;
    CertificateRequest::for_service(namespace, service_name, is_ca).encode(key.private_key())
}

/// Summary of a signed certificate, for logging
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateSummary {
    /// Subject distinguished name
    pub subject: String,
    /// Issuer distinguished name
    pub issuer: String,
    /// Expiry, RFC 2822
    pub not_after: String,
}

/// Parse the first certificate of a PEM chain
pub fn describe_certificate(cert_pem: &[u8]) -> Result<CertificateSummary> {
    let block = ::pem::parse(cert_pem)
        .map_err(|e| Error::certificate_parse(format!("invalid PEM: {}", e)))?;
    let (_, cert) = X509Certificate::from_der(block.contents())
        .map_err(|e| Error::certificate_parse(e.to_string()))?;

    Ok(CertificateSummary {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        not_after: cert.validity().not_after.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::traits::PublicKeyParts;
    use x509_parser::certification_request::X509CertificationRequest;
    use x509_parser::extensions::{GeneralName, ParsedExtension};
    use x509_parser::prelude::FromDer;

    fn empty_record() -> SecretRecord {
        SecretRecord::new("default", "istio.web")
    }

    fn parse_csr(pem: &str) -> Vec<u8> {
        ::pem::parse(pem.as_bytes()).unwrap().contents().to_vec()
    }

    fn dns_sans(der: &[u8]) -> Vec<String> {
        let (_, csr) = X509CertificationRequest::from_der(der).unwrap();
        let mut names = Vec::new();
        for ext in csr.requested_extensions().into_iter().flatten() {
            if let ParsedExtension::SubjectAlternativeName(san) = ext {
                for name in &san.general_names {
                    if let GeneralName::DNSName(dns) = name {
                        names.push(dns.to_string());
                    }
                }
            }
        }
        names
    }

    /// (critical, ca, path_len) of the requested Basic Constraints, if any
    fn basic_constraints(der: &[u8]) -> Option<(bool, bool, Option<u32>)> {
        let (_, csr) = X509CertificationRequest::from_der(der).unwrap();
        for attr in csr.certification_request_info.iter_attributes() {
            if let ParsedCriAttribute::ExtensionRequest(req) = attr.parsed_attribute() {
                for ext in &req.extensions {
                    if let ParsedExtension::BasicConstraints(bc) = ext.parsed_extension() {
                        return Some((ext.critical, bc.ca, bc.path_len_constraint));
                    }
                }
            }
        }
        None
    }

    #[test]
    fn new_key_is_generated_and_stored() {
        let mut record = empty_record();
        let csr = build_request(&mut record, "default", "web", false).unwrap();

        assert!(csr.starts_with("-----BEGIN CERTIFICATE REQUEST-----"));
        let stored = record.data.get(KEY_PEM_ENTRY).expect("key stored");
        let key = decode_private_key(stored).unwrap();
        assert_eq!(key.size() * 8, RSA_KEY_BITS);
        assert!(String::from_utf8_lossy(stored).contains("BEGIN RSA PRIVATE KEY"));
    }

    #[test]
    fn stored_key_is_reused_byte_for_byte() {
        let mut record = empty_record();
        let first = load_or_generate_key(&mut record).unwrap();
        assert!(first.was_generated());
        let before = record.data[KEY_PEM_ENTRY].clone();

        let second = load_or_generate_key(&mut record).unwrap();
        assert!(!second.was_generated());
        assert_eq!(record.data[KEY_PEM_ENTRY], before);
        assert_eq!(second.encoded_pem(), before.as_slice());
        assert_eq!(first.private_key(), second.private_key());
    }

    #[test]
    fn empty_key_entry_is_treated_as_absent() {
        let mut record = empty_record();
        record.data.insert(KEY_PEM_ENTRY.to_string(), Vec::new());
        let key = load_or_generate_key(&mut record).unwrap();
        assert!(key.was_generated());
        assert!(!record.data[KEY_PEM_ENTRY].is_empty());
    }

    #[test]
    fn corrupt_key_fails_without_replacing_it() {
        let mut record = empty_record();
        record
            .data
            .insert(KEY_PEM_ENTRY.to_string(), b"not a key".to_vec());

        let result = build_request(&mut record, "default", "web", false);
        assert!(matches!(result, Err(Error::KeyDecode(_))));
        assert_eq!(record.data[KEY_PEM_ENTRY], b"not a key".to_vec());
    }

    #[test]
    fn wrong_pem_type_is_rejected() {
        let pem = ::pem::encode(&::pem::Pem::new("CERTIFICATE", vec![1, 2, 3]));
        match decode_private_key(pem.as_bytes()) {
            Err(Error::KeyDecode(msg)) => assert!(msg.contains("CERTIFICATE")),
            _ => panic!("expected KeyDecode"),
        }
    }

    #[test]
    fn legacy_pkcs1_under_private_key_label_is_accepted() {
        let mut record = empty_record();
        let key = load_or_generate_key(&mut record).unwrap();
        let der = key.private_key().to_pkcs1_der().unwrap();
        let legacy = ::pem::encode(&::pem::Pem::new("PRIVATE KEY", der.as_bytes().to_vec()));

        let decoded = decode_private_key(legacy.as_bytes()).unwrap();
        assert_eq!(&decoded, key.private_key());
    }

    #[test]
    fn request_carries_subject_and_dns_sans() {
        let mut record = empty_record();
        let csr = build_request(&mut record, "prod", "api", false).unwrap();
        let der = parse_csr(&csr);

        let (_, parsed) = X509CertificationRequest::from_der(&der).unwrap();
        let cn = parsed
            .certification_request_info
            .subject
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap()
            .to_string();
        assert_eq!(cn, "api.prod.svc");
        assert_eq!(dns_sans(&der), vec!["api", "api.prod", "api.prod.svc"]);
    }

    #[test]
    fn ca_request_has_critical_basic_constraints() {
        let mut record = empty_record();
        let csr = build_request(&mut record, "istio-system", "intermediary-ca2", true).unwrap();
        let der = parse_csr(&csr);

        let (critical, ca, path_len) = basic_constraints(&der).expect("basic constraints");
        assert!(critical);
        assert!(ca);
        assert_eq!(path_len, Some(u32::from(CA_PATH_LEN)));
    }

    #[test]
    fn non_ca_request_omits_basic_constraints() {
        let mut record = empty_record();
        let csr = build_request(&mut record, "default", "web", false).unwrap();
        assert!(basic_constraints(&parse_csr(&csr)).is_none());
    }

    #[test]
    fn uri_sans_are_included_when_requested() {
        let mut record = empty_record();
        let key = load_or_generate_key(&mut record).unwrap();
        let csr = CertificateRequest::for_service("default", "web", false)
            .with_uri_san("spiffe://cluster.local/ns/default/sa/web")
            .encode(key.private_key())
            .unwrap();

        let der = parse_csr(&csr);
        let (_, parsed) = X509CertificationRequest::from_der(&der).unwrap();
        let uris: Vec<String> = parsed
            .requested_extensions()
            .into_iter()
            .flatten()
            .filter_map(|ext| match ext {
                ParsedExtension::SubjectAlternativeName(san) => Some(san),
                _ => None,
            })
            .flat_map(|san| san.general_names.iter())
            .filter_map(|name| match name {
                GeneralName::URI(uri) => Some(uri.to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(uris, vec!["spiffe://cluster.local/ns/default/sa/web"]);
        // DNS SANs are unaffected
        assert_eq!(dns_sans(&der), vec!["web", "web.default", "web.default.svc"]);
    }

    #[test]
    fn private_key_never_in_csr() {
        let mut record = empty_record();
        let csr = build_request(&mut record, "default", "web", false).unwrap();
        assert!(!csr.contains("PRIVATE KEY"));
    }

    #[test]
    fn describe_rejects_garbage() {
        assert!(matches!(
            describe_certificate(b"garbage"),
            Err(Error::CertificateParse(_))
        ));

        let not_a_cert = ::pem::encode(&::pem::Pem::new("CERTIFICATE", vec![1, 2, 3]));
        assert!(matches!(
            describe_certificate(not_a_cert.as_bytes()),
            Err(Error::CertificateParse(_))
        ));
    }
}
