//! CertificateSigningRequest creation and approval

use std::sync::Arc;

use tracing::{debug, info};

use super::{SigningRequestHandle, SigningRequestSpec, SigningState};
use crate::client::SigningRequestApi;
use crate::{Error, Result};

/// Reason recorded on the Approved condition
pub const APPROVAL_REASON: &str = "AutoApproved";

/// Message recorded on the Approved condition
pub const APPROVAL_MESSAGE: &str = "Approved by sa-certgen for workload identity issuance";

/// Creates signing requests and drives them to the approved state
pub struct CsrSubmitter {
    api: Arc<dyn SigningRequestApi>,
    signer_name: String,
}

impl CsrSubmitter {
    /// Create a submitter targeting the given signer
    pub fn new(api: Arc<dyn SigningRequestApi>, signer_name: impl Into<String>) -> Self {
        Self {
            api,
            signer_name: signer_name.into(),
        }
    }

    /// Create a request named `request_name` carrying `csr_pem`.
    ///
    /// Fails with [`Error::DuplicateRequest`] if the name already exists; the
    /// caller picks a fresh name per attempt.
    pub async fn submit(
        &self,
        csr_pem: &[u8],
        request_name: &str,
        usages: &[&str],
    ) -> Result<SigningRequestHandle> {
        let spec = SigningRequestSpec {
            name: request_name.to_string(),
            request_pem: csr_pem.to_vec(),
            signer_name: self.signer_name.clone(),
            usages: usages.iter().map(|u| u.to_string()).collect(),
        };

        self.api.create(&spec).await?;
        info!(request = %request_name, signer = %self.signer_name, "created signing request");
        Ok(SigningRequestHandle::new(request_name))
    }

    /// Mark the request approved.
    ///
    /// An already approved request is left alone. A request that was denied,
    /// failed or already signed cannot be approved and fails with
    /// [`Error::Approval`], as does any API failure.
    pub async fn approve(&self, handle: &mut SigningRequestHandle) -> Result<()> {
        let name = handle.name().to_string();
        let approval_error = |message: String| Error::Approval {
            name: name.clone(),
            message,
        };

        let status = self
            .api
            .status(&name)
            .await
            .map_err(|e| approval_error(e.to_string()))?;

        match status.state() {
            SigningState::Approved => {
                debug!(request = %name, "signing request already approved");
                handle.set_state(SigningState::Approved);
                return Ok(());
            }
            SigningState::Pending => {}
            state @ (SigningState::Signed | SigningState::Failed | SigningState::TimedOut) => {
                let detail = status
                    .refusal()
                    .map(|c| format!("{} ({})", c.type_, c.describe()))
                    .unwrap_or_else(|| format!("{:?}", state));
                return Err(approval_error(format!(
                    "request is already in terminal state {}",
                    detail
                )));
            }
        }

        self.api
            .approve(&name, APPROVAL_REASON, APPROVAL_MESSAGE)
            .await
            .map_err(|e| approval_error(e.to_string()))?;

        handle.set_state(SigningState::Approved);
        info!(request = %name, "approved signing request");
        Ok(())
    }
}
