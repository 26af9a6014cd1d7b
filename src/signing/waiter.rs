//! Polling a signing request until the signer answers

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use super::{SigningRequestHandle, SigningState};
use crate::client::SigningRequestApi;
use crate::{Error, Result};

/// Default interval between status reads
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default time to wait for the signer
pub const DEFAULT_SIGNING_TIMEOUT: Duration = Duration::from_secs(60);

/// Polls a signing request until a certificate is attached
pub struct CertificateWaiter {
    api: Arc<dyn SigningRequestApi>,
    poll_interval: Duration,
}

impl CertificateWaiter {
    /// Create a waiter that reads the request status every `poll_interval`
    pub fn new(api: Arc<dyn SigningRequestApi>, poll_interval: Duration) -> Self {
        Self { api, poll_interval }
    }

    /// Wait up to `deadline` for the signed certificate.
    ///
    /// Returns the raw certificate bytes once the status carries a non-empty
    /// certificate. A Denied or Failed condition ends the wait with
    /// [`Error::SigningDenied`]. When the deadline passes the call fails with
    /// [`Error::Timeout`], never earlier, and the request is left in place.
    /// Errors reading the status are logged and polling continues.
    pub async fn wait_for_certificate(
        &self,
        handle: &mut SigningRequestHandle,
        deadline: Duration,
    ) -> Result<Vec<u8>> {
        let start = Instant::now();
        let mut polls = 0u32;

        loop {
            polls += 1;
            match self.api.status(handle.name()).await {
                Ok(status) => {
                    if let Some(cert) = status.signed_certificate() {
                        handle.set_state(SigningState::Signed);
                        debug!(
                            request = %handle.name(),
                            polls,
                            elapsed_ms = start.elapsed().as_millis() as u64,
                            "certificate attached"
                        );
                        return Ok(cert.to_vec());
                    }

                    if let Some(refusal) = status.refusal() {
                        handle.set_state(SigningState::Failed);
                        return Err(Error::SigningDenied {
                            name: handle.name().to_string(),
                            condition: refusal.type_.clone(),
                            reason: refusal.describe(),
                        });
                    }
                }
                Err(e) => {
                    warn!(request = %handle.name(), error = %e, "failed to read signing request, retrying");
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= deadline {
                handle.set_state(SigningState::TimedOut);
                return Err(Error::Timeout {
                    name: handle.name().to_string(),
                    waited: elapsed,
                });
            }

            tokio::time::sleep(self.poll_interval.min(deadline - elapsed)).await;
        }
    }
}
