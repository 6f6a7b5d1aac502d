//! Credential submission from the provisioning portal
//!
//! Handles validation and persistence independent of HTTP concerns.

use crate::services::{
    credential_store::{CredentialStore, NetworkCredential},
    network::needs_escaping,
    status::{ConnectionPhase, StatusBoard},
};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_valid::Validate;
use std::fmt;
use tokio::sync::mpsc::{self, error::TrySendError};

const MIN_PASSWORD_CHARS: usize = 8;

/// Form posted by the portal
#[derive(Clone, Deserialize, Validate)]
pub struct ConnectForm {
    #[validate(min_length = 1)]
    #[validate(max_length = 32)]
    pub ssid: String,
    #[validate(min_length = 8)]
    #[validate(max_length = 63)]
    #[validate(custom = writable_passphrase)]
    pub password: String,
}

fn writable_passphrase(password: &str) -> Result<(), serde_valid::validation::Error> {
    if needs_escaping(password) {
        return Err(serde_valid::validation::Error::Custom(
            "passphrase contains quotes or control characters".to_string(),
        ));
    }
    Ok(())
}

impl ConnectForm {
    fn rejection_reason(&self) -> String {
        if self.ssid.trim().is_empty() {
            "Network name is required".to_string()
        } else if self.password.chars().count() < MIN_PASSWORD_CHARS {
            format!("Password too short (min {MIN_PASSWORD_CHARS} chars)")
        } else if self.password.chars().count() > 63 {
            "Password too long (max 63 chars)".to_string()
        } else if needs_escaping(&self.password) {
            "Password must not contain quotes or control characters".to_string()
        } else {
            "Network name too long (max 32 chars)".to_string()
        }
    }
}

impl fmt::Debug for ConnectForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectForm")
            .field("ssid", &self.ssid)
            .finish_non_exhaustive()
    }
}

/// Event telling the state machine a new credential has been persisted
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CredentialSubmitted {
    pub ssid: String,
}

#[derive(Debug)]
pub enum SubmitError {
    /// Rejected with a message for the user
    Invalid(String),
    /// The access point is down, the device is not accepting credentials
    PortalClosed,
    Store(anyhow::Error),
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid(reason) => write!(f, "{reason}"),
            Self::PortalClosed => write!(f, "provisioning is not active"),
            Self::Store(e) => write!(f, "failed to save network credential: {e:#}"),
        }
    }
}

impl std::error::Error for SubmitError {}

/// Service for credential submissions
pub struct ProvisioningService;

impl ProvisioningService {
    /// Validate, persist and announce a submitted network credential
    ///
    /// # Arguments
    /// * `store` - Credential store receiving the credential
    /// * `status` - Shared status record shown by the portal
    /// * `submissions` - Event channel to the state machine
    /// * `form` - Submitted form
    ///
    /// # Returns
    /// Result indicating success, or why the submission was rejected
    pub fn submit<S>(
        store: &S,
        status: &StatusBoard,
        submissions: &mpsc::Sender<CredentialSubmitted>,
        form: ConnectForm,
    ) -> Result<(), SubmitError>
    where
        S: CredentialStore + ?Sized,
    {
        debug!("submit() called: {form:?}");

        if !status.portal_open() {
            return Err(SubmitError::PortalClosed);
        }

        if form.validate().is_err() {
            let reason = form.rejection_reason();
            info!("rejected credential for {:?}: {reason}", form.ssid);
            return Err(SubmitError::Invalid(reason));
        }

        let credential = NetworkCredential {
            ssid: form.ssid,
            passphrase: form.password,
        };

        store
            .save_network_credential(&credential)
            .map_err(SubmitError::Store)?;

        info!("received credentials for {}", credential.ssid);
        status.set(
            ConnectionPhase::Connecting,
            format!("Connecting to {}...", credential.ssid),
        );

        match submissions.try_send(CredentialSubmitted {
            ssid: credential.ssid,
        }) {
            Ok(()) => {}
            // the machine reloads the stored credential, one pending event is enough
            Err(TrySendError::Full(_)) => debug!("submission already pending"),
            Err(TrySendError::Closed(_)) => warn!("state machine is not listening for submissions"),
        }

        Ok(())
    }
}
