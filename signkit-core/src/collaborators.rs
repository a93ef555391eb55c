//! Interfaces of the components the protocol hands off to.
//!
//! Passkey ceremonies and transaction assembly happen inside the authority
//! surface or the host application; this crate only describes their shape.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::SignatureCreated;
use crate::error::DialogError;

/// Which credential ceremony to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialCeremony {
    /// Create a new passkey.
    Create,
    /// Assert an existing passkey.
    Get,
}

/// Raw authenticator output, base64 fields as the surface reports them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialOutput {
    /// Credential that performed the ceremony.
    pub credential_id: String,
    /// Public key, only present on creation.
    #[serde(default)]
    pub public_key: Option<String>,
    /// Assertion signature, only present on assertion.
    #[serde(default)]
    pub signature: Option<String>,
    /// `authenticatorData`.
    pub authenticator_data: String,
    /// `clientDataJSON`.
    pub client_data_json: String,
}

/// Performs a passkey ceremony on the authority origin.
#[async_trait(?Send)]
pub trait CredentialOperation {
    /// Runs `ceremony` over `challenge`.
    ///
    /// # Errors
    ///
    /// Fails with [`DialogError::UserCancelled`] when the user dismisses the
    /// prompt and [`DialogError::NotSupported`] when the platform has no passkeys.
    async fn perform(
        &self,
        ceremony: CredentialCeremony,
        challenge: &[u8],
    ) -> Result<CredentialOutput, DialogError>;
}

/// Turns a signature produced through the surface into a submittable transaction.
#[async_trait(?Send)]
pub trait TransactionBuilder {
    /// Builds the authorized transaction for `instruction`.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not authorize the instruction.
    async fn build_authorized_transaction(
        &self,
        payload: &SignatureCreated,
        instruction: &Value,
    ) -> Result<Value, DialogError>;
}
