//! Wire envelope exchanged between the host application and the authority surface.
//!
//! Every message crossing the trust boundary, in either direction, is a JSON
//! object of the form:
//!
//! ```text
//! { id, type, timestamp, source: "host" | "surface", requestId?, data?, error? }
//! ```
//!
//! Responses carry the `requestId` of the request they answer. Broadcasts
//! (credential sync, readiness pings) carry none.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::error::DialogError;

/// Every `type` value the protocol knows about.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Host asks the surface to connect (create or assert a passkey).
    ConnectRequest,
    /// Host asks the surface to sign a message.
    SignRequest,
    /// Surface reports a connected credential.
    WalletConnected,
    /// Surface reports a signature.
    SignatureCreated,
    /// Host pushes the stored credential record into the surface.
    SyncCredentials,
    /// Surface asks the host for the stored credential record.
    CredentialsRequest,
    /// Host answers a [`MessageType::CredentialsRequest`].
    CredentialsResponse,
    /// Either side reports a failure.
    Error,
    /// Either side asks the other to close.
    Close,
    /// Surface announces it is listening.
    Ready,
}

/// Which side of the boundary produced an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Source {
    /// The host application.
    Host,
    /// The authority surface.
    Surface,
}

/// Error payload carried by [`MessageType::Error`] envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Machine-readable error code.
    pub code: String,
    /// Human readable description.
    pub message: String,
}

/// A single protocol message. Immutable once sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Unique id; doubles as the correlation id for requests.
    pub id: String,
    /// Message type.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Milliseconds since the Unix epoch at creation.
    pub timestamp: u64,
    /// Producer of the envelope.
    pub source: Source,
    /// Id of the request this envelope answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Type specific payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Failure description for [`MessageType::Error`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl Envelope {
    /// Creates a host envelope with a fresh random id.
    #[must_use]
    pub fn host(kind: MessageType, timestamp: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            timestamp,
            source: Source::Host,
            request_id: None,
            data: None,
            error: None,
        }
    }

    /// Creates a surface envelope with a fresh random id.
    #[must_use]
    pub fn surface(kind: MessageType, timestamp: u64) -> Self {
        Self {
            source: Source::Surface,
            ..Self::host(kind, timestamp)
        }
    }

    /// Attaches a payload.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Marks the envelope as the answer to `request`.
    #[must_use]
    pub fn answering(mut self, request: &Self) -> Self {
        self.request_id = Some(request.id.clone());
        self
    }

    /// Attaches an error payload.
    #[must_use]
    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error = Some(ErrorPayload {
            code: code.into(),
            message: message.into(),
        });
        self
    }

    /// Whether this envelope is a broadcast rather than a response.
    #[must_use]
    pub const fn is_broadcast(&self) -> bool {
        self.request_id.is_none()
    }

    /// Validates and decodes an inbound message.
    ///
    /// # Errors
    ///
    /// Returns [`DialogError::MalformedResponse`] when the value is not an
    /// envelope, names an unknown `type`, or is an `ERROR` without an error payload.
    pub fn from_value(value: &Value) -> Result<Self, DialogError> {
        let envelope = Self::deserialize(value)
            .map_err(|err| DialogError::MalformedResponse(err.to_string()))?;
        if envelope.id.is_empty() {
            return Err(DialogError::MalformedResponse("empty id".to_string()));
        }
        if envelope.kind == MessageType::Error && envelope.error.is_none() {
            return Err(DialogError::MalformedResponse(
                "error envelope without error payload".to_string(),
            ));
        }
        Ok(envelope)
    }

    /// Encodes the envelope for posting.
    ///
    /// # Errors
    ///
    /// Returns [`DialogError::Serialization`] if the payload cannot be encoded.
    pub fn to_value(&self) -> Result<Value, DialogError> {
        serde_json::to_value(self).map_err(DialogError::from)
    }

    /// Decodes the `data` payload into a typed structure.
    ///
    /// # Errors
    ///
    /// Returns [`DialogError::MalformedResponse`] if `data` is missing or does not match `T`.
    pub fn decode_data<T: for<'de> Deserialize<'de>>(&self) -> Result<T, DialogError> {
        let data = self.data.as_ref().ok_or_else(|| {
            DialogError::MalformedResponse(format!("{} without data", self.kind))
        })?;
        T::deserialize(data).map_err(|err| DialogError::MalformedResponse(err.to_string()))
    }
}

/// `data` of a [`MessageType::WalletConnected`] envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletConnected {
    /// Passkey credential id.
    pub credential_id: String,
    /// Base64 encoded public key material.
    pub public_key: String,
    /// Wallet address derived from the credential, when the surface knows it.
    #[serde(default)]
    pub smart_wallet_address: Option<String>,
}

impl WalletConnected {
    /// Decoded [`WalletConnected::public_key`].
    ///
    /// # Errors
    ///
    /// Returns [`DialogError::MalformedResponse`] if the key is not standard base64.
    pub fn public_key_bytes(&self) -> Result<Vec<u8>, DialogError> {
        STANDARD
            .decode(&self.public_key)
            .map_err(|err| DialogError::MalformedResponse(format!("publicKey: {err}")))
    }
}

/// `data` of a [`MessageType::SignatureCreated`] envelope.
///
/// Only `signature` is interpreted; everything else is carried through
/// untouched for the transaction builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureCreated {
    /// Opaque signature payload.
    pub signature: String,
    /// Credential that produced the signature.
    #[serde(default)]
    pub credential_id: Option<String>,
    /// Remaining authenticator output.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape_uses_protocol_names() {
        let request = Envelope::host(MessageType::ConnectRequest, 1_700_000_000_000);
        let response = Envelope::surface(MessageType::WalletConnected, 1_700_000_000_500)
            .answering(&request)
            .with_data(json!({"credentialId": "abc", "publicKey": "AQID"}));

        let wire = response.to_value().unwrap();
        assert_eq!(wire["type"], "WALLET_CONNECTED");
        assert_eq!(wire["source"], "surface");
        assert_eq!(wire["requestId"], request.id.as_str());
        assert!(wire.get("error").is_none());

        let decoded = Envelope::from_value(&wire).unwrap();
        let connected: WalletConnected = decoded.decode_data().unwrap();
        assert_eq!(connected.credential_id, "abc");
        assert_eq!(connected.smart_wallet_address, None);
    }

    #[test]
    fn test_rejects_unknown_type() {
        let value = json!({"id": "1", "type": "SELF_DESTRUCT", "timestamp": 1, "source": "surface"});
        assert!(matches!(
            Envelope::from_value(&value),
            Err(DialogError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_rejects_error_without_payload() {
        let value = json!({"id": "1", "type": "ERROR", "timestamp": 1, "source": "surface"});
        assert!(Envelope::from_value(&value).is_err());
    }

    #[test]
    fn test_rejects_non_objects() {
        assert!(Envelope::from_value(&json!("WALLET_CONNECTED")).is_err());
        assert!(Envelope::from_value(&json!({"type": "READY"})).is_err());
    }

    #[test]
    fn test_signature_payload_keeps_opaque_fields() {
        let envelope = Envelope::surface(MessageType::SignatureCreated, 5).with_data(json!({
            "signature": "c2ln",
            "clientDataJsonBase64": "e30=",
            "authenticatorDataBase64": "AAAA"
        }));
        let created: SignatureCreated = envelope.decode_data().unwrap();
        assert_eq!(created.signature, "c2ln");
        assert_eq!(created.credential_id, None);
        assert_eq!(created.extra.len(), 2);
    }

    #[test]
    fn test_message_type_string_forms_agree() {
        assert_eq!(MessageType::SyncCredentials.to_string(), "SYNC_CREDENTIALS");
        assert_eq!(
            "CREDENTIALS_REQUEST".parse::<MessageType>().unwrap(),
            MessageType::CredentialsRequest
        );
    }
}
