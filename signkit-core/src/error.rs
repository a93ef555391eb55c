use thiserror::Error;

/// Error outputs from `Signkit`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DialogError {
    /// The authority surface could not be presented (e.g. the popup was blocked).
    #[error("presentation_blocked: {reason}")]
    PresentationBlocked {
        /// What the platform reported.
        reason: String,
    },
    /// No correlated response arrived before the deadline.
    #[error("timeout: no response to {request_id} within {timeout_ms} ms")]
    Timeout {
        /// Correlation id of the request that expired.
        request_id: String,
        /// The deadline that was applied.
        timeout_ms: u64,
    },
    /// The user closed the surface or dismissed the credential prompt.
    #[error("user_cancelled")]
    UserCancelled,
    /// A message arrived from an origin other than the authority origin.
    #[error("origin_mismatch: expected {expected}, received {received}")]
    OriginMismatch {
        /// The configured authority origin.
        expected: String,
        /// The origin the message claimed.
        received: String,
    },
    /// A message did not match any known envelope shape.
    #[error("malformed_response: {0}")]
    MalformedResponse(String),
    /// A negotiation is already running on this negotiator.
    #[error("already_in_progress")]
    AlreadyInProgress,
    /// The platform or authenticator does not support the requested operation.
    #[error("not_supported: {0}")]
    NotSupported(String),
    /// The surface answered with an explicit error envelope.
    #[error("rejected: {code}: {message}")]
    Rejected {
        /// Error code reported by the surface.
        code: String,
        /// Human readable message reported by the surface.
        message: String,
    },
    /// A request with the same correlation id is already pending.
    #[error("duplicate_correlation_id: {0}")]
    DuplicateCorrelationId(String),
    /// The pending request was discarded before a response arrived.
    #[error("cancelled")]
    Cancelled,
    /// Posting a message into the surface failed.
    #[error("channel_error: {0}")]
    Channel(String),
    /// The session storage backend failed.
    #[error("storage_error: {0}")]
    Storage(String),
    /// The presented configuration is not valid.
    #[error("invalid_config: {attribute}: {reason}")]
    InvalidConfig {
        /// The offending attribute.
        attribute: String,
        /// Why it was rejected.
        reason: String,
    },
    /// Unexpected error serializing information.
    #[error("serialization_error: {0}")]
    Serialization(String),
}

impl DialogError {
    /// Stable machine-readable code, used when the error crosses into JS.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::PresentationBlocked { .. } => "PRESENTATION_BLOCKED",
            Self::Timeout { .. } => "TIMEOUT",
            Self::UserCancelled => "USER_CANCELLED",
            Self::OriginMismatch { .. } => "ORIGIN_MISMATCH",
            Self::MalformedResponse(_) => "MALFORMED_RESPONSE",
            Self::AlreadyInProgress => "ALREADY_IN_PROGRESS",
            Self::NotSupported(_) => "NOT_SUPPORTED",
            Self::Rejected { .. } => "REJECTED",
            Self::DuplicateCorrelationId(_) => "DUPLICATE_CORRELATION_ID",
            Self::Cancelled => "CANCELLED",
            Self::Channel(_) => "CHANNEL_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::InvalidConfig { .. } => "INVALID_CONFIG",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Whether the caller may reasonably try the same negotiation again.
    ///
    /// User cancellation is deliberately terminal.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::PresentationBlocked { .. })
    }

    /// Maps an error payload reported by the surface onto the local taxonomy.
    #[must_use]
    pub fn from_surface(code: &str, message: &str) -> Self {
        match code {
            "USER_CANCELLED" => Self::UserCancelled,
            "NOT_SUPPORTED" => Self::NotSupported(message.to_string()),
            _ => Self::Rejected {
                code: code.to_string(),
                message: message.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for DialogError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}
