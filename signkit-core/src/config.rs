//! Negotiator configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::DialogError;
use crate::origin::Origin;
use crate::sync::{SyncSchedule, DEFAULT_SYNC_SCHEDULE_MS};

const fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_sync_schedule_ms() -> Vec<u64> {
    DEFAULT_SYNC_SCHEDULE_MS.to_vec()
}

const fn default_sync_defer_ms() -> u64 {
    250
}

const fn default_sync_max_deferrals() -> usize {
    40
}

const fn default_window_width() -> u32 {
    420
}

const fn default_window_height() -> u32 {
    640
}

const fn default_close_poll_ms() -> u64 {
    500
}

/// Settings of a [`crate::SessionNegotiator`].
///
/// Serialized as camelCase JSON; every field but `authorityUrl` is optional.
///
/// ```
/// use signkit_core::NegotiatorConfig;
///
/// let config = NegotiatorConfig::from_json(
///     r#"{"authorityUrl": "https://portal.example.com/dialog", "requestTimeoutMs": 10000}"#,
/// )
/// .unwrap();
/// assert_eq!(config.authority_origin().unwrap().as_str(), "https://portal.example.com");
/// assert_eq!(config.window_width, 420);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiatorConfig {
    /// Page of the authority surface. Its origin is the only one trusted.
    pub authority_url: Url,
    /// Deadline for a correlated response.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Retry delays of the credential sync after its first push.
    #[serde(default = "default_sync_schedule_ms")]
    pub sync_schedule_ms: Vec<u64>,
    /// Re-arm delay while no embedded surface is open.
    #[serde(default = "default_sync_defer_ms")]
    pub sync_defer_ms: u64,
    /// Maximum re-arms while no embedded surface is open.
    #[serde(default = "default_sync_max_deferrals")]
    pub sync_max_deferrals: usize,
    /// Detached window width.
    #[serde(default = "default_window_width")]
    pub window_width: u32,
    /// Detached window height.
    #[serde(default = "default_window_height")]
    pub window_height: u32,
    /// Interval of the detached window closure poll.
    #[serde(default = "default_close_poll_ms")]
    pub close_poll_ms: u64,
}

impl NegotiatorConfig {
    /// Default configuration for the authority page at `authority_url`.
    ///
    /// # Errors
    ///
    /// Returns [`DialogError::InvalidConfig`] if the url does not parse or is not
    /// `http`/`https`.
    pub fn new(authority_url: &str) -> Result<Self, DialogError> {
        let authority_url = Url::parse(authority_url).map_err(|err| invalid("authorityUrl", err))?;
        let config = Self {
            authority_url,
            request_timeout_ms: default_request_timeout_ms(),
            sync_schedule_ms: default_sync_schedule_ms(),
            sync_defer_ms: default_sync_defer_ms(),
            sync_max_deferrals: default_sync_max_deferrals(),
            window_width: default_window_width(),
            window_height: default_window_height(),
            close_poll_ms: default_close_poll_ms(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates a JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns [`DialogError::InvalidConfig`] if the JSON does not describe a valid configuration.
    pub fn from_json(json: &str) -> Result<Self, DialogError> {
        let config: Self = serde_json::from_str(json).map_err(|err| invalid("json", err))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every attribute.
    ///
    /// # Errors
    ///
    /// Returns [`DialogError::InvalidConfig`] naming the first offending attribute.
    pub fn validate(&self) -> Result<(), DialogError> {
        self.authority_origin()?;
        if self.request_timeout_ms == 0 {
            return Err(invalid("requestTimeoutMs", "must be positive"));
        }
        if self.sync_schedule_ms.contains(&0) {
            return Err(invalid("syncScheduleMs", "delays must be positive"));
        }
        if self.sync_defer_ms == 0 {
            return Err(invalid("syncDeferMs", "must be positive"));
        }
        if self.window_width == 0 || self.window_height == 0 {
            return Err(invalid("windowWidth", "window size must be positive"));
        }
        if self.close_poll_ms == 0 {
            return Err(invalid("closePollMs", "must be positive"));
        }
        Ok(())
    }

    /// Origin of the authority surface.
    ///
    /// # Errors
    ///
    /// Returns [`DialogError::InvalidConfig`] for a url without an `http`/`https` origin.
    pub fn authority_origin(&self) -> Result<Origin, DialogError> {
        Origin::of(&self.authority_url)
    }

    /// Deadline for a correlated response.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// The credential sync retry schedule.
    #[must_use]
    pub fn sync_schedule(&self) -> SyncSchedule {
        SyncSchedule::from_millis(&self.sync_schedule_ms)
    }

    /// Re-arm delay of a deferred credential sync.
    #[must_use]
    pub const fn sync_defer(&self) -> Duration {
        Duration::from_millis(self.sync_defer_ms)
    }

    /// Interval of the detached window closure poll.
    #[must_use]
    pub const fn close_poll(&self) -> Duration {
        Duration::from_millis(self.close_poll_ms)
    }
}

fn invalid(attribute: &str, reason: impl ToString) -> DialogError {
    DialogError::InvalidConfig {
        attribute: attribute.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NegotiatorConfig::new("https://portal.example.com/dialog").unwrap();
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.sync_schedule().len(), 5);
        assert_eq!(config.sync_defer(), Duration::from_millis(250));
        assert_eq!(config.sync_max_deferrals, 40);
        assert_eq!((config.window_width, config.window_height), (420, 640));
        assert_eq!(config.close_poll(), Duration::from_millis(500));
    }

    #[test]
    fn test_json_uses_camel_case_and_defaults() {
        let config = NegotiatorConfig::from_json(
            r#"{"authorityUrl": "http://localhost:5173/", "syncScheduleMs": [100, 100]}"#,
        )
        .unwrap();
        assert_eq!(config.sync_schedule_ms, vec![100, 100]);
        assert_eq!(config.request_timeout_ms, 30_000);

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["closePollMs"], 500);
    }

    #[test]
    fn test_rejects_invalid_attributes() {
        let err = NegotiatorConfig::new("file:///tmp/dialog.html").unwrap_err();
        assert!(matches!(err, DialogError::InvalidConfig { ref attribute, .. } if attribute == "authority_url"));

        let err = NegotiatorConfig::from_json(
            r#"{"authorityUrl": "https://portal.example.com", "requestTimeoutMs": 0}"#,
        )
        .unwrap_err();
        assert!(matches!(err, DialogError::InvalidConfig { ref attribute, .. } if attribute == "requestTimeoutMs"));

        let err = NegotiatorConfig::from_json(r#"{"requestTimeoutMs": 10}"#).unwrap_err();
        assert!(matches!(err, DialogError::InvalidConfig { ref attribute, .. } if attribute == "json"));
    }
}
