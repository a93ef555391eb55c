//! Origin validation for inbound cross-context messages.
//!
//! All trust decisions are made on receipt. An inbound message is accepted only
//! when the origin reported by the platform serializes to exactly the authority
//! origin configured at construction time.

use url::Url;

use crate::error::DialogError;

/// The serialized origin (`scheme://host[:port]`) of the authority surface.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin(String);

impl Origin {
    /// Derives the origin of `url`.
    ///
    /// # Errors
    ///
    /// Returns [`DialogError::InvalidConfig`] for opaque origins (`data:`, `file:`, ...)
    /// and for anything other than `http`/`https`.
    pub fn of(url: &Url) -> Result<Self, DialogError> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(DialogError::InvalidConfig {
                attribute: "authority_url".to_string(),
                reason: format!("unsupported scheme `{}`", url.scheme()),
            });
        }
        let origin = url.origin();
        if !origin.is_tuple() {
            return Err(DialogError::InvalidConfig {
                attribute: "authority_url".to_string(),
                reason: "authority url has an opaque origin".to_string(),
            });
        }
        Ok(Self(origin.ascii_serialization()))
    }

    /// Parses and derives the origin of `url`.
    ///
    /// # Errors
    ///
    /// See [`Origin::of`]; also fails if `url` does not parse.
    pub fn parse(url: &str) -> Result<Self, DialogError> {
        let url = Url::parse(url).map_err(|err| DialogError::InvalidConfig {
            attribute: "authority_url".to_string(),
            reason: err.to_string(),
        })?;
        Self::of(&url)
    }

    /// The serialized origin.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Checks the origin an inbound message claims against this one.
    ///
    /// # Errors
    ///
    /// Returns [`DialogError::OriginMismatch`] when they differ.
    pub fn verify(&self, received: &str) -> Result<(), DialogError> {
        if accepts(self, received) {
            Ok(())
        } else {
            Err(DialogError::OriginMismatch {
                expected: self.0.clone(),
                received: received.to_string(),
            })
        }
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Accept/reject decision for an inbound message origin.
///
/// Comparison is exact on the serialized form; browsers report
/// `MessageEvent.origin` already serialized, so no normalization of the received
/// value is attempted. The opaque origin `"null"` is never accepted.
#[must_use]
pub fn accepts(expected: &Origin, received: &str) -> bool {
    received != "null" && received == expected.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_drops_path_and_default_port() {
        let origin = Origin::parse("https://portal.example.com:443/connect?x=1").unwrap();
        assert_eq!(origin.as_str(), "https://portal.example.com");
        let origin = Origin::parse("http://localhost:5173/").unwrap();
        assert_eq!(origin.as_str(), "http://localhost:5173");
    }

    #[test]
    fn test_accepts_only_exact_origin() {
        let origin = Origin::parse("https://portal.example.com").unwrap();
        assert!(accepts(&origin, "https://portal.example.com"));
        assert!(!accepts(&origin, "https://portal.example.com.evil.io"));
        assert!(!accepts(&origin, "http://portal.example.com"));
        assert!(!accepts(&origin, "https://portal.example.com:8443"));
        assert!(!accepts(&origin, "https://PORTAL.example.com/"));
        assert!(!accepts(&origin, "null"));
        assert!(!accepts(&origin, ""));
    }

    #[test]
    fn test_verify_reports_mismatch() {
        let origin = Origin::parse("https://portal.example.com").unwrap();
        assert!(origin.verify("https://portal.example.com").is_ok());
        assert_eq!(
            origin.verify("https://evil.io"),
            Err(DialogError::OriginMismatch {
                expected: "https://portal.example.com".to_string(),
                received: "https://evil.io".to_string(),
            })
        );
    }

    #[test]
    fn test_rejects_opaque_and_non_http_origins() {
        assert!(Origin::parse("data:text/html,hi").is_err());
        assert!(Origin::parse("file:///tmp/portal.html").is_err());
        assert!(Origin::parse("not a url").is_err());
    }
}
