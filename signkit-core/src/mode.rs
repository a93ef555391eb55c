//! Chooses how the authority surface is presented.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// What a negotiation is trying to achieve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Action {
    /// Establish (or re-establish) a passkey session.
    Connect,
    /// Sign a message with the established passkey.
    Sign,
}

/// How the authority surface is presented to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PresentationMode {
    /// A separate top-level browsing context (popup window).
    Detached,
    /// A frame inside a modal container on the host page.
    Embedded,
}

/// What the host knows about the platform it runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    /// Phone or tablet class device.
    pub is_mobile: bool,
    /// Safari (desktop or iOS WebKit shell).
    pub is_safari: bool,
    /// The host page runs in a secure context (`https` or localhost).
    pub is_secure_context: bool,
}

const MOBILE_MARKERS: [&str; 5] = ["Android", "iPhone", "iPad", "iPod", "Mobile"];
const NON_SAFARI_MARKERS: [&str; 6] = ["Chrome", "Chromium", "CriOS", "FxiOS", "EdgiOS", "Android"];

impl Environment {
    /// Classifies a `navigator.userAgent` string.
    ///
    /// Every Chromium and Firefox build on iOS also advertises `Safari`, so Safari
    /// is only reported when none of the other engines' markers are present.
    #[must_use]
    pub fn from_user_agent(user_agent: &str, is_secure_context: bool) -> Self {
        let is_mobile = MOBILE_MARKERS.iter().any(|m| user_agent.contains(m));
        let is_safari = user_agent.contains("Safari")
            && !NON_SAFARI_MARKERS.iter().any(|m| user_agent.contains(m));
        Self {
            is_mobile,
            is_safari,
            is_secure_context,
        }
    }
}

/// Decides the presentation mode for `action` on `env`.
///
/// Rules, first match wins:
/// 1. insecure context: detached
/// 2. connect on Safari or mobile: detached
/// 3. sign: embedded
/// 4. otherwise embedded
#[must_use]
pub const fn choose_mode(action: Action, env: Environment) -> PresentationMode {
    if !env.is_secure_context {
        return PresentationMode::Detached;
    }
    match action {
        Action::Connect if env.is_safari || env.is_mobile => PresentationMode::Detached,
        Action::Sign | Action::Connect => PresentationMode::Embedded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    use PresentationMode::{Detached, Embedded};

    #[test_case(Action::Connect, false, false, true => Embedded ; "connect desktop chrome")]
    #[test_case(Action::Connect, false, true, true => Detached ; "connect desktop safari")]
    #[test_case(Action::Connect, true, false, true => Detached ; "connect mobile chrome")]
    #[test_case(Action::Connect, true, true, true => Detached ; "connect mobile safari")]
    #[test_case(Action::Connect, false, false, false => Detached ; "connect insecure")]
    #[test_case(Action::Connect, true, true, false => Detached ; "connect mobile safari insecure")]
    #[test_case(Action::Sign, false, false, true => Embedded ; "sign desktop chrome")]
    #[test_case(Action::Sign, false, true, true => Embedded ; "sign desktop safari")]
    #[test_case(Action::Sign, true, false, true => Embedded ; "sign mobile chrome")]
    #[test_case(Action::Sign, true, true, true => Embedded ; "sign mobile safari")]
    #[test_case(Action::Sign, false, false, false => Detached ; "sign insecure")]
    #[test_case(Action::Sign, true, true, false => Detached ; "sign mobile safari insecure")]
    fn test_truth_table(
        action: Action,
        is_mobile: bool,
        is_safari: bool,
        is_secure_context: bool,
    ) -> PresentationMode {
        let env = Environment {
            is_mobile,
            is_safari,
            is_secure_context,
        };
        let first = choose_mode(action, env);
        assert_eq!(first, choose_mode(action, env));
        first
    }

    #[test]
    fn test_deterministic_over_all_inputs() {
        for action in [Action::Connect, Action::Sign] {
            for bits in 0u8..8 {
                let env = Environment {
                    is_mobile: bits & 1 != 0,
                    is_safari: bits & 2 != 0,
                    is_secure_context: bits & 4 != 0,
                };
                assert_eq!(choose_mode(action, env), choose_mode(action, env));
            }
        }
    }

    #[test_case("Mozilla/5.0 (Macintosh; Intel Mac OS X 14_4) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15", false, true ; "desktop safari")]
    #[test_case("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36", false, false ; "desktop chrome")]
    #[test_case("Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1", true, true ; "ios safari")]
    #[test_case("Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) CriOS/124.0.6367.88 Mobile/15E148 Safari/604.1", true, false ; "ios chrome")]
    #[test_case("Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Mobile Safari/537.36", true, false ; "android chrome")]
    #[test_case("Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0", false, false ; "desktop firefox")]
    fn test_user_agent_classification(user_agent: &str, is_mobile: bool, is_safari: bool) {
        let env = Environment::from_user_agent(user_agent, true);
        assert_eq!(env.is_mobile, is_mobile);
        assert_eq!(env.is_safari, is_safari);
        assert!(env.is_secure_context);
    }
}
