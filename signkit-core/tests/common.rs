#![allow(dead_code)]

use std::rc::Rc;

use signkit_core::memory::{
    MemoryAuthenticator, MemoryChannel, MemoryFrameHost, MemoryStorage, MemoryWindowHost,
    ScriptedSurface,
};
use signkit_core::{
    Clock, CredentialRecord, Environment, NegotiatorConfig, Origin, Platform, SessionNegotiator,
    SessionStore, TokioClock,
};

pub const AUTHORITY_URL: &str = "https://portal.example.com/dialog";
pub const AUTHORITY_ORIGIN: &str = "https://portal.example.com";

pub const DESKTOP_CHROME: Environment = Environment {
    is_mobile: false,
    is_safari: false,
    is_secure_context: true,
};

pub const MOBILE_SAFARI: Environment = Environment {
    is_mobile: true,
    is_safari: true,
    is_secure_context: true,
};

pub const INSECURE_DESKTOP: Environment = Environment {
    is_mobile: false,
    is_safari: false,
    is_secure_context: false,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A negotiator wired to in-memory platform fakes that share one channel.
pub struct Harness {
    pub channel: MemoryChannel,
    pub storage: MemoryStorage,
    pub windows: MemoryWindowHost,
    pub frames: MemoryFrameHost,
    pub clock: Rc<dyn Clock>,
    pub negotiator: SessionNegotiator<MemoryStorage>,
}

impl Harness {
    pub fn new(environment: Environment) -> Self {
        Self::with_config(environment, NegotiatorConfig::new(AUTHORITY_URL).unwrap())
    }

    pub fn with_config(environment: Environment, config: NegotiatorConfig) -> Self {
        let channel = MemoryChannel::new();
        let storage = MemoryStorage::new();
        let windows = MemoryWindowHost::with_channel(&channel);
        let frames = MemoryFrameHost::with_channel(&channel);
        let clock: Rc<dyn Clock> = Rc::new(TokioClock::new());
        let platform = Platform {
            environment,
            clock: Rc::clone(&clock),
            storage: storage.clone(),
            windows: windows.clone(),
            frames: frames.clone(),
        };
        let negotiator = SessionNegotiator::new(config, platform, &channel).unwrap();
        Self {
            channel,
            storage,
            windows,
            frames,
            clock,
            negotiator,
        }
    }

    /// A surface on the authority origin holding passkey `abc`.
    pub fn surface(&self) -> ScriptedSurface {
        self.surface_with(MemoryAuthenticator::new("abc", &[1, 2, 3]))
    }

    pub fn surface_with(&self, authenticator: MemoryAuthenticator) -> ScriptedSurface {
        ScriptedSurface::new(
            &self.channel,
            &Origin::parse(AUTHORITY_ORIGIN).unwrap(),
            Rc::clone(&self.clock),
            Rc::new(authenticator),
        )
    }

    pub fn store(&self) -> SessionStore<MemoryStorage> {
        SessionStore::new(self.storage.clone())
    }
}

pub fn record(credential_id: &str) -> CredentialRecord {
    CredentialRecord {
        credential_id: credential_id.to_string(),
        public_key: vec![1, 2, 3],
        derived_address: None,
        updated_at: 1_700_000_000_000,
    }
}
