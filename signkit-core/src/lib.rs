//! Dialog transport and session negotiation between a web host and a passkey
//! authority surface.
//!
//! The host never touches the authenticator APIs. It presents an isolated
//! surface on the authority origin (a detached window or an embedded frame),
//! exchanges correlated envelopes with it over a cross-context message channel,
//! and keeps a small credential record in sync on both sides.
//!
//! Platform specifics (DOM, `window.open`, `localStorage`, timers) are injected
//! through the traits in [`transport`], [`bus`], [`session`] and [`clock`]; the
//! `signkit-wasm` crate implements them for browsers and [`memory`] implements
//! them for tests.

#![deny(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod bus;
pub use bus::{Delivery, DropReason, InboundMessage, MessageBus, MessageSource, RequestKind, Subscription};

pub mod clock;
pub use clock::Clock;
#[cfg(not(target_arch = "wasm32"))]
pub use clock::TokioClock;

pub mod collaborators;

mod config;
pub use config::NegotiatorConfig;

pub mod envelope;
pub use envelope::{Envelope, MessageType, SignatureCreated, Source, WalletConnected};

mod error;
pub use error::DialogError;

pub mod logger;

mod mode;
pub use mode::*;

mod negotiator;
pub use negotiator::*;

pub mod origin;
pub use origin::Origin;

pub mod session;
pub use session::{CredentialRecord, KeyValueStorage, Reconciliation, SessionStore};

pub mod sync;

pub mod transport;

#[cfg(not(target_arch = "wasm32"))]
pub mod memory;

