//! WebAssembly bindings for `signkit_core`.
//!
//! Exposes a `Dialog` class to the host page: it presents the authority surface,
//! negotiates passkey sessions and signatures with it and persists the session in
//! `localStorage`.

#![deny(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use std::rc::Rc;
use std::sync::Arc;

use js_sys::{Promise, Reflect};
use serde::Serialize;
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::future_to_promise;

use signkit_core::{
    choose_mode, Action, DialogError, NegotiatorConfig, Platform, SessionNegotiator,
};

mod browser;
mod logger;

pub use browser::{
    detect_environment, BrowserClock, LocalStorage, ModalFrameHost, PopupHost, WindowMessages,
};

/// Routes library logs to the console when the module loads.
#[wasm_bindgen(start)]
pub fn start() {
    signkit_core::logger::set_logger(Arc::new(logger::ConsoleLogger));
}

/// A negotiator bound to the current page.
#[wasm_bindgen]
pub struct Dialog(Rc<SessionNegotiator<LocalStorage>>);

#[wasm_bindgen]
impl Dialog {
    /// Creates a dialog for the authority described by `config_json`.
    ///
    /// # Errors
    /// Throws when the config is invalid or the page has no window, document or
    /// storage.
    #[wasm_bindgen(constructor)]
    pub fn new(config_json: &str) -> Result<Self, JsValue> {
        let config = NegotiatorConfig::from_json(config_json).map_err(|err| error_to_jsvalue(&err))?;
        let window = web_sys::window()
            .ok_or_else(|| error_to_jsvalue(&DialogError::NotSupported("no window".to_string())))?;
        let document = window
            .document()
            .ok_or_else(|| error_to_jsvalue(&DialogError::NotSupported("no document".to_string())))?;
        let platform = Platform {
            environment: detect_environment(&window),
            clock: Rc::new(BrowserClock),
            storage: LocalStorage::open(&window).map_err(|err| error_to_jsvalue(&err))?,
            windows: PopupHost::new(window.clone()),
            frames: ModalFrameHost::new(document),
        };
        SessionNegotiator::new(config, platform, &WindowMessages::new(window))
            .map(|negotiator| Self(Rc::new(negotiator)))
            .map_err(|err| error_to_jsvalue(&err))
    }

    /// Connects a passkey and resolves with `{ record, reconciliation, mode }`.
    ///
    /// # Errors
    /// Returns a rejected promise carrying the error `code`.
    pub fn connect(&self) -> Promise {
        let negotiator = Rc::clone(&self.0);
        future_to_promise(async move {
            let outcome = negotiator
                .negotiate_connect()
                .await
                .map_err(|err| error_to_jsvalue(&err))?;
            to_js(&outcome)
        })
    }

    /// Signs `message` and resolves with `{ signature, mode }`.
    ///
    /// # Errors
    /// Returns a rejected promise carrying the error `code`.
    pub fn sign(&self, message: Vec<u8>) -> Promise {
        let negotiator = Rc::clone(&self.0);
        future_to_promise(async move {
            let outcome = negotiator
                .negotiate_sign(&message)
                .await
                .map_err(|err| error_to_jsvalue(&err))?;
            to_js(&outcome)
        })
    }

    /// The stored session or `null`.
    ///
    /// # Errors
    /// Throws if storage cannot be read.
    pub fn session(&self) -> Result<JsValue, JsValue> {
        let record = self.0.session().map_err(|err| error_to_jsvalue(&err))?;
        to_js(&record)
    }

    /// Forgets the stored session.
    ///
    /// # Errors
    /// Throws while a negotiation runs or if storage refuses the delete.
    pub fn disconnect(&self) -> Result<(), JsValue> {
        self.0.disconnect().map_err(|err| error_to_jsvalue(&err))
    }

    /// Current negotiation state, e.g. `"idle"` or `"awaitingResponse"`.
    #[must_use]
    #[wasm_bindgen(getter)]
    pub fn state(&self) -> String {
        self.0.state().to_string()
    }

    /// Tears everything down; pending promises reject with `CANCELLED`.
    pub fn destroy(&self) {
        self.0.destroy();
    }
}

/// How the surface would be presented for `action` (`"connect"` or `"sign"`) on
/// this page.
///
/// # Errors
/// Throws for an unknown action.
#[wasm_bindgen(js_name = presentationMode)]
pub fn presentation_mode(action: &str) -> Result<String, JsValue> {
    let action = action.parse::<Action>().map_err(|_| {
        error_to_jsvalue(&DialogError::InvalidConfig {
            attribute: "action".to_string(),
            reason: format!("unknown action {action}"),
        })
    })?;
    let window = web_sys::window()
        .ok_or_else(|| error_to_jsvalue(&DialogError::NotSupported("no window".to_string())))?;
    Ok(choose_mode(action, detect_environment(&window)).to_string())
}

fn to_js<T: Serialize>(value: &T) -> Result<JsValue, JsValue> {
    value
        .serialize(&serde_wasm_bindgen::Serializer::json_compatible())
        .map_err(JsValue::from)
}

/// A JS `Error` with the taxonomy `code` attached.
fn error_to_jsvalue(error: &DialogError) -> JsValue {
    let js_error = js_sys::Error::new(&error.to_string());
    if Reflect::set(&js_error, &JsValue::from_str("code"), &JsValue::from_str(error.code())).is_err() {
        log::debug!("could not attach error code {}", error.code());
    }
    js_error.into()
}

#[wasm_bindgen(typescript_custom_section)]
const TYPESCRIPT_DEFS: &str = r#"
export type DialogErrorCode =
    | "PRESENTATION_BLOCKED"
    | "TIMEOUT"
    | "USER_CANCELLED"
    | "ORIGIN_MISMATCH"
    | "MALFORMED_RESPONSE"
    | "ALREADY_IN_PROGRESS"
    | "NOT_SUPPORTED"
    | "REJECTED"
    | "DUPLICATE_CORRELATION_ID"
    | "CANCELLED"
    | "CHANNEL_ERROR"
    | "STORAGE_ERROR"
    | "INVALID_CONFIG"
    | "SERIALIZATION_ERROR";

export interface CredentialRecord {
    credentialId: string;
    publicKey: string;
    derivedAddress: string | null;
    updatedAt: number;
}

export interface ConnectOutcome {
    record: CredentialRecord;
    reconciliation: "created" | "reused";
    mode: "detached" | "embedded";
}

export interface SignOutcome {
    signature: { signature: string; credentialId?: string; [key: string]: unknown };
    mode: "detached" | "embedded";
}
"#;
