//! In-memory platform for tests and the CLI.
//!
//! Everything a browser provides (storage, windows, frames, the `message`
//! event) has a counterpart here that records what happened. A
//! [`ScriptedSurface`] plays the authority side of the protocol.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::future::{Fuse, LocalBoxFuture};
use futures::FutureExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::bus::{InboundMessage, MessageSource, Subscription};
use crate::clock::Clock;
use crate::collaborators::{CredentialCeremony, CredentialOperation, CredentialOutput, TransactionBuilder};
use crate::envelope::{Envelope, MessageType, SignatureCreated};
use crate::error::DialogError;
use crate::origin::Origin;
use crate::session::KeyValueStorage;
use crate::transport::{FrameHost, MessageTarget, ScreenRect, WindowHandle, WindowHost};

/// `localStorage` stand-in. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    entries: Rc<RefCell<BTreeMap<String, String>>>,
    read_only: Rc<Cell<bool>>,
    sets_left: Rc<Cell<Option<usize>>>,
}

impl MemoryStorage {
    /// An empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later write fail, like a full quota.
    pub fn refuse_writes(&self) {
        self.read_only.set(true);
    }

    /// Lets `count` more values be set, then fails every further set like a full
    /// quota. Deletes keep working.
    pub fn refuse_writes_after(&self, count: usize) {
        self.sets_left.set(Some(count));
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    fn check_writable(&self) -> Result<(), DialogError> {
        if self.read_only.get() {
            return Err(DialogError::Storage("quota exceeded".to_string()));
        }
        Ok(())
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, DialogError> {
        Ok(self.entries.borrow().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), DialogError> {
        self.check_writable()?;
        if let Some(left) = self.sets_left.get() {
            let Some(left) = left.checked_sub(1) else {
                return Err(DialogError::Storage("quota exceeded".to_string()));
            };
            self.sets_left.set(Some(left));
        }
        self.entries
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), DialogError> {
        self.check_writable()?;
        self.entries.borrow_mut().remove(key);
        Ok(())
    }
}

type Handler = Rc<dyn Fn(InboundMessage)>;

#[derive(Default)]
struct ChannelInner {
    listeners: RefCell<Vec<(u64, Handler)>>,
    next_listener: Cell<u64>,
    surfaces: RefCell<Vec<mpsc::UnboundedSender<Value>>>,
}

/// The cross-context messaging fabric between host and surfaces.
///
/// Host listeners subscribe through [`MessageSource`]; surfaces receive whatever
/// the host posts into any [`RecordingTarget`] connected to the channel.
#[derive(Clone, Default)]
pub struct MemoryChannel {
    inner: Rc<ChannelInner>,
}

impl MemoryChannel {
    /// A channel with no listeners.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatches a message event to every host listener, as if posted from `origin`.
    pub fn emit(&self, origin: &str, data: Value) {
        let listeners: Vec<Handler> = self
            .inner
            .listeners
            .borrow()
            .iter()
            .map(|(_, handler)| Rc::clone(handler))
            .collect();
        for listener in listeners {
            listener(InboundMessage {
                origin: origin.to_string(),
                data: data.clone(),
            });
        }
    }

    /// Number of attached host listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.borrow().len()
    }

    /// Opens a surface endpoint receiving everything the host posts from now on.
    #[must_use]
    pub fn connect_surface(&self) -> mpsc::UnboundedReceiver<Value> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.inner.surfaces.borrow_mut().push(sender);
        receiver
    }

    fn forward(&self, value: &Value) {
        self.inner
            .surfaces
            .borrow_mut()
            .retain(|surface| surface.send(value.clone()).is_ok());
    }
}

struct MemorySubscription {
    channel: Weak<ChannelInner>,
    id: u64,
}

impl Subscription for MemorySubscription {
    fn release(&mut self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.listeners.borrow_mut().retain(|(id, _)| *id != self.id);
        }
    }
}

impl MessageSource for MemoryChannel {
    fn listen(&self, handler: Handler) -> Result<Box<dyn Subscription>, DialogError> {
        let id = self.inner.next_listener.get();
        self.inner.next_listener.set(id + 1);
        self.inner.listeners.borrow_mut().push((id, handler));
        Ok(Box::new(MemorySubscription {
            channel: Rc::downgrade(&self.inner),
            id,
        }))
    }
}

/// Records every posted message, optionally forwarding it to a [`MemoryChannel`].
#[derive(Default)]
pub struct RecordingTarget {
    channel: Option<MemoryChannel>,
    posted: RefCell<Vec<Value>>,
}

impl RecordingTarget {
    /// A target that only records.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A target whose posts reach the surfaces of `channel`.
    #[must_use]
    pub fn connected(channel: &MemoryChannel) -> Self {
        Self {
            channel: Some(channel.clone()),
            posted: RefCell::default(),
        }
    }

    /// Raw posted values.
    #[must_use]
    pub fn posted(&self) -> Vec<Value> {
        self.posted.borrow().clone()
    }

    /// Posted values that decode as envelopes.
    #[must_use]
    pub fn envelopes(&self) -> Vec<Envelope> {
        self.posted
            .borrow()
            .iter()
            .filter_map(|value| Envelope::from_value(value).ok())
            .collect()
    }
}

impl MessageTarget for RecordingTarget {
    fn post(&self, message: &Value) -> Result<(), DialogError> {
        self.posted.borrow_mut().push(message.clone());
        if let Some(channel) = &self.channel {
            channel.forward(message);
        }
        Ok(())
    }
}

/// A popup opened by [`MemoryWindowHost`].
pub struct MemoryWindow {
    url: String,
    features: String,
    target: RecordingTarget,
    closed: Cell<bool>,
    closes_at: Cell<Option<Instant>>,
    close_calls: Cell<usize>,
}

impl MemoryWindow {
    /// The url the window was opened at.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The `features` string the window was opened with.
    #[must_use]
    pub fn features(&self) -> &str {
        &self.features
    }

    /// Envelopes posted into the window.
    #[must_use]
    pub fn envelopes(&self) -> Vec<Envelope> {
        self.target.envelopes()
    }

    /// Programmatic `close()` calls.
    #[must_use]
    pub fn close_calls(&self) -> usize {
        self.close_calls.get()
    }

    /// The user closes the window now.
    pub fn close_by_user(&self) {
        self.closed.set(true);
    }

    /// The user closes the window `delay` from now.
    pub fn close_by_user_after(&self, delay: Duration) {
        self.closes_at.set(Some(Instant::now() + delay));
    }
}

impl MessageTarget for MemoryWindow {
    fn post(&self, message: &Value) -> Result<(), DialogError> {
        if self.is_closed() {
            return Err(DialogError::Channel("window is closed".to_string()));
        }
        self.target.post(message)
    }
}

impl WindowHandle for MemoryWindow {
    fn is_closed(&self) -> bool {
        self.closed.get() || self.closes_at.get().is_some_and(|at| Instant::now() >= at)
    }

    fn close(&self) {
        self.close_calls.set(self.close_calls.get() + 1);
        self.closed.set(true);
    }
}

struct WindowHostInner {
    channel: MemoryChannel,
    screen: Cell<ScreenRect>,
    blocked: Cell<bool>,
    windows: RefCell<Vec<Rc<MemoryWindow>>>,
}

/// `window.open` stand-in. Clones share the same windows.
#[derive(Clone)]
pub struct MemoryWindowHost {
    inner: Rc<WindowHostInner>,
}

impl MemoryWindowHost {
    /// A host on a 1440x900 screen with its own channel.
    #[must_use]
    pub fn new() -> Self {
        Self::with_channel(&MemoryChannel::new())
    }

    /// A host whose windows post into `channel`.
    #[must_use]
    pub fn with_channel(channel: &MemoryChannel) -> Self {
        Self {
            inner: Rc::new(WindowHostInner {
                channel: channel.clone(),
                screen: Cell::new(ScreenRect {
                    left: 0,
                    top: 0,
                    width: 1440,
                    height: 900,
                }),
                blocked: Cell::new(false),
                windows: RefCell::default(),
            }),
        }
    }

    /// A host whose popups are always blocked.
    #[must_use]
    pub fn blocking() -> Self {
        let host = Self::new();
        host.set_blocked(true);
        host
    }

    /// Starts or stops blocking popups.
    pub fn set_blocked(&self, blocked: bool) {
        self.inner.blocked.set(blocked);
    }

    /// Moves the host window.
    pub fn set_screen(&self, screen: ScreenRect) {
        self.inner.screen.set(screen);
    }

    /// Every window opened so far, oldest first.
    #[must_use]
    pub fn windows(&self) -> Vec<Rc<MemoryWindow>> {
        self.inner.windows.borrow().clone()
    }

    /// The most recently opened window.
    #[must_use]
    pub fn last_window(&self) -> Option<Rc<MemoryWindow>> {
        self.inner.windows.borrow().last().cloned()
    }
}

impl Default for MemoryWindowHost {
    fn default() -> Self {
        Self::new()
    }
}

impl WindowHost for MemoryWindowHost {
    fn host_screen(&self) -> ScreenRect {
        self.inner.screen.get()
    }

    fn open(&self, url: &str, features: &str) -> Option<Rc<dyn WindowHandle>> {
        if self.inner.blocked.get() {
            return None;
        }
        let window = Rc::new(MemoryWindow {
            url: url.to_string(),
            features: features.to_string(),
            target: RecordingTarget::connected(&self.inner.channel),
            closed: Cell::new(false),
            closes_at: Cell::new(None),
            close_calls: Cell::new(0),
        });
        self.inner.windows.borrow_mut().push(Rc::clone(&window));
        Some(window)
    }
}

/// A step taken by [`MemoryFrameHost`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// Modal container created.
    CreateContainer,
    /// Frame created with this `allow` attribute.
    CreateFrame(String),
    /// Container and frame inserted into the page.
    Show,
    /// Frame navigated.
    Navigate(String),
    /// Frame removed from the page.
    RemoveFrame,
    /// Container removed from the page.
    RemoveContainer,
    /// Everything released.
    Dispose,
}

struct FrameHostInner {
    channel: MemoryChannel,
    events: RefCell<Vec<FrameEvent>>,
    on_dismiss: RefCell<Option<Rc<dyn Fn()>>>,
    frame: RefCell<Option<Rc<RecordingTarget>>>,
    hold_loading: Cell<bool>,
    loads: RefCell<Vec<oneshot::Sender<()>>>,
}

/// Modal overlay and frame stand-in. Clones share the same page.
#[derive(Clone)]
pub struct MemoryFrameHost {
    inner: Rc<FrameHostInner>,
}

impl MemoryFrameHost {
    /// A page with its own channel whose frames load instantly.
    #[must_use]
    pub fn new() -> Self {
        Self::with_channel(&MemoryChannel::new())
    }

    /// A page whose frame posts into `channel`.
    #[must_use]
    pub fn with_channel(channel: &MemoryChannel) -> Self {
        Self {
            inner: Rc::new(FrameHostInner {
                channel: channel.clone(),
                events: RefCell::default(),
                on_dismiss: RefCell::default(),
                frame: RefCell::default(),
                hold_loading: Cell::new(false),
                loads: RefCell::default(),
            }),
        }
    }

    /// Frames stop reporting loaded until [`MemoryFrameHost::finish_loading`].
    pub fn hold_loading(&self) {
        self.inner.hold_loading.set(true);
    }

    /// Fires every outstanding load event and stops holding.
    pub fn finish_loading(&self) {
        self.inner.hold_loading.set(false);
        for load in self.inner.loads.borrow_mut().drain(..) {
            let _ = load.send(());
        }
    }

    /// The user clicks the close button (or presses Escape).
    pub fn dismiss(&self) {
        let handler = self.inner.on_dismiss.borrow().clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    /// Every step so far.
    #[must_use]
    pub fn events(&self) -> Vec<FrameEvent> {
        self.inner.events.borrow().clone()
    }

    /// The last navigation target.
    #[must_use]
    pub fn last_navigation(&self) -> Option<String> {
        self.inner.events.borrow().iter().rev().find_map(|event| match event {
            FrameEvent::Navigate(url) => Some(url.clone()),
            _ => None,
        })
    }

    /// Envelopes posted into the frame.
    #[must_use]
    pub fn envelopes(&self) -> Vec<Envelope> {
        self.inner
            .frame
            .borrow()
            .as_ref()
            .map(|frame| frame.envelopes())
            .unwrap_or_default()
    }

    fn record(&self, event: FrameEvent) {
        self.inner.events.borrow_mut().push(event);
    }
}

impl Default for MemoryFrameHost {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameHost for MemoryFrameHost {
    fn create_container(&self, on_dismiss: Rc<dyn Fn()>) -> Result<(), DialogError> {
        *self.inner.on_dismiss.borrow_mut() = Some(on_dismiss);
        self.record(FrameEvent::CreateContainer);
        Ok(())
    }

    fn create_frame(&self, allow: &str) -> Result<Rc<dyn MessageTarget>, DialogError> {
        let frame = Rc::new(RecordingTarget::connected(&self.inner.channel));
        *self.inner.frame.borrow_mut() = Some(Rc::clone(&frame));
        self.record(FrameEvent::CreateFrame(allow.to_string()));
        Ok(frame)
    }

    fn show(&self) -> Result<(), DialogError> {
        self.record(FrameEvent::Show);
        Ok(())
    }

    fn navigate(&self, url: &str) -> Result<(), DialogError> {
        self.record(FrameEvent::Navigate(url.to_string()));
        Ok(())
    }

    fn loaded(&self) -> LocalBoxFuture<'static, ()> {
        if !self.inner.hold_loading.get() {
            return Box::pin(futures::future::ready(()));
        }
        let (sender, receiver) = oneshot::channel();
        self.inner.loads.borrow_mut().push(sender);
        Box::pin(async move {
            let _ = receiver.await;
        })
    }

    fn remove_frame(&self) {
        self.record(FrameEvent::RemoveFrame);
    }

    fn remove_container(&self) {
        self.record(FrameEvent::RemoveContainer);
    }

    fn dispose(&self) {
        self.inner.on_dismiss.borrow_mut().take();
        self.record(FrameEvent::Dispose);
    }
}

/// A deterministic passkey authenticator.
pub struct MemoryAuthenticator {
    credential_id: String,
    public_key: Vec<u8>,
    failure: Option<DialogError>,
    ceremonies: RefCell<Vec<CredentialCeremony>>,
}

impl MemoryAuthenticator {
    /// An authenticator holding one passkey.
    #[must_use]
    pub fn new(credential_id: &str, public_key: &[u8]) -> Self {
        Self {
            credential_id: credential_id.to_string(),
            public_key: public_key.to_vec(),
            failure: None,
            ceremonies: RefCell::default(),
        }
    }

    /// An authenticator whose every ceremony fails with `error`.
    #[must_use]
    pub fn failing(error: DialogError) -> Self {
        Self {
            failure: Some(error),
            ..Self::new("", &[])
        }
    }

    /// Ceremonies performed so far.
    #[must_use]
    pub fn ceremonies(&self) -> Vec<CredentialCeremony> {
        self.ceremonies.borrow().clone()
    }
}

#[async_trait(?Send)]
impl CredentialOperation for MemoryAuthenticator {
    async fn perform(
        &self,
        ceremony: CredentialCeremony,
        challenge: &[u8],
    ) -> Result<CredentialOutput, DialogError> {
        self.ceremonies.borrow_mut().push(ceremony);
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        let client_data = json!({
            "type": match ceremony {
                CredentialCeremony::Create => "webauthn.create",
                CredentialCeremony::Get => "webauthn.get",
            },
            "challenge": STANDARD.encode(challenge),
        });
        let mut signature = b"sig:".to_vec();
        signature.extend_from_slice(challenge);
        Ok(CredentialOutput {
            credential_id: self.credential_id.clone(),
            public_key: (ceremony == CredentialCeremony::Create)
                .then(|| STANDARD.encode(&self.public_key)),
            signature: (ceremony == CredentialCeremony::Get).then(|| STANDARD.encode(signature)),
            authenticator_data: STANDARD.encode([0u8; 37]),
            client_data_json: STANDARD.encode(client_data.to_string()),
        })
    }
}

/// Wraps the signature and the instruction into one JSON document.
#[derive(Debug, Default)]
pub struct MemoryTransactionBuilder;

#[async_trait(?Send)]
impl TransactionBuilder for MemoryTransactionBuilder {
    async fn build_authorized_transaction(
        &self,
        payload: &SignatureCreated,
        instruction: &Value,
    ) -> Result<Value, DialogError> {
        Ok(json!({
            "instruction": instruction,
            "authorization": serde_json::to_value(payload)?,
        }))
    }
}

/// How a [`ScriptedSurface`] reacts to a connect or sign request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceBehavior {
    /// Runs the ceremony and answers.
    Respond,
    /// Never answers.
    Silent,
    /// Broadcasts `CLOSE` instead of answering, like a cancel button inside the surface.
    Close,
}

/// The authority surface, driven by a [`CredentialOperation`].
///
/// Call [`ScriptedSurface::run`] alongside the negotiation; it returns when
/// the host broadcasts `CLOSE`.
pub struct ScriptedSurface {
    channel: MemoryChannel,
    origin: String,
    clock: Rc<dyn Clock>,
    authenticator: Rc<dyn CredentialOperation>,
    behavior: SurfaceBehavior,
    latency: Duration,
    smart_wallet_address: Option<String>,
    request_credentials: bool,
    acknowledge_sync: bool,
    inbox: RefCell<Option<mpsc::UnboundedReceiver<Value>>>,
    received: RefCell<Vec<Envelope>>,
}

impl ScriptedSurface {
    /// A surface served from `origin`, listening on `channel` from now on.
    #[must_use]
    pub fn new(
        channel: &MemoryChannel,
        origin: &Origin,
        clock: Rc<dyn Clock>,
        authenticator: Rc<dyn CredentialOperation>,
    ) -> Self {
        Self {
            channel: channel.clone(),
            origin: origin.as_str().to_string(),
            clock,
            authenticator,
            behavior: SurfaceBehavior::Respond,
            latency: Duration::from_millis(50),
            smart_wallet_address: None,
            request_credentials: false,
            acknowledge_sync: false,
            inbox: RefCell::new(Some(channel.connect_surface())),
            received: RefCell::default(),
        }
    }

    /// Sets how requests are handled.
    #[must_use]
    pub const fn with_behavior(mut self, behavior: SurfaceBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Delay between receiving a request and answering it.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Wallet address reported on connect.
    #[must_use]
    pub fn with_smart_wallet_address(mut self, address: &str) -> Self {
        self.smart_wallet_address = Some(address.to_string());
        self
    }

    /// Posts as if served from another origin.
    #[must_use]
    pub fn impersonating(mut self, origin: &str) -> Self {
        self.origin = origin.to_string();
        self
    }

    /// Asks the host for its stored credentials before answering a request.
    #[must_use]
    pub const fn requesting_credentials(mut self) -> Self {
        self.request_credentials = true;
        self
    }

    /// Announces `READY` on the first credential sync push.
    #[must_use]
    pub const fn acknowledging_sync(mut self) -> Self {
        self.acknowledge_sync = true;
        self
    }

    /// Every envelope the host posted, in order.
    #[must_use]
    pub fn received(&self) -> Vec<Envelope> {
        self.received.borrow().clone()
    }

    /// How many received envelopes were of `kind`.
    #[must_use]
    pub fn received_count(&self, kind: MessageType) -> usize {
        self.received
            .borrow()
            .iter()
            .filter(|envelope| envelope.kind == kind)
            .count()
    }

    /// Serves the host until it broadcasts `CLOSE`.
    ///
    /// A request is answered after the configured latency; broadcasts keep being
    /// handled meanwhile.
    pub async fn run(&self) {
        let Some(mut inbox) = self.inbox.borrow_mut().take() else {
            return;
        };
        let mut announced = false;
        let mut queued: Option<Envelope> = None;
        let mut answer_due = Fuse::terminated();

        loop {
            futures::select_biased! {
                () = answer_due => {
                    if let Some(request) = queued.take() {
                        if let Some(answer) = self.answer(&request).await {
                            self.emit(&answer);
                        }
                    }
                }
                value = inbox.recv().fuse() => {
                    let Some(value) = value else {
                        return;
                    };
                    let Ok(envelope) = Envelope::from_value(&value) else {
                        continue;
                    };
                    self.received.borrow_mut().push(envelope.clone());
                    match envelope.kind {
                        MessageType::ConnectRequest | MessageType::SignRequest => {
                            if self.request_credentials {
                                self.emit(&Envelope::surface(
                                    MessageType::CredentialsRequest,
                                    self.clock.now_ms(),
                                ));
                            }
                            queued = Some(envelope);
                            answer_due = self.clock.sleep(self.latency).fuse();
                        }
                        MessageType::SyncCredentials if self.acknowledge_sync && !announced => {
                            announced = true;
                            self.emit(&Envelope::surface(MessageType::Ready, self.clock.now_ms()));
                        }
                        MessageType::Close => return,
                        _ => {}
                    }
                }
            }
        }
    }

    async fn answer(&self, request: &Envelope) -> Option<Envelope> {
        let now = self.clock.now_ms();
        match self.behavior {
            SurfaceBehavior::Silent => return None,
            SurfaceBehavior::Close => return Some(Envelope::surface(MessageType::Close, now)),
            SurfaceBehavior::Respond => {}
        }

        let result = if request.kind == MessageType::ConnectRequest {
            self.connect().await
        } else {
            self.sign(request).await
        };
        Some(match result {
            Ok((kind, data)) => Envelope::surface(kind, now).answering(request).with_data(data),
            Err(err) => Envelope::surface(MessageType::Error, now)
                .answering(request)
                .with_error(err.code(), err.to_string()),
        })
    }

    async fn connect(&self) -> Result<(MessageType, Value), DialogError> {
        let output = self
            .authenticator
            .perform(CredentialCeremony::Create, b"connect")
            .await?;
        Ok((
            MessageType::WalletConnected,
            json!({
                "credentialId": output.credential_id,
                "publicKey": output.public_key,
                "smartWalletAddress": self.smart_wallet_address,
            }),
        ))
    }

    async fn sign(&self, request: &Envelope) -> Result<(MessageType, Value), DialogError> {
        let message = request
            .data
            .as_ref()
            .and_then(|data| data.get("message"))
            .and_then(Value::as_str)
            .and_then(|encoded| STANDARD.decode(encoded).ok())
            .ok_or_else(|| DialogError::MalformedResponse("sign request without message".to_string()))?;
        let output = self
            .authenticator
            .perform(CredentialCeremony::Get, &message)
            .await?;
        Ok((
            MessageType::SignatureCreated,
            json!({
                "signature": output.signature,
                "credentialId": output.credential_id,
                "authenticatorDataBase64": output.authenticator_data,
                "clientDataJsonBase64": output.client_data_json,
            }),
        ))
    }

    fn emit(&self, envelope: &Envelope) {
        match envelope.to_value() {
            Ok(value) => self.channel.emit(&self.origin, value),
            Err(err) => log::warn!("surface could not encode {}: {err}", envelope.kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;

    #[test]
    fn test_storage_clones_share_entries() {
        let storage = MemoryStorage::new();
        let other = storage.clone();
        storage.set("A", "1").unwrap();
        assert_eq!(other.get("A").unwrap().as_deref(), Some("1"));
        assert_eq!(other.len(), 1);

        other.refuse_writes();
        assert!(matches!(storage.set("B", "2"), Err(DialogError::Storage(_))));
    }

    #[test]
    fn test_channel_routes_both_directions() {
        let channel = MemoryChannel::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut subscription = {
            let seen = Rc::clone(&seen);
            channel
                .listen(Rc::new(move |message: InboundMessage| {
                    seen.borrow_mut().push(message.origin);
                }))
                .unwrap()
        };
        let mut surface = channel.connect_surface();

        channel.emit("https://portal.example.com", json!({}));
        RecordingTarget::connected(&channel).post(&json!({"k": 1})).unwrap();
        assert_eq!(*seen.borrow(), vec!["https://portal.example.com".to_string()]);
        assert_eq!(surface.try_recv().unwrap(), json!({"k": 1}));

        subscription.release();
        subscription.release();
        channel.emit("https://portal.example.com", json!({}));
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(channel.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_authenticator_output_by_ceremony() {
        let authenticator = MemoryAuthenticator::new("abc", &[1, 2, 3]);
        let created = authenticator
            .perform(CredentialCeremony::Create, b"x")
            .await
            .unwrap();
        assert_eq!(created.public_key.as_deref(), Some("AQID"));
        assert_eq!(created.signature, None);

        let asserted = authenticator
            .perform(CredentialCeremony::Get, b"x")
            .await
            .unwrap();
        assert_eq!(asserted.public_key, None);
        assert_eq!(asserted.signature, Some(STANDARD.encode(b"sig:x")));
        assert_eq!(
            authenticator.ceremonies(),
            vec![CredentialCeremony::Create, CredentialCeremony::Get]
        );
    }

    #[tokio::test]
    async fn test_transaction_builder_wraps_signature() {
        let payload = SignatureCreated {
            signature: "c2ln".to_string(),
            credential_id: Some("abc".to_string()),
            extra: serde_json::Map::new(),
        };
        let transaction = MemoryTransactionBuilder
            .build_authorized_transaction(&payload, &json!({"to": "0x01"}))
            .await
            .unwrap();
        assert_eq!(transaction["authorization"]["signature"], "c2ln");
        assert_eq!(transaction["instruction"]["to"], "0x01");
    }

    #[tokio::test(start_paused = true)]
    async fn test_surface_reports_ceremony_failure_as_error_envelope() {
        let channel = MemoryChannel::new();
        let origin = Origin::parse("https://portal.example.com").unwrap();
        let surface = ScriptedSurface::new(
            &channel,
            &origin,
            Rc::new(TokioClock::new()),
            Rc::new(MemoryAuthenticator::failing(DialogError::UserCancelled)),
        );
        let answers = Rc::new(RefCell::new(Vec::new()));
        let _subscription = {
            let answers = Rc::clone(&answers);
            channel
                .listen(Rc::new(move |message: InboundMessage| {
                    answers.borrow_mut().push(message.data);
                }))
                .unwrap()
        };

        let target = RecordingTarget::connected(&channel);
        let request = Envelope::host(MessageType::ConnectRequest, 1);
        target.post(&request.to_value().unwrap()).unwrap();
        let close_later = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            target
                .post(&Envelope::host(MessageType::Close, 2).to_value().unwrap())
                .unwrap();
        };
        tokio::join!(surface.run(), close_later);

        let answer = Envelope::from_value(&answers.borrow()[0]).unwrap();
        assert_eq!(answer.kind, MessageType::Error);
        assert_eq!(answer.error.unwrap().code, "USER_CANCELLED");
        assert_eq!(surface.received_count(MessageType::Close), 1);
    }
}
