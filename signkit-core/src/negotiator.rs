//! One state machine per host: open the surface, exchange one request, reconcile,
//! tear down.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::FutureExt;
use serde::Serialize;
use serde_json::json;
use strum::Display;
use tokio::sync::mpsc;
use url::Url;

use crate::bus::{MessageBus, MessageSource, RequestKind};
use crate::clock::Clock;
use crate::config::NegotiatorConfig;
use crate::envelope::{Envelope, MessageType, SignatureCreated, WalletConnected};
use crate::error::DialogError;
use crate::mode::{choose_mode, Action, Environment, PresentationMode};
use crate::session::{CredentialRecord, KeyValueStorage, Reconciliation, SessionStore};
use crate::sync::{CredentialSynchronizer, SyncAck};
use crate::transport::{
    DetachedWindowTransport, EmbeddedSurfaceTransport, FrameHost, MessageTarget, SurfaceLink,
    Transport, TransportSession, WindowHost,
};

/// Where a negotiation stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum NegotiationState {
    /// Nothing in flight.
    Idle,
    /// Presenting the surface.
    Opening,
    /// Request sent, waiting for the correlated response.
    AwaitingResponse,
    /// Consuming the response.
    Verifying,
    /// Tearing down after success.
    Closing,
    /// Tearing down after a failure.
    Failed,
}

/// Platform primitives a negotiator runs on.
pub struct Platform<S, W, F> {
    /// What is known about the host platform.
    pub environment: Environment,
    /// Time source.
    pub clock: Rc<dyn Clock>,
    /// Durable per-origin storage.
    pub storage: S,
    /// Opens detached windows.
    pub windows: W,
    /// Builds the embedded modal and frame.
    pub frames: F,
}

/// Result of [`SessionNegotiator::negotiate_connect`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectOutcome {
    /// The session now stored.
    pub record: CredentialRecord,
    /// Whether the credential was new or already known.
    pub reconciliation: Reconciliation,
    /// How the surface was presented.
    pub mode: PresentationMode,
}

/// Result of [`SessionNegotiator::negotiate_sign`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignOutcome {
    /// The surface's signature payload.
    pub signature: SignatureCreated,
    /// How the surface was presented.
    pub mode: PresentationMode,
}

/// Marks a negotiation in flight; tears down and returns to idle however it ends.
struct InFlight<'a, S: KeyValueStorage> {
    negotiator: &'a SessionNegotiator<S>,
}

impl<S: KeyValueStorage> Drop for InFlight<'_, S> {
    fn drop(&mut self) {
        self.negotiator.teardown();
        self.negotiator.state.set(NegotiationState::Idle);
    }
}

/// Negotiates passkey sessions and signatures with the authority surface.
///
/// At most one negotiation runs at a time; the surface is presented for the
/// duration of a negotiation and torn down once its response is consumed.
pub struct SessionNegotiator<S: KeyValueStorage> {
    config: NegotiatorConfig,
    environment: Environment,
    clock: Rc<dyn Clock>,
    store: SessionStore<S>,
    bus: MessageBus,
    synchronizer: CredentialSynchronizer,
    detached: Box<dyn Transport>,
    embedded: Box<dyn Transport>,
    state: Cell<NegotiationState>,
    current: RefCell<Option<(PresentationMode, Rc<dyn MessageTarget>)>>,
    destroyed: Cell<bool>,
}

impl<S: KeyValueStorage> SessionNegotiator<S> {
    /// Creates a negotiator and attaches its bus to `messages`.
    ///
    /// # Errors
    ///
    /// Returns [`DialogError::InvalidConfig`] for an invalid `config`, or the
    /// error of `messages` if the listener cannot be attached.
    pub fn new<W, F>(
        config: NegotiatorConfig,
        platform: Platform<S, W, F>,
        messages: &dyn MessageSource,
    ) -> Result<Self, DialogError>
    where
        W: WindowHost + 'static,
        F: FrameHost + 'static,
    {
        config.validate()?;
        let authority = config.authority_origin()?;
        let Platform {
            environment,
            clock,
            storage,
            windows,
            frames,
        } = platform;

        let bus = MessageBus::new(authority.clone(), Rc::clone(&clock));
        bus.listen(messages)?;

        let detached = DetachedWindowTransport::new(
            windows,
            Rc::clone(&clock),
            config.window_width,
            config.window_height,
            config.close_poll(),
        );
        let embedded = EmbeddedSurfaceTransport::new(frames, &authority);
        let synchronizer = CredentialSynchronizer::new(
            config.sync_schedule(),
            config.sync_defer(),
            config.sync_max_deferrals,
            Rc::clone(&clock),
        );

        log::debug!("negotiator ready for {authority} ({environment:?})");
        Ok(Self {
            config,
            environment,
            clock,
            store: SessionStore::new(storage),
            bus,
            synchronizer,
            detached: Box::new(detached),
            embedded: Box::new(embedded),
            state: Cell::new(NegotiationState::Idle),
            current: RefCell::new(None),
            destroyed: Cell::new(false),
        })
    }

    /// Establishes or re-establishes a passkey session.
    ///
    /// A credential the store already holds is reused; any other credential
    /// replaces the stored session.
    ///
    /// # Errors
    ///
    /// - [`DialogError::AlreadyInProgress`] while another negotiation runs.
    /// - [`DialogError::PresentationBlocked`] if the surface cannot be shown.
    /// - [`DialogError::UserCancelled`] if the user closes the surface.
    /// - [`DialogError::Timeout`] if the surface does not answer in time.
    /// - Any error the surface reports, and storage errors.
    pub async fn negotiate_connect(&self) -> Result<ConnectOutcome, DialogError> {
        let _in_flight = self.begin()?;
        let mode = choose_mode(Action::Connect, self.environment);
        let request = Envelope::host(MessageType::ConnectRequest, self.clock.now_ms());

        let outcome = self
            .exchange(Action::Connect, mode, &request, RequestKind::Connect)
            .await
            .and_then(|response| {
                self.state.set(NegotiationState::Verifying);
                self.reconcile(&response)
            })
            .map(|(record, reconciliation)| ConnectOutcome {
                record,
                reconciliation,
                mode,
            });
        self.finish(outcome)
    }

    /// Asks the surface to sign `message` with the session's passkey.
    ///
    /// # Errors
    ///
    /// Same as [`SessionNegotiator::negotiate_connect`].
    pub async fn negotiate_sign(&self, message: &[u8]) -> Result<SignOutcome, DialogError> {
        let _in_flight = self.begin()?;
        let mode = choose_mode(Action::Sign, self.environment);

        let mut data = json!({ "message": STANDARD.encode(message) });
        match self.store.load() {
            Ok(Some(record)) => data["credentialId"] = json!(record.credential_id),
            Ok(None) => {}
            Err(err) => return self.finish(Err(err)),
        }
        let request = Envelope::host(MessageType::SignRequest, self.clock.now_ms()).with_data(data);

        let outcome = self
            .exchange(Action::Sign, mode, &request, RequestKind::Sign)
            .await
            .and_then(|response| {
                self.state.set(NegotiationState::Verifying);
                response.decode_data::<SignatureCreated>()
            })
            .map(|signature| SignOutcome { signature, mode });
        self.finish(outcome)
    }

    /// The stored session, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage backend fails.
    pub fn session(&self) -> Result<Option<CredentialRecord>, DialogError> {
        self.store.load()
    }

    /// Forgets the stored session.
    ///
    /// # Errors
    ///
    /// Returns [`DialogError::AlreadyInProgress`] while a negotiation runs, or a
    /// storage error.
    pub fn disconnect(&self) -> Result<(), DialogError> {
        if self.state.get() != NegotiationState::Idle {
            return Err(DialogError::AlreadyInProgress);
        }
        self.store.clear()
    }

    /// Current state of the machine.
    pub fn state(&self) -> NegotiationState {
        self.state.get()
    }

    /// Status of the presented surface, if one is showing.
    pub fn transport_session(&self) -> Option<TransportSession> {
        self.detached.session().or_else(|| self.embedded.session())
    }

    /// The negotiator's message bus.
    pub const fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// The platform description the negotiator decides modes with.
    pub const fn environment(&self) -> Environment {
        self.environment
    }

    /// Tears both transports down and releases the message listener. Any
    /// negotiation in flight fails with [`DialogError::Cancelled`]; later ones
    /// are refused the same way.
    pub fn destroy(&self) {
        self.destroyed.set(true);
        self.teardown();
        self.detached.destroy();
        self.embedded.destroy();
        self.bus.destroy();
    }

    fn begin(&self) -> Result<InFlight<'_, S>, DialogError> {
        if self.destroyed.get() {
            return Err(DialogError::Cancelled);
        }
        if self.state.get() != NegotiationState::Idle {
            log::debug!("refusing negotiation while {}", self.state.get());
            return Err(DialogError::AlreadyInProgress);
        }
        self.state.set(NegotiationState::Opening);
        Ok(InFlight { negotiator: self })
    }

    fn finish<T>(&self, outcome: Result<T, DialogError>) -> Result<T, DialogError> {
        match &outcome {
            Ok(_) => self.state.set(NegotiationState::Closing),
            Err(err) => {
                log::debug!("negotiation failed: {err}");
                self.state.set(NegotiationState::Failed);
            }
        }
        self.teardown();
        outcome
    }

    /// Presents the surface and runs the request while syncing credentials into it.
    async fn exchange(
        &self,
        action: Action,
        mode: PresentationMode,
        request: &Envelope,
        kind: RequestKind,
    ) -> Result<Envelope, DialogError> {
        let url = self.surface_url(action);
        let ack = SyncAck::default();
        let record = self.store.load().unwrap_or_else(|err| {
            log::warn!("stored session unreadable, skipping credential sync: {err}");
            None
        });

        let sync = async {
            match (&record, mode) {
                (Some(record), PresentationMode::Embedded) => {
                    let probe = || self.embedded_target();
                    Some(self.synchronizer.run(record, &probe, &ack).await)
                }
                _ => None,
            }
        }
        .fuse();
        let present = self.present(mode, &url, request, kind, &ack).fuse();
        futures::pin_mut!(sync, present);

        loop {
            futures::select_biased! {
                result = present => return result,
                report = sync => {
                    if let Some(report) = report {
                        log::debug!("credential sync report: {report:?}");
                    }
                }
            }
        }
    }

    async fn present(
        &self,
        mode: PresentationMode,
        url: &Url,
        request: &Envelope,
        kind: RequestKind,
        ack: &SyncAck,
    ) -> Result<Envelope, DialogError> {
        // opening one mode closes the other first
        match mode {
            PresentationMode::Detached => self.embedded.close(),
            PresentationMode::Embedded => self.detached.close(),
        }
        let link = self.open_within_deadline(mode, url, request).await?;
        *self.current.borrow_mut() = Some((mode, Rc::clone(&link.target)));

        let broadcasts = self.bus.subscribe();
        self.state.set(NegotiationState::AwaitingResponse);

        let response = self
            .bus
            .send(link.target.as_ref(), request, kind, self.config.request_timeout())
            .fuse();
        let closed = link.closed.fuse();
        let surface = self.serve_surface(broadcasts, link.target.as_ref(), ack).fuse();
        futures::pin_mut!(response, closed, surface);

        futures::select_biased! {
            result = response => result,
            () = closed => {
                log::debug!("surface closed by user before responding");
                Err(DialogError::UserCancelled)
            }
            err = surface => Err(err),
        }
    }

    /// Opens the surface, giving up once the request deadline passes without it
    /// loading.
    async fn open_within_deadline(
        &self,
        mode: PresentationMode,
        url: &Url,
        request: &Envelope,
    ) -> Result<SurfaceLink, DialogError> {
        let timeout_ms = self.config.request_timeout_ms;
        let opening = self.transport(mode).open(url).fuse();
        let deadline = self.clock.sleep(self.config.request_timeout()).fuse();
        futures::pin_mut!(opening, deadline);

        futures::select_biased! {
            link = opening => link,
            () = deadline => {
                log::warn!("{mode} surface did not load within {timeout_ms} ms");
                Err(DialogError::Timeout {
                    request_id: request.id.clone(),
                    timeout_ms,
                })
            }
        }
    }

    /// Handles surface broadcasts while a request is pending. Only returns to
    /// end the negotiation.
    async fn serve_surface(
        &self,
        mut broadcasts: mpsc::UnboundedReceiver<Envelope>,
        target: &dyn MessageTarget,
        ack: &SyncAck,
    ) -> DialogError {
        while let Some(envelope) = broadcasts.recv().await {
            match envelope.kind {
                MessageType::CredentialsRequest => self.answer_credentials(target, &envelope),
                MessageType::Ready => ack.acknowledge(),
                MessageType::Close => {
                    log::debug!("surface asked to close");
                    return DialogError::UserCancelled;
                }
                other => log::debug!("ignoring {other} broadcast"),
            }
        }
        DialogError::Cancelled
    }

    fn answer_credentials(&self, target: &dyn MessageTarget, request: &Envelope) {
        let record = self.store.load().unwrap_or_else(|err| {
            log::warn!("stored session unreadable: {err}");
            None
        });
        let data = match serde_json::to_value(&record) {
            Ok(data) => data,
            Err(err) => {
                log::warn!("could not encode stored session: {err}");
                return;
            }
        };
        let response =
            Envelope::host(MessageType::CredentialsResponse, self.clock.now_ms()).with_data(data);
        if let Err(err) = self.bus.reply(target, request, response) {
            log::warn!("could not answer credentials request: {err}");
        }
    }

    fn reconcile(&self, response: &Envelope) -> Result<(CredentialRecord, Reconciliation), DialogError> {
        let connected: WalletConnected = response.decode_data()?;
        let public_key = connected.public_key_bytes()?;
        let (record, reconciliation) = self.store.reconcile(CredentialRecord {
            credential_id: connected.credential_id,
            public_key,
            derived_address: connected.smart_wallet_address,
            updated_at: self.clock.now_ms(),
        })?;
        log::debug!("session {} {reconciliation:?}", record.credential_id);
        Ok((record, reconciliation))
    }

    /// Best-effort `CLOSE` to the surface, then both transports down. Idempotent.
    fn teardown(&self) {
        let current = self.current.borrow_mut().take();
        if let Some((mode, target)) = current {
            let close = Envelope::host(MessageType::Close, self.clock.now_ms());
            if let Err(err) = self.bus.broadcast(target.as_ref(), &close) {
                log::debug!("could not notify {mode} surface of teardown: {err}");
            }
        }
        self.detached.close();
        self.embedded.close();
    }

    fn surface_url(&self, action: Action) -> Url {
        let mut url = self.config.authority_url.clone();
        url.query_pairs_mut()
            .append_pair("action", &action.to_string());
        url
    }

    fn transport(&self, mode: PresentationMode) -> &dyn Transport {
        match mode {
            PresentationMode::Detached => self.detached.as_ref(),
            PresentationMode::Embedded => self.embedded.as_ref(),
        }
    }

    fn embedded_target(&self) -> Option<Rc<dyn MessageTarget>> {
        self.current
            .borrow()
            .as_ref()
            .filter(|(mode, _)| *mode == PresentationMode::Embedded)
            .map(|(_, target)| Rc::clone(target))
    }
}
