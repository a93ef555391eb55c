//! Correlated request/response messaging with the authority surface.
//!
//! Each negotiator owns exactly one [`MessageBus`]. Outbound requests register a
//! pending entry keyed by the envelope id; inbound messages are admitted only
//! from the authority origin and resolve the pending entry whose id they carry
//! in `requestId`. Everything else is dropped as noise, never surfaced as an
//! error to the caller.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Duration;

use futures::future::{self, Either};
use serde_json::Value;
use strum::Display;
use tokio::sync::{mpsc, oneshot};

use crate::clock::Clock;
use crate::envelope::{Envelope, MessageType, SignatureCreated, Source, WalletConnected};
use crate::error::DialogError;
use crate::origin::Origin;
use crate::transport::MessageTarget;

/// A message as reported by the platform's message event.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Serialized origin of the sender, as reported by the platform.
    pub origin: String,
    /// The posted payload.
    pub data: Value,
}

/// A registered platform listener.
pub trait Subscription {
    /// Detaches the listener. Must be idempotent.
    fn release(&mut self);
}

/// The platform's inbound message channel (e.g. the window `message` event).
pub trait MessageSource {
    /// Registers `handler` for every inbound message.
    ///
    /// # Errors
    ///
    /// Returns [`DialogError::Channel`] if the listener cannot be attached.
    fn listen(
        &self,
        handler: Rc<dyn Fn(InboundMessage)>,
    ) -> Result<Box<dyn Subscription>, DialogError>;
}

/// What a request is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum RequestKind {
    /// `CONNECT_REQUEST`, answered by `WALLET_CONNECTED`.
    Connect,
    /// `SIGN_REQUEST`, answered by `SIGNATURE_CREATED`.
    Sign,
}

impl RequestKind {
    /// Envelope type of the request.
    #[must_use]
    pub const fn request_type(self) -> MessageType {
        match self {
            Self::Connect => MessageType::ConnectRequest,
            Self::Sign => MessageType::SignRequest,
        }
    }

    /// Envelope type of a successful response.
    #[must_use]
    pub const fn response_type(self) -> MessageType {
        match self {
            Self::Connect => MessageType::WalletConnected,
            Self::Sign => MessageType::SignatureCreated,
        }
    }

    fn admit(self, envelope: &Envelope) -> Result<(), DropReason> {
        if envelope.kind == MessageType::Error {
            return Ok(());
        }
        if envelope.kind != self.response_type() {
            return Err(DropReason::UnexpectedType {
                expected: self,
                received: envelope.kind,
            });
        }
        let decoded = match self {
            Self::Connect => envelope
                .decode_data::<WalletConnected>()
                .and_then(|connected| connected.public_key_bytes())
                .map(drop),
            Self::Sign => envelope.decode_data::<SignatureCreated>().map(drop),
        };
        decoded.map_err(DropReason::Malformed)
    }
}

/// Why an inbound message was ignored.
#[derive(Debug, Clone, PartialEq)]
pub enum DropReason {
    /// The sender is not the authority origin.
    Untrusted(DialogError),
    /// The payload is not a valid envelope, or its data does not decode.
    Malformed(DialogError),
    /// An envelope produced by a host (our own echo, or another host).
    Echo,
    /// No pending request carries this correlation id.
    Unmatched(String),
    /// The response type does not answer the pending request.
    UnexpectedType {
        /// What the pending request was.
        expected: RequestKind,
        /// What arrived.
        received: MessageType,
    },
    /// The bus was destroyed.
    Destroyed,
}

/// Outcome of [`MessageBus::deliver`].
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// A pending request was resolved.
    Resolved,
    /// Handed to broadcast subscribers.
    Broadcast,
    /// Ignored.
    Dropped(DropReason),
}

struct PendingRequest {
    kind: RequestKind,
    created_at: u64,
    expires_at: u64,
    responder: oneshot::Sender<Envelope>,
}

#[derive(Default)]
struct BusState {
    pending: HashMap<String, PendingRequest>,
    subscribers: Vec<mpsc::UnboundedSender<Envelope>>,
    subscription: Option<Box<dyn Subscription>>,
    destroyed: bool,
}

struct BusInner {
    expected: Origin,
    clock: Rc<dyn Clock>,
    state: RefCell<BusState>,
}

/// Request/response channel to one authority origin.
///
/// Cloning yields another handle to the same bus.
#[derive(Clone)]
pub struct MessageBus {
    inner: Rc<BusInner>,
}

/// Removes the pending entry however the awaiting future ends.
struct PendingGuard<'a> {
    bus: &'a MessageBus,
    correlation_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.bus
            .inner
            .state
            .borrow_mut()
            .pending
            .remove(&self.correlation_id);
    }
}

impl MessageBus {
    /// Creates a bus trusting only `expected`.
    pub fn new(expected: Origin, clock: Rc<dyn Clock>) -> Self {
        Self {
            inner: Rc::new(BusInner {
                expected,
                clock,
                state: RefCell::default(),
            }),
        }
    }

    /// The only origin inbound messages are accepted from.
    pub fn expected_origin(&self) -> &Origin {
        &self.inner.expected
    }

    /// Attaches the bus to a platform message source. The listener is released
    /// by [`MessageBus::destroy`].
    ///
    /// # Errors
    ///
    /// Returns an error if the source refuses the listener.
    pub fn listen(&self, source: &dyn MessageSource) -> Result<(), DialogError> {
        let weak: Weak<BusInner> = Rc::downgrade(&self.inner);
        let subscription = source.listen(Rc::new(move |message: InboundMessage| {
            if let Some(inner) = weak.upgrade() {
                Self { inner }.deliver(&message);
            }
        }))?;

        let previous = {
            let mut state = self.inner.state.borrow_mut();
            if state.destroyed {
                drop(state);
                let mut subscription = subscription;
                subscription.release();
                return Err(DialogError::Cancelled);
            }
            state.subscription.replace(subscription)
        };
        if let Some(mut previous) = previous {
            previous.release();
        }
        Ok(())
    }

    /// Posts `request` into `target` and waits for the correlated response.
    ///
    /// The correlation id is the request's envelope id. An `ERROR` response is
    /// mapped onto [`DialogError`].
    ///
    /// # Errors
    ///
    /// - [`DialogError::DuplicateCorrelationId`] if the id is already pending.
    /// - [`DialogError::Timeout`] if nothing matching arrives within `timeout`.
    /// - [`DialogError::Cancelled`] if the bus is destroyed meanwhile.
    /// - The mapped surface error for an `ERROR` response.
    pub async fn send(
        &self,
        target: &dyn MessageTarget,
        request: &Envelope,
        kind: RequestKind,
        timeout: Duration,
    ) -> Result<Envelope, DialogError> {
        let correlation_id = request.id.clone();
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let wire = request.to_value()?;

        let (responder, response) = oneshot::channel();
        {
            let mut state = self.inner.state.borrow_mut();
            if state.destroyed {
                return Err(DialogError::Cancelled);
            }
            if state.pending.contains_key(&correlation_id) {
                return Err(DialogError::DuplicateCorrelationId(correlation_id));
            }
            let created_at = self.inner.clock.now_ms();
            state.pending.insert(
                correlation_id.clone(),
                PendingRequest {
                    kind,
                    created_at,
                    expires_at: created_at.saturating_add(timeout_ms),
                    responder,
                },
            );
        }
        let _guard = PendingGuard {
            bus: self,
            correlation_id: correlation_id.clone(),
        };

        target.post(&wire)?;
        log::debug!("sent {} {correlation_id}", request.kind);

        let deadline = self.inner.clock.sleep(timeout);
        match future::select(response, deadline).await {
            Either::Left((Ok(envelope), _)) => match envelope.error {
                Some(error) => Err(DialogError::from_surface(&error.code, &error.message)),
                None => Ok(envelope),
            },
            Either::Left((Err(_), _)) => Err(DialogError::Cancelled),
            Either::Right(((), _)) => {
                log::warn!("{kind} request {correlation_id} timed out after {timeout_ms} ms");
                Err(DialogError::Timeout {
                    request_id: correlation_id,
                    timeout_ms,
                })
            }
        }
    }

    /// Routes one inbound message.
    pub fn deliver(&self, message: &InboundMessage) -> Delivery {
        let delivery = self.route(message);
        if let Delivery::Dropped(reason) = &delivery {
            log::debug!("dropped inbound message: {reason:?}");
        }
        delivery
    }

    fn route(&self, message: &InboundMessage) -> Delivery {
        if self.inner.state.borrow().destroyed {
            return Delivery::Dropped(DropReason::Destroyed);
        }
        if let Err(err) = self.inner.expected.verify(&message.origin) {
            return Delivery::Dropped(DropReason::Untrusted(err));
        }
        let envelope = match Envelope::from_value(&message.data) {
            Ok(envelope) => envelope,
            Err(err) => return Delivery::Dropped(DropReason::Malformed(err)),
        };
        if envelope.source == Source::Host {
            return Delivery::Dropped(DropReason::Echo);
        }

        let mut state = self.inner.state.borrow_mut();
        let Some(correlation_id) = envelope.request_id.clone() else {
            state
                .subscribers
                .retain(|subscriber| subscriber.send(envelope.clone()).is_ok());
            return Delivery::Broadcast;
        };

        let Some(pending) = state.pending.get(&correlation_id) else {
            return Delivery::Dropped(DropReason::Unmatched(correlation_id));
        };
        if let Err(reason) = pending.kind.admit(&envelope) {
            return Delivery::Dropped(reason);
        }
        let Some(pending) = state.pending.remove(&correlation_id) else {
            return Delivery::Dropped(DropReason::Unmatched(correlation_id));
        };
        drop(state);

        let now = self.inner.clock.now_ms();
        log::debug!(
            "{} resolved {} request {correlation_id} after {} ms ({} ms before expiry)",
            envelope.kind,
            pending.kind,
            now.saturating_sub(pending.created_at),
            pending.expires_at.saturating_sub(now),
        );
        match pending.responder.send(envelope) {
            Ok(()) => Delivery::Resolved,
            Err(_) => Delivery::Dropped(DropReason::Unmatched(correlation_id)),
        }
    }

    /// Receives every trusted broadcast (envelope without `requestId`) from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Envelope> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.inner.state.borrow_mut();
        if !state.destroyed {
            state.subscribers.retain(|subscriber| !subscriber.is_closed());
            state.subscribers.push(sender);
        }
        receiver
    }

    /// Answers a surface-initiated `request` with `response`.
    ///
    /// # Errors
    ///
    /// Returns an error if the post fails.
    pub fn reply(
        &self,
        target: &dyn MessageTarget,
        request: &Envelope,
        response: Envelope,
    ) -> Result<(), DialogError> {
        self.broadcast(target, &response.answering(request))
    }

    /// Posts an envelope that expects no answer.
    ///
    /// # Errors
    ///
    /// Returns an error if the post fails.
    pub fn broadcast(&self, target: &dyn MessageTarget, envelope: &Envelope) -> Result<(), DialogError> {
        target.post(&envelope.to_value()?)
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.inner.state.borrow().pending.len()
    }

    /// Whether [`MessageBus::destroy`] ran.
    pub fn is_destroyed(&self) -> bool {
        self.inner.state.borrow().destroyed
    }

    /// Releases the platform listener, fails every pending request with
    /// [`DialogError::Cancelled`] and ends every broadcast subscription.
    pub fn destroy(&self) {
        let (subscription, pending, subscribers) = {
            let mut state = self.inner.state.borrow_mut();
            state.destroyed = true;
            (
                state.subscription.take(),
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.subscribers),
            )
        };
        if let Some(mut subscription) = subscription {
            subscription.release();
        }
        log::debug!(
            "message bus destroyed with {} pending request(s), {} subscriber(s)",
            pending.len(),
            subscribers.len()
        );
    }
}
