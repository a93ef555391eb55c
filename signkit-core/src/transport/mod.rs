//! Presentation of the authority surface.
//!
//! A [`Transport`] owns one way of showing the surface (detached window or
//! embedded frame). The platform specific pieces (DOM calls, `window.open`) are
//! injected as small host traits so the lifecycle rules live here and can be
//! tested without a browser.

use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::future::LocalBoxFuture;
use serde_json::Value;
use url::Url;

use crate::error::DialogError;
use crate::mode::PresentationMode;

mod detached;
mod embedded;

pub use detached::{DetachedWindowTransport, ScreenRect, WindowGeometry, WindowHandle, WindowHost};
pub use embedded::{permission_policy, EmbeddedSurfaceTransport, FrameHost};

/// Something envelopes can be posted into.
///
/// Posting never restricts the target origin (the underlying channel may need a
/// wildcard); trust is decided on receipt by the message bus.
pub trait MessageTarget {
    /// Posts one JSON message.
    ///
    /// # Errors
    ///
    /// Returns [`DialogError::Channel`] if the platform refuses the post.
    fn post(&self, message: &Value) -> Result<(), DialogError>;
}

/// Status snapshot of an open presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSession {
    /// How the surface is presented.
    pub mode: PresentationMode,
    /// Whether the surface is still showing.
    pub is_open: bool,
    /// Whether user closure is still being watched for.
    pub close_watcher_active: bool,
}

/// Resolves when, and only when, the user closes the surface.
///
/// Programmatic closure never resolves it; the signal simply stays pending
/// until dropped.
pub struct ClosedSignal(LocalBoxFuture<'static, ()>);

impl ClosedSignal {
    /// Wraps a future that completes on user closure.
    pub fn new(future: impl Future<Output = ()> + 'static) -> Self {
        Self(Box::pin(future))
    }

    /// A signal that never fires.
    #[must_use]
    pub fn never() -> Self {
        Self::new(futures::future::pending())
    }
}

impl Future for ClosedSignal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.0.as_mut().poll(cx)
    }
}

impl std::fmt::Debug for ClosedSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ClosedSignal")
    }
}

/// What an opened transport hands back: where to post, and when the user gave up.
pub struct SurfaceLink {
    /// Channel into the surface.
    pub target: Rc<dyn MessageTarget>,
    /// Fires once if the user closes the surface.
    pub closed: ClosedSignal,
}

/// One presentation mode of the authority surface.
#[async_trait(?Send)]
pub trait Transport {
    /// The mode this transport presents.
    fn mode(&self) -> PresentationMode;

    /// Presents the surface at `url` and resolves once it is ready for messages.
    ///
    /// Opening while already open replaces the current presentation.
    ///
    /// # Errors
    ///
    /// Returns [`DialogError::PresentationBlocked`] if the platform refuses, or
    /// [`DialogError::UserCancelled`] if the user dismisses it while loading.
    async fn open(&self, url: &Url) -> Result<SurfaceLink, DialogError>;

    /// Tears the surface down. Idempotent.
    fn close(&self);

    /// Tears the surface down and releases everything the transport holds.
    fn destroy(&self);

    /// Current status, `None` when nothing is presented.
    fn session(&self) -> Option<TransportSession>;
}
