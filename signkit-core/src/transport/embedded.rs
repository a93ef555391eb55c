//! Embedded presentation: a frame inside a modal container on the host page.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use async_trait::async_trait;
use futures::future::{self, Either, LocalBoxFuture};
use futures::FutureExt;
use tokio::sync::oneshot;
use url::Url;

use super::{ClosedSignal, MessageTarget, SurfaceLink, Transport, TransportSession};
use crate::error::DialogError;
use crate::mode::PresentationMode;
use crate::origin::Origin;

/// The frame `allow` attribute granting the credential APIs to `origin` only.
#[must_use]
pub fn permission_policy(origin: &Origin) -> String {
    format!("publickey-credentials-get {origin}; publickey-credentials-create {origin}")
}

/// Platform primitives for the modal container and its frame.
///
/// Elements are created once and re-inserted on every open; only the frame's
/// navigation target changes between presentations.
pub trait FrameHost {
    /// Creates the modal container. `on_dismiss` must be invoked by the close
    /// button and the Escape key.
    ///
    /// # Errors
    ///
    /// Returns [`DialogError::PresentationBlocked`] if the elements cannot be created.
    fn create_container(&self, on_dismiss: Rc<dyn Fn()>) -> Result<(), DialogError>;

    /// Creates the frame with the given `allow` attribute and returns a target
    /// posting into its content window.
    ///
    /// # Errors
    ///
    /// Returns [`DialogError::PresentationBlocked`] if the frame cannot be created.
    fn create_frame(&self, allow: &str) -> Result<Rc<dyn MessageTarget>, DialogError>;

    /// Inserts the container into the page and the frame into the container.
    ///
    /// # Errors
    ///
    /// Returns [`DialogError::PresentationBlocked`] if the page refuses the insert.
    fn show(&self) -> Result<(), DialogError>;

    /// Points the frame at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`DialogError::PresentationBlocked`] if navigation is refused.
    fn navigate(&self, url: &str) -> Result<(), DialogError>;

    /// Completes at the frame's next load event. Must be requested before
    /// [`FrameHost::navigate`].
    fn loaded(&self) -> LocalBoxFuture<'static, ()>;

    /// Removes the frame from the page.
    fn remove_frame(&self);

    /// Removes the modal container from the page.
    fn remove_container(&self);

    /// Drops listeners and elements.
    fn dispose(&self);
}

#[derive(Default)]
struct FrameState {
    frame: Option<Rc<dyn MessageTarget>>,
    is_open: bool,
    user_closed: Option<oneshot::Sender<()>>,
}

struct Shared<H> {
    host: H,
    allow: String,
    state: RefCell<FrameState>,
}

impl<H: FrameHost> Shared<H> {
    /// Returns whether anything was torn down.
    fn teardown(&self) -> bool {
        {
            let mut state = self.state.borrow_mut();
            if !state.is_open {
                return false;
            }
            state.is_open = false;
            state.user_closed = None;
        }
        self.host.remove_frame();
        self.host.remove_container();
        true
    }

    fn dismiss(&self) {
        let notify = self.state.borrow_mut().user_closed.take();
        if self.teardown() {
            log::debug!("embedded surface dismissed by user");
        }
        if let Some(notify) = notify {
            let _ = notify.send(());
        }
    }
}

/// Presents the surface in a frame inside a modal overlay.
pub struct EmbeddedSurfaceTransport<H> {
    shared: Rc<Shared<H>>,
}

impl<H: FrameHost + 'static> EmbeddedSurfaceTransport<H> {
    /// Creates a transport whose frame may use passkeys for `authority` only.
    pub fn new(host: H, authority: &Origin) -> Self {
        Self {
            shared: Rc::new(Shared {
                host,
                allow: permission_policy(authority),
                state: RefCell::default(),
            }),
        }
    }

    /// The injected platform host.
    pub fn host(&self) -> &H {
        &self.shared.host
    }

    fn frame(&self) -> Result<Rc<dyn MessageTarget>, DialogError> {
        if let Some(frame) = &self.shared.state.borrow().frame {
            return Ok(Rc::clone(frame));
        }

        let weak: Weak<Shared<H>> = Rc::downgrade(&self.shared);
        let on_dismiss: Rc<dyn Fn()> = Rc::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.dismiss();
            }
        });
        self.shared.host.create_container(on_dismiss)?;
        let frame = self.shared.host.create_frame(&self.shared.allow)?;
        self.shared.state.borrow_mut().frame = Some(Rc::clone(&frame));
        Ok(frame)
    }
}

#[async_trait(?Send)]
impl<H: FrameHost + 'static> Transport for EmbeddedSurfaceTransport<H> {
    fn mode(&self) -> PresentationMode {
        PresentationMode::Embedded
    }

    async fn open(&self, url: &Url) -> Result<SurfaceLink, DialogError> {
        let frame = self.frame()?;
        let host = &self.shared.host;

        let was_open = self.shared.state.borrow().is_open;
        if was_open {
            log::debug!("embedded surface already open, renavigating");
        } else {
            host.show()?;
        }

        let (notify, user_closed) = oneshot::channel();
        {
            let mut state = self.shared.state.borrow_mut();
            state.is_open = true;
            state.user_closed = Some(notify);
        }

        let loaded = host.loaded();
        if let Err(err) = host.navigate(url.as_str()) {
            self.shared.teardown();
            return Err(err);
        }

        let user_closed = user_closed.shared();
        match future::select(loaded, user_closed.clone()).await {
            Either::Left(((), _)) => {}
            Either::Right((Ok(()), _)) => return Err(DialogError::UserCancelled),
            Either::Right((Err(_), _)) => return Err(DialogError::Cancelled),
        }
        log::debug!("embedded surface loaded {url}");

        Ok(SurfaceLink {
            target: frame,
            closed: ClosedSignal::new(async move {
                if user_closed.await.is_err() {
                    future::pending::<()>().await;
                }
            }),
        })
    }

    fn close(&self) {
        self.shared.teardown();
    }

    fn destroy(&self) {
        self.shared.teardown();
        let built = self.shared.state.borrow_mut().frame.take();
        if built.is_some() {
            self.shared.host.dispose();
        }
    }

    fn session(&self) -> Option<TransportSession> {
        let state = self.shared.state.borrow();
        state.is_open.then(|| TransportSession {
            mode: PresentationMode::Embedded,
            is_open: true,
            close_watcher_active: state.user_closed.is_some(),
        })
    }
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::memory::{FrameEvent, MemoryFrameHost};

    fn authority() -> Origin {
        Origin::parse("https://portal.example.com").unwrap()
    }

    fn url(action: &str) -> Url {
        Url::parse(&format!("https://portal.example.com/?action={action}")).unwrap()
    }

    #[test]
    fn test_permission_policy_is_scoped_to_the_authority() {
        let policy = permission_policy(&authority());
        assert_eq!(
            policy,
            "publickey-credentials-get https://portal.example.com; publickey-credentials-create https://portal.example.com"
        );
        assert!(!policy.contains('*'));
    }

    #[tokio::test]
    async fn test_elements_are_built_once_and_reused() {
        let transport = EmbeddedSurfaceTransport::new(MemoryFrameHost::new(), &authority());
        transport.open(&url("connect")).await.unwrap();
        transport.close();
        transport.open(&url("sign")).await.unwrap();

        let events = transport.host().events();
        let built = events
            .iter()
            .filter(|e| matches!(e, FrameEvent::CreateFrame(_)))
            .count();
        assert_eq!(built, 1);
        assert_eq!(
            transport.host().last_navigation().as_deref(),
            Some("https://portal.example.com/?action=sign")
        );
    }

    #[tokio::test]
    async fn test_close_removes_frame_before_container() {
        let transport = EmbeddedSurfaceTransport::new(MemoryFrameHost::new(), &authority());
        transport.open(&url("connect")).await.unwrap();
        transport.close();
        transport.close();

        let events = transport.host().events();
        let tail: Vec<_> = events.iter().rev().take(2).rev().cloned().collect();
        assert_eq!(tail, vec![FrameEvent::RemoveFrame, FrameEvent::RemoveContainer]);
        let removals = events
            .iter()
            .filter(|e| matches!(e, FrameEvent::RemoveContainer))
            .count();
        assert_eq!(removals, 1);
        assert!(transport.session().is_none());
    }

    #[tokio::test]
    async fn test_second_open_renavigates_instead_of_failing() {
        let transport = EmbeddedSurfaceTransport::new(MemoryFrameHost::new(), &authority());
        transport.open(&url("connect")).await.unwrap();
        transport.open(&url("sign")).await.unwrap();

        let shows = transport
            .host()
            .events()
            .iter()
            .filter(|e| matches!(e, FrameEvent::Show))
            .count();
        assert_eq!(shows, 1);
        assert!(transport.session().unwrap().is_open);
    }

    #[tokio::test]
    async fn test_user_dismiss_uses_the_close_path_and_fires_once() {
        let transport = EmbeddedSurfaceTransport::new(MemoryFrameHost::new(), &authority());
        let link = transport.open(&url("connect")).await.unwrap();

        transport.host().dismiss();
        transport.host().dismiss();
        link.closed.await;

        let events = transport.host().events();
        let tail: Vec<_> = events.iter().rev().take(2).rev().cloned().collect();
        assert_eq!(tail, vec![FrameEvent::RemoveFrame, FrameEvent::RemoveContainer]);
        assert!(transport.session().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_programmatic_close_does_not_fire_closed() {
        let transport = EmbeddedSurfaceTransport::new(MemoryFrameHost::new(), &authority());
        let link = transport.open(&url("connect")).await.unwrap();
        transport.close();
        let fired = tokio::time::timeout(Duration::from_secs(5), link.closed).await;
        assert!(fired.is_err());
    }

    #[tokio::test]
    async fn test_dismiss_while_loading_cancels_open() {
        let host = MemoryFrameHost::new();
        host.hold_loading();
        let transport = EmbeddedSurfaceTransport::new(host, &authority());

        let url = url("connect");
        let open = transport.open(&url);
        let dismiss = async {
            tokio::task::yield_now().await;
            transport.host().dismiss();
        };
        let (result, ()) = tokio::join!(open, dismiss);
        assert!(matches!(result, Err(DialogError::UserCancelled)));
        assert!(transport.session().is_none());
    }

    #[tokio::test]
    async fn test_destroy_disposes_built_elements() {
        let transport = EmbeddedSurfaceTransport::new(MemoryFrameHost::new(), &authority());
        transport.destroy();
        assert!(transport.host().events().is_empty());

        transport.open(&url("connect")).await.unwrap();
        transport.destroy();
        assert_eq!(transport.host().events().last(), Some(&FrameEvent::Dispose));
    }
}
