//! Detached-window presentation: a separate top-level browsing context.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use super::{ClosedSignal, MessageTarget, SurfaceLink, Transport, TransportSession};
use crate::clock::Clock;
use crate::error::DialogError;
use crate::mode::PresentationMode;

/// Screen rectangle occupied by the host window, in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScreenRect {
    /// Left edge.
    pub left: i32,
    /// Top edge.
    pub top: i32,
    /// Width.
    pub width: u32,
    /// Height.
    pub height: u32,
}

/// Placement of the detached window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowGeometry {
    /// Left edge.
    pub left: i32,
    /// Top edge.
    pub top: i32,
    /// Width.
    pub width: u32,
    /// Height.
    pub height: u32,
}

impl WindowGeometry {
    /// Centers a `width` x `height` window on `screen`, never placing it above or
    /// left of the screen origin.
    #[must_use]
    pub fn centered(screen: ScreenRect, width: u32, height: u32) -> Self {
        let offset = |outer: u32, inner: u32| {
            i32::try_from(outer.saturating_sub(inner) / 2).unwrap_or(i32::MAX)
        };
        Self {
            left: screen.left.saturating_add(offset(screen.width, width)).max(0),
            top: screen.top.saturating_add(offset(screen.height, height)).max(0),
            width,
            height,
        }
    }

    /// The `features` argument for `window.open`.
    #[must_use]
    pub fn features(&self) -> String {
        format!(
            "popup=yes,width={},height={},left={},top={}",
            self.width, self.height, self.left, self.top
        )
    }
}

/// A top-level browsing context opened by a [`WindowHost`].
pub trait WindowHandle: MessageTarget {
    /// Whether the window is gone (closed by anyone).
    fn is_closed(&self) -> bool;

    /// Closes the window.
    fn close(&self);
}

/// Platform primitives for opening top-level windows.
pub trait WindowHost {
    /// Where the host window sits on screen.
    fn host_screen(&self) -> ScreenRect;

    /// Opens `url` with `features`; `None` when the platform refuses (popup blocked).
    fn open(&self, url: &str, features: &str) -> Option<Rc<dyn WindowHandle>>;
}

struct OpenWindow {
    handle: Rc<dyn WindowHandle>,
    watching: Rc<Cell<bool>>,
}

/// Presents the surface in a centered popup window and watches for the user
/// closing it.
pub struct DetachedWindowTransport<H> {
    host: H,
    clock: Rc<dyn Clock>,
    width: u32,
    height: u32,
    poll_interval: Duration,
    current: RefCell<Option<OpenWindow>>,
}

impl<H: WindowHost> DetachedWindowTransport<H> {
    /// Creates a transport opening `width` x `height` windows, polling for user
    /// closure every `poll_interval`.
    pub fn new(
        host: H,
        clock: Rc<dyn Clock>,
        width: u32,
        height: u32,
        poll_interval: Duration,
    ) -> Self {
        Self {
            host,
            clock,
            width,
            height,
            poll_interval,
            current: RefCell::new(None),
        }
    }

    /// The injected platform host.
    pub const fn host(&self) -> &H {
        &self.host
    }

    fn watch(&self, handle: Rc<dyn WindowHandle>, watching: Rc<Cell<bool>>) -> ClosedSignal {
        let clock = Rc::clone(&self.clock);
        let interval = self.poll_interval;
        ClosedSignal::new(async move {
            loop {
                clock.sleep(interval).await;
                if !watching.get() {
                    // closed or destroyed by us: never report it as the user's doing
                    futures::future::pending::<()>().await;
                }
                if handle.is_closed() {
                    watching.set(false);
                    log::debug!("detached window closed by user");
                    return;
                }
            }
        })
    }
}

#[async_trait(?Send)]
impl<H: WindowHost> Transport for DetachedWindowTransport<H> {
    fn mode(&self) -> PresentationMode {
        PresentationMode::Detached
    }

    async fn open(&self, url: &Url) -> Result<SurfaceLink, DialogError> {
        self.close();

        let geometry = WindowGeometry::centered(self.host.host_screen(), self.width, self.height);
        let handle = self
            .host
            .open(url.as_str(), &geometry.features())
            .ok_or_else(|| DialogError::PresentationBlocked {
                reason: "the platform refused to open a window".to_string(),
            })?;

        let watching = Rc::new(Cell::new(true));
        let closed = self.watch(Rc::clone(&handle), Rc::clone(&watching));
        *self.current.borrow_mut() = Some(OpenWindow {
            handle: Rc::clone(&handle),
            watching,
        });
        log::debug!("opened detached window at {geometry:?}");

        Ok(SurfaceLink {
            target: handle,
            closed,
        })
    }

    fn close(&self) {
        let current = self.current.borrow_mut().take();
        if let Some(window) = current {
            window.watching.set(false);
            if !window.handle.is_closed() {
                window.handle.close();
            }
        }
    }

    fn destroy(&self) {
        self.close();
    }

    fn session(&self) -> Option<TransportSession> {
        self.current.borrow().as_ref().map(|window| TransportSession {
            mode: PresentationMode::Detached,
            is_open: !window.handle.is_closed(),
            close_watcher_active: window.watching.get(),
        })
    }
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::TokioClock;
    use crate::memory::MemoryWindowHost;

    fn transport(host: MemoryWindowHost) -> DetachedWindowTransport<MemoryWindowHost> {
        DetachedWindowTransport::new(
            host,
            Rc::new(TokioClock::new()),
            420,
            640,
            Duration::from_millis(500),
        )
    }

    fn url() -> Url {
        Url::parse("https://portal.example.com/?action=connect").unwrap()
    }

    #[test]
    fn test_geometry_is_centered_on_host_screen() {
        let screen = ScreenRect {
            left: 1920,
            top: 0,
            width: 1440,
            height: 900,
        };
        let geometry = WindowGeometry::centered(screen, 420, 640);
        assert_eq!((geometry.left, geometry.top), (1920 + 510, 130));
        assert_eq!(
            geometry.features(),
            "popup=yes,width=420,height=640,left=2430,top=130"
        );

        let tiny = ScreenRect {
            left: 0,
            top: 0,
            width: 300,
            height: 300,
        };
        let geometry = WindowGeometry::centered(tiny, 420, 640);
        assert_eq!((geometry.left, geometry.top), (0, 0));
    }

    #[tokio::test]
    async fn test_blocked_popup_fails_with_presentation_blocked() {
        let transport = transport(MemoryWindowHost::blocking());
        let result = transport.open(&url()).await;
        assert!(matches!(result, Err(DialogError::PresentationBlocked { .. })));
        assert!(transport.session().is_none());
    }

    #[tokio::test]
    async fn test_reopen_closes_previous_window() {
        let transport = transport(MemoryWindowHost::new());
        transport.open(&url()).await.unwrap();
        transport.open(&url()).await.unwrap();

        let windows = transport.host().windows();
        assert_eq!(windows.len(), 2);
        assert!(windows[0].is_closed());
        assert!(!windows[1].is_closed());
        assert_eq!(windows[1].features(), "popup=yes,width=420,height=640,left=510,top=130");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let transport = transport(MemoryWindowHost::new());
        transport.open(&url()).await.unwrap();
        transport.close();
        transport.close();
        transport.destroy();
        let windows = transport.host().windows();
        assert_eq!(windows[0].close_calls(), 1);
        assert!(transport.session().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_closure_is_reported_once() {
        let transport = transport(MemoryWindowHost::new());
        let link = transport.open(&url()).await.unwrap();
        let window = transport.host().windows().remove(0);

        let started = tokio::time::Instant::now();
        window.close_by_user_after(Duration::from_millis(1_200));
        link.closed.await;
        // detected on the first poll after the closure
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1_500));
        assert!(elapsed < Duration::from_millis(2_000));

        let session = transport.session().unwrap();
        assert!(!session.is_open);
        assert!(!session.close_watcher_active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_programmatic_close_is_not_user_closure() {
        let transport = transport(MemoryWindowHost::new());
        let link = transport.open(&url()).await.unwrap();
        transport.close();

        let fired = tokio::time::timeout(Duration::from_secs(10), link.closed).await;
        assert!(fired.is_err());
    }
}
