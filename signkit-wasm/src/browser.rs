//! Browser implementations of the platform traits of `signkit_core`.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::LocalBoxFuture;
use js_sys::Promise;
use serde::Serialize;
use serde_json::Value;
use signkit_core::transport::{FrameHost, MessageTarget, ScreenRect, WindowHandle, WindowHost};
use signkit_core::{
    Clock, DialogError, Environment, InboundMessage, KeyValueStorage, MessageSource, Subscription,
};
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::JsFuture;
use web_sys::{Document, HtmlElement, HtmlIFrameElement, KeyboardEvent, MessageEvent, Window};

const CONTAINER_ID: &str = "signkit-dialog";
const CONTAINER_STYLE: &str = "position:fixed;inset:0;z-index:2147483647;display:flex;\
align-items:center;justify-content:center;background:rgba(0,0,0,0.4);";
const FRAME_STYLE: &str = "width:420px;height:640px;max-width:100vw;max-height:100vh;\
border:0;border-radius:12px;background:#fff;";
const CLOSE_BUTTON_STYLE: &str = "position:absolute;top:12px;right:12px;font-size:24px;\
background:none;border:0;color:#fff;cursor:pointer;";

fn describe(value: &JsValue) -> String {
    value
        .as_string()
        .unwrap_or_else(|| format!("{value:?}"))
}

fn blocked(value: &JsValue) -> DialogError {
    DialogError::PresentationBlocked {
        reason: describe(value),
    }
}

fn channel_error(value: &JsValue) -> DialogError {
    DialogError::Channel(describe(value))
}

/// Converts an outbound message into a plain JS object (not a `Map`).
fn to_js(message: &Value) -> Result<JsValue, DialogError> {
    message
        .serialize(&serde_wasm_bindgen::Serializer::json_compatible())
        .map_err(|err| DialogError::Serialization(err.to_string()))
}

/// Classifies the page the bindings run in.
#[must_use]
pub fn detect_environment(window: &Window) -> Environment {
    let user_agent = window.navigator().user_agent().unwrap_or_default();
    Environment::from_user_agent(&user_agent, window.is_secure_context())
}

/// `Date.now()` and `setTimeout`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BrowserClock;

impl Clock for BrowserClock {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn now_ms(&self) -> u64 {
        js_sys::Date::now() as u64
    }

    fn sleep(&self, duration: Duration) -> LocalBoxFuture<'static, ()> {
        let millis = i32::try_from(duration.as_millis()).unwrap_or(i32::MAX);
        let promise = Promise::new(&mut |resolve, _reject| {
            if let Some(window) = web_sys::window() {
                if let Err(err) =
                    window.set_timeout_with_callback_and_timeout_and_arguments_0(&resolve, millis)
                {
                    log::warn!("setTimeout refused: {}", describe(&err));
                }
            }
        });
        Box::pin(async move {
            let _ = JsFuture::from(promise).await;
        })
    }
}

/// `window.localStorage`.
pub struct LocalStorage(web_sys::Storage);

impl LocalStorage {
    /// The page's local storage.
    ///
    /// # Errors
    ///
    /// Returns [`DialogError::Storage`] if storage is disabled.
    pub fn open(window: &Window) -> Result<Self, DialogError> {
        window
            .local_storage()
            .map_err(|err| DialogError::Storage(describe(&err)))?
            .map(Self)
            .ok_or_else(|| DialogError::Storage("localStorage is unavailable".to_string()))
    }
}

impl KeyValueStorage for LocalStorage {
    fn get(&self, key: &str) -> Result<Option<String>, DialogError> {
        self.0
            .get_item(key)
            .map_err(|err| DialogError::Storage(describe(&err)))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), DialogError> {
        self.0
            .set_item(key, value)
            .map_err(|err| DialogError::Storage(describe(&err)))
    }

    fn remove(&self, key: &str) -> Result<(), DialogError> {
        self.0
            .remove_item(key)
            .map_err(|err| DialogError::Storage(describe(&err)))
    }
}

/// The `message` event of the host window.
pub struct WindowMessages {
    window: Window,
}

impl WindowMessages {
    /// Listens on `window`.
    #[must_use]
    pub const fn new(window: Window) -> Self {
        Self { window }
    }
}

impl MessageSource for WindowMessages {
    fn listen(
        &self,
        handler: Rc<dyn Fn(InboundMessage)>,
    ) -> Result<Box<dyn Subscription>, DialogError> {
        let closure = Closure::<dyn FnMut(MessageEvent)>::new(move |event: MessageEvent| {
            // Non-JSON payloads from other scripts on the page are not ours.
            let Ok(data) = serde_wasm_bindgen::from_value::<Value>(event.data()) else {
                return;
            };
            handler(InboundMessage {
                origin: event.origin(),
                data,
            });
        });
        self.window
            .add_event_listener_with_callback("message", closure.as_ref().unchecked_ref())
            .map_err(|err| channel_error(&err))?;
        Ok(Box::new(WindowListener {
            window: self.window.clone(),
            closure: Some(closure),
        }))
    }
}

struct WindowListener {
    window: Window,
    closure: Option<Closure<dyn FnMut(MessageEvent)>>,
}

impl Subscription for WindowListener {
    fn release(&mut self) {
        if let Some(closure) = self.closure.take() {
            if let Err(err) = self
                .window
                .remove_event_listener_with_callback("message", closure.as_ref().unchecked_ref())
            {
                log::debug!("could not remove message listener: {}", describe(&err));
            }
        }
    }
}

impl Drop for WindowListener {
    fn drop(&mut self) {
        self.release();
    }
}

/// Opens popups with `window.open`.
pub struct PopupHost {
    window: Window,
}

impl PopupHost {
    /// Opens popups from `window`.
    #[must_use]
    pub const fn new(window: Window) -> Self {
        Self { window }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn dimension(value: Result<JsValue, JsValue>) -> u32 {
    value
        .ok()
        .and_then(|value| value.as_f64())
        .map_or(0, |value| value.max(0.0) as u32)
}

#[allow(clippy::cast_possible_truncation)]
fn coordinate(value: Result<JsValue, JsValue>) -> i32 {
    value
        .ok()
        .and_then(|value| value.as_f64())
        .map_or(0, |value| value as i32)
}

impl WindowHost for PopupHost {
    fn host_screen(&self) -> ScreenRect {
        ScreenRect {
            left: coordinate(self.window.screen_x()),
            top: coordinate(self.window.screen_y()),
            width: dimension(self.window.outer_width()),
            height: dimension(self.window.outer_height()),
        }
    }

    fn open(&self, url: &str, features: &str) -> Option<Rc<dyn WindowHandle>> {
        match self
            .window
            .open_with_url_and_target_and_features(url, "_blank", features)
        {
            Ok(Some(popup)) => Some(Rc::new(Popup(popup))),
            Ok(None) => None,
            Err(err) => {
                log::warn!("window.open failed: {}", describe(&err));
                None
            }
        }
    }
}

struct Popup(Window);

impl MessageTarget for Popup {
    fn post(&self, message: &Value) -> Result<(), DialogError> {
        self.0
            .post_message(&to_js(message)?, "*")
            .map_err(|err| channel_error(&err))
    }
}

impl WindowHandle for Popup {
    fn is_closed(&self) -> bool {
        self.0.closed().unwrap_or(true)
    }

    fn close(&self) {
        if let Err(err) = self.0.close() {
            log::debug!("window.close failed: {}", describe(&err));
        }
    }
}

struct FrameTarget(HtmlIFrameElement);

impl MessageTarget for FrameTarget {
    fn post(&self, message: &Value) -> Result<(), DialogError> {
        let Some(window) = self.0.content_window() else {
            return Err(DialogError::Channel("frame has no content window".to_string()));
        };
        window
            .post_message(&to_js(message)?, "*")
            .map_err(|err| channel_error(&err))
    }
}

#[derive(Default)]
struct ModalParts {
    container: Option<HtmlElement>,
    close_button: Option<HtmlElement>,
    frame: Option<HtmlIFrameElement>,
    on_close: Option<Closure<dyn FnMut()>>,
    on_key: Option<Closure<dyn FnMut(KeyboardEvent)>>,
    on_load: Option<Closure<dyn FnMut()>>,
}

/// Builds the modal overlay and its frame in the host document.
pub struct ModalFrameHost {
    document: Document,
    parts: RefCell<ModalParts>,
    load_waiters: Rc<RefCell<Vec<oneshot::Sender<()>>>>,
}

impl ModalFrameHost {
    /// Builds into `document`.
    #[must_use]
    pub fn new(document: Document) -> Self {
        Self {
            document,
            parts: RefCell::default(),
            load_waiters: Rc::default(),
        }
    }

    fn html_element(&self, tag: &str) -> Result<HtmlElement, DialogError> {
        self.document
            .create_element(tag)
            .map_err(|err| blocked(&err))?
            .dyn_into::<HtmlElement>()
            .map_err(|_| DialogError::PresentationBlocked {
                reason: format!("<{tag}> is not an HTML element"),
            })
    }
}

impl FrameHost for ModalFrameHost {
    fn create_container(&self, on_dismiss: Rc<dyn Fn()>) -> Result<(), DialogError> {
        let container = self.html_element("div")?;
        container.set_id(CONTAINER_ID);
        container.style().set_css_text(CONTAINER_STYLE);

        let close_button = self.html_element("button")?;
        close_button.set_text_content(Some("\u{d7}"));
        close_button
            .set_attribute("aria-label", "Close")
            .map_err(|err| blocked(&err))?;
        close_button.style().set_css_text(CLOSE_BUTTON_STYLE);

        let dismiss = Rc::clone(&on_dismiss);
        let on_close = Closure::<dyn FnMut()>::new(move || dismiss());
        close_button
            .add_event_listener_with_callback("click", on_close.as_ref().unchecked_ref())
            .map_err(|err| blocked(&err))?;
        container
            .append_child(&close_button)
            .map_err(|err| blocked(&err))?;

        let on_key = Closure::<dyn FnMut(KeyboardEvent)>::new(move |event: KeyboardEvent| {
            if event.key() == "Escape" {
                on_dismiss();
            }
        });
        self.document
            .add_event_listener_with_callback("keydown", on_key.as_ref().unchecked_ref())
            .map_err(|err| blocked(&err))?;

        let mut parts = self.parts.borrow_mut();
        parts.container = Some(container);
        parts.close_button = Some(close_button);
        parts.on_close = Some(on_close);
        parts.on_key = Some(on_key);
        Ok(())
    }

    fn create_frame(&self, allow: &str) -> Result<Rc<dyn MessageTarget>, DialogError> {
        let frame = self
            .html_element("iframe")?
            .dyn_into::<HtmlIFrameElement>()
            .map_err(|_| DialogError::PresentationBlocked {
                reason: "<iframe> is not a frame element".to_string(),
            })?;
        frame
            .set_attribute("allow", allow)
            .map_err(|err| blocked(&err))?;
        frame.style().set_css_text(FRAME_STYLE);

        let waiters = Rc::clone(&self.load_waiters);
        let on_load = Closure::<dyn FnMut()>::new(move || {
            for waiter in waiters.borrow_mut().drain(..) {
                let _ = waiter.send(());
            }
        });
        frame
            .add_event_listener_with_callback("load", on_load.as_ref().unchecked_ref())
            .map_err(|err| blocked(&err))?;

        let mut parts = self.parts.borrow_mut();
        parts.frame = Some(frame.clone());
        parts.on_load = Some(on_load);
        Ok(Rc::new(FrameTarget(frame)))
    }

    fn show(&self) -> Result<(), DialogError> {
        let parts = self.parts.borrow();
        let (Some(container), Some(frame)) = (&parts.container, &parts.frame) else {
            return Err(DialogError::PresentationBlocked {
                reason: "modal was not built".to_string(),
            });
        };
        let body = self
            .document
            .body()
            .ok_or_else(|| DialogError::PresentationBlocked {
                reason: "document has no body".to_string(),
            })?;
        container.append_child(frame).map_err(|err| blocked(&err))?;
        body.append_child(container).map_err(|err| blocked(&err))?;
        Ok(())
    }

    fn navigate(&self, url: &str) -> Result<(), DialogError> {
        let parts = self.parts.borrow();
        let frame = parts
            .frame
            .as_ref()
            .ok_or_else(|| DialogError::PresentationBlocked {
                reason: "frame was not built".to_string(),
            })?;
        frame.set_src(url);
        Ok(())
    }

    fn loaded(&self) -> LocalBoxFuture<'static, ()> {
        let (sender, receiver) = oneshot::channel();
        self.load_waiters.borrow_mut().push(sender);
        Box::pin(async move {
            if receiver.await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
    }

    fn remove_frame(&self) {
        if let Some(frame) = &self.parts.borrow().frame {
            frame.remove();
        }
    }

    fn remove_container(&self) {
        if let Some(container) = &self.parts.borrow().container {
            container.remove();
        }
    }

    fn dispose(&self) {
        let parts = self.parts.take();
        if let (Some(button), Some(on_close)) = (&parts.close_button, &parts.on_close) {
            let _ = button.remove_event_listener_with_callback("click", on_close.as_ref().unchecked_ref());
        }
        if let Some(on_key) = &parts.on_key {
            let _ = self
                .document
                .remove_event_listener_with_callback("keydown", on_key.as_ref().unchecked_ref());
        }
        if let (Some(frame), Some(on_load)) = (&parts.frame, &parts.on_load) {
            let _ = frame.remove_event_listener_with_callback("load", on_load.as_ref().unchecked_ref());
            frame.remove();
        }
        if let Some(container) = &parts.container {
            container.remove();
        }
        self.load_waiters.borrow_mut().clear();
    }
}
