//! Client half of a server-driven widget mirror.
//!
//! A [`SyncSession`] batches local changes into requests, applies the server's
//! operation messages to an [`ObjectRegistry`] of mirrored objects and turns
//! pointer and keyboard input into notifications. [`run`] drives a session
//! over stdio inside a Slint event loop; hosts supply the window through
//! [`HostBindings`], usually via [`app_main!`].

pub mod buffer;
pub mod config;
pub mod connection;
pub mod display;
pub mod error;
pub mod input;
pub mod keys;
pub mod mirror;
pub mod processor;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod stdio;
pub mod timers;

use crate::input::{LocalEvent, PointerEvent, PointerPhase, WidgetTree};
use crate::keys::{KeyEvent, KeyPhase};
use crate::mirror::{MirrorRow, MirrorTree, MirrorWidget};
use crate::protocol::Properties;
use serde_json::json;
use slint::ComponentHandle;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub use crate::config::{Platform, SessionConfig};
pub use crate::connection::{
    FailureKind, OutboundRequest, Reply, SendMode, TransportAdapter, TransportFailure,
};
pub use crate::error::{HandlerError, ProcessError, ProtocolError, SessionError};
pub use crate::input::Modifiers;
pub use crate::registry::{HandlerBuilder, HandlerDescriptor, ObjectRegistry, OpContext};
pub use crate::session::{SessionEvent, SyncSession};
pub use crate::stdio::StdioTransport;
pub use serde_json;

const PUMP_INTERVAL: Duration = Duration::from_millis(10);

/// A pointer press or release on a rendered row.
#[derive(Debug, Clone, PartialEq)]
pub struct PointerInput {
    pub target: String,
    pub button: u16,
    pub x: f32,
    pub y: f32,
    pub down: bool,
    pub modifiers: Modifiers,
}

/// A key press or release while `target` had focus. `text` is the key text
/// as the windowing layer reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyInput {
    pub target: String,
    pub text: String,
    pub down: bool,
    pub modifiers: Modifiers,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorNotice {
    pub title: String,
    pub message: String,
    pub retryable: bool,
}

impl ErrorNotice {
    /// The notice to show for `event`, if it is an error.
    pub fn for_event(event: &SessionEvent) -> Option<Self> {
        let (title, message, retryable) = match event {
            SessionEvent::ConnectionError => (
                "Connection lost",
                "The server could not be reached.".to_string(),
                true,
            ),
            SessionEvent::ApplicationError { message } => ("Server error", message.clone(), false),
            SessionEvent::OperationFault { message } => ("Update failed", message.clone(), false),
            SessionEvent::Redirect { url } => ("Session moved", format!("Continue at {url}"), false),
            _ => return None,
        };
        Some(Self {
            title: title.to_string(),
            message,
            retryable,
        })
    }
}

pub trait HostBindings {
    type Ui: ComponentHandle + 'static;

    fn new_ui() -> Result<Self::Ui, slint::PlatformError>;

    fn bind_pointer<F>(ui: &Self::Ui, handler: F)
    where
        F: Fn(PointerInput) + 'static;

    /// `handler` returns whether the key was consumed.
    fn bind_key<F>(ui: &Self::Ui, handler: F)
    where
        F: Fn(KeyInput) -> bool + 'static;

    /// `handler` receives the previously and newly focused row ids.
    fn bind_focus<F>(ui: &Self::Ui, handler: F)
    where
        F: Fn(String, String) + 'static;

    fn bind_select<F>(ui: &Self::Ui, handler: F)
    where
        F: Fn(String, bool) + 'static;

    fn bind_edit<F>(ui: &Self::Ui, handler: F)
    where
        F: Fn(String, String) + 'static;

    fn bind_retry<F>(ui: &Self::Ui, handler: F)
    where
        F: Fn() + 'static;

    fn set_rows(ui: &Self::Ui, rows: &[MirrorRow]);
    fn set_wait_hint(ui: &Self::Ui, visible: bool);
    fn show_error(ui: &Self::Ui, notice: &ErrorNotice);
    fn clear_error(ui: &Self::Ui);
}

type SharedSession = Rc<RefCell<SyncSession<StdioTransport>>>;

pub fn run<B: HostBindings>() -> Result<(), Box<dyn std::error::Error>> {
    let config = SessionConfig::from_env();
    info!(url = %config.url, display = %config.display_id, "starting mirror host");

    let ui = B::new_ui()?;
    let transport = StdioTransport::spawn(&config);
    let mut session = SyncSession::new(transport, config);
    mirror::register(session.registry_mut());
    let session: SharedSession = Rc::new(RefCell::new(session));

    install_callbacks::<B>(&ui, &session);

    session.borrow_mut().send_now(Instant::now(), false)?;

    let pump_session = session.clone();
    let pump_ui = ui.as_weak();
    let pump = slint::Timer::default();
    pump.start(slint::TimerMode::Repeated, PUMP_INTERVAL, move || {
        if let Some(ui) = pump_ui.upgrade() {
            pump_once::<B>(&pump_session, &ui);
        }
    });

    ui.run()?;

    pump.stop();
    // Drop UI first so callback closures release their session handles.
    drop(ui);

    let mut session = session.borrow_mut();
    if !session.is_terminated() {
        if let Err(err) = session.send_on_unload() {
            warn!(error = %err, "failed to send shutdown request");
        }
    }
    session.transport_mut().shutdown();

    Ok(())
}

fn pump_once<B: HostBindings>(session: &SharedSession, ui: &B::Ui) {
    // A callback is running; its changes get picked up on the next tick.
    let Ok(mut session) = session.try_borrow_mut() else {
        return;
    };
    let now = Instant::now();

    while let Some(reply) = session.transport().poll() {
        if let Err(err) = session.handle_response(now, reply) {
            warn!(error = %err, "failed to apply server message");
        }
    }

    if session.next_deadline().is_some_and(|deadline| deadline <= now) {
        if let Err(err) = session.fire_timers(now) {
            warn!(error = %err, "scheduled send failed");
        }
    }

    for event in session.drain_events() {
        present::<B>(ui, &mut session, now, &event);
    }
}

fn present<B: HostBindings>(
    ui: &B::Ui,
    session: &mut SyncSession<StdioTransport>,
    now: Instant,
    event: &SessionEvent,
) {
    if let Some(notice) = ErrorNotice::for_event(event) {
        B::show_error(ui, &notice);
        return;
    }

    match event {
        SessionEvent::WaitHintShown => B::set_wait_hint(ui, true),
        SessionEvent::WaitHintHidden => B::set_wait_hint(ui, false),
        SessionEvent::Render => B::set_rows(ui, &mirror::rows(session.registry())),
        SessionEvent::ReplayKey(event) => {
            let tree = MirrorTree::snapshot(session.registry());
            let Some(selection) = replayed_selection(&tree, event) else {
                debug!(key = %event.key, target = %event.target, "replayed key has no row action");
                return;
            };
            if let Err(err) = session.local_event(now, selection) {
                warn!(error = %err, key = %event.key, "failed to replay key");
            }
        }
        _ => {}
    }
}

fn install_callbacks<B: HostBindings>(ui: &B::Ui, session: &SharedSession) {
    let pointer_session = session.clone();
    B::bind_pointer(ui, move |input| {
        let Ok(mut session) = pointer_session.try_borrow_mut() else {
            return;
        };
        let now = Instant::now();
        let tree = MirrorTree::snapshot(session.registry());
        let event = PointerEvent {
            phase: if input.down {
                PointerPhase::Down
            } else {
                PointerPhase::Up
            },
            hit_target: input.target.clone(),
            raw_button: input.button,
            x: input.x as i32,
            y: input.y as i32,
            modifiers: input.modifiers,
            time: now,
        };

        // Bubble from the hit row up to the root.
        for widget in tree.ancestry(&input.target) {
            if let Err(err) = session.pointer_event(now, &tree, &widget, &event) {
                warn!(error = %err, %widget, "failed to report pointer event");
                break;
            }
        }
    });

    let key_session = session.clone();
    B::bind_key(ui, move |input| {
        let Ok(mut session) = key_session.try_borrow_mut() else {
            return false;
        };
        let Some(described) = describe_key(&input.text) else {
            return false;
        };
        let now = Instant::now();
        let tree = MirrorTree::snapshot(session.registry());
        let target = if input.target.is_empty() {
            session.config().display_id.clone()
        } else {
            input.target
        };

        // The windowing layer has no separate keypress, so a character key
        // is replayed as one after its keydown.
        let phases: &[KeyPhase] = match (input.down, described.char_code) {
            (false, _) => &[KeyPhase::Up],
            (true, 0) => &[KeyPhase::Down],
            (true, _) => &[KeyPhase::Down, KeyPhase::Press],
        };

        let mut consumed = false;
        for phase in phases {
            let event = KeyEvent {
                phase: *phase,
                target: target.clone(),
                key: described.key.clone(),
                key_code: described.key_code,
                char_code: described.char_code,
                modifiers: input.modifiers,
                repeat: false,
            };
            match session.key_event(now, &tree, event) {
                Ok(outcome) => consumed |= outcome.prevent_default,
                Err(err) => {
                    warn!(error = %err, key = %described.key, "failed to report key event");
                    break;
                }
            }
        }
        consumed
    });

    let focus_session = session.clone();
    B::bind_focus(ui, move |previous, next| {
        let Ok(mut session) = focus_session.try_borrow_mut() else {
            return;
        };
        let now = Instant::now();
        for (target, gained) in [(previous, false), (next, true)] {
            if target.is_empty() {
                continue;
            }
            if let Err(err) = session.local_event(now, LocalEvent::Focus { target, gained }) {
                warn!(error = %err, "failed to report focus change");
            }
        }
    });

    let select_session = session.clone();
    B::bind_select(ui, move |row, default| {
        let Ok(mut session) = select_session.try_borrow_mut() else {
            return;
        };
        let tree = MirrorTree::snapshot(session.registry());
        let event = selection_event(&tree, &row, default);
        if let Err(err) = session.local_event(Instant::now(), event) {
            warn!(error = %err, %row, "failed to report selection");
        }
    });

    let edit_session = session.clone();
    B::bind_edit(ui, move |target, text| {
        let Ok(mut session) = edit_session.try_borrow_mut() else {
            return;
        };
        if let Some(widget) = session.registry_mut().object_mut::<MirrorWidget>(&target) {
            widget.properties.insert("text".to_string(), json!(text));
        }
        let event = LocalEvent::PropertyChanged {
            target,
            name: "text".to_string(),
            value: json!(text),
        };
        if let Err(err) = session.local_event(Instant::now(), event) {
            warn!(error = %err, "failed to record text change");
        }
    });

    let retry_session = session.clone();
    let retry_ui = ui.as_weak();
    B::bind_retry(ui, move || {
        let Ok(mut session) = retry_session.try_borrow_mut() else {
            return;
        };
        if let Some(ui) = retry_ui.upgrade() {
            B::clear_error(&ui);
        }
        if let Err(err) = session.retry(Instant::now()) {
            warn!(error = %err, "retry failed");
        }
    });
}

/// Selecting an item selects it within its owning control.
fn selection_event(tree: &dyn WidgetTree, row: &str, default: bool) -> LocalEvent {
    let mut detail = Properties::new();
    let mut target = row.to_string();
    if !tree.is_control(row) {
        if let Some(control) = input::nearest_enabled_control(tree, row) {
            detail.insert("item".to_string(), json!(row));
            target = control.to_string();
        }
    }
    LocalEvent::Selection {
        target,
        default,
        detail,
    }
}

/// The row action a key would have triggered had the platform handled it.
/// Enter activates the focused row and Space selects it. Text fields take
/// their keys straight from the windowing layer.
fn replayed_selection(tree: &dyn WidgetTree, event: &KeyEvent) -> Option<LocalEvent> {
    if event.phase != KeyPhase::Down || !tree.is_enabled(&event.target) {
        return None;
    }
    let default = match event.key_code {
        13 => true,
        32 => false,
        _ => return None,
    };
    Some(selection_event(tree, &event.target, default))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DescribedKey {
    key: String,
    key_code: u32,
    char_code: u32,
}

/// Maps windowing-layer key text to a key identifier and DOM-style codes.
fn describe_key(text: &str) -> Option<DescribedKey> {
    use slint::platform::Key;

    const NAMED: [(Key, &str, u32); 20] = [
        (Key::Backspace, "Backspace", 8),
        (Key::Tab, "Tab", 9),
        (Key::Return, "Enter", 13),
        (Key::Shift, "Shift", 16),
        (Key::Control, "Control", 17),
        (Key::Alt, "Alt", 18),
        (Key::Escape, "Escape", 27),
        (Key::PageUp, "PageUp", 33),
        (Key::PageDown, "PageDown", 34),
        (Key::End, "End", 35),
        (Key::Home, "Home", 36),
        (Key::LeftArrow, "ArrowLeft", 37),
        (Key::UpArrow, "ArrowUp", 38),
        (Key::RightArrow, "ArrowRight", 39),
        (Key::DownArrow, "ArrowDown", 40),
        (Key::Insert, "Insert", 45),
        (Key::Delete, "Delete", 46),
        (Key::Meta, "Meta", 91),
        (Key::Menu, "ContextMenu", 93),
        (Key::F1, "F1", 112),
    ];

    let mut chars = text.chars();
    let ch = chars.next()?;
    if chars.next().is_some() {
        return None;
    }

    for (key, name, code) in NAMED {
        if char::from(key) == ch {
            let char_code = if code == 13 { code } else { 0 };
            return Some(DescribedKey {
                key: name.to_string(),
                key_code: code,
                char_code,
            });
        }
    }

    if ch.is_control() {
        return None;
    }
    let key_code = if ch.is_ascii_alphanumeric() {
        ch.to_ascii_uppercase() as u32
    } else if ch == ' ' {
        32
    } else {
        0
    };
    Some(DescribedKey {
        key: ch.to_string(),
        key_code,
        char_code: ch as u32,
    })
}

#[macro_export]
macro_rules! app_main {
    ($window:ty, $row:ident, $init:path) => {
        struct MirrorHostBindings;

        impl $crate::HostBindings for MirrorHostBindings {
            type Ui = $window;

            fn new_ui() -> Result<Self::Ui, slint::PlatformError> {
                <Self::Ui>::new()
            }

            fn bind_pointer<F>(ui: &Self::Ui, handler: F)
            where
                F: Fn($crate::PointerInput) + 'static,
            {
                ui.on_pointer(move |target, button, x, y, down, shift, ctrl, alt, meta| {
                    handler($crate::PointerInput {
                        target: target.to_string(),
                        button: u16::try_from(button).unwrap_or(u16::MAX),
                        x,
                        y,
                        down,
                        modifiers: $crate::Modifiers::from_held(shift, ctrl, alt, meta),
                    });
                });
            }

            fn bind_key<F>(ui: &Self::Ui, handler: F)
            where
                F: Fn($crate::KeyInput) -> bool + 'static,
            {
                ui.on_key_input(move |target, text, down, shift, ctrl, alt, meta| {
                    handler($crate::KeyInput {
                        target: target.to_string(),
                        text: text.to_string(),
                        down,
                        modifiers: $crate::Modifiers::from_held(shift, ctrl, alt, meta),
                    })
                });
            }

            fn bind_focus<F>(ui: &Self::Ui, handler: F)
            where
                F: Fn(String, String) + 'static,
            {
                ui.on_focus_moved(move |previous, next| {
                    handler(previous.to_string(), next.to_string());
                });
            }

            fn bind_select<F>(ui: &Self::Ui, handler: F)
            where
                F: Fn(String, bool) + 'static,
            {
                ui.on_select(move |row, default| handler(row.to_string(), default));
            }

            fn bind_edit<F>(ui: &Self::Ui, handler: F)
            where
                F: Fn(String, String) + 'static,
            {
                ui.on_edited(move |target, text| handler(target.to_string(), text.to_string()));
            }

            fn bind_retry<F>(ui: &Self::Ui, handler: F)
            where
                F: Fn() + 'static,
            {
                ui.on_retry(move || handler());
            }

            fn set_rows(ui: &Self::Ui, rows: &[$crate::mirror::MirrorRow]) {
                let rows: Vec<$row> = rows
                    .iter()
                    .map(|row| $row {
                        id: row.id.as_str().into(),
                        kind: row.kind.as_str().into(),
                        label: row.label.as_str().into(),
                        depth: i32::try_from(row.depth).unwrap_or(i32::MAX),
                        enabled: row.enabled,
                        editable: row.editable,
                    })
                    .collect();
                ui.set_rows(slint::ModelRc::new(slint::VecModel::from(rows)));
            }

            fn set_wait_hint(ui: &Self::Ui, visible: bool) {
                ui.set_wait_hint_visible(visible);
            }

            fn show_error(ui: &Self::Ui, notice: &$crate::ErrorNotice) {
                ui.set_error_title(notice.title.as_str().into());
                ui.set_error_message(notice.message.as_str().into());
                ui.set_error_retryable(notice.retryable);
                ui.set_error_visible(true);
            }

            fn clear_error(ui: &Self::Ui) {
                ui.set_error_visible(false);
            }
        }

        fn main() {
            $init();
            if let Err(err) = $crate::run::<MirrorHostBindings>() {
                tracing::error!(error = %err, "mirror host fatal error");
                std::process::exit(1);
            }
        }
    };
}
