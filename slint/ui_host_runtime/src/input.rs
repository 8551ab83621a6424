//! Translation of local pointer, focus and selection input into outbound
//! notifications.
//!
//! The state here is pure bookkeeping (capture, double-click record); the
//! session decides whether anything is reported, gating every entry point on
//! its suspension flag.

use crate::config::Platform;
use crate::protocol::Properties;
use bitflags::bitflags;
use serde_json::{Value, json};
use std::time::{Duration, Instant};

bitflags! {
    /// Modifier keys held during an input event.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Modifiers: u8 {
        const SHIFT = 0b0001;
        const CTRL  = 0b0010;
        const ALT   = 0b0100;
        const META  = 0b1000;
    }
}

impl Modifiers {
    pub fn from_held(shift: bool, ctrl: bool, alt: bool, meta: bool) -> Modifiers {
        let mut modifiers = Modifiers::empty();
        modifiers.set(Modifiers::SHIFT, shift);
        modifiers.set(Modifiers::CTRL, ctrl);
        modifiers.set(Modifiers::ALT, alt);
        modifiers.set(Modifiers::META, meta);
        modifiers
    }

    /// Maps platform modifiers onto the stable wire set (shift, ctrl, alt).
    /// On Mac the command key stands in for ctrl.
    pub fn normalize(self, platform: Platform) -> Modifiers {
        let mut normalized = self & (Modifiers::SHIFT | Modifiers::ALT);
        let ctrl = match platform {
            Platform::Mac => self.contains(Modifiers::META),
            Platform::Other => self.contains(Modifiers::CTRL),
        };
        normalized.set(Modifiers::CTRL, ctrl);
        normalized
    }

    pub fn to_properties(self, properties: &mut Properties) {
        properties.insert("shiftKey".to_string(), json!(self.contains(Modifiers::SHIFT)));
        properties.insert("ctrlKey".to_string(), json!(self.contains(Modifiers::CTRL)));
        properties.insert("altKey".to_string(), json!(self.contains(Modifiers::ALT)));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MouseButton {
    Primary,
    Middle,
    Secondary,
}

impl MouseButton {
    /// Raw codes follow the DOM convention: 0 primary, 1 middle, 2 secondary.
    pub fn from_raw(raw: u16) -> Option<MouseButton> {
        match raw {
            0 => Some(MouseButton::Primary),
            1 => Some(MouseButton::Middle),
            2 => Some(MouseButton::Secondary),
            _ => None,
        }
    }

    pub fn wire_code(self) -> u8 {
        match self {
            MouseButton::Primary => 1,
            MouseButton::Middle => 2,
            MouseButton::Secondary => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerPhase {
    Down,
    Up,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PointerEvent {
    pub phase: PointerPhase,
    /// Exact element the native hit test returned.
    pub hit_target: String,
    pub raw_button: u16,
    pub x: i32,
    pub y: i32,
    pub modifiers: Modifiers,
    pub time: Instant,
}

/// Local events a widget may fire, either as genuine user input or as a
/// side effect of applying server operations.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalEvent {
    Selection {
        target: String,
        default: bool,
        detail: Properties,
    },
    Focus {
        target: String,
        gained: bool,
    },
    PropertyChanged {
        target: String,
        name: String,
        value: Value,
    },
}

/// Read access to the local widget hierarchy.
pub trait WidgetTree {
    fn parent(&self, id: &str) -> Option<&str>;

    /// Whether `id` is a control addressable by the server, as opposed to an
    /// inner element or item.
    fn is_control(&self, id: &str) -> bool;

    fn is_enabled(&self, id: &str) -> bool;
}

/// Walks up from `start` to the nearest enabled control, `start` included.
pub fn nearest_enabled_control<'a>(tree: &'a dyn WidgetTree, start: &'a str) -> Option<&'a str> {
    let mut current = Some(start);
    while let Some(id) = current {
        if tree.is_control(id) && tree.is_enabled(id) {
            return Some(id);
        }
        current = tree.parent(id);
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerClass {
    Single,
    Double,
}

#[derive(Debug, Clone, PartialEq)]
struct LastPointerDown {
    widget: String,
    button: MouseButton,
    x: i32,
    y: i32,
    up_count: u32,
}

/// Key identifiers intercepted before normal keyboard handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shortcut {
    MenuDetect,
    Help,
}

impl Shortcut {
    pub fn from_key(key: &str) -> Option<Shortcut> {
        match key {
            "Apps" | "ContextMenu" => Some(Shortcut::MenuDetect),
            "F1" | "Help" => Some(Shortcut::Help),
            _ => None,
        }
    }

    pub fn event_name(self) -> &'static str {
        match self {
            Shortcut::MenuDetect => "MenuDetect",
            Shortcut::Help => "Help",
        }
    }
}

#[derive(Debug)]
pub struct InputState {
    capture: Option<String>,
    last_down: Option<LastPointerDown>,
    reset_at: Option<Instant>,
    window: Duration,
    radius: i32,
}

impl InputState {
    pub fn new(window: Duration, radius: i32) -> Self {
        Self {
            capture: None,
            last_down: None,
            reset_at: None,
            window,
            radius,
        }
    }

    pub fn capture(&self) -> Option<&str> {
        self.capture.as_deref()
    }

    pub fn set_capture(&mut self, widget: impl Into<String>) {
        self.capture = Some(widget.into());
    }

    /// Releases capture if `widget` holds it.
    pub fn release_capture(&mut self, widget: &str) -> bool {
        if self.capture.as_deref() == Some(widget) {
            self.capture = None;
            true
        } else {
            false
        }
    }

    /// Whether a pointer event bubbling through `widget` should be reported
    /// for it. Only one widget along the bubbling path qualifies.
    pub fn is_relevant(&self, tree: &dyn WidgetTree, widget: &str, event: &PointerEvent) -> bool {
        if let Some(capture) = &self.capture {
            return capture == widget;
        }
        if event.hit_target == widget {
            return true;
        }
        nearest_enabled_control(tree, &event.hit_target) == Some(widget)
    }

    /// Classifies a pointer down on `widget`. A second down on the same
    /// widget and button inside the time and distance window is a double
    /// click and clears the record.
    pub fn classify_down(
        &mut self,
        widget: &str,
        button: MouseButton,
        x: i32,
        y: i32,
        now: Instant,
    ) -> PointerClass {
        self.expire(now);

        if let Some(last) = &self.last_down {
            let same_spot = (last.x - x).abs() <= self.radius && (last.y - y).abs() <= self.radius;
            if last.widget == widget && last.button == button && same_spot {
                self.last_down = None;
                self.reset_at = None;
                return PointerClass::Double;
            }
        }

        self.last_down = Some(LastPointerDown {
            widget: widget.to_string(),
            button,
            x,
            y,
            up_count: 0,
        });
        self.reset_at = Some(now + self.window);
        PointerClass::Single
    }

    pub fn record_up(&mut self, widget: &str) {
        if let Some(last) = self.last_down.as_mut().filter(|last| last.widget == widget) {
            last.up_count += 1;
        }
    }

    pub fn reset_deadline(&self) -> Option<Instant> {
        self.reset_at
    }

    /// Drops the double-click record once its window has elapsed.
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.reset_at {
            Some(at) if now >= at => {
                self.last_down = None;
                self.reset_at = None;
                true
            }
            _ => false,
        }
    }

    pub fn has_pending_click(&self) -> bool {
        self.last_down.is_some()
    }

    /// Pointer ups seen since the recorded down, if a record is live.
    pub fn pending_up_count(&self) -> Option<u32> {
        self.last_down.as_ref().map(|last| last.up_count)
    }
}

pub fn pointer_properties(
    button: MouseButton,
    event: &PointerEvent,
    modifiers: Modifiers,
) -> Properties {
    let mut properties = Properties::new();
    properties.insert("button".to_string(), json!(button.wire_code()));
    properties.insert("x".to_string(), json!(event.x));
    properties.insert("y".to_string(), json!(event.y));
    modifiers.to_properties(&mut properties);
    properties
}
