use crate::error::HandlerError;
use crate::input::Modifiers;
use crate::registry::{HandlerBuilder, HandlerDescriptor};
use serde_json::Value;
use std::collections::HashSet;

pub const DISPLAY_TYPE: &str = "rwt.widgets.Display";

/// Display-wide state the server configures: which key combinations it
/// wants reported regardless of listeners, and which ones must not reach
/// the platform.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DisplayState {
    pub focus_control: Option<String>,
    pub active_keys: HashSet<String>,
    pub cancel_keys: HashSet<String>,
}

impl DisplayState {
    pub fn is_active_key(&self, modifiers: Modifiers, key_code: u32, character: Option<char>) -> bool {
        matches_binding(&self.active_keys, modifiers, key_code, character)
    }

    pub fn is_cancel_key(&self, modifiers: Modifiers, key_code: u32, character: Option<char>) -> bool {
        matches_binding(&self.cancel_keys, modifiers, key_code, character)
    }
}

/// Key bindings look like `CTRL+S`, `ALT+SHIFT+#13` or `#27`: a modifier
/// prefix in `ALT`, `CTRL`, `SHIFT` order, then either a printable character
/// or `#` and a key code.
fn matches_binding(
    bindings: &HashSet<String>,
    modifiers: Modifiers,
    key_code: u32,
    character: Option<char>,
) -> bool {
    if bindings.is_empty() {
        return false;
    }

    let mut prefix = String::new();
    if modifiers.contains(Modifiers::ALT) {
        prefix.push_str("ALT+");
    }
    if modifiers.contains(Modifiers::CTRL) {
        prefix.push_str("CTRL+");
    }
    if modifiers.contains(Modifiers::SHIFT) {
        prefix.push_str("SHIFT+");
    }

    if bindings.contains(&format!("{prefix}#{key_code}")) {
        return true;
    }
    character
        .filter(|ch| !ch.is_control())
        .is_some_and(|ch| bindings.contains(&format!("{prefix}{}", ch.to_ascii_uppercase())))
}

fn string_set(property: &str, value: &Value) -> Result<HashSet<String>, HandlerError> {
    let Value::Array(items) = value else {
        return Err(HandlerError::invalid(property, "expected an array of strings"));
    };
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| HandlerError::invalid(property, "expected an array of strings"))
        })
        .collect()
}

/// The display is a service object added by the session; the server cannot
/// create it.
pub fn display_handler() -> HandlerDescriptor {
    HandlerBuilder::<DisplayState>::new(DISPLAY_TYPE)
        .property("activeKeys", |display, value, _| {
            display.active_keys = string_set("activeKeys", value)?;
            Ok(())
        })
        .property("cancelKeys", |display, value, _| {
            display.cancel_keys = string_set("cancelKeys", value)?;
            Ok(())
        })
        .property("focusControl", |display, value, _| {
            display.focus_control = value.as_str().map(str::to_string);
            Ok(())
        })
        .build()
}
