//! Keyboard sequencing.
//!
//! A relevant key event is sent right away and flips the sequencer into
//! `RequestInFlight`. Every key event arriving before the response is
//! buffered in arrival order; after the response the buffer is drained one
//! event at a time, and a drained event may start the next round trip.

use crate::input::Modifiers;
use crate::protocol::Properties;
use serde_json::json;
use std::collections::VecDeque;

const TAB: u32 = 9;
const ENTER: u32 = 13;
const ESCAPE: u32 = 27;

const MODIFIER_KEYS: [&str; 4] = ["Shift", "Control", "Alt", "Meta"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPhase {
    Down,
    Press,
    Up,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyEvent {
    pub phase: KeyPhase,
    /// Widget that had keyboard focus when the event fired.
    pub target: String,
    /// Key identifier, e.g. `"a"`, `"Enter"`, `"F1"`.
    pub key: String,
    pub key_code: u32,
    pub char_code: u32,
    pub modifiers: Modifiers,
    pub repeat: bool,
}

impl KeyEvent {
    pub fn character(&self) -> Option<char> {
        char::from_u32(self.char_code).filter(|ch| *ch != '\0')
    }

    pub fn is_traverse_key(&self) -> bool {
        matches!(self.key_code, TAB | ENTER | ESCAPE)
    }

    fn is_bare_modifier(&self) -> bool {
        MODIFIER_KEYS.contains(&self.key.as_str())
    }

    /// Tab combined with ctrl or alt cycles windows or tabs on most
    /// platforms and is left alone.
    fn is_reserved_shortcut(&self) -> bool {
        self.key_code == TAB && self.modifiers.intersects(Modifiers::CTRL | Modifiers::ALT)
    }

    /// Payload shared by key notifications.
    pub fn properties(&self) -> Properties {
        let mut properties = Properties::new();
        properties.insert("keyCode".to_string(), json!(self.key_code));
        properties.insert("charCode".to_string(), json!(self.char_code));
        self.modifiers.to_properties(&mut properties);
        properties
    }
}

/// What the server asked to hear about for the control a key event is
/// addressed to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyInterest {
    pub key_down: bool,
    pub traverse: bool,
    /// The display lists the combination as an active key.
    pub active_key: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDisposition {
    /// Reported to the server; a request is now in flight.
    Sent,
    /// Held until the in-flight request completes.
    Buffered,
    /// Consumed locally by a mnemonic or shortcut.
    Suppressed,
    /// Not reported; the platform handles it normally.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyOutcome {
    pub disposition: KeyDisposition,
    pub prevent_default: bool,
}

impl KeyOutcome {
    pub fn ignored() -> Self {
        Self {
            disposition: KeyDisposition::Ignored,
            prevent_default: false,
        }
    }
}

/// A key event together with the control it is reported for.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingKey {
    pub event: KeyEvent,
    pub control: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum SequencerState {
    #[default]
    Idle,
    RequestInFlight,
}

#[derive(Debug, Default)]
pub struct KeySequencer {
    state: SequencerState,
    buffered: VecDeque<PendingKey>,
    reported_down: Option<u32>,
}

impl KeySequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_request_in_flight(&self) -> bool {
        self.state == SequencerState::RequestInFlight
    }

    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// Buffers `event` if a request is in flight. Otherwise hands it back
    /// for classification.
    pub fn offer(&mut self, key: PendingKey) -> Option<PendingKey> {
        if self.is_request_in_flight() {
            self.buffered.push_back(key);
            None
        } else {
            Some(key)
        }
    }

    /// Notification kinds to report for `event`, or `None` if it should not
    /// be sent at all.
    pub fn classify(&mut self, event: &KeyEvent, interest: KeyInterest) -> Option<Vec<&'static str>> {
        match event.phase {
            KeyPhase::Up => {
                if self.reported_down == Some(event.key_code) {
                    self.reported_down = None;
                }
                return None;
            }
            KeyPhase::Press if self.reported_down == Some(event.key_code) => return None,
            KeyPhase::Down | KeyPhase::Press => {}
        }

        if event.repeat && event.is_bare_modifier() {
            return None;
        }
        if event.is_reserved_shortcut() {
            return None;
        }

        let mut kinds = Vec::new();
        if interest.key_down || interest.active_key {
            kinds.push("KeyDown");
        }
        if interest.traverse && event.is_traverse_key() {
            kinds.push("Traverse");
        }
        if kinds.is_empty() {
            return None;
        }

        if event.phase == KeyPhase::Down {
            self.reported_down = Some(event.key_code);
        }
        Some(kinds)
    }

    /// Holds a classified event until the request already in flight is
    /// answered. It goes back to the front of the queue, ahead of anything
    /// that arrived after it.
    pub fn hold(&mut self, key: PendingKey) {
        self.state = SequencerState::RequestInFlight;
        self.buffered.push_front(key);
    }

    pub fn begin_request(&mut self) {
        self.state = SequencerState::RequestInFlight;
    }

    /// Marks the in-flight request as answered.
    pub fn on_received(&mut self) {
        self.state = SequencerState::Idle;
    }

    /// Next buffered event, as long as no new request went out while
    /// draining.
    pub fn next_buffered(&mut self) -> Option<PendingKey> {
        if self.is_request_in_flight() {
            return None;
        }
        self.buffered.pop_front()
    }
}
