//! The synchronization session.
//!
//! [`SyncSession`] owns every piece of mutable synchronization state: the
//! outbound buffer and request-pending flag (through [`Connection`]), the
//! suspension flag, the message processor, the object registry and the
//! input and keyboard bookkeeping. The host drives it from a single event
//! loop, passing the current time into every time-dependent call, and
//! drains [`SessionEvent`]s to update its own UI.

use crate::buffer::OutboundBuffer;
use crate::config::SessionConfig;
use crate::connection::{
    Connection, FailureKind, Reply, SendMode, SendOutcome, TransportAdapter, TransportFailure,
};
use crate::display::{DISPLAY_TYPE, DisplayState, display_handler};
use crate::error::{ProcessError, SessionError};
use crate::input::{
    InputState, LocalEvent, MouseButton, PointerClass, PointerEvent, PointerPhase, Shortcut,
    WidgetTree, nearest_enabled_control, pointer_properties,
};
use crate::keys::{
    KeyDisposition, KeyEvent, KeyInterest, KeyOutcome, KeyPhase, KeySequencer, PendingKey,
};
use crate::processor::{MessageProcessor, ProcessOutcome};
use crate::protocol::{Properties, decode_message};
use crate::registry::ObjectRegistry;
use crate::timers::TimerKind;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Notifications the host observes by draining the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    WaitHintShown,
    WaitHintHidden,
    /// The server could not be reached; [`SyncSession::retry`] re-sends the
    /// identical request.
    ConnectionError,
    /// The server answered with an error. The session is terminated.
    ApplicationError { message: String },
    /// The server asked the client to navigate away. The session is
    /// terminated.
    Redirect { url: String },
    /// Every operation of the last message has been applied.
    MessageProcessed,
    /// The local mirror changed and should be re-rendered.
    Render,
    /// The response to the last request has been handled.
    Received,
    /// A buffered key event turned out not to be reported and should be
    /// dispatched locally.
    ReplayKey(KeyEvent),
    /// An operation failed; the rest of its message was skipped.
    OperationFault { message: String },
}

type RenderHook = Box<dyn FnMut(&ObjectRegistry, &mut Vec<LocalEvent>)>;
type MnemonicHook = Box<dyn FnMut(&KeyEvent) -> bool>;

pub struct SyncSession<T> {
    config: SessionConfig,
    connection: Connection<T>,
    processor: MessageProcessor,
    registry: ObjectRegistry,
    suspended: bool,
    input: InputState,
    keys: KeySequencer,
    events: VecDeque<SessionEvent>,
    render_hook: Option<RenderHook>,
    mnemonic_hook: Option<MnemonicHook>,
    terminated: Option<String>,
    /// Replies that arrived while a message was paused, applied in order
    /// once it completes.
    held_replies: VecDeque<Reply>,
}

impl<T: TransportAdapter> SyncSession<T> {
    pub fn new(transport: T, config: SessionConfig) -> Self {
        let mut registry = ObjectRegistry::new();
        registry.register_handler(display_handler());
        registry.add_service(config.display_id.clone(), DISPLAY_TYPE, DisplayState::default());

        Self {
            connection: Connection::new(transport, &config),
            processor: MessageProcessor::new(),
            registry,
            suspended: false,
            input: InputState::new(config.double_click_window(), config.double_click_radius),
            keys: KeySequencer::new(),
            events: VecDeque::new(),
            render_hook: None,
            mnemonic_hook: None,
            terminated: None,
            held_replies: VecDeque::new(),
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn registry(&self) -> &ObjectRegistry {
        &self.registry
    }

    /// Handler registration and service objects. Objects must not be
    /// mutated here while a message is being applied.
    pub fn registry_mut(&mut self) -> &mut ObjectRegistry {
        &mut self.registry
    }

    pub fn transport(&self) -> &T {
        self.connection.transport()
    }

    pub fn transport_mut(&mut self) -> &mut T {
        self.connection.transport_mut()
    }

    pub fn display(&self) -> Option<&DisplayState> {
        self.registry.object::<DisplayState>(&self.config.display_id)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn is_request_pending(&self) -> bool {
        self.connection.is_request_pending()
    }

    pub fn is_connection_failed(&self) -> bool {
        self.connection.is_failed()
    }

    pub fn request_counter(&self) -> u64 {
        self.connection.request_counter()
    }

    pub fn pending_operations(&self) -> usize {
        self.connection.buffer().len()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.is_some()
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection.info().connection_id.as_deref()
    }

    /// Runs after each fully applied message, still inside the suspension
    /// window. Local events it pushes are treated as side effects.
    pub fn set_render_hook(&mut self, hook: impl FnMut(&ObjectRegistry, &mut Vec<LocalEvent>) + 'static) {
        self.render_hook = Some(Box::new(hook));
    }

    /// Consulted before key sequencing; returning `true` consumes the event.
    pub fn set_mnemonic_hook(&mut self, hook: impl FnMut(&KeyEvent) -> bool + 'static) {
        self.mnemonic_hook = Some(Box::new(hook));
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.events.drain(..).collect()
    }

    pub fn set_capture(&mut self, widget: impl Into<String>) {
        self.input.set_capture(widget);
    }

    pub fn release_capture(&mut self, widget: &str) -> bool {
        self.input.release_capture(widget)
    }

    pub fn on_next_send(&mut self, hook: impl FnOnce(&mut OutboundBuffer) + 'static) {
        self.connection.on_next_send(hook);
    }

    pub fn schedule_debounced(&mut self, now: Instant) {
        self.connection.schedule_debounced(now);
    }

    pub fn schedule_delayed(&mut self, now: Instant, delay: Duration) {
        self.connection.schedule_delayed(now, delay);
    }

    /// Queues a property write for the server and schedules a debounced
    /// flush. Writes made while a message is being applied are side effects
    /// and are dropped.
    pub fn set_property(&mut self, now: Instant, target: &str, name: &str, value: Value) -> bool {
        if self.suspended {
            debug!(%target, %name, "ignoring property write while suspended");
            return false;
        }
        self.connection.buffer_mut().set_property(target, name, value);
        self.connection.schedule_debounced(now);
        true
    }

    pub fn notify(&mut self, now: Instant, target: &str, event: &str, properties: Properties) -> bool {
        if self.suspended {
            debug!(%target, %event, "ignoring notification while suspended");
            return false;
        }
        self.connection.buffer_mut().notify(target, event, properties);
        self.connection.schedule_debounced(now);
        true
    }

    pub fn call(&mut self, now: Instant, target: &str, method: &str, properties: Properties) -> bool {
        if self.suspended {
            debug!(%target, %method, "ignoring call while suspended");
            return false;
        }
        self.connection.buffer_mut().call(target, method, properties);
        self.connection.schedule_debounced(now);
        true
    }

    pub fn send_now(&mut self, now: Instant, synchronous: bool) -> Result<(), SessionError> {
        self.ensure_running()?;
        let mode = if synchronous {
            SendMode::Sync
        } else {
            SendMode::Async
        };

        match self.connection.send_now(now, mode)? {
            SendOutcome::Deferred => Ok(()),
            SendOutcome::Sent {
                reply: Some(reply), ..
            } => self.handle_response(now, reply),
            SendOutcome::Sent { reply: None, .. } => Ok(()),
        }
    }

    pub fn send_on_unload(&mut self) -> Result<(), SessionError> {
        self.ensure_running()?;
        self.connection.send_on_unload()?;
        Ok(())
    }

    /// Re-sends the request that failed with a connectivity error.
    pub fn retry(&mut self, now: Instant) -> Result<(), SessionError> {
        self.ensure_running()?;
        match self.connection.retry(now)? {
            Some(reply) => self.handle_response(now, reply),
            None => Ok(()),
        }
    }

    /// Handles the transport's answer to the in-flight request.
    ///
    /// Returns an error only when applying the message faulted; transport
    /// and server errors are reported as [`SessionEvent`]s.
    pub fn handle_response(&mut self, now: Instant, reply: Reply) -> Result<(), SessionError> {
        if let Some(reason) = &self.terminated {
            debug!(%reason, "ignoring response for terminated session");
            return Ok(());
        }
        if self.processor.is_paused() {
            debug!(held = self.held_replies.len() + 1, "holding response until paused message resumes");
            self.held_replies.push_back(reply);
            return Ok(());
        }

        let payload = match reply {
            Ok(payload) => payload,
            Err(failure) => {
                self.handle_failure(now, failure);
                return Ok(());
            }
        };

        if payload.len() > self.config.max_inbound_frame {
            self.fail_application(
                now,
                format!(
                    "response too large: {} > {}",
                    payload.len(),
                    self.config.max_inbound_frame
                ),
            );
            return Ok(());
        }

        let message = match decode_message(&payload) {
            Ok(message) => message,
            Err(err) => {
                self.fail_application(now, format!("could not parse response: {err}"));
                return Ok(());
            }
        };
        if let Some(server_error) = &message.head.error {
            self.fail_application(now, server_error.clone());
            return Ok(());
        }

        debug!(operations = message.operations.len(), "applying message");
        self.suspended = true;
        let result = self.processor.process_message(
            message,
            &mut self.registry,
            self.connection.info_mut(),
        );
        self.after_processing(now, result)
    }

    /// Continues a message paused by a handler.
    pub fn resume_processing(&mut self, now: Instant) -> Result<(), SessionError> {
        if !self.processor.is_paused() {
            return Err(ProcessError::NothingToResume.into());
        }
        let result = self.processor.resume(&mut self.registry);
        self.after_processing(now, result)
    }

    /// Earliest instant at which [`SyncSession::fire_timers`] has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.connection.next_deadline(), self.input.reset_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn fire_timers(&mut self, now: Instant) -> Result<(), SessionError> {
        if self.input.expire(now) {
            debug!("double-click window expired");
        }

        for kind in self.connection.take_due(now) {
            match kind {
                TimerKind::WaitHint => self.events.push_back(SessionEvent::WaitHintShown),
                TimerKind::Debounce | TimerKind::Delayed => {
                    if self.terminated.is_some() {
                        continue;
                    }
                    if self.connection.is_request_pending() {
                        // Rescheduled once the in-flight request completes.
                        continue;
                    }
                    self.send_now(now, false)?;
                }
            }
        }
        Ok(())
    }

    /// Reports a pointer event bubbling through `widget`. Returns whether a
    /// notification was queued.
    pub fn pointer_event(
        &mut self,
        now: Instant,
        tree: &dyn WidgetTree,
        widget: &str,
        event: &PointerEvent,
    ) -> Result<bool, SessionError> {
        if self.suspended || self.terminated.is_some() {
            return Ok(false);
        }
        if !self.input.is_relevant(tree, widget, event) {
            return Ok(false);
        }
        let Some(button) = MouseButton::from_raw(event.raw_button) else {
            debug!(raw_button = event.raw_button, "ignoring unknown pointer button");
            return Ok(false);
        };

        let notification = match event.phase {
            PointerPhase::Down => match self.input.classify_down(widget, button, event.x, event.y, now) {
                PointerClass::Single => "MouseDown",
                PointerClass::Double => "MouseDoubleClick",
            },
            PointerPhase::Up => {
                self.input.record_up(widget);
                "MouseUp"
            }
        };

        if !self.registry.is_listening(widget, notification) {
            return Ok(false);
        }

        let modifiers = event.modifiers.normalize(self.config.platform);
        self.connection
            .buffer_mut()
            .notify(widget, notification, pointer_properties(button, event, modifiers));
        self.send_now(now, false)?;
        Ok(true)
    }

    /// Handles a key event addressed to the focused widget.
    pub fn key_event(
        &mut self,
        now: Instant,
        tree: &dyn WidgetTree,
        mut event: KeyEvent,
    ) -> Result<KeyOutcome, SessionError> {
        if self.suspended || self.terminated.is_some() {
            return Ok(KeyOutcome::ignored());
        }
        event.modifiers = event.modifiers.normalize(self.config.platform);

        let control = nearest_enabled_control(tree, &event.target)
            .unwrap_or(&self.config.display_id)
            .to_string();

        if let Some(shortcut) = Shortcut::from_key(&event.key) {
            return self.shortcut(now, shortcut, &control, &event);
        }

        if let Some(hook) = self.mnemonic_hook.as_mut() {
            if hook(&event) {
                debug!(key = %event.key, "key consumed by mnemonic");
                return Ok(KeyOutcome {
                    disposition: KeyDisposition::Suppressed,
                    prevent_default: true,
                });
            }
        }

        self.sequence_key(now, PendingKey { event, control }, false)
    }

    /// Reports a selection, focus or property change made locally. Returns
    /// whether anything was queued.
    pub fn local_event(&mut self, now: Instant, event: LocalEvent) -> Result<bool, SessionError> {
        if self.suspended || self.terminated.is_some() {
            debug!(?event, "dropping local event");
            return Ok(false);
        }

        match event {
            LocalEvent::Selection {
                target,
                default,
                detail,
            } => {
                let kind = if default { "DefaultSelection" } else { "Selection" };
                if !self.registry.is_listening(&target, kind) {
                    return Ok(false);
                }
                self.connection.buffer_mut().notify(&target, kind, detail);
                self.send_now(now, false)?;
                Ok(true)
            }
            LocalEvent::Focus { target, gained } => {
                let display_id = self.config.display_id.clone();
                let mut queued = false;
                if gained {
                    if let Some(display) = self.registry.object_mut::<DisplayState>(&display_id) {
                        display.focus_control = Some(target.clone());
                    }
                    self.connection
                        .buffer_mut()
                        .set_property(&display_id, "focusControl", json!(target));
                    self.connection.schedule_debounced(now);
                    queued = true;
                }

                let kind = if gained { "FocusIn" } else { "FocusOut" };
                if self.registry.is_listening(&target, kind) {
                    self.connection.buffer_mut().notify(&target, kind, Properties::new());
                    self.send_now(now, false)?;
                    queued = true;
                }
                Ok(queued)
            }
            LocalEvent::PropertyChanged {
                target,
                name,
                value,
            } => Ok(self.set_property(now, &target, &name, value)),
        }
    }

    fn shortcut(
        &mut self,
        now: Instant,
        shortcut: Shortcut,
        control: &str,
        event: &KeyEvent,
    ) -> Result<KeyOutcome, SessionError> {
        let kind = shortcut.event_name();
        let reported = event.phase == KeyPhase::Down && self.registry.is_listening(control, kind);
        if reported {
            let mut properties = Properties::new();
            event.modifiers.to_properties(&mut properties);
            self.connection.buffer_mut().notify(control, kind, properties);
            self.send_now(now, false)?;
        }

        Ok(KeyOutcome {
            disposition: if reported {
                KeyDisposition::Sent
            } else {
                KeyDisposition::Suppressed
            },
            prevent_default: true,
        })
    }

    fn sequence_key(&mut self, now: Instant, key: PendingKey, drained: bool) -> Result<KeyOutcome, SessionError> {
        let cancel = self.display().is_some_and(|display| {
            display.is_cancel_key(key.event.modifiers, key.event.key_code, key.event.character())
        });

        let Some(PendingKey { event, control }) = self.keys.offer(key) else {
            return Ok(KeyOutcome {
                disposition: KeyDisposition::Buffered,
                prevent_default: true,
            });
        };

        let interest = KeyInterest {
            key_down: self.registry.is_listening(&control, "KeyDown"),
            traverse: self.registry.is_listening(&control, "Traverse"),
            active_key: self.display().is_some_and(|display| {
                display.is_active_key(event.modifiers, event.key_code, event.character())
            }),
        };

        let Some(kinds) = self.keys.classify(&event, interest) else {
            if drained {
                self.events.push_back(SessionEvent::ReplayKey(event));
            }
            return Ok(KeyOutcome {
                disposition: KeyDisposition::Ignored,
                prevent_default: cancel,
            });
        };

        if self.connection.is_request_pending() {
            debug!(%control, key = %event.key, "holding key event behind pending request");
            self.keys.hold(PendingKey { event, control });
            return Ok(KeyOutcome {
                disposition: KeyDisposition::Buffered,
                prevent_default: true,
            });
        }

        debug!(%control, key = %event.key, ?kinds, "reporting key event");
        for kind in kinds {
            self.connection
                .buffer_mut()
                .notify_distinct(&control, kind, event.properties());
        }
        self.keys.begin_request();
        self.send_now(now, false)?;

        Ok(KeyOutcome {
            disposition: KeyDisposition::Sent,
            prevent_default: cancel,
        })
    }

    fn drain_keys(&mut self, now: Instant) -> Result<(), SessionError> {
        while let Some(key) = self.keys.next_buffered() {
            if self.suspended || self.terminated.is_some() {
                // Nothing will answer; hand it back rather than lose it.
                self.events.push_back(SessionEvent::ReplayKey(key.event));
                continue;
            }
            self.sequence_key(now, key, true)?;
        }
        Ok(())
    }

    fn after_processing(
        &mut self,
        now: Instant,
        result: Result<ProcessOutcome, ProcessError>,
    ) -> Result<(), SessionError> {
        match result {
            Ok(ProcessOutcome::Paused) => {
                debug!("message processing paused; staying suspended");
                Ok(())
            }
            Ok(ProcessOutcome::Completed) => self.complete_message(now),
            Ok(ProcessOutcome::Redirected(url)) => {
                info!(%url, "server redirected the session");
                self.suspended = false;
                self.finish_request(now);
                self.terminated = Some(format!("redirected to {url}"));
                self.events.push_back(SessionEvent::Redirect { url });
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "failed to apply message");
                let dropped = self.processor.take_local_events().len();
                if dropped > 0 {
                    debug!(dropped, "dropping local events of faulted message");
                }
                self.suspended = false;
                self.events.push_back(SessionEvent::OperationFault {
                    message: err.to_string(),
                });
                self.finish_request(now);
                self.events.push_back(SessionEvent::Received);
                self.keys.on_received();
                self.drain_keys(now)?;
                if let Err(next) = self.apply_held_reply(now) {
                    warn!(error = %next, "held response failed after a fault");
                }
                Err(err.into())
            }
        }
    }

    fn complete_message(&mut self, now: Instant) -> Result<(), SessionError> {
        let mut side_effects = self.processor.take_local_events();
        if let Some(hook) = self.render_hook.as_mut() {
            hook(&self.registry, &mut side_effects);
        }
        // Still suspended: these are dropped, not reported.
        for event in side_effects {
            self.local_event(now, event)?;
        }

        self.suspended = false;
        self.events.push_back(SessionEvent::MessageProcessed);
        self.events.push_back(SessionEvent::Render);
        self.finish_request(now);
        self.events.push_back(SessionEvent::Received);
        self.keys.on_received();
        self.drain_keys(now)?;
        self.apply_held_reply(now)
    }

    fn apply_held_reply(&mut self, now: Instant) -> Result<(), SessionError> {
        match self.held_replies.pop_front() {
            Some(reply) => self.handle_response(now, reply),
            None => Ok(()),
        }
    }

    fn finish_request(&mut self, now: Instant) {
        if self.connection.finish_request(now) {
            self.events.push_back(SessionEvent::WaitHintHidden);
        }
    }

    fn handle_failure(&mut self, now: Instant, failure: TransportFailure) {
        match self.connection.classify_failure(&failure) {
            FailureKind::Connectivity => {
                warn!(status = failure.status, "connection failure");
                let hint_was_shown = self.connection.is_wait_hint_shown();
                self.connection.mark_failed();
                if hint_was_shown {
                    self.events.push_back(SessionEvent::WaitHintHidden);
                }
                self.events.push_back(SessionEvent::ConnectionError);
            }
            FailureKind::Application => {
                let message = if failure.body.trim().is_empty() {
                    format!("server responded with status {:?}", failure.status)
                } else {
                    failure.body
                };
                self.fail_application(now, message);
            }
        }
    }

    fn fail_application(&mut self, now: Instant, message: String) {
        error!(%message, "application error");
        self.finish_request(now);
        self.terminated = Some(message.clone());
        self.events.push_back(SessionEvent::ApplicationError { message });
    }

    fn ensure_running(&self) -> Result<(), SessionError> {
        match &self.terminated {
            Some(reason) => Err(SessionError::Terminated(reason.clone())),
            None => Ok(()),
        }
    }
}
