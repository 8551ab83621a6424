//! Transport scheduling: when the outbound buffer is serialized and sent.
//!
//! At most one request is in flight at a time. Asynchronous sends attempted
//! while one is pending are turned into a debounced schedule, so they go out
//! after the response instead of being dropped.

use crate::buffer::OutboundBuffer;
use crate::config::SessionConfig;
use crate::error::{ProtocolError, SessionError};
use crate::processor::ConnectionInfo;
use crate::protocol::{ClientMessage, Head, encode_client_message};
use crate::timers::{TimerKind, Timers};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    Async,
    /// The adapter blocks until the response is available.
    Sync,
    /// Fire and forget; no response is expected.
    Beacon,
}

/// A request that produced no usable response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFailure {
    pub status: Option<u16>,
    pub body: String,
}

impl TransportFailure {
    pub fn connectivity() -> Self {
        Self {
            status: None,
            body: String::new(),
        }
    }

    pub fn application(status: u16, body: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            body: body.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Recoverable; the identical request may be retried.
    Connectivity,
    /// Terminal; shown to the user and never retried.
    Application,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub url: String,
    pub request_counter: u64,
    pub payload: Vec<u8>,
}

pub type Reply = Result<Vec<u8>, TransportFailure>;

/// Carries serialized requests to the server.
pub trait TransportAdapter {
    /// Transmits `request`. Returns the reply when it is already known, as
    /// for [`SendMode::Sync`] or a transmission that failed up front; an
    /// asynchronous reply is handed to the session later.
    fn transmit(&mut self, request: &OutboundRequest, mode: SendMode) -> Option<Reply>;

    /// No status or an empty body means the server was never reached.
    fn classify_failure(&self, failure: &TransportFailure) -> FailureKind {
        match failure.status {
            None | Some(0) => FailureKind::Connectivity,
            Some(_) if failure.body.trim().is_empty() => FailureKind::Connectivity,
            Some(_) => FailureKind::Application,
        }
    }
}

type NextSendHook = Box<dyn FnOnce(&mut OutboundBuffer)>;

#[derive(Debug)]
pub enum SendOutcome {
    /// A request was already in flight; the send is scheduled instead.
    Deferred,
    Sent {
        request_counter: u64,
        reply: Option<Reply>,
    },
}

pub struct Connection<T> {
    transport: T,
    info: ConnectionInfo,
    buffer: OutboundBuffer,
    timers: Timers,
    debounce: Duration,
    wait_hint: Duration,
    max_outbound_frame: usize,
    request_counter: u64,
    request_pending: bool,
    sync_over_pending: bool,
    wait_hint_shown: bool,
    in_flight: Option<OutboundRequest>,
    outer_in_flight: Option<OutboundRequest>,
    failed: bool,
    deferred: bool,
    next_send: Vec<NextSendHook>,
}

impl<T: TransportAdapter> Connection<T> {
    pub fn new(transport: T, config: &SessionConfig) -> Self {
        Self {
            transport,
            info: ConnectionInfo::new(config.url.clone()),
            buffer: OutboundBuffer::new(),
            timers: Timers::default(),
            debounce: config.debounce(),
            wait_hint: config.wait_hint(),
            max_outbound_frame: config.max_outbound_frame,
            request_counter: 0,
            request_pending: false,
            sync_over_pending: false,
            wait_hint_shown: false,
            in_flight: None,
            outer_in_flight: None,
            failed: false,
            deferred: false,
            next_send: Vec::new(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn info_mut(&mut self) -> &mut ConnectionInfo {
        &mut self.info
    }

    pub fn buffer(&self) -> &OutboundBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut OutboundBuffer {
        &mut self.buffer
    }

    pub fn is_request_pending(&self) -> bool {
        self.request_pending
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn is_wait_hint_shown(&self) -> bool {
        self.wait_hint_shown
    }

    /// Counter the next request will carry.
    pub fn request_counter(&self) -> u64 {
        self.request_counter
    }

    pub fn is_scheduled(&self, kind: TimerKind) -> bool {
        self.timers.is_armed(kind)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Arms the debounce timer unless it is already armed; a burst of calls
    /// is flushed once, at most one interval after the first call.
    pub fn schedule_debounced(&mut self, now: Instant) {
        if self.timers.arm_if_idle(TimerKind::Debounce, now + self.debounce) {
            debug!("debounced send scheduled");
        }
    }

    /// Arms the delayed-send timer, replacing any earlier delayed schedule.
    pub fn schedule_delayed(&mut self, now: Instant, delay: Duration) {
        self.timers.arm(TimerKind::Delayed, now + delay);
        debug!(delay_ms = delay.as_millis() as u64, "delayed send scheduled");
    }

    /// Registers a hook run once, right before the next request is
    /// serialized.
    pub fn on_next_send(&mut self, hook: impl FnOnce(&mut OutboundBuffer) + 'static) {
        self.next_send.push(Box::new(hook));
    }

    pub fn send_now(&mut self, now: Instant, mode: SendMode) -> Result<SendOutcome, ProtocolError> {
        if self.request_pending && mode == SendMode::Async {
            warn!(
                request_counter = self.request_counter,
                "request in flight; deferring send"
            );
            self.deferred = true;
            self.schedule_debounced(now);
            return Ok(SendOutcome::Deferred);
        }

        for hook in std::mem::take(&mut self.next_send) {
            hook(&mut self.buffer);
        }

        if let Some(server_counter) = self.info.last_server_counter {
            self.request_counter = self.request_counter.max(server_counter);
        }
        let request = self.encode(Head {
            request_counter: Some(self.request_counter),
            ..Head::default()
        })?;
        self.buffer.take();

        let request_counter = self.request_counter;
        self.request_counter += 1;
        self.sync_over_pending = self.request_pending && mode == SendMode::Sync;
        if self.sync_over_pending {
            self.outer_in_flight = self.in_flight.take();
        }
        self.request_pending = true;
        self.failed = false;
        self.deferred = false;
        self.timers.cancel(TimerKind::Debounce);
        self.timers.cancel(TimerKind::Delayed);
        self.timers.arm(TimerKind::WaitHint, now + self.wait_hint);

        debug!(request_counter, bytes = request.payload.len(), ?mode, "sending request");
        let reply = self.transport.transmit(&request, mode);
        self.in_flight = Some(request);

        Ok(SendOutcome::Sent {
            request_counter,
            reply,
        })
    }

    /// Best-effort flush on teardown. Leaves the pending state untouched and
    /// ignores any reply.
    pub fn send_on_unload(&mut self) -> Result<(), ProtocolError> {
        let request = self.encode(Head {
            request_counter: Some(self.request_counter),
            shutdown: true,
            ..Head::default()
        })?;
        self.buffer.take();
        self.request_counter += 1;

        info!(request_counter = request.request_counter, "sending shutdown request");
        let _ = self.transport.transmit(&request, SendMode::Beacon);
        Ok(())
    }

    /// Re-sends the byte-identical payload of the failed request.
    pub fn retry(&mut self, now: Instant) -> Result<Option<Reply>, SessionError> {
        if !self.failed {
            return Err(SessionError::NothingToRetry);
        }
        let request = self.in_flight.clone().ok_or(SessionError::NothingToRetry)?;

        info!(request_counter = request.request_counter, "retrying request");
        self.failed = false;
        self.timers.arm(TimerKind::WaitHint, now + self.wait_hint);
        Ok(self.transport.transmit(&request, SendMode::Async))
    }

    pub fn classify_failure(&self, failure: &TransportFailure) -> FailureKind {
        self.transport.classify_failure(failure)
    }

    /// Keeps the request pending so nothing else is sent until it has been
    /// retried successfully.
    pub fn mark_failed(&mut self) {
        warn!(
            request_counter = self.in_flight.as_ref().map(|request| request.request_counter),
            "request failed; waiting for retry"
        );
        self.failed = true;
        self.hide_wait_hint();
    }

    /// Ends the current round trip and reschedules anything queued while it
    /// was in flight. Returns whether the wait hint was visible and has been
    /// hidden.
    pub fn finish_request(&mut self, now: Instant) -> bool {
        if self.sync_over_pending {
            // The asynchronous request sent before is still outstanding.
            self.sync_over_pending = false;
            self.in_flight = self.outer_in_flight.take();
            return false;
        }

        self.request_pending = false;
        self.in_flight = None;
        if self.deferred || !self.buffer.is_empty() {
            self.deferred = false;
            self.schedule_debounced(now);
        }
        self.hide_wait_hint()
    }

    /// Fires due timers. Returns the kinds that fired so the caller can
    /// flush or show the wait hint.
    pub fn take_due(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut due = self.timers.take_due(now);
        due.retain(|kind| match kind {
            TimerKind::WaitHint => {
                if self.request_pending && !self.failed && !self.wait_hint_shown {
                    self.wait_hint_shown = true;
                    true
                } else {
                    false
                }
            }
            TimerKind::Debounce | TimerKind::Delayed => true,
        });
        due
    }

    fn hide_wait_hint(&mut self) -> bool {
        self.timers.cancel(TimerKind::WaitHint);
        std::mem::replace(&mut self.wait_hint_shown, false)
    }

    fn encode(&self, head: Head) -> Result<OutboundRequest, ProtocolError> {
        let request_counter = head.request_counter.unwrap_or(self.request_counter);
        let message = ClientMessage {
            head,
            operations: self.buffer.operations().to_vec(),
        };
        let payload = encode_client_message(&message)?;
        if payload.len() > self.max_outbound_frame {
            return Err(ProtocolError::TooLarge {
                size: payload.len(),
                limit: self.max_outbound_frame,
            });
        }

        Ok(OutboundRequest {
            url: self.info.request_url(),
            request_counter,
            payload,
        })
    }
}
