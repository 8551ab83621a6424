//! Applies inbound messages to the object registry.
//!
//! Operations run strictly in order. A handler may pause processing from
//! inside an operation; the processor then keeps the message and the index
//! of the next operation as its single pending continuation and returns.
//! [`MessageProcessor::resume`] re-enters the same loop at that index.

use crate::error::{OperationFault, ProcessError};
use crate::input::LocalEvent;
use crate::protocol::{Head, Message, Operation};
use crate::registry::{ObjectRegistry, OpContext};
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed,
    Paused,
    /// The head asked the client to navigate away; nothing was applied.
    Redirected(String),
}

/// Endpoint state a message head may update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub url: String,
    pub connection_id: Option<String>,
    pub last_server_counter: Option<u64>,
}

impl ConnectionInfo {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Endpoint for the next request, with the connection id appended once
    /// the server assigned one.
    pub fn request_url(&self) -> String {
        match &self.connection_id {
            Some(cid) => {
                let separator = if self.url.contains('?') { '&' } else { '?' };
                format!("{}{separator}cid={cid}", self.url)
            }
            None => self.url.clone(),
        }
    }

    fn apply_head(&mut self, head: &Head) {
        if let Some(url) = &head.url {
            self.url = url.clone();
        }
        if let Some(cid) = &head.connection_id {
            self.connection_id = Some(cid.clone());
        }
        if let Some(counter) = head.request_counter {
            self.last_server_counter = Some(counter);
        }
    }
}

#[derive(Debug)]
struct Continuation {
    message: Message,
    next_index: usize,
}

#[derive(Debug, Default)]
pub struct MessageProcessor {
    pending: Option<Continuation>,
    local_events: Vec<LocalEvent>,
}

impl MessageProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_paused(&self) -> bool {
        self.pending.is_some()
    }

    /// Local events emitted by handlers since the last call.
    pub fn take_local_events(&mut self) -> Vec<LocalEvent> {
        std::mem::take(&mut self.local_events)
    }

    pub fn process_message(
        &mut self,
        message: Message,
        registry: &mut ObjectRegistry,
        info: &mut ConnectionInfo,
    ) -> Result<ProcessOutcome, ProcessError> {
        if self.pending.is_some() {
            return Err(ProcessError::PauseAlreadyPending);
        }

        info.apply_head(&message.head);
        if let Some(redirect) = &message.head.redirect {
            debug!(%redirect, "message redirects; skipping operations");
            return Ok(ProcessOutcome::Redirected(redirect.clone()));
        }

        self.process_from(message, 0, registry)
    }

    pub fn resume(&mut self, registry: &mut ObjectRegistry) -> Result<ProcessOutcome, ProcessError> {
        let Continuation {
            message,
            next_index,
        } = self.pending.take().ok_or(ProcessError::NothingToResume)?;
        debug!(next_index, "resuming paused message");
        self.process_from(message, next_index, registry)
    }

    fn process_from(
        &mut self,
        message: Message,
        offset: usize,
        registry: &mut ObjectRegistry,
    ) -> Result<ProcessOutcome, ProcessError> {
        for index in offset..message.operations.len() {
            let operation = &message.operations[index];
            let mut ctx = OpContext::new(operation.target());

            let result = apply_operation(operation, registry, &mut ctx);
            self.local_events.extend(ctx.take_local_events());

            if let Err(cause) = result {
                let fault = OperationFault {
                    kind: operation.kind(),
                    target: operation.target().to_string(),
                    type_name: type_name_for(operation, registry),
                    properties: operation.property_dump(),
                    index,
                    cause: Box::new(cause),
                };
                error!(%fault, "operation failed; remaining operations skipped");
                return Err(ProcessError::OperationFailed(Box::new(fault)));
            }

            if ctx.pause_requested() {
                debug!(index, total = message.operations.len(), "processing paused");
                self.pending = Some(Continuation {
                    message,
                    next_index: index + 1,
                });
                return Ok(ProcessOutcome::Paused);
            }
        }

        Ok(ProcessOutcome::Completed)
    }
}

fn type_name_for(operation: &Operation, registry: &ObjectRegistry) -> Option<String> {
    match operation {
        Operation::Create { type_name, .. } => Some(type_name.clone()),
        other => registry.type_of(other.target()).map(str::to_string),
    }
}

fn apply_operation(
    operation: &Operation,
    registry: &mut ObjectRegistry,
    ctx: &mut OpContext,
) -> Result<(), ProcessError> {
    match operation {
        Operation::Create {
            target,
            type_name,
            properties,
        } => {
            let handler = registry
                .handler(type_name)
                .ok_or_else(|| ProcessError::UnknownType(type_name.clone()))?;
            let object = handler
                .create(properties)
                .ok_or_else(|| ProcessError::UnsupportedOperation(type_name.clone()))??;
            registry.add(target.clone(), object, handler);
            apply_set(target, properties, registry, ctx)
        }
        Operation::Set { target, properties } => apply_set(target, properties, registry, ctx),
        Operation::Listen { target, events } => {
            let entry = registry
                .entry_mut(target)
                .ok_or_else(|| ProcessError::TargetNotFound(target.clone()))?;
            let handler = entry.handler.clone();
            for (event, enabled) in events {
                if !handler.declares_event(event) {
                    debug!(%target, %event, "ignoring listen for undeclared event");
                    continue;
                }
                handler.wire_listener(entry.object.as_mut(), event, *enabled, ctx)?;
            }
            for (event, enabled) in events {
                if handler.declares_event(event) {
                    registry.set_remote_listener(target, event, *enabled);
                }
            }
            Ok(())
        }
        Operation::Call {
            target,
            method,
            properties,
        } => {
            let entry = registry
                .entry_mut(target)
                .ok_or_else(|| ProcessError::TargetNotFound(target.clone()))?;
            let handler = entry.handler.clone();
            handler
                .invoke(entry.object.as_mut(), method, properties, ctx)
                .ok_or_else(|| ProcessError::UnknownMethod {
                    type_name: handler.type_name().to_string(),
                    method: method.clone(),
                })??;
            Ok(())
        }
        Operation::Destroy { target } => {
            if !registry.contains(target) {
                return Err(ProcessError::TargetNotFound(target.clone()));
            }
            destroy_recursive(target, registry, ctx);
            Ok(())
        }
    }
}

fn apply_set(
    target: &str,
    properties: &crate::protocol::Properties,
    registry: &mut ObjectRegistry,
    ctx: &mut OpContext,
) -> Result<(), ProcessError> {
    let entry = registry
        .entry_mut(target)
        .ok_or_else(|| ProcessError::TargetNotFound(target.to_string()))?;
    entry
        .handler
        .clone()
        .apply_properties(entry.object.as_mut(), properties, ctx)?;
    Ok(())
}

/// Runs the destructor of `target`, unregisters it, then does the same for
/// each declared child. Children already gone are skipped.
fn destroy_recursive(target: &str, registry: &mut ObjectRegistry, ctx: &mut OpContext) {
    let Some(entry) = registry.entry_mut(target) else {
        return;
    };
    let handler = entry.handler.clone();
    let children = handler.children_of(entry.object.as_ref());
    handler.destroy(entry.object.as_mut(), ctx);
    registry.remove(target);

    for child in children {
        destroy_recursive(&child, registry, ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::protocol::Properties;
    use crate::registry::HandlerBuilder;
    use serde_json::{Value, json};
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::rc::Rc;

    #[derive(Debug, Default)]
    struct Widget {
        x: i64,
        y: i64,
        children: Vec<String>,
        listening: Vec<(String, bool)>,
    }

    fn props(value: Value) -> Properties {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    fn set(target: &str, value: Value) -> Operation {
        Operation::Set {
            target: target.to_string(),
            properties: props(value),
        }
    }

    fn create(target: &str, value: Value) -> Operation {
        Operation::Create {
            target: target.to_string(),
            type_name: "test.Widget".to_string(),
            properties: props(value),
        }
    }

    fn call(target: &str, method: &str) -> Operation {
        Operation::Call {
            target: target.to_string(),
            method: method.to_string(),
            properties: Properties::new(),
        }
    }

    fn destroy(target: &str) -> Operation {
        Operation::Destroy {
            target: target.to_string(),
        }
    }

    fn registry_with(destroyed: Rc<RefCell<Vec<String>>>) -> ObjectRegistry {
        let mut registry = ObjectRegistry::new();
        registry.register_handler(
            HandlerBuilder::<Widget>::new("test.Widget")
                .factory(|_| Ok(Widget::default()))
                .property("x", |widget, value, _| {
                    widget.x = value.as_i64().ok_or_else(|| HandlerError::invalid("x", "not an integer"))?;
                    Ok(())
                })
                .property("y", |widget, value, _| {
                    widget.y = value.as_i64().ok_or_else(|| HandlerError::invalid("y", "not an integer"))?;
                    Ok(())
                })
                .property("children", |widget, value, _| {
                    widget.children = value
                        .as_array()
                        .into_iter()
                        .flatten()
                        .filter_map(|child| child.as_str().map(str::to_string))
                        .collect();
                    Ok(())
                })
                .method("fail", |_, _, _| Err(HandlerError::Failed("boom".to_string())))
                .method("wait", |_, _, ctx| {
                    ctx.pause();
                    Ok(())
                })
                .method("select", |_, _, ctx| {
                    let target = ctx.target().to_string();
                    ctx.emit(LocalEvent::Selection {
                        target,
                        default: false,
                        detail: Properties::new(),
                    });
                    Ok(())
                })
                .events(&["Selection", "MouseDown"])
                .listener(|widget, event, enabled, _| {
                    widget.listening.push((event.to_string(), enabled));
                    Ok(())
                })
                .destructor(move |_, ctx| destroyed.borrow_mut().push(ctx.target().to_string()))
                .children(|widget| widget.children.clone())
                .build(),
        );
        registry.register_handler(HandlerBuilder::<Widget>::new("test.Service").build());
        registry
    }

    fn run(
        processor: &mut MessageProcessor,
        registry: &mut ObjectRegistry,
        operations: Vec<Operation>,
    ) -> Result<ProcessOutcome, ProcessError> {
        let mut info = ConnectionInfo::new("mirror");
        processor.process_message(Message::new(operations), registry, &mut info)
    }

    #[test]
    fn later_set_wins_within_one_message() {
        let mut registry = registry_with(Rc::default());
        let mut processor = MessageProcessor::new();

        let outcome = run(
            &mut processor,
            &mut registry,
            vec![create("a", json!({})), set("a", json!({"x": 1})), set("a", json!({"x": 2}))],
        )
        .expect("process");

        assert_eq!(outcome, ProcessOutcome::Completed);
        assert_eq!(registry.object::<Widget>("a").map(|w| w.x), Some(2));
    }

    #[test]
    fn create_applies_inline_properties() {
        let mut registry = registry_with(Rc::default());
        let mut processor = MessageProcessor::new();

        run(&mut processor, &mut registry, vec![create("a", json!({"x": 4, "y": 5, "z": 6}))])
            .expect("process");

        let widget = registry.object::<Widget>("a").expect("created");
        assert_eq!((widget.x, widget.y), (4, 5));
    }

    #[test]
    fn operation_after_destroy_reports_target_not_found() {
        let mut registry = registry_with(Rc::default());
        let mut processor = MessageProcessor::new();

        run(&mut processor, &mut registry, vec![create("a", json!({})), destroy("a")])
            .expect("process");
        let err = run(&mut processor, &mut registry, vec![set("a", json!({"x": 1}))])
            .expect_err("destroyed target");

        assert!(matches!(err.root_cause(), ProcessError::TargetNotFound(id) if id == "a"));
        assert!(err.to_string().contains("target not found"), "{err}");
    }

    #[test]
    fn fault_keeps_applied_prefix_and_skips_the_rest() {
        let mut registry = registry_with(Rc::default());
        let mut processor = MessageProcessor::new();
        run(&mut processor, &mut registry, vec![create("a", json!({})), create("b", json!({}))])
            .expect("setup");

        let err = run(
            &mut processor,
            &mut registry,
            vec![set("a", json!({"x": 1})), call("a", "fail"), set("b", json!({"y": 1}))],
        )
        .expect_err("fault");

        assert_eq!(registry.object::<Widget>("a").map(|w| w.x), Some(1));
        assert_eq!(registry.object::<Widget>("b").map(|w| w.y), Some(0));

        let ProcessError::OperationFailed(fault) = err else {
            panic!("expected operation fault");
        };
        assert_eq!(fault.kind, "call");
        assert_eq!(fault.target, "a");
        assert_eq!(fault.index, 1);
        assert_eq!(fault.type_name.as_deref(), Some("test.Widget"));
    }

    #[test]
    fn service_types_cannot_be_created() {
        let mut registry = registry_with(Rc::default());
        let mut processor = MessageProcessor::new();

        let err = run(
            &mut processor,
            &mut registry,
            vec![Operation::Create {
                target: "svc".to_string(),
                type_name: "test.Service".to_string(),
                properties: Properties::new(),
            }],
        )
        .expect_err("service create");

        assert!(matches!(err.root_cause(), ProcessError::UnsupportedOperation(_)));
        assert!(!registry.contains("svc"));
    }

    #[test]
    fn undeclared_method_is_rejected() {
        let mut registry = registry_with(Rc::default());
        let mut processor = MessageProcessor::new();

        let err = run(&mut processor, &mut registry, vec![create("a", json!({})), call("a", "dance")])
            .expect_err("unknown method");
        assert!(matches!(err.root_cause(), ProcessError::UnknownMethod { method, .. } if method == "dance"));
    }

    #[test]
    fn listen_updates_declared_events_only() {
        let mut registry = registry_with(Rc::default());
        let mut processor = MessageProcessor::new();
        let mut events = BTreeMap::new();
        events.insert("Selection".to_string(), true);
        events.insert("Bogus".to_string(), true);

        run(
            &mut processor,
            &mut registry,
            vec![
                create("a", json!({})),
                Operation::Listen {
                    target: "a".to_string(),
                    events,
                },
            ],
        )
        .expect("process");

        assert!(registry.is_listening("a", "Selection"));
        assert!(!registry.is_listening("a", "Bogus"));
        assert_eq!(
            registry.object::<Widget>("a").map(|w| w.listening.clone()),
            Some(vec![("Selection".to_string(), true)])
        );
    }

    #[test]
    fn destroy_runs_parent_before_children_and_unregisters_all() {
        let destroyed = Rc::new(RefCell::new(Vec::new()));
        let mut registry = registry_with(destroyed.clone());
        let mut processor = MessageProcessor::new();

        run(
            &mut processor,
            &mut registry,
            vec![
                create("child-1", json!({})),
                create("child-2", json!({})),
                create("parent", json!({"children": ["child-1", "child-2", "gone"]})),
                destroy("parent"),
            ],
        )
        .expect("process");

        assert_eq!(*destroyed.borrow(), ["parent", "child-1", "child-2"]);
        assert!(registry.is_empty());
    }

    #[test]
    fn pause_resumes_from_the_next_operation() {
        let mut registry = registry_with(Rc::default());
        let mut processor = MessageProcessor::new();

        let outcome = run(
            &mut processor,
            &mut registry,
            vec![create("a", json!({})), call("a", "wait"), set("a", json!({"x": 9}))],
        )
        .expect("process");

        assert_eq!(outcome, ProcessOutcome::Paused);
        assert!(processor.is_paused());
        assert_eq!(registry.object::<Widget>("a").map(|w| w.x), Some(0));

        assert_eq!(processor.resume(&mut registry).expect("resume"), ProcessOutcome::Completed);
        assert_eq!(registry.object::<Widget>("a").map(|w| w.x), Some(9));
        assert!(!processor.is_paused());
    }

    #[test]
    fn second_message_while_paused_is_rejected() {
        let mut registry = registry_with(Rc::default());
        let mut processor = MessageProcessor::new();

        run(&mut processor, &mut registry, vec![create("a", json!({})), call("a", "wait")])
            .expect("process");
        let err = run(&mut processor, &mut registry, vec![set("a", json!({"x": 1}))])
            .expect_err("already paused");

        assert!(matches!(err, ProcessError::PauseAlreadyPending));
        assert!(processor.is_paused());
    }

    #[test]
    fn resume_without_pending_continuation_is_an_error() {
        let mut registry = registry_with(Rc::default());
        let mut processor = MessageProcessor::new();
        assert!(matches!(
            processor.resume(&mut registry),
            Err(ProcessError::NothingToResume)
        ));
    }

    #[test]
    fn head_updates_connection_and_redirect_short_circuits() {
        let mut registry = registry_with(Rc::default());
        let mut processor = MessageProcessor::new();
        let mut info = ConnectionInfo::new("mirror");

        let message = Message {
            head: Head {
                connection_id: Some("c-3".to_string()),
                redirect: Some("https://example.org/bye".to_string()),
                ..Head::default()
            },
            operations: vec![create("a", json!({}))],
        };

        let outcome = processor
            .process_message(message, &mut registry, &mut info)
            .expect("process");

        assert_eq!(outcome, ProcessOutcome::Redirected("https://example.org/bye".to_string()));
        assert_eq!(info.request_url(), "mirror?cid=c-3");
        assert!(registry.is_empty());
    }

    #[test]
    fn handler_side_effects_are_collected_as_local_events() {
        let mut registry = registry_with(Rc::default());
        let mut processor = MessageProcessor::new();

        run(&mut processor, &mut registry, vec![create("a", json!({})), call("a", "select")])
            .expect("process");

        let events = processor.take_local_events();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], LocalEvent::Selection { target, .. } if target == "a"));
        assert!(processor.take_local_events().is_empty());
    }
}
