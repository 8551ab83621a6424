//! Handler descriptors and the object registry the message processor
//! resolves targets against.
//!
//! Every object type is described by a [`HandlerDescriptor`] built once at
//! registration time. Properties and methods are explicit dispatch tables
//! keyed by name; nothing is looked up by synthesizing setter names at
//! runtime.

use crate::error::HandlerError;
use crate::input::LocalEvent;
use crate::protocol::Properties;
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

type Factory = Box<dyn Fn(&Properties) -> Result<Box<dyn Any>, HandlerError>>;
type Setter = Box<dyn Fn(&mut dyn Any, &Value, &mut OpContext) -> Result<(), HandlerError>>;
type Method = Box<dyn Fn(&mut dyn Any, &Properties, &mut OpContext) -> Result<(), HandlerError>>;
type ListenerHook =
    Box<dyn Fn(&mut dyn Any, &str, bool, &mut OpContext) -> Result<(), HandlerError>>;
type Destructor = Box<dyn Fn(&mut dyn Any, &mut OpContext)>;
type Children = Box<dyn Fn(&dyn Any) -> Vec<String>>;

/// Per-operation context handed to handler callbacks.
#[derive(Debug, Default)]
pub struct OpContext {
    target: String,
    pause_requested: bool,
    local_events: Vec<LocalEvent>,
}

impl OpContext {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Self::default()
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Asks the processor to stop after the current operation. Processing
    /// continues from the next operation once the session is resumed.
    pub fn pause(&mut self) {
        self.pause_requested = true;
    }

    pub fn pause_requested(&self) -> bool {
        self.pause_requested
    }

    /// Records a local event fired as a side effect of applying the
    /// operation, e.g. a list whose selection changed because the server set
    /// its items.
    pub fn emit(&mut self, event: LocalEvent) {
        self.local_events.push(event);
    }

    pub(crate) fn take_local_events(&mut self) -> Vec<LocalEvent> {
        std::mem::take(&mut self.local_events)
    }
}

pub struct HandlerDescriptor {
    type_name: String,
    factory: Option<Factory>,
    property_order: Vec<String>,
    setters: HashMap<String, Setter>,
    methods: HashMap<String, Method>,
    events: Vec<String>,
    listener: Option<ListenerHook>,
    destructor: Option<Destructor>,
    children: Option<Children>,
}

impl std::fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("type_name", &self.type_name)
            .field("service", &self.is_service())
            .field("properties", &self.property_order)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .field("events", &self.events)
            .finish()
    }
}

impl HandlerDescriptor {
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Service handlers describe objects the client provides itself; the
    /// server may address them but never create them.
    pub fn is_service(&self) -> bool {
        self.factory.is_none()
    }

    pub fn properties(&self) -> &[String] {
        &self.property_order
    }

    pub fn events(&self) -> &[String] {
        &self.events
    }

    pub fn declares_event(&self, event: &str) -> bool {
        self.events.iter().any(|declared| declared == event)
    }

    pub fn declares_method(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    pub(crate) fn create(&self, properties: &Properties) -> Option<Result<Box<dyn Any>, HandlerError>> {
        self.factory.as_ref().map(|factory| factory(properties))
    }

    /// Applies every declared property present in `properties`, in declared
    /// order. Undeclared properties are ignored.
    pub(crate) fn apply_properties(
        &self,
        object: &mut dyn Any,
        properties: &Properties,
        ctx: &mut OpContext,
    ) -> Result<(), HandlerError> {
        for name in &self.property_order {
            let (Some(value), Some(setter)) = (properties.get(name), self.setters.get(name)) else {
                continue;
            };
            setter(object, value, ctx)?;
        }
        Ok(())
    }

    pub(crate) fn invoke(
        &self,
        object: &mut dyn Any,
        method: &str,
        properties: &Properties,
        ctx: &mut OpContext,
    ) -> Option<Result<(), HandlerError>> {
        self.methods
            .get(method)
            .map(|handler| handler(object, properties, ctx))
    }

    pub(crate) fn wire_listener(
        &self,
        object: &mut dyn Any,
        event: &str,
        enabled: bool,
        ctx: &mut OpContext,
    ) -> Result<(), HandlerError> {
        match &self.listener {
            Some(hook) => hook(object, event, enabled, ctx),
            None => Ok(()),
        }
    }

    pub(crate) fn destroy(&self, object: &mut dyn Any, ctx: &mut OpContext) {
        if let Some(destructor) = &self.destructor {
            destructor(object, ctx);
        }
    }

    pub(crate) fn children_of(&self, object: &dyn Any) -> Vec<String> {
        self.children
            .as_ref()
            .map(|children| children(object))
            .unwrap_or_default()
    }
}

/// Typed builder for a [`HandlerDescriptor`] whose objects are `T`.
pub struct HandlerBuilder<T: 'static> {
    descriptor: HandlerDescriptor,
    _object: std::marker::PhantomData<fn() -> T>,
}

impl<T: 'static> HandlerBuilder<T> {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            descriptor: HandlerDescriptor {
                type_name: type_name.into(),
                factory: None,
                property_order: Vec::new(),
                setters: HashMap::new(),
                methods: HashMap::new(),
                events: Vec::new(),
                listener: None,
                destructor: None,
                children: None,
            },
            _object: std::marker::PhantomData,
        }
    }

    pub fn factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&Properties) -> Result<T, HandlerError> + 'static,
    {
        self.descriptor.factory = Some(Box::new(move |properties: &Properties| {
            factory(properties).map(|object| Box::new(object) as Box<dyn Any>)
        }));
        self
    }

    pub fn property<F>(mut self, name: &str, setter: F) -> Self
    where
        F: Fn(&mut T, &Value, &mut OpContext) -> Result<(), HandlerError> + 'static,
    {
        if !self.descriptor.setters.contains_key(name) {
            self.descriptor.property_order.push(name.to_string());
        }
        self.descriptor.setters.insert(
            name.to_string(),
            Box::new(move |object: &mut dyn Any, value: &Value, ctx: &mut OpContext| {
                setter(downcast_mut::<T>(object)?, value, ctx)
            }),
        );
        self
    }

    pub fn method<F>(mut self, name: &str, method: F) -> Self
    where
        F: Fn(&mut T, &Properties, &mut OpContext) -> Result<(), HandlerError> + 'static,
    {
        self.descriptor.methods.insert(
            name.to_string(),
            Box::new(move |object: &mut dyn Any, properties: &Properties, ctx: &mut OpContext| {
                method(downcast_mut::<T>(object)?, properties, ctx)
            }),
        );
        self
    }

    pub fn events(mut self, events: &[&str]) -> Self {
        self.descriptor
            .events
            .extend(events.iter().map(|event| event.to_string()));
        self
    }

    /// Imperative listener wiring, invoked for each declared event a
    /// `listen` operation toggles.
    pub fn listener<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut T, &str, bool, &mut OpContext) -> Result<(), HandlerError> + 'static,
    {
        self.descriptor.listener = Some(Box::new(
            move |object: &mut dyn Any, event: &str, enabled: bool, ctx: &mut OpContext| {
                hook(downcast_mut::<T>(object)?, event, enabled, ctx)
            },
        ));
        self
    }

    pub fn destructor<F>(mut self, destructor: F) -> Self
    where
        F: Fn(&mut T, &mut OpContext) + 'static,
    {
        self.descriptor.destructor = Some(Box::new(move |object: &mut dyn Any, ctx: &mut OpContext| {
            if let Some(object) = object.downcast_mut::<T>() {
                destructor(object, ctx);
            }
        }));
        self
    }

    /// Ids of the children destroyed together with an object of this type.
    pub fn children<F>(mut self, children: F) -> Self
    where
        F: Fn(&T) -> Vec<String> + 'static,
    {
        self.descriptor.children = Some(Box::new(move |object: &dyn Any| {
            object
                .downcast_ref::<T>()
                .map(&children)
                .unwrap_or_default()
        }));
        self
    }

    pub fn build(self) -> HandlerDescriptor {
        self.descriptor
    }
}

fn downcast_mut<T: 'static>(object: &mut dyn Any) -> Result<&mut T, HandlerError> {
    object.downcast_mut::<T>().ok_or(HandlerError::TypeMismatch {
        expected: std::any::type_name::<T>(),
    })
}

pub(crate) struct RegistryEntry {
    pub(crate) object: Box<dyn Any>,
    pub(crate) handler: Rc<HandlerDescriptor>,
    remote_listeners: BTreeMap<String, bool>,
}

/// Maps target ids to live objects and type names to handlers.
#[derive(Default)]
pub struct ObjectRegistry {
    handlers: HashMap<String, Rc<HandlerDescriptor>>,
    entries: HashMap<String, RegistryEntry>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_handler(&mut self, handler: HandlerDescriptor) {
        self.handlers
            .insert(handler.type_name.clone(), Rc::new(handler));
    }

    pub fn handler(&self, type_name: &str) -> Option<Rc<HandlerDescriptor>> {
        self.handlers.get(type_name).cloned()
    }

    /// Registers an object under `id`, replacing any previous entry.
    pub fn add(&mut self, id: impl Into<String>, object: Box<dyn Any>, handler: Rc<HandlerDescriptor>) {
        self.entries.insert(
            id.into(),
            RegistryEntry {
                object,
                handler,
                remote_listeners: BTreeMap::new(),
            },
        );
    }

    /// Registers a client-provided service object whose handler has already
    /// been registered by type name.
    pub fn add_service<T: 'static>(&mut self, id: impl Into<String>, type_name: &str, object: T) -> bool {
        let Some(handler) = self.handler(type_name) else {
            return false;
        };
        self.add(id, Box::new(object), handler);
        true
    }

    pub(crate) fn entry_mut(&mut self, id: &str) -> Option<&mut RegistryEntry> {
        self.entries.get_mut(id)
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<RegistryEntry> {
        self.entries.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn type_of(&self, id: &str) -> Option<&str> {
        self.entries.get(id).map(|entry| entry.handler.type_name())
    }

    /// `resolve(id) -> {object, handler}`.
    pub fn resolve(&self, id: &str) -> Option<(&dyn Any, &HandlerDescriptor)> {
        self.entries
            .get(id)
            .map(|entry| (entry.object.as_ref(), entry.handler.as_ref()))
    }

    pub fn object<T: 'static>(&self, id: &str) -> Option<&T> {
        self.entries
            .get(id)
            .and_then(|entry| entry.object.downcast_ref::<T>())
    }

    pub fn object_mut<T: 'static>(&mut self, id: &str) -> Option<&mut T> {
        self.entries
            .get_mut(id)
            .and_then(|entry| entry.object.downcast_mut::<T>())
    }

    /// Whether the server asked to be notified of `event` on `id`.
    pub fn is_listening(&self, id: &str, event: &str) -> bool {
        self.entries
            .get(id)
            .and_then(|entry| entry.remote_listeners.get(event).copied())
            .unwrap_or(false)
    }

    pub(crate) fn set_remote_listener(&mut self, id: &str, event: &str, enabled: bool) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) => {
                entry.remote_listeners.insert(event.to_string(), enabled);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Default)]
    struct Label {
        text: String,
        calls: Vec<String>,
    }

    fn label_handler() -> HandlerDescriptor {
        HandlerBuilder::<Label>::new("test.Label")
            .factory(|_| Ok(Label::default()))
            .property("text", |label, value, _| {
                label.text = value
                    .as_str()
                    .ok_or_else(|| HandlerError::invalid("text", "expected a string"))?
                    .to_string();
                Ok(())
            })
            .method("flash", |label, _, _| {
                label.calls.push("flash".to_string());
                Ok(())
            })
            .events(&["Selection"])
            .build()
    }

    fn props(value: Value) -> Properties {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn setters_apply_declared_properties_and_ignore_unknown() {
        let handler = label_handler();
        let mut object: Box<dyn Any> = Box::new(Label::default());
        let mut ctx = OpContext::new("w2");

        handler
            .apply_properties(object.as_mut(), &props(json!({"text": "hi", "bogus": 1})), &mut ctx)
            .expect("apply");

        let label = object.downcast_ref::<Label>().expect("label");
        assert_eq!(label.text, "hi");
    }

    #[test]
    fn setter_on_wrong_object_type_reports_mismatch() {
        let handler = label_handler();
        let mut object: Box<dyn Any> = Box::new(42_u32);
        let mut ctx = OpContext::new("w2");

        let err = handler
            .apply_properties(object.as_mut(), &props(json!({"text": "hi"})), &mut ctx)
            .expect_err("wrong type");
        assert!(matches!(err, HandlerError::TypeMismatch { .. }));
    }

    #[test]
    fn service_handler_has_no_factory() {
        let handler = HandlerBuilder::<Label>::new("test.Service").build();
        assert!(handler.is_service());
        assert!(handler.create(&Properties::new()).is_none());
    }

    #[test]
    fn registry_tracks_remote_listeners_per_target() {
        let mut registry = ObjectRegistry::new();
        registry.register_handler(label_handler());
        assert!(registry.add_service("w2", "test.Label", Label::default()));

        assert!(!registry.is_listening("w2", "Selection"));
        assert!(registry.set_remote_listener("w2", "Selection", true));
        assert!(registry.is_listening("w2", "Selection"));
        assert!(!registry.set_remote_listener("w3", "Selection", true));
        assert_eq!(registry.type_of("w2"), Some("test.Label"));
    }

    #[test]
    fn method_dispatch_only_reaches_declared_methods() {
        let handler = label_handler();
        let mut object: Box<dyn Any> = Box::new(Label::default());
        let mut ctx = OpContext::new("w2");

        assert!(handler.declares_method("flash"));
        assert!(handler
            .invoke(object.as_mut(), "flash", &Properties::new(), &mut ctx)
            .is_some());
        assert!(handler
            .invoke(object.as_mut(), "explode", &Properties::new(), &mut ctx)
            .is_none());
        assert_eq!(object.downcast_ref::<Label>().expect("label").calls, ["flash"]);
    }
}
