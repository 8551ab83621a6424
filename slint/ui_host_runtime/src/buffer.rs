use crate::protocol::{ClientOperation, Properties};
use serde_json::Value;

/// Operations accumulated between two flushes, kept in enqueue order.
///
/// Property sets collapse per target and property (last write wins), a
/// notification replaces a pending one of the same target and event, and
/// calls are never merged.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct OutboundBuffer {
    operations: Vec<ClientOperation>,
}

impl OutboundBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_property(&mut self, target: &str, name: &str, value: Value) {
        let merge_into_last = matches!(
            self.operations.last(),
            Some(ClientOperation::Set { target: last_target, .. }) if last_target == target
        );
        let keep = if merge_into_last {
            self.operations.len() - 1
        } else {
            self.operations.len()
        };

        // An older write to the same property is superseded; drop it so the
        // message carries one effect per target and property.
        for operation in &mut self.operations[..keep] {
            if let ClientOperation::Set {
                target: earlier,
                properties,
            } = operation
            {
                if earlier == target {
                    properties.remove(name);
                }
            }
        }
        self.operations.retain(|operation| {
            !matches!(operation, ClientOperation::Set { properties, .. } if properties.is_empty())
        });

        if merge_into_last {
            if let Some(ClientOperation::Set { properties, .. }) = self.operations.last_mut() {
                properties.insert(name.to_string(), value);
                return;
            }
        }

        let mut properties = Properties::new();
        properties.insert(name.to_string(), value);
        self.operations.push(ClientOperation::Set {
            target: target.to_string(),
            properties,
        });
    }

    pub fn notify(&mut self, target: &str, event: &str, properties: Properties) {
        let pending = self.operations.iter_mut().find_map(|operation| match operation {
            ClientOperation::Notify {
                target: pending_target,
                event: pending_event,
                properties: pending_properties,
            } if pending_target == target && pending_event == event => Some(pending_properties),
            _ => None,
        });

        match pending {
            Some(pending) => pending.extend(properties),
            None => self.operations.push(ClientOperation::Notify {
                target: target.to_string(),
                event: event.to_string(),
                properties,
            }),
        }
    }

    /// Appends a notification that is never merged with another one. Key
    /// events use this so each keystroke reaches the server.
    pub fn notify_distinct(&mut self, target: &str, event: &str, properties: Properties) {
        self.operations.push(ClientOperation::Notify {
            target: target.to_string(),
            event: event.to_string(),
            properties,
        });
    }

    pub fn call(&mut self, target: &str, method: &str, properties: Properties) {
        self.operations.push(ClientOperation::Call {
            target: target.to_string(),
            method: method.to_string(),
            properties,
        });
    }

    pub fn has_notify(&self, target: &str, event: &str) -> bool {
        self.operations.iter().any(|operation| {
            matches!(
                operation,
                ClientOperation::Notify { target: pending_target, event: pending_event, .. }
                    if pending_target == target && pending_event == event
            )
        })
    }

    pub fn operations(&self) -> &[ClientOperation] {
        &self.operations
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn take(&mut self) -> Vec<ClientOperation> {
        std::mem::take(&mut self.operations)
    }
}
