//! Generic widget handlers for the bundled host.
//!
//! Every type in [`MIRROR_TYPES`] is mirrored as a [`MirrorWidget`] that keeps
//! the properties it understands. The host renders them as a flat list of
//! indented rows.

use crate::error::HandlerError;
use crate::input::{LocalEvent, WidgetTree};
use crate::protocol::Properties;
use crate::registry::{HandlerBuilder, HandlerDescriptor, ObjectRegistry};
use serde_json::Value;
use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;

pub const MIRROR_TYPES: &[&str] = &[
    "rwt.widgets.Shell",
    "rwt.widgets.Composite",
    "rwt.widgets.Label",
    "rwt.widgets.Button",
    "rwt.widgets.Text",
    "rwt.widgets.List",
    "rwt.widgets.ListItem",
];

const MIRROR_PROPERTIES: &[&str] = &["parent", "text", "enabled", "toolTip", "items"];

const MIRROR_EVENTS: &[&str] = &[
    "MouseDown",
    "MouseUp",
    "MouseDoubleClick",
    "KeyDown",
    "Traverse",
    "FocusIn",
    "FocusOut",
    "Selection",
    "DefaultSelection",
    "MenuDetect",
    "Help",
];

#[derive(Debug, Clone, PartialEq)]
pub struct MirrorWidget {
    pub type_name: String,
    pub serial: u64,
    pub properties: Properties,
    pub selection: Option<i64>,
}

impl MirrorWidget {
    pub fn parent(&self) -> Option<&str> {
        self.properties.get("parent").and_then(Value::as_str)
    }

    pub fn text(&self) -> &str {
        self.properties
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn is_enabled(&self) -> bool {
        self.properties
            .get("enabled")
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }

    /// Items are parts of a control, not controls of their own.
    pub fn is_control(&self) -> bool {
        !self.type_name.ends_with("Item")
    }

    pub fn is_editable(&self) -> bool {
        self.type_name == "rwt.widgets.Text"
    }
}

/// Registers a handler for each of [`MIRROR_TYPES`].
pub fn register(registry: &mut ObjectRegistry) {
    let serials = Rc::new(Cell::new(0_u64));
    for type_name in MIRROR_TYPES {
        registry.register_handler(mirror_handler(type_name, serials.clone()));
    }
}

fn mirror_handler(type_name: &str, serials: Rc<Cell<u64>>) -> HandlerDescriptor {
    let owned_type = type_name.to_string();
    let mut builder = HandlerBuilder::<MirrorWidget>::new(type_name).factory(move |_| {
        let serial = serials.get();
        serials.set(serial + 1);
        Ok(MirrorWidget {
            type_name: owned_type.clone(),
            serial,
            properties: Properties::new(),
            selection: None,
        })
    });

    for name in MIRROR_PROPERTIES {
        let key = name.to_string();
        builder = builder.property(name, move |widget, value, _| {
            widget.properties.insert(key.clone(), value.clone());
            Ok(())
        });
    }

    builder
        .property("selection", |widget, value, ctx| {
            let selection = match value {
                Value::Null => None,
                other => Some(
                    other
                        .as_i64()
                        .ok_or_else(|| HandlerError::invalid("selection", "expected an index"))?,
                ),
            };
            if widget.selection != selection {
                widget.selection = selection;
                // Lists fire selection when their selection changes, even
                // when the server changed it.
                let target = ctx.target().to_string();
                ctx.emit(LocalEvent::Selection {
                    target,
                    default: false,
                    detail: Properties::new(),
                });
            }
            Ok(())
        })
        .method("focus", |_, _, ctx| {
            let target = ctx.target().to_string();
            ctx.emit(LocalEvent::Focus {
                target,
                gained: true,
            });
            Ok(())
        })
        .events(MIRROR_EVENTS)
        .build()
}

/// Owned snapshot of the mirrored hierarchy.
#[derive(Debug, Clone, Default)]
pub struct MirrorTree {
    nodes: HashMap<String, TreeNode>,
}

#[derive(Debug, Clone)]
struct TreeNode {
    parent: Option<String>,
    control: bool,
    enabled: bool,
}

impl MirrorTree {
    pub fn snapshot(registry: &ObjectRegistry) -> Self {
        let nodes = registry
            .ids()
            .filter_map(|id| {
                registry.object::<MirrorWidget>(id).map(|widget| {
                    (
                        id.to_string(),
                        TreeNode {
                            parent: widget.parent().map(str::to_string),
                            control: widget.is_control(),
                            enabled: widget.is_enabled(),
                        },
                    )
                })
            })
            .collect();
        Self { nodes }
    }

    /// `start` followed by each of its ancestors.
    pub fn ancestry(&self, start: &str) -> Vec<String> {
        let mut path = vec![start.to_string()];
        let mut current = self.parent(start);
        while let Some(id) = current {
            if path.iter().any(|seen| seen == id) {
                break;
            }
            path.push(id.to_string());
            current = self.parent(id);
        }
        path
    }
}

impl WidgetTree for MirrorTree {
    fn parent(&self, id: &str) -> Option<&str> {
        self.nodes.get(id).and_then(|node| node.parent.as_deref())
    }

    fn is_control(&self, id: &str) -> bool {
        self.nodes.get(id).is_some_and(|node| node.control)
    }

    fn is_enabled(&self, id: &str) -> bool {
        self.nodes.get(id).is_some_and(|node| node.enabled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorRow {
    pub id: String,
    pub kind: String,
    pub label: String,
    pub depth: usize,
    pub enabled: bool,
    pub editable: bool,
}

/// Depth-first rows, siblings in creation order.
pub fn rows(registry: &ObjectRegistry) -> Vec<MirrorRow> {
    let mut widgets: Vec<(&str, &MirrorWidget)> = registry
        .ids()
        .filter_map(|id| registry.object::<MirrorWidget>(id).map(|widget| (id, widget)))
        .collect();
    widgets.sort_by_key(|(_, widget)| widget.serial);

    let mut children: HashMap<Option<&str>, Vec<(&str, &MirrorWidget)>> = HashMap::new();
    for &(id, widget) in &widgets {
        let parent = widget
            .parent()
            .filter(|parent| registry.object::<MirrorWidget>(parent).is_some());
        children.entry(parent).or_default().push((id, widget));
    }

    let mut rows = Vec::with_capacity(widgets.len());
    let mut stack: Vec<(&str, &MirrorWidget, usize)> = children
        .get(&None)
        .map(|roots| roots.iter().rev().map(|(id, widget)| (*id, *widget, 0)).collect())
        .unwrap_or_default();

    while let Some((id, widget, depth)) = stack.pop() {
        if rows.len() > widgets.len() {
            break;
        }
        rows.push(MirrorRow {
            id: id.to_string(),
            kind: widget.type_name.rsplit('.').next().unwrap_or_default().to_string(),
            label: widget.text().to_string(),
            depth,
            enabled: widget.is_enabled(),
            editable: widget.is_editable(),
        });
        if let Some(kids) = children.get(&Some(id)) {
            stack.extend(kids.iter().rev().map(|(kid, kid_widget)| (*kid, *kid_widget, depth + 1)));
        }
    }
    rows
}
