use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::io::{self, Read, Write};

pub const CLIENT_TO_SERVER_CAP: usize = 65_536;
pub const SERVER_TO_CLIENT_CAP: usize = 1_048_576;

pub type Properties = Map<String, Value>;

/// Message metadata. Inbound heads may carry connection updates, a redirect
/// or an application error; outbound heads carry the request counter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Head {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_counter: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub shutdown: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub head: Head,
    #[serde(default)]
    pub operations: Vec<Operation>,
}

impl Message {
    pub fn new(operations: Vec<Operation>) -> Self {
        Self {
            head: Head::default(),
            operations,
        }
    }
}

/// Server to client instruction. Encoded as a JSON array whose first element
/// is the operation tag, e.g. `["set", "w3", {"text": "OK"}]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum Operation {
    Create {
        target: String,
        type_name: String,
        properties: Properties,
    },
    Set {
        target: String,
        properties: Properties,
    },
    Listen {
        target: String,
        events: BTreeMap<String, bool>,
    },
    Call {
        target: String,
        method: String,
        properties: Properties,
    },
    Destroy {
        target: String,
    },
}

impl Operation {
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Create { .. } => "create",
            Operation::Set { .. } => "set",
            Operation::Listen { .. } => "listen",
            Operation::Call { .. } => "call",
            Operation::Destroy { .. } => "destroy",
        }
    }

    pub fn target(&self) -> &str {
        match self {
            Operation::Create { target, .. }
            | Operation::Set { target, .. }
            | Operation::Listen { target, .. }
            | Operation::Call { target, .. }
            | Operation::Destroy { target } => target,
        }
    }

    /// Properties carried by the operation, if any, for diagnostics.
    pub fn property_dump(&self) -> Option<Value> {
        match self {
            Operation::Create { properties, .. }
            | Operation::Set { properties, .. }
            | Operation::Call { properties, .. } => Some(Value::Object(properties.clone())),
            Operation::Listen { events, .. } => Some(json!(events)),
            Operation::Destroy { .. } => None,
        }
    }
}

impl TryFrom<Value> for Operation {
    type Error = ProtocolError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Array(items) = value else {
            return Err(ProtocolError::MalformedOperation(
                "operation must be an array".to_string(),
            ));
        };

        let mut items = items.into_iter();
        let tag = next_string(&mut items, "operation tag")?;
        let target = next_string(&mut items, "target id")?;

        let operation = match tag.as_str() {
            "create" => Operation::Create {
                target,
                type_name: next_string(&mut items, "type")?,
                properties: next_properties(&mut items)?,
            },
            "set" => Operation::Set {
                target,
                properties: next_properties(&mut items)?,
            },
            "listen" => {
                let events = next_properties(&mut items)?
                    .into_iter()
                    .map(|(event, flag)| match flag {
                        Value::Bool(flag) => Ok((event, flag)),
                        other => Err(ProtocolError::MalformedOperation(format!(
                            "listen flag for {event} must be a boolean, got {other}"
                        ))),
                    })
                    .collect::<Result<_, _>>()?;
                Operation::Listen { target, events }
            }
            "call" => Operation::Call {
                target,
                method: next_string(&mut items, "method name")?,
                properties: next_properties(&mut items)?,
            },
            "destroy" => Operation::Destroy { target },
            other => {
                return Err(ProtocolError::MalformedOperation(format!(
                    "unknown operation tag '{other}'"
                )));
            }
        };

        Ok(operation)
    }
}

impl From<Operation> for Value {
    fn from(operation: Operation) -> Self {
        match operation {
            Operation::Create {
                target,
                type_name,
                properties,
            } => json!(["create", target, type_name, properties]),
            Operation::Set { target, properties } => json!(["set", target, properties]),
            Operation::Listen { target, events } => json!(["listen", target, events]),
            Operation::Call {
                target,
                method,
                properties,
            } => json!(["call", target, method, properties]),
            Operation::Destroy { target } => json!(["destroy", target]),
        }
    }
}

fn next_string(
    items: &mut impl Iterator<Item = Value>,
    what: &str,
) -> Result<String, ProtocolError> {
    match items.next() {
        Some(Value::String(value)) => Ok(value),
        Some(other) => Err(ProtocolError::MalformedOperation(format!(
            "{what} must be a string, got {other}"
        ))),
        None => Err(ProtocolError::MalformedOperation(format!("missing {what}"))),
    }
}

fn next_properties(
    items: &mut impl Iterator<Item = Value>,
) -> Result<Properties, ProtocolError> {
    match items.next() {
        Some(Value::Object(map)) => Ok(map),
        Some(Value::Null) | None => Ok(Properties::new()),
        Some(other) => Err(ProtocolError::MalformedOperation(format!(
            "properties must be an object, got {other}"
        ))),
    }
}

/// Client to server operation accumulated in the outbound buffer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(into = "Value")]
pub enum ClientOperation {
    Set {
        target: String,
        properties: Properties,
    },
    Notify {
        target: String,
        event: String,
        properties: Properties,
    },
    Call {
        target: String,
        method: String,
        properties: Properties,
    },
}

impl ClientOperation {
    pub fn target(&self) -> &str {
        match self {
            ClientOperation::Set { target, .. }
            | ClientOperation::Notify { target, .. }
            | ClientOperation::Call { target, .. } => target,
        }
    }
}

impl From<ClientOperation> for Value {
    fn from(operation: ClientOperation) -> Self {
        match operation {
            ClientOperation::Set { target, properties } => json!(["set", target, properties]),
            ClientOperation::Notify {
                target,
                event,
                properties,
            } => json!(["notify", target, event, properties]),
            ClientOperation::Call {
                target,
                method,
                properties,
            } => json!(["call", target, method, properties]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientMessage {
    pub head: Head,
    pub operations: Vec<ClientOperation>,
}

pub fn encode_client_message(message: &ClientMessage) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(message).map_err(ProtocolError::Encode)
}

pub fn decode_message(payload: &[u8]) -> Result<Message, ProtocolError> {
    serde_json::from_slice(payload).map_err(ProtocolError::Decode)
}

pub fn read_frame(reader: &mut impl Read, max_payload: usize) -> io::Result<Vec<u8>> {
    let mut len_buf = [0_u8; 4];
    reader.read_exact(&mut len_buf)?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_payload {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len} > {max_payload}"),
        ));
    }

    let mut payload = vec![0_u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

pub fn write_frame(writer: &mut impl Write, payload: &[u8], max_payload: usize) -> io::Result<()> {
    if payload.len() > max_payload {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {} > {}", payload.len(), max_payload),
        ));
    }

    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "payload exceeds u32"))?;

    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn truncated_frame_is_rejected() {
        let data = vec![0, 0, 0, 5, b'a', b'b'];
        let mut cursor = Cursor::new(data);
        let err = read_frame(&mut cursor, CLIENT_TO_SERVER_CAP).expect_err("expected eof");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let len = (CLIENT_TO_SERVER_CAP as u32) + 1;
        let data = len.to_be_bytes().to_vec();
        let mut cursor = Cursor::new(data);
        let err = read_frame(&mut cursor, CLIENT_TO_SERVER_CAP).expect_err("expected too large");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn frame_length_is_big_endian() {
        let mut out = Vec::new();
        write_frame(&mut out, b"abc", CLIENT_TO_SERVER_CAP).expect("frame write");
        assert_eq!(&out[0..4], &[0, 0, 0, 3]);
        assert_eq!(&out[4..], b"abc");
    }

    #[test]
    fn decodes_message_with_every_operation_kind() {
        let payload = br#"{
            "head": {"connectionId": "c-17", "requestCounter": 4},
            "operations": [
                ["create", "w2", "rwt.widgets.Shell", {"text": "Main"}],
                ["set", "w2", {"visible": true}],
                ["listen", "w2", {"Selection": true, "MouseDown": false}],
                ["call", "w2", "setFocus", {}],
                ["destroy", "w2"]
            ]
        }"#;

        let message = decode_message(payload).expect("decode message");
        assert_eq!(message.head.connection_id.as_deref(), Some("c-17"));
        assert_eq!(message.head.request_counter, Some(4));

        let kinds: Vec<_> = message.operations.iter().map(Operation::kind).collect();
        assert_eq!(kinds, ["create", "set", "listen", "call", "destroy"]);

        match &message.operations[2] {
            Operation::Listen { target, events } => {
                assert_eq!(target, "w2");
                assert_eq!(events.get("Selection"), Some(&true));
                assert_eq!(events.get("MouseDown"), Some(&false));
            }
            other => panic!("expected listen, got {other:?}"),
        }
    }

    #[test]
    fn missing_properties_decode_as_empty() {
        let message = decode_message(br#"{"operations": [["set", "w4"]]}"#).expect("decode");
        assert_eq!(
            message.operations,
            vec![Operation::Set {
                target: "w4".to_string(),
                properties: Properties::new(),
            }]
        );
    }

    #[test]
    fn unknown_tag_is_a_decode_error() {
        let err = decode_message(br#"{"operations": [["explode", "w4"]]}"#)
            .expect_err("unknown tag must fail");
        assert!(err.to_string().contains("explode"), "{err}");
    }

    #[test]
    fn encodes_client_message_as_tagged_arrays() {
        let mut properties = Properties::new();
        properties.insert("selection".to_string(), json!([1, 3]));

        let message = ClientMessage {
            head: Head {
                request_counter: Some(9),
                ..Head::default()
            },
            operations: vec![
                ClientOperation::Set {
                    target: "w5".to_string(),
                    properties,
                },
                ClientOperation::Notify {
                    target: "w5".to_string(),
                    event: "Selection".to_string(),
                    properties: Properties::new(),
                },
            ],
        };

        let encoded = encode_client_message(&message).expect("encode");
        let value: Value = serde_json::from_slice(&encoded).expect("parse encoded json");
        assert_eq!(value["head"], json!({"requestCounter": 9}));
        assert_eq!(value["operations"][0], json!(["set", "w5", {"selection": [1, 3]}]));
        assert_eq!(value["operations"][1], json!(["notify", "w5", "Selection", {}]));
    }
}
