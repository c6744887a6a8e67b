//! Actions exchanged with the transport.
//!
//! On the wire every action is a JSON object
//! `{type, payload, meta?: {id}, error?}`. `RawAction` mirrors that record;
//! `Action` is the validated form the dispatcher works with. Conversion
//! between the two is where malformed messages are caught.

use crate::error::ProtocolError;
use crate::path::NodePath;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Correlation id of an outbound request.
pub type RequestId = u64;

/// Watcher event names, as reported by the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FsEventKind {
    Add,
    AddDir,
    Change,
    Unlink,
    UnlinkDir,
}

impl FsEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FsEventKind::Add => "add",
            FsEventKind::AddDir => "addDir",
            FsEventKind::Change => "change",
            FsEventKind::Unlink => "unlink",
            FsEventKind::UnlinkDir => "unlinkDir",
        }
    }
}

/// Payload of `initialState`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialState {
    pub root_path: String,
    pub state: TreeState,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TreeState {
    /// Nested object: object values are directories, anything else a file
    pub tree: Map<String, Value>,
    /// Node path -> stat record
    #[serde(default)]
    pub stat: Map<String, Value>,
}

/// Payload of `event`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FsEvent {
    pub name: FsEventKind,
    pub path: NodePath,
    #[serde(default)]
    pub stat: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub payload: Value,
    pub error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    #[serde(skip)]
    pub id: RequestId,
    pub method_name: String,
    pub args: Vec<Value>,
}

/// A validated action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawAction", into = "RawAction")]
pub enum Action {
    /// Full replacement of the replica (inbound)
    InitialState(InitialState),
    /// Ordered group applied under one transaction (inbound)
    Batch(Vec<Action>),
    /// Filesystem event to translate and enqueue (inbound)
    Event(FsEvent),
    /// Outcome of an earlier request (inbound)
    Response(Response),
    /// Mutating operation for the remote authority (outbound)
    Request(Request),
    /// Ask the remote side to watch a path (outbound)
    WatchPath { path: String },
}

impl Action {
    /// Wire discriminant of this action.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::InitialState(_) => "initialState",
            Action::Batch(_) => "batch",
            Action::Event(_) => "event",
            Action::Response(_) => "response",
            Action::Request(_) => "request",
            Action::WatchPath { .. } => "watchPath",
        }
    }

    /// Decode one action from UTF-8 JSON bytes.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let raw: RawAction =
            serde_json::from_slice(data).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Action::try_from(raw)
    }

    /// Encode as a JSON value in wire shape.
    pub fn to_value(&self) -> Value {
        RawAction::from(self.clone()).into_value()
    }

    /// Encode as a JSON string in wire shape.
    pub fn encode(&self) -> String {
        self.to_value().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    pub id: RequestId,
}

/// Action record exactly as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawAction {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
    /// Any truthy value marks the action as an error
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub error: Value,
}

impl RawAction {
    fn new(kind: &str, payload: Value) -> Self {
        Self {
            kind: Some(kind.to_string()),
            payload,
            meta: None,
            error: Value::Null,
        }
    }

    pub fn into_value(self) -> Value {
        let mut object = Map::new();
        object.insert("type".into(), self.kind.map(Value::String).unwrap_or(Value::Null));
        object.insert("payload".into(), self.payload);
        if let Some(meta) = self.meta {
            object.insert("meta".into(), json!({ "id": meta.id }));
        }
        if !self.error.is_null() {
            object.insert("error".into(), self.error);
        }
        Value::Object(object)
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn payload<T: serde::de::DeserializeOwned>(kind: &str, payload: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(payload)
        .map_err(|e| ProtocolError::Malformed(format!("{} payload: {}", kind, e)))
}

impl TryFrom<RawAction> for Action {
    type Error = ProtocolError;

    fn try_from(raw: RawAction) -> Result<Self, Self::Error> {
        let kind = raw
            .kind
            .ok_or_else(|| ProtocolError::Malformed("missing type".into()))?;

        match kind.as_str() {
            "initialState" => Ok(Action::InitialState(payload(&kind, raw.payload)?)),
            "batch" => {
                let Value::Array(items) = raw.payload else {
                    return Err(ProtocolError::Malformed("batch payload must be an array".into()));
                };
                let actions = items
                    .into_iter()
                    .enumerate()
                    .map(|(index, item)| {
                        serde_json::from_value::<RawAction>(item)
                            .map_err(|e| ProtocolError::Malformed(e.to_string()))
                            .and_then(Action::try_from)
                            .map_err(|e| match e {
                                ProtocolError::Malformed(reason) => ProtocolError::Malformed(
                                    format!("batch item {}: {}", index, reason),
                                ),
                                other => other,
                            })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Action::Batch(actions))
            }
            "event" => Ok(Action::Event(payload(&kind, raw.payload)?)),
            "response" => {
                let meta = raw
                    .meta
                    .ok_or_else(|| ProtocolError::Malformed("response without meta.id".into()))?;
                Ok(Action::Response(Response {
                    id: meta.id,
                    payload: raw.payload,
                    error: is_truthy(&raw.error),
                }))
            }
            "request" => {
                let meta = raw
                    .meta
                    .ok_or_else(|| ProtocolError::Malformed("request without meta.id".into()))?;
                let mut request: Request = payload(&kind, raw.payload)?;
                request.id = meta.id;
                Ok(Action::Request(request))
            }
            "watchPath" => {
                #[derive(Deserialize)]
                struct WatchPayload {
                    path: String,
                }
                let WatchPayload { path } = payload(&kind, raw.payload)?;
                Ok(Action::WatchPath { path })
            }
            other => Err(ProtocolError::Malformed(format!("unknown type {:?}", other))),
        }
    }
}

impl From<Action> for RawAction {
    fn from(action: Action) -> Self {
        let kind = action.kind();
        match action {
            Action::InitialState(initial) => RawAction::new(
                kind,
                json!({
                    "rootPath": initial.root_path,
                    "state": {
                        "tree": Value::Object(initial.state.tree),
                        "stat": Value::Object(initial.state.stat),
                    },
                }),
            ),
            Action::Batch(actions) => RawAction::new(
                kind,
                Value::Array(
                    actions
                        .into_iter()
                        .map(|a| RawAction::from(a).into_value())
                        .collect(),
                ),
            ),
            Action::Event(event) => RawAction::new(
                kind,
                json!({
                    "name": event.name.as_str(),
                    "path": event.path.to_string(),
                    "stat": event.stat,
                }),
            ),
            Action::Response(response) => RawAction {
                meta: Some(Meta { id: response.id }),
                error: if response.error {
                    Value::Bool(true)
                } else {
                    Value::Null
                },
                ..RawAction::new(kind, response.payload)
            },
            Action::Request(request) => RawAction {
                meta: Some(Meta { id: request.id }),
                ..RawAction::new(
                    kind,
                    json!({ "methodName": request.method_name, "args": request.args }),
                )
            },
            Action::WatchPath { path } => RawAction::new(kind, json!({ "path": path })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(value: Value) -> Result<Action, ProtocolError> {
        Action::decode(value.to_string().as_bytes())
    }

    #[test]
    fn test_decode_initial_state() {
        let action = decode(json!({
            "type": "initialState",
            "payload": { "rootPath": "/r", "state": { "tree": {}, "stat": {} } }
        }))
        .unwrap();

        assert_eq!(
            action,
            Action::InitialState(InitialState {
                root_path: "/r".into(),
                state: TreeState::default(),
            })
        );
    }

    #[test]
    fn test_decode_nested_batch() {
        let action = decode(json!({
            "type": "batch",
            "payload": [
                { "type": "event", "payload": { "name": "add", "path": "/b", "stat": {} } },
                { "type": "batch", "payload": [
                    { "type": "event", "payload": { "name": "unlinkDir", "path": "/c" } }
                ] }
            ]
        }))
        .unwrap();

        let Action::Batch(items) = action else {
            panic!("expected batch");
        };
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[0], Action::Event(e) if e.name == FsEventKind::Add));
        let Action::Batch(inner) = &items[1] else {
            panic!("expected nested batch");
        };
        assert!(matches!(&inner[0], Action::Event(e) if e.name == FsEventKind::UnlinkDir && e.stat.is_null()));
    }

    #[test]
    fn test_decode_response_error_flag() {
        let ok = decode(json!({ "type": "response", "meta": { "id": 3 }, "payload": { "stat": {} } }))
            .unwrap();
        assert!(matches!(ok, Action::Response(Response { id: 3, error: false, .. })));

        let failed = decode(json!({ "type": "response", "meta": { "id": 4 }, "error": true, "payload": "EEXIST" }))
            .unwrap();
        assert!(matches!(failed, Action::Response(Response { id: 4, error: true, .. })));

        let truthy = decode(json!({ "type": "response", "meta": { "id": 5 }, "error": 1, "payload": null }))
            .unwrap();
        assert!(matches!(truthy, Action::Response(Response { error: true, .. })));
    }

    #[test]
    fn test_decode_rejects_missing_type() {
        let err = decode(json!({ "payload": {} })).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(msg) if msg.contains("missing type")));
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let err = decode(json!({ "type": "explode", "payload": {} })).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(msg) if msg.contains("explode")));
    }

    #[test]
    fn test_decode_rejects_bad_payload_shapes() {
        assert!(decode(json!({ "type": "batch", "payload": {} })).is_err());
        assert!(decode(json!({ "type": "event", "payload": { "name": "rename", "path": "/x" } })).is_err());
        assert!(decode(json!({ "type": "initialState", "payload": { "rootPath": "/r" } })).is_err());
        assert!(decode(json!({ "type": "response", "payload": {} })).is_err());
        assert!(Action::decode(b"not json").is_err());
    }

    #[test]
    fn test_malformed_batch_item_reports_index() {
        let err = decode(json!({
            "type": "batch",
            "payload": [
                { "type": "event", "payload": { "name": "add", "path": "/a" } },
                { "payload": {} }
            ]
        }))
        .unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(msg) if msg.contains("batch item 1")));
    }

    #[test]
    fn test_request_wire_shape() {
        let action = Action::Request(Request {
            id: 1,
            method_name: "writeFile".into(),
            args: vec![json!("/a.txt")],
        });

        assert_eq!(
            action.to_value(),
            json!({
                "type": "request",
                "meta": { "id": 1 },
                "payload": { "methodName": "writeFile", "args": ["/a.txt"] }
            })
        );
    }

    #[test]
    fn test_watch_path_wire_shape_has_no_meta() {
        let action = Action::WatchPath { path: "/src".into() };
        assert_eq!(
            action.to_value(),
            json!({ "type": "watchPath", "payload": { "path": "/src" } })
        );
    }

    #[test]
    fn test_response_error_survives_reencoding() {
        let action = Action::Response(Response {
            id: 9,
            payload: json!("EACCES"),
            error: true,
        });
        let decoded = Action::decode(action.encode().as_bytes()).unwrap();
        assert_eq!(decoded, action);
    }
}
