//! Sync Event Protocol
//!
//! Typed events exchanged between peers and their JSON wire encoding.
//!
//! # Wire Format
//!
//! Every transport message is a named event with a JSON payload:
//!
//! | Event                | Payload                                              |
//! |----------------------|------------------------------------------------------|
//! | `object-sync`        | `{ type, objectId, data, userId, timestamp }`        |
//! | `request-scene-sync` | `{}`                                                 |
//! | `scene-sync`         | `{ timestamp, objects: [...] }`                      |
//! | `user-joined`        | `{ userId, isHost }`                                 |
//! | `user-left`          | `"userId"`                                           |
//!
//! `type` is one of `create`, `update`, `delete`, `transform`, `material`
//! or `animation`. Full kinds carry the whole object in `data`; partial
//! kinds carry only the changed fields.
//!
//! Decoding validates the fields each kind requires. Callers drop and log
//! anything that fails to decode.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::object::{MaterialPatch, ObjectId, SyncedObject, TransformPatch, UserId};

/// Per-object change broadcast
pub const OBJECT_SYNC: &str = "object-sync";
/// Ask the session for a full snapshot
pub const REQUEST_SCENE_SYNC: &str = "request-scene-sync";
/// Full snapshot
pub const SCENE_SYNC: &str = "scene-sync";
/// A member joined the session
pub const USER_JOINED: &str = "user-joined";
/// A member left the session
pub const USER_LEFT: &str = "user-left";

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Unknown message: {0}")]
    UnknownMessage(String),

    #[error("Unknown event kind: {0}")]
    UnknownKind(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Object id mismatch: event names {expected}, data carries {found}")]
    IdMismatch { expected: ObjectId, found: ObjectId },

    #[error("Empty {0} patch")]
    EmptyPatch(EventKind),

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Discriminant of a sync event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Create,
    Update,
    Delete,
    Transform,
    Material,
    Animation,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Create => "create",
            EventKind::Update => "update",
            EventKind::Delete => "delete",
            EventKind::Transform => "transform",
            EventKind::Material => "material",
            EventKind::Animation => "animation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(EventKind::Create),
            "update" => Some(EventKind::Update),
            "delete" => Some(EventKind::Delete),
            "transform" => Some(EventKind::Transform),
            "material" => Some(EventKind::Material),
            "animation" => Some(EventKind::Animation),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific body of a sync event
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Create(SyncedObject),
    Update(SyncedObject),
    Delete,
    Transform(TransformPatch),
    Material(MaterialPatch),
    /// Opaque animation command, forwarded to the projector
    Animation(Value),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Create(_) => EventKind::Create,
            EventPayload::Update(_) => EventKind::Update,
            EventPayload::Delete => EventKind::Delete,
            EventPayload::Transform(_) => EventKind::Transform,
            EventPayload::Material(_) => EventKind::Material,
            EventPayload::Animation(_) => EventKind::Animation,
        }
    }
}

/// A change to one object, attributed to the member that made it
#[derive(Debug, Clone, PartialEq)]
pub struct SyncEvent {
    pub object_id: ObjectId,
    pub origin: UserId,
    pub timestamp: u64,
    pub payload: EventPayload,
}

impl SyncEvent {
    pub fn create(obj: SyncedObject, origin: UserId) -> Self {
        Self {
            object_id: obj.id.clone(),
            origin,
            timestamp: obj.timestamp,
            payload: EventPayload::Create(obj),
        }
    }

    pub fn update(obj: SyncedObject, origin: UserId) -> Self {
        Self {
            object_id: obj.id.clone(),
            origin,
            timestamp: obj.timestamp,
            payload: EventPayload::Update(obj),
        }
    }

    pub fn delete(object_id: ObjectId, origin: UserId, timestamp: u64) -> Self {
        Self {
            object_id,
            origin,
            timestamp,
            payload: EventPayload::Delete,
        }
    }

    pub fn transform(
        object_id: ObjectId,
        patch: TransformPatch,
        origin: UserId,
        timestamp: u64,
    ) -> Self {
        Self {
            object_id,
            origin,
            timestamp,
            payload: EventPayload::Transform(patch),
        }
    }

    pub fn material(
        object_id: ObjectId,
        patch: MaterialPatch,
        origin: UserId,
        timestamp: u64,
    ) -> Self {
        Self {
            object_id,
            origin,
            timestamp,
            payload: EventPayload::Material(patch),
        }
    }

    pub fn animation(object_id: ObjectId, data: Value, origin: UserId, timestamp: u64) -> Self {
        Self {
            object_id,
            origin,
            timestamp,
            payload: EventPayload::Animation(data),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

/// Complete listing of all synchronized objects at one point in time
#[derive(Debug, Clone, PartialEq)]
pub struct SceneSnapshot {
    pub timestamp: u64,
    pub objects: Vec<SyncedObject>,
}

/// Decoded inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    ObjectSync(SyncEvent),
    SceneSync(SceneSnapshot),
    UserJoined { user_id: UserId, is_host: bool },
    UserLeft(UserId),
    RequestSceneSync,
}

/// Message emitted by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    ObjectSync(SyncEvent),
    RequestSceneSync,
    SceneSync(SceneSnapshot),
}

impl OutboundMessage {
    /// Transport event name
    pub fn name(&self) -> &'static str {
        match self {
            OutboundMessage::ObjectSync(_) => OBJECT_SYNC,
            OutboundMessage::RequestSceneSync => REQUEST_SCENE_SYNC,
            OutboundMessage::SceneSync(_) => SCENE_SYNC,
        }
    }
}

/// A named event with its JSON payload, as carried by the transport
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub name: String,
    pub payload: Value,
}

impl Envelope {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    /// Session notice that a member joined
    pub fn user_joined(user_id: &UserId, is_host: bool) -> Self {
        Self::new(
            USER_JOINED,
            serde_json::json!({ "userId": user_id.as_str(), "isHost": is_host }),
        )
    }

    /// Session notice that a member left
    pub fn user_left(user_id: &UserId) -> Self {
        Self::new(USER_LEFT, Value::String(user_id.as_str().to_string()))
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSyncEvent {
    #[serde(rename = "type")]
    kind: String,
    object_id: String,
    #[serde(default)]
    data: Value,
    user_id: String,
    timestamp: u64,
}

#[derive(Debug, Deserialize)]
struct WireSnapshot {
    timestamp: u64,
    #[serde(default)]
    objects: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireUserJoined {
    user_id: String,
    #[serde(default)]
    is_host: bool,
}

/// Encode an outbound message for the transport
pub fn encode(message: &OutboundMessage) -> ProtocolResult<Envelope> {
    let payload = match message {
        OutboundMessage::ObjectSync(event) => encode_event(event)?,
        OutboundMessage::RequestSceneSync => Value::Object(serde_json::Map::new()),
        OutboundMessage::SceneSync(snapshot) => serde_json::json!({
            "timestamp": snapshot.timestamp,
            "objects": serde_json::to_value(&snapshot.objects)?,
        }),
    };
    Ok(Envelope::new(message.name(), payload))
}

/// Encode one sync event as an `object-sync` payload
pub fn encode_event(event: &SyncEvent) -> ProtocolResult<Value> {
    let data = match &event.payload {
        EventPayload::Create(obj) | EventPayload::Update(obj) => serde_json::to_value(obj)?,
        EventPayload::Delete => Value::Null,
        EventPayload::Transform(patch) => serde_json::to_value(patch)?,
        EventPayload::Material(patch) => serde_json::to_value(patch)?,
        EventPayload::Animation(data) => data.clone(),
    };

    let wire = WireSyncEvent {
        kind: event.kind().as_str().to_string(),
        object_id: event.object_id.as_str().to_string(),
        data,
        user_id: event.origin.as_str().to_string(),
        timestamp: event.timestamp,
    };
    Ok(serde_json::to_value(wire)?)
}

/// Decode an inbound transport message
pub fn decode(envelope: &Envelope) -> ProtocolResult<InboundMessage> {
    match envelope.name.as_str() {
        OBJECT_SYNC => Ok(InboundMessage::ObjectSync(decode_event(&envelope.payload)?)),
        SCENE_SYNC => Ok(InboundMessage::SceneSync(decode_snapshot(&envelope.payload)?)),
        USER_JOINED => {
            let wire: WireUserJoined = serde_json::from_value(envelope.payload.clone())?;
            if wire.user_id.is_empty() {
                return Err(ProtocolError::MissingField("userId"));
            }
            Ok(InboundMessage::UserJoined {
                user_id: UserId::new(wire.user_id),
                is_host: wire.is_host,
            })
        }
        USER_LEFT => Ok(InboundMessage::UserLeft(decode_user_left(&envelope.payload)?)),
        REQUEST_SCENE_SYNC => Ok(InboundMessage::RequestSceneSync),
        other => Err(ProtocolError::UnknownMessage(other.to_string())),
    }
}

/// Decode and validate an `object-sync` payload
pub fn decode_event(value: &Value) -> ProtocolResult<SyncEvent> {
    let wire: WireSyncEvent = serde_json::from_value(value.clone())?;

    if wire.object_id.is_empty() {
        return Err(ProtocolError::MissingField("objectId"));
    }
    if wire.user_id.is_empty() {
        return Err(ProtocolError::MissingField("userId"));
    }

    let kind =
        EventKind::parse(&wire.kind).ok_or_else(|| ProtocolError::UnknownKind(wire.kind.clone()))?;
    let object_id = ObjectId::new(wire.object_id);
    let origin = UserId::new(wire.user_id);

    let payload = match kind {
        EventKind::Create | EventKind::Update => {
            let obj = decode_object(wire.data, &origin)?;
            if obj.id != object_id {
                return Err(ProtocolError::IdMismatch {
                    expected: object_id,
                    found: obj.id,
                });
            }
            if kind == EventKind::Create {
                EventPayload::Create(obj)
            } else {
                EventPayload::Update(obj)
            }
        }
        EventKind::Delete => EventPayload::Delete,
        EventKind::Transform => {
            let patch: TransformPatch = serde_json::from_value(wire.data)?;
            if patch.is_empty() {
                return Err(ProtocolError::EmptyPatch(kind));
            }
            EventPayload::Transform(patch)
        }
        EventKind::Material => {
            if wire.data.get("materialId").is_none() {
                return Err(ProtocolError::MissingField("materialId"));
            }
            EventPayload::Material(serde_json::from_value(wire.data)?)
        }
        EventKind::Animation => {
            if wire.data.is_null() {
                return Err(ProtocolError::MissingField("data"));
            }
            EventPayload::Animation(wire.data)
        }
    };

    Ok(SyncEvent {
        object_id,
        origin,
        timestamp: wire.timestamp,
        payload,
    })
}

/// Decode a `scene-sync` payload
///
/// Individual objects that fail to decode are skipped; the rest of the
/// snapshot is kept.
pub fn decode_snapshot(value: &Value) -> ProtocolResult<SceneSnapshot> {
    let wire: WireSnapshot = serde_json::from_value(value.clone())?;

    let objects = wire
        .objects
        .into_iter()
        .filter_map(|raw| match serde_json::from_value::<SyncedObject>(raw) {
            Ok(obj) => Some(obj),
            Err(e) => {
                log::warn!("Skipping malformed object in scene snapshot: {}", e);
                None
            }
        })
        .collect();

    Ok(SceneSnapshot {
        timestamp: wire.timestamp,
        objects,
    })
}

/// Full objects may omit `userId`; the event's originator owns them then
fn decode_object(mut data: Value, origin: &UserId) -> ProtocolResult<SyncedObject> {
    let map = data
        .as_object_mut()
        .ok_or_else(|| ProtocolError::Malformed("object data must be a JSON object".to_string()))?;
    map.entry("userId")
        .or_insert_with(|| Value::String(origin.as_str().to_string()));
    Ok(serde_json::from_value(data)?)
}

fn decode_user_left(payload: &Value) -> ProtocolResult<UserId> {
    let id = match payload {
        Value::String(id) => id.clone(),
        Value::Object(map) => map
            .get("userId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(ProtocolError::MissingField("userId"))?,
        other => {
            return Err(ProtocolError::Malformed(format!(
                "expected user id, got {}",
                other
            )))
        }
    };

    if id.is_empty() {
        return Err(ProtocolError::MissingField("userId"));
    }
    Ok(UserId::new(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectKind;
    use glam::DVec3;
    use serde_json::json;

    fn object() -> SyncedObject {
        SyncedObject::new(
            ObjectId::new("box1"),
            ObjectKind::Box,
            DVec3::new(1.0, 0.0, 0.0),
            UserId::new("alice"),
            10,
        )
    }

    #[test]
    fn test_encode_create_shape() {
        let event = SyncEvent::create(object(), UserId::new("alice"));
        let envelope = encode(&OutboundMessage::ObjectSync(event)).unwrap();

        assert_eq!(envelope.name, OBJECT_SYNC);
        assert_eq!(envelope.payload["type"], "create");
        assert_eq!(envelope.payload["objectId"], "box1");
        assert_eq!(envelope.payload["userId"], "alice");
        assert_eq!(envelope.payload["timestamp"], 10);
        assert_eq!(envelope.payload["data"]["id"], "box1");
    }

    #[test]
    fn test_outbound_decodes_as_inbound() {
        let event = SyncEvent::transform(
            ObjectId::new("box1"),
            TransformPatch::position(DVec3::Y),
            UserId::new("alice"),
            42,
        );
        let envelope = encode(&OutboundMessage::ObjectSync(event.clone())).unwrap();

        assert_eq!(decode(&envelope).unwrap(), InboundMessage::ObjectSync(event));
    }

    #[test]
    fn test_request_scene_sync_is_empty_object() {
        let envelope = encode(&OutboundMessage::RequestSceneSync).unwrap();
        assert_eq!(envelope.name, REQUEST_SCENE_SYNC);
        assert_eq!(envelope.payload, json!({}));
    }

    #[test]
    fn test_delete_ignores_data() {
        let event = decode_event(&json!({
            "type": "delete",
            "objectId": "box1",
            "data": null,
            "userId": "bob",
            "timestamp": 3
        }))
        .unwrap();

        assert_eq!(event.payload, EventPayload::Delete);
        assert_eq!(event.origin.as_str(), "bob");
    }

    #[test]
    fn test_update_without_owner_takes_origin() {
        let event = decode_event(&json!({
            "type": "update",
            "objectId": "box1",
            "data": { "id": "box1", "type": "box", "position": [0, 0, 0], "timestamp": 4 },
            "userId": "bob",
            "timestamp": 4
        }))
        .unwrap();

        match event.payload {
            EventPayload::Update(obj) => assert!(obj.is_owned_by(&UserId::new("bob"))),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_rejects_unknown_kind() {
        let err = decode_event(&json!({
            "type": "explode",
            "objectId": "box1",
            "userId": "bob",
            "timestamp": 1
        }))
        .unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownKind(k) if k == "explode"));
    }

    #[test]
    fn test_rejects_id_mismatch() {
        let mut data = serde_json::to_value(object()).unwrap();
        data["id"] = json!("other");
        let err = decode_event(&json!({
            "type": "create",
            "objectId": "box1",
            "data": data,
            "userId": "alice",
            "timestamp": 10
        }))
        .unwrap_err();
        assert!(matches!(err, ProtocolError::IdMismatch { .. }));
    }

    #[test]
    fn test_rejects_missing_fields() {
        let err = decode_event(&json!({ "type": "delete", "objectId": "a", "timestamp": 1 }))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Json(_)));

        let err = decode_event(&json!({
            "type": "delete", "objectId": "", "userId": "bob", "timestamp": 1
        }))
        .unwrap_err();
        assert!(matches!(err, ProtocolError::MissingField("objectId")));

        let err = decode_event(&json!({
            "type": "material", "objectId": "a", "data": {}, "userId": "bob", "timestamp": 1
        }))
        .unwrap_err();
        assert!(matches!(err, ProtocolError::MissingField("materialId")));

        let err = decode_event(&json!({
            "type": "animation", "objectId": "a", "userId": "bob", "timestamp": 1
        }))
        .unwrap_err();
        assert!(matches!(err, ProtocolError::MissingField("data")));
    }

    #[test]
    fn test_rejects_empty_transform() {
        let err = decode_event(&json!({
            "type": "transform", "objectId": "a", "data": {}, "userId": "bob", "timestamp": 1
        }))
        .unwrap_err();
        assert!(matches!(err, ProtocolError::EmptyPatch(EventKind::Transform)));
    }

    #[test]
    fn test_material_null_clears() {
        let event = decode_event(&json!({
            "type": "material", "objectId": "a", "data": { "materialId": null },
            "userId": "bob", "timestamp": 1
        }))
        .unwrap();
        assert_eq!(event.payload, EventPayload::Material(MaterialPatch::new(None)));
    }

    #[test]
    fn test_snapshot_skips_bad_objects() {
        let good = serde_json::to_value(object()).unwrap();
        let snapshot = decode_snapshot(&json!({
            "timestamp": 99,
            "objects": [good, { "id": "broken" }]
        }))
        .unwrap();

        assert_eq!(snapshot.timestamp, 99);
        assert_eq!(snapshot.objects.len(), 1);
        assert_eq!(snapshot.objects[0].id.as_str(), "box1");
    }

    #[test]
    fn test_snapshot_keeps_unowned_objects() {
        let snapshot = decode_snapshot(&json!({
            "timestamp": 10,
            "objects": [{ "id": "lamp", "type": "cylinder", "position": [0, 0, 0], "timestamp": 1 }]
        }))
        .unwrap();

        assert_eq!(snapshot.objects.len(), 1);
        assert!(snapshot.objects[0].owner_id.is_none());
    }

    #[test]
    fn test_membership_messages() {
        let joined = decode(&Envelope::user_joined(&UserId::new("carol"), true)).unwrap();
        assert_eq!(
            joined,
            InboundMessage::UserJoined {
                user_id: UserId::new("carol"),
                is_host: true
            }
        );

        let left = decode(&Envelope::user_left(&UserId::new("carol"))).unwrap();
        assert_eq!(left, InboundMessage::UserLeft(UserId::new("carol")));

        let left = decode(&Envelope::new(USER_LEFT, json!({ "userId": "dave" }))).unwrap();
        assert_eq!(left, InboundMessage::UserLeft(UserId::new("dave")));

        assert!(decode(&Envelope::new(USER_LEFT, json!(7))).is_err());
    }

    #[test]
    fn test_unknown_message() {
        let err = decode(&Envelope::new("cursor-move", json!({}))).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownMessage(_)));
    }
}
