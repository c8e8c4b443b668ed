//! Synchronized Objects
//!
//! The entity model mirrored across every peer in a session, plus the
//! partial field sets used by updates and high-frequency edits.

use glam::DVec3;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier for a synchronized object (same on every peer)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    /// Create an object ID from an existing string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh ID of the form `<prefix>_<millis>_<suffix>`
    pub fn generate(prefix: &str, now_ms: u64) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{}_{}_{}", prefix, now_ms, &suffix[..9]))
    }

    /// Get the ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check if the ID is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ObjectId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Session member identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Create a new user ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check if the ID is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Primitive shape of a synchronized object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Box,
    Sphere,
    Cylinder,
    Plane,
    Custom,
}

impl ObjectKind {
    /// Wire name of this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Box => "box",
            ObjectKind::Sphere => "sphere",
            ObjectKind::Cylinder => "cylinder",
            ObjectKind::Plane => "plane",
            ObjectKind::Custom => "custom",
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn unit_scale() -> DVec3 {
    DVec3::ONE
}

/// An entity whose state is mirrored across all connected peers
///
/// The whole object is always replaced as a unit so that its fields stay
/// consistent with the `timestamp` that produced them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncedObject {
    /// Immutable identifier
    pub id: ObjectId,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Primitive shape
    #[serde(rename = "type")]
    pub kind: ObjectKind,
    /// World position
    pub position: DVec3,
    /// Euler rotation in radians
    #[serde(default)]
    pub rotation: DVec3,
    /// Per-axis scale
    #[serde(default = "unit_scale")]
    pub scale: DVec3,
    /// Material reference, if any
    #[serde(rename = "materialId", default, skip_serializing_if = "Option::is_none")]
    pub material_ref: Option<String>,
    /// Session member that created the object
    ///
    /// Unowned objects are never removed when a member leaves.
    #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<UserId>,
    /// Write time (milliseconds since epoch) used for conflict resolution
    pub timestamp: u64,
}

impl SyncedObject {
    /// Create an object with identity rotation and unit scale
    pub fn new(
        id: ObjectId,
        kind: ObjectKind,
        position: DVec3,
        owner_id: UserId,
        timestamp: u64,
    ) -> Self {
        let name = format!("{}_{}", kind, id);
        Self {
            id,
            name,
            kind,
            position,
            rotation: DVec3::ZERO,
            scale: DVec3::ONE,
            material_ref: None,
            owner_id: Some(owner_id),
            timestamp,
        }
    }

    /// Builder method to set the name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Builder method to set the material
    pub fn with_material(mut self, material_ref: impl Into<String>) -> Self {
        self.material_ref = Some(material_ref.into());
        self
    }

    /// Whether a member created this object
    pub fn is_owned_by(&self, user_id: &UserId) -> bool {
        self.owner_id.as_ref() == Some(user_id)
    }
}

/// Partial field set for `update_object`
///
/// The object's `id` and `owner_id` are never part of a patch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectPatch {
    pub name: Option<String>,
    pub kind: Option<ObjectKind>,
    pub position: Option<DVec3>,
    pub rotation: Option<DVec3>,
    pub scale: Option<DVec3>,
    /// `Some(None)` clears the material
    pub material_ref: Option<Option<String>>,
}

impl ObjectPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_kind(mut self, kind: ObjectKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_position(mut self, position: DVec3) -> Self {
        self.position = Some(position);
        self
    }

    pub fn with_rotation(mut self, rotation: DVec3) -> Self {
        self.rotation = Some(rotation);
        self
    }

    pub fn with_scale(mut self, scale: DVec3) -> Self {
        self.scale = Some(scale);
        self
    }

    pub fn with_material(mut self, material_ref: Option<String>) -> Self {
        self.material_ref = Some(material_ref);
        self
    }

    /// Check if the patch changes nothing
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.kind.is_none()
            && self.position.is_none()
            && self.rotation.is_none()
            && self.scale.is_none()
            && self.material_ref.is_none()
    }

    /// Overwrite the listed fields of `obj`
    pub fn apply_to(&self, obj: &mut SyncedObject) {
        if let Some(name) = &self.name {
            obj.name = name.clone();
        }
        if let Some(kind) = self.kind {
            obj.kind = kind;
        }
        if let Some(position) = self.position {
            obj.position = position;
        }
        if let Some(rotation) = self.rotation {
            obj.rotation = rotation;
        }
        if let Some(scale) = self.scale {
            obj.scale = scale;
        }
        if let Some(material_ref) = &self.material_ref {
            obj.material_ref = material_ref.clone();
        }
    }
}

/// Transform-only change, sent on continuous manipulation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<DVec3>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<DVec3>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<DVec3>,
}

impl TransformPatch {
    /// Patch that only moves the object
    pub fn position(position: DVec3) -> Self {
        Self {
            position: Some(position),
            ..Default::default()
        }
    }

    pub fn with_rotation(mut self, rotation: DVec3) -> Self {
        self.rotation = Some(rotation);
        self
    }

    pub fn with_scale(mut self, scale: DVec3) -> Self {
        self.scale = Some(scale);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.position.is_none() && self.rotation.is_none() && self.scale.is_none()
    }

    pub fn apply_to(&self, obj: &mut SyncedObject) {
        if let Some(position) = self.position {
            obj.position = position;
        }
        if let Some(rotation) = self.rotation {
            obj.rotation = rotation;
        }
        if let Some(scale) = self.scale {
            obj.scale = scale;
        }
    }

    /// Fold a later patch into this one; fields set by `newer` win
    pub fn merge(&mut self, newer: &TransformPatch) {
        if newer.position.is_some() {
            self.position = newer.position;
        }
        if newer.rotation.is_some() {
            self.rotation = newer.rotation;
        }
        if newer.scale.is_some() {
            self.scale = newer.scale;
        }
    }
}

/// Material-only change
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaterialPatch {
    /// New material reference; `None` clears it
    #[serde(rename = "materialId")]
    pub material_ref: Option<String>,
}

impl MaterialPatch {
    pub fn new(material_ref: Option<String>) -> Self {
        Self { material_ref }
    }

    pub fn apply_to(&self, obj: &mut SyncedObject) {
        obj.material_ref = self.material_ref.clone();
    }
}
