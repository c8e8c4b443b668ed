//! Scene Projection
//!
//! The engine decides *when* a synchronized object must appear, change or
//! disappear in the rendered scene; a [`SceneProjector`] decides *how*.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;

use crate::object::{ObjectId, SyncedObject};

/// Errors reported by a projector backend
#[derive(Debug, Error)]
pub enum ProjectorError {
    #[error("Node not found: {0}")]
    NodeNotFound(ObjectId),

    #[error("Unsupported object: {0}")]
    Unsupported(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

pub type ProjectorResult<T> = Result<T, ProjectorError>;

/// Where a committed change came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

/// Materializes committed store state into live render nodes
pub trait SceneProjector: Send {
    /// Instantiate a node for a newly committed object
    ///
    /// `origin` is `Remote` for objects that arrived from another peer, so
    /// the renderer can mark them with their owner.
    fn create_node(&mut self, obj: &SyncedObject, origin: ChangeOrigin) -> ProjectorResult<()>;

    /// Bring an existing node in line with the committed object
    fn update_node(&mut self, obj: &SyncedObject) -> ProjectorResult<()>;

    /// Tear down the node for a removed object
    fn dispose_node(&mut self, id: &ObjectId) -> ProjectorResult<()>;

    /// Play an animation command on an existing node
    fn animate_node(&mut self, _id: &ObjectId, _payload: &Value) -> ProjectorResult<()> {
        Ok(())
    }
}

/// Projector for headless peers
#[derive(Debug, Clone, Copy, Default)]
pub struct NullProjector;

impl SceneProjector for NullProjector {
    fn create_node(&mut self, _obj: &SyncedObject, _origin: ChangeOrigin) -> ProjectorResult<()> {
        Ok(())
    }

    fn update_node(&mut self, _obj: &SyncedObject) -> ProjectorResult<()> {
        Ok(())
    }

    fn dispose_node(&mut self, _id: &ObjectId) -> ProjectorResult<()> {
        Ok(())
    }
}

/// A single projector invocation
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectionCall {
    Create(ObjectId, ChangeOrigin),
    Update(ObjectId),
    Dispose(ObjectId),
    Animate(ObjectId),
}

/// Projector that records every call
///
/// Clones share the same log, so a handle can be kept after the projector
/// is moved into an engine.
#[derive(Debug, Clone, Default)]
pub struct RecordingProjector {
    calls: Arc<Mutex<Vec<ProjectionCall>>>,
    failing: Arc<Mutex<bool>>,
}

impl RecordingProjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail (after being recorded)
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    pub fn calls(&self) -> Vec<ProjectionCall> {
        self.calls.lock().clone()
    }

    pub fn creates(&self) -> usize {
        self.count(|c| matches!(c, ProjectionCall::Create(..)))
    }

    pub fn updates(&self) -> usize {
        self.count(|c| matches!(c, ProjectionCall::Update(_)))
    }

    pub fn disposals(&self) -> usize {
        self.count(|c| matches!(c, ProjectionCall::Dispose(_)))
    }

    /// Number of dispose calls for one object
    pub fn disposals_of(&self, id: &ObjectId) -> usize {
        self.count(|c| matches!(c, ProjectionCall::Dispose(d) if d == id))
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    fn count(&self, pred: impl Fn(&ProjectionCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(*c)).count()
    }

    fn record(&self, call: ProjectionCall) -> ProjectorResult<()> {
        self.calls.lock().push(call);
        if *self.failing.lock() {
            return Err(ProjectorError::Backend("recording projector set to fail".to_string()));
        }
        Ok(())
    }
}

impl SceneProjector for RecordingProjector {
    fn create_node(&mut self, obj: &SyncedObject, origin: ChangeOrigin) -> ProjectorResult<()> {
        self.record(ProjectionCall::Create(obj.id.clone(), origin))
    }

    fn update_node(&mut self, obj: &SyncedObject) -> ProjectorResult<()> {
        self.record(ProjectionCall::Update(obj.id.clone()))
    }

    fn dispose_node(&mut self, id: &ObjectId) -> ProjectorResult<()> {
        self.record(ProjectionCall::Dispose(id.clone()))
    }

    fn animate_node(&mut self, id: &ObjectId, _payload: &Value) -> ProjectorResult<()> {
        self.record(ProjectionCall::Animate(id.clone()))
    }
}

/// Engine-side view of the projector
///
/// Tracks which IDs have a live node so a second create for the same ID
/// becomes an update, and a dispose is issued at most once per node.
pub(crate) struct Projection {
    projector: Box<dyn SceneProjector>,
    live: HashSet<ObjectId>,
    failures: u64,
}

impl Projection {
    pub fn new(projector: Box<dyn SceneProjector>) -> Self {
        Self {
            projector,
            live: HashSet::new(),
            failures: 0,
        }
    }

    /// Create the node if absent, otherwise update it
    pub fn upsert(&mut self, obj: &SyncedObject, origin: ChangeOrigin) {
        if self.live.contains(&obj.id) {
            let result = self.projector.update_node(obj);
            self.check(result, "update", &obj.id);
        } else {
            let result = self.projector.create_node(obj, origin);
            if self.check(result, "create", &obj.id) {
                self.live.insert(obj.id.clone());
            }
        }
    }

    /// Dispose the node if one exists
    pub fn dispose(&mut self, id: &ObjectId) {
        if self.live.remove(id) {
            let result = self.projector.dispose_node(id);
            self.check(result, "dispose", id);
        }
    }

    pub fn animate(&mut self, id: &ObjectId, payload: &Value) {
        if self.live.contains(id) {
            let result = self.projector.animate_node(id, payload);
            self.check(result, "animate", id);
        }
    }

    pub fn dispose_all(&mut self) {
        let ids: Vec<ObjectId> = self.live.iter().cloned().collect();
        for id in ids {
            self.dispose(&id);
        }
    }

    #[cfg(test)]
    pub fn is_live(&self, id: &ObjectId) -> bool {
        self.live.contains(id)
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Log a failed call; the store is never rolled back
    fn check(&mut self, result: ProjectorResult<()>, op: &str, id: &ObjectId) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                self.failures += 1;
                log::error!("Projector {} failed for {}: {}", op, id, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ObjectKind, UserId};
    use glam::DVec3;

    fn object(id: &str) -> SyncedObject {
        SyncedObject::new(
            ObjectId::new(id),
            ObjectKind::Sphere,
            DVec3::ZERO,
            UserId::new("alice"),
            1,
        )
    }

    #[test]
    fn test_second_create_becomes_update() {
        let recorder = RecordingProjector::new();
        let mut projection = Projection::new(Box::new(recorder.clone()));

        projection.upsert(&object("a"), ChangeOrigin::Local);
        projection.upsert(&object("a"), ChangeOrigin::Local);

        assert_eq!(
            recorder.calls(),
            vec![
                ProjectionCall::Create(ObjectId::new("a"), ChangeOrigin::Local),
                ProjectionCall::Update(ObjectId::new("a")),
            ]
        );
    }

    #[test]
    fn test_dispose_once() {
        let recorder = RecordingProjector::new();
        let mut projection = Projection::new(Box::new(recorder.clone()));
        let id = ObjectId::new("a");

        projection.upsert(&object("a"), ChangeOrigin::Local);
        projection.dispose(&id);
        projection.dispose(&id);
        projection.dispose(&ObjectId::new("never"));

        assert_eq!(recorder.disposals_of(&id), 1);
        assert_eq!(recorder.disposals(), 1);
        assert!(!projection.is_live(&id));
    }

    #[test]
    fn test_failed_create_retried_as_create() {
        let recorder = RecordingProjector::new();
        let mut projection = Projection::new(Box::new(recorder.clone()));

        recorder.set_failing(true);
        projection.upsert(&object("a"), ChangeOrigin::Local);
        assert_eq!(projection.failures(), 1);
        assert!(!projection.is_live(&ObjectId::new("a")));

        recorder.set_failing(false);
        projection.upsert(&object("a"), ChangeOrigin::Local);
        assert_eq!(recorder.creates(), 2);
        assert!(projection.is_live(&ObjectId::new("a")));
    }

    #[test]
    fn test_animate_requires_node() {
        let recorder = RecordingProjector::new();
        let mut projection = Projection::new(Box::new(recorder.clone()));

        projection.animate(&ObjectId::new("a"), &serde_json::json!({ "clip": "spin" }));
        assert!(recorder.calls().is_empty());

        projection.upsert(&object("a"), ChangeOrigin::Local);
        projection.animate(&ObjectId::new("a"), &serde_json::json!({ "clip": "spin" }));
        assert_eq!(recorder.calls().len(), 2);
    }

    #[test]
    fn test_dispose_all() {
        let recorder = RecordingProjector::new();
        let mut projection = Projection::new(Box::new(recorder.clone()));

        projection.upsert(&object("a"), ChangeOrigin::Local);
        projection.upsert(&object("b"), ChangeOrigin::Remote);
        projection.dispose_all();

        assert_eq!(recorder.disposals(), 2);
        assert!(!projection.is_live(&ObjectId::new("a")));
    }
}
