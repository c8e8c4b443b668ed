//! Sync Engine
//!
//! Owns the scene store and applies every change to it: local edits are
//! applied optimistically and broadcast, remote edits only ever reach the
//! store through the installed conflict resolver.
//!
//! ## Flow
//!
//! ```text
//! create/update/delete ──> store ──> projector
//!          │
//!          └──> object-sync ──> transport ──> remote peers
//!
//! inbound object-sync ──> echo check ──> resolver ──> store ──> projector
//! ```
//!
//! All handlers run on the caller's thread and never block; the only
//! suspension points live in the host's transport.

use std::collections::HashSet;
use std::time::Instant;

use glam::DVec3;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::membership::{Membership, SessionMember};
use crate::object::{
    MaterialPatch, ObjectId, ObjectKind, ObjectPatch, SyncedObject, TransformPatch, UserId,
};
use crate::projector::{ChangeOrigin, Projection, SceneProjector};
use crate::protocol::{
    self, Envelope, EventPayload, InboundMessage, OutboundMessage, SceneSnapshot, SyncEvent,
};
use crate::resolver::{self, ConflictResolver, LastWriteWins};
use crate::scheduler::{PendingChange, SyncLoop};
use crate::store::SceneStore;
use crate::transport::{Transport, TransportError};
use crate::SyncResult;

/// Why an object left the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Deleted through the local API
    Local,
    /// Deleted by a remote peer
    Remote,
    /// Its owner left the session
    OwnerLeft,
    /// Absent from an accepted snapshot
    Snapshot,
}

/// Change notifications delivered to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum SyncNotification {
    ObjectCommitted { id: ObjectId, origin: ChangeOrigin },
    ObjectRemoved { id: ObjectId, reason: RemovalReason },
    SnapshotApplied { timestamp: u64, object_count: usize },
    MemberJoined(SessionMember),
    MemberLeft(UserId),
    EventDropped { reason: String },
}

/// Engine counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncStats {
    /// Object events handed to the transport
    pub events_sent: u64,
    /// Sends that failed and were queued for retry
    pub send_failures: u64,
    /// Remote events that changed the store or scene
    pub events_applied: u64,
    /// Inbound messages that failed to decode
    pub events_dropped: u64,
    /// Valid remote events with nothing to apply to
    pub events_ignored: u64,
    /// Our own events echoed back to us
    pub echoes_suppressed: u64,
    /// Snapshots no newer than the last accepted one
    pub stale_snapshots: u64,
    /// Times the installed resolver failed and last-write-wins was used
    pub resolver_fallbacks: u64,
    /// Projector calls that returned an error
    pub projector_failures: u64,
    /// Changes waiting in the sync loop
    pub pending_changes: usize,
    /// Changes abandoned after exhausting their send attempts
    pub abandoned_changes: u64,
}

/// Scene synchronization engine for one local session member
pub struct SyncEngine {
    config: SyncConfig,
    clock: Box<dyn Clock>,
    store: SceneStore,
    /// IDs that were deleted and may never come back
    tombstones: HashSet<ObjectId>,
    resolver: Box<dyn ConflictResolver>,
    membership: Membership,
    scheduler: SyncLoop,
    projection: Projection,
    transport: Option<Box<dyn Transport>>,
    subscribers: Vec<mpsc::UnboundedSender<SyncNotification>>,
    stats: SyncStats,
}

impl SyncEngine {
    /// Create an engine with the default configuration
    pub fn new(local_user: impl Into<UserId>, projector: impl SceneProjector + 'static) -> Self {
        Self::build(local_user.into(), SyncConfig::default(), Box::new(projector))
    }

    /// Create an engine with a custom configuration
    pub fn with_config(
        local_user: impl Into<UserId>,
        config: SyncConfig,
        projector: impl SceneProjector + 'static,
    ) -> SyncResult<Self> {
        config.validate()?;
        Ok(Self::build(local_user.into(), config, Box::new(projector)))
    }

    fn build(local_user: UserId, config: SyncConfig, projector: Box<dyn SceneProjector>) -> Self {
        Self {
            scheduler: SyncLoop::new(&config),
            config,
            clock: Box::new(SystemClock),
            store: SceneStore::new(),
            tombstones: HashSet::new(),
            resolver: Box::new(LastWriteWins),
            membership: Membership::new(local_user),
            projection: Projection::new(projector),
            transport: None,
            subscribers: Vec::new(),
            stats: SyncStats::default(),
        }
    }

    /// Builder method to replace the timestamp source
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Builder method to attach a transport
    pub fn with_transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    /// Attach or detach the transport
    ///
    /// Without a transport, local changes still apply but are not broadcast.
    pub fn set_transport(&mut self, transport: Option<Box<dyn Transport>>) {
        self.transport = transport;
    }

    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn local_user(&self) -> &UserId {
        self.membership.local_user()
    }

    // ---------------------------------------------------------------------
    // Local edits
    // ---------------------------------------------------------------------

    /// Create an object owned by the local user and broadcast it
    pub fn create_object(
        &mut self,
        kind: ObjectKind,
        position: DVec3,
        name: Option<&str>,
    ) -> ObjectId {
        let now = self.clock.now_ms();
        let id = self.fresh_id(now);
        let origin = self.local_user().clone();

        let mut obj = SyncedObject::new(id.clone(), kind, position, origin.clone(), now);
        if let Some(name) = name {
            obj.name = name.to_string();
        }

        self.commit(obj.clone(), ChangeOrigin::Local);
        self.broadcast(SyncEvent::create(obj, origin));
        id
    }

    /// Overwrite fields of an object and broadcast the full new version
    ///
    /// Returns false if the object does not exist.
    pub fn update_object(&mut self, id: &ObjectId, patch: ObjectPatch) -> bool {
        let mut updated = match self.store.get(id) {
            Some(obj) => obj.clone(),
            None => {
                log::debug!("update_object: no object {}", id);
                return false;
            }
        };
        patch.apply_to(&mut updated);
        updated.timestamp = self.clock.now_ms();

        let origin = self.local_user().clone();
        self.commit(updated.clone(), ChangeOrigin::Local);
        self.broadcast(SyncEvent::update(updated, origin));
        true
    }

    /// Delete an object permanently and broadcast the deletion
    pub fn delete_object(&mut self, id: &ObjectId) -> bool {
        if !self.store.contains(id) {
            return false;
        }
        self.remove(id, RemovalReason::Local);

        let event = SyncEvent::delete(id.clone(), self.local_user().clone(), self.clock.now_ms());
        self.broadcast(event);
        true
    }

    /// Move/rotate/scale an object, broadcasting only the transform
    pub fn transform_object(&mut self, id: &ObjectId, patch: TransformPatch) -> bool {
        if patch.is_empty() {
            return false;
        }
        let mut updated = match self.store.get(id) {
            Some(obj) => obj.clone(),
            None => return false,
        };
        let now = self.clock.now_ms();
        patch.apply_to(&mut updated);
        updated.timestamp = now;

        self.commit(updated, ChangeOrigin::Local);
        let event = SyncEvent::transform(id.clone(), patch, self.local_user().clone(), now);
        self.broadcast(event);
        true
    }

    /// Change or clear an object's material, broadcasting only the material
    pub fn set_material(&mut self, id: &ObjectId, material_ref: Option<String>) -> bool {
        let mut updated = match self.store.get(id) {
            Some(obj) => obj.clone(),
            None => return false,
        };
        let now = self.clock.now_ms();
        let patch = MaterialPatch::new(material_ref);
        patch.apply_to(&mut updated);
        updated.timestamp = now;

        self.commit(updated, ChangeOrigin::Local);
        let event = SyncEvent::material(id.clone(), patch, self.local_user().clone(), now);
        self.broadcast(event);
        true
    }

    /// Play an animation on an object locally and on every peer
    ///
    /// Animations are transient and leave the stored object untouched.
    pub fn animate_object(&mut self, id: &ObjectId, payload: Value) -> bool {
        if !self.store.contains(id) {
            return false;
        }
        self.projection.animate(id, &payload);

        let event =
            SyncEvent::animation(id.clone(), payload, self.local_user().clone(), self.clock.now_ms());
        self.broadcast(event);
        true
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    /// Snapshot of every synchronized object
    pub fn scene_objects(&self) -> Vec<SyncedObject> {
        self.store.all()
    }

    pub fn get_object(&self, id: &ObjectId) -> Option<&SyncedObject> {
        self.store.get(id)
    }

    /// Objects created by one member
    pub fn objects_by_owner(&self, owner: &UserId) -> Vec<SyncedObject> {
        self.store
            .iter()
            .filter(|obj| obj.is_owned_by(owner))
            .cloned()
            .collect()
    }

    /// Whether an ID has been deleted in this session
    pub fn is_deleted(&self, id: &ObjectId) -> bool {
        self.tombstones.contains(id)
    }

    /// Full listing of the store stamped with the current time
    pub fn snapshot(&self) -> SceneSnapshot {
        SceneSnapshot {
            timestamp: self.clock.now_ms(),
            objects: self.store.all(),
        }
    }

    pub fn is_host(&self) -> bool {
        self.membership.is_host()
    }

    pub fn members(&self) -> Vec<SessionMember> {
        self.membership.members()
    }

    pub fn member(&self, user_id: &UserId) -> Option<&SessionMember> {
        self.membership.member(user_id)
    }

    pub fn host(&self) -> Option<&SessionMember> {
        self.membership.host()
    }

    pub fn last_sync_time(&self) -> u64 {
        self.membership.last_sync_time()
    }

    pub fn stats(&self) -> SyncStats {
        let mut stats = self.stats.clone();
        stats.projector_failures = self.projection.failures();
        stats.pending_changes = self.scheduler.pending_len();
        stats.abandoned_changes = self.scheduler.dropped();
        stats
    }

    // ---------------------------------------------------------------------
    // Resolver, notifications, lifecycle
    // ---------------------------------------------------------------------

    /// Install the resolver applied to every incoming remote version
    pub fn set_conflict_resolver(&mut self, resolver: impl ConflictResolver + 'static) {
        self.resolver = Box::new(resolver);
    }

    /// Go back to last-write-wins
    pub fn reset_conflict_resolver(&mut self) {
        self.resolver = Box::new(LastWriteWins);
    }

    /// Receive change notifications
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SyncNotification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Start the sync loop; a second start is a no-op
    pub fn start(&mut self) {
        if self.scheduler.start(Instant::now()) {
            log::info!(
                "Sync loop started for {} ({} ms)",
                self.local_user(),
                self.config.sync_interval_ms
            );
        }
    }

    /// Stop the sync loop; pending changes stay queued
    pub fn stop(&mut self) {
        if self.scheduler.stop() {
            log::info!("Sync loop stopped for {}", self.local_user());
        }
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    /// When the sync loop next wants to run
    pub fn next_deadline(&self) -> Option<Instant> {
        self.scheduler.deadline()
    }

    /// Run the sync loop if its deadline has passed
    pub fn tick(&mut self, now: Instant) {
        if let Some(batch) = self.scheduler.poll(now) {
            self.flush_batch(batch);
        }
    }

    /// Send every pending change now, stopping at the first failure
    pub fn flush(&mut self) {
        while self.scheduler.has_pending() {
            let batch = self.scheduler.take_batch();
            if !self.flush_batch(batch) {
                break;
            }
        }
    }

    /// Stop the loop and clear all local state, disposing every node
    ///
    /// Pending changes are discarded, not flushed.
    pub fn dispose(&mut self) {
        self.stop();
        if self.scheduler.has_pending() {
            log::debug!(
                "Discarding {} pending changes on dispose",
                self.scheduler.pending_len()
            );
        }
        self.scheduler.clear();
        self.projection.dispose_all();
        self.store.clear();
        self.tombstones.clear();
        self.membership.reset();
        log::info!("Sync engine for {} disposed", self.local_user());
    }

    // ---------------------------------------------------------------------
    // Inbound
    // ---------------------------------------------------------------------

    /// Decode and apply one transport message
    ///
    /// Malformed or unknown messages are logged and dropped.
    pub fn handle_envelope(&mut self, envelope: &Envelope) {
        match protocol::decode(envelope) {
            Ok(message) => self.handle_message(message),
            Err(e) => {
                let reason = format!("{}: {}", envelope.name, e);
                log::warn!("Dropping inbound message {}", reason);
                self.stats.events_dropped += 1;
                self.notify(SyncNotification::EventDropped { reason });
            }
        }
    }

    /// Apply one decoded message
    pub fn handle_message(&mut self, message: InboundMessage) {
        match message {
            InboundMessage::ObjectSync(event) => self.apply_remote(event),
            InboundMessage::SceneSync(snapshot) => self.apply_snapshot(snapshot),
            InboundMessage::UserJoined { user_id, is_host } => {
                self.on_user_joined(user_id, is_host)
            }
            InboundMessage::UserLeft(user_id) => self.on_user_left(&user_id),
            InboundMessage::RequestSceneSync => self.serve_snapshot(),
        }
    }

    /// Ask the session for a full snapshot
    pub fn request_scene_sync(&mut self) {
        self.send_now(OutboundMessage::RequestSceneSync);
    }

    fn apply_remote(&mut self, event: SyncEvent) {
        if self.membership.is_echo(&event.origin) {
            self.stats.echoes_suppressed += 1;
            log::trace!("Suppressing echo of {} for {}", event.kind(), event.object_id);
            return;
        }

        let kind = event.kind();
        let SyncEvent {
            object_id,
            timestamp,
            payload,
            ..
        } = event;

        if self.tombstones.contains(&object_id) && kind != protocol::EventKind::Delete {
            self.ignore(&format!("{} for deleted object {}", kind, object_id));
            return;
        }

        match payload {
            EventPayload::Create(obj) | EventPayload::Update(obj) => self.merge_remote(obj),
            EventPayload::Delete => {
                if self.store.contains(&object_id) {
                    self.remove(&object_id, RemovalReason::Remote);
                    self.stats.events_applied += 1;
                } else {
                    self.tombstones.insert(object_id);
                }
            }
            EventPayload::Transform(patch) => match self.store.get(&object_id) {
                Some(local) => {
                    let mut candidate = local.clone();
                    patch.apply_to(&mut candidate);
                    candidate.timestamp = timestamp;
                    self.merge_remote(candidate);
                }
                None => self.ignore(&format!("transform for unknown object {}", object_id)),
            },
            EventPayload::Material(patch) => match self.store.get(&object_id) {
                Some(local) => {
                    let mut candidate = local.clone();
                    patch.apply_to(&mut candidate);
                    candidate.timestamp = timestamp;
                    self.merge_remote(candidate);
                }
                None => self.ignore(&format!("material for unknown object {}", object_id)),
            },
            EventPayload::Animation(data) => {
                if self.store.contains(&object_id) {
                    self.projection.animate(&object_id, &data);
                    self.stats.events_applied += 1;
                } else {
                    self.ignore(&format!("animation for unknown object {}", object_id));
                }
            }
        }
    }

    /// Commit a remote version through the resolver
    fn merge_remote(&mut self, remote: SyncedObject) {
        let id = remote.id.clone();
        let resolved = match self.store.get(&id) {
            None => Some(remote),
            Some(local) => {
                let outcome = resolver::resolve_guarded(&*self.resolver, local, &remote);
                if outcome.fell_back {
                    self.stats.resolver_fallbacks += 1;
                }
                if outcome.object == *local {
                    None
                } else {
                    Some(outcome.object)
                }
            }
        };

        match resolved {
            Some(obj) => {
                self.commit(obj, ChangeOrigin::Remote);
                self.stats.events_applied += 1;
            }
            None => log::trace!("Local version of {} kept", id),
        }
    }

    fn apply_snapshot(&mut self, snapshot: SceneSnapshot) {
        if !self.membership.accept_snapshot(snapshot.timestamp) {
            self.stats.stale_snapshots += 1;
            log::debug!(
                "Ignoring stale snapshot ({} <= {})",
                snapshot.timestamp,
                self.membership.last_sync_time()
            );
            return;
        }

        let tombstones = &self.tombstones;
        let objects: Vec<SyncedObject> = snapshot
            .objects
            .into_iter()
            .filter(|obj| {
                let deleted = tombstones.contains(&obj.id);
                if deleted {
                    log::debug!("Snapshot contains deleted object {}; skipping", obj.id);
                }
                !deleted
            })
            .collect();

        let previous = self.store.replace_all(objects);
        for id in previous.keys() {
            if !self.store.contains(id) {
                self.projection.dispose(id);
                self.notify(SyncNotification::ObjectRemoved {
                    id: id.clone(),
                    reason: RemovalReason::Snapshot,
                });
            }
        }
        let local_user = self.membership.local_user();
        for obj in self.store.iter() {
            let origin = if obj.is_owned_by(local_user) {
                ChangeOrigin::Local
            } else {
                ChangeOrigin::Remote
            };
            self.projection.upsert(obj, origin);
        }

        log::info!(
            "Applied scene snapshot at {} ({} objects)",
            snapshot.timestamp,
            self.store.len()
        );
        self.notify(SyncNotification::SnapshotApplied {
            timestamp: snapshot.timestamp,
            object_count: self.store.len(),
        });
    }

    fn on_user_joined(&mut self, user_id: UserId, is_host: bool) {
        let now = self.clock.now_ms();
        let member = self.membership.on_joined(user_id, is_host, now);
        self.notify(SyncNotification::MemberJoined(member));
        self.request_scene_sync();
    }

    /// Remove the member and every object it owns
    fn on_user_left(&mut self, user_id: &UserId) {
        self.membership.on_left(user_id);

        let owned = self.store.owned_by(user_id);
        for id in &owned {
            self.remove(id, RemovalReason::OwnerLeft);
        }
        if !owned.is_empty() {
            log::info!(
                "Removed {} objects owned by departed member {}",
                owned.len(),
                user_id
            );
        }
        self.notify(SyncNotification::MemberLeft(user_id.clone()));
    }

    fn serve_snapshot(&mut self) {
        if !self.membership.is_host() || !self.config.host_serves_snapshots {
            log::trace!("Not serving snapshot (not host or disabled)");
            return;
        }
        let snapshot = self.snapshot();
        log::debug!("Serving snapshot with {} objects", snapshot.objects.len());
        self.send_now(OutboundMessage::SceneSync(snapshot));
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    fn fresh_id(&self, now_ms: u64) -> ObjectId {
        loop {
            let id = ObjectId::generate(&self.config.object_id_prefix, now_ms);
            if !self.store.contains(&id) && !self.tombstones.contains(&id) {
                return id;
            }
        }
    }

    /// Write to the store, then project
    fn commit(&mut self, obj: SyncedObject, origin: ChangeOrigin) {
        let id = obj.id.clone();
        self.store.put(obj);
        if let Some(committed) = self.store.get(&id) {
            self.projection.upsert(committed, origin);
        }
        self.notify(SyncNotification::ObjectCommitted { id, origin });
    }

    /// Remove from the store for good and dispose the node
    fn remove(&mut self, id: &ObjectId, reason: RemovalReason) {
        self.store.remove(id);
        self.tombstones.insert(id.clone());
        self.projection.dispose(id);
        self.notify(SyncNotification::ObjectRemoved {
            id: id.clone(),
            reason,
        });
    }

    fn ignore(&mut self, what: &str) {
        self.stats.events_ignored += 1;
        log::debug!("Ignoring {}", what);
    }

    /// Send a local change now, or queue it behind earlier ones
    fn broadcast(&mut self, event: SyncEvent) {
        let transport = match self.transport.as_mut() {
            Some(transport) => transport,
            None => {
                log::debug!(
                    "No transport; {} for {} not broadcast",
                    event.kind(),
                    event.object_id
                );
                return;
            }
        };

        if !self.config.immediate_send || self.scheduler.has_pending() {
            self.scheduler.enqueue(event);
            return;
        }

        let message = OutboundMessage::ObjectSync(event);
        match send_message(transport.as_mut(), &message) {
            Ok(()) => self.stats.events_sent += 1,
            Err(e) => {
                self.stats.send_failures += 1;
                log::warn!("Broadcast failed, will retry: {}", e);
                if let OutboundMessage::ObjectSync(event) = message {
                    self.scheduler.retry(vec![PendingChange::new(event)]);
                }
            }
        }
    }

    /// Send one batch in order; on failure, requeue the rest and return false
    fn flush_batch(&mut self, batch: Vec<PendingChange>) -> bool {
        if batch.is_empty() {
            return true;
        }
        let transport = match self.transport.as_mut() {
            Some(transport) => transport,
            None => {
                log::debug!("No transport; discarding {} pending changes", batch.len());
                return true;
            }
        };

        let mut remaining = batch.into_iter();
        while let Some(change) = remaining.next() {
            let message = OutboundMessage::ObjectSync(change.event.clone());
            match send_message(transport.as_mut(), &message) {
                Ok(()) => self.stats.events_sent += 1,
                Err(e) => {
                    self.stats.send_failures += 1;
                    log::warn!("Flush failed, requeueing: {}", e);
                    self.scheduler.requeue(remaining.collect());
                    self.scheduler.retry(vec![change]);
                    return false;
                }
            }
        }
        true
    }

    /// Send a control message without queueing
    fn send_now(&mut self, message: OutboundMessage) {
        let transport = match self.transport.as_mut() {
            Some(transport) => transport,
            None => {
                log::debug!("No transport; {} not sent", message.name());
                return;
            }
        };
        if let Err(e) = send_message(transport.as_mut(), &message) {
            self.stats.send_failures += 1;
            log::warn!("Failed to send {}: {}", message.name(), e);
        }
    }

    fn notify(&mut self, notification: SyncNotification) {
        if self.subscribers.is_empty() {
            return;
        }
        self.subscribers
            .retain(|tx| tx.send(notification.clone()).is_ok());
    }
}

fn send_message(transport: &mut dyn Transport, message: &OutboundMessage) -> SyncResult<()> {
    if !transport.is_connected() {
        return Err(TransportError::NotConnected.into());
    }
    let envelope = protocol::encode(message)?;
    transport.send(envelope)?;
    Ok(())
}
