//! Conflict Resolution
//!
//! Reconciles a locally stored object with a concurrently written remote
//! version of the same object.
//!
//! The default policy is last-write-wins on the wall-clock `timestamp`
//! stamped by each peer. Peers' clocks are independent, so this is only
//! suitable for soft, best-effort collaborative editing; it does not give
//! a causal or strongly consistent ordering.

use std::panic::{self, AssertUnwindSafe};

use crate::object::SyncedObject;

/// Merge function for two versions of the same object
///
/// Implementations must be pure and deterministic: the same inputs always
/// produce the same output, and the output keeps the input's `id`.
pub trait ConflictResolver: Send {
    fn resolve(&self, local: &SyncedObject, remote: &SyncedObject) -> SyncedObject;
}

impl<F> ConflictResolver for F
where
    F: Fn(&SyncedObject, &SyncedObject) -> SyncedObject + Send,
{
    fn resolve(&self, local: &SyncedObject, remote: &SyncedObject) -> SyncedObject {
        self(local, remote)
    }
}

/// Remote wins only when strictly newer; ties keep the local version
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriteWins;

impl ConflictResolver for LastWriteWins {
    fn resolve(&self, local: &SyncedObject, remote: &SyncedObject) -> SyncedObject {
        last_write_wins(local, remote)
    }
}

/// Default resolution policy
pub fn last_write_wins(local: &SyncedObject, remote: &SyncedObject) -> SyncedObject {
    if remote.timestamp > local.timestamp {
        remote.clone()
    } else {
        local.clone()
    }
}

/// Result of running a resolver behind the panic guard
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Resolved {
    pub object: SyncedObject,
    /// The installed resolver failed and last-write-wins was used instead
    pub fell_back: bool,
}

/// Run `resolver`, falling back to last-write-wins if it panics or
/// returns an object with a different ID
pub(crate) fn resolve_guarded(
    resolver: &dyn ConflictResolver,
    local: &SyncedObject,
    remote: &SyncedObject,
) -> Resolved {
    match panic::catch_unwind(AssertUnwindSafe(|| resolver.resolve(local, remote))) {
        Ok(object) if object.id == local.id => Resolved {
            object,
            fell_back: false,
        },
        Ok(object) => {
            log::warn!(
                "Conflict resolver returned object {} for {}; using last-write-wins",
                object.id,
                local.id
            );
            Resolved {
                object: last_write_wins(local, remote),
                fell_back: true,
            }
        }
        Err(payload) => {
            let message = if let Some(s) = payload.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic".to_string()
            };
            log::error!(
                "Conflict resolver panicked on {}: {}; using last-write-wins",
                local.id,
                message
            );
            Resolved {
                object: last_write_wins(local, remote),
                fell_back: true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ObjectId, ObjectKind, UserId};
    use glam::DVec3;

    fn at(timestamp: u64, x: f64) -> SyncedObject {
        SyncedObject::new(
            ObjectId::new("box1"),
            ObjectKind::Box,
            DVec3::new(x, 0.0, 0.0),
            UserId::new("alice"),
            timestamp,
        )
    }

    #[test]
    fn test_lww_newer_remote_wins() {
        let resolved = LastWriteWins.resolve(&at(100, 1.0), &at(150, 2.0));
        assert_eq!(resolved.timestamp, 150);
        assert_eq!(resolved.position.x, 2.0);
    }

    #[test]
    fn test_lww_older_remote_loses() {
        let resolved = LastWriteWins.resolve(&at(100, 1.0), &at(50, 2.0));
        assert_eq!(resolved.timestamp, 100);
        assert_eq!(resolved.position.x, 1.0);
    }

    #[test]
    fn test_lww_tie_keeps_local() {
        let resolved = last_write_wins(&at(100, 1.0), &at(100, 2.0));
        assert_eq!(resolved.position.x, 1.0);
    }

    #[test]
    fn test_closure_resolver() {
        let always_remote = |_: &SyncedObject, remote: &SyncedObject| remote.clone();
        let resolved = resolve_guarded(&always_remote, &at(100, 1.0), &at(50, 2.0));
        assert!(!resolved.fell_back);
        assert_eq!(resolved.object.timestamp, 50);
    }

    #[test]
    fn test_panicking_resolver_falls_back() {
        let broken = |_: &SyncedObject, _: &SyncedObject| -> SyncedObject {
            panic!("resolver bug")
        };
        let resolved = resolve_guarded(&broken, &at(100, 1.0), &at(150, 2.0));
        assert!(resolved.fell_back);
        assert_eq!(resolved.object.timestamp, 150);
    }

    #[test]
    fn test_id_changing_resolver_falls_back() {
        let renamer = |local: &SyncedObject, _: &SyncedObject| {
            let mut obj = local.clone();
            obj.id = ObjectId::new("elsewhere");
            obj
        };
        let resolved = resolve_guarded(&renamer, &at(100, 1.0), &at(50, 2.0));
        assert!(resolved.fell_back);
        assert_eq!(resolved.object.id.as_str(), "box1");
        assert_eq!(resolved.object.timestamp, 100);
    }
}
