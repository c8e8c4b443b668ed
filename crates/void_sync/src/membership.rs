//! Session Membership
//!
//! Tracks who is in the session, which member is host, and when the last
//! full snapshot was accepted.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::object::UserId;

/// A member of the collaborative session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMember {
    pub user_id: UserId,
    pub is_host: bool,
    /// Local clock time the join was observed (ms)
    pub joined_at: u64,
}

/// Membership bookkeeping for one local user
#[derive(Debug)]
pub struct Membership {
    local_user: UserId,
    is_host: bool,
    members: HashMap<UserId, SessionMember>,
    last_sync_time: u64,
}

impl Membership {
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            is_host: false,
            members: HashMap::new(),
            last_sync_time: 0,
        }
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    /// Whether the local user holds the host role
    pub fn is_host(&self) -> bool {
        self.is_host
    }

    /// Timestamp of the newest accepted snapshot
    pub fn last_sync_time(&self) -> u64 {
        self.last_sync_time
    }

    /// Whether an event came from ourselves
    pub fn is_echo(&self, origin: &UserId) -> bool {
        origin == &self.local_user
    }

    /// Record a join; returns the member entry
    pub fn on_joined(&mut self, user_id: UserId, is_host: bool, now_ms: u64) -> SessionMember {
        if user_id == self.local_user {
            self.is_host = is_host;
            log::info!(
                "Joined session as {} ({})",
                user_id,
                if is_host { "host" } else { "guest" }
            );
        } else {
            log::debug!("Member {} joined", user_id);
        }

        let member = SessionMember {
            user_id: user_id.clone(),
            is_host,
            joined_at: now_ms,
        };
        self.members.insert(user_id, member.clone());
        member
    }

    /// Record a departure; returns the member if it was known
    pub fn on_left(&mut self, user_id: &UserId) -> Option<SessionMember> {
        log::debug!("Member {} left", user_id);
        self.members.remove(user_id)
    }

    /// Accept a snapshot only if it is newer than the last one accepted
    pub fn accept_snapshot(&mut self, timestamp: u64) -> bool {
        if timestamp <= self.last_sync_time {
            return false;
        }
        self.last_sync_time = timestamp;
        true
    }

    pub fn member(&self, user_id: &UserId) -> Option<&SessionMember> {
        self.members.get(user_id)
    }

    /// Known members, oldest join first
    pub fn members(&self) -> Vec<SessionMember> {
        let mut members: Vec<SessionMember> = self.members.values().cloned().collect();
        members.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        members
    }

    /// The member currently holding the host role, if known
    pub fn host(&self) -> Option<&SessionMember> {
        self.members.values().find(|m| m.is_host)
    }

    /// Forget everything except the local identity
    pub fn reset(&mut self) {
        self.is_host = false;
        self.members.clear();
        self.last_sync_time = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_join_sets_role() {
        let mut membership = Membership::new(UserId::new("alice"));
        assert!(!membership.is_host());

        membership.on_joined(UserId::new("bob"), true, 1);
        assert!(!membership.is_host());

        membership.on_joined(UserId::new("alice"), true, 2);
        assert!(membership.is_host());
        assert_eq!(membership.members().len(), 2);
    }

    #[test]
    fn test_members_sorted_by_join() {
        let mut membership = Membership::new(UserId::new("alice"));
        membership.on_joined(UserId::new("carol"), false, 5);
        membership.on_joined(UserId::new("bob"), true, 3);

        let members = membership.members();
        assert_eq!(members[0].user_id.as_str(), "bob");
        assert_eq!(membership.host().unwrap().user_id.as_str(), "bob");

        assert!(membership.on_left(&UserId::new("bob")).is_some());
        assert!(membership.on_left(&UserId::new("bob")).is_none());
        assert!(membership.host().is_none());
    }

    #[test]
    fn test_snapshot_freshness() {
        let mut membership = Membership::new(UserId::new("alice"));
        assert!(!membership.accept_snapshot(0));
        assert!(membership.accept_snapshot(10));
        assert!(!membership.accept_snapshot(10));
        assert!(!membership.accept_snapshot(9));
        assert!(membership.accept_snapshot(11));
        assert_eq!(membership.last_sync_time(), 11);
    }

    #[test]
    fn test_echo() {
        let membership = Membership::new(UserId::new("alice"));
        assert!(membership.is_echo(&UserId::new("alice")));
        assert!(!membership.is_echo(&UserId::new("bob")));
    }
}
