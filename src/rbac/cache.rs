//! Per-actor cache of resolved role grants.
//!
//! Entries hold every unexpired assignment with its role's permission strings, so
//! scope matching and the validity window are re-checked on each lookup. A cached
//! entry can therefore be stale in content (a revoked grant) for at most the TTL,
//! unless the writer invalidates it.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::models::{is_within, scope_matches, UserRole};
use crate::authz::principal::Attributes;

/// One assignment's contribution to an actor's permissions.
#[derive(Debug, Clone)]
pub struct Grant {
    pub role_name: String,
    pub scope_type: Option<String>,
    pub scope_id: Option<String>,
    pub valid_from: DateTime<Utc>,
    pub valid_until: Option<DateTime<Utc>>,
    pub permissions: Arc<HashSet<String>>,
}

impl Grant {
    pub fn from_assignment(
        assignment: &UserRole,
        role_name: impl Into<String>,
        permissions: Arc<HashSet<String>>,
    ) -> Self {
        Self {
            role_name: role_name.into(),
            scope_type: assignment.scope_type.clone(),
            scope_id: assignment.scope_id.clone(),
            valid_from: assignment.valid_from,
            valid_until: assignment.valid_until,
            permissions,
        }
    }

    pub fn applies(&self, resource: Option<&dyn Attributes>, now: DateTime<Utc>) -> bool {
        is_within(self.valid_from, self.valid_until, now)
            && scope_matches(self.scope_type.as_deref(), self.scope_id.as_deref(), resource)
    }
}

/// Union of the permissions of every grant applying to `resource` at `now`.
pub fn effective_permissions(
    grants: &[Grant],
    resource: Option<&dyn Attributes>,
    now: DateTime<Utc>,
) -> HashSet<String> {
    grants
        .iter()
        .filter(|grant| grant.applies(resource, now))
        .flat_map(|grant| grant.permissions.iter().cloned())
        .collect()
}

struct CacheEntry {
    grants: Arc<Vec<Grant>>,
    computed_at: Instant,
}

#[derive(Default)]
pub struct PermissionCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    generation: AtomicU64,
}

impl PermissionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh entry for `actor_id`, if any. An expired entry is evicted.
    pub fn get(&self, actor_id: &str, ttl: Duration) -> Option<Arc<Vec<Grant>>> {
        {
            let entries = self.entries.read();
            let entry = entries.get(actor_id)?;
            if entry.computed_at.elapsed() < ttl {
                return Some(entry.grants.clone());
            }
        }

        let mut entries = self.entries.write();
        if entries
            .get(actor_id)
            .is_some_and(|entry| entry.computed_at.elapsed() >= ttl)
        {
            entries.remove(actor_id);
            tracing::trace!(actor_id = %actor_id, "evicted expired grants");
        }
        None
    }

    /// Drops every entry older than `ttl`.
    pub fn prune(&self, ttl: Duration) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.computed_at.elapsed() < ttl);
        before - entries.len()
    }

    /// Token to pass to [`insert`](Self::insert) for a computation starting now.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Stores `grants` unless an invalidation happened since `generation` was read.
    pub fn insert(&self, actor_id: &str, generation: u64, grants: Arc<Vec<Grant>>) -> bool {
        let mut entries = self.entries.write();
        if self.generation.load(Ordering::Acquire) != generation {
            return false;
        }
        entries.insert(
            actor_id.to_string(),
            CacheEntry {
                grants,
                computed_at: Instant::now(),
            },
        );
        true
    }

    pub fn invalidate(&self, actor_id: &str) {
        let mut entries = self.entries.write();
        self.generation.fetch_add(1, Ordering::AcqRel);
        entries.remove(actor_id);
    }

    pub fn clear(&self) {
        let mut entries = self.entries.write();
        self.generation.fetch_add(1, Ordering::AcqRel);
        entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::principal::ResourceContext;
    use crate::rbac::models::NewAssignment;
    use uuid::Uuid;

    fn grant(assignment: NewAssignment, perms: &[&str]) -> Grant {
        let permissions = perms.iter().map(|p| p.to_string()).collect();
        Grant::from_assignment(&assignment.into_user_role(), "r", Arc::new(permissions))
    }

    #[test]
    fn fresh_entries_are_served_until_ttl() {
        let cache = PermissionCache::new();
        let generation = cache.generation();
        assert!(cache.insert("u1", generation, Arc::new(Vec::new())));

        assert!(cache.get("u1", Duration::from_secs(60)).is_some());
        assert!(cache.get("u2", Duration::from_secs(60)).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn expired_entries_are_evicted() {
        let cache = PermissionCache::new();
        cache.insert("u1", cache.generation(), Arc::new(Vec::new()));
        cache.insert("u2", cache.generation(), Arc::new(Vec::new()));

        assert!(cache.get("u1", Duration::ZERO).is_none());
        assert_eq!(cache.len(), 1);
        assert!(cache.get("u1", Duration::from_secs(60)).is_none());

        assert_eq!(cache.prune(Duration::from_secs(60)), 0);
        assert_eq!(cache.prune(Duration::ZERO), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidation_discards_in_flight_results() {
        let cache = PermissionCache::new();
        let generation = cache.generation();
        cache.invalidate("u1");

        assert!(!cache.insert("u1", generation, Arc::new(Vec::new())));
        assert!(cache.is_empty());

        assert!(cache.insert("u1", cache.generation(), Arc::new(Vec::new())));
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn effective_permissions_respect_scope() {
        let role_id = Uuid::new_v4();
        let grants = vec![
            grant(NewAssignment::new("u1", role_id), &["posts:read"]),
            grant(
                NewAssignment::new("u1", role_id).scoped("project", "p1"),
                &["tasks:update"],
            ),
        ];
        let now = Utc::now();

        let global = effective_permissions(&grants, None, now);
        assert_eq!(global, HashSet::from(["posts:read".to_string()]));

        let task = ResourceContext::of_type("tasks").with_project("p1");
        let scoped = effective_permissions(&grants, Some(&task), now);
        assert!(scoped.contains("tasks:update"));
        assert!(scoped.contains("posts:read"));
    }
}
