use crate::error::Result;
use crate::models::{RagCollectionConfig, RepositoryConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
    Write,
    Delete,
}

/// Request-scoped identity extracted by the caller from whatever
/// authentication mechanism fronts this core.
#[derive(Debug, Clone)]
pub struct UserContext {
    pub user_id: String,
    pub groups: Vec<String>,
    pub is_admin: bool,
}

/// Any protected resource, reduced to the metadata the policy needs.
#[derive(Debug, Clone)]
pub struct ResourceContext {
    pub resource_id: String,
    pub resource_type: String,
    pub allowed_groups: Vec<String>,
    pub owner_id: Option<String>,
    pub is_private: bool,
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessDecision {
    pub allowed: bool,
    pub permission: Permission,
    pub reason: String,
    pub granting_groups: Vec<String>,
    pub decided_at: DateTime<Utc>,
}

impl AccessDecision {
    fn allow(permission: Permission, reason: &str, granting_groups: Vec<String>) -> Self {
        Self {
            allowed: true,
            permission,
            reason: reason.to_string(),
            granting_groups,
            decided_at: Utc::now(),
        }
    }

    fn deny(permission: Permission, reason: &str) -> Self {
        Self {
            allowed: false,
            permission,
            reason: reason.to_string(),
            granting_groups: Vec::new(),
            decided_at: Utc::now(),
        }
    }
}

/// Evaluate the three policy rules in order, stopping at the first that
/// decides: admin override, private owner-only, then group intersection.
pub fn evaluate_access(
    user: &UserContext,
    resource: &ResourceContext,
    permission: Permission,
) -> AccessDecision {
    if user.is_admin {
        return AccessDecision::allow(permission, "admin override", Vec::new());
    }

    if resource.is_private {
        if let Some(owner) = &resource.owner_id {
            if owner == &user.user_id {
                return AccessDecision::allow(permission, "resource owner", Vec::new());
            }
            // Private resources are owner-only regardless of group membership.
            return AccessDecision::deny(permission, "private resource is owner-only");
        }
    }

    if resource.allowed_groups.is_empty() {
        return AccessDecision::allow(permission, "public resource", Vec::new());
    }

    let granting: Vec<String> = user
        .groups
        .iter()
        .filter(|group| resource.allowed_groups.contains(group))
        .cloned()
        .collect();

    if granting.is_empty() {
        AccessDecision::deny(permission, "no shared groups")
    } else {
        AccessDecision::allow(permission, "group membership", granting)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AccessCacheConfig {
    pub ttl: Duration,
    pub capacity: u64,
}

impl Default for AccessCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            capacity: 10_000,
        }
    }
}

type CacheKey = (String, Permission, String);

/// TTL cache around `evaluate_access`, keyed per (resource, permission,
/// user). A cached decision is structurally identical to a fresh one; only
/// its timestamp may differ from re-evaluation.
pub struct CachedAccessControlService {
    cache: Cache<CacheKey, AccessDecision>,
}

impl CachedAccessControlService {
    pub fn new(config: AccessCacheConfig) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(config.capacity)
                .time_to_live(config.ttl)
                .support_invalidation_closures()
                .build(),
        }
    }

    pub fn check_access(
        &self,
        user: &UserContext,
        resource: &ResourceContext,
        permission: Permission,
    ) -> AccessDecision {
        let key = (
            resource.resource_id.clone(),
            permission,
            user.user_id.clone(),
        );

        if let Some(decision) = self.cache.get(&key) {
            debug!(resource = %resource.resource_id, user = %user.user_id, "access cache hit");
            return decision;
        }

        let decision = evaluate_access(user, resource, permission);
        self.cache.insert(key, decision.clone());
        decision
    }

    pub fn clear_cache(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks();
    }

    /// Invalidate every cached decision for one resource, so a group-list
    /// change or visibility flip does not require a full flush. Visible to
    /// reads before this returns.
    pub fn clear_cache_for_resource(&self, resource_id: &str) {
        let target = resource_id.to_string();
        if let Err(error) = self
            .cache
            .invalidate_entries_if(move |key, _| key.0 == target)
        {
            warn!(resource = resource_id, %error, "scoped cache invalidation failed");
            self.cache.invalidate_all();
        }
        self.cache.run_pending_tasks();
    }
}

/// Lookups the collection policy composes with the generic engine.
#[async_trait]
pub trait CollectionDirectory: Send + Sync {
    async fn collection(&self, collection_id: &str) -> Result<Option<RagCollectionConfig>>;
    async fn repository(&self, repository_id: &str) -> Result<Option<RepositoryConfig>>;
}

/// Collection-specific policy: resolves a collection to its resource
/// context, adds the repository-level "user collections disabled" rule, and
/// reuses the cached generic engine underneath.
pub struct CollectionAccessPolicy<D> {
    directory: D,
    service: CachedAccessControlService,
}

impl<D: CollectionDirectory> CollectionAccessPolicy<D> {
    pub fn new(directory: D, cache: AccessCacheConfig) -> Self {
        Self {
            directory,
            service: CachedAccessControlService::new(cache),
        }
    }

    pub async fn check_collection_permission(
        &self,
        user: &UserContext,
        collection_id: &str,
        permission: Permission,
    ) -> AccessDecision {
        let collection = match self.directory.collection(collection_id).await {
            Ok(Some(collection)) => collection,
            Ok(None) => return AccessDecision::deny(permission, "not found"),
            Err(error) => {
                // Underlying lookup errors surface as a denial, never as a
                // stack trace to the caller.
                warn!(collection = collection_id, %error, "collection lookup failed");
                return AccessDecision::deny(permission, "not authorized");
            }
        };

        if permission == Permission::Write && !user.is_admin {
            match self.directory.repository(&collection.repository_id).await {
                Ok(Some(repository)) if !repository.allow_user_collections => {
                    return AccessDecision::deny(
                        permission,
                        "repository does not allow user-created collections",
                    );
                }
                Ok(Some(_)) => {}
                Ok(None) => return AccessDecision::deny(permission, "not found"),
                Err(error) => {
                    warn!(repository = %collection.repository_id, %error, "repository lookup failed");
                    return AccessDecision::deny(permission, "not authorized");
                }
            }
        }

        let resource = ResourceContext {
            resource_id: collection.collection_id.clone(),
            resource_type: "collection".to_string(),
            allowed_groups: collection.allowed_groups.clone(),
            owner_id: collection.created_by.clone(),
            is_private: collection.private,
            parent_id: Some(collection.repository_id.clone()),
        };

        self.service.check_access(user, &resource, permission)
    }

    pub fn invalidate_collection(&self, collection_id: &str) {
        self.service.clear_cache_for_resource(collection_id);
    }

    pub fn clear_cache(&self) {
        self.service.clear_cache();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RagError;
    use crate::models::CollectionStatus;

    fn user(id: &str, groups: &[&str], admin: bool) -> UserContext {
        UserContext {
            user_id: id.to_string(),
            groups: groups.iter().map(|group| group.to_string()).collect(),
            is_admin: admin,
        }
    }

    fn private_resource() -> ResourceContext {
        ResourceContext {
            resource_id: "coll-1".to_string(),
            resource_type: "collection".to_string(),
            allowed_groups: vec!["eng".to_string()],
            owner_id: Some("alice".to_string()),
            is_private: true,
            parent_id: Some("repo-1".to_string()),
        }
    }

    #[test]
    fn admin_override_always_wins() {
        let decision = evaluate_access(
            &user("mallory", &[], true),
            &private_resource(),
            Permission::Delete,
        );
        assert!(decision.allowed);
        assert_eq!(decision.reason, "admin override");
    }

    #[test]
    fn private_resources_are_owner_only_despite_group_match() {
        let decision = evaluate_access(
            &user("bob", &["eng"], false),
            &private_resource(),
            Permission::Read,
        );
        assert!(!decision.allowed);

        let decision = evaluate_access(
            &user("alice", &[], false),
            &private_resource(),
            Permission::Read,
        );
        assert!(decision.allowed);
        assert_eq!(decision.reason, "resource owner");
    }

    #[test]
    fn empty_group_list_means_public() {
        let mut resource = private_resource();
        resource.is_private = false;
        resource.allowed_groups.clear();

        let decision = evaluate_access(&user("carol", &[], false), &resource, Permission::Read);
        assert!(decision.allowed);
        assert_eq!(decision.reason, "public resource");
    }

    #[test]
    fn group_intersection_records_granting_groups() {
        let mut resource = private_resource();
        resource.is_private = false;
        resource.allowed_groups = vec!["eng".to_string(), "ops".to_string()];

        let decision = evaluate_access(
            &user("bob", &["ops", "sales"], false),
            &resource,
            Permission::Read,
        );
        assert!(decision.allowed);
        assert_eq!(decision.granting_groups, vec!["ops".to_string()]);

        let decision = evaluate_access(&user("bob", &["sales"], false), &resource, Permission::Read);
        assert!(!decision.allowed);
    }

    #[test]
    fn cache_hit_matches_a_fresh_evaluation() {
        let service = CachedAccessControlService::new(AccessCacheConfig::default());
        let mut resource = private_resource();
        resource.is_private = false;
        let requester = user("bob", &["eng"], false);

        let first = service.check_access(&requester, &resource, Permission::Read);
        let cached = service.check_access(&requester, &resource, Permission::Read);
        assert_eq!(first.allowed, cached.allowed);
        assert_eq!(first.reason, cached.reason);
        assert_eq!(first.granting_groups, cached.granting_groups);
    }

    #[test]
    fn scoped_invalidation_drops_stale_allows() {
        let service = CachedAccessControlService::new(AccessCacheConfig::default());
        let mut resource = private_resource();
        resource.is_private = false;
        let requester = user("bob", &["eng"], false);

        let first = service.check_access(&requester, &resource, Permission::Read);
        assert!(first.allowed);

        // Permission downgrade: bob's group is removed from the resource.
        resource.allowed_groups = vec!["ops".to_string()];

        // Without invalidation the stale allow is still served.
        assert!(service.check_access(&requester, &resource, Permission::Read).allowed);

        service.clear_cache_for_resource(&resource.resource_id);
        let after = service.check_access(&requester, &resource, Permission::Read);
        assert!(!after.allowed);
    }

    struct FakeDirectory {
        allow_user_collections: bool,
        fail_lookup: bool,
    }

    #[async_trait]
    impl CollectionDirectory for FakeDirectory {
        async fn collection(&self, collection_id: &str) -> Result<Option<RagCollectionConfig>> {
            if self.fail_lookup {
                return Err(RagError::transient("directory", "timeout"));
            }
            if collection_id != "coll-1" {
                return Ok(None);
            }
            Ok(Some(RagCollectionConfig {
                collection_id: "coll-1".to_string(),
                repository_id: "repo-1".to_string(),
                name: "default".to_string(),
                allowed_groups: vec!["eng".to_string()],
                created_by: None,
                private: false,
                status: CollectionStatus::Active,
                chunk_strategy: None,
            }))
        }

        async fn repository(&self, _repository_id: &str) -> Result<Option<RepositoryConfig>> {
            Ok(Some(RepositoryConfig {
                repository_id: "repo-1".to_string(),
                backend: "opensearch".to_string(),
                embedding_model: "e5-large".to_string(),
                allow_user_collections: self.allow_user_collections,
            }))
        }
    }

    #[tokio::test]
    async fn repository_flag_denies_write_for_non_admins() {
        let policy = CollectionAccessPolicy::new(
            FakeDirectory {
                allow_user_collections: false,
                fail_lookup: false,
            },
            AccessCacheConfig::default(),
        );

        let denied = policy
            .check_collection_permission(&user("bob", &["eng"], false), "coll-1", Permission::Write)
            .await;
        assert!(!denied.allowed);

        let read_ok = policy
            .check_collection_permission(&user("bob", &["eng"], false), "coll-1", Permission::Read)
            .await;
        assert!(read_ok.allowed);

        let admin_ok = policy
            .check_collection_permission(&user("root", &[], true), "coll-1", Permission::Write)
            .await;
        assert!(admin_ok.allowed);
    }

    #[tokio::test]
    async fn lookup_failures_surface_as_denials() {
        let policy = CollectionAccessPolicy::new(
            FakeDirectory {
                allow_user_collections: true,
                fail_lookup: true,
            },
            AccessCacheConfig::default(),
        );

        let decision = policy
            .check_collection_permission(&user("bob", &["eng"], false), "coll-1", Permission::Read)
            .await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "not authorized");

        let missing = CollectionAccessPolicy::new(
            FakeDirectory {
                allow_user_collections: true,
                fail_lookup: false,
            },
            AccessCacheConfig::default(),
        );
        let decision = missing
            .check_collection_permission(&user("bob", &["eng"], false), "absent", Permission::Read)
            .await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "not found");
    }
}
