mod common;

use common::{build_test_app, test_config};
use llm_gateway::models::EntityType;
use llm_gateway::services::hash_api_key;
use std::collections::HashSet;

/// Concurrent first-use of the same entity must converge on a single stored
/// plan: the first writer wins, everyone else reads that document.
#[tokio::test]
async fn test_concurrent_get_or_create_yields_one_plan() {
    let app = build_test_app(test_config());

    let mut handles = Vec::new();
    for _ in 0..20 {
        let manager = app.state.plan_manager.clone();
        handles.push(tokio::spawn(async move {
            manager
                .get_or_create_usage_plan("user-racy", EntityType::User)
                .await
        }));
    }

    let mut usage_ids = HashSet::new();
    for handle in handles {
        let plan = handle.await.expect("task").expect("plan");
        usage_ids.insert(plan.usage_id);
    }

    assert_eq!(usage_ids.len(), 1);
    assert_eq!(app.store.plan_count(), 1);
}

/// Revocation must be visible immediately, even when the old copy of the
/// plan is still warm in the cache.
#[tokio::test]
async fn test_revoke_is_visible_despite_warm_cache() {
    let app = build_test_app(test_config());
    let manager = &app.state.plan_manager;

    let created = manager
        .get_or_create_usage_plan("user-1", EntityType::User)
        .await
        .expect("create");
    assert!(created.active);

    // Warm the cache, then revoke.
    manager
        .get_usage_plan("user-1", EntityType::User)
        .await
        .expect("warm");
    assert!(manager
        .revoke_usage_plan("user-1", EntityType::User)
        .await
        .expect("revoke"));

    let after = manager
        .get_usage_plan("user-1", EntityType::User)
        .await
        .expect("read after revoke");
    assert!(!after.active);
}

#[tokio::test]
async fn test_revoking_unknown_plan_reports_absence() {
    let app = build_test_app(test_config());
    assert!(!app
        .state
        .plan_manager
        .revoke_usage_plan("ghost", EntityType::User)
        .await
        .expect("revoke"));
}

/// API-key entities are stored under a one-way hash; the raw key must never
/// appear in the store.
#[tokio::test]
async fn test_raw_api_key_never_stored() {
    let app = build_test_app(test_config());
    let raw_key = "sk-live-secret-value";

    app.state
        .plan_manager
        .get_or_create_usage_plan(raw_key, EntityType::ApiKey)
        .await
        .expect("create");

    // The plan is addressable by the raw key, but stored under the hash.
    let plan = app
        .state
        .plan_manager
        .get_usage_plan(raw_key, EntityType::ApiKey)
        .await
        .expect("lookup");
    assert_eq!(plan.entity_id, hash_api_key(raw_key));
    assert!(!plan.entity_id.contains("secret"));
}
