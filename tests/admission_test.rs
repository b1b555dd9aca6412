mod common;

use common::{build_test_app, test_config};
use llm_gateway::models::{EntityType, RateLimits, UsagePlan, WindowUsage};
use llm_gateway::services::cache::WindowKey;
use llm_gateway::services::{QuotaCache, TokenCounts};
use std::collections::HashMap;

/// With an rpm of N, exactly N of many concurrent checks in one window may be
/// admitted. Atomic increment-then-compare means no interleaving can admit
/// more.
#[tokio::test]
async fn test_concurrent_checks_admit_exactly_rpm() {
    let rpm = 5;
    let attempts = 40;

    let app = build_test_app(test_config());
    let plan = UsagePlan::new_default(
        "svc-burst".to_string(),
        EntityType::Service,
        RateLimits {
            input_tpm: 1_000_000,
            output_tpm: 1_000_000,
            rpm,
        },
    );

    let window_id = app.state.admission.current_window();
    let mut handles = Vec::with_capacity(attempts);
    for _ in 0..attempts {
        let admission = app.state.admission.clone();
        let plan = plan.clone();
        handles.push(tokio::spawn(async move {
            admission
                .check_in_window(&plan, "gpt-4o", 1, 1, window_id)
                .await
        }));
    }

    let mut admitted = 0;
    for handle in handles {
        let outcome = handle.await.expect("task").expect("check");
        if outcome.result.allowed {
            admitted += 1;
        }
    }

    assert_eq!(admitted, rpm);
}

/// Entity-wide counters aggregate across models while each model keeps its
/// own tally.
#[tokio::test]
async fn test_entity_usage_spans_models() {
    let app = build_test_app(test_config());
    let plan = UsagePlan::new_default(
        "user-multi".to_string(),
        EntityType::User,
        RateLimits {
            input_tpm: 1_000,
            output_tpm: 1_000,
            rpm: 10,
        },
    );

    let window_id = app.state.admission.current_window();
    app.state
        .admission
        .check_in_window(&plan, "gpt-4o", 5, 5, window_id)
        .await
        .expect("check");
    let outcome = app
        .state
        .admission
        .check_in_window(&plan, "claude-3", 5, 5, window_id)
        .await
        .expect("check");

    assert!(outcome.result.allowed);
    assert_eq!(outcome.result.model_usage.requests, 1);
    assert_eq!(outcome.result.current_usage.requests, 2);
    assert_eq!(outcome.result.current_usage.input_tokens, 10);
}

/// A fail-open admission during a cache outage books nothing into the
/// window. Once the cache recovers, reconciling that call must not subtract
/// its never-booked estimate from counters other callers legitimately hold.
#[tokio::test]
async fn test_degraded_admission_leaves_recovered_counters_intact() {
    let app = build_test_app(test_config());
    let plan = UsagePlan::new_default(
        "svc-a".to_string(),
        EntityType::Service,
        RateLimits {
            input_tpm: 1_000,
            output_tpm: 1_000,
            rpm: 10,
        },
    );
    let window_id = app.state.admission.current_window();

    // Another caller books 5 input tokens while the cache is healthy.
    app.state
        .admission
        .check_in_window(&plan, "gpt-4o", 5, 5, window_id)
        .await
        .expect("healthy check");

    // Outage: the check fails open without touching counters.
    app.cache.set_failing(true);
    let outcome = app
        .state
        .admission
        .check_in_window(&plan, "gpt-4o", 100, 100, window_id)
        .await
        .expect("degraded check");
    assert!(outcome.result.allowed);
    assert!(outcome.degraded);

    // Cache recovers before the completed call reconciles. Nothing was
    // booked for the degraded call, so the booked amount is the actual.
    app.cache.set_failing(false);
    let actual = TokenCounts {
        input_tokens: 10,
        output_tokens: 10,
    };
    app.state
        .reconciler
        .reconcile(
            &plan.entity_id,
            plan.entity_type,
            &plan.tenant_id,
            "gpt-4o",
            window_id,
            actual,
            actual,
            HashMap::new(),
        )
        .await
        .expect("reconcile");

    let key = WindowKey {
        entity_id: plan.entity_id.clone(),
        entity_type: plan.entity_type,
        model: "gpt-4o".to_string(),
        window_id,
    };
    let (model_usage, _) = app
        .cache
        .incr_window(&key, WindowUsage::default(), 60)
        .await
        .expect("snapshot");
    assert_eq!(model_usage.input_tokens, 5);
    assert_eq!(model_usage.requests, 1);
}
