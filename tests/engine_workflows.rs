//! Integration tests for common engine workflows.
//!
//! Two "processes" are modeled as two engines sharing the same Remote
//! and Durable backends, so invalidation, storage coherence, and metric
//! aggregation can be exercised end to end without external services.

use std::sync::Arc;
use std::time::Duration;

use magick::{
    CircuitBreaker, Context, Engine, EngineConfig, FlagOptions, FlagValue, MemoryDurable,
    MemoryRemote, Operation, StoreRegistry, Variant,
};
use magick::prelude::RemoteBackend;

fn engine_over(
    remote: &Arc<MemoryRemote>,
    durable: &Arc<MemoryDurable>,
    config: EngineConfig,
) -> Engine {
    let registry = StoreRegistry::new(
        config.memory_ttl,
        CircuitBreaker::new(config.circuit_breaker.clone()),
    )
    .with_remote(Arc::clone(remote) as Arc<dyn magick::prelude::RemoteBackend>)
    .with_durable(Arc::clone(durable) as Arc<dyn magick::prelude::DurableBackend>)
    .with_async_updates(config.async_updates);
    Engine::with_registry(config, registry)
}

fn shared_pair() -> (Engine, Engine, Arc<MemoryRemote>, Arc<MemoryDurable>) {
    let remote = Arc::new(MemoryRemote::new());
    let durable = Arc::new(MemoryDurable::new());
    let p1 = engine_over(&remote, &durable, EngineConfig::default());
    let p2 = engine_over(&remote, &durable, EngineConfig::default());
    (p1, p2, remote, durable)
}

// Long enough to cover pub/sub delivery plus the 100 ms per-flag
// debounce window at each subscriber.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

#[tokio::test]
async fn test_write_propagates_across_processes() {
    let (p1, p2, remote, _durable) = shared_pair();

    p1.register("flag_x", FlagOptions::boolean(false)).await.unwrap();
    p2.register("flag_x", FlagOptions::boolean(false)).await.unwrap();
    settle().await;

    let ctx = Context::new();
    assert!(!p2.is_enabled("flag_x", &ctx).await);

    p1.get("flag_x").set_value(true).await.unwrap();
    settle().await;

    // The invalidation has been consumed: the second process answers
    // from its refreshed local projection, no Remote read needed.
    remote.set_failing(true);
    assert!(p2.is_enabled("flag_x", &ctx).await);
    remote.set_failing(false);

    p1.shutdown().await;
    p2.shutdown().await;
}

#[tokio::test]
async fn test_delete_propagates_across_processes() {
    let (p1, p2, _remote, _durable) = shared_pair();

    p1.register("doomed", FlagOptions::boolean(true)).await.unwrap();
    p2.register("doomed", FlagOptions::boolean(true)).await.unwrap();
    settle().await;
    assert!(p2.is_enabled("doomed", &Context::new()).await);

    p1.delete("doomed").await.unwrap();
    settle().await;

    assert!(!p2.is_enabled("doomed", &Context::new()).await);

    p1.shutdown().await;
    p2.shutdown().await;
}

#[tokio::test]
async fn test_cold_process_reads_through_storage() {
    let remote = Arc::new(MemoryRemote::new());
    let durable = Arc::new(MemoryDurable::new());

    let p1 = engine_over(&remote, &durable, EngineConfig::default());
    p1.register("api_version", FlagOptions::string("v1")).await.unwrap();
    p1.get("api_version").set_value("v3").await.unwrap();

    // A process that never registered the flag still resolves it.
    let p2 = engine_over(&remote, &durable, EngineConfig::default());
    assert_eq!(
        p2.value("api_version", &Context::new()).await,
        FlagValue::string("v3")
    );

    // Even with Remote gone, the Durable row answers.
    let p3 = engine_over(&remote, &durable, EngineConfig::default());
    remote.set_failing(true);
    assert_eq!(
        p3.value("api_version", &Context::new()).await,
        FlagValue::string("v3")
    );

    p1.shutdown().await;
    p2.shutdown().await;
    p3.shutdown().await;
}

#[tokio::test]
async fn test_percentage_rollout_agrees_across_processes() {
    let (p1, p2, _remote, _durable) = shared_pair();

    p1.register("beta", FlagOptions::boolean(false)).await.unwrap();
    p2.register("beta", FlagOptions::boolean(false)).await.unwrap();
    settle().await;

    p1.get("beta").enable_percentage_of_users(50.0).await.unwrap();
    settle().await;

    for user_id in 0..50 {
        let ctx = Context::new().with_user_id(user_id);
        assert_eq!(
            p1.is_enabled("beta", &ctx).await,
            p2.is_enabled("beta", &ctx).await,
            "processes disagree for user {user_id}"
        );
    }

    p1.shutdown().await;
    p2.shutdown().await;
}

#[tokio::test]
async fn test_repeated_evaluation_is_stable() {
    let (p1, _p2, _remote, _durable) = shared_pair();

    p1.register("beta", FlagOptions::boolean(false)).await.unwrap();
    let flag = p1.get("beta");
    flag.enable_for_user(7).await.unwrap();
    flag.enable_percentage_of_users(30.0).await.unwrap();

    let ctx = Context::new().with_user_id(7);
    let first = p1.is_enabled("beta", &ctx).await;
    for _ in 0..10 {
        assert_eq!(p1.is_enabled("beta", &ctx).await, first);
    }

    p1.shutdown().await;
}

#[tokio::test]
async fn test_usage_counts_aggregate_across_processes() {
    let remote = Arc::new(MemoryRemote::new());
    let durable = Arc::new(MemoryDurable::new());

    // First process flushes every 5 records; the second holds its
    // records locally.
    let flushing = EngineConfig::builder().metrics_batch_size(5).build();
    let p1 = engine_over(&remote, &durable, flushing);
    let p2 = engine_over(&remote, &durable, EngineConfig::default());

    p1.register("hot_path", FlagOptions::boolean(true)).await.unwrap();
    p2.register("hot_path", FlagOptions::boolean(true)).await.unwrap();

    let ctx = Context::new();
    for _ in 0..5 {
        p1.is_enabled("hot_path", &ctx).await;
    }
    for _ in 0..3 {
        p2.is_enabled("hot_path", &ctx).await;
    }
    settle().await;

    // Flushed remote total plus the local unflushed delta.
    assert_eq!(p2.metrics().usage_count("hot_path").await, 8);
    assert_eq!(
        p2.metrics().most_used_features(1).await,
        vec![("hot_path".to_string(), 8)]
    );

    p1.shutdown().await;
    p2.shutdown().await;
}

#[tokio::test]
async fn test_average_duration_is_reported() {
    let (p1, _p2, _remote, _durable) = shared_pair();

    p1.register("timed", FlagOptions::boolean(true)).await.unwrap();
    for _ in 0..3 {
        p1.is_enabled("timed", &Context::new()).await;
    }
    settle().await;

    let avg = p1
        .metrics()
        .average_duration("timed", Operation::Enabled)
        .await
        .expect("durations were recorded");
    assert!(avg >= 0.0);

    p1.shutdown().await;
}

#[tokio::test]
async fn test_full_targeting_workflow() {
    let (p1, _p2, _remote, _durable) = shared_pair();

    p1.register(
        "checkout",
        FlagOptions::boolean(false)
            .with_description("new checkout funnel")
            .with_group("payments"),
    )
    .await
    .unwrap();

    let flag = p1.get("checkout");
    flag.enable_for_role("qa").await.unwrap();
    flag.enable_for_user("1001").await.unwrap();
    flag.enable_for_ip("10.8.0.0/16").await.unwrap();

    // The IP rule gates: matching role from outside the VPN is off.
    let qa_outside = Context::new().with_role("qa").with_ip_address("8.8.8.8");
    let qa_inside = Context::new().with_role("qa").with_ip_address("10.8.3.3");
    let dev_inside = Context::new().with_role("dev").with_ip_address("10.8.3.3");

    assert!(!p1.is_enabled("checkout", &qa_outside).await);
    assert!(p1.is_enabled("checkout", &qa_inside).await);
    assert!(!p1.is_enabled("checkout", &dev_inside).await);

    // Global enable clears the targeting and turns it on for everyone.
    assert!(flag.enable().await.unwrap());
    assert!(p1.is_enabled("checkout", &qa_outside).await);

    p1.shutdown().await;
}

#[tokio::test]
async fn test_variants_round_trip_through_storage() {
    let remote = Arc::new(MemoryRemote::new());
    let durable = Arc::new(MemoryDurable::new());

    let p1 = engine_over(&remote, &durable, EngineConfig::default());
    p1.register(
        "cta_copy",
        FlagOptions::string("Buy now").with_variants(vec![
            Variant::new("control", "Buy now", 50.0),
            Variant::new("urgent", "Buy today", 50.0),
        ]),
    )
    .await
    .unwrap();

    // A cold process sees the same variant set and can select from it.
    let p2 = engine_over(&remote, &durable, EngineConfig::default());
    let picked = p2.variant("cta_copy", &Context::new()).await.unwrap();
    assert!(picked == "control" || picked == "urgent");

    p1.shutdown().await;
    p2.shutdown().await;
}

#[tokio::test]
async fn test_breaker_opens_and_recovers_with_remote() {
    use magick::Circuit;

    let remote = Arc::new(MemoryRemote::new());
    let durable = Arc::new(MemoryDurable::new());

    let config = EngineConfig::builder()
        .breaker_threshold(2)
        .breaker_timeout(Duration::from_millis(100))
        .build();
    let p1 = engine_over(&remote, &durable, config);

    p1.register("resilient", FlagOptions::boolean(false)).await.unwrap();

    remote.set_failing(true);
    let flag = p1.get("resilient");
    // Writes keep succeeding against Local + Durable while the Remote
    // failures trip the breaker.
    flag.set_value(true).await.unwrap();
    flag.set_value(false).await.unwrap();
    assert_eq!(p1.breaker().circuit(), Circuit::Open);

    // Further writes short-circuit the Remote without erroring.
    flag.set_value(true).await.unwrap();
    assert!(p1.is_enabled("resilient", &Context::new()).await);

    // After the open interval a probe write heals the Remote copy.
    remote.set_failing(false);
    tokio::time::sleep(Duration::from_millis(120)).await;
    flag.set_value(true).await.unwrap();
    assert_eq!(p1.breaker().circuit(), Circuit::Closed);
    assert_eq!(
        remote.get("resilient", "value").await.unwrap(),
        Some("true".to_string())
    );

    p1.shutdown().await;
}

#[tokio::test]
async fn test_most_used_features_visible_to_cold_process() {
    let remote = Arc::new(MemoryRemote::new());
    let durable = Arc::new(MemoryDurable::new());

    let flushing = EngineConfig::builder().metrics_batch_size(2).build();
    let p1 = engine_over(&remote, &durable, flushing);
    p1.register("popular", FlagOptions::boolean(true)).await.unwrap();
    for _ in 0..4 {
        p1.is_enabled("popular", &Context::new()).await;
    }
    settle().await;

    // A process that never evaluated the flag discovers it through the
    // Remote counter keys.
    let p2 = engine_over(&remote, &durable, EngineConfig::default());
    assert_eq!(
        p2.metrics().most_used_features(5).await,
        vec![("popular".to_string(), 4)]
    );

    p1.shutdown().await;
    p2.shutdown().await;
}

#[tokio::test]
async fn test_async_updates_keep_write_path_responsive() {
    let remote = Arc::new(MemoryRemote::new());
    let durable = Arc::new(MemoryDurable::new());

    let config = EngineConfig::builder().async_updates(true).build();
    let p1 = engine_over(&remote, &durable, config);
    let p2 = engine_over(&remote, &durable, EngineConfig::default());

    p1.register("flag_x", FlagOptions::boolean(false)).await.unwrap();
    p2.register("flag_x", FlagOptions::boolean(false)).await.unwrap();
    settle().await;

    p1.get("flag_x").set_value(true).await.unwrap();
    settle().await;

    // The deferred Remote write and the invalidation both landed.
    assert!(p2.is_enabled("flag_x", &Context::new()).await);

    p1.shutdown().await;
    p2.shutdown().await;
}
