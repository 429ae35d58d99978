//! Cross-cutting integration tests against the public `Registry`/`LimiterChain`
//! API, one per concrete scenario plus a couple of round-trip properties.
//! Placed under `tests/` rather than inline, alongside where this crate puts
//! its own cross-cutting coverage.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwise::{
    LimiterChain, LimiterConfig, LimiterKind, ModelConfig, ProcessorOutcome, Registry, Request,
    RequestStatus,
};

fn chain_request(est_in: u64, est_out: u64) -> Request<()> {
    Request::new("m", ()).estimated_tokens(Some(est_in), Some(est_out))
}

/// Scenario 1: an RPM(3)/1s limiter admits the first 3 requests immediately
/// and must stall the 4th until the window rolls, so 5 requests each taking
/// 50ms of processing time still take at least one full period end to end.
#[tokio::test]
async fn scenario_1_per_period_limit_stalls_once_window_is_full() {
    let registry: Registry<(), ()> = Registry::new();
    let config = ModelConfig::new("m", vec![LimiterConfig::new(LimiterKind::Rpm, 3).with_period(1)]);
    registry
        .register(config, |_req: Request<()>| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(ProcessorOutcome::new(()))
        })
        .unwrap();

    let registry = Arc::new(registry);
    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..5 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            registry.submit(Request::new("m", ())).await.unwrap()
        }));
    }

    for handle in handles {
        let response = handle.await.unwrap();
        assert_eq!(response.status, RequestStatus::Completed);
    }

    assert!(
        start.elapsed() >= Duration::from_secs(1),
        "expected the 4th/5th admission to wait out the 1s window, elapsed={:?}",
        start.elapsed()
    );

    registry.shutdown_all().await;
}

/// Scenario 2: a Concurrent(2) limiter caps how many processor calls run at
/// once, so 5 requests each sleeping 100ms must take at least 3 batches.
#[tokio::test]
async fn scenario_2_concurrency_cap_bounds_parallel_processing() {
    let registry: Registry<(), ()> = Registry::new();
    let config = ModelConfig::new("m", vec![LimiterConfig::new(LimiterKind::Concurrent, 2)]);

    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_observed = Arc::new(AtomicUsize::new(0));

    {
        let in_flight = in_flight.clone();
        let max_observed = max_observed.clone();
        registry
            .register(config, move |_req: Request<()>| {
                let in_flight = in_flight.clone();
                let max_observed = max_observed.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_observed.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(ProcessorOutcome::new(()))
                }
            })
            .unwrap();
    }

    let registry = Arc::new(registry);
    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..5 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            registry.submit(Request::new("m", ())).await.unwrap()
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().status, RequestStatus::Completed);
    }

    assert!(max_observed.load(Ordering::SeqCst) <= 2);
    assert!(
        start.elapsed() >= Duration::from_millis(250),
        "5 requests at concurrency 2 should take at least 3 batches, elapsed={:?}",
        start.elapsed()
    );

    registry.shutdown_all().await;
}

/// Scenario 3: an RPM(10)/TPM(60) chain admits a 50-token request, then
/// refuses a second 50-token request (50 + 50 > 60) and rolls back to
/// exactly the state left by the first admission — RPM is not refunded for
/// the refused attempt because it failed at the TPM step, after RPM had
/// already been acquired and then unwound.
#[tokio::test]
async fn scenario_3_chain_rollback_on_refusal() {
    let chain = LimiterChain::from_configs(&[
        LimiterConfig::new(LimiterKind::Rpm, 10).with_period(60),
        LimiterConfig::new(LimiterKind::Tpm, 60).with_period(60),
    ]);

    assert!(chain.acquire_all(&chain_request(50, 0)).await);
    assert!(!chain.acquire_all(&chain_request(50, 0)).await);

    let snapshot = chain.snapshot().await;
    assert_eq!(snapshot[0].usage, 1);
    assert_eq!(snapshot[1].usage, 50);
}

/// Scenario 4: reconciling a lower actual token count than estimated must
/// lower the token limiter's usage (a refund), observable via `queue_info`.
#[tokio::test]
async fn scenario_4_token_usage_reconciliation_refunds_the_limiter() {
    let registry: Registry<(), ()> = Registry::new();
    let config = ModelConfig::new("m", vec![LimiterConfig::new(LimiterKind::Tpm, 100).with_period(60)]);
    registry
        .register(config, |_req: Request<()>| async move { Ok(ProcessorOutcome::new(())) })
        .unwrap();

    let request = Request::new("m", ()).estimated_tokens(Some(80), Some(0));
    let id = request.id.clone();
    let response = registry.submit(request).await.unwrap();
    assert_eq!(response.status, RequestStatus::Completed);

    let info = registry.queue_info("m").await.unwrap();
    assert_eq!(info.rate_limiters[0].usage, 80);

    registry.update_token_usage("m", &id, 50, 0).await.unwrap();
    let info = registry.queue_info("m").await.unwrap();
    assert_eq!(info.rate_limiters[0].usage, 50);

    registry.shutdown_all().await;
}

/// Scenario 5: reconciling a higher actual token count than estimated can
/// push usage past the limit (an overage); a fresh acquisition attempt at
/// that point must then be refused until the window decays.
#[tokio::test]
async fn scenario_5_token_overage_blocks_new_admission() {
    let chain = LimiterChain::from_configs(&[LimiterConfig::new(LimiterKind::Tpm, 100).with_period(60)]);

    assert!(chain.acquire_all(&chain_request(80, 0)).await);
    chain.reconcile(80, 0, 90, 0).await;

    let snapshot = chain.snapshot().await;
    assert_eq!(snapshot[0].usage, 90);

    assert!(!chain.acquire_all(&chain_request(20, 0)).await);
}

/// Scenario 6: a fire-and-forget submission (`wait_for_completion = false`)
/// returns a `Pending` response immediately; polling `get_status` afterward
/// eventually observes the terminal state.
#[tokio::test]
async fn scenario_6_fire_and_forget_then_poll_status() {
    let registry: Registry<(), ()> = Registry::new();
    let config = ModelConfig::new("m", vec![LimiterConfig::new(LimiterKind::Rpm, 10)]);
    registry
        .register(config, |_req: Request<()>| async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok(ProcessorOutcome::new(()))
        })
        .unwrap();

    let request = Request::new("m", ()).wait_for_completion(false);
    let id = request.id.clone();
    let response = registry.submit(request).await.unwrap();
    assert_eq!(response.status, RequestStatus::Pending);

    let mut final_status = None;
    for _ in 0..50 {
        if let Some(status) = registry.get_status("m", &id).unwrap() {
            if status.status != RequestStatus::Pending && status.status != RequestStatus::Processing {
                final_status = Some(status.status);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(final_status, Some(RequestStatus::Completed));
    registry.shutdown_all().await;
}

/// Scenario 7: a processor failure is contained to that one request — its
/// response is `Failed` with the error message captured, and the queue
/// keeps serving subsequent requests for the same model.
#[tokio::test]
async fn scenario_7_processor_failure_is_contained() {
    let registry: Registry<i32, i32> = Registry::new();
    let config = ModelConfig::new("m", vec![LimiterConfig::new(LimiterKind::Rpm, 10)]);
    registry
        .register(config, |req: Request<i32>| async move {
            if req.params < 0 {
                Err("negative input".to_string())
            } else {
                Ok(ProcessorOutcome::new(req.params * 2))
            }
        })
        .unwrap();

    let failed = registry.submit(Request::new("m", -1)).await.unwrap();
    assert_eq!(failed.status, RequestStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("negative input"));

    let ok = registry.submit(Request::new("m", 21)).await.unwrap();
    assert_eq!(ok.status, RequestStatus::Completed);
    assert_eq!(ok.result, Some(42));

    registry.shutdown_all().await;
}

/// Scenario 8: `shutdown_all` drains every in-flight request to a terminal
/// response before returning — nothing is abandoned mid-flight.
#[tokio::test]
async fn scenario_8_shutdown_drains_in_flight_work() {
    let registry: Registry<(), ()> = Registry::new();
    let config = ModelConfig::new("m", vec![LimiterConfig::new(LimiterKind::Concurrent, 10)]);
    registry
        .register(config, |_req: Request<()>| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(ProcessorOutcome::new(()))
        })
        .unwrap();

    let registry = Arc::new(registry);
    let mut handles = Vec::new();
    for _ in 0..3 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            registry.submit(Request::new("m", ())).await.unwrap()
        }));
    }

    // Give the three submissions a moment to actually reach the FIFO before
    // the drain begins, so shutdown genuinely has work in flight.
    tokio::time::sleep(Duration::from_millis(10)).await;
    registry.shutdown_all().await;

    for handle in handles {
        assert_eq!(handle.await.unwrap().status, RequestStatus::Completed);
    }
}

/// A model name freed by `shutdown_all` can be re-registered and used again.
#[tokio::test]
async fn registering_again_after_shutdown_round_trips() {
    let registry: Registry<i32, i32> = Registry::new();
    let config = ModelConfig::new("m", vec![LimiterConfig::new(LimiterKind::Rpm, 5)]);
    registry
        .register(config.clone(), |req: Request<i32>| async move {
            Ok(ProcessorOutcome::new(req.params))
        })
        .unwrap();
    registry.submit(Request::new("m", 1)).await.unwrap();
    registry.shutdown_all().await;

    registry
        .register(config, |req: Request<i32>| async move { Ok(ProcessorOutcome::new(req.params)) })
        .unwrap();
    let response = registry.submit(Request::new("m", 2)).await.unwrap();
    assert_eq!(response.result, Some(2));

    registry.shutdown_all().await;
}

/// Reconciling the same `(actual_in, actual_out)` pair twice for the same
/// request must only apply the correction once.
#[tokio::test]
async fn update_token_usage_is_idempotent_for_repeated_values() {
    let registry: Registry<(), ()> = Registry::new();
    let config = ModelConfig::new("m", vec![LimiterConfig::new(LimiterKind::Tpm, 1000).with_period(60)]);
    registry
        .register(config, |_req: Request<()>| async move { Ok(ProcessorOutcome::new(())) })
        .unwrap();

    let request = Request::new("m", ()).estimated_tokens(Some(100), Some(0));
    let id = request.id.clone();
    registry.submit(request).await.unwrap();

    registry.update_token_usage("m", &id, 40, 0).await.unwrap();
    let usage_after_first = registry.queue_info("m").await.unwrap().rate_limiters[0].usage;

    registry.update_token_usage("m", &id, 40, 0).await.unwrap();
    let usage_after_second = registry.queue_info("m").await.unwrap().rate_limiters[0].usage;

    assert_eq!(usage_after_first, usage_after_second);
    assert_eq!(usage_after_first, 40);

    registry.shutdown_all().await;
}
