//! ---
//! bw_section: "07-resilience-fault-tolerance"
//! bw_subsection: "module"
//! bw_type: "source"
//! bw_scope: "code"
//! bw_description: "Integration coverage for the resilience engine."
//! bw_version: "v0.1.0"
//! bw_owner: "tbd"
//! ---
use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use bulwark_common::{AppConfig, ManualClock};
use bulwark_metrics::{new_registry, render};
use bulwark_resilience::{
    codes, ChannelAlertSink, ChaosExperimentConfig, CircuitState, ErrorContext, Failure,
    HealthState, ResilienceEngine, ResilienceMetrics, RetryOptions, StopReason,
};

#[tokio::test]
async fn combined_resilience_flow() {
    let registry = new_registry();
    let metrics = ResilienceMetrics::new(registry.clone()).unwrap();
    let clock = ManualClock::new();
    let (alerts, mut alert_rx) = ChannelAlertSink::new();
    let mut config = AppConfig::default();
    config.chaos.enabled = true;
    config.chaos.default_tick_interval = Duration::from_millis(5);
    let engine = ResilienceEngine::builder(config)
        .clock(clock.shared())
        .alert_sink(Arc::new(alerts))
        .metrics(metrics.clone())
        .retry_seed(11)
        .build()
        .unwrap();

    // A flaky dependency recovers on the second attempt.
    let calls = AtomicU32::new(0);
    let value = engine
        .execute_with_retry(
            "inventory-lookup",
            ErrorContext::new().with("sku", "A-100"),
            RetryOptions::new().with_resource("inventory"),
            |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(Failure::status(502, "bad gateway").into())
                    } else {
                        Ok(7_u32)
                    }
                }
            },
        )
        .await
        .unwrap();
    assert_eq!(value, 7);
    assert_eq!(
        engine.breaker_snapshot("inventory").unwrap().state,
        CircuitState::Closed
    );

    // Chaos experiment loaded from disk hammers the payments breaker.
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
        type = "burst"
        target_categories = ["external_dependency"]
        max_errors = 12
        duration_ms = 10000
        seed = 99
        resource_key = "payments-api"
        "#
    )
    .unwrap();
    let experiment = ChaosExperimentConfig::from_file(file.path()).unwrap();
    let id = engine.start_experiment(experiment).await.unwrap();
    let summary = engine.chaos().wait_for(id).await.unwrap();
    assert_eq!(summary.stop_reason, StopReason::MaxErrorsReached);
    assert_eq!(summary.generated, 12);

    assert_eq!(
        engine.breaker_snapshot("payments-api").unwrap().state,
        CircuitState::Open
    );
    let health = engine.health();
    assert_eq!(health.status, HealthState::Unhealthy);
    assert_eq!(health.open_breaker_count, 1);

    // The tenth error in the external dependency bucket crossed its threshold.
    let mut threshold_alerts = 0;
    while let Ok(alert) = alert_rx.try_recv() {
        threshold_alerts += 1;
        assert_eq!(alert.count, 10);
    }
    assert_eq!(threshold_alerts, 1);

    let body = render(&registry).unwrap();
    assert!(body.contains("bulwark_breaker_open{resource=\"payments-api\"} 1"));
    assert!(body.contains("bulwark_chaos_failures_total"));
    assert!(body.contains("outcome=\"success\""));

    let stopped = engine.shutdown().await;
    assert!(stopped.is_empty());
}

#[tokio::test]
async fn scenario_a_breaker_lifecycle_through_engine() {
    let clock = ManualClock::new();
    let engine = ResilienceEngine::builder(AppConfig::default())
        .clock(clock.shared())
        .build()
        .unwrap();

    for i in 0..10 {
        let result = engine
            .execute_with_circuit_breaker("ledger", ErrorContext::new(), || async move {
                if i < 5 {
                    Ok(())
                } else {
                    Err(anyhow!("ECONNREFUSED ledger:5432"))
                }
            })
            .await;
        assert_eq!(result.is_ok(), i < 5);
    }
    assert_eq!(engine.breaker_snapshot("ledger").unwrap().state, CircuitState::Open);

    let mut ran = false;
    let rejected = engine
        .execute_with_circuit_breaker("ledger", ErrorContext::new(), || {
            ran = true;
            async { Ok(()) }
        })
        .await
        .unwrap_err();
    assert!(!ran);
    assert_eq!(rejected.code(), codes::CIRCUIT_OPEN);
    assert_eq!(rejected.public_view().retry_after_ms, Some(60_000));

    clock.advance(Duration::from_secs(61));
    for _ in 0..3 {
        engine
            .execute_with_circuit_breaker("ledger", ErrorContext::new(), || async {
                Ok::<_, anyhow::Error>(())
            })
            .await
            .unwrap();
    }
    assert_eq!(engine.breaker_snapshot("ledger").unwrap().state, CircuitState::Closed);
}
