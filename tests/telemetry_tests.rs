use maestro::maestro::client::Usage;
use maestro::maestro::telemetry::{pricing_for, ModelTier, SessionCosts, Telemetry};

#[test]
fn test_cost_totals_stay_sum_consistent() {
    let mut costs = SessionCosts::default();
    costs.record(
        "haiku-fast",
        Usage {
            input_tokens: 1000,
            output_tokens: 200,
        },
    );
    costs.record(
        "opus-deep",
        Usage {
            input_tokens: 500,
            output_tokens: 100,
        },
    );
    costs.record(
        "haiku-fast",
        Usage {
            input_tokens: 100,
            output_tokens: 50,
        },
    );

    let sum: f64 = costs.per_model.values().map(|c| c.cost_usd).sum();
    assert!((costs.total_usd - sum).abs() < 1e-12);
    assert_eq!(costs.model_usage.len(), 3);
    assert_eq!(costs.per_model["haiku-fast"].input_tokens, 1100);
}

#[test]
fn test_merge_preserves_the_invariant() {
    let mut router_costs = SessionCosts::default();
    router_costs.record(
        "haiku-fast",
        Usage {
            input_tokens: 300,
            output_tokens: 60,
        },
    );

    let mut executor_costs = SessionCosts::default();
    executor_costs.record(
        "opus-deep",
        Usage {
            input_tokens: 2000,
            output_tokens: 800,
        },
    );

    let expected = router_costs.total_usd + executor_costs.total_usd;
    executor_costs.merge(&router_costs);
    assert!((executor_costs.total_usd - expected).abs() < 1e-12);
    assert_eq!(executor_costs.per_model.len(), 2);
    assert_eq!(executor_costs.model_usage.len(), 2);
}

#[test]
fn test_pricing_table_tiers_and_fallback() {
    assert_eq!(pricing_for("haiku-fast").tier, ModelTier::Cheap);
    assert_eq!(pricing_for("opus-deep").tier, ModelTier::Expensive);
    // Unknown ids price at the mid tier.
    assert_eq!(pricing_for("mystery-model").tier, ModelTier::Mid);

    let usage = Usage {
        input_tokens: 1_000_000,
        output_tokens: 0,
    };
    assert!((pricing_for("haiku-fast").cost(&usage) - 0.80).abs() < 1e-9);
}

#[test]
fn test_tier_rollup() {
    let mut costs = SessionCosts::default();
    costs.record(
        "haiku-fast",
        Usage {
            input_tokens: 1_000_000,
            output_tokens: 0,
        },
    );
    costs.record(
        "opus-deep",
        Usage {
            input_tokens: 1_000_000,
            output_tokens: 0,
        },
    );
    let tiers = costs.by_tier();
    assert!((tiers["cheap"] - 0.80).abs() < 1e-9);
    assert!((tiers["expensive"] - 15.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_hub_records_costs_per_session() {
    let telemetry = Telemetry::disabled();
    let cost = telemetry.record_cost(
        "sess-1",
        "haiku-fast",
        Usage {
            input_tokens: 1000,
            output_tokens: 100,
        },
    );
    assert!(cost > 0.0);
    telemetry.record_cost(
        "sess-2",
        "opus-deep",
        Usage {
            input_tokens: 10,
            output_tokens: 10,
        },
    );

    let first = telemetry.session_costs("sess-1");
    assert_eq!(first.model_usage.len(), 1);
    assert!(first.per_model.contains_key("haiku-fast"));
    assert!(!first.per_model.contains_key("opus-deep"));

    let report = telemetry.cost_report("sess-1");
    assert_eq!(report["session_id"], "sess-1");
    assert_eq!(report["invocations"], 1);
}

#[tokio::test]
async fn test_spans_are_retained_when_export_is_disabled() {
    let telemetry = Telemetry::disabled();
    telemetry
        .start_span("hook.invoke")
        .with_agent("shell-safety")
        .finish("ok");
    telemetry
        .start_span("worker.execute")
        .with_task("task-7")
        .finish("memory_exceeded");

    let spans = telemetry.recent_spans();
    assert_eq!(spans.len(), 2);
    assert_eq!(spans[0].operation_type, "hook.invoke");
    assert_eq!(spans[0].status, "ok");
    assert_eq!(spans[1].task_id.as_deref(), Some("task-7"));
    assert!(spans[1].ended_at >= spans[1].started_at);
}
