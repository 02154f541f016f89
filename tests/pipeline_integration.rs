//! Full-pipeline integration tests: a real SQLite-backed `StorageGateway`
//! driven end to end through `PipelineOrchestrator::run`.

use chainwatch_analytics::config::AnalyticsConfig;
use chainwatch_analytics::model::{AddressLabel, Transfer, Window};
use chainwatch_analytics::patterns::types::PatternPayload;
use chainwatch_analytics::pipeline::{PipelineOrchestrator, RunContext, RunIdentity};
use chainwatch_analytics::storage::StorageGateway;
use rust_decimal::Decimal;
use std::sync::Arc;
use tempfile::TempDir;

fn config_json() -> String {
    let mut doc = serde_json::json!({});
    for s in chainwatch_analytics::config::REQUIRED_SECTIONS {
        doc[s] = serde_json::json!({});
    }
    doc["cycle_detection"] = serde_json::json!({"min_cycle_length": 2.0, "max_cycle_length": 6.0, "max_cycles_per_scc": 50.0});
    doc["path_analysis"] = serde_json::json!({
        "high_volume_percentile": 90.0, "max_source_nodes": 50.0, "max_target_nodes": 50.0,
        "max_path_length": 6.0, "max_paths_to_check": 1000.0, "min_path_length": 3.0,
        "layering_cv_threshold": 0.5, "layering_min_volume": 1.0
    });
    doc["scc_analysis"] = serde_json::json!({"min_scc_size": 2.0, "z_score_normalization": 1.0, "anomaly_threshold": 2.0});
    doc["network_analysis"] = serde_json::json!({
        "min_community_size": 3.0, "max_community_size": 1000.0, "small_transaction_threshold": 1000.0,
        "small_transaction_ratio_threshold": 0.5, "density_threshold": 0.3
    });
    doc["severity_adjustments"] = serde_json::json!({"trust_reduction_factor": 0.5, "fraud_increase_factor": 0.5});
    doc["proximity_analysis"] = serde_json::json!({"max_distance": 3.0, "distance_decay_factor": 0.5});
    doc["risk_identification"] = serde_json::json!({"high_volume_threshold": 100_000.0, "high_degree_threshold": 50.0});
    doc["motif_detection"] = serde_json::json!({
        "degree_percentile_threshold": 90.0, "fanin_max_out_degree": 2.0, "fanout_max_in_degree": 2.0
    });
    doc["burst_detection"] = serde_json::json!({
        "time_window_seconds": 3_600.0, "min_burst_intensity": 2.0, "min_burst_transactions": 5.0, "z_score_threshold": 2.0
    });
    doc["threshold_detection"] = serde_json::json!({
        "thresholds": [10_000.0], "min_transactions_near_threshold": 5.0,
        "clustering_score_threshold": 0.8, "consistency_threshold": 0.5
    });
    doc["typologies"] = serde_json::json!({
        "peel_chain_min_recipients": 5.0, "peel_chain_min_volume_usd": 10_000.0,
        "structuring_min_score": 0.3, "structuring_min_tx": 5.0, "structuring_max_amount_usd": 10_000.0,
        "ping_pong_min_reciprocity": 0.7, "ping_pong_max_counterparties": 5.0, "ping_pong_min_volume": 1_000.0,
        "rapid_fanout_min_recipients": 5.0, "rapid_fanout_min_burst": 0.5, "rapid_fanout_min_volume": 1_000.0,
        "velocity_min_velocity": 0.5, "velocity_min_volume": 1_000.0,
        "fresh_to_exchange_min_volume_usd": 10_000.0, "min_alerts_for_cluster": 2.0
    });
    doc.to_string()
}

fn transfer(from: &str, to: &str, ts: i64, amount: i64, idx: i64) -> Transfer {
    Transfer {
        tx_id: format!("tx{idx}"),
        event_index: 0,
        edge_index: 0,
        block_height: idx,
        block_timestamp_ms: ts,
        from_address: from.into(),
        to_address: to.into(),
        asset_symbol: "ETH".into(),
        asset_contract: None,
        amount: Decimal::new(amount, 0),
        fee: Decimal::ZERO,
        amount_usd: Decimal::new(amount, 0),
    }
}

async fn fresh_storage() -> (TempDir, Arc<StorageGateway>) {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("integration.db");
    let storage = Arc::new(StorageGateway::connect(&format!("sqlite://{}", db_path.display())).await.unwrap());
    (dir, storage)
}

/// S1 — triangle cycle: one cycle pattern covering all three addresses,
/// with the volume and length the detector should derive from the flows.
#[tokio::test]
async fn triangle_cycle_end_to_end() {
    let (_dir, storage) = fresh_storage().await;
    let config = Arc::new(AnalyticsConfig::from_json(&config_json()).unwrap());

    let transfers = vec![
        transfer("A", "B", 0, 10_000, 1),
        transfer("B", "C", 1_000, 12_000, 2),
        transfer("C", "A", 2_000, 11_000, 3),
    ];
    storage.insert_transfers(&transfers, "ethereum", 100).await.unwrap();

    let orchestrator = PipelineOrchestrator::new(storage.clone(), config);
    let identity = RunIdentity {
        network: "ethereum".to_string(),
        window: Window::new(0, 86_400_000).unwrap(),
        processing_date: "2026-01-01".to_string(),
    };
    let ctx = RunContext::new(identity);
    let summary = orchestrator.run(&ctx).await.unwrap();

    assert_eq!(summary.flows_built, 3);
    assert_eq!(summary.features_built, 3);

    use chainwatch_analytics::patterns::store::PatternRepository;
    let patterns = storage.get_for_partition("ethereum", 1, "2026-01-01", 100, 0).await.unwrap();
    let cycles: Vec<_> = patterns.iter().filter(|p| p.pattern_type == "cycle").collect();
    assert_eq!(cycles.len(), 1);

    let mut addresses = cycles[0].addresses_involved.clone();
    addresses.sort();
    assert_eq!(addresses, vec!["A".to_string(), "B".to_string(), "C".to_string()]);

    match &cycles[0].payload {
        PatternPayload::Cycle { cycle_length, cycle_volume_usd, .. } => {
            assert_eq!(*cycle_length, 3);
            assert_eq!(*cycle_volume_usd, Decimal::new(33_000, 0));
        }
        other => panic!("expected a Cycle payload, got {other:?}"),
    }
}

/// S2 — pure DAG: no cycles, no communities, but every address still gets
/// a feature vector.
#[tokio::test]
async fn pure_dag_produces_no_cycles() {
    let (_dir, storage) = fresh_storage().await;
    let config = Arc::new(AnalyticsConfig::from_json(&config_json()).unwrap());

    let transfers = vec![
        transfer("A", "B", 0, 10_000, 1),
        transfer("B", "C", 1_000, 12_000, 2),
        transfer("C", "D", 2_000, 11_000, 3),
        transfer("A", "D", 3_000, 5_000, 4),
    ];
    storage.insert_transfers(&transfers, "ethereum", 100).await.unwrap();

    let orchestrator = PipelineOrchestrator::new(storage.clone(), config);
    let identity = RunIdentity {
        network: "ethereum".to_string(),
        window: Window::new(0, 86_400_000).unwrap(),
        processing_date: "2026-01-01".to_string(),
    };
    let ctx = RunContext::new(identity);
    let summary = orchestrator.run(&ctx).await.unwrap();

    assert_eq!(summary.features_built, 4);

    use chainwatch_analytics::patterns::store::PatternRepository;
    let patterns = storage.get_for_partition("ethereum", 1, "2026-01-01", 100, 0).await.unwrap();
    assert!(patterns.iter().all(|p| p.pattern_type != "cycle" && p.pattern_type != "network"));
}

/// Two consecutive runs over the same partition leave the same output
/// counts: the delete-then-insert rewrite is idempotent, not additive.
#[tokio::test]
async fn rerunning_a_partition_does_not_duplicate_output() {
    let (_dir, storage) = fresh_storage().await;
    let config = Arc::new(AnalyticsConfig::from_json(&config_json()).unwrap());

    let transfers = vec![
        transfer("A", "B", 0, 10_000, 1),
        transfer("B", "C", 1_000, 12_000, 2),
        transfer("C", "A", 2_000, 11_000, 3),
    ];
    storage.insert_transfers(&transfers, "ethereum", 100).await.unwrap();

    let orchestrator = PipelineOrchestrator::new(storage.clone(), config);
    let identity = RunIdentity {
        network: "ethereum".to_string(),
        window: Window::new(0, 86_400_000).unwrap(),
        processing_date: "2026-01-01".to_string(),
    };

    let first = orchestrator.run(&RunContext::new(identity.clone())).await.unwrap();
    let second = orchestrator.run(&RunContext::new(identity)).await.unwrap();

    assert_eq!(first.flows_built, second.flows_built);
    assert_eq!(first.features_built, second.features_built);
    assert_eq!(first.patterns_found, second.patterns_found);

    use chainwatch_analytics::patterns::store::PatternRepository;
    let count = storage.count_for_partition("ethereum", 1, "2026-01-01").await.unwrap();
    assert_eq!(count as usize, second.patterns_found);
}

/// A brand-new address whose entire outflow lands on a labeled exchange
/// clears the fresh-to-exchange batched rule.
#[tokio::test]
async fn fresh_to_exchange_emits_an_alert() {
    let (_dir, storage) = fresh_storage().await;
    let config = Arc::new(AnalyticsConfig::from_json(&config_json()).unwrap());

    storage
        .upsert_label(&AddressLabel {
            network: "ethereum".to_string(),
            address: "EXCHANGE".to_string(),
            trust_level: "verified".to_string(),
            address_type: "exchange".to_string(),
        })
        .await
        .unwrap();

    let transfers = vec![transfer("NEWBIE", "EXCHANGE", 0, 25_000, 1)];
    storage.insert_transfers(&transfers, "ethereum", 100).await.unwrap();

    let orchestrator = PipelineOrchestrator::new(storage.clone(), config);
    let identity = RunIdentity {
        network: "ethereum".to_string(),
        window: Window::new(0, 86_400_000).unwrap(),
        processing_date: "2026-01-01".to_string(),
    };
    let summary = orchestrator.run(&RunContext::new(identity)).await.unwrap();

    assert!(summary.alerts_found >= 1);
}
