//! Pipeline orchestrator (§5): sequences the six run stages — ingest,
//! initialize analyzers, build features, detect structural patterns,
//! detect typologies, audit — against a single `(network, window,
//! processing_date)` run identity, with per-stage timeouts and cooperative
//! cancellation.

use crate::config::AnalyticsConfig;
use crate::features::FeatureBuilder;
use crate::graph::Graph;
use crate::metrics::AnalyticsMetrics;
use crate::model::{ComputationAudit, Transfer, Window};
use crate::patterns::DetectorSuite;
use crate::storage::StorageGateway;
use crate::typology::{self, TypologyDetector};
use crate::{AnalyticsError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// External feed of raw transfers for a window. Default no-op: most runs
/// assume transfers already landed in storage out-of-band and this stage
/// is a pass-through.
#[async_trait]
pub trait IngestSource: Send + Sync {
    async fn ingest(&self, network: &str, t0: i64, t1: i64) -> Result<Vec<Transfer>> {
        let _ = (network, t0, t1);
        Ok(Vec::new())
    }
}

pub struct NullIngestSource;

#[async_trait]
impl IngestSource for NullIngestSource {}

/// Idempotent schema setup, run once at the top of every pipeline run.
#[async_trait]
pub trait SchemaInitializer: Send + Sync {
    async fn init_schema(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl SchemaInitializer for StorageGateway {
    async fn init_schema(&self) -> Result<()> {
        StorageGateway::init_schema(self).await
    }
}

/// The identity of one pipeline run: which network, which window, which
/// partition date. Every analyzer table is keyed by the `(network,
/// window_days, processing_date)` triple derived from this.
#[derive(Debug, Clone)]
pub struct RunIdentity {
    pub network: String,
    pub window: Window,
    pub processing_date: String,
}

impl RunIdentity {
    pub fn window_days(&self) -> i64 {
        self.window.window_days()
    }
}

/// Per-run mutable state: the identity plus a cooperative cancellation
/// flag checked between stages.
pub struct RunContext {
    pub identity: RunIdentity,
    cancel: Arc<AtomicBool>,
}

impl RunContext {
    pub fn new(identity: RunIdentity) -> Self {
        Self { identity, cancel: Arc::new(AtomicBool::new(false)) }
    }

    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    fn check_cancelled(&self, stage: &str) -> Result<()> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(AnalyticsError::Cancelled { stage: stage.to_string() });
        }
        Ok(())
    }
}

/// One run's output counts, returned for logging/CLI display.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub network: String,
    pub window_days: i64,
    pub processing_date: String,
    pub flows_built: usize,
    pub features_built: usize,
    pub patterns_found: usize,
    pub alerts_found: usize,
    pub clusters_found: usize,
    pub duration_s: f64,
}

pub struct PipelineOrchestrator {
    storage: Arc<StorageGateway>,
    config: Arc<AnalyticsConfig>,
    ingest_source: Arc<dyn IngestSource>,
    feature_builder: FeatureBuilder,
    stage_timeout: Duration,
    metrics: Option<Arc<AnalyticsMetrics>>,
}

impl PipelineOrchestrator {
    pub fn new(storage: Arc<StorageGateway>, config: Arc<AnalyticsConfig>) -> Self {
        Self {
            storage,
            config,
            ingest_source: Arc::new(NullIngestSource),
            feature_builder: FeatureBuilder::default(),
            stage_timeout: Duration::from_secs(300),
            metrics: None,
        }
    }

    pub fn with_ingest_source(mut self, source: Arc<dyn IngestSource>) -> Self {
        self.ingest_source = source;
        self
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<AnalyticsMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run the full six-stage pipeline for one `(network, window,
    /// processing_date)` partition.
    pub async fn run(&self, ctx: &RunContext) -> Result<RunSummary> {
        let result = self.run_inner(ctx).await;
        match &result {
            Ok(_) => {
                if let Some(m) = &self.metrics {
                    m.record_run_completed();
                }
            }
            Err(e) => {
                if let Some(m) = &self.metrics {
                    m.record_run_failed();
                    m.record_stage_failure(stage_of(e), error_kind(e));
                }
            }
        }
        result
    }

    async fn run_inner(&self, ctx: &RunContext) -> Result<RunSummary> {
        let started_at = Utc::now();
        let started = Instant::now();
        let identity = &ctx.identity;
        let network = identity.network.as_str();
        let window_days = identity.window_days();
        let processing_date = identity.processing_date.as_str();
        let (t0, t1) = (identity.window.t0, identity.window.t1);

        // Stage 1: ingest.
        ctx.check_cancelled("ingest")?;
        let transfers = self
            .timed("ingest", self.ingest_source.ingest(network, t0, t1))
            .await?;
        if !transfers.is_empty() {
            self.storage.insert_transfers(&transfers, network, 1_000).await?;
        }

        // Stage 2: initialize analyzers (idempotent schema setup).
        ctx.check_cancelled("initialize_analyzers")?;
        self.timed("initialize_analyzers", SchemaInitializer::init_schema(self.storage.as_ref())).await?;

        // Stage 3: build features.
        ctx.check_cancelled("build_features")?;
        let flows = self.storage.build_flows(network, window_days, processing_date, t0, t1).await?;
        self.storage.rewrite_flows_partition(network, window_days, processing_date, &flows).await?;
        let graph = Graph::build(&flows)?;

        let features = self
            .timed(
                "build_features",
                self.feature_builder.build(&graph, network, window_days, processing_date, t0, t1, self.storage.as_ref()),
            )
            .await?;
        self.storage
            .rewrite_features_partition(network, window_days, processing_date, &features, 1_000)
            .await?;

        // Stage 4: detect structural patterns.
        ctx.check_cancelled("detect_patterns")?;
        let suite = DetectorSuite::new(&self.config, network)?;
        let labels = self.storage.get_labels(network).await?;
        let timestamps = self.storage.timestamps_by_address(network, t0, t1).await?;
        let patterns = self
            .timed(
                "detect_patterns",
                suite.detect_all(&graph, labels, &timestamps, network, window_days, processing_date),
            )
            .await?;
        crate::patterns::store::rewrite_partition(
            self.storage.as_ref(),
            network,
            window_days,
            processing_date,
            patterns.clone(),
            crate::patterns::store::DEFAULT_BATCH_SIZE,
        )
        .await?;

        // Stage 5: detect typologies.
        ctx.check_cancelled("detect_typologies")?;
        let typology_detector = TypologyDetector::new(&self.config, network)?;
        let mut alerts = typology_detector.detect(&features, &patterns, network, window_days, processing_date);
        let exchange_volume = self.storage.exchange_volume_by_address(network, t0, t1).await?;
        alerts.extend(typology_detector.fresh_to_exchange_alerts(
            &features,
            &exchange_volume,
            network,
            window_days,
            processing_date,
        ));
        self.storage.rewrite_alerts_partition(network, window_days, processing_date, &alerts).await?;

        let min_alerts_for_cluster = self.config.section("typologies")?.require_usize(
            "typologies",
            network,
            "min_alerts_for_cluster",
        )?;
        let clusters = typology::cluster_same_entity(&alerts, min_alerts_for_cluster);
        self.storage
            .rewrite_alert_clusters_partition(network, window_days, processing_date, &clusters)
            .await?;

        // Stage 6: audit.
        ctx.check_cancelled("audit")?;
        let ended_at = Utc::now();
        let duration_s = started.elapsed().as_secs_f64();
        self.storage
            .write_audit(&ComputationAudit {
                network: network.to_string(),
                window_days,
                processing_date: processing_date.to_string(),
                started_at,
                ended_at,
                duration_s,
            })
            .await?;

        if let Some(m) = &self.metrics {
            m.record_features_written(features.len());
            for p in &patterns {
                m.record_patterns_detected(&p.pattern_type, 1);
            }
            for a in &alerts {
                m.record_alerts_emitted(&a.typology_type, 1);
            }
            m.record_alert_clusters_emitted(clusters.len());
        }

        Ok(RunSummary {
            network: network.to_string(),
            window_days,
            processing_date: processing_date.to_string(),
            flows_built: flows.len(),
            features_built: features.len(),
            patterns_found: patterns.len(),
            alerts_found: alerts.len(),
            clusters_found: clusters.len(),
            duration_s,
        })
    }

    async fn timed<F, T>(&self, stage: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let result = tokio::time::timeout(self.stage_timeout, fut)
            .await
            .map_err(|_| AnalyticsError::StageTimeout { stage: stage.to_string() })?;
        if let Some(m) = &self.metrics {
            m.record_stage_duration(stage, started.elapsed().as_secs_f64());
        }
        result
    }
}

fn stage_of(err: &AnalyticsError) -> &str {
    match err {
        AnalyticsError::StageTimeout { stage } | AnalyticsError::Cancelled { stage } => stage,
        _ => "unknown",
    }
}

fn error_kind(err: &AnalyticsError) -> &'static str {
    match err {
        AnalyticsError::ConfigMissing { .. } => "ConfigMissing",
        AnalyticsError::BadInput(_) => "BadInput",
        AnalyticsError::EmptyWindow => "EmptyWindow",
        AnalyticsError::SchemaMismatch(_) => "SchemaMismatch",
        AnalyticsError::TransientDb(_) => "TransientDb",
        AnalyticsError::DuplicateFlow { .. } => "DuplicateFlow",
        AnalyticsError::CommunityDetectionFailed(_) => "CommunityDetectionFailed",
        AnalyticsError::StageTimeout { .. } => "StageTimeout",
        AnalyticsError::Cancelled { .. } => "Cancelled",
        AnalyticsError::PartialDetectorFailure { .. } => "PartialDetectorFailure",
        AnalyticsError::Io(_) => "Io",
        AnalyticsError::Serialization(_) => "Serialization",
        AnalyticsError::Http(_) => "Http",
        AnalyticsError::Other(_) => "Other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Transfer;
    use rust_decimal::Decimal;
    use tempfile::TempDir;

    fn config_json() -> String {
        let mut doc = serde_json::json!({});
        for s in crate::config::REQUIRED_SECTIONS {
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

    #[tokio::test]
    async fn full_run_produces_a_summary() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("pipeline_test.db");
        let storage = Arc::new(StorageGateway::connect(&format!("sqlite://{}", db_path.display())).await.unwrap());
        let config = Arc::new(AnalyticsConfig::from_json(&config_json()).unwrap());

        let transfers = vec![
            transfer("a", "b", 0, 10_000, 1),
            transfer("b", "c", 1_000, 10_000, 2),
            transfer("c", "a", 2_000, 10_000, 3),
        ];
        storage.insert_transfers(&transfers, "ethereum", 100).await.unwrap();

        let orchestrator = PipelineOrchestrator::new(storage, config);
        let identity = RunIdentity {
            network: "ethereum".to_string(),
            window: Window::new(0, 86_400_000).unwrap(),
            processing_date: "2026-01-01".to_string(),
        };
        let ctx = RunContext::new(identity);

        let summary = orchestrator.run(&ctx).await.unwrap();
        assert_eq!(summary.flows_built, 3);
        assert_eq!(summary.features_built, 3);
        assert!(summary.patterns_found >= 1);
    }

    #[tokio::test]
    async fn cancelled_run_stops_before_remaining_stages() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("pipeline_cancel_test.db");
        let storage = Arc::new(StorageGateway::connect(&format!("sqlite://{}", db_path.display())).await.unwrap());
        let config = Arc::new(AnalyticsConfig::from_json(&config_json()).unwrap());

        let orchestrator = PipelineOrchestrator::new(storage, config);
        let identity = RunIdentity {
            network: "ethereum".to_string(),
            window: Window::new(0, 86_400_000).unwrap(),
            processing_date: "2026-01-01".to_string(),
        };
        let ctx = RunContext::new(identity);
        ctx.cancel_handle().store(true, Ordering::Relaxed);

        let result = orchestrator.run(&ctx).await;
        assert!(matches!(result, Err(AnalyticsError::Cancelled { .. })));
    }
}
