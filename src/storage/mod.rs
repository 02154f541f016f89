//! Storage gateway (§4.1, §4.5, §9): the SQLite-backed persistence layer
//! every other module talks to through [`features::FeatureAggregateSource`]
//! and [`patterns::store::PatternRepository`].
//!
//! Schema, one logical table per concern (`transfers`, `flows`, `features`,
//! one table per pattern type, `address_labels`, `alerts`,
//! `alert_clusters`, `computation_audit`), plus a `pattern_detections` view
//! unioning the seven pattern tables for uniform reads. Per-address
//! statistical aggregation (moments, temporal histograms, behavioral
//! counters, inter-event timing, counterparty stability) is computed by
//! fetching the chunk's incident transfer rows and reducing them in Rust
//! rather than in SQL — SQLite has no array aggregates, and the chunk sizes
//! (§4.3 step 5) are already bounded for exactly this reason.

use crate::config::AnalyticsConfig;
use crate::features::{
    AmountMoments, BehavioralCounters, ChunkAggregates, CounterpartyStats, FeatureAggregateSource, FeatureVector,
    InterEventStats, TemporalStats,
};
use crate::model::{AddressLabel, ComputationAudit, Flow, Transfer};
use crate::patterns::store::PatternRepository;
use crate::patterns::{Pattern, PatternPayload};
use crate::typology::{Alert, AlertCluster};
use crate::{AnalyticsError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;

/// Amounts at or below this USD value count toward `small_transaction_count`
/// (§4.3 Behavioral).
const SMALL_TRANSACTION_USD: f64 = 1_000.0;
/// A transaction following the previous one for the same address by less
/// than this many seconds counts toward `unusual_timing_count`.
const RAPID_REPEAT_SECONDS: i64 = 60;

const PATTERN_TABLES: &[&str] = &[
    "patterns_cycle",
    "patterns_layering",
    "patterns_smurfing_network",
    "patterns_proximity_risk",
    "patterns_motif",
    "patterns_burst",
    "patterns_threshold",
];

pub struct StorageGateway {
    pool: SqlitePool,
}

impl StorageGateway {
    /// Connect to `database_url` (e.g. `sqlite://./analytics.db`), creating
    /// the file if it doesn't exist.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| AnalyticsError::Other(e.to_string()))?
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let gateway = Self { pool };
        gateway.init_schema().await?;
        log::info!("storage gateway connected at {database_url}");
        Ok(gateway)
    }

    /// Idempotent schema creation (§4.8 SchemaInitializer): safe to call on
    /// every run.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transfers (
                tx_id TEXT NOT NULL,
                event_index INTEGER NOT NULL,
                edge_index INTEGER NOT NULL,
                network TEXT NOT NULL,
                block_height INTEGER NOT NULL,
                block_timestamp_ms INTEGER NOT NULL,
                from_address TEXT NOT NULL,
                to_address TEXT NOT NULL,
                asset_symbol TEXT NOT NULL,
                asset_contract TEXT,
                amount TEXT NOT NULL,
                fee TEXT NOT NULL,
                amount_usd TEXT NOT NULL,
                PRIMARY KEY (tx_id, event_index, edge_index)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_transfers_window ON transfers(network, block_timestamp_ms)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_transfers_from ON transfers(network, from_address, block_timestamp_ms)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_transfers_to ON transfers(network, to_address, block_timestamp_ms)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS flows (
                network TEXT NOT NULL,
                window_days INTEGER NOT NULL,
                processing_date TEXT NOT NULL,
                from_address TEXT NOT NULL,
                to_address TEXT NOT NULL,
                tx_count INTEGER NOT NULL,
                amount_sum TEXT NOT NULL,
                amount_usd_sum TEXT NOT NULL,
                first_seen_timestamp INTEGER NOT NULL,
                last_seen_timestamp INTEGER NOT NULL,
                unique_assets INTEGER NOT NULL,
                dominant_asset TEXT NOT NULL,
                hourly_pattern TEXT NOT NULL,
                weekly_pattern TEXT NOT NULL,
                reciprocity_ratio REAL NOT NULL,
                is_bidirectional INTEGER NOT NULL,
                PRIMARY KEY (network, window_days, processing_date, from_address, to_address)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS features (
                network TEXT NOT NULL,
                window_days INTEGER NOT NULL,
                processing_date TEXT NOT NULL,
                address TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                PRIMARY KEY (network, window_days, processing_date, address)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for table in PATTERN_TABLES {
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    pattern_id TEXT NOT NULL,
                    pattern_hash TEXT NOT NULL,
                    pattern_type TEXT NOT NULL,
                    network TEXT NOT NULL,
                    window_days INTEGER NOT NULL,
                    processing_date TEXT NOT NULL,
                    addresses_involved TEXT NOT NULL,
                    address_roles TEXT NOT NULL,
                    detection_timestamp INTEGER NOT NULL,
                    evidence_transaction_count INTEGER NOT NULL,
                    evidence_volume_usd TEXT NOT NULL,
                    detection_method TEXT NOT NULL,
                    payload_json TEXT NOT NULL,
                    PRIMARY KEY (network, window_days, processing_date, pattern_id)
                )
                "#
            ))
            .execute(&self.pool)
            .await?;
        }

        let union_body = PATTERN_TABLES
            .iter()
            .map(|t| format!("SELECT *, '{t}' AS source_table FROM {t}"))
            .collect::<Vec<_>>()
            .join(" UNION ALL ");
        sqlx::query(&format!("CREATE VIEW IF NOT EXISTS pattern_detections AS {union_body}"))
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS address_labels (
                network TEXT NOT NULL,
                address TEXT NOT NULL,
                trust_level TEXT NOT NULL,
                address_type TEXT NOT NULL,
                PRIMARY KEY (network, address)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
                alert_id TEXT NOT NULL,
                network TEXT NOT NULL,
                window_days INTEGER NOT NULL,
                processing_date TEXT NOT NULL,
                address TEXT NOT NULL,
                typology_type TEXT NOT NULL,
                confidence_score REAL NOT NULL,
                severity TEXT NOT NULL,
                suspected_address_type TEXT NOT NULL,
                description TEXT NOT NULL,
                volume_usd TEXT NOT NULL,
                evidence_json TEXT NOT NULL,
                risk_indicators TEXT NOT NULL,
                related_addresses TEXT NOT NULL,
                PRIMARY KEY (network, window_days, processing_date, alert_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alert_clusters (
                cluster_id TEXT NOT NULL,
                network TEXT NOT NULL,
                window_days INTEGER NOT NULL,
                processing_date TEXT NOT NULL,
                cluster_type TEXT NOT NULL,
                primary_alert_id TEXT NOT NULL,
                related_alert_ids TEXT NOT NULL,
                addresses_involved TEXT NOT NULL,
                total_alerts INTEGER NOT NULL,
                total_volume_usd TEXT NOT NULL,
                severity_max TEXT NOT NULL,
                confidence_avg REAL NOT NULL,
                PRIMARY KEY (network, window_days, processing_date, cluster_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS computation_audit (
                network TEXT NOT NULL,
                window_days INTEGER NOT NULL,
                processing_date TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT NOT NULL,
                duration_s REAL NOT NULL,
                PRIMARY KEY (network, window_days, processing_date, started_at)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        log::debug!("storage schema initialized");
        Ok(())
    }

    // -- Ingestion -------------------------------------------------------

    pub async fn insert_transfers(&self, transfers: &[Transfer], network: &str, batch_size: usize) -> Result<()> {
        for batch in transfers.chunks(batch_size.max(1)) {
            let mut tx = self.pool.begin().await?;
            for t in batch {
                sqlx::query(
                    r#"
                    INSERT OR REPLACE INTO transfers
                    (tx_id, event_index, edge_index, network, block_height, block_timestamp_ms,
                     from_address, to_address, asset_symbol, asset_contract, amount, fee, amount_usd)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&t.tx_id)
                .bind(t.event_index)
                .bind(t.edge_index)
                .bind(network)
                .bind(t.block_height)
                .bind(t.block_timestamp_ms)
                .bind(&t.from_address)
                .bind(&t.to_address)
                .bind(&t.asset_symbol)
                .bind(&t.asset_contract)
                .bind(t.amount.to_string())
                .bind(t.fee.to_string())
                .bind(t.amount_usd.to_string())
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
        }
        Ok(())
    }

    /// Aggregate raw transfers in `[t0, t1)` into ordered-pair flows (§4.1).
    pub async fn build_flows(&self, network: &str, window_days: i64, processing_date: &str, t0: i64, t1: i64) -> Result<Vec<Flow>> {
        let rows = sqlx::query(
            r#"
            SELECT tx_id, event_index, edge_index, block_timestamp_ms, from_address, to_address,
                   asset_symbol, amount, amount_usd
            FROM transfers
            WHERE network = ? AND block_timestamp_ms >= ? AND block_timestamp_ms < ?
            ORDER BY from_address, to_address, block_timestamp_ms
            "#,
        )
        .bind(network)
        .bind(t0)
        .bind(t1)
        .fetch_all(&self.pool)
        .await?;

        let mut by_pair: HashMap<(String, String), PairAccumulator> = HashMap::new();
        for row in &rows {
            let from: String = row.get("from_address");
            let to: String = row.get("to_address");
            let ts: i64 = row.get("block_timestamp_ms");
            let asset: String = row.get("asset_symbol");
            let amount_str: String = row.get("amount");
            let amount_usd_str: String = row.get("amount_usd");
            let amount = Decimal::from_str(&amount_str).unwrap_or(Decimal::ZERO);
            let amount_usd = Decimal::from_str(&amount_usd_str).unwrap_or(Decimal::ZERO);

            let acc = by_pair.entry((from, to)).or_default();
            acc.tx_count += 1;
            acc.amount_sum += amount;
            acc.amount_usd_sum += amount_usd;
            acc.first_seen = acc.first_seen.map(|f| f.min(ts)).or(Some(ts));
            acc.last_seen = acc.last_seen.map(|l| l.max(ts)).or(Some(ts));
            *acc.asset_counts.entry(asset).or_insert(0) += 1;
            let hour = hour_of_day(ts);
            let weekday = day_of_week(ts);
            acc.hourly_pattern[hour] += 1;
            acc.weekly_pattern[weekday] += 1;
        }

        let mut flows = Vec::with_capacity(by_pair.len());
        for ((from, to), acc) in &by_pair {
            let dominant_asset = acc
                .asset_counts
                .iter()
                .max_by_key(|(_, &c)| c)
                .map(|(a, _)| a.clone())
                .unwrap_or_default();

            let reverse_usd = by_pair.get(&(to.clone(), from.clone())).map(|r| r.amount_usd_sum).unwrap_or(Decimal::ZERO);
            let reciprocity_ratio = Flow::reciprocity(acc.amount_usd_sum, reverse_usd);

            flows.push(Flow {
                from_address: from.clone(),
                to_address: to.clone(),
                window_days,
                processing_date: processing_date.to_string(),
                tx_count: acc.tx_count,
                amount_sum: acc.amount_sum,
                amount_usd_sum: acc.amount_usd_sum,
                first_seen_timestamp: acc.first_seen.unwrap_or(t0),
                last_seen_timestamp: acc.last_seen.unwrap_or(t0),
                unique_assets: acc.asset_counts.len() as i64,
                dominant_asset,
                hourly_pattern: acc.hourly_pattern,
                weekly_pattern: acc.weekly_pattern,
                reciprocity_ratio,
                is_bidirectional: reverse_usd > Decimal::ZERO,
            });
        }

        Ok(flows)
    }

    pub async fn rewrite_flows_partition(&self, network: &str, window_days: i64, processing_date: &str, flows: &[Flow]) -> Result<()> {
        sqlx::query("DELETE FROM flows WHERE network = ? AND window_days = ? AND processing_date = ?")
            .bind(network)
            .bind(window_days)
            .bind(processing_date)
            .execute(&self.pool)
            .await?;

        for f in flows {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO flows
                (network, window_days, processing_date, from_address, to_address, tx_count, amount_sum,
                 amount_usd_sum, first_seen_timestamp, last_seen_timestamp, unique_assets, dominant_asset,
                 hourly_pattern, weekly_pattern, reciprocity_ratio, is_bidirectional)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(network)
            .bind(window_days)
            .bind(processing_date)
            .bind(&f.from_address)
            .bind(&f.to_address)
            .bind(f.tx_count)
            .bind(f.amount_sum.to_string())
            .bind(f.amount_usd_sum.to_string())
            .bind(f.first_seen_timestamp)
            .bind(f.last_seen_timestamp)
            .bind(f.unique_assets)
            .bind(&f.dominant_asset)
            .bind(serde_json::to_string(&f.hourly_pattern).unwrap_or_default())
            .bind(serde_json::to_string(&f.weekly_pattern).unwrap_or_default())
            .bind(f.reciprocity_ratio)
            .bind(f.is_bidirectional)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    // -- Labels ------------------------------------------------------------

    pub async fn get_labels(&self, network: &str) -> Result<Vec<AddressLabel>> {
        let rows = sqlx::query("SELECT network, address, trust_level, address_type FROM address_labels WHERE network = ?")
            .bind(network)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_label).collect())
    }

    pub async fn upsert_label(&self, label: &AddressLabel) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO address_labels (network, address, trust_level, address_type) VALUES (?, ?, ?, ?)",
        )
        .bind(&label.network)
        .bind(&label.address)
        .bind(&label.trust_level)
        .bind(&label.address_type)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Total exchange-directed volume per address over the window, joined
    /// against labels with `address_type = 'exchange'` — feeds the
    /// `fresh_to_exchange` typology rule.
    pub async fn exchange_volume_by_address(&self, network: &str, t0: i64, t1: i64) -> Result<HashMap<String, Decimal>> {
        let rows = sqlx::query(
            r#"
            SELECT t.from_address AS address, SUM(CAST(t.amount_usd AS REAL)) AS total
            FROM transfers t
            JOIN address_labels l ON l.network = t.network AND l.address = t.to_address
            WHERE t.network = ? AND t.block_timestamp_ms >= ? AND t.block_timestamp_ms < ? AND l.address_type = 'exchange'
            GROUP BY t.from_address
            "#,
        )
        .bind(network)
        .bind(t0)
        .bind(t1)
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashMap::new();
        for row in rows {
            let address: String = row.get("address");
            let total: f64 = row.get("total");
            out.insert(address, Decimal::from_str_exact(&format!("{total:.8}")).unwrap_or(Decimal::ZERO));
        }
        Ok(out)
    }

    /// Per-address sorted timestamps in `[t0, t1)`, incident in either
    /// direction — the burst detector's required input shape.
    pub async fn timestamps_by_address(&self, network: &str, t0: i64, t1: i64) -> Result<HashMap<String, Vec<i64>>> {
        let rows = sqlx::query(
            r#"
            SELECT from_address AS address, block_timestamp_ms AS ts FROM transfers
            WHERE network = ? AND block_timestamp_ms >= ? AND block_timestamp_ms < ?
            UNION ALL
            SELECT to_address AS address, block_timestamp_ms AS ts FROM transfers
            WHERE network = ? AND block_timestamp_ms >= ? AND block_timestamp_ms < ?
            "#,
        )
        .bind(network)
        .bind(t0)
        .bind(t1)
        .bind(network)
        .bind(t0)
        .bind(t1)
        .fetch_all(&self.pool)
        .await?;

        let mut out: HashMap<String, Vec<i64>> = HashMap::new();
        for row in rows {
            let address: String = row.get("address");
            let ts: i64 = row.get("ts");
            out.entry(address).or_default().push(ts);
        }
        for v in out.values_mut() {
            v.sort_unstable();
        }
        Ok(out)
    }

    // -- Features ----------------------------------------------------------

    pub async fn rewrite_features_partition(&self, network: &str, window_days: i64, processing_date: &str, features: &[FeatureVector], batch_size: usize) -> Result<usize> {
        sqlx::query("DELETE FROM features WHERE network = ? AND window_days = ? AND processing_date = ?")
            .bind(network)
            .bind(window_days)
            .bind(processing_date)
            .execute(&self.pool)
            .await?;

        for batch in features.chunks(batch_size.max(1)) {
            let mut tx = self.pool.begin().await?;
            for f in batch {
                let payload = serde_json::to_string(f)?;
                sqlx::query(
                    "INSERT OR REPLACE INTO features (network, window_days, processing_date, address, payload_json) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(network)
                .bind(window_days)
                .bind(processing_date)
                .bind(&f.address)
                .bind(payload)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
        }

        Ok(features.len())
    }

    pub async fn get_features_for_partition(&self, network: &str, window_days: i64, processing_date: &str) -> Result<Vec<FeatureVector>> {
        let rows = sqlx::query("SELECT payload_json FROM features WHERE network = ? AND window_days = ? AND processing_date = ?")
            .bind(network)
            .bind(window_days)
            .bind(processing_date)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let payload: String = row.get("payload_json");
                serde_json::from_str(&payload).map_err(AnalyticsError::from)
            })
            .collect()
    }

    // -- Alerts --------------------------------------------------------

    pub async fn rewrite_alerts_partition(&self, network: &str, window_days: i64, processing_date: &str, alerts: &[Alert]) -> Result<usize> {
        sqlx::query("DELETE FROM alerts WHERE network = ? AND window_days = ? AND processing_date = ?")
            .bind(network)
            .bind(window_days)
            .bind(processing_date)
            .execute(&self.pool)
            .await?;

        let mut seen = HashSet::new();
        let deduped: Vec<&Alert> = alerts.iter().filter(|a| seen.insert(a.alert_id.clone())).collect();

        for a in &deduped {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO alerts
                (alert_id, network, window_days, processing_date, address, typology_type, confidence_score,
                 severity, suspected_address_type, description, volume_usd, evidence_json, risk_indicators, related_addresses)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&a.alert_id)
            .bind(&a.network)
            .bind(a.window_days)
            .bind(&a.processing_date)
            .bind(&a.address)
            .bind(&a.typology_type)
            .bind(a.confidence_score)
            .bind(&a.severity)
            .bind(&a.suspected_address_type)
            .bind(&a.description)
            .bind(a.volume_usd.to_string())
            .bind(a.evidence.to_string())
            .bind(serde_json::to_string(&a.risk_indicators).unwrap_or_default())
            .bind(serde_json::to_string(&a.related_addresses).unwrap_or_default())
            .execute(&self.pool)
            .await?;
        }

        Ok(deduped.len())
    }

    pub async fn rewrite_alert_clusters_partition(&self, network: &str, window_days: i64, processing_date: &str, clusters: &[AlertCluster]) -> Result<usize> {
        sqlx::query("DELETE FROM alert_clusters WHERE network = ? AND window_days = ? AND processing_date = ?")
            .bind(network)
            .bind(window_days)
            .bind(processing_date)
            .execute(&self.pool)
            .await?;

        for c in clusters {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO alert_clusters
                (cluster_id, network, window_days, processing_date, cluster_type, primary_alert_id,
                 related_alert_ids, addresses_involved, total_alerts, total_volume_usd, severity_max, confidence_avg)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&c.cluster_id)
            .bind(network)
            .bind(window_days)
            .bind(processing_date)
            .bind(&c.cluster_type)
            .bind(&c.primary_alert_id)
            .bind(serde_json::to_string(&c.related_alert_ids).unwrap_or_default())
            .bind(serde_json::to_string(&c.addresses_involved).unwrap_or_default())
            .bind(c.total_alerts)
            .bind(c.total_volume_usd.to_string())
            .bind(&c.severity_max)
            .bind(c.confidence_avg)
            .execute(&self.pool)
            .await?;
        }

        Ok(clusters.len())
    }

    // -- Audit -----------------------------------------------------------

    pub async fn write_audit(&self, audit: &ComputationAudit) -> Result<()> {
        sqlx::query(
            "INSERT INTO computation_audit (network, window_days, processing_date, started_at, ended_at, duration_s) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&audit.network)
        .bind(audit.window_days)
        .bind(&audit.processing_date)
        .bind(audit.started_at.to_rfc3339())
        .bind(audit.ended_at.to_rfc3339())
        .bind(audit.duration_s)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_audit_for_partition(&self, network: &str, window_days: i64, processing_date: &str) -> Result<Vec<ComputationAudit>> {
        let rows = sqlx::query(
            "SELECT network, window_days, processing_date, started_at, ended_at, duration_s FROM computation_audit WHERE network = ? AND window_days = ? AND processing_date = ? ORDER BY started_at DESC",
        )
        .bind(network)
        .bind(window_days)
        .bind(processing_date)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let started: String = row.get("started_at");
                let ended: String = row.get("ended_at");
                ComputationAudit {
                    network: row.get("network"),
                    window_days: row.get("window_days"),
                    processing_date: row.get("processing_date"),
                    started_at: DateTime::parse_from_rfc3339(&started).map(|d| d.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now()),
                    ended_at: DateTime::parse_from_rfc3339(&ended).map(|d| d.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now()),
                    duration_s: row.get("duration_s"),
                }
            })
            .collect())
    }

    fn table_for_pattern_type(pattern_type: &str) -> &'static str {
        match pattern_type {
            "cycle" => "patterns_cycle",
            "layering_path" => "patterns_layering",
            "smurfing_network" => "patterns_smurfing_network",
            "proximity_risk" => "patterns_proximity_risk",
            "motif_fanin" | "motif_fanout" => "patterns_motif",
            "temporal_burst" => "patterns_burst",
            "threshold_evasion" => "patterns_threshold",
            other => {
                log::warn!("unrecognized pattern_type {other}, routing to patterns_cycle catch-all");
                "patterns_cycle"
            }
        }
    }

    async fn fetch_chunk_rows(&self, network: &str, addresses: &[String], t0: i64, t1: i64) -> Result<Vec<TransferRow>> {
        if addresses.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT from_address, to_address, block_timestamp_ms, amount_usd FROM transfers WHERE network = ",
        );
        qb.push_bind(network);
        qb.push(" AND block_timestamp_ms >= ");
        qb.push_bind(t0);
        qb.push(" AND block_timestamp_ms < ");
        qb.push_bind(t1);
        qb.push(" AND (from_address IN (");
        let mut separated = qb.separated(", ");
        for a in addresses {
            separated.push_bind(a.clone());
        }
        qb.push(") OR to_address IN (");
        let mut separated = qb.separated(", ");
        for a in addresses {
            separated.push_bind(a.clone());
        }
        qb.push("))");

        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| TransferRow {
                from_address: row.get("from_address"),
                to_address: row.get("to_address"),
                timestamp_ms: row.get("block_timestamp_ms"),
                amount_usd: row.get::<String, _>("amount_usd").parse().unwrap_or(0.0),
            })
            .collect())
    }

    async fn fetch_first_seen(&self, network: &str, addresses: &[String]) -> Result<HashMap<String, i64>> {
        if addresses.is_empty() {
            return Ok(HashMap::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT from_address AS address, MIN(block_timestamp_ms) AS first_ts FROM transfers WHERE network = ",
        );
        qb.push_bind(network);
        qb.push(" AND from_address IN (");
        let mut separated = qb.separated(", ");
        for a in addresses {
            separated.push_bind(a.clone());
        }
        qb.push(") GROUP BY from_address");

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut out = HashMap::new();
        for row in rows {
            let address: String = row.get("address");
            let ts: i64 = row.get("first_ts");
            out.insert(address, ts);
        }
        Ok(out)
    }
}

#[derive(Default)]
struct PairAccumulator {
    tx_count: i64,
    amount_sum: Decimal,
    amount_usd_sum: Decimal,
    first_seen: Option<i64>,
    last_seen: Option<i64>,
    asset_counts: HashMap<String, i64>,
    hourly_pattern: [i64; 24],
    weekly_pattern: [i64; 7],
}

struct TransferRow {
    from_address: String,
    to_address: String,
    timestamp_ms: i64,
    amount_usd: f64,
}

fn hour_of_day(ts_ms: i64) -> usize {
    (((ts_ms / 1000) % 86_400 + 86_400) % 86_400 / 3_600) as usize
}

fn day_of_week(ts_ms: i64) -> usize {
    (((ts_ms / 1000 / 86_400) + 4).rem_euclid(7)) as usize
}

fn row_to_label(row: &SqliteRow) -> AddressLabel {
    AddressLabel {
        network: row.get("network"),
        address: row.get("address"),
        trust_level: row.get("trust_level"),
        address_type: row.get("address_type"),
    }
}

#[async_trait]
impl FeatureAggregateSource for StorageGateway {
    async fn aggregates_for_chunk(&self, network: &str, addresses: &[String], t0: i64, t1: i64) -> Result<ChunkAggregates> {
        let rows = self.fetch_chunk_rows(network, addresses, t0, t1).await?;
        let first_seen = self.fetch_first_seen(network, addresses).await?;
        let midpoint = t0 + (t1 - t0) / 2;

        let mut per_address: HashMap<&str, Vec<&TransferRow>> = HashMap::new();
        for row in &rows {
            per_address.entry(&row.from_address).or_default().push(row);
            per_address.entry(&row.to_address).or_default().push(row);
        }

        let mut out = ChunkAggregates::default();

        for address in addresses {
            let mut incident: Vec<&TransferRow> = per_address.get(address.as_str()).cloned().unwrap_or_default();
            incident.sort_by_key(|r| r.timestamp_ms);

            let amounts: Vec<f64> = incident.iter().map(|r| r.amount_usd).collect();
            out.amount_moments.insert(address.clone(), compute_moments(&amounts));
            out.temporal.insert(address.clone(), compute_temporal(&incident, &first_seen, address, t0));
            out.behavioral.insert(address.clone(), compute_behavioral(&incident));
            out.inter_event.insert(address.clone(), compute_inter_event(&incident));
            out.counterparty.insert(
                address.clone(),
                compute_counterparty(&incident, address, midpoint, &amounts),
            );
        }

        Ok(out)
    }
}

fn compute_moments(amounts: &[f64]) -> AmountMoments {
    if amounts.is_empty() {
        return AmountMoments::default();
    }
    let n = amounts.len() as f64;
    let (sum1, sum2, sum3, sum4) = amounts.iter().fold((0.0, 0.0, 0.0, 0.0), |(a, b, c, d), &x| {
        (a + x, b + x * x, c + x * x * x, d + x * x * x * x)
    });
    let mut sorted = amounts.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let median = sorted[sorted.len() / 2];
    AmountMoments {
        n: amounts.len() as i64,
        sum1,
        sum2,
        sum3,
        sum4,
        min_usd: sorted.first().copied().unwrap_or(0.0),
        max_usd: sorted.last().copied().unwrap_or(0.0),
        median_usd: median,
    }
}

fn compute_temporal(incident: &[&TransferRow], first_seen: &HashMap<String, i64>, address: &str, t0: i64) -> TemporalStats {
    let mut hourly = [0i64; 24];
    let mut daily = [0i64; 7];
    let mut activity_dates: HashSet<i64> = HashSet::new();
    let mut weekend = 0i64;
    let mut night = 0i64;

    for row in incident {
        hourly[hour_of_day(row.timestamp_ms)] += 1;
        let dow = day_of_week(row.timestamp_ms);
        daily[dow] += 1;
        activity_dates.insert(row.timestamp_ms / 86_400_000);
        if dow >= 5 {
            weekend += 1;
        }
        let h = hour_of_day(row.timestamp_ms);
        if !(6..22).contains(&h) {
            night += 1;
        }
    }

    let activity_span_days = match (activity_dates.iter().min(), activity_dates.iter().max()) {
        (Some(lo), Some(hi)) => hi - lo + 1,
        _ => 0,
    };
    let is_new_address = first_seen.get(address).map(|&ts| ts >= t0).unwrap_or(true);

    TemporalStats {
        hourly_activity: hourly,
        daily_activity: daily,
        activity_days: activity_dates.len() as i64,
        activity_span_days,
        weekend_tx_count: weekend,
        night_tx_count: night,
        total_tx_count: incident.len() as i64,
        is_new_address,
    }
}

fn compute_behavioral(incident: &[&TransferRow]) -> BehavioralCounters {
    let mut round_number = 0i64;
    let mut small = 0i64;
    let mut unusual_timing = 0i64;

    let mut last_ts: Option<i64> = None;
    for row in incident {
        if row.amount_usd > 0.0 && row.amount_usd % 100.0 < 1e-6 {
            round_number += 1;
        }
        if row.amount_usd <= SMALL_TRANSACTION_USD {
            small += 1;
        }
        if let Some(prev) = last_ts {
            if (row.timestamp_ms - prev) / 1000 < RAPID_REPEAT_SECONDS {
                unusual_timing += 1;
            }
        }
        last_ts = Some(row.timestamp_ms);
    }

    BehavioralCounters {
        round_number_count: round_number,
        small_transaction_count: small,
        unusual_timing_count: unusual_timing,
        total_count: incident.len() as i64,
    }
}

fn compute_inter_event(incident: &[&TransferRow]) -> InterEventStats {
    if incident.len() < 2 {
        return InterEventStats::default();
    }
    let gaps: Vec<f64> = incident.windows(2).map(|w| (w[1].timestamp_ms - w[0].timestamp_ms) as f64 / 1000.0).collect();
    let (mean, std) = crate::utils::mean_std(&gaps);
    InterEventStats { mean_gap_seconds: mean, std_gap_seconds: std }
}

fn compute_counterparty(incident: &[&TransferRow], address: &str, midpoint: i64, amounts: &[f64]) -> CounterpartyStats {
    let mut first_half: HashSet<&str> = HashSet::new();
    let mut second_half: HashSet<&str> = HashSet::new();
    let mut all: HashSet<&str> = HashSet::new();

    for row in incident {
        let counterparty = if row.from_address == address { row.to_address.as_str() } else { row.from_address.as_str() };
        all.insert(counterparty);
        if row.timestamp_ms < midpoint {
            first_half.insert(counterparty);
        } else {
            second_half.insert(counterparty);
        }
    }

    let stable = first_half.intersection(&second_half).count() as i64;

    let mut sorted = amounts.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let p99 = if sorted.is_empty() { 0.0 } else { sorted[((sorted.len() as f64 - 1.0) * 0.99).round() as usize] };
    let outliers = amounts.iter().filter(|&&a| a > p99).count() as i64;

    CounterpartyStats {
        stable_counterparty_count: stable,
        total_counterparty_count: all.len() as i64,
        p99_outlier_count: outliers,
    }
}

#[async_trait]
impl PatternRepository for StorageGateway {
    async fn delete_partition(&self, network: &str, window_days: i64, processing_date: &str) -> Result<()> {
        for table in PATTERN_TABLES {
            sqlx::query(&format!("DELETE FROM {table} WHERE network = ? AND window_days = ? AND processing_date = ?"))
                .bind(network)
                .bind(window_days)
                .bind(processing_date)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn insert_patterns(&self, patterns: &[Pattern]) -> Result<()> {
        for p in patterns {
            let table = Self::table_for_pattern_type(&p.pattern_type);
            sqlx::query(&format!(
                r#"
                INSERT OR REPLACE INTO {table}
                (pattern_id, pattern_hash, pattern_type, network, window_days, processing_date,
                 addresses_involved, address_roles, detection_timestamp, evidence_transaction_count,
                 evidence_volume_usd, detection_method, payload_json)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#
            ))
            .bind(&p.pattern_id)
            .bind(&p.pattern_hash)
            .bind(&p.pattern_type)
            .bind(&p.network)
            .bind(p.window_days)
            .bind(&p.processing_date)
            .bind(serde_json::to_string(&p.addresses_involved).unwrap_or_default())
            .bind(serde_json::to_string(&p.address_roles).unwrap_or_default())
            .bind(p.detection_timestamp)
            .bind(p.evidence_transaction_count)
            .bind(p.evidence_volume_usd.to_string())
            .bind(&p.detection_method)
            .bind(serde_json::to_string(&p.payload)?)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn get_for_partition(&self, network: &str, window_days: i64, processing_date: &str, limit: i64, offset: i64) -> Result<Vec<Pattern>> {
        let rows = sqlx::query(
            "SELECT * FROM pattern_detections WHERE network = ? AND window_days = ? AND processing_date = ? ORDER BY pattern_id LIMIT ? OFFSET ?",
        )
        .bind(network)
        .bind(window_days)
        .bind(processing_date)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_pattern).collect()
    }

    async fn count_for_partition(&self, network: &str, window_days: i64, processing_date: &str) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS c FROM pattern_detections WHERE network = ? AND window_days = ? AND processing_date = ?",
        )
        .bind(network)
        .bind(window_days)
        .bind(processing_date)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("c"))
    }
}

fn row_to_pattern(row: &SqliteRow) -> Result<Pattern> {
    let addresses_involved: Vec<String> = serde_json::from_str(&row.get::<String, _>("addresses_involved"))?;
    let address_roles: Vec<String> = serde_json::from_str(&row.get::<String, _>("address_roles"))?;
    let payload: PatternPayload = serde_json::from_str(&row.get::<String, _>("payload_json"))?;
    let evidence_volume_usd = Decimal::from_str(&row.get::<String, _>("evidence_volume_usd")).unwrap_or(Decimal::ZERO);

    Ok(Pattern {
        pattern_id: row.get("pattern_id"),
        pattern_hash: row.get("pattern_hash"),
        pattern_type: row.get("pattern_type"),
        network: row.get("network"),
        window_days: row.get("window_days"),
        processing_date: row.get("processing_date"),
        addresses_involved,
        address_roles,
        detection_timestamp: row.get("detection_timestamp"),
        evidence_transaction_count: row.get("evidence_transaction_count"),
        evidence_volume_usd,
        detection_method: row.get("detection_method"),
        payload,
    })
}

/// Load the full, validated analytics config from `path`, falling back to a
/// remote copy if the local file is missing or unparsable (§4.8).
pub async fn load_config(path: &std::path::Path, fallback_url: Option<&str>) -> Result<AnalyticsConfig> {
    AnalyticsConfig::load(path, fallback_url).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use tempfile::TempDir;

    async fn gateway() -> (StorageGateway, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        let gw = StorageGateway::connect(&format!("sqlite://{}", path.display())).await.unwrap();
        (gw, dir)
    }

    fn transfer(from: &str, to: &str, ts: i64, amount_usd: i64, idx: i64) -> Transfer {
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
            amount: Decimal::new(amount_usd, 0),
            fee: Decimal::ZERO,
            amount_usd: Decimal::new(amount_usd, 0),
        }
    }

    #[tokio::test]
    async fn schema_init_is_idempotent() {
        let (gw, _dir) = gateway().await;
        gw.init_schema().await.unwrap();
        gw.init_schema().await.unwrap();
    }

    #[tokio::test]
    async fn build_flows_aggregates_by_ordered_pair() {
        let (gw, _dir) = gateway().await;
        let transfers = vec![
            transfer("a", "b", 0, 1_000, 1),
            transfer("a", "b", 3_600_000, 2_000, 2),
            transfer("b", "a", 0, 500, 3),
        ];
        gw.insert_transfers(&transfers, "ethereum", 100).await.unwrap();

        let flows = gw.build_flows("ethereum", 1, "2026-01-01", 0, 86_400_000).await.unwrap();
        assert_eq!(flows.len(), 2);
        let ab = flows.iter().find(|f| f.from_address == "a" && f.to_address == "b").unwrap();
        assert_eq!(ab.tx_count, 2);
        assert_eq!(ab.amount_usd_sum, Decimal::new(3_000, 0));
        assert!(ab.is_bidirectional);
        assert!((ab.reciprocity_ratio - (500.0 / 3_000.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rewrite_patterns_partition_deletes_then_inserts() {
        let (gw, _dir) = gateway().await;
        let p = Pattern::new(
            "cycle",
            "ethereum",
            1,
            "2026-01-01",
            vec!["a".into(), "b".into()],
            vec!["participant".into(), "participant".into()],
            0,
            2,
            Decimal::new(1_000, 0),
            "cycle_detector",
            PatternPayload::Cycle {
                cycle_length: 2,
                cycle_volume_usd: Decimal::new(1_000, 0),
                cycle_path: vec!["a".into(), "b".into()],
            },
        );
        crate::patterns::store::rewrite_partition(&gw, "ethereum", 1, "2026-01-01", vec![p], 100).await.unwrap();
        let count = gw.count_for_partition("ethereum", 1, "2026-01-01").await.unwrap();
        assert_eq!(count, 1);

        crate::patterns::store::rewrite_partition(&gw, "ethereum", 1, "2026-01-01", vec![], 100).await.unwrap();
        let count = gw.count_for_partition("ethereum", 1, "2026-01-01").await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn feature_aggregates_split_small_vs_large_amounts() {
        let (gw, _dir) = gateway().await;
        let transfers = vec![transfer("a", "b", 0, 50, 1), transfer("a", "c", 0, 5_000, 2)];
        gw.insert_transfers(&transfers, "ethereum", 100).await.unwrap();

        let agg = gw.aggregates_for_chunk("ethereum", &["a".to_string()], 0, 86_400_000).await.unwrap();
        let behavioral = agg.behavioral.get("a").unwrap();
        assert_eq!(behavioral.total_count, 2);
        assert_eq!(behavioral.small_transaction_count, 1);
    }
}
