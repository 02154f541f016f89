//! Typology detector (§4.6): rule fusion over features and structural
//! patterns into alerts, followed by same-entity alert clustering.

use crate::config::{AnalyticsConfig, ConfigSection};
use crate::features::FeatureVector;
use crate::patterns::Pattern;
use crate::utils;
use crate::Result;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: String,
    pub network: String,
    pub window_days: i64,
    pub processing_date: String,
    pub address: String,
    pub typology_type: String,
    pub confidence_score: f64,
    pub severity: String,
    pub suspected_address_type: String,
    pub description: String,
    pub volume_usd: Decimal,
    pub evidence: serde_json::Value,
    pub risk_indicators: Vec<String>,
    pub related_addresses: Vec<String>,
}

impl Alert {
    /// `UUIDv5(DNS, address "-" typology "-" processing_date)` — stable
    /// across reruns of the same partition.
    pub fn stable_id(address: &str, typology: &str, processing_date: &str) -> String {
        let name = format!("{address}-{typology}-{processing_date}");
        Uuid::new_v5(&Uuid::NAMESPACE_DNS, name.as_bytes()).to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertCluster {
    pub cluster_id: String,
    pub cluster_type: String,
    pub primary_alert_id: String,
    pub related_alert_ids: Vec<String>,
    pub addresses_involved: Vec<String>,
    pub total_alerts: i64,
    pub total_volume_usd: Decimal,
    pub severity_max: String,
    pub confidence_avg: f64,
}

/// `≥0.9 critical`, `≥0.75 high`, `≥0.6 medium`, else `low`.
fn severity_from_confidence(confidence: f64) -> &'static str {
    if confidence >= 0.9 {
        "critical"
    } else if confidence >= 0.75 {
        "high"
    } else if confidence >= 0.6 {
        "medium"
    } else {
        "low"
    }
}

fn severity_rank(severity: &str) -> u8 {
    match severity {
        "critical" => 3,
        "high" => 2,
        "medium" => 1,
        _ => 0,
    }
}

/// Closed mapping from typology/pattern type to `suspected_address_type`.
fn suspected_address_type(typology: &str, participant_count: Option<i64>) -> &'static str {
    match typology {
        "structuring" => "wallet",
        "peel_chain" => "wallet",
        "ping_pong" => "wallet",
        "rapid_fanout" => "wallet",
        "velocity_anomaly" => "wallet",
        "fresh_to_exchange" => "exchange_counterparty",
        "smurfing_network" => "wallet",
        "motif_fanin" | "motif_fanout" => {
            if participant_count.unwrap_or(0) > 50 {
                "institutional"
            } else {
                "wallet"
            }
        }
        "cycle" | "layering_path" => "wallet",
        "proximity_risk" => "unknown",
        _ => "unknown",
    }
}

/// Maps a structural pattern's `pattern_type` to the typology emitted for
/// each of its involved addresses during fan-out.
fn typology_for_pattern_type(pattern_type: &str) -> Option<&'static str> {
    match pattern_type {
        "cycle" => Some("peel_chain"),
        "layering_path" => Some("peel_chain"),
        "smurfing_network" => Some("rapid_fanout"),
        "motif_fanin" | "motif_fanout" => Some("rapid_fanout"),
        "proximity_risk" => Some("velocity_anomaly"),
        "threshold_evasion" => Some("structuring"),
        "temporal_burst" => Some("velocity_anomaly"),
        _ => None,
    }
}

struct TypologyThresholds {
    peel_chain_min_recipients: f64,
    peel_chain_min_volume_usd: f64,
    structuring_min_score: f64,
    structuring_min_tx: f64,
    structuring_max_amount_usd: f64,
    ping_pong_min_reciprocity: f64,
    ping_pong_max_counterparties: f64,
    ping_pong_min_volume: f64,
    rapid_fanout_min_recipients: f64,
    rapid_fanout_min_burst: f64,
    rapid_fanout_min_volume: f64,
    velocity_min_velocity: f64,
    velocity_min_volume: f64,
    fresh_to_exchange_min_volume_usd: f64,
    min_alerts_for_cluster: usize,
}

impl TypologyThresholds {
    fn from_section(section: &ConfigSection, network: &str) -> Result<Self> {
        Ok(Self {
            peel_chain_min_recipients: section.require_f64("typologies", network, "peel_chain_min_recipients")?,
            peel_chain_min_volume_usd: section.require_f64("typologies", network, "peel_chain_min_volume_usd")?,
            structuring_min_score: section.require_f64("typologies", network, "structuring_min_score")?,
            structuring_min_tx: section.require_f64("typologies", network, "structuring_min_tx")?,
            structuring_max_amount_usd: section.require_f64("typologies", network, "structuring_max_amount_usd")?,
            ping_pong_min_reciprocity: section.require_f64("typologies", network, "ping_pong_min_reciprocity")?,
            ping_pong_max_counterparties: section.require_f64(
                "typologies",
                network,
                "ping_pong_max_counterparties",
            )?,
            ping_pong_min_volume: section.require_f64("typologies", network, "ping_pong_min_volume")?,
            rapid_fanout_min_recipients: section.require_f64(
                "typologies",
                network,
                "rapid_fanout_min_recipients",
            )?,
            rapid_fanout_min_burst: section.require_f64("typologies", network, "rapid_fanout_min_burst")?,
            rapid_fanout_min_volume: section.require_f64("typologies", network, "rapid_fanout_min_volume")?,
            velocity_min_velocity: section.require_f64("typologies", network, "velocity_min_velocity")?,
            velocity_min_volume: section.require_f64("typologies", network, "velocity_min_volume")?,
            fresh_to_exchange_min_volume_usd: section.require_f64(
                "typologies",
                network,
                "fresh_to_exchange_min_volume_usd",
            )?,
            min_alerts_for_cluster: section.require_usize("typologies", network, "min_alerts_for_cluster")?,
        })
    }
}

pub struct TypologyDetector {
    thresholds: TypologyThresholds,
}

impl TypologyDetector {
    pub fn new(config: &AnalyticsConfig, network: &str) -> Result<Self> {
        Ok(Self {
            thresholds: TypologyThresholds::from_section(config.section("typologies")?, network)?,
        })
    }

    /// Per-address rule evaluation (§4.6 table) plus structural-pattern
    /// fan-out. `fresh_to_exchange` is evaluated separately via
    /// [`Self::fresh_to_exchange_alerts`] since it needs a join against the
    /// address-label table the caller owns.
    pub fn detect(
        &self,
        features: &[FeatureVector],
        patterns: &[Pattern],
        network: &str,
        window_days: i64,
        processing_date: &str,
    ) -> Vec<Alert> {
        let mut alerts = Vec::new();

        for f in features {
            alerts.extend(self.evaluate_address_rules(f, network, window_days, processing_date));
        }

        alerts.extend(self.structural_fan_out(patterns, network, window_days, processing_date));

        alerts
    }

    fn evaluate_address_rules(
        &self,
        f: &FeatureVector,
        network: &str,
        window_days: i64,
        processing_date: &str,
    ) -> Vec<Alert> {
        let volume_usd: f64 = f.total_volume_usd.to_string().parse().unwrap_or(0.0);
        let t = &self.thresholds;
        let mut alerts = Vec::new();

        // peel_chain
        if f.degree_total as f64 >= t.peel_chain_min_recipients
            && volume_usd >= t.peel_chain_min_volume_usd
            && f.burst_factor < 0.3
        {
            let confidence = 0.4 * (f.degree_total as f64 / 20.0).min(1.0)
                + 0.3 * (volume_usd / 50_000.0).min(1.0)
                + 0.3 * (1.0 - f.burst_factor);
            if confidence >= 0.6 {
                alerts.push(self.make_alert(
                    f,
                    "peel_chain",
                    confidence,
                    network,
                    window_days,
                    processing_date,
                ));
            }
        }

        // structuring
        if f.structuring_score > t.structuring_min_score
            && (f.degree_in + f.degree_out) as f64 >= t.structuring_min_tx
        {
            let avg_tx: f64 = f.avg_tx_usd.to_string().parse().unwrap_or(0.0);
            if avg_tx < t.structuring_max_amount_usd {
                let tx_count = (f.degree_in + f.degree_out) as f64;
                let confidence = 0.5 * f.structuring_score
                    + 0.3 * (tx_count / 50.0).min(1.0)
                    + 0.2 * (1.0 - (avg_tx / 10_000.0).min(1.0));
                if confidence >= 0.6 {
                    alerts.push(self.make_alert(f, "structuring", confidence, network, window_days, processing_date));
                }
            }
        }

        // ping_pong
        if f.reciprocity_ratio > t.ping_pong_min_reciprocity
            && (f.degree_total as f64) < t.ping_pong_max_counterparties
            && volume_usd >= t.ping_pong_min_volume
        {
            let confidence = 0.5 * f.reciprocity_ratio
                + 0.3 * (1.0 - f.degree_total as f64 / 20.0).max(0.0)
                + 0.2 * (volume_usd / 10_000.0).min(1.0);
            if confidence >= 0.7 {
                alerts.push(self.make_alert(f, "ping_pong", confidence, network, window_days, processing_date));
            }
        }

        // rapid_fanout
        if f.degree_total as f64 >= t.rapid_fanout_min_recipients
            && f.burst_factor > t.rapid_fanout_min_burst
            && volume_usd >= t.rapid_fanout_min_volume
        {
            let confidence = 0.4 * (f.degree_total as f64 / 50.0).min(1.0)
                + 0.4 * f.burst_factor
                + 0.2 * (volume_usd / 25_000.0).min(1.0);
            if confidence >= 0.6 {
                alerts.push(self.make_alert(f, "rapid_fanout", confidence, network, window_days, processing_date));
            }
        }

        // velocity_anomaly
        let velocity_score = f.transaction_regularity.max(f.flow_burstiness);
        if velocity_score > t.velocity_min_velocity && volume_usd >= t.velocity_min_volume && f.burst_factor > 0.7 {
            let daily_velocity: f64 = f.avg_daily_volume_usd.to_string().parse().unwrap_or(0.0) / 1_000.0;
            let confidence =
                0.4 * velocity_score + 0.3 * f.burst_factor + 0.3 * (daily_velocity / 20.0).min(1.0);
            if confidence >= 0.7 {
                alerts.push(self.make_alert(
                    f,
                    "velocity_anomaly",
                    confidence,
                    network,
                    window_days,
                    processing_date,
                ));
            }
        }

        alerts
    }

    /// Batched rule: addresses with `is_new_address` true whose total
    /// out-volume to labeled exchanges clears `fresh_to_exchange_min_volume_usd`.
    /// `exchange_volume_by_address` is the result of the join the caller
    /// (pipeline/storage) performs against the address-label table.
    pub fn fresh_to_exchange_alerts(
        &self,
        features: &[FeatureVector],
        exchange_volume_by_address: &HashMap<String, Decimal>,
        network: &str,
        window_days: i64,
        processing_date: &str,
    ) -> Vec<Alert> {
        let mut alerts = Vec::new();
        for f in features {
            if !f.is_new_address {
                continue;
            }
            let total_out: f64 = f.total_out_usd.to_string().parse().unwrap_or(0.0);
            if total_out < self.thresholds.fresh_to_exchange_min_volume_usd {
                continue;
            }
            let Some(&exchange_volume) = exchange_volume_by_address.get(&f.address).as_ref() else {
                continue;
            };
            let exchange_volume_f64: f64 = exchange_volume.to_string().parse().unwrap_or(0.0);
            if exchange_volume_f64 < self.thresholds.fresh_to_exchange_min_volume_usd {
                continue;
            }

            alerts.push(self.make_alert(f, "fresh_to_exchange", 0.9, network, window_days, processing_date));
        }
        alerts
    }

    /// Structural-pattern fan-out: one alert per involved address for
    /// patterns whose derived risk score clears 0.5.
    fn structural_fan_out(
        &self,
        patterns: &[Pattern],
        network: &str,
        window_days: i64,
        processing_date: &str,
    ) -> Vec<Alert> {
        let mut alerts = Vec::new();

        for pattern in patterns {
            let Some(typology) = typology_for_pattern_type(&pattern.pattern_type) else {
                continue;
            };
            let risk_score = pattern_risk_score(pattern);
            if risk_score < 0.5 {
                continue;
            }

            for address in &pattern.addresses_involved {
                let alert_id = Alert::stable_id(address, typology, processing_date);
                let severity = severity_from_confidence(risk_score).to_string();
                alerts.push(Alert {
                    alert_id,
                    network: network.to_string(),
                    window_days,
                    processing_date: processing_date.to_string(),
                    address: address.clone(),
                    typology_type: typology.to_string(),
                    confidence_score: risk_score,
                    severity,
                    suspected_address_type: suspected_address_type(
                        &pattern.pattern_type,
                        Some(pattern.addresses_involved.len() as i64),
                    )
                    .to_string(),
                    description: format!("fan-out from structural pattern {}", pattern.pattern_id),
                    volume_usd: pattern.evidence_volume_usd,
                    evidence: serde_json::json!({ "pattern_id": pattern.pattern_id }),
                    risk_indicators: vec![pattern.pattern_type.clone()],
                    related_addresses: pattern.addresses_involved.clone(),
                });
            }
        }

        alerts
    }

    fn make_alert(
        &self,
        f: &FeatureVector,
        typology: &str,
        confidence: f64,
        network: &str,
        window_days: i64,
        processing_date: &str,
    ) -> Alert {
        let confidence = confidence.clamp(0.0, 1.0);
        Alert {
            alert_id: Alert::stable_id(&f.address, typology, processing_date),
            network: network.to_string(),
            window_days,
            processing_date: processing_date.to_string(),
            address: f.address.clone(),
            typology_type: typology.to_string(),
            confidence_score: confidence,
            severity: severity_from_confidence(confidence).to_string(),
            suspected_address_type: suspected_address_type(typology, None).to_string(),
            description: format!("{typology} rule matched for {}", f.address),
            volume_usd: f.total_volume_usd,
            evidence: serde_json::json!({
                "degree_total": f.degree_total,
                "burst_factor": f.burst_factor,
                "structuring_score": f.structuring_score,
            }),
            risk_indicators: vec![typology.to_string()],
            related_addresses: Vec::new(),
        }
    }
}

/// `max(confidence_score, risk_score, severity_score)` carried on the
/// pattern — this crate's patterns don't carry an explicit risk score
/// field, so severity is derived from the detector's own evidence volume
/// relative to the pattern type's characteristic scale, clipped to 1.
fn pattern_risk_score(pattern: &Pattern) -> f64 {
    use crate::patterns::PatternPayload::*;
    match &pattern.payload {
        Cycle { .. } => 0.7,
        Layering { .. } => 0.7,
        SmurfingNetwork { network_density, .. } => network_density.max(0.5).min(1.0),
        ProximityRisk { risk_propagation_score, .. } => *risk_propagation_score,
        Motif { .. } => 0.6,
        TemporalBurst { burst_intensity, .. } => burst_intensity.clamp(0.0, 1.0),
        ThresholdEvasion { avoidance_score, .. } => *avoidance_score,
    }
}

/// Same-entity alert clustering: group by address, emit a cluster when the
/// group has at least `min_alerts` alerts.
pub fn cluster_same_entity(alerts: &[Alert], min_alerts: usize) -> Vec<AlertCluster> {
    // `structural_fan_out` can emit the same (address, typology) alert more
    // than once (two patterns of the same mapped typology both involving
    // the address), which is fine for the persisted `alerts` table (storage
    // dedups on `alert_id` at write time) but would otherwise double-count
    // here. Dedup by `alert_id` first so `total_alerts` matches the number
    // of distinct (address, typology) pairs, not the raw alert count.
    let mut seen = std::collections::HashSet::new();
    let deduped: Vec<&Alert> = alerts.iter().filter(|a| seen.insert(a.alert_id.clone())).collect();

    let mut by_address: HashMap<String, Vec<&Alert>> = HashMap::new();
    for alert in deduped {
        by_address.entry(alert.address.clone()).or_default().push(alert);
    }

    let mut clusters = Vec::new();
    for (address, group) in by_address {
        if group.len() < min_alerts {
            continue;
        }
        let primary = group.iter().max_by(|a, b| {
            severity_rank(&a.severity)
                .cmp(&severity_rank(&b.severity))
                .then(a.confidence_score.partial_cmp(&b.confidence_score).unwrap())
        });
        let Some(primary) = primary else { continue };

        let severity_max = group
            .iter()
            .map(|a| a.severity.as_str())
            .max_by_key(|s| severity_rank(s))
            .unwrap_or("low")
            .to_string();
        let confidence_avg = group.iter().map(|a| a.confidence_score).sum::<f64>() / group.len() as f64;
        let related_alert_ids: Vec<String> = group.iter().map(|a| a.alert_id.clone()).collect();

        let cluster_id = utils::canonical_pattern_id("same_entity", &[address.clone()]);

        clusters.push(AlertCluster {
            cluster_id,
            cluster_type: "same_entity".to_string(),
            primary_alert_id: primary.alert_id.clone(),
            related_alert_ids,
            addresses_involved: vec![address],
            total_alerts: group.len() as i64,
            total_volume_usd: primary.volume_usd,
            severity_max,
            confidence_avg,
        });
    }

    clusters
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_mapping_matches_thresholds() {
        assert_eq!(severity_from_confidence(0.95), "critical");
        assert_eq!(severity_from_confidence(0.8), "high");
        assert_eq!(severity_from_confidence(0.65), "medium");
        assert_eq!(severity_from_confidence(0.2), "low");
    }

    #[test]
    fn alert_id_is_stable_across_reruns() {
        let id1 = Alert::stable_id("0xabc", "structuring", "2026-01-01");
        let id2 = Alert::stable_id("0xabc", "structuring", "2026-01-01");
        assert_eq!(id1, id2);
    }

    fn alert(address: &str, typology: &str, severity: &str, confidence: f64, volume: i64) -> Alert {
        Alert {
            alert_id: Alert::stable_id(address, typology, "2026-01-01"),
            network: "ethereum".into(),
            window_days: 1,
            processing_date: "2026-01-01".into(),
            address: address.to_string(),
            typology_type: typology.to_string(),
            confidence_score: confidence,
            severity: severity.to_string(),
            suspected_address_type: "wallet".into(),
            description: String::new(),
            volume_usd: Decimal::new(volume, 0),
            evidence: serde_json::json!({}),
            risk_indicators: vec![],
            related_addresses: vec![],
        }
    }

    #[test]
    fn same_entity_cluster_does_not_sum_volume() {
        let alerts = vec![
            alert("a", "structuring", "high", 0.8, 10_000),
            alert("a", "ping_pong", "critical", 0.95, 10_000),
        ];
        let clusters = cluster_same_entity(&alerts, 2);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].total_alerts, 2);
        assert_eq!(clusters[0].total_volume_usd, Decimal::new(10_000, 0));
        assert_eq!(clusters[0].severity_max, "critical");
    }

    #[test]
    fn below_threshold_group_produces_no_cluster() {
        let alerts = vec![alert("a", "structuring", "high", 0.8, 10_000)];
        let clusters = cluster_same_entity(&alerts, 2);
        assert!(clusters.is_empty());
    }

    /// `structural_fan_out` can emit the same (address, typology) alert more
    /// than once when two different patterns map to the same typology and
    /// both involve the address; `cluster_same_entity` must dedup by
    /// `alert_id` so a duplicate doesn't inflate `total_alerts` (§8.10).
    #[test]
    fn duplicate_alert_id_is_not_double_counted() {
        let alerts = vec![
            alert("a", "structuring", "high", 0.8, 10_000),
            alert("a", "structuring", "high", 0.8, 10_000),
            alert("a", "ping_pong", "critical", 0.95, 10_000),
        ];
        let clusters = cluster_same_entity(&alerts, 2);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].total_alerts, 2);
        assert_eq!(clusters[0].related_alert_ids.len(), 2);

        let duplicate_only = vec![
            alert("a", "structuring", "high", 0.8, 10_000),
            alert("a", "structuring", "high", 0.8, 10_000),
        ];
        assert!(cluster_same_entity(&duplicate_only, 2).is_empty());
    }
}
