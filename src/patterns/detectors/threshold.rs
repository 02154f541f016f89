//! Threshold evasion detector (§4.4.7): outgoing amounts clustered just
//! under a configured reporting threshold.

use crate::config::ConfigSection;
use crate::graph::Graph;
use crate::patterns::types::{Pattern, PatternPayload};
use crate::utils;
use crate::Result;
use rust_decimal::Decimal;

pub struct ThresholdDetector {
    thresholds: Vec<f64>,
    near_lower_pct: f64,
    near_upper_pct: f64,
    min_transactions_near_threshold: usize,
    clustering_score_threshold: f64,
    consistency_threshold: f64,
    w_cluster: f64,
    w_consistency: f64,
    w_temporal: f64,
    threshold_type: String,
}

impl ThresholdDetector {
    pub fn new(section: &ConfigSection, network: &str) -> Result<Self> {
        let threshold_type = match section.get(network, "threshold_type") {
            Some(v) => match v {
                crate::config::ConfigValue::Text(s) => s.clone(),
                _ => "reporting".to_string(),
            },
            None => "reporting".to_string(),
        };

        Ok(Self {
            thresholds: section.require_list("threshold_detection", network, "thresholds")?,
            near_lower_pct: section.get_f64_or(network, "near_lower_pct", 0.80),
            near_upper_pct: section.get_f64_or(network, "near_upper_pct", 0.99),
            min_transactions_near_threshold: section.require_usize(
                "threshold_detection",
                network,
                "min_transactions_near_threshold",
            )?,
            clustering_score_threshold: section.require_f64(
                "threshold_detection",
                network,
                "clustering_score_threshold",
            )?,
            consistency_threshold: section.require_f64("threshold_detection", network, "consistency_threshold")?,
            w_cluster: section.get_f64_or(network, "w_cluster", 0.4),
            w_consistency: section.get_f64_or(network, "w_consistency", 0.3),
            w_temporal: section.get_f64_or(network, "w_temporal", 0.3),
            threshold_type,
        })
    }

    pub fn detect(
        &self,
        graph: &Graph,
        network: &str,
        window_days: i64,
        processing_date: &str,
        now_ms: i64,
    ) -> Result<Vec<Pattern>> {
        let n = graph.node_count();
        let mut patterns = Vec::new();

        for id in 0..n {
            // Disaggregate `amount_usd_sum/tx_count` per counterparty edge
            // when per-transaction data is unavailable.
            let amounts: Vec<f64> = graph
                .out_edges(id)
                .flat_map(|e| {
                    let per_tx = if e.tx_count > 0 { e.weight / e.tx_count as f64 } else { e.weight };
                    std::iter::repeat(per_tx).take(e.tx_count.max(1) as usize)
                })
                .collect();
            if amounts.is_empty() {
                continue;
            }
            let total = amounts.len();

            for &threshold_value in &self.thresholds {
                let lo = self.near_lower_pct * threshold_value;
                let hi = self.near_upper_pct * threshold_value;
                let near: Vec<f64> = amounts.iter().copied().filter(|&a| a >= lo && a <= hi).collect();
                let count = near.len();

                if count < self.min_transactions_near_threshold {
                    continue;
                }

                let clustering_score = count as f64 / total as f64;
                if clustering_score < self.clustering_score_threshold {
                    continue;
                }

                let (mean, std) = utils::mean_std(&near);
                let size_consistency = if mean > 0.0 { (1.0 - std / mean).max(0.0) } else { 0.0 };
                if size_consistency < self.consistency_threshold {
                    continue;
                }

                let temporal_spread = 1.0; // no per-transaction timestamps available at this layer.
                let avoidance_score = (self.w_cluster * clustering_score
                    + self.w_consistency * size_consistency
                    + self.w_temporal * temporal_spread)
                    .clamp(0.0, 1.0);

                let address = graph.address(id).to_string();
                let volume: Decimal = graph.out_edges(id).map(|e| e.amount_usd_sum).sum();

                patterns.push(Pattern::new_with_identity(
                    "threshold_evasion",
                    network,
                    window_days,
                    processing_date,
                    vec![address.clone()],
                    &[address.clone(), self.threshold_type.clone(), threshold_value.to_string()],
                    vec!["primary_address".to_string()],
                    now_ms,
                    count as i64,
                    volume,
                    "threshold_detector",
                    PatternPayload::ThresholdEvasion {
                        primary_address: address,
                        threshold_type: self.threshold_type.clone(),
                        threshold_value: decimal_from_f64(threshold_value),
                        transactions_near_threshold: count as i64,
                        clustering_score,
                        size_consistency,
                        avoidance_score,
                    },
                ));
            }
        }

        Ok(patterns)
    }
}

fn decimal_from_f64(v: f64) -> Decimal {
    Decimal::from_str_exact(&format!("{v:.8}")).unwrap_or(Decimal::ZERO)
}

impl std::fmt::Debug for ThresholdDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThresholdDetector").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Flow;

    fn flow(from: &str, to: &str, amount_usd: i64) -> Flow {
        Flow {
            from_address: from.into(),
            to_address: to.into(),
            window_days: 1,
            processing_date: "2026-01-01".into(),
            tx_count: 1,
            amount_sum: Decimal::new(amount_usd, 0),
            amount_usd_sum: Decimal::new(amount_usd, 0),
            first_seen_timestamp: 0,
            last_seen_timestamp: 0,
            unique_assets: 1,
            dominant_asset: "ETH".into(),
            hourly_pattern: [0; 24],
            weekly_pattern: [0; 7],
            reciprocity_ratio: 0.0,
            is_bidirectional: false,
        }
    }

    fn section() -> ConfigSection {
        let json = serde_json::json!({
            "thresholds": [10_000.0],
            "min_transactions_near_threshold": 5.0,
            "clustering_score_threshold": 0.8,
            "consistency_threshold": 0.5,
        });
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn threshold_evasion_scenario_s6() {
        let amounts = [9_400, 9_450, 9_500, 9_520, 9_550, 9_480, 9_490, 9_510, 9_460, 9_600];
        let flows: Vec<Flow> = amounts
            .iter()
            .enumerate()
            .map(|(i, &amt)| flow("E", &format!("R{i}"), amt))
            .collect();
        let graph = Graph::build(&flows).unwrap();
        let detector = ThresholdDetector::new(&section(), "ethereum").unwrap();
        let patterns = detector.detect(&graph, "ethereum", 1, "2026-01-01", 0).unwrap();

        assert_eq!(patterns.len(), 1);
        match &patterns[0].payload {
            PatternPayload::ThresholdEvasion {
                primary_address,
                transactions_near_threshold,
                clustering_score,
                size_consistency,
                threshold_type,
                ..
            } => {
                assert_eq!(primary_address, "E");
                assert_eq!(*transactions_near_threshold, 10);
                assert!((*clustering_score - 1.0).abs() < 1e-9);
                assert!(*size_consistency >= 0.95);
                assert_eq!(threshold_type, "reporting");
            }
            _ => panic!("wrong payload"),
        }
    }

    /// Two distinct configured thresholds, both satisfied by the same
    /// node's amounts, must survive as two distinct patterns — the
    /// canonical identity is `[node, threshold_type, str(threshold_value)]`,
    /// not just `[node]`, so they must not collide on `pattern_id`.
    #[test]
    fn multiple_thresholds_on_one_node_produce_distinct_patterns() {
        let amounts = [8_700, 8_750, 8_800, 8_820, 8_850, 8_780, 8_790, 8_810, 8_760, 8_780];
        let flows: Vec<Flow> = amounts
            .iter()
            .enumerate()
            .map(|(i, &amt)| flow("E", &format!("R{i}"), amt))
            .collect();
        let graph = Graph::build(&flows).unwrap();

        let json = serde_json::json!({
            "thresholds": [10_000.0, 9_000.0],
            "min_transactions_near_threshold": 5.0,
            "clustering_score_threshold": 0.8,
            "consistency_threshold": 0.5,
        });
        let section: ConfigSection = serde_json::from_value(json).unwrap();
        let detector = ThresholdDetector::new(&section, "ethereum").unwrap();
        let patterns = detector.detect(&graph, "ethereum", 1, "2026-01-01", 0).unwrap();

        assert_eq!(patterns.len(), 2);
        assert_ne!(patterns[0].pattern_id, patterns[1].pattern_id);

        let threshold_values: Vec<f64> = patterns
            .iter()
            .map(|p| match &p.payload {
                PatternPayload::ThresholdEvasion { threshold_value, .. } => threshold_value.to_string().parse().unwrap(),
                _ => panic!("wrong payload"),
            })
            .collect();
        assert!(threshold_values.contains(&10_000.0));
        assert!(threshold_values.contains(&9_000.0));
    }
}
