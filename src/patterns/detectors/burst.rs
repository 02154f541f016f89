//! Temporal burst detector (§4.4.6): sliding-window z-score over each
//! node's incident transaction timestamps. `Flow` rows only carry
//! window-level first/last-seen timestamps, not a full per-transaction
//! trace, so the pipeline supplies the raw per-address timestamp union
//! separately (`timestamps_by_address`); when it is empty the detector
//! returns no patterns, matching the spec's own fallback for inputs with
//! no per-edge timestamps.

use crate::config::ConfigSection;
use crate::graph::Graph;
use crate::patterns::types::{Pattern, PatternPayload};
use crate::utils;
use crate::Result;
use rust_decimal::Decimal;
use std::collections::HashMap;

pub struct BurstDetector {
    time_window_seconds: i64,
    min_burst_intensity: f64,
    min_burst_transactions: usize,
    z_score_threshold: f64,
}

impl BurstDetector {
    pub fn new(section: &ConfigSection, network: &str) -> Result<Self> {
        Ok(Self {
            time_window_seconds: section.require_usize("burst_detection", network, "time_window_seconds")? as i64,
            min_burst_intensity: section.require_f64("burst_detection", network, "min_burst_intensity")?,
            min_burst_transactions: section.require_usize("burst_detection", network, "min_burst_transactions")?,
            z_score_threshold: section.require_f64("burst_detection", network, "z_score_threshold")?,
        })
    }

    pub fn detect(
        &self,
        graph: &Graph,
        timestamps_by_address: &HashMap<String, Vec<i64>>,
        network: &str,
        window_days: i64,
        processing_date: &str,
        now_ms: i64,
    ) -> Result<Vec<Pattern>> {
        if timestamps_by_address.is_empty() {
            return Ok(Vec::new());
        }

        let mut patterns = Vec::new();

        for (address, timestamps) in timestamps_by_address {
            if graph.node_index(address).is_none() {
                continue;
            }
            let mut ts = timestamps.clone();
            ts.sort_unstable();
            if ts.len() < self.min_burst_transactions {
                continue;
            }

            let span_seconds = ((ts.last().unwrap() - ts.first().unwrap()) / 1000).max(1);
            let baseline_rate = ts.len() as f64 / span_seconds as f64;

            let mut i = 0usize;
            while i < ts.len() {
                let window_start = ts[i];
                let window_end_ts = window_start + self.time_window_seconds * 1000;
                let mut j = i;
                while j < ts.len() && ts[j] < window_end_ts {
                    j += 1;
                }
                let count = j - i;

                if count >= self.min_burst_transactions {
                    let local_rate = count as f64 / self.time_window_seconds as f64;
                    let intensity = if baseline_rate > 0.0 { local_rate / baseline_rate } else { 0.0 };

                    let rates: Vec<f64> = ts
                        .windows(2)
                        .map(|w| 1000.0 / ((w[1] - w[0]).max(1) as f64))
                        .collect();
                    let (mean_rate, std_rate) = utils::mean_std(&rates);
                    let z_score = if std_rate > 0.0 { (local_rate - mean_rate) / std_rate } else { 0.0 };

                    if intensity >= self.min_burst_intensity && z_score >= self.z_score_threshold {
                        let burst_end = ts[j - 1];
                        let mut hourly_distribution = [0i64; 24];
                        for &t in &ts[i..j] {
                            let hour = ((t / 3_600_000) % 24) as usize;
                            hourly_distribution[hour] += 1;
                        }
                        let peak_hours: Vec<i64> = hourly_distribution
                            .iter()
                            .enumerate()
                            .filter(|&(_, &c)| c > 0)
                            .map(|(h, _)| h as i64)
                            .collect();

                        let volume: Decimal = graph
                            .node_index(address)
                            .map(|id| graph.total_volume_usd(id))
                            .unwrap_or_default();

                        patterns.push(Pattern::new_with_identity(
                            "temporal_burst",
                            network,
                            window_days,
                            processing_date,
                            vec![address.clone()],
                            &[address.clone(), window_start.to_string()],
                            vec!["burst_address".to_string()],
                            now_ms,
                            count as i64,
                            volume,
                            "burst_detector",
                            PatternPayload::TemporalBurst {
                                burst_address: address.clone(),
                                burst_start_timestamp: window_start,
                                burst_end_timestamp: burst_end,
                                burst_duration_seconds: (burst_end - window_start) / 1000,
                                burst_transaction_count: count as i64,
                                burst_volume_usd: volume,
                                normal_tx_rate: baseline_rate,
                                burst_tx_rate: local_rate,
                                burst_intensity: intensity,
                                z_score,
                                hourly_distribution,
                                peak_hours,
                            },
                        ));
                    }
                }

                i = if j > i { j } else { i + 1 };
            }
        }

        Ok(patterns)
    }
}

impl std::fmt::Debug for BurstDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BurstDetector").finish()
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
            "time_window_seconds": 60.0,
            "min_burst_intensity": 1.5,
            "min_burst_transactions": 3.0,
            "z_score_threshold": 0.5,
        });
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn empty_timestamp_map_yields_no_patterns() {
        let flows = vec![flow("a", "b", 1)];
        let graph = Graph::build(&flows).unwrap();
        let detector = BurstDetector::new(&section(), "ethereum").unwrap();
        let patterns = detector.detect(&graph, &HashMap::new(), "ethereum", 1, "2026-01-01", 0).unwrap();
        assert!(patterns.is_empty());
    }

    #[test]
    fn dense_burst_is_detected() {
        let flows = vec![flow("a", "b", 1)];
        let graph = Graph::build(&flows).unwrap();
        let detector = BurstDetector::new(&section(), "ethereum").unwrap();

        let mut ts = HashMap::new();
        // Sparse baseline over a day, then a tight burst of 10 transactions
        // inside a 30-second window.
        let mut timestamps: Vec<i64> = (0..20).map(|i| i * 3_600_000).collect();
        let burst_base = 100_000_000;
        for i in 0..10 {
            timestamps.push(burst_base + i * 2_000);
        }
        ts.insert("a".to_string(), timestamps);

        let patterns = detector.detect(&graph, &ts, "ethereum", 1, "2026-01-01", 0).unwrap();
        assert!(!patterns.is_empty());
    }

    /// Two separate bursts on the same node must survive as two distinct
    /// patterns — canonical identity is `[node, burst_start_timestamp]`, not
    /// just `[node]`, so they must not collide on `pattern_id`. A large,
    /// sparse baseline keeps the two dense burst clusters a small minority
    /// of the global inter-event rate distribution so both clear the
    /// z-score bar independently.
    #[test]
    fn two_bursts_on_one_node_produce_distinct_patterns() {
        let flows = vec![flow("a", "b", 1)];
        let graph = Graph::build(&flows).unwrap();
        let detector = BurstDetector::new(&section(), "ethereum").unwrap();

        let mut ts = HashMap::new();
        let mut timestamps: Vec<i64> = (0..200).map(|i| i * 3_600_000).collect();
        let burst_one = 800_000_000;
        for i in 0..10 {
            timestamps.push(burst_one + i * 2_000);
        }
        let burst_two = burst_one + 50_000_000;
        for i in 0..10 {
            timestamps.push(burst_two + i * 2_000);
        }
        ts.insert("a".to_string(), timestamps);

        let patterns = detector.detect(&graph, &ts, "ethereum", 1, "2026-01-01", 0).unwrap();
        assert!(patterns.len() >= 2, "expected both bursts detected, got {}", patterns.len());

        let mut ids: Vec<&str> = patterns.iter().map(|p| p.pattern_id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), patterns.len(), "distinct bursts must not collapse to one pattern_id");

        let starts: std::collections::HashSet<i64> = patterns
            .iter()
            .map(|p| match &p.payload {
                PatternPayload::TemporalBurst { burst_start_timestamp, .. } => *burst_start_timestamp,
                _ => panic!("wrong payload"),
            })
            .collect();
        assert_eq!(starts.len(), patterns.len(), "each burst must have a distinct burst_start_timestamp");
    }
}
