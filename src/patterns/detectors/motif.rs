//! Motif detector (§4.4.5): fan-in/fan-out hubs whose degree clears the
//! configured percentile while the opposite-direction degree stays low.

use crate::config::ConfigSection;
use crate::graph::Graph;
use crate::patterns::types::{Pattern, PatternPayload};
use crate::Result;
use rust_decimal::Decimal;

pub struct MotifDetector {
    degree_percentile_threshold: f64,
    fanin_max_out_degree: usize,
    fanout_max_in_degree: usize,
}

impl MotifDetector {
    pub fn new(section: &ConfigSection, network: &str) -> Result<Self> {
        Ok(Self {
            degree_percentile_threshold: section.require_f64(
                "motif_detection",
                network,
                "degree_percentile_threshold",
            )?,
            fanin_max_out_degree: section.require_usize("motif_detection", network, "fanin_max_out_degree")?,
            fanout_max_in_degree: section.require_usize("motif_detection", network, "fanout_max_in_degree")?,
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
        if n == 0 {
            return Ok(Vec::new());
        }

        let in_degrees: Vec<f64> = (0..n).map(|id| graph.in_degree(id) as f64).collect();
        let out_degrees: Vec<f64> = (0..n).map(|id| graph.out_degree(id) as f64).collect();
        let threshold_in = percentile_of(&in_degrees, self.degree_percentile_threshold);
        let threshold_out = percentile_of(&out_degrees, self.degree_percentile_threshold);

        let mut patterns = Vec::new();

        for id in 0..n {
            let in_degree = graph.in_degree(id);
            let out_degree = graph.out_degree(id);

            if in_degree as f64 >= threshold_in && out_degree <= self.fanin_max_out_degree {
                let participants: Vec<usize> = graph.predecessors(id).collect();
                let mut addresses = vec![graph.address(id).to_string()];
                addresses.extend(participants.iter().map(|&p| graph.address(p).to_string()));
                let mut roles = vec!["center".to_string()];
                roles.extend(std::iter::repeat("source".to_string()).take(participants.len()));
                let volume: Decimal = graph.in_edges(id).map(|e| e.amount_usd_sum).sum();
                let tx_count: i64 = graph.in_edges(id).map(|e| e.tx_count).sum();

                patterns.push(Pattern::new(
                    "motif_fanin",
                    network,
                    window_days,
                    processing_date,
                    addresses,
                    roles,
                    now_ms,
                    tx_count,
                    volume,
                    "motif_detector",
                    PatternPayload::Motif {
                        motif_type: "fanin".to_string(),
                        motif_center_address: graph.address(id).to_string(),
                        motif_participant_count: (in_degree + out_degree) as i64,
                    },
                ));
            }

            if out_degree as f64 >= threshold_out && in_degree <= self.fanout_max_in_degree {
                let participants: Vec<usize> = graph.successors(id).collect();
                let mut addresses = vec![graph.address(id).to_string()];
                addresses.extend(participants.iter().map(|&p| graph.address(p).to_string()));
                let mut roles = vec!["center".to_string()];
                roles.extend(std::iter::repeat("destination".to_string()).take(participants.len()));
                let volume: Decimal = graph.out_edges(id).map(|e| e.amount_usd_sum).sum();
                let tx_count: i64 = graph.out_edges(id).map(|e| e.tx_count).sum();

                patterns.push(Pattern::new(
                    "motif_fanout",
                    network,
                    window_days,
                    processing_date,
                    addresses,
                    roles,
                    now_ms,
                    tx_count,
                    volume,
                    "motif_detector",
                    PatternPayload::Motif {
                        motif_type: "fanout".to_string(),
                        motif_center_address: graph.address(id).to_string(),
                        motif_participant_count: (in_degree + out_degree) as i64,
                    },
                ));
            }
        }

        Ok(patterns)
    }
}

fn percentile_of(sorted_source: &[f64], p: f64) -> f64 {
    let mut sorted = sorted_source.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = (p / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = rank - lo as f64;
        sorted[lo] * (1.0 - frac) + sorted[hi] * frac
    }
}

impl std::fmt::Debug for MotifDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MotifDetector").finish()
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
            "degree_percentile_threshold": 50.0,
            "fanin_max_out_degree": 1.0,
            "fanout_max_in_degree": 1.0,
        });
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn fanin_motif_scenario_s4() {
        let mut flows = vec![];
        for s in ["S1", "S2", "S3", "S4", "S5"] {
            flows.push(flow(s, "C", 10_000));
        }
        flows.push(flow("C", "O", 5_000));
        let graph = Graph::build(&flows).unwrap();
        let detector = MotifDetector::new(&section(), "ethereum").unwrap();
        let patterns = detector.detect(&graph, "ethereum", 1, "2026-01-01", 0).unwrap();

        let fanin: Vec<_> = patterns
            .iter()
            .filter(|p| matches!(&p.payload, PatternPayload::Motif { motif_type, .. } if motif_type == "fanin"))
            .collect();
        assert_eq!(fanin.len(), 1);
        match &fanin[0].payload {
            PatternPayload::Motif { motif_center_address, motif_participant_count, .. } => {
                assert_eq!(motif_center_address, "C");
                assert_eq!(*motif_participant_count, 6);
            }
            _ => unreachable!(),
        }
        assert_eq!(fanin[0].evidence_volume_usd, Decimal::new(50_000, 0));
    }
}
