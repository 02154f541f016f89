//! Cycle detector (§4.4.1): simple cycles within each SCC of size ≥ 2.

use crate::config::ConfigSection;
use crate::graph::algorithms;
use crate::graph::Graph;
use crate::patterns::types::{Pattern, PatternPayload};
use crate::{AnalyticsError, Result};
use rust_decimal::Decimal;
use std::collections::HashSet;

pub struct CycleDetector {
    min_cycle_length: usize,
    max_cycle_length: usize,
    max_cycles_per_scc: usize,
}

impl CycleDetector {
    pub fn new(section: &ConfigSection, network: &str) -> Result<Self> {
        Ok(Self {
            min_cycle_length: section.require_usize("cycle_detection", network, "min_cycle_length")?,
            max_cycle_length: section.require_usize("cycle_detection", network, "max_cycle_length")?,
            max_cycles_per_scc: section.require_usize("cycle_detection", network, "max_cycles_per_scc")?,
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
        let sccs: Vec<Vec<usize>> = algorithms::tarjan_scc(graph)
            .into_iter()
            .filter(|c| c.len() >= 2)
            .collect();

        let mut patterns = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for scc in &sccs {
            let cycles = algorithms::simple_cycles_in_scc(
                graph,
                scc,
                self.min_cycle_length,
                self.max_cycle_length,
                self.max_cycles_per_scc,
            );

            for cycle in cycles {
                let addresses: Vec<String> = cycle.iter().map(|&id| graph.address(id).to_string()).collect();
                let mut sorted = addresses.clone();
                sorted.sort();
                if !seen.insert(sorted.join(",")) {
                    continue;
                }

                let mut cycle_volume_usd = Decimal::ZERO;
                let mut tx_count = 0i64;
                for i in 0..cycle.len() {
                    let from = cycle[i];
                    let to = cycle[(i + 1) % cycle.len()];
                    if let Some(edge) = graph.edge_between(from, to) {
                        cycle_volume_usd += edge.amount_usd_sum;
                        tx_count += edge.tx_count;
                    }
                }

                let roles = vec!["participant".to_string(); addresses.len()];
                patterns.push(Pattern::new(
                    "cycle",
                    network,
                    window_days,
                    processing_date,
                    addresses.clone(),
                    roles,
                    now_ms,
                    tx_count,
                    cycle_volume_usd,
                    "cycle_detector",
                    PatternPayload::Cycle {
                        cycle_length: cycle.len() as i64,
                        cycle_volume_usd,
                        cycle_path: addresses,
                    },
                ));
            }
        }

        Ok(patterns)
    }
}

impl std::fmt::Debug for CycleDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CycleDetector").finish()
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
            "min_cycle_length": 2.0,
            "max_cycle_length": 6.0,
            "max_cycles_per_scc": 100.0,
        });
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn triangle_cycle_scenario_s1() {
        let flows = vec![flow("A", "B", 10_000), flow("B", "C", 12_000), flow("C", "A", 11_000)];
        let graph = Graph::build(&flows).unwrap();
        let detector = CycleDetector::new(&section(), "ethereum").unwrap();
        let patterns = detector.detect(&graph, "ethereum", 1, "2026-01-01", 0).unwrap();

        assert_eq!(patterns.len(), 1);
        let p = &patterns[0];
        let mut addrs = p.addresses_involved.clone();
        addrs.sort();
        assert_eq!(addrs, vec!["A".to_string(), "B".to_string(), "C".to_string()]);
        assert_eq!(p.evidence_volume_usd, Decimal::new(33_000, 0));
        match &p.payload {
            PatternPayload::Cycle { cycle_length, .. } => assert_eq!(*cycle_length, 3),
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn pure_dag_scenario_s2_has_no_cycles() {
        let flows = vec![
            flow("A", "B", 10_000),
            flow("B", "C", 12_000),
            flow("C", "D", 11_000),
            flow("A", "D", 5_000),
        ];
        let graph = Graph::build(&flows).unwrap();
        let detector = CycleDetector::new(&section(), "ethereum").unwrap();
        let patterns = detector.detect(&graph, "ethereum", 1, "2026-01-01", 0).unwrap();
        assert!(patterns.is_empty());
    }

    #[test]
    fn missing_config_key_is_fatal() {
        let json = serde_json::json!({ "min_cycle_length": 2.0 });
        let section: ConfigSection = serde_json::from_value(json).unwrap();
        assert!(matches!(
            CycleDetector::new(&section, "ethereum"),
            Err(AnalyticsError::ConfigMissing { .. })
        ));
    }
}
