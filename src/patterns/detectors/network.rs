//! Network detector (§4.4.3): two sub-detectors, both emitting
//! `pattern_type = smurfing_network` — anomalously large SCCs, and
//! smurfing-shaped communities (many small transactions through hub
//! nodes).

use crate::config::ConfigSection;
use crate::graph::algorithms;
use crate::graph::Graph;
use crate::patterns::trust::TrustContext;
use crate::patterns::types::{Pattern, PatternPayload};
use crate::utils;
use crate::Result;
use rust_decimal::Decimal;

pub struct NetworkDetector {
    min_scc_size: usize,
    z_score_normalization: f64,
    anomaly_threshold: f64,

    min_community_size: usize,
    max_community_size: usize,
    small_transaction_threshold: f64,
    small_transaction_ratio_threshold: f64,
    density_threshold: f64,
    hub_fraction: f64,
}

impl NetworkDetector {
    pub fn new(scc_section: &ConfigSection, network_section: &ConfigSection, network: &str) -> Result<Self> {
        Ok(Self {
            min_scc_size: scc_section.require_usize("scc_analysis", network, "min_scc_size")?,
            z_score_normalization: scc_section.require_f64("scc_analysis", network, "z_score_normalization")?,
            anomaly_threshold: scc_section.require_f64("scc_analysis", network, "anomaly_threshold")?,

            min_community_size: network_section.require_usize("network_analysis", network, "min_community_size")?,
            max_community_size: network_section.require_usize("network_analysis", network, "max_community_size")?,
            small_transaction_threshold: network_section.require_f64(
                "network_analysis",
                network,
                "small_transaction_threshold",
            )?,
            small_transaction_ratio_threshold: network_section.require_f64(
                "network_analysis",
                network,
                "small_transaction_ratio_threshold",
            )?,
            density_threshold: network_section.require_f64("network_analysis", network, "density_threshold")?,
            hub_fraction: network_section.get_f64_or(network, "hub_fraction", 0.2),
        })
    }

    pub fn detect(
        &self,
        graph: &Graph,
        trust: &TrustContext,
        network: &str,
        window_days: i64,
        processing_date: &str,
        now_ms: i64,
    ) -> Result<Vec<Pattern>> {
        let mut patterns = self.detect_anomalous_sccs(graph, trust, network, window_days, processing_date, now_ms)?;
        patterns.extend(self.detect_smurfing_communities(
            graph,
            trust,
            network,
            window_days,
            processing_date,
            now_ms,
        )?);
        Ok(patterns)
    }

    fn detect_anomalous_sccs(
        &self,
        graph: &Graph,
        trust: &TrustContext,
        network: &str,
        window_days: i64,
        processing_date: &str,
        now_ms: i64,
    ) -> Result<Vec<Pattern>> {
        let sccs: Vec<Vec<usize>> = algorithms::tarjan_scc(graph)
            .into_iter()
            .filter(|c| c.len() >= self.min_scc_size)
            .collect();

        if sccs.is_empty() {
            return Ok(Vec::new());
        }

        let sizes: Vec<f64> = sccs.iter().map(|s| s.len() as f64).collect();
        let (mean, std) = utils::mean_std(&sizes);

        let mut patterns = Vec::new();
        for scc in &sccs {
            let z = if std > 0.0 { (scc.len() as f64 - mean) / std } else { 0.0 };
            let normalized = (z / self.z_score_normalization).clamp(0.0, 1.0);

            let addresses: Vec<String> = scc.iter().map(|&id| graph.address(id).to_string()).collect();
            let adjusted = trust.adjust_severity(normalized, &addresses);
            if adjusted < self.anomaly_threshold {
                continue;
            }

            let mut sorted_addresses = addresses.clone();
            sorted_addresses.sort();
            let roles = vec!["participant".to_string(); addresses.len()];
            let volume = scc_edge_volume(graph, scc);

            patterns.push(Pattern::new(
                "smurfing_network",
                network,
                window_days,
                processing_date,
                addresses,
                roles,
                now_ms,
                scc.len() as i64,
                volume,
                "network_detector",
                PatternPayload::SmurfingNetwork {
                    sub_tag: "anomalous_scc".to_string(),
                    network_members: sorted_addresses.clone(),
                    network_size: sorted_addresses.len() as i64,
                    network_density: 1.0,
                    hub_addresses: Vec::new(),
                },
            ));
        }

        Ok(patterns)
    }

    fn detect_smurfing_communities(
        &self,
        graph: &Graph,
        trust: &TrustContext,
        network: &str,
        window_days: i64,
        processing_date: &str,
        now_ms: i64,
    ) -> Result<Vec<Pattern>> {
        let communities = algorithms::greedy_modularity_communities(graph)?;

        let mut patterns = Vec::new();
        for community in &communities {
            if community.len() < self.min_community_size || community.len() > self.max_community_size {
                continue;
            }

            let member_set: std::collections::HashSet<usize> = community.iter().copied().collect();
            let mut total_edges = 0usize;
            let mut small_edges = 0usize;
            for &node in community {
                for e in graph.out_edges(node) {
                    if member_set.contains(&e.to) {
                        total_edges += 1;
                        if e.weight < self.small_transaction_threshold {
                            small_edges += 1;
                        }
                    }
                }
            }
            if total_edges == 0 {
                continue;
            }
            let small_ratio = small_edges as f64 / total_edges as f64;
            let possible_edges = community.len() * (community.len() - 1);
            let density = if possible_edges > 0 {
                total_edges as f64 / possible_edges as f64
            } else {
                0.0
            };

            if small_ratio <= self.small_transaction_ratio_threshold || density <= self.density_threshold {
                continue;
            }

            let mut by_degree: Vec<usize> = community.clone();
            by_degree.sort_by_key(|&n| std::cmp::Reverse(graph.undirected_neighbors(n).len()));
            let hub_count = ((by_degree.len() as f64) * self.hub_fraction).ceil().max(1.0) as usize;
            let hubs: std::collections::HashSet<usize> = by_degree.iter().take(hub_count).copied().collect();

            let addresses: Vec<String> = community.iter().map(|&id| graph.address(id).to_string()).collect();
            let mut sorted_addresses = addresses.clone();
            sorted_addresses.sort();

            let roles: Vec<String> = community
                .iter()
                .map(|n| if hubs.contains(n) { "hub".to_string() } else { "participant".to_string() })
                .collect();
            let hub_addresses: Vec<String> = hubs.iter().map(|&id| graph.address(id).to_string()).collect();

            let severity = density.clamp(0.0, 1.0);
            let adjusted = trust.adjust_severity(severity, &addresses);
            let _ = adjusted; // density/small-ratio gates already decided emission; severity isn't separately thresholded here.

            let volume = scc_edge_volume(graph, community);

            patterns.push(Pattern::new(
                "smurfing_network",
                network,
                window_days,
                processing_date,
                addresses,
                roles,
                now_ms,
                total_edges as i64,
                volume,
                "network_detector",
                PatternPayload::SmurfingNetwork {
                    sub_tag: "smurfing_community".to_string(),
                    network_members: sorted_addresses.clone(),
                    network_size: sorted_addresses.len() as i64,
                    network_density: density,
                    hub_addresses,
                },
            ));
        }

        Ok(patterns)
    }
}

fn scc_edge_volume(graph: &Graph, members: &[usize]) -> Decimal {
    let member_set: std::collections::HashSet<usize> = members.iter().copied().collect();
    let mut total = Decimal::ZERO;
    for &node in members {
        for e in graph.out_edges(node) {
            if member_set.contains(&e.to) {
                total += e.amount_usd_sum;
            }
        }
    }
    total
}

impl std::fmt::Debug for NetworkDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkDetector").finish()
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

    fn scc_section() -> ConfigSection {
        let json = serde_json::json!({
            "min_scc_size": 2.0,
            "z_score_normalization": 2.0,
            "anomaly_threshold": 0.0,
        });
        serde_json::from_value(json).unwrap()
    }

    fn network_section() -> ConfigSection {
        let json = serde_json::json!({
            "min_community_size": 2.0,
            "max_community_size": 50.0,
            "small_transaction_threshold": 100_000.0,
            "small_transaction_ratio_threshold": 0.0,
            "density_threshold": 0.0,
        });
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn pure_dag_has_no_scc_patterns() {
        let flows = vec![
            flow("A", "B", 10_000),
            flow("B", "C", 12_000),
            flow("C", "D", 11_000),
            flow("A", "D", 5_000),
        ];
        let graph = Graph::build(&flows).unwrap();
        let detector = NetworkDetector::new(&scc_section(), &network_section(), "ethereum").unwrap();
        let trust = TrustContext::new(vec![], 1.0, 1.0);
        let patterns = detector.detect(&graph, &trust, "ethereum", 1, "2026-01-01", 0).unwrap();
        assert!(patterns.iter().all(|p| {
            !matches!(&p.payload, PatternPayload::SmurfingNetwork { sub_tag, .. } if sub_tag == "anomalous_scc")
        }));
    }

    #[test]
    fn triangle_scc_is_flagged_anomalous() {
        let flows = vec![flow("A", "B", 10_000), flow("B", "C", 12_000), flow("C", "A", 11_000)];
        let graph = Graph::build(&flows).unwrap();
        let detector = NetworkDetector::new(&scc_section(), &network_section(), "ethereum").unwrap();
        let trust = TrustContext::new(vec![], 1.0, 1.0);
        let patterns = detector.detect(&graph, &trust, "ethereum", 1, "2026-01-01", 0).unwrap();
        assert!(patterns
            .iter()
            .any(|p| matches!(&p.payload, PatternPayload::SmurfingNetwork { sub_tag, .. } if sub_tag == "anomalous_scc")));
    }
}
