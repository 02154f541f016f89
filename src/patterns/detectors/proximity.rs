//! Proximity detector (§4.4.4): shortest-path distance from fraudulent (or
//! heuristically risky) addresses to every reachable counterpart.

use crate::config::ConfigSection;
use crate::graph::Graph;
use crate::patterns::trust::TrustContext;
use crate::patterns::types::{Pattern, PatternPayload};
use crate::Result;
use std::collections::VecDeque;

pub struct ProximityDetector {
    max_distance: usize,
    distance_decay_factor: f64,
    high_volume_threshold: f64,
    high_degree_threshold: usize,
}

impl ProximityDetector {
    pub fn new(proximity_section: &ConfigSection, risk_section: &ConfigSection, network: &str) -> Result<Self> {
        Ok(Self {
            max_distance: proximity_section.require_usize("proximity_analysis", network, "max_distance")?,
            distance_decay_factor: proximity_section.require_f64(
                "proximity_analysis",
                network,
                "distance_decay_factor",
            )?,
            high_volume_threshold: risk_section.require_f64("risk_identification", network, "high_volume_threshold")?,
            high_degree_threshold: risk_section.require_usize(
                "risk_identification",
                network,
                "high_degree_threshold",
            )?,
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
        let n = graph.node_count();
        let mut risk_sources: Vec<usize> = (0..n)
            .filter(|&id| trust.is_fraudulent(graph.address(id)))
            .collect();

        if risk_sources.is_empty() {
            risk_sources = (0..n)
                .filter(|&id| {
                    let volume: f64 = graph.total_volume_usd(id).to_string().parse().unwrap_or(0.0);
                    let degree = graph.in_degree(id) + graph.out_degree(id);
                    volume > self.high_volume_threshold && degree > self.high_degree_threshold
                })
                .collect();
        }

        let mut patterns = Vec::new();
        for &risk in &risk_sources {
            let dist = bfs_bounded(graph, risk, self.max_distance);
            for (suspect, d) in dist {
                if d == 0 {
                    continue;
                }
                let risk_address = graph.address(risk).to_string();
                let suspect_address = graph.address(suspect).to_string();
                let score = self.distance_decay_factor / (d as f64 + 1.0);

                patterns.push(Pattern::new(
                    "proximity_risk",
                    network,
                    window_days,
                    processing_date,
                    vec![risk_address.clone(), suspect_address.clone()],
                    vec!["risk_source".to_string(), "suspect".to_string()],
                    now_ms,
                    0,
                    graph.edge_between(risk, suspect).map(|e| e.amount_usd_sum).unwrap_or_default(),
                    "proximity_detector",
                    PatternPayload::ProximityRisk {
                        distance_to_risk: d as i64,
                        risk_propagation_score: score,
                    },
                ));
            }
        }

        Ok(patterns)
    }
}

fn bfs_bounded(graph: &Graph, source: usize, max_distance: usize) -> Vec<(usize, usize)> {
    let n = graph.node_count();
    let mut dist = vec![None; n];
    dist[source] = Some(0usize);
    let mut q = VecDeque::new();
    q.push_back(source);
    let mut result = Vec::new();

    while let Some(u) = q.pop_front() {
        let du = dist[u].unwrap();
        if du >= max_distance {
            continue;
        }
        for (v, _) in graph.undirected_neighbors(u) {
            if dist[v].is_none() {
                dist[v] = Some(du + 1);
                result.push((v, du + 1));
                q.push_back(v);
            }
        }
    }

    result
}

impl std::fmt::Debug for ProximityDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProximityDetector").finish()
    }
}
