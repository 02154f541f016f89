//! Layering detector (§4.4.2): simple paths between high-volume nodes whose
//! edge amounts show low variation, suggestive of fund layering.

use crate::config::ConfigSection;
use crate::graph::algorithms;
use crate::graph::Graph;
use crate::patterns::types::{Pattern, PatternPayload};
use crate::utils;
use crate::Result;
use rust_decimal::Decimal;
use std::collections::HashSet;

pub struct LayeringDetector {
    high_volume_percentile: f64,
    max_source_nodes: usize,
    max_target_nodes: usize,
    max_path_length: usize,
    max_paths_to_check: usize,
    min_path_length: usize,
    layering_cv_threshold: f64,
    layering_min_volume: f64,
}

impl LayeringDetector {
    pub fn new(section: &ConfigSection, network: &str) -> Result<Self> {
        Ok(Self {
            high_volume_percentile: section.require_f64("path_analysis", network, "high_volume_percentile")?,
            max_source_nodes: section.require_usize("path_analysis", network, "max_source_nodes")?,
            max_target_nodes: section.require_usize("path_analysis", network, "max_target_nodes")?,
            max_path_length: section.require_usize("path_analysis", network, "max_path_length")?,
            max_paths_to_check: section.require_usize("path_analysis", network, "max_paths_to_check")?,
            min_path_length: section.require_usize("path_analysis", network, "min_path_length")?,
            layering_cv_threshold: section.require_f64("path_analysis", network, "layering_cv_threshold")?,
            layering_min_volume: section.require_f64("path_analysis", network, "layering_min_volume")?,
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

        let volumes: Vec<f64> = (0..n)
            .map(|id| graph.total_volume_usd(id).to_string().parse().unwrap_or(0.0))
            .collect();
        let mut sorted_volumes = volumes.clone();
        sorted_volumes.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let threshold = percentile(&sorted_volumes, self.high_volume_percentile);

        let mut high_volume: Vec<usize> = (0..n).filter(|&id| volumes[id] >= threshold).collect();
        high_volume.sort_by(|&a, &b| volumes[b].partial_cmp(&volumes[a]).unwrap());

        let sources: Vec<usize> = high_volume.iter().take(self.max_source_nodes).copied().collect();
        let targets: Vec<usize> = high_volume.iter().take(self.max_target_nodes).copied().collect();

        let paths = algorithms::simple_paths(graph, &sources, &targets, self.max_path_length, self.max_paths_to_check);

        let mut patterns = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for path in paths {
            if path.len() < self.min_path_length {
                continue;
            }
            let mut edge_amounts = Vec::with_capacity(path.len() - 1);
            let mut total_volume = Decimal::ZERO;
            let mut tx_count = 0i64;
            let mut complete = true;
            for w in path.windows(2) {
                match graph.edge_between(w[0], w[1]) {
                    Some(edge) => {
                        edge_amounts.push(edge.weight);
                        total_volume += edge.amount_usd_sum;
                        tx_count += edge.tx_count;
                    }
                    None => {
                        complete = false;
                        break;
                    }
                }
            }
            if !complete {
                continue;
            }

            let (mean, std) = utils::mean_std(&edge_amounts);
            let cv = if mean > 0.0 { std / mean } else { f64::INFINITY };
            let total_volume_f64: f64 = total_volume.to_string().parse().unwrap_or(0.0);

            if cv >= self.layering_cv_threshold || total_volume_f64 < self.layering_min_volume {
                continue;
            }

            let addresses: Vec<String> = path.iter().map(|&id| graph.address(id).to_string()).collect();
            let mut sorted_addresses = addresses.clone();
            sorted_addresses.sort();
            if !seen.insert(sorted_addresses.join(",")) {
                continue;
            }

            let mut roles = vec!["intermediary".to_string(); addresses.len()];
            if let Some(first) = roles.first_mut() {
                *first = "source".to_string();
            }
            if let Some(last) = roles.last_mut() {
                *last = "destination".to_string();
            }

            patterns.push(Pattern::new(
                "layering_path",
                network,
                window_days,
                processing_date,
                addresses.clone(),
                roles,
                now_ms,
                (path.len() - 1) as i64,
                total_volume,
                "layering_detector",
                PatternPayload::Layering {
                    path_depth: path.len() as i64,
                    source_address: addresses.first().cloned().unwrap_or_default(),
                    destination_address: addresses.last().cloned().unwrap_or_default(),
                },
            ));
        }

        Ok(patterns)
    }
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
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

impl std::fmt::Debug for LayeringDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayeringDetector").finish()
    }
}
