//! Graph builder (§4.2): an arena-of-edges directed weighted multigraph
//! built from the flow rows of a single window. One flow yields exactly one
//! edge; a repeated ordered pair is a hard failure (`DuplicateFlow`). Node
//! indices are stable for the lifetime of the graph and used throughout the
//! pattern detectors and feature builder as cheap, cache-friendly handles.

pub mod algorithms;

use crate::model::Flow;
use crate::{AnalyticsError, Result};
use rust_decimal::Decimal;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct EdgeData {
    pub from: usize,
    pub to: usize,
    pub amount_usd_sum: Decimal,
    pub tx_count: i64,
    pub weight: f64,
}

#[derive(Debug, Clone)]
struct NodeData {
    address: String,
    total_volume_usd: Decimal,
}

/// Directed weighted multigraph over addresses, built once per window and
/// shared read-only across the feature builder's chunked workers and all
/// seven pattern detectors.
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: Vec<NodeData>,
    address_index: HashMap<String, usize>,
    edges: Vec<EdgeData>,
    out_adj: Vec<Vec<usize>>,
    in_adj: Vec<Vec<usize>>,
}

impl Graph {
    /// Build from the flow rows of a window. Rejects an empty flow set
    /// (`EmptyWindow`) and a repeated ordered pair (`DuplicateFlow`).
    pub fn build(flows: &[Flow]) -> Result<Self> {
        if flows.is_empty() {
            return Err(AnalyticsError::EmptyWindow);
        }

        let mut address_index: HashMap<String, usize> = HashMap::new();
        let mut nodes = Vec::new();
        let mut seen_pairs: HashMap<(usize, usize), ()> = HashMap::new();
        let mut edges = Vec::with_capacity(flows.len());

        let mut index_of = |addr: &str, nodes: &mut Vec<NodeData>, idx: &mut HashMap<String, usize>| -> usize {
            if let Some(&i) = idx.get(addr) {
                i
            } else {
                let i = nodes.len();
                nodes.push(NodeData {
                    address: addr.to_string(),
                    total_volume_usd: Decimal::ZERO,
                });
                idx.insert(addr.to_string(), i);
                i
            }
        };

        for flow in flows {
            let from = index_of(&flow.from_address, &mut nodes, &mut address_index);
            let to = index_of(&flow.to_address, &mut nodes, &mut address_index);

            if seen_pairs.insert((from, to), ()).is_some() {
                return Err(AnalyticsError::DuplicateFlow {
                    from: flow.from_address.clone(),
                    to: flow.to_address.clone(),
                });
            }

            let weight: f64 = flow.amount_usd_sum.to_string().parse().unwrap_or(0.0);
            edges.push(EdgeData {
                from,
                to,
                amount_usd_sum: flow.amount_usd_sum,
                tx_count: flow.tx_count,
                weight,
            });
        }

        let n = nodes.len();
        let mut out_adj = vec![Vec::new(); n];
        let mut in_adj = vec![Vec::new(); n];
        for (i, e) in edges.iter().enumerate() {
            out_adj[e.from].push(i);
            in_adj[e.to].push(i);
            nodes[e.from].total_volume_usd += e.amount_usd_sum;
            nodes[e.to].total_volume_usd += e.amount_usd_sum;
        }

        Ok(Self {
            nodes,
            address_index,
            edges,
            out_adj,
            in_adj,
        })
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn address(&self, id: usize) -> &str {
        &self.nodes[id].address
    }

    pub fn node_index(&self, address: &str) -> Option<usize> {
        self.address_index.get(address).copied()
    }

    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.address.as_str())
    }

    pub fn total_volume_usd(&self, id: usize) -> Decimal {
        self.nodes[id].total_volume_usd
    }

    pub fn edge(&self, idx: usize) -> &EdgeData {
        &self.edges[idx]
    }

    pub fn edges(&self) -> impl Iterator<Item = &EdgeData> {
        self.edges.iter()
    }

    pub fn out_edges(&self, id: usize) -> impl Iterator<Item = &EdgeData> {
        self.out_adj[id].iter().map(move |&i| &self.edges[i])
    }

    pub fn in_edges(&self, id: usize) -> impl Iterator<Item = &EdgeData> {
        self.in_adj[id].iter().map(move |&i| &self.edges[i])
    }

    pub fn out_degree(&self, id: usize) -> usize {
        self.out_adj[id].len()
    }

    pub fn in_degree(&self, id: usize) -> usize {
        self.in_adj[id].len()
    }

    pub fn successors(&self, id: usize) -> impl Iterator<Item = usize> + '_ {
        self.out_adj[id].iter().map(move |&i| self.edges[i].to)
    }

    pub fn predecessors(&self, id: usize) -> impl Iterator<Item = usize> + '_ {
        self.in_adj[id].iter().map(move |&i| self.edges[i].from)
    }

    /// Edge between `from` and `to`, if one exists.
    pub fn edge_between(&self, from: usize, to: usize) -> Option<&EdgeData> {
        self.out_adj[from].iter().map(|&i| &self.edges[i]).find(|e| e.to == to)
    }

    /// Undirected neighbor list: for each neighbor, the combined weight of
    /// the edge(s) between the pair in either direction.
    pub fn undirected_neighbors(&self, id: usize) -> HashMap<usize, f64> {
        let mut out = HashMap::new();
        for e in self.out_edges(id) {
            *out.entry(e.to).or_insert(0.0) += e.weight;
        }
        for e in self.in_edges(id) {
            *out.entry(e.from).or_insert(0.0) += e.weight;
        }
        out
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

    #[test]
    fn empty_flows_is_fatal() {
        assert!(matches!(Graph::build(&[]), Err(AnalyticsError::EmptyWindow)));
    }

    #[test]
    fn duplicate_ordered_pair_is_fatal() {
        let flows = vec![flow("a", "b", 10), flow("a", "b", 20)];
        assert!(matches!(Graph::build(&flows), Err(AnalyticsError::DuplicateFlow { .. })));
    }

    #[test]
    fn node_total_volume_is_sum_of_incident_edges() {
        let flows = vec![flow("a", "b", 10_000), flow("b", "c", 5_000)];
        let g = Graph::build(&flows).unwrap();
        let b = g.node_index("b").unwrap();
        assert_eq!(g.total_volume_usd(b), Decimal::new(15_000, 0));
    }
}
