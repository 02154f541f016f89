//! Feature builder (§4.3): one fixed-schema record per active address in a
//! window, combining per-address flow slices from the graph with
//! store-computed aggregates (amount moments, temporal histograms,
//! behavioral counters, inter-event timing, outlier counts) and graph-wide
//! analytics computed once per window.

use crate::graph::algorithms;
use crate::graph::Graph;
use crate::model::Flow;
use crate::utils;
use crate::{AnalyticsError, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Default address chunk size for batched aggregation queries (§4.3 step 5).
pub const DEFAULT_CHUNK_SIZE: usize = 10_000;
/// Default write batch size (§4.3 step 6, §9 Batching).
pub const DEFAULT_WRITE_BATCH_SIZE: usize = 1_000;

/// Raw amount statistics for one address's outgoing (or incoming, per the
/// query) transaction amounts: the four raw moments plus order statistics
/// the store computes directly rather than shipping every transaction
/// amount to the client.
#[derive(Debug, Clone, Default)]
pub struct AmountMoments {
    pub n: i64,
    pub sum1: f64,
    pub sum2: f64,
    pub sum3: f64,
    pub sum4: f64,
    pub min_usd: f64,
    pub max_usd: f64,
    pub median_usd: f64,
}

/// Per-address temporal histograms and activity span.
#[derive(Debug, Clone)]
pub struct TemporalStats {
    pub hourly_activity: [i64; 24],
    pub daily_activity: [i64; 7],
    pub activity_days: i64,
    pub activity_span_days: i64,
    pub weekend_tx_count: i64,
    pub night_tx_count: i64,
    pub total_tx_count: i64,
    pub is_new_address: bool,
}

impl Default for TemporalStats {
    fn default() -> Self {
        Self {
            hourly_activity: [0; 24],
            daily_activity: [0; 7],
            activity_days: 0,
            activity_span_days: 0,
            weekend_tx_count: 0,
            night_tx_count: 0,
            total_tx_count: 0,
            is_new_address: true,
        }
    }
}

/// Round-number, small-transaction, and unusual-timing counters (§4.3
/// Behavioral).
#[derive(Debug, Clone, Default)]
pub struct BehavioralCounters {
    pub round_number_count: i64,
    pub small_transaction_count: i64,
    pub unusual_timing_count: i64,
    pub total_count: i64,
}

/// Inter-event gap statistics in seconds.
#[derive(Debug, Clone, Default)]
pub struct InterEventStats {
    pub mean_gap_seconds: f64,
    pub std_gap_seconds: f64,
}

/// Counterparty-stability buckets: how many of an address's counterparties
/// recur across sub-windows, and the p99 outlier count on its amounts.
#[derive(Debug, Clone, Default)]
pub struct CounterpartyStats {
    pub stable_counterparty_count: i64,
    pub total_counterparty_count: i64,
    pub p99_outlier_count: i64,
}

/// One chunk's worth of store-computed aggregates, keyed by address.
#[derive(Debug, Clone, Default)]
pub struct ChunkAggregates {
    pub amount_moments: HashMap<String, AmountMoments>,
    pub temporal: HashMap<String, TemporalStats>,
    pub behavioral: HashMap<String, BehavioralCounters>,
    pub inter_event: HashMap<String, InterEventStats>,
    pub counterparty: HashMap<String, CounterpartyStats>,
}

/// The batched aggregation queries the feature builder needs per chunk of
/// addresses (§4.1, §4.3 step 5). Implemented by the storage gateway;
/// exposed as a trait so the builder stays independent of the concrete
/// store.
#[async_trait]
pub trait FeatureAggregateSource: Send + Sync {
    async fn aggregates_for_chunk(
        &self,
        network: &str,
        addresses: &[String],
        t0: i64,
        t1: i64,
    ) -> Result<ChunkAggregates>;
}

/// Per-address feature vector (§3): ~80 scalars plus the two fixed-length
/// temporal arrays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureVector {
    pub network: String,
    pub window_days: i64,
    pub processing_date: String,
    pub address: String,

    // Volume
    pub total_in_usd: Decimal,
    pub total_out_usd: Decimal,
    pub net_flow_usd: Decimal,
    pub total_volume_usd: Decimal,
    pub avg_tx_usd: Decimal,
    pub median_tx_usd: Decimal,
    pub max_tx_usd: Decimal,
    pub min_tx_usd: Decimal,

    // Degree
    pub degree_in: i64,
    pub degree_out: i64,
    pub degree_total: i64,
    pub unique_counterparties: i64,
    pub unique_senders_count: i64,
    pub unique_recipients_count: i64,

    // Statistical moments
    pub amount_variance: f64,
    pub volume_std: f64,
    pub volume_cv: f64,
    pub amount_skewness: f64,
    pub amount_kurtosis: f64,

    // Temporal
    pub activity_days: i64,
    pub activity_span_days: i64,
    pub avg_daily_volume_usd: Decimal,
    pub peak_hour: i64,
    pub peak_day: i64,
    pub hourly_entropy: f64,
    pub daily_entropy: f64,
    pub regularity_score: f64,
    pub burst_factor: f64,
    pub weekend_transaction_ratio: f64,
    pub night_transaction_ratio: f64,
    pub consistency_score: f64,
    pub is_new_address: bool,

    // Flow structure
    pub reciprocity_ratio: f64,
    pub flow_concentration: f64,
    pub flow_diversity: f64,
    pub counterparty_concentration: f64,
    pub concentration_ratio: f64,
    pub in_out_ratio: f64,
    pub flow_asymmetry: f64,
    pub dominant_flow_direction: String,
    pub flow_direction_entropy: f64,
    pub counterparty_overlap_ratio: f64,

    // Behavioral
    pub round_number_ratio: f64,
    pub unusual_timing_score: f64,
    pub structuring_score: f64,
    pub small_transaction_ratio: f64,

    // Graph
    pub pagerank: f64,
    pub betweenness: f64,
    pub closeness: f64,
    pub clustering_coefficient: f64,
    pub kcore: usize,
    pub community_id: i64,
    pub centrality_score: f64,
    pub degree: i64,

    // Neighborhood
    pub khop1_count: i64,
    pub khop1_volume_usd: f64,
    pub khop2_count: i64,
    pub khop2_volume_usd: f64,
    pub khop3_count: i64,
    pub khop3_volume_usd: f64,

    // Advanced
    pub flow_reciprocity_entropy: f64,
    pub counterparty_stability: f64,
    pub flow_burstiness: f64,
    pub transaction_regularity: f64,
    pub amount_predictability: f64,
}

/// Per-window graph-wide analytics, computed once and shared read-only
/// across chunks (§4.3 step 4, §5).
struct GlobalAnalytics {
    pagerank: Vec<f64>,
    betweenness: Vec<f64>,
    closeness: Vec<f64>,
    clustering: Vec<f64>,
    kcore: Vec<usize>,
    community_of: Vec<i64>,
    khop: Vec<algorithms::KHopStats>,
}

impl GlobalAnalytics {
    fn compute(graph: &Graph) -> Result<Self> {
        let pagerank = algorithms::pagerank(graph, 0.85);
        let betweenness = algorithms::betweenness(graph);
        let closeness = algorithms::closeness(graph);
        let clustering = algorithms::clustering_coefficient(graph);
        let kcore = algorithms::k_core(graph);
        let khop = algorithms::k_hop_neighborhoods(graph);

        let communities = algorithms::greedy_modularity_communities(graph)?;
        let mut community_of = vec![-1i64; graph.node_count()];
        for (cid, members) in communities.iter().enumerate() {
            for &node in members {
                community_of[node] = cid as i64;
            }
        }

        Ok(Self {
            pagerank,
            betweenness,
            closeness,
            clustering,
            kcore,
            community_of,
            khop,
        })
    }
}

/// Per-address flow slice: the in/out edges of the graph incident to the
/// address, summarized without needing another store round-trip.
struct FlowSlice {
    total_in_usd: Decimal,
    total_out_usd: Decimal,
    degree_in: i64,
    degree_out: i64,
    senders: HashSet<usize>,
    recipients: HashSet<usize>,
    out_edge_amounts: Vec<f64>,
    all_edge_amounts: Vec<f64>,
    reciprocity_ratio: f64,
    is_bidirectional: bool,
}

fn build_flow_slices(graph: &Graph) -> Vec<FlowSlice> {
    let n = graph.node_count();
    let mut slices: Vec<FlowSlice> = (0..n)
        .map(|_| FlowSlice {
            total_in_usd: Decimal::ZERO,
            total_out_usd: Decimal::ZERO,
            degree_in: 0,
            degree_out: 0,
            senders: HashSet::new(),
            recipients: HashSet::new(),
            out_edge_amounts: Vec::new(),
            all_edge_amounts: Vec::new(),
            reciprocity_ratio: 0.0,
            is_bidirectional: false,
        })
        .collect();

    for id in 0..n {
        for e in graph.out_edges(id) {
            let s = &mut slices[id];
            s.total_out_usd += e.amount_usd_sum;
            s.degree_out += 1;
            s.recipients.insert(e.to);
            let amt: f64 = e.amount_usd_sum.to_string().parse().unwrap_or(0.0);
            s.out_edge_amounts.push(amt);
            s.all_edge_amounts.push(amt);
        }
        for e in graph.in_edges(id) {
            let s = &mut slices[id];
            s.total_in_usd += e.amount_usd_sum;
            s.degree_in += 1;
            s.senders.insert(e.from);
            let amt: f64 = e.amount_usd_sum.to_string().parse().unwrap_or(0.0);
            s.all_edge_amounts.push(amt);
        }
    }

    for id in 0..n {
        let mut recip_sum = 0.0;
        let mut recip_count = 0;
        for &to in &slices[id].recipients.clone() {
            if let (Some(out_e), Some(in_e)) = (graph.edge_between(id, to), graph.edge_between(to, id)) {
                recip_sum += Flow::reciprocity(out_e.amount_usd_sum, in_e.amount_usd_sum);
                recip_count += 1;
                slices[id].is_bidirectional = true;
            }
        }
        if recip_count > 0 {
            slices[id].reciprocity_ratio = recip_sum / recip_count as f64;
        }
    }

    slices
}

/// Percentile of a sorted slice using linear interpolation (nearest-rank
/// fallback for empty input).
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

pub struct FeatureBuilder {
    chunk_size: usize,
}

impl Default for FeatureBuilder {
    fn default() -> Self {
        Self { chunk_size: DEFAULT_CHUNK_SIZE }
    }
}

impl FeatureBuilder {
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self { chunk_size: chunk_size.max(1) }
    }

    /// Build one feature vector per address present in `graph`.
    pub async fn build(
        &self,
        graph: &Graph,
        network: &str,
        window_days: i64,
        processing_date: &str,
        t0: i64,
        t1: i64,
        aggregates: &dyn FeatureAggregateSource,
    ) -> Result<Vec<FeatureVector>> {
        if graph.node_count() == 0 {
            return Err(AnalyticsError::EmptyWindow);
        }

        let mut addresses: Vec<String> = graph.addresses().map(|a| a.to_string()).collect();
        addresses.sort();

        let global = GlobalAnalytics::compute(graph)?;
        let flow_slices = build_flow_slices(graph);

        let mut results = Vec::with_capacity(addresses.len());

        for chunk in addresses.chunks(self.chunk_size) {
            let agg = aggregates.aggregates_for_chunk(network, chunk, t0, t1).await?;
            for address in chunk {
                let id = graph.node_index(address).ok_or_else(|| {
                    AnalyticsError::Other(format!("address {address} missing from graph index"))
                })?;
                let feature = self.build_one(
                    network,
                    window_days,
                    processing_date,
                    address,
                    id,
                    graph,
                    &flow_slices[id],
                    &global,
                    &agg,
                );
                results.push(feature);
            }
        }

        Ok(results)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_one(
        &self,
        network: &str,
        window_days: i64,
        processing_date: &str,
        address: &str,
        id: usize,
        graph: &Graph,
        slice: &FlowSlice,
        global: &GlobalAnalytics,
        agg: &ChunkAggregates,
    ) -> FeatureVector {
        let moments = agg.amount_moments.get(address).cloned().unwrap_or_default();
        let temporal = agg.temporal.get(address).cloned().unwrap_or_default();
        let behavioral = agg.behavioral.get(address).cloned().unwrap_or_default();
        let inter_event = agg.inter_event.get(address).cloned().unwrap_or_default();
        let counterparty = agg.counterparty.get(address).cloned().unwrap_or_default();

        let total_in_usd = slice.total_in_usd;
        let total_out_usd = slice.total_out_usd;
        let total_volume_usd = total_in_usd + total_out_usd;
        let net_flow_usd = total_in_usd - total_out_usd;

        let degree_in = slice.degree_in;
        let degree_out = slice.degree_out;
        let mut all_counterparties: HashSet<usize> = slice.senders.clone();
        all_counterparties.extend(slice.recipients.iter().copied());
        let unique_counterparties = all_counterparties.len() as i64;
        let degree_total = unique_counterparties;

        let (mean, std) = utils::mean_std(&slice.all_edge_amounts);
        let variance = std * std;
        let volume_cv = utils::coefficient_of_variation(mean, std);
        let (skewness, kurtosis) =
            utils::skewness_kurtosis(moments.n as f64, moments.sum1, moments.sum2, moments.sum3, moments.sum4);

        let hourly_entropy = utils::shannon_entropy(&temporal.hourly_activity);
        let daily_entropy = utils::shannon_entropy(&temporal.daily_activity);
        let max_hourly_entropy = (24.0f64).log2();
        let regularity_score = if max_hourly_entropy > 0.0 {
            (1.0 - hourly_entropy / max_hourly_entropy).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let burst_factor = utils::burst_factor(moments.n.max(0) as usize, mean, std);

        let weekend_ratio = if temporal.total_tx_count > 0 {
            temporal.weekend_tx_count as f64 / temporal.total_tx_count as f64
        } else {
            0.0
        };
        let night_ratio = if temporal.total_tx_count > 0 {
            temporal.night_tx_count as f64 / temporal.total_tx_count as f64
        } else {
            0.0
        };
        let consistency_score = if inter_event.mean_gap_seconds > 0.0 {
            (1.0 - (inter_event.std_gap_seconds / inter_event.mean_gap_seconds)).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let flow_concentration = utils::gini(&slice.all_edge_amounts);
        let flow_diversity = utils::normalized_entropy(&slice.all_edge_amounts);
        let counterparty_concentration = utils::gini(
            &slice
                .recipients
                .iter()
                .filter_map(|&r| graph.edge_between(id, r).map(|e| e.weight))
                .collect::<Vec<_>>(),
        );
        let max_counterparty_volume = slice
            .recipients
            .iter()
            .filter_map(|&r| graph.edge_between(id, r).map(|e| e.weight))
            .chain(slice.senders.iter().filter_map(|&s| graph.edge_between(s, id).map(|e| e.weight)))
            .fold(0.0f64, f64::max);
        let total_volume_f64: f64 = total_volume_usd.to_string().parse().unwrap_or(0.0);
        let concentration_ratio = if total_volume_f64 > 0.0 {
            max_counterparty_volume / total_volume_f64
        } else {
            0.0
        };

        let total_in_f64: f64 = total_in_usd.to_string().parse().unwrap_or(0.0);
        let total_out_f64: f64 = total_out_usd.to_string().parse().unwrap_or(0.0);
        let in_out_ratio = if total_out_f64 > 0.0 { total_in_f64 / total_out_f64 } else { 0.0 };
        let flow_asymmetry = if total_volume_f64 > 0.0 {
            ((total_in_f64 - total_out_f64).abs() / total_volume_f64).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let dominant_flow_direction = if total_in_f64 > total_out_f64 * 1.1 {
            "incoming"
        } else if total_out_f64 > total_in_f64 * 1.1 {
            "outgoing"
        } else {
            "balanced"
        }
        .to_string();
        let flow_direction_entropy = utils::normalized_entropy(&[total_in_f64, total_out_f64]);
        let counterparty_overlap_ratio = if unique_counterparties > 0 {
            let overlap = slice.senders.intersection(&slice.recipients).count();
            overlap as f64 / unique_counterparties as f64
        } else {
            0.0
        };

        let small_ratio = if behavioral.total_count > 0 {
            behavioral.small_transaction_count as f64 / behavioral.total_count as f64
        } else {
            0.0
        };
        let mut structuring_score = small_ratio;
        if small_ratio > 0.5 && behavioral.small_transaction_count >= 3 {
            structuring_score *= 1.5;
        }
        structuring_score = structuring_score.clamp(0.0, 1.0);

        let round_number_ratio = if behavioral.total_count > 0 {
            behavioral.round_number_count as f64 / behavioral.total_count as f64
        } else {
            0.0
        };
        let unusual_timing_score = if behavioral.total_count > 0 {
            behavioral.unusual_timing_count as f64 / behavioral.total_count as f64
        } else {
            0.0
        };

        let pagerank = global.pagerank.get(id).copied().unwrap_or(0.0);
        let betweenness = global.betweenness.get(id).copied().unwrap_or(0.0);
        let closeness = global.closeness.get(id).copied().unwrap_or(0.0);
        let clustering_coefficient = global.clustering.get(id).copied().unwrap_or(0.0);
        let kcore = global.kcore.get(id).copied().unwrap_or(0);
        let community_id = global.community_of.get(id).copied().unwrap_or(-1);
        let centrality_score = 0.4 * pagerank + 0.3 * betweenness + 0.3 * clustering_coefficient;

        let khop = &global.khop[id];

        let flow_reciprocity_entropy = utils::binary_entropy(slice.reciprocity_ratio);
        let counterparty_stability = if counterparty.total_counterparty_count > 0 {
            counterparty.stable_counterparty_count as f64 / counterparty.total_counterparty_count as f64
        } else {
            0.0
        };
        let flow_burstiness = burst_factor;
        let transaction_regularity = consistency_score;
        let amount_predictability = if mean > 0.0 { (1.0 - volume_cv).clamp(0.0, 1.0) } else { 0.0 };

        let mut sorted_amounts = slice.all_edge_amounts.clone();
        sorted_amounts.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let avg_tx_usd = decimal_from_f64(mean);
        let median_tx_usd = decimal_from_f64(if moments.median_usd > 0.0 {
            moments.median_usd
        } else {
            percentile(&sorted_amounts, 50.0)
        });
        let max_tx_usd = decimal_from_f64(if moments.max_usd > 0.0 {
            moments.max_usd
        } else {
            sorted_amounts.last().copied().unwrap_or(0.0)
        });
        let min_tx_usd = decimal_from_f64(if moments.min_usd > 0.0 {
            moments.min_usd
        } else {
            sorted_amounts.first().copied().unwrap_or(0.0)
        });

        let peak_hour = temporal
            .hourly_activity
            .iter()
            .enumerate()
            .max_by_key(|(_, &c)| c)
            .map(|(h, _)| h as i64)
            .unwrap_or(0);
        let peak_day = temporal
            .daily_activity
            .iter()
            .enumerate()
            .max_by_key(|(_, &c)| c)
            .map(|(d, _)| d as i64)
            .unwrap_or(0);

        let avg_daily_volume_usd = if temporal.activity_days > 0 {
            total_volume_usd / Decimal::from(temporal.activity_days)
        } else {
            Decimal::ZERO
        };

        FeatureVector {
            network: network.to_string(),
            window_days,
            processing_date: processing_date.to_string(),
            address: address.to_string(),

            total_in_usd,
            total_out_usd,
            net_flow_usd,
            total_volume_usd,
            avg_tx_usd,
            median_tx_usd,
            max_tx_usd,
            min_tx_usd,

            degree_in,
            degree_out,
            degree_total,
            unique_counterparties,
            unique_senders_count: slice.senders.len() as i64,
            unique_recipients_count: slice.recipients.len() as i64,

            amount_variance: variance,
            volume_std: std,
            volume_cv,
            amount_skewness: skewness,
            amount_kurtosis: kurtosis,

            activity_days: temporal.activity_days,
            activity_span_days: temporal.activity_span_days,
            avg_daily_volume_usd,
            peak_hour,
            peak_day,
            hourly_entropy,
            daily_entropy,
            regularity_score,
            burst_factor,
            weekend_transaction_ratio: weekend_ratio,
            night_transaction_ratio: night_ratio,
            consistency_score,
            is_new_address: temporal.is_new_address,

            reciprocity_ratio: slice.reciprocity_ratio,
            flow_concentration,
            flow_diversity,
            counterparty_concentration,
            concentration_ratio,
            in_out_ratio,
            flow_asymmetry,
            dominant_flow_direction,
            flow_direction_entropy,
            counterparty_overlap_ratio,

            round_number_ratio,
            unusual_timing_score,
            structuring_score,
            small_transaction_ratio: small_ratio,

            pagerank,
            betweenness,
            closeness,
            clustering_coefficient,
            kcore,
            community_id,
            centrality_score,
            degree: degree_total,

            khop1_count: khop.count[0],
            khop1_volume_usd: khop.volume_usd[0],
            khop2_count: khop.count[1],
            khop2_volume_usd: khop.volume_usd[1],
            khop3_count: khop.count[2],
            khop3_volume_usd: khop.volume_usd[2],

            flow_reciprocity_entropy,
            counterparty_stability,
            flow_burstiness,
            transaction_regularity,
            amount_predictability,
        }
    }
}

fn decimal_from_f64(v: f64) -> Decimal {
    Decimal::from_str_exact(&format!("{v:.8}")).unwrap_or(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

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

    struct StubAggregates;

    #[async_trait]
    impl FeatureAggregateSource for StubAggregates {
        async fn aggregates_for_chunk(
            &self,
            _network: &str,
            _addresses: &[String],
            _t0: i64,
            _t1: i64,
        ) -> Result<ChunkAggregates> {
            Ok(ChunkAggregates::default())
        }
    }

    #[tokio::test]
    async fn total_volume_equals_in_plus_out() {
        let flows = vec![flow("a", "b", 10_000), flow("b", "c", 5_000)];
        let graph = Graph::build(&flows).unwrap();
        let builder = FeatureBuilder::default();
        let features = builder
            .build(&graph, "ethereum", 1, "2026-01-01", 0, 86_400_000, &StubAggregates)
            .await
            .unwrap();

        for f in &features {
            assert_eq!(f.total_volume_usd, f.total_in_usd + f.total_out_usd);
        }
    }

    #[tokio::test]
    async fn empty_graph_is_rejected_upstream() {
        // Graph::build already rejects empty flows; feature builder never
        // sees a zero-node graph in practice, but guards defensively.
        let flows = vec![flow("a", "b", 1)];
        let graph = Graph::build(&flows).unwrap();
        assert!(graph.node_count() > 0);
        let builder = FeatureBuilder::default();
        let result = builder.build(&graph, "ethereum", 1, "2026-01-01", 0, 1, &StubAggregates).await;
        assert!(result.is_ok());
    }
}
