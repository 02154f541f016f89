//! Structural pattern detectors (§4.4): seven independent algorithms over
//! the same immutable graph, each returning deduplicated pattern records.

pub mod detectors;
pub mod store;
pub mod trust;
pub mod types;

pub use trust::TrustContext;
pub use types::{Pattern, PatternPayload};

use crate::config::AnalyticsConfig;
use crate::graph::Graph;
use crate::model::AddressLabel;
use crate::utils;
use crate::Result;
use detectors::{
    burst::BurstDetector, cycle::CycleDetector, layering::LayeringDetector, motif::MotifDetector,
    network::NetworkDetector, proximity::ProximityDetector, threshold::ThresholdDetector,
};
use std::collections::HashMap;

/// All seven detectors, constructed once per run from the validated
/// config and run concurrently against the same read-only graph (§5).
pub struct DetectorSuite {
    cycle: CycleDetector,
    layering: LayeringDetector,
    network: NetworkDetector,
    proximity: ProximityDetector,
    motif: MotifDetector,
    burst: BurstDetector,
    threshold: ThresholdDetector,
    trust_reduction_factor: f64,
    fraud_increase_factor: f64,
}

impl DetectorSuite {
    pub fn new(config: &AnalyticsConfig, network: &str) -> Result<Self> {
        let severity_section = config.section("severity_adjustments")?;
        Ok(Self {
            cycle: CycleDetector::new(config.section("cycle_detection")?, network)?,
            layering: LayeringDetector::new(config.section("path_analysis")?, network)?,
            network: NetworkDetector::new(
                config.section("scc_analysis")?,
                config.section("network_analysis")?,
                network,
            )?,
            proximity: ProximityDetector::new(
                config.section("proximity_analysis")?,
                config.section("risk_identification")?,
                network,
            )?,
            motif: MotifDetector::new(config.section("motif_detection")?, network)?,
            burst: BurstDetector::new(config.section("burst_detection")?, network)?,
            threshold: ThresholdDetector::new(config.section("threshold_detection")?, network)?,
            trust_reduction_factor: severity_section.require_f64(
                "severity_adjustments",
                network,
                "trust_reduction_factor",
            )?,
            fraud_increase_factor: severity_section.require_f64(
                "severity_adjustments",
                network,
                "fraud_increase_factor",
            )?,
        })
    }

    /// Run all seven detectors concurrently and return their combined,
    /// pattern_id-deduplicated output.
    pub async fn detect_all(
        &self,
        graph: &Graph,
        labels: Vec<AddressLabel>,
        timestamps_by_address: &HashMap<String, Vec<i64>>,
        network: &str,
        window_days: i64,
        processing_date: &str,
    ) -> Result<Vec<Pattern>> {
        let trust = TrustContext::new(labels, self.trust_reduction_factor, self.fraud_increase_factor);
        let now_ms = utils::time::current_timestamp_ms();

        let (cycle_r, layering_r, network_r, proximity_r, motif_r, burst_r, threshold_r) = tokio::join!(
            async { self.cycle.detect(graph, network, window_days, processing_date, now_ms) },
            async { self.layering.detect(graph, network, window_days, processing_date, now_ms) },
            async { self.network.detect(graph, &trust, network, window_days, processing_date, now_ms) },
            async { self.proximity.detect(graph, &trust, network, window_days, processing_date, now_ms) },
            async { self.motif.detect(graph, network, window_days, processing_date, now_ms) },
            async {
                self.burst
                    .detect(graph, timestamps_by_address, network, window_days, processing_date, now_ms)
            },
            async { self.threshold.detect(graph, network, window_days, processing_date, now_ms) },
        );

        let mut all = Vec::new();
        all.extend(cycle_r?);
        all.extend(layering_r?);
        all.extend(network_r?);
        all.extend(proximity_r?);
        all.extend(motif_r?);
        all.extend(burst_r?);
        all.extend(threshold_r?);

        let mut seen = std::collections::HashSet::new();
        all.retain(|p| seen.insert(p.pattern_id.clone()));

        Ok(all)
    }
}
