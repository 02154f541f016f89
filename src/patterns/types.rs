//! Pattern record shape (§3, §4.4): a common header plus one of the seven
//! detectors' type-specific payloads.

use crate::utils;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub pattern_id: String,
    pub pattern_hash: String,
    pub pattern_type: String,
    pub network: String,
    pub window_days: i64,
    pub processing_date: String,
    pub addresses_involved: Vec<String>,
    pub address_roles: Vec<String>,
    pub detection_timestamp: i64,
    pub evidence_transaction_count: i64,
    pub evidence_volume_usd: Decimal,
    pub detection_method: String,
    pub payload: PatternPayload,
}

impl Pattern {
    /// Build the common header, deriving `pattern_hash`/`pattern_id` from
    /// `pattern_type` and the *recorded* (unsorted-as-presented)
    /// `addresses_involved` — the hash input is always `sorted(addresses)`
    /// regardless of the order the caller passes them in.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pattern_type: &str,
        network: &str,
        window_days: i64,
        processing_date: &str,
        addresses_involved: Vec<String>,
        address_roles: Vec<String>,
        detection_timestamp: i64,
        evidence_transaction_count: i64,
        evidence_volume_usd: Decimal,
        detection_method: &str,
        payload: PatternPayload,
    ) -> Self {
        Self::new_with_identity(
            pattern_type,
            network,
            window_days,
            processing_date,
            addresses_involved.clone(),
            &addresses_involved,
            address_roles,
            detection_timestamp,
            evidence_transaction_count,
            evidence_volume_usd,
            detection_method,
            payload,
        )
    }

    /// Build the common header from an explicit canonical-identity vector
    /// rather than `addresses_involved` itself. The cycle/layering/network/
    /// proximity/motif detectors' identity is exactly `sorted(addresses)`, so
    /// they use `Pattern::new` above; the burst and threshold detectors key
    /// on `addresses_involved` plus extra components (`burst_start_timestamp`,
    /// `threshold_type`/`threshold_value`) that are not addresses, so they
    /// pass that fuller vector here directly.
    #[allow(clippy::too_many_arguments)]
    pub fn new_with_identity(
        pattern_type: &str,
        network: &str,
        window_days: i64,
        processing_date: &str,
        addresses_involved: Vec<String>,
        identity: &[String],
        address_roles: Vec<String>,
        detection_timestamp: i64,
        evidence_transaction_count: i64,
        evidence_volume_usd: Decimal,
        detection_method: &str,
        payload: PatternPayload,
    ) -> Self {
        let pattern_hash = utils::canonical_pattern_hash(pattern_type, identity);
        let pattern_id = format!("{pattern_type}_{pattern_hash}");
        Self {
            pattern_id,
            pattern_hash,
            pattern_type: pattern_type.to_string(),
            network: network.to_string(),
            window_days,
            processing_date: processing_date.to_string(),
            addresses_involved,
            address_roles,
            detection_timestamp,
            evidence_transaction_count,
            evidence_volume_usd,
            detection_method: detection_method.to_string(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum PatternPayload {
    Cycle {
        cycle_length: i64,
        cycle_volume_usd: Decimal,
        cycle_path: Vec<String>,
    },
    Layering {
        path_depth: i64,
        source_address: String,
        destination_address: String,
    },
    SmurfingNetwork {
        sub_tag: String,
        network_members: Vec<String>,
        network_size: i64,
        network_density: f64,
        hub_addresses: Vec<String>,
    },
    ProximityRisk {
        distance_to_risk: i64,
        risk_propagation_score: f64,
    },
    Motif {
        motif_type: String,
        motif_center_address: String,
        motif_participant_count: i64,
    },
    TemporalBurst {
        burst_address: String,
        burst_start_timestamp: i64,
        burst_end_timestamp: i64,
        burst_duration_seconds: i64,
        burst_transaction_count: i64,
        burst_volume_usd: Decimal,
        normal_tx_rate: f64,
        burst_tx_rate: f64,
        burst_intensity: f64,
        z_score: f64,
        hourly_distribution: [i64; 24],
        peak_hours: Vec<i64>,
    },
    ThresholdEvasion {
        primary_address: String,
        threshold_type: String,
        threshold_value: Decimal,
        transactions_near_threshold: i64,
        clustering_score: f64,
        size_consistency: f64,
        avoidance_score: f64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_id_uses_sorted_addresses_regardless_of_input_order() {
        let p1 = Pattern::new(
            "cycle",
            "ethereum",
            1,
            "2026-01-01",
            vec!["b".into(), "a".into(), "c".into()],
            vec!["participant".into(), "participant".into(), "participant".into()],
            0,
            3,
            Decimal::new(33_000, 0),
            "cycle_detector",
            PatternPayload::Cycle {
                cycle_length: 3,
                cycle_volume_usd: Decimal::new(33_000, 0),
                cycle_path: vec!["a".into(), "b".into(), "c".into()],
            },
        );
        let p2 = Pattern::new(
            "cycle",
            "ethereum",
            1,
            "2026-01-01",
            vec!["c".into(), "a".into(), "b".into()],
            vec!["participant".into(), "participant".into(), "participant".into()],
            0,
            3,
            Decimal::new(33_000, 0),
            "cycle_detector",
            PatternPayload::Cycle {
                cycle_length: 3,
                cycle_volume_usd: Decimal::new(33_000, 0),
                cycle_path: vec!["b".into(), "c".into(), "a".into()],
            },
        );
        assert_eq!(p1.pattern_id, p2.pattern_id);
    }
}
