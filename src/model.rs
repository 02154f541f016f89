//! Shared data model: transfers, flows, and address labels.
//!
//! These types are the contract between the storage gateway and every
//! downstream component (graph builder, feature builder, detectors).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// An immutable ledger row. Unique on `(tx_id, event_index, edge_index)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    pub tx_id: String,
    pub event_index: i64,
    pub edge_index: i64,
    pub block_height: i64,
    pub block_timestamp_ms: i64,
    pub from_address: String,
    pub to_address: String,
    pub asset_symbol: String,
    pub asset_contract: Option<String>,
    pub amount: Decimal,
    pub fee: Decimal,
    pub amount_usd: Decimal,
}

/// An aggregate of transfers between a specific ordered address pair within
/// a window `[t0, t1)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub from_address: String,
    pub to_address: String,
    pub window_days: i64,
    pub processing_date: String,
    pub tx_count: i64,
    pub amount_sum: Decimal,
    pub amount_usd_sum: Decimal,
    pub first_seen_timestamp: i64,
    pub last_seen_timestamp: i64,
    pub unique_assets: i64,
    pub dominant_asset: String,
    pub hourly_pattern: [i64; 24],
    pub weekly_pattern: [i64; 7],
    pub reciprocity_ratio: f64,
    pub is_bidirectional: bool,
}

impl Flow {
    /// `min(vol_uv, vol_vu) / max(vol_uv, vol_vu)` when both directions
    /// have positive USD volume, else 0.
    pub fn reciprocity(vol_uv: Decimal, vol_vu: Decimal) -> f64 {
        if vol_uv > Decimal::ZERO && vol_vu > Decimal::ZERO {
            let (lo, hi) = if vol_uv < vol_vu {
                (vol_uv, vol_vu)
            } else {
                (vol_vu, vol_uv)
            };
            (lo / hi).to_string().parse::<f64>().unwrap_or(0.0)
        } else {
            0.0
        }
    }
}

/// Trust/fraud classification of an address, joined from the address-label
/// table. Defaults to `unverified`/`unknown`, never null.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressLabel {
    pub network: String,
    pub address: String,
    pub trust_level: String,
    pub address_type: String,
}

impl Default for AddressLabel {
    fn default() -> Self {
        Self {
            network: String::new(),
            address: String::new(),
            trust_level: "unverified".to_string(),
            address_type: "unknown".to_string(),
        }
    }
}

const TRUSTED_LEVELS: &[&str] = &["verified", "official"];
const TRUSTED_TYPES: &[&str] = &["exchange", "institutional", "staking", "validator"];
const FRAUD_TYPES: &[&str] = &["mixer", "scam", "dark_market", "sanctioned"];

impl AddressLabel {
    /// Trusted iff `trust_level ∈ {verified, official}` and
    /// `address_type ∈ {exchange, institutional, staking, validator}`.
    pub fn is_trusted(&self) -> bool {
        TRUSTED_LEVELS.contains(&self.trust_level.as_str())
            && TRUSTED_TYPES.contains(&self.address_type.as_str())
    }

    /// Fraudulent iff `address_type ∈ {mixer, scam, dark_market,
    /// sanctioned}` or `trust_level = blacklisted`.
    pub fn is_fraudulent(&self) -> bool {
        FRAUD_TYPES.contains(&self.address_type.as_str()) || self.trust_level == "blacklisted"
    }
}

/// A half-open millisecond window `[t0, t1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub t0: i64,
    pub t1: i64,
}

impl Window {
    pub fn new(t0: i64, t1: i64) -> crate::Result<Self> {
        if t1 <= t0 {
            return Err(crate::AnalyticsError::BadInput(format!(
                "malformed window: t0={t0} t1={t1}"
            )));
        }
        Ok(Self { t0, t1 })
    }

    pub fn window_days(&self) -> i64 {
        (self.t1 - self.t0) / 86_400_000
    }

    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.t0 && ts < self.t1
    }
}

/// The `(window_days, processing_date)` key every analyzer table is
/// partitioned by, plus the network the run is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    pub network: String,
    pub window_days: i64,
    pub processing_date: String,
}

/// `(window_days, processing_date, started_at, ended_at, duration_s)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputationAudit {
    pub network: String,
    pub window_days: i64,
    pub processing_date: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_s: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reciprocity_zero_when_one_side_empty() {
        assert_eq!(Flow::reciprocity(Decimal::new(100, 0), Decimal::ZERO), 0.0);
    }

    #[test]
    fn reciprocity_is_min_over_max() {
        let r = Flow::reciprocity(Decimal::new(50, 0), Decimal::new(100, 0));
        assert!((r - 0.5).abs() < 1e-9);
    }

    #[test]
    fn trust_and_fraud_classification() {
        let trusted = AddressLabel {
            trust_level: "verified".into(),
            address_type: "exchange".into(),
            ..Default::default()
        };
        assert!(trusted.is_trusted());
        assert!(!trusted.is_fraudulent());

        let fraud = AddressLabel {
            trust_level: "unverified".into(),
            address_type: "mixer".into(),
            ..Default::default()
        };
        assert!(!fraud.is_trusted());
        assert!(fraud.is_fraudulent());
    }

    #[test]
    fn window_rejects_empty_or_inverted_range() {
        assert!(Window::new(100, 100).is_err());
        assert!(Window::new(100, 50).is_err());
        assert!(Window::new(0, 86_400_000).unwrap().window_days() == 1);
    }
}
