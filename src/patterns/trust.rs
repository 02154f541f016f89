//! Trust/fraud classification and severity adjustment shared by the
//! network and proximity detectors (§4.4 preamble). Grounded in the
//! original source's `base_detector.py` trust-adjustment helpers.

use crate::model::AddressLabel;
use std::collections::HashMap;

/// Read-only, run-scoped address-label cache. Populated once per run.
pub struct TrustContext {
    labels: HashMap<String, AddressLabel>,
    trust_reduction_factor: f64,
    fraud_increase_factor: f64,
}

impl TrustContext {
    pub fn new(labels: Vec<AddressLabel>, trust_reduction_factor: f64, fraud_increase_factor: f64) -> Self {
        let labels = labels.into_iter().map(|l| (l.address.clone(), l)).collect();
        Self {
            labels,
            trust_reduction_factor,
            fraud_increase_factor,
        }
    }

    fn label(&self, address: &str) -> AddressLabel {
        self.labels.get(address).cloned().unwrap_or_default()
    }

    pub fn is_trusted(&self, address: &str) -> bool {
        self.label(address).is_trusted()
    }

    pub fn is_fraudulent(&self, address: &str) -> bool {
        self.label(address).is_fraudulent()
    }

    pub fn fraudulent_addresses<'a>(&self, candidates: impl Iterator<Item = &'a String>) -> Vec<String> {
        candidates.filter(|a| self.is_fraudulent(a)).cloned().collect()
    }

    /// `adjusted := severity * (1 - trust_reduction_factor * trusted_fraction)
    /// * (1 + fraud_increase_factor * fraud_fraction)`, clipped to `[0, 1]`,
    /// where the fractions are taken over `participants`.
    pub fn adjust_severity(&self, severity: f64, participants: &[String]) -> f64 {
        if participants.is_empty() {
            return severity.clamp(0.0, 1.0);
        }
        let n = participants.len() as f64;
        let trusted_fraction = participants.iter().filter(|a| self.is_trusted(a)).count() as f64 / n;
        let fraud_fraction = participants.iter().filter(|a| self.is_fraudulent(a)).count() as f64 / n;
        let adjusted = severity
            * (1.0 - self.trust_reduction_factor * trusted_fraction)
            * (1.0 + self.fraud_increase_factor * fraud_fraction);
        adjusted.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(address: &str, trust_level: &str, address_type: &str) -> AddressLabel {
        AddressLabel {
            network: "ethereum".into(),
            address: address.into(),
            trust_level: trust_level.into(),
            address_type: address_type.into(),
        }
    }

    #[test]
    fn trusted_participants_reduce_severity() {
        let ctx = TrustContext::new(vec![label("a", "verified", "exchange")], 1.0, 1.0);
        let adjusted = ctx.adjust_severity(0.8, &["a".to_string(), "b".to_string()]);
        assert!(adjusted < 0.8);
    }

    #[test]
    fn fraudulent_participants_amplify_severity() {
        let ctx = TrustContext::new(vec![label("x", "unverified", "mixer")], 1.0, 1.0);
        let adjusted = ctx.adjust_severity(0.5, &["x".to_string(), "y".to_string()]);
        assert!(adjusted > 0.5);
    }

    #[test]
    fn unknown_addresses_default_to_neutral() {
        let ctx = TrustContext::new(vec![], 1.0, 1.0);
        let adjusted = ctx.adjust_severity(0.6, &["z".to_string()]);
        assert!((adjusted - 0.6).abs() < 1e-9);
    }

    #[test]
    fn factors_scale_the_adjustment() {
        let ctx = TrustContext::new(vec![label("a", "verified", "exchange")], 0.5, 1.0);
        let adjusted = ctx.adjust_severity(0.8, &["a".to_string(), "b".to_string()]);
        // trusted_fraction = 0.5, trust_reduction_factor = 0.5 -> *(1 - 0.25)
        assert!((adjusted - 0.8 * 0.75).abs() < 1e-9);
    }
}
