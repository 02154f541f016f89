//! Shared helpers: time, canonical hashing, and the numeric primitives the
//! feature builder and pattern detectors both need (entropy, Gini,
//! coefficient of variation).

use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod time {
    use super::*;

    pub fn current_timestamp_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }
}

pub mod logging {
    pub fn init_logging() {
        let _ = env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .try_init();
    }
}

/// `pattern_hash := first 16 hex chars of SHA-256 of (pattern_type ":"
/// sorted(addresses).join(","))`.
pub fn canonical_pattern_hash(pattern_type: &str, addresses: &[String]) -> String {
    let mut sorted = addresses.to_vec();
    sorted.sort();
    let payload = format!("{pattern_type}:{}", sorted.join(","));
    let digest = Sha256::digest(payload.as_bytes());
    hex::encode(digest)[..16].to_string()
}

pub fn canonical_pattern_id(pattern_type: &str, addresses: &[String]) -> String {
    format!("{pattern_type}_{}", canonical_pattern_hash(pattern_type, addresses))
}

/// Shannon entropy in bits over a nonnegative count distribution.
pub fn shannon_entropy(counts: &[i64]) -> f64 {
    let total: i64 = counts.iter().sum();
    if total <= 0 {
        return 0.0;
    }
    let total = total as f64;
    -counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / total;
            p * p.log2()
        })
        .sum::<f64>()
}

/// Normalized Shannon entropy over a nonnegative distribution of floats,
/// normalized by `log2(n)` into `[0, 1]`.
pub fn normalized_entropy(values: &[f64]) -> f64 {
    let n = values.iter().filter(|&&v| v > 0.0).count();
    if n <= 1 {
        return 0.0;
    }
    let total: f64 = values.iter().sum();
    if total <= 0.0 {
        return 0.0;
    }
    let h = -values
        .iter()
        .filter(|&&v| v > 0.0)
        .map(|&v| {
            let p = v / total;
            p * p.log2()
        })
        .sum::<f64>();
    let max_h = (n as f64).log2();
    if max_h > 0.0 {
        (h / max_h).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Classic Gini coefficient over a list of nonnegative amounts. 0 for
/// empty/singleton input.
pub fn gini(amounts: &[f64]) -> f64 {
    if amounts.len() < 2 {
        return 0.0;
    }
    let mut sorted: Vec<f64> = amounts.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = sorted.len() as f64;
    let sum: f64 = sorted.iter().sum();
    if sum <= 0.0 {
        return 0.0;
    }
    let cumulative: f64 = sorted
        .iter()
        .enumerate()
        .map(|(i, &x)| (i as f64 + 1.0) * x)
        .sum();
    ((2.0 * cumulative) / (n * sum) - (n + 1.0) / n).clamp(0.0, 1.0)
}

/// Mean and population standard deviation.
pub fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

/// `std / max(mean, 1.0)`.
pub fn coefficient_of_variation(mean: f64, std: f64) -> f64 {
    std / mean.max(1.0)
}

/// Sample skewness and excess kurtosis from the four raw moments
/// `(n, Σx, Σx², Σx³, Σx⁴)` the storage gateway returns.
pub fn skewness_kurtosis(n: f64, sum1: f64, sum2: f64, sum3: f64, sum4: f64) -> (f64, f64) {
    if n < 2.0 {
        return (0.0, 0.0);
    }
    let mean = sum1 / n;
    let m2 = sum2 / n - mean.powi(2);
    if m2 <= 0.0 {
        return (0.0, 0.0);
    }
    let m3 = sum3 / n - 3.0 * mean * sum2 / n + 2.0 * mean.powi(3);
    let m4 = sum4 / n - 4.0 * mean * sum3 / n + 6.0 * mean.powi(2) * sum2 / n - 3.0 * mean.powi(4);
    let std = m2.sqrt();
    let skewness = m3 / std.powi(3);
    let kurtosis = m4 / m2.powi(2) - 3.0;
    (skewness, kurtosis)
}

/// Burstiness: `(std - mean) / (std + mean)` clipped to `[0, 1]` when
/// `n >= 2` and `mean + std > 0`, else 0.
pub fn burst_factor(n: usize, mean: f64, std: f64) -> f64 {
    if n >= 2 && (mean + std) > 0.0 {
        ((std - mean) / (std + mean)).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Binary entropy of `p` vs `1-p`, clipped to `[0, 1]`.
pub fn binary_entropy(p: f64) -> f64 {
    let p = p.clamp(1e-9, 1.0 - 1e-9);
    (-p * p.log2() - (1.0 - p) * (1.0 - p).log2()).clamp(0.0, 1.0)
}
