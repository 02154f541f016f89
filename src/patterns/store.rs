//! Pattern store (§4.5): one specialized table per pattern type behind a
//! single logical partition, `delete_partition` first, `pattern_id`
//! deduplication within a run, unified read view.

use super::types::Pattern;
use crate::Result;
use async_trait::async_trait;
use std::collections::HashSet;

/// Write batch size (§9 Batching).
pub const DEFAULT_BATCH_SIZE: usize = 1_000;

/// Storage-backed operations the pattern store needs. Implemented by the
/// storage gateway; the specialized-table fan-out (`patterns_cycle`,
/// `patterns_layering`, ...) and the `pattern_detections` union view live
/// on the implementor's side of this boundary.
#[async_trait]
pub trait PatternRepository: Send + Sync {
    async fn delete_partition(&self, network: &str, window_days: i64, processing_date: &str) -> Result<()>;
    async fn insert_patterns(&self, patterns: &[Pattern]) -> Result<()>;
    async fn get_for_partition(
        &self,
        network: &str,
        window_days: i64,
        processing_date: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Pattern>>;
    async fn count_for_partition(&self, network: &str, window_days: i64, processing_date: &str) -> Result<i64>;
}

/// Rewrite the partition `(network, window_days, processing_date)` with
/// `patterns`: delete first, dedup by `pattern_id`, then insert in
/// batches of `batch_size`.
pub async fn rewrite_partition(
    repo: &dyn PatternRepository,
    network: &str,
    window_days: i64,
    processing_date: &str,
    patterns: Vec<Pattern>,
    batch_size: usize,
) -> Result<usize> {
    repo.delete_partition(network, window_days, processing_date).await?;

    let mut seen = HashSet::new();
    let deduped: Vec<Pattern> = patterns.into_iter().filter(|p| seen.insert(p.pattern_id.clone())).collect();
    let written = deduped.len();

    for batch in deduped.chunks(batch_size.max(1)) {
        repo.insert_patterns(batch).await?;
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::types::PatternPayload;
    use rust_decimal::Decimal;
    use std::sync::Mutex;

    #[derive(Default)]
    struct InMemoryRepository {
        rows: Mutex<Vec<Pattern>>,
        deletes: Mutex<usize>,
    }

    #[async_trait]
    impl PatternRepository for InMemoryRepository {
        async fn delete_partition(&self, _network: &str, _window_days: i64, _processing_date: &str) -> Result<()> {
            self.rows.lock().unwrap().clear();
            *self.deletes.lock().unwrap() += 1;
            Ok(())
        }

        async fn insert_patterns(&self, patterns: &[Pattern]) -> Result<()> {
            self.rows.lock().unwrap().extend(patterns.iter().cloned());
            Ok(())
        }

        async fn get_for_partition(
            &self,
            _network: &str,
            _window_days: i64,
            _processing_date: &str,
            _limit: i64,
            _offset: i64,
        ) -> Result<Vec<Pattern>> {
            Ok(self.rows.lock().unwrap().clone())
        }

        async fn count_for_partition(&self, _network: &str, _window_days: i64, _processing_date: &str) -> Result<i64> {
            Ok(self.rows.lock().unwrap().len() as i64)
        }
    }

    fn pattern(addr: &str) -> Pattern {
        Pattern::new(
            "cycle",
            "ethereum",
            1,
            "2026-01-01",
            vec![addr.to_string()],
            vec!["participant".to_string()],
            0,
            1,
            Decimal::ZERO,
            "cycle_detector",
            PatternPayload::Cycle {
                cycle_length: 1,
                cycle_volume_usd: Decimal::ZERO,
                cycle_path: vec![addr.to_string()],
            },
        )
    }

    #[tokio::test]
    async fn rewrite_dedups_by_pattern_id() {
        let repo = InMemoryRepository::default();
        let patterns = vec![pattern("a"), pattern("a"), pattern("b")];
        let written = rewrite_partition(&repo, "ethereum", 1, "2026-01-01", patterns, 1_000).await.unwrap();
        assert_eq!(written, 2);
        assert_eq!(repo.count_for_partition("ethereum", 1, "2026-01-01").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn rewrite_deletes_partition_first() {
        let repo = InMemoryRepository::default();
        rewrite_partition(&repo, "ethereum", 1, "2026-01-01", vec![pattern("a")], 1_000).await.unwrap();
        rewrite_partition(&repo, "ethereum", 1, "2026-01-01", vec![pattern("b")], 1_000).await.unwrap();
        let rows = repo.get_for_partition("ethereum", 1, "2026-01-01", 100, 0).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].addresses_involved, vec!["b".to_string()]);
    }
}
