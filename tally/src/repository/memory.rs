//! In-process repository.
//!
//! Gauges and counters live in two maps behind a single `RwLock`: updates
//! take it exclusively, lookups share it. No lock is held across an await
//! point.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::context::Context;
use crate::error::Result;
use crate::metric::{Metric, MetricValue};
use crate::repository::Repository;

#[derive(Debug, Default)]
struct Maps {
    gauges: HashMap<String, f64>,
    counters: HashMap<String, i64>,
}

impl Maps {
    fn set_gauge(&mut self, name: &str, value: f64) {
        self.gauges.insert(name.to_string(), value);
    }

    fn add_counter(&mut self, name: &str, delta: i64) {
        let total = self.counters.entry(name.to_string()).or_insert(0);
        *total = total.wrapping_add(delta);
    }
}

/// Repository backed by in-process maps.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    maps: RwLock<Maps>,
}

impl MemoryRepository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored metrics of both kinds.
    pub fn len(&self) -> usize {
        let maps = self.maps.read();
        maps.gauges.len() + maps.counters.len()
    }

    /// Returns `true` if nothing has been stored yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn update_gauge(&self, ctx: &Context, name: &str, value: f64) -> Result<()> {
        ctx.check()?;
        MetricValue::Gauge(value).validate()?;
        self.maps.write().set_gauge(name, value);
        debug!(name, value, "gauge updated");
        Ok(())
    }

    async fn update_counter(&self, ctx: &Context, name: &str, delta: i64) -> Result<()> {
        ctx.check()?;
        self.maps.write().add_counter(name, delta);
        debug!(name, delta, "counter updated");
        Ok(())
    }

    async fn gauge(&self, ctx: &Context, name: &str) -> Result<Option<f64>> {
        ctx.check()?;
        Ok(self.maps.read().gauges.get(name).copied())
    }

    async fn counter(&self, ctx: &Context, name: &str) -> Result<Option<i64>> {
        ctx.check()?;
        Ok(self.maps.read().counters.get(name).copied())
    }

    async fn all(&self, ctx: &Context) -> Result<Vec<Metric>> {
        ctx.check()?;
        let maps = self.maps.read();
        let mut metrics = Vec::with_capacity(maps.gauges.len() + maps.counters.len());
        metrics.extend(maps.gauges.iter().map(|(name, &value)| Metric::gauge(name, value)));
        metrics.extend(maps.counters.iter().map(|(name, &delta)| Metric::counter(name, delta)));
        Ok(metrics)
    }

    async fn update_batch(&self, ctx: &Context, metrics: &[Metric]) -> Result<()> {
        ctx.check()?;
        Metric::validate_all(metrics)?;
        let mut maps = self.maps.write();
        for metric in metrics {
            match metric.value {
                MetricValue::Gauge(value) => maps.set_gauge(&metric.id, value),
                MetricValue::Counter(delta) => maps.add_counter(&metric.id, delta),
            }
        }
        debug!(count = metrics.len(), "batch applied");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ContextError, MetricError, TallyError};
    use crate::metric::MetricKind;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_gauge_round_trip() {
        let repo = MemoryRepository::new();
        let ctx = Context::background();

        repo.update_gauge(&ctx, "Alloc", 123.45).await.unwrap();
        assert_eq!(repo.gauge(&ctx, "Alloc").await.unwrap(), Some(123.45));
        assert_eq!(repo.gauge(&ctx, "Missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_counter_accumulates() {
        let repo = MemoryRepository::new();
        let ctx = Context::background();

        repo.update_counter(&ctx, "PollCount", 5).await.unwrap();
        repo.update_counter(&ctx, "PollCount", 3).await.unwrap();
        assert_eq!(repo.counter(&ctx, "PollCount").await.unwrap(), Some(8));
    }

    #[tokio::test]
    async fn test_same_name_different_kinds_are_distinct() {
        let repo = MemoryRepository::new();
        let ctx = Context::background();

        repo.update_gauge(&ctx, "X", 1.5).await.unwrap();
        repo.update_counter(&ctx, "X", 2).await.unwrap();

        assert_eq!(repo.len(), 2);
        assert_eq!(
            repo.get(&ctx, "X", MetricKind::Gauge).await.unwrap(),
            Some(MetricValue::Gauge(1.5))
        );
        assert_eq!(
            repo.get(&ctx, "X", MetricKind::Counter).await.unwrap(),
            Some(MetricValue::Counter(2))
        );
    }

    #[tokio::test]
    async fn test_all_is_snapshot() {
        let repo = MemoryRepository::new();
        let ctx = Context::background();
        repo.update_gauge(&ctx, "A", 1.0).await.unwrap();
        repo.update_counter(&ctx, "B", 2).await.unwrap();

        let mut all = repo.all(&ctx).await.unwrap();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(all, vec![Metric::gauge("A", 1.0), Metric::counter("B", 2)]);

        repo.update_counter(&ctx, "B", 2).await.unwrap();
        assert_eq!(all[1], Metric::counter("B", 2));
    }

    #[tokio::test]
    async fn test_batch() {
        let repo = MemoryRepository::new();
        let ctx = Context::background();
        repo.update_counter(&ctx, "Poll", 1).await.unwrap();

        repo.update_batch(
            &ctx,
            &[
                Metric::counter("Poll", 2),
                Metric::gauge("Alloc", 3.0),
                Metric::counter("Poll", 4),
            ],
        )
        .await
        .unwrap();

        assert_eq!(repo.counter(&ctx, "Poll").await.unwrap(), Some(7));
        assert_eq!(repo.gauge(&ctx, "Alloc").await.unwrap(), Some(3.0));
    }

    #[tokio::test]
    async fn test_non_finite_gauge_is_rejected() {
        let repo = MemoryRepository::new();
        let ctx = Context::background();
        repo.update_gauge(&ctx, "Alloc", 1.0).await.unwrap();

        let err = repo.update_gauge(&ctx, "Alloc", f64::NAN).await.unwrap_err();
        assert!(matches!(err, TallyError::Metric(MetricError::InvalidValue { .. })));
        let err = repo
            .update_batch(&ctx, &[Metric::counter("Poll", 1), Metric::gauge("Alloc", f64::NEG_INFINITY)])
            .await
            .unwrap_err();
        assert!(matches!(err, TallyError::Metric(MetricError::InvalidValue { .. })));

        assert_eq!(repo.gauge(&ctx, "Alloc").await.unwrap(), Some(1.0));
        assert_eq!(repo.counter(&ctx, "Poll").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_canceled_context_rejected() {
        let repo = MemoryRepository::new();
        let ctx = Context::background();
        ctx.cancel();

        let err = repo.update_counter(&ctx, "Poll", 1).await.unwrap_err();
        assert!(matches!(err, TallyError::Context(ContextError::Canceled)));
        assert!(repo.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_counter_updates() {
        let repo = Arc::new(MemoryRepository::new());
        let mut tasks = Vec::new();

        for worker in 0..8i64 {
            let repo = Arc::clone(&repo);
            tasks.push(tokio::spawn(async move {
                let ctx = Context::background();
                for _ in 0..100 {
                    repo.update_counter(&ctx, "Poll", worker).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let ctx = Context::background();
        let expected: i64 = (0..8).map(|w| w * 100).sum();
        assert_eq!(repo.counter(&ctx, "Poll").await.unwrap(), Some(expected));
    }
}
