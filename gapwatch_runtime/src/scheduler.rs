//! Periodic report trigger.

use std::time::Duration;

use gapwatch_core::report::ReportRun;
use gapwatch_core::Reporter;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::metrics::{MetricKind, RuntimeMetrics};

/// Runs the completeness reporter on a fixed interval.
#[derive(Clone, Debug)]
pub struct ReportScheduler {
    reporter: Reporter,
    interval: Duration,
    metrics: RuntimeMetrics,
}

impl ReportScheduler {
    /// Creates a scheduler firing every `interval`.
    pub fn new(reporter: Reporter, interval: Duration, metrics: RuntimeMetrics) -> Self {
        Self {
            reporter,
            interval,
            metrics,
        }
    }

    /// Runs one report pass immediately.
    pub async fn run_now(&self) -> Result<ReportRun> {
        let run = self.reporter.run_once().await?;
        self.metrics.add(MetricKind::ReportWritten, run.written.len() as u64);
        self.metrics.add(MetricKind::ReportFailed, run.failed.len() as u64);
        Ok(run)
    }

    /// Spawns the timer loop. The first run happens one interval from now.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.interval.max(Duration::from_millis(1));
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            tracing::info!(interval_secs = period.as_secs(), "report scheduler started");
            loop {
                tokio::select! {
                    _ = cancel.wait_cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.run_now().await {
                            tracing::error!(error = %err, "scheduled report run failed");
                        }
                    }
                }
            }
            tracing::info!("report scheduler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationTokenSource;
    use gapwatch_core::catalog::StaticCatalog;
    use gapwatch_core::ranges::parse_timestamp;
    use gapwatch_core::{Collection, CollectionId, Gapwatch, GapwatchConfig};
    use std::sync::Arc;

    async fn gapwatch(dir: &tempfile::TempDir) -> Gapwatch {
        let gapwatch = Gapwatch::open(GapwatchConfig::in_dir(dir.path()), Arc::new(StaticCatalog::new()))
            .await
            .unwrap();
        let collection = Collection {
            id: CollectionId::new("X", "1.0").unwrap(),
            extent_start: parse_timestamp("2020-01-01").unwrap(),
            extent_end: None,
        };
        gapwatch.store().register(&collection).await.unwrap();
        gapwatch
    }

    #[tokio::test]
    async fn test_run_now_counts_reports() {
        let dir = tempfile::tempdir().unwrap();
        let gapwatch = gapwatch(&dir).await;
        let metrics = RuntimeMetrics::new();
        let scheduler = ReportScheduler::new(gapwatch.reporter(), Duration::from_secs(60), metrics.clone());

        let run = scheduler.run_now().await.unwrap();
        assert_eq!(run.written.len(), 1);
        assert_eq!(metrics.count(MetricKind::ReportWritten), 1);
    }

    #[tokio::test]
    async fn test_timer_fires_until_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let gapwatch = gapwatch(&dir).await;
        let metrics = RuntimeMetrics::new();
        let source = CancellationTokenSource::new();

        let handle = ReportScheduler::new(gapwatch.reporter(), Duration::from_millis(30), metrics.clone())
            .spawn(source.token());
        tokio::time::sleep(Duration::from_millis(200)).await;
        source.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();

        assert!(metrics.count(MetricKind::ReportWritten) >= 2);
    }
}
