//! Cost Monitor
//!
//! Samples the hourly rate of every billable pod, independent of whether
//! SSH works, and warns when the aggregate burn goes above a threshold.
//! Advisory only: nothing here terminates a pod.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::PodEvent;
use crate::provider::{ProviderClient, ProviderError};
use crate::session::{CostSample, SessionRegistry};

/// Sample one pod's rate and record it with an accrued estimate
pub async fn sample_cost(
    provider: &ProviderClient,
    registry: &SessionRegistry,
    pod_id: &str,
) -> Result<CostSample, ProviderError> {
    let record = registry
        .get(pod_id)
        .ok_or_else(|| ProviderError::NotFound(pod_id.to_string()))?;
    let hourly_rate = provider.hourly_cost(pod_id).await?;

    let now = Utc::now();
    let hours = (now - record.created_at).num_seconds().max(0) as f64 / 3600.0;
    let sample = CostSample {
        hourly_rate,
        accrued: hourly_rate * hours,
        sampled_at: now,
    };
    if let Err(e) = registry.record_cost(pod_id, sample.clone()) {
        debug!("Cost sample for pod {} not recorded: {}", pod_id, e);
    }
    Ok(sample)
}

/// Burn summary across billable pods
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BurnSummary {
    pub hourly: f64,
    pub accrued: f64,
    /// Billable pods counted
    pub pods: usize,
}

/// Sum the last recorded samples of every billable pod
pub fn aggregate_burn(registry: &SessionRegistry) -> BurnSummary {
    registry
        .list_billable()
        .iter()
        .fold(BurnSummary::default(), |mut acc, record| {
            acc.pods += 1;
            if let Some(ref sample) = record.last_cost {
                acc.hourly += sample.hourly_rate;
                acc.accrued += sample.accrued;
            }
            acc
        })
}

/// Sample every billable pod once, then check the threshold. Returns the
/// aggregate.
pub async fn sample_all(
    provider: &ProviderClient,
    registry: &SessionRegistry,
    threshold: f64,
) -> BurnSummary {
    for record in registry.list_billable() {
        if let Err(e) = sample_cost(provider, registry, &record.id).await {
            warn!("Cost sample for pod {} failed: {}", record.id, e);
        }
    }

    let summary = aggregate_burn(registry);
    if summary.hourly > threshold {
        warn!(
            "Burning ${:.2}/hr across {} pods (threshold ${:.2}/hr)",
            summary.hourly, summary.pods, threshold
        );
        registry.events().emit(PodEvent::CostWarning {
            aggregate_hourly: summary.hourly,
            threshold,
            pods: summary.pods,
        });
    } else {
        debug!("Burn ${:.2}/hr across {} pods", summary.hourly, summary.pods);
    }
    summary
}

/// Periodic cost sampler
pub struct CostMonitor {
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl CostMonitor {
    pub fn spawn(
        provider: ProviderClient,
        registry: Arc<SessionRegistry>,
        interval: Duration,
        threshold: f64,
    ) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            info!("Cost monitor started (every {:?}, threshold ${:.2}/hr)", interval, threshold);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        sample_all(&provider, &registry, threshold).await;
                    }
                }
            }
            debug!("Cost monitor stopped");
        });

        Self {
            stop_tx: Some(stop_tx),
            task: Some(task),
        }
    }

    pub async fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::retry::BackoffPolicy;
    use crate::session::{Actor, PodRecord, PodState};
    use crate::testing::MockProvider;

    fn client(mock: Arc<MockProvider>) -> ProviderClient {
        ProviderClient::new(
            mock,
            BackoffPolicy { base_ms: 1, ceiling_ms: 2, multiplier: 2.0, jitter: 0.0, max_attempts: 2 },
        )
    }

    #[tokio::test]
    async fn test_sample_works_before_ssh() {
        let mock = Arc::new(MockProvider::new());
        mock.add_running("pod-1", "ltx2-comfyui-prod", 0.79);
        let registry = SessionRegistry::default();
        let mut record = PodRecord::new("pod-1", "prod", "ltx2-comfyui-prod");
        record.created_at = Utc::now() - chrono::Duration::hours(2);
        registry.insert(record).unwrap();
        registry.transition("pod-1", PodState::Provisioning, Actor::Deployer).unwrap();

        let sample = sample_cost(&client(mock), &registry, "pod-1").await.unwrap();
        assert_eq!(sample.hourly_rate, 0.79);
        assert!((sample.accrued - 1.58).abs() < 0.01);
        assert_eq!(registry.get("pod-1").unwrap().last_cost, Some(sample));
    }

    #[tokio::test]
    async fn test_warning_above_threshold_only() {
        let mock = Arc::new(MockProvider::new());
        mock.add_running("pod-1", "a", 0.79);
        mock.add_running("pod-2", "b", 0.89);
        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let registry = SessionRegistry::new(events);
        registry.insert(PodRecord::new("pod-1", "prod", "a")).unwrap();
        registry.insert(PodRecord::new("pod-2", "wan2gp", "b")).unwrap();
        let provider = client(mock.clone());

        let summary = sample_all(&provider, &registry, 2.0).await;
        assert_eq!(summary.pods, 2);
        assert!((summary.hourly - 1.68).abs() < 1e-9);
        assert!(rx.try_recv().is_err());

        let summary = sample_all(&provider, &registry, 1.0).await;
        assert!(summary.hourly > 1.0);
        match rx.try_recv().unwrap() {
            PodEvent::CostWarning { pods, threshold, .. } => {
                assert_eq!(pods, 2);
                assert_eq!(threshold, 1.0);
            }
            other => panic!("unexpected event {:?}", other),
        }
        // Advisory: nothing was terminated
        assert_eq!(mock.terminate_calls(), 0);
        assert_eq!(registry.state("pod-1"), Some(PodState::Requested));
    }

    #[tokio::test]
    async fn test_terminated_pods_are_not_counted() {
        let registry = SessionRegistry::default();
        registry.insert(PodRecord::new("pod-1", "prod", "a")).unwrap();
        registry.record_cost(
            "pod-1",
            CostSample { hourly_rate: 0.79, accrued: 0.1, sampled_at: Utc::now() },
        ).unwrap();
        registry.transition("pod-1", PodState::Terminating, Actor::Terminator).unwrap();
        registry.transition("pod-1", PodState::Terminated, Actor::Terminator).unwrap();

        assert_eq!(aggregate_burn(&registry), BurnSummary::default());
    }

    #[tokio::test]
    async fn test_monitor_stops() {
        let mock = Arc::new(MockProvider::new());
        let registry = Arc::new(SessionRegistry::default());
        let mut monitor = CostMonitor::spawn(client(mock), registry, Duration::from_millis(5), 1.0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        monitor.stop().await;
        monitor.stop().await;
    }
}
