//! Scheduler trigger - starts due scheduled campaigns and resumes policy pauses

use super::{device_health, SweepError};
use crate::campaign::DispatchInvoker;
use crate::clock::Clock;
use crate::metrics::DispatchMetrics;
use crate::stores::Stores;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};
use zapcast_common::types::CampaignId;
use zapcast_common::Result;
use zapcast_storage::models::{Campaign, CampaignStatus};

/// Result of one trigger sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Scheduled campaigns moved to sending
    pub started: Vec<CampaignId>,
    /// Sending campaigns whose policy pause expired
    pub resumed: Vec<CampaignId>,
    /// Campaigns failed for lack of a usable device
    pub failed: Vec<CampaignId>,
    pub errors: Vec<SweepError>,
}

enum TriggerAction {
    Invoked,
    Failed,
    Skipped,
}

/// Periodic trigger
pub struct SchedulerTrigger {
    stores: Stores,
    invoker: Arc<dyn DispatchInvoker>,
    clock: Arc<dyn Clock>,
    metrics: Arc<DispatchMetrics>,
}

impl SchedulerTrigger {
    pub fn new(
        stores: Stores,
        invoker: Arc<dyn DispatchInvoker>,
        clock: Arc<dyn Clock>,
        metrics: Arc<DispatchMetrics>,
    ) -> Self {
        Self {
            stores,
            invoker,
            clock,
            metrics,
        }
    }

    /// Run one sweep over due scheduled campaigns and expired pauses
    pub async fn sweep(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        let due = self.stores.campaigns.list_due_scheduled(now).await?;
        for campaign in &due {
            let action = self.start(campaign).await;
            Self::record(&mut report, campaign.id, action, |r| &mut r.started);
        }

        let retries = self.stores.campaigns.list_due_retries(now).await?;
        for campaign in &retries {
            let action = self.resume(campaign).await;
            Self::record(&mut report, campaign.id, action, |r| &mut r.resumed);
        }

        if !report.started.is_empty() || !report.resumed.is_empty() {
            info!(
                started = report.started.len(),
                resumed = report.resumed.len(),
                failed = report.failed.len(),
                "Trigger sweep invoked campaigns"
            );
        }

        self.metrics.record_sweep("trigger", report.errors.len());
        Ok(report)
    }

    fn record(
        report: &mut SweepReport,
        campaign_id: CampaignId,
        action: Result<TriggerAction>,
        invoked: fn(&mut SweepReport) -> &mut Vec<CampaignId>,
    ) {
        match action {
            Ok(TriggerAction::Invoked) => invoked(report).push(campaign_id),
            Ok(TriggerAction::Failed) => report.failed.push(campaign_id),
            Ok(TriggerAction::Skipped) => {}
            Err(e) => {
                error!("Error triggering campaign {}: {}", campaign_id, e);
                report.errors.push(SweepError {
                    campaign_id,
                    error: e.to_string(),
                });
            }
        }
    }

    async fn start(&self, campaign: &Campaign) -> Result<TriggerAction> {
        let now = self.clock.now();

        if let Some(action) = self.fail_if_unhealthy(campaign, CampaignStatus::Scheduled).await? {
            return Ok(action);
        }

        let applied = self
            .stores
            .campaigns
            .transition(
                campaign.id,
                CampaignStatus::Scheduled,
                CampaignStatus::Sending,
                now,
            )
            .await?;
        if !applied {
            return Ok(TriggerAction::Skipped);
        }
        self.metrics.record_transition(CampaignStatus::Sending);

        self.invoker.invoke(campaign.id).await?;
        info!(campaign_id = %campaign.id, "Scheduled campaign started");
        Ok(TriggerAction::Invoked)
    }

    async fn resume(&self, campaign: &Campaign) -> Result<TriggerAction> {
        let Some(retry_at) = campaign.retry_at else {
            return Ok(TriggerAction::Skipped);
        };

        if let Some(action) = self.fail_if_unhealthy(campaign, CampaignStatus::Sending).await? {
            return Ok(action);
        }

        // Only the sweep that clears the exact pause it listed gets to invoke
        let cleared = self
            .stores
            .campaigns
            .clear_retry_at(campaign.id, retry_at, self.clock.now())
            .await?;
        if !cleared {
            return Ok(TriggerAction::Skipped);
        }

        self.invoker.invoke(campaign.id).await?;
        info!(campaign_id = %campaign.id, "Paused campaign resumed");
        Ok(TriggerAction::Invoked)
    }

    async fn fail_if_unhealthy(
        &self,
        campaign: &Campaign,
        from: CampaignStatus,
    ) -> Result<Option<TriggerAction>> {
        let health = device_health(self.stores.instances.as_ref(), campaign).await?;
        let Some(reason) = health.failure_reason() else {
            return Ok(None);
        };

        let applied = self
            .stores
            .campaigns
            .fail(campaign.id, from, reason, self.clock.now())
            .await?;
        if !applied {
            return Ok(Some(TriggerAction::Skipped));
        }

        self.metrics.record_transition(CampaignStatus::Failed);
        warn!(campaign_id = %campaign.id, reason = %reason, "Campaign failed before dispatch");
        Ok(Some(TriggerAction::Failed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sweep::{ALL_DISCONNECTED_REASON, NO_INSTANCES_REASON};
    use crate::testing::Fixture;
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use zapcast_storage::CampaignStore;

    async fn scheduled(fx: &Fixture, n: usize, offset: Duration) -> Campaign {
        let campaign = fx.draft_campaign(n).await;
        fx.store
            .schedule(campaign.id, fx.clock.now() + offset, fx.clock.now())
            .await
            .unwrap();
        fx.campaign(campaign.id).await
    }

    #[tokio::test]
    async fn test_starts_due_scheduled_campaign() {
        let fx = Fixture::new().await;
        let due = scheduled(&fx, 3, Duration::minutes(-1)).await;
        let later = scheduled(&fx, 3, Duration::hours(1)).await;

        let report = fx.trigger().sweep().await.unwrap();

        assert_eq!(report.started, vec![due.id]);
        assert_eq!(fx.invoker.invoked(), vec![due.id]);

        let started = fx.campaign(due.id).await;
        assert_eq!(started.status, "sending");
        assert_eq!(started.started_at, Some(fx.clock.now()));
        assert_eq!(fx.campaign(later.id).await.status, "scheduled");
    }

    #[tokio::test]
    async fn test_scheduled_without_devices_fails() {
        let fx = Fixture::new().await;
        let campaign = fx.draft_campaign(3).await;
        fx.store
            .update_campaign(campaign.id, |c| c.instance_ids.clear())
            .await
            .unwrap();
        fx.store
            .schedule(campaign.id, fx.clock.now(), fx.clock.now())
            .await
            .unwrap();

        let report = fx.trigger().sweep().await.unwrap();

        assert_eq!(report.failed, vec![campaign.id]);
        assert!(fx.invoker.invoked().is_empty());
        let stored = fx.campaign(campaign.id).await;
        assert_eq!(stored.status, "failed");
        assert_eq!(stored.failure_reason.as_deref(), Some(NO_INSTANCES_REASON));
    }

    #[tokio::test]
    async fn test_resumes_expired_pause_once() {
        let fx = Fixture::new().await;
        let campaign = fx.sending_campaign(3, |_| {}).await;
        let retry_at = fx.clock.now() - Duration::seconds(5);
        fx.store
            .update_campaign(campaign.id, |c| c.retry_at = Some(retry_at))
            .await
            .unwrap();
        let trigger = fx.trigger();

        let first = trigger.sweep().await.unwrap();
        let second = trigger.sweep().await.unwrap();

        assert_eq!(first.resumed, vec![campaign.id]);
        assert!(second.resumed.is_empty());
        assert_eq!(fx.invoker.invoked(), vec![campaign.id]);
        assert_eq!(fx.campaign(campaign.id).await.retry_at, None);
    }

    #[tokio::test]
    async fn test_future_pause_left_alone() {
        let fx = Fixture::new().await;
        let campaign = fx.sending_campaign(3, |_| {}).await;
        let retry_at = fx.clock.now() + Duration::hours(2);
        fx.store
            .update_campaign(campaign.id, |c| c.retry_at = Some(retry_at))
            .await
            .unwrap();

        let report = fx.trigger().sweep().await.unwrap();

        assert_eq!(report, SweepReport::default());
        assert_eq!(fx.campaign(campaign.id).await.retry_at, Some(retry_at));
    }

    #[tokio::test]
    async fn test_paused_campaign_with_offline_devices_fails() {
        let fx = Fixture::new().await;
        let campaign = fx.sending_campaign(3, |_| {}).await;
        let retry_at = fx.clock.now() - Duration::seconds(5);
        fx.store
            .update_campaign(campaign.id, |c| c.retry_at = Some(retry_at))
            .await
            .unwrap();
        fx.disconnect_all().await;

        let report = fx.trigger().sweep().await.unwrap();

        assert_eq!(report.failed, vec![campaign.id]);
        let stored = fx.campaign(campaign.id).await;
        assert_eq!(stored.status, "failed");
        assert_eq!(stored.failure_reason.as_deref(), Some(ALL_DISCONNECTED_REASON));
    }

    #[tokio::test]
    async fn test_invoke_error_is_isolated() {
        let fx = Fixture::new().await;
        let broken = scheduled(&fx, 2, Duration::minutes(-2)).await;
        let healthy = scheduled(&fx, 2, Duration::minutes(-1)).await;
        fx.invoker.fail_for(broken.id);

        let report = fx.trigger().sweep().await.unwrap();

        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].campaign_id, broken.id);
        assert_eq!(report.started, vec![healthy.id]);
    }
}
