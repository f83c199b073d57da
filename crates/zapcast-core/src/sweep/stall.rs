//! Stall detector - finds `sending` campaigns that stopped making progress
//!
//! A stalled campaign is completed when nothing is left to send, failed when
//! it has no usable device, and otherwise has its orphaned `sending` rows
//! requeued and its dispatch loop re-invoked exactly once.

use super::{device_health, SweepError};
use crate::campaign::DispatchInvoker;
use crate::clock::Clock;
use crate::metrics::DispatchMetrics;
use crate::stores::Stores;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use zapcast_common::config::SchedulerConfig;
use zapcast_common::types::CampaignId;
use zapcast_common::Result;
use zapcast_storage::models::{Campaign, CampaignStatus};

/// Result of one stall sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StallReport {
    pub examined: usize,
    pub completed: Vec<CampaignId>,
    pub failed: Vec<CampaignId>,
    pub recovered: Vec<CampaignId>,
    /// Orphaned rows put back in the queue
    pub requeued: u64,
    /// Orphaned rows failed for hitting the reclaim limit
    pub exhausted: u64,
    pub errors: Vec<SweepError>,
}

enum StallAction {
    Completed,
    Failed,
    Recovered { requeued: u64, exhausted: u64 },
    /// Campaign changed state under us; nothing to do
    Skipped,
}

/// Stall detector
pub struct StallDetector {
    stores: Stores,
    invoker: Arc<dyn DispatchInvoker>,
    clock: Arc<dyn Clock>,
    metrics: Arc<DispatchMetrics>,
    stale_threshold: chrono::Duration,
    max_reclaim_attempts: i32,
}

impl StallDetector {
    pub fn new(
        stores: Stores,
        invoker: Arc<dyn DispatchInvoker>,
        clock: Arc<dyn Clock>,
        metrics: Arc<DispatchMetrics>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            stores,
            invoker,
            clock,
            metrics,
            stale_threshold: chrono::Duration::minutes(config.stale_threshold_minutes),
            max_reclaim_attempts: config.max_reclaim_attempts,
        }
    }

    /// Sweep all stalled campaigns once
    pub async fn detect_and_recover(&self) -> Result<StallReport> {
        let cutoff = self.clock.now() - self.stale_threshold;
        let stalled = self.stores.campaigns.list_stalled(cutoff).await?;
        let mut report = StallReport {
            examined: stalled.len(),
            ..Default::default()
        };

        if !stalled.is_empty() {
            debug!("Found {} stalled campaigns", stalled.len());
        }

        for campaign in &stalled {
            match self.recover(campaign).await {
                Ok(StallAction::Completed) => report.completed.push(campaign.id),
                Ok(StallAction::Failed) => report.failed.push(campaign.id),
                Ok(StallAction::Recovered {
                    requeued,
                    exhausted,
                }) => {
                    report.recovered.push(campaign.id);
                    report.requeued += requeued;
                    report.exhausted += exhausted;
                }
                Ok(StallAction::Skipped) => {}
                Err(e) => {
                    error!("Error recovering stalled campaign {}: {}", campaign.id, e);
                    report.errors.push(SweepError {
                        campaign_id: campaign.id,
                        error: e.to_string(),
                    });
                }
            }
        }

        self.metrics.record_sweep("stall", report.errors.len());
        Ok(report)
    }

    async fn recover(&self, campaign: &Campaign) -> Result<StallAction> {
        let id = campaign.id;
        let now = self.clock.now();
        let counts = self.stores.messages.counts(id).await?;

        if counts.is_drained() {
            return self.complete(id).await;
        }

        let health = device_health(self.stores.instances.as_ref(), campaign).await?;
        if let Some(reason) = health.failure_reason() {
            let applied = self
                .stores
                .campaigns
                .fail(id, CampaignStatus::Sending, reason, now)
                .await?;
            if !applied {
                return Ok(StallAction::Skipped);
            }
            self.metrics.record_transition(CampaignStatus::Failed);
            warn!(campaign_id = %id, reason = %reason, "Stalled campaign failed");
            return Ok(StallAction::Failed);
        }

        let reclaim = self
            .stores
            .messages
            .reclaim_orphans(id, self.max_reclaim_attempts, now)
            .await?;
        if reclaim.exhausted > 0 {
            self.stores
                .campaigns
                .add_failed(id, reclaim.exhausted as i32, now)
                .await?;
            warn!(
                campaign_id = %id,
                exhausted = reclaim.exhausted,
                "Orphaned messages hit the reclaim limit"
            );
        }

        if counts.queued == 0 && reclaim.requeued == 0 {
            return self.complete(id).await;
        }

        // Bump progress so the next sweep does not pick it up again right away
        if !self.stores.campaigns.touch(id, now).await? {
            return Ok(StallAction::Skipped);
        }

        self.invoker.invoke(id).await?;
        info!(
            campaign_id = %id,
            requeued = reclaim.requeued,
            queued = counts.queued,
            "Stalled campaign resumed"
        );

        Ok(StallAction::Recovered {
            requeued: reclaim.requeued,
            exhausted: reclaim.exhausted,
        })
    }

    async fn complete(&self, id: CampaignId) -> Result<StallAction> {
        let applied = self
            .stores
            .campaigns
            .transition(
                id,
                CampaignStatus::Sending,
                CampaignStatus::Completed,
                self.clock.now(),
            )
            .await?;
        if !applied {
            return Ok(StallAction::Skipped);
        }
        self.metrics.record_transition(CampaignStatus::Completed);
        info!(campaign_id = %id, "Stalled campaign had nothing left, completed");
        Ok(StallAction::Completed)
    }
}
