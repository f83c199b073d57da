//! Dispatch loop - advances one campaign's queue
//!
//! Each invocation is time-boxed and re-entrant. All coordination with other
//! invocations and sweeps goes through conditional updates on the stored
//! rows: a message is only sent after winning its `queued -> sending` claim,
//! so resuming never double-sends.

use super::policy::{DeferReason, SendWindow, SendingPolicy};
use super::pool::{DevicePool, Pick};
use crate::clock::Clock;
use crate::metrics::DispatchMetrics;
use crate::stores::Stores;
use crate::transport::{OutboundMessage, SendOutcome, Transport};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use zapcast_common::config::DispatchConfig;
use zapcast_common::types::{CampaignId, Timestamp};
use zapcast_common::Result;
use zapcast_storage::models::{Campaign, CampaignStatus};

/// Why an invocation returned
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Queue drained; campaign is `completed`
    Completed,
    /// Sending policy paused the campaign until `retry_at`
    Deferred {
        retry_at: Timestamp,
        reason: DeferReason,
    },
    /// Campaign is no longer `sending` (cancelled, completed or failed elsewhere)
    NotSending { status: String },
    /// Time or message budget used up; continue at `resume_at`
    BudgetExhausted { resume_at: Timestamp },
    /// No configured device is connected right now
    DevicesUnavailable,
    /// Nothing queued but orphaned `sending` rows remain for the stall detector
    AwaitingReclaim,
    /// Campaign was failed by this invocation
    Failed { reason: String },
    NotFound,
}

/// Result of one invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub campaign_id: CampaignId,
    pub sent: u32,
    pub failed: u32,
    /// Attempts left in `sending` after a transient transport error
    pub transient: u32,
    #[serde(flatten)]
    pub outcome: RunOutcome,
}

impl RunSummary {
    fn new(campaign_id: CampaignId) -> Self {
        Self {
            campaign_id,
            sent: 0,
            failed: 0,
            transient: 0,
            outcome: RunOutcome::NotFound,
        }
    }

    pub fn attempted(&self) -> u32 {
        self.sent + self.failed + self.transient
    }

    /// Policy pause (`retry_at` set)
    pub fn paused(&self) -> bool {
        matches!(self.outcome, RunOutcome::Deferred { .. })
    }

    pub fn completed(&self) -> bool {
        matches!(self.outcome, RunOutcome::Completed)
    }
}

/// Dispatch engine
pub struct DispatchEngine {
    stores: Stores,
    transport: Arc<dyn Transport>,
    pool: DevicePool,
    clock: Arc<dyn Clock>,
    metrics: Arc<DispatchMetrics>,
    max_runtime: chrono::Duration,
    max_messages_per_run: u32,
}

impl DispatchEngine {
    pub fn new(
        stores: Stores,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        metrics: Arc<DispatchMetrics>,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            stores,
            transport,
            pool: DevicePool::new(&config.warmup_gaps_secs),
            clock,
            metrics,
            max_runtime: chrono::Duration::seconds(config.max_runtime_secs as i64),
            max_messages_per_run: config.max_messages_per_run,
        }
    }

    /// Drain as much of the campaign's queue as this invocation's budget allows
    pub async fn run_campaign(&self, campaign_id: CampaignId) -> Result<RunSummary> {
        let deadline = self.clock.now() + self.max_runtime;
        let mut summary = RunSummary::new(campaign_id);

        let outcome = self.drive(campaign_id, deadline, &mut summary).await?;
        summary.outcome = outcome;

        match &summary.outcome {
            RunOutcome::Completed | RunOutcome::Failed { .. } | RunOutcome::NotSending { .. } => {
                self.pool.forget(campaign_id).await;
            }
            _ => {}
        }

        info!(
            campaign_id = %campaign_id,
            sent = summary.sent,
            failed = summary.failed,
            transient = summary.transient,
            outcome = ?summary.outcome,
            "Dispatch invocation finished"
        );

        Ok(summary)
    }

    async fn drive(
        &self,
        id: CampaignId,
        deadline: Timestamp,
        summary: &mut RunSummary,
    ) -> Result<RunOutcome> {
        loop {
            // Re-read every iteration so cancellation is seen within one send
            let Some(campaign) = self.stores.campaigns.get(id).await? else {
                return Ok(RunOutcome::NotFound);
            };
            if campaign.status_enum() != Some(CampaignStatus::Sending) {
                debug!(campaign_id = %id, status = %campaign.status, "Campaign not sending, stopping");
                return Ok(RunOutcome::NotSending {
                    status: campaign.status,
                });
            }

            let now = self.clock.now();
            if now >= deadline || summary.attempted() >= self.max_messages_per_run {
                let resume_at = campaign.next_send_at.map_or(now, |at| at.max(now));
                return Ok(RunOutcome::BudgetExhausted { resume_at });
            }

            let policy = match SendingPolicy::for_campaign(&campaign) {
                Ok(policy) => policy,
                Err(e) => {
                    return self
                        .fail(&campaign, &format!("invalid sending policy: {}", e))
                        .await
                }
            };

            let sent_today = campaign.sent_on(policy.local_date(now));
            let delay = match policy.next_send_window(now, sent_today) {
                Ok(SendWindow::Allowed { delay }) => delay,
                Ok(SendWindow::DeniedUntil { retry_at, reason }) => {
                    if self.stores.campaigns.set_retry_at(id, retry_at, now).await? {
                        info!(
                            campaign_id = %id,
                            retry_at = %retry_at,
                            reason = %reason,
                            "Campaign deferred by sending policy"
                        );
                    }
                    return Ok(RunOutcome::Deferred { retry_at, reason });
                }
                Err(e) => {
                    return self
                        .fail(&campaign, &format!("invalid sending policy: {}", e))
                        .await
                }
            };

            let Some(message) = self.stores.messages.next_queued(id).await? else {
                return self.finish(&campaign).await;
            };

            // Pacing cursor left by the previous send, possibly by another invocation
            if let Some(at) = campaign.next_send_at.filter(|at| *at > now) {
                if at > deadline {
                    return Ok(RunOutcome::BudgetExhausted { resume_at: at });
                }
                self.clock.sleep((at - now).to_std().unwrap_or_default()).await;
                continue;
            }

            let devices = self
                .stores
                .instances
                .get_many(&campaign.instance_ids)
                .await?;
            let device = match self.pool.pick(&campaign, &devices, campaign.mode(), now).await {
                Pick::Device(device) => device,
                Pick::Cooling { until } => {
                    if until > deadline {
                        return Ok(RunOutcome::BudgetExhausted { resume_at: until });
                    }
                    self.clock.sleep((until - now).to_std().unwrap_or_default()).await;
                    continue;
                }
                Pick::NoneConnected => {
                    warn!(campaign_id = %id, "No connected device, pausing invocation");
                    return Ok(RunOutcome::DevicesUnavailable);
                }
            };

            if !self.stores.messages.claim(message.id, device.id, now).await? {
                self.pool.release(device.id, now).await;
                debug!(message_id = %message.id, "Message claimed elsewhere, skipping");
                continue;
            }

            let outcome = self
                .transport
                .send(&device, &OutboundMessage::from(&message))
                .await;
            let now = self.clock.now();

            match outcome {
                SendOutcome::Delivered {
                    provider_message_id,
                } => {
                    let applied = self
                        .stores
                        .messages
                        .mark_sent(message.id, provider_message_id.as_deref(), now)
                        .await?;
                    if applied {
                        let counted = self
                            .stores
                            .campaigns
                            .record_sent(id, policy.local_date(now), now)
                            .await?;
                        if !counted {
                            warn!(campaign_id = %id, "Sent counter already at total, not incremented");
                        }
                        summary.sent += 1;
                        self.metrics.record_message("sent");
                        debug!(
                            campaign_id = %id,
                            message_id = %message.id,
                            instance_id = %device.id,
                            "Message sent"
                        );
                    }
                }
                SendOutcome::PermanentError { error } => {
                    if self.stores.messages.mark_failed(message.id, &error, now).await? {
                        self.stores.campaigns.add_failed(id, 1, now).await?;
                        summary.failed += 1;
                        self.metrics.record_message("failed");
                        warn!(
                            campaign_id = %id,
                            message_id = %message.id,
                            instance_id = %device.id,
                            "Message failed permanently: {}", error
                        );
                    }
                }
                SendOutcome::TransientError { error } => {
                    // Left in `sending`; the stall detector requeues it
                    self.stores
                        .messages
                        .record_transient_error(message.id, &error, now)
                        .await?;
                    summary.transient += 1;
                    self.metrics.record_message("transient");
                    warn!(
                        campaign_id = %id,
                        message_id = %message.id,
                        instance_id = %device.id,
                        "Transient send failure: {}", error
                    );
                }
            }

            let next_at =
                now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            self.stores
                .campaigns
                .set_next_send_at(id, next_at, now)
                .await?;
        }
    }

    /// Queue has no `queued` row left
    async fn finish(&self, campaign: &Campaign) -> Result<RunOutcome> {
        let counts = self.stores.messages.counts(campaign.id).await?;
        if counts.sending > 0 {
            debug!(
                campaign_id = %campaign.id,
                orphaned = counts.sending,
                "Queue drained with messages still in flight"
            );
            return Ok(RunOutcome::AwaitingReclaim);
        }

        let now = self.clock.now();
        let applied = self
            .stores
            .campaigns
            .transition(campaign.id, CampaignStatus::Sending, CampaignStatus::Completed, now)
            .await?;
        if applied {
            self.metrics.record_transition(CampaignStatus::Completed);
            info!(
                campaign_id = %campaign.id,
                sent = counts.sent,
                failed = counts.failed,
                "Campaign completed"
            );
            Ok(RunOutcome::Completed)
        } else {
            let status = match self.stores.campaigns.get(campaign.id).await? {
                Some(current) => current.status,
                None => return Ok(RunOutcome::NotFound),
            };
            Ok(RunOutcome::NotSending { status })
        }
    }

    async fn fail(&self, campaign: &Campaign, reason: &str) -> Result<RunOutcome> {
        let now = self.clock.now();
        if self
            .stores
            .campaigns
            .fail(campaign.id, CampaignStatus::Sending, reason, now)
            .await?
        {
            self.metrics.record_transition(CampaignStatus::Failed);
            warn!(campaign_id = %campaign.id, reason = %reason, "Campaign failed");
        }
        Ok(RunOutcome::Failed {
            reason: reason.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, Fixture};
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use zapcast_storage::{CampaignStore, MessageStore};

    #[tokio::test]
    async fn test_drains_queue_and_completes() {
        let fx = Fixture::new().await;
        let campaign = fx.sending_campaign(3, |_| {}).await;

        let summary = fx.engine().run_campaign(campaign.id).await.unwrap();

        assert_eq!(summary.sent, 3);
        assert!(summary.completed());
        let stored = fx.campaign(campaign.id).await;
        assert_eq!(stored.status, "completed");
        assert_eq!(stored.sent_count, 3);
        assert!(stored.completed_at.is_some());
        assert_eq!(fx.transport.sent_count(), 3);
    }

    #[tokio::test]
    async fn test_sends_in_insertion_order() {
        let fx = Fixture::new().await;
        let campaign = fx.sending_campaign(4, |_| {}).await;

        fx.engine().run_campaign(campaign.id).await.unwrap();

        let expected: Vec<String> = fx
            .store
            .list_by_campaign(campaign.id)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.recipient)
            .collect();
        assert_eq!(fx.transport.recipients(), expected);
    }

    #[tokio::test]
    async fn test_pacing_delay_between_sends() {
        let fx = Fixture::new().await;
        let campaign = fx
            .sending_campaign(3, |c| {
                c.message_interval_min = 30;
                c.message_interval_max = 30;
            })
            .await;
        let start = fx.clock.now();

        fx.engine().run_campaign(campaign.id).await.unwrap();

        let stored = fx.campaign(campaign.id).await;
        assert_eq!(stored.status, "completed");
        // Three sends, two pacing waits of 30s between them
        assert_eq!(fx.clock.now() - start, Duration::seconds(60));
    }

    #[tokio::test]
    async fn test_policy_deferral_sets_retry_at() {
        let fx = Fixture::new().await;
        let campaign = fx
            .sending_campaign(2, |c| {
                c.daily_limit = Some(1);
            })
            .await;

        let summary = fx.engine().run_campaign(campaign.id).await.unwrap();

        assert_eq!(summary.sent, 1);
        assert!(summary.paused());
        let stored = fx.campaign(campaign.id).await;
        assert_eq!(stored.status, "sending");
        match summary.outcome {
            RunOutcome::Deferred { retry_at, reason } => {
                assert_eq!(reason, DeferReason::DailyCapReached);
                assert_eq!(stored.retry_at, Some(retry_at));
            }
            other => panic!("expected deferral, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_stops_next_iteration() {
        let fx = Fixture::new().await;
        let campaign = fx.sending_campaign(5, |_| {}).await;
        fx.transport.cancel_after(2, fx.store.clone(), campaign.id);

        let summary = fx.engine().run_campaign(campaign.id).await.unwrap();

        assert_eq!(fx.transport.sent_count(), 2);
        assert_eq!(
            summary.outcome,
            RunOutcome::NotSending {
                status: "cancelled".to_string()
            }
        );
        let counts = fx.store.counts(campaign.id).await.unwrap();
        assert_eq!(counts.sent, 2);
        assert_eq!(counts.queued, 3);
    }

    #[tokio::test]
    async fn test_resume_is_idempotent() {
        let fx = Fixture::new().await;
        let campaign = fx.sending_campaign(3, |_| {}).await;
        let engine = fx.engine();

        engine.run_campaign(campaign.id).await.unwrap();
        let again = engine.run_campaign(campaign.id).await.unwrap();
        let third = engine.run_campaign(campaign.id).await.unwrap();

        assert_eq!(again.sent, 0);
        assert_eq!(third.sent, 0);
        assert_eq!(fx.transport.sent_count(), 3);
        let stored = fx.campaign(campaign.id).await;
        assert_eq!(stored.sent_count, 3);
        assert!(stored.sent_count <= stored.total_recipients);
    }

    #[tokio::test]
    async fn test_message_budget_then_resume_continues() {
        let fx = Fixture::with_dispatch(DispatchConfig {
            max_messages_per_run: 2,
            ..testing::dispatch_config()
        })
        .await;
        let campaign = fx.sending_campaign(5, |_| {}).await;
        let engine = fx.engine();

        let first = engine.run_campaign(campaign.id).await.unwrap();
        assert_eq!(first.sent, 2);
        assert!(matches!(first.outcome, RunOutcome::BudgetExhausted { .. }));

        engine.run_campaign(campaign.id).await.unwrap();
        let last = engine.run_campaign(campaign.id).await.unwrap();

        assert!(last.completed());
        assert_eq!(fx.transport.sent_count(), 5);
        assert_eq!(fx.campaign(campaign.id).await.sent_count, 5);
    }

    #[tokio::test]
    async fn test_time_box_persists_pacing_cursor() {
        let fx = Fixture::with_dispatch(DispatchConfig {
            max_runtime_secs: 45,
            ..testing::dispatch_config()
        })
        .await;
        let campaign = fx
            .sending_campaign(5, |c| {
                c.message_interval_min = 30;
                c.message_interval_max = 30;
            })
            .await;

        let summary = fx.engine().run_campaign(campaign.id).await.unwrap();

        // t=0 send, t=30 send, next at t=60 is past the 45s box
        assert_eq!(summary.sent, 2);
        let stored = fx.campaign(campaign.id).await;
        match summary.outcome {
            RunOutcome::BudgetExhausted { resume_at } => {
                assert_eq!(stored.next_send_at, Some(resume_at));
            }
            other => panic!("expected budget exhaustion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_permanent_failure_counts_and_continues() {
        let fx = Fixture::new().await;
        let campaign = fx.sending_campaign(3, |_| {}).await;
        fx.transport.script(vec![
            SendOutcome::PermanentError {
                error: "invalid number".to_string(),
            },
        ]);

        let summary = fx.engine().run_campaign(campaign.id).await.unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.sent, 2);
        assert!(summary.completed());
        let stored = fx.campaign(campaign.id).await;
        assert_eq!(stored.failed_count, 1);
        assert_eq!(stored.sent_count, 2);
    }

    #[tokio::test]
    async fn test_transient_failure_left_sending() {
        let fx = Fixture::new().await;
        let campaign = fx.sending_campaign(2, |_| {}).await;
        fx.transport.script(vec![SendOutcome::TransientError {
            error: "timeout".to_string(),
        }]);

        let summary = fx.engine().run_campaign(campaign.id).await.unwrap();

        assert_eq!(summary.transient, 1);
        assert_eq!(summary.sent, 1);
        assert_eq!(summary.outcome, RunOutcome::AwaitingReclaim);
        let counts = fx.store.counts(campaign.id).await.unwrap();
        assert_eq!(counts.sending, 1);
        assert_eq!(fx.campaign(campaign.id).await.status, "sending");
    }

    #[tokio::test]
    async fn test_no_connected_device_pauses_without_failing() {
        let fx = Fixture::new().await;
        let campaign = fx.sending_campaign(2, |_| {}).await;
        fx.disconnect_all().await;

        let summary = fx.engine().run_campaign(campaign.id).await.unwrap();

        assert_eq!(summary.outcome, RunOutcome::DevicesUnavailable);
        assert_eq!(fx.campaign(campaign.id).await.status, "sending");
        assert_eq!(fx.store.counts(campaign.id).await.unwrap().queued, 2);
    }

    #[tokio::test]
    async fn test_invalid_timezone_fails_campaign() {
        let fx = Fixture::new().await;
        let campaign = fx
            .sending_campaign(1, |c| c.timezone = "Nowhere/Land".to_string())
            .await;

        let summary = fx.engine().run_campaign(campaign.id).await.unwrap();

        assert!(matches!(summary.outcome, RunOutcome::Failed { .. }));
        let stored = fx.campaign(campaign.id).await;
        assert_eq!(stored.status, "failed");
        assert!(stored.failure_reason.unwrap().contains("Nowhere/Land"));
    }

    #[tokio::test]
    async fn test_warming_cooldown_waits_for_device() {
        let fx = Fixture::new().await;
        let campaign = fx
            .sending_campaign(2, |c| {
                c.sending_mode = "warming".to_string();
                c.message_interval_min = 0;
                c.message_interval_max = 0;
            })
            .await;
        let start = fx.clock.now();

        fx.engine().run_campaign(campaign.id).await.unwrap();

        // One level-5 device: the second send waits out its 8s gap
        assert_eq!(fx.transport.sent_count(), 2);
        assert_eq!(fx.clock.now() - start, Duration::seconds(8));
    }

    #[tokio::test]
    async fn test_not_sending_campaign_is_untouched() {
        let fx = Fixture::new().await;
        let campaign = fx.draft_campaign(2).await;

        let summary = fx.engine().run_campaign(campaign.id).await.unwrap();

        assert_eq!(
            summary.outcome,
            RunOutcome::NotSending {
                status: "draft".to_string()
            }
        );
        assert_eq!(fx.transport.sent_count(), 0);
        assert!(CampaignStore::get(&fx.store, campaign.id)
            .await
            .unwrap()
            .is_some());
    }
}
