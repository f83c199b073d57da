//! Campaign Manager - Handles campaign lifecycle and recipient queueing

use crate::clock::Clock;
use crate::dispatch::{PolicyError, PolicySettings, SendingPolicy};
use crate::metrics::DispatchMetrics;
use crate::stores::Stores;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use zapcast_common::types::{CampaignId, TenantId, Timestamp};
use zapcast_storage::models::{
    Campaign, CampaignStats, CampaignStatus, CreateCampaign, NewCampaignMessage,
};

/// Campaign manager errors
#[derive(Error, Debug)]
pub enum CampaignError {
    #[error("Campaign not found")]
    NotFound,

    #[error("Cannot {action} a campaign in {from} status")]
    InvalidTransition { from: String, action: &'static str },

    #[error("Campaign has no instances configured")]
    NoInstances,

    #[error("Campaign has no queued recipients")]
    NoRecipients,

    #[error("Invalid sending policy: {0}")]
    InvalidPolicy(#[from] PolicyError),

    #[error(transparent)]
    Store(#[from] zapcast_common::Error),
}

impl CampaignError {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            CampaignError::NotFound => 404,
            CampaignError::InvalidTransition { .. } => 409,
            CampaignError::NoInstances | CampaignError::NoRecipients => 422,
            CampaignError::InvalidPolicy(_) => 422,
            CampaignError::Store(e) => e.status_code(),
        }
    }

    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            CampaignError::NotFound => "NOT_FOUND",
            CampaignError::InvalidTransition { .. } => "INVALID_TRANSITION",
            CampaignError::NoInstances => "NO_INSTANCES",
            CampaignError::NoRecipients => "NO_RECIPIENTS",
            CampaignError::InvalidPolicy(_) => "INVALID_POLICY",
            CampaignError::Store(e) => e.code(),
        }
    }
}

type Result<T> = std::result::Result<T, CampaignError>;

/// Campaign Manager - Manages campaign lifecycle
pub struct CampaignManager {
    stores: Stores,
    clock: Arc<dyn Clock>,
    metrics: Arc<DispatchMetrics>,
}

impl CampaignManager {
    pub fn new(stores: Stores, clock: Arc<dyn Clock>, metrics: Arc<DispatchMetrics>) -> Self {
        Self {
            stores,
            clock,
            metrics,
        }
    }

    /// Create a draft campaign after validating its sending policy
    pub async fn create_campaign(&self, input: CreateCampaign) -> Result<Campaign> {
        SendingPolicy::parse(&PolicySettings::from(&input))?;

        let campaign = self.stores.campaigns.create(input, self.clock.now()).await?;
        info!(
            campaign_id = %campaign.id,
            tenant_id = %campaign.tenant_id,
            "Campaign created"
        );
        Ok(campaign)
    }

    pub async fn get_campaign(&self, tenant_id: TenantId, campaign_id: CampaignId) -> Result<Campaign> {
        self.stores
            .campaigns
            .get_by_tenant(tenant_id, campaign_id)
            .await?
            .ok_or(CampaignError::NotFound)
    }

    /// Queue recipients on a draft campaign. Contacts already queued are
    /// skipped; returns how many rows were added.
    pub async fn enqueue_recipients(
        &self,
        tenant_id: TenantId,
        campaign_id: CampaignId,
        recipients: &[NewCampaignMessage],
    ) -> Result<u64> {
        let campaign = self.get_campaign(tenant_id, campaign_id).await?;
        require_status(&campaign, &[CampaignStatus::Draft], "enqueue recipients on")?;

        let now = self.clock.now();
        let added = self
            .stores
            .messages
            .enqueue(campaign_id, campaign.tenant_id, recipients, now)
            .await?;

        let total = self.stores.messages.counts(campaign_id).await?.total();
        let updated = self
            .stores
            .campaigns
            .set_total_recipients(campaign_id, total as i32, now)
            .await?;
        if !updated {
            return Err(self.conflict(campaign_id, "enqueue recipients on").await);
        }

        debug!(campaign_id = %campaign_id, added, total, "Recipients queued");
        Ok(added)
    }

    /// `draft -> scheduled`; the scheduler trigger starts it once `scheduled_at` passes
    pub async fn schedule_campaign(
        &self,
        tenant_id: TenantId,
        campaign_id: CampaignId,
        scheduled_at: Timestamp,
    ) -> Result<Campaign> {
        let campaign = self.get_campaign(tenant_id, campaign_id).await?;
        require_status(&campaign, &[CampaignStatus::Draft], "schedule")?;
        self.require_sendable(&campaign).await?;

        let applied = self
            .stores
            .campaigns
            .schedule(campaign_id, scheduled_at, self.clock.now())
            .await?;
        if !applied {
            return Err(self.conflict(campaign_id, "schedule").await);
        }

        self.metrics.record_transition(CampaignStatus::Scheduled);
        info!(campaign_id = %campaign_id, scheduled_at = %scheduled_at, "Campaign scheduled");
        self.get_campaign(tenant_id, campaign_id).await
    }

    /// `draft|scheduled -> sending`. The caller invokes the dispatch loop.
    pub async fn start_campaign(&self, tenant_id: TenantId, campaign_id: CampaignId) -> Result<Campaign> {
        let campaign = self.get_campaign(tenant_id, campaign_id).await?;
        let from = require_status(
            &campaign,
            &[CampaignStatus::Draft, CampaignStatus::Scheduled],
            "start",
        )?;
        self.require_sendable(&campaign).await?;

        let applied = self
            .stores
            .campaigns
            .transition(campaign_id, from, CampaignStatus::Sending, self.clock.now())
            .await?;
        if !applied {
            return Err(self.conflict(campaign_id, "start").await);
        }

        self.metrics.record_transition(CampaignStatus::Sending);
        info!(campaign_id = %campaign_id, from = %from, "Campaign started");
        self.get_campaign(tenant_id, campaign_id).await
    }

    /// `scheduled|sending -> cancelled`. A running dispatch loop notices on
    /// its next iteration; queued rows stay queued.
    pub async fn cancel_campaign(&self, tenant_id: TenantId, campaign_id: CampaignId) -> Result<Campaign> {
        let campaign = self.get_campaign(tenant_id, campaign_id).await?;
        let from = require_status(
            &campaign,
            &[CampaignStatus::Scheduled, CampaignStatus::Sending],
            "cancel",
        )?;

        let applied = self
            .stores
            .campaigns
            .transition(campaign_id, from, CampaignStatus::Cancelled, self.clock.now())
            .await?;
        if !applied {
            return Err(self.conflict(campaign_id, "cancel").await);
        }

        self.metrics.record_transition(CampaignStatus::Cancelled);
        info!(campaign_id = %campaign_id, from = %from, "Campaign cancelled");
        self.get_campaign(tenant_id, campaign_id).await
    }

    /// Message counts, progress and an estimated completion time
    pub async fn get_campaign_stats(
        &self,
        tenant_id: TenantId,
        campaign_id: CampaignId,
    ) -> Result<CampaignStats> {
        let campaign = self.get_campaign(tenant_id, campaign_id).await?;
        let counts = self.stores.messages.counts(campaign_id).await?;
        let now = self.clock.now();

        let remaining = counts.queued + counts.sending;
        let sent_today = SendingPolicy::for_campaign(&campaign)
            .map(|policy| campaign.sent_on(policy.local_date(now)))
            .unwrap_or(campaign.sent_today);
        let estimated_completion = match campaign.status_enum() {
            Some(status) if status.is_terminal() => campaign.completed_at,
            Some(CampaignStatus::Scheduled) | Some(CampaignStatus::Sending) if remaining > 0 => {
                // An unparsable policy has no meaningful estimate
                SendingPolicy::for_campaign(&campaign)
                    .ok()
                    .and_then(|policy| estimate_completion(&campaign, &policy, now, remaining))
            }
            _ => None,
        };

        Ok(CampaignStats {
            campaign_id,
            status: campaign.status.clone(),
            total_recipients: campaign.total_recipients,
            queued: counts.queued,
            sending: counts.sending,
            sent: counts.sent,
            failed: counts.failed,
            sent_today,
            progress_percentage: campaign.progress_percentage(),
            retry_at: campaign.retry_at,
            estimated_completion,
            failure_reason: campaign.failure_reason.clone(),
        })
    }

    async fn require_sendable(&self, campaign: &Campaign) -> Result<()> {
        if campaign.instance_ids.is_empty() {
            return Err(CampaignError::NoInstances);
        }
        if self.stores.messages.counts(campaign.id).await?.queued == 0 {
            return Err(CampaignError::NoRecipients);
        }
        Ok(())
    }

    /// Error for a conditional update that lost a race
    async fn conflict(&self, campaign_id: CampaignId, action: &'static str) -> CampaignError {
        match self.stores.campaigns.get(campaign_id).await {
            Ok(Some(current)) => CampaignError::InvalidTransition {
                from: current.status,
                action,
            },
            Ok(None) => CampaignError::NotFound,
            Err(e) => CampaignError::Store(e),
        }
    }
}

fn require_status(
    campaign: &Campaign,
    allowed: &[CampaignStatus],
    action: &'static str,
) -> Result<CampaignStatus> {
    match campaign.status_enum() {
        Some(status) if allowed.contains(&status) => Ok(status),
        _ => Err(CampaignError::InvalidTransition {
            from: campaign.status.clone(),
            action,
        }),
    }
}

/// Latest pending start time plus the mean pacing delay for every remaining
/// message. `None` when the result does not fit a timestamp.
fn estimate_completion(
    campaign: &Campaign,
    policy: &SendingPolicy,
    now: Timestamp,
    remaining: i64,
) -> Option<Timestamp> {
    let base = [campaign.scheduled_at, campaign.retry_at, campaign.next_send_at]
        .into_iter()
        .flatten()
        .fold(now, |acc, at| acc.max(at));
    let remaining = i32::try_from(remaining).ok()?;
    let span = policy.mean_delay().checked_mul(remaining)?;
    base.checked_add_signed(span)
}
