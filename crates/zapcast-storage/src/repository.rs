//! Repository layer for data access
//!
//! Every state-changing method is a single conditional update guarded by the
//! expected prior state and reports whether it applied. A precondition that no
//! longer holds is a no-op (`Ok(false)`), not an error.

pub mod campaign_messages;
pub mod campaigns;
pub mod instances;

use async_trait::async_trait;
use chrono::NaiveDate;
use zapcast_common::types::{CampaignId, CampaignMessageId, InstanceId, TenantId, Timestamp};
use zapcast_common::Result;

use crate::models::{
    Campaign, CampaignMessage, CampaignStatus, CreateCampaign, Instance, MessageCounts,
    NewCampaignMessage, ReclaimOutcome,
};

pub use campaign_messages::DbCampaignMessageRepository;
pub use campaigns::DbCampaignRepository;
pub use instances::DbInstanceRepository;

/// Campaign store
#[async_trait]
pub trait CampaignStore: Send + Sync {
    async fn create(&self, input: CreateCampaign, now: Timestamp) -> Result<Campaign>;
    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>>;
    async fn get_by_tenant(&self, tenant_id: TenantId, id: CampaignId)
        -> Result<Option<Campaign>>;

    /// Compare-and-set on `status`. Entering `sending` stamps `started_at` once,
    /// entering a terminal state stamps `completed_at`; `retry_at` is cleared.
    async fn transition(
        &self,
        id: CampaignId,
        from: CampaignStatus,
        to: CampaignStatus,
        now: Timestamp,
    ) -> Result<bool>;

    /// `draft -> scheduled`, recording the start time
    async fn schedule(&self, id: CampaignId, scheduled_at: Timestamp, now: Timestamp)
        -> Result<bool>;

    /// Move to `failed` from `from`, recording the reason
    async fn fail(
        &self,
        id: CampaignId,
        from: CampaignStatus,
        reason: &str,
        now: Timestamp,
    ) -> Result<bool>;

    /// Park a sending campaign until `retry_at`
    async fn set_retry_at(&self, id: CampaignId, retry_at: Timestamp, now: Timestamp)
        -> Result<bool>;

    /// Clear `retry_at` only if it still equals `expected`
    async fn clear_retry_at(
        &self,
        id: CampaignId,
        expected: Timestamp,
        now: Timestamp,
    ) -> Result<bool>;

    /// Persist the pacing cursor of a sending campaign
    async fn set_next_send_at(&self, id: CampaignId, at: Timestamp, now: Timestamp)
        -> Result<bool>;

    /// Atomically bump `sent_count` and the per-local-day counter
    async fn record_sent(&self, id: CampaignId, local_date: NaiveDate, now: Timestamp)
        -> Result<bool>;

    async fn add_failed(&self, id: CampaignId, count: i32, now: Timestamp) -> Result<bool>;

    /// Bump the progress timestamp of a sending campaign
    async fn touch(&self, id: CampaignId, now: Timestamp) -> Result<bool>;

    /// Set the recipient total of a draft campaign
    async fn set_total_recipients(&self, id: CampaignId, total: i32, now: Timestamp)
        -> Result<bool>;

    /// Campaigns in `scheduled` whose start time has passed
    async fn list_due_scheduled(&self, now: Timestamp) -> Result<Vec<Campaign>>;

    /// Campaigns in `sending` whose policy pause has expired
    async fn list_due_retries(&self, now: Timestamp) -> Result<Vec<Campaign>>;

    /// Campaigns in `sending`, not policy-paused, with no progress since `cutoff`
    async fn list_stalled(&self, cutoff: Timestamp) -> Result<Vec<Campaign>>;
}

/// Campaign message store
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Queue one row per contact; contacts already queued are skipped
    async fn enqueue(
        &self,
        campaign_id: CampaignId,
        tenant_id: TenantId,
        messages: &[NewCampaignMessage],
        now: Timestamp,
    ) -> Result<u64>;

    async fn get(&self, id: CampaignMessageId) -> Result<Option<CampaignMessage>>;

    async fn list_by_campaign(&self, campaign_id: CampaignId) -> Result<Vec<CampaignMessage>>;

    /// Oldest queued row in insertion order
    async fn next_queued(&self, campaign_id: CampaignId) -> Result<Option<CampaignMessage>>;

    /// `queued -> sending`, recording the device and counting the attempt
    async fn claim(&self, id: CampaignMessageId, instance_id: InstanceId, now: Timestamp)
        -> Result<bool>;

    /// `sending -> sent`
    async fn mark_sent(
        &self,
        id: CampaignMessageId,
        provider_message_id: Option<&str>,
        now: Timestamp,
    ) -> Result<bool>;

    /// `sending -> failed`
    async fn mark_failed(&self, id: CampaignMessageId, error: &str, now: Timestamp)
        -> Result<bool>;

    /// Record a transient error, leaving the row in `sending`
    async fn record_transient_error(
        &self,
        id: CampaignMessageId,
        error: &str,
        now: Timestamp,
    ) -> Result<()>;

    async fn counts(&self, campaign_id: CampaignId) -> Result<MessageCounts>;

    /// Reset orphaned `sending` rows to `queued`; rows that already used
    /// `max_attempts` attempts are failed instead
    async fn reclaim_orphans(
        &self,
        campaign_id: CampaignId,
        max_attempts: i32,
        now: Timestamp,
    ) -> Result<ReclaimOutcome>;
}

/// Read access to sending devices
#[async_trait]
pub trait InstanceRegistry: Send + Sync {
    async fn get_many(&self, ids: &[InstanceId]) -> Result<Vec<Instance>>;
}
