//! In-memory store
//!
//! Implements every store trait over a single lock with the same conditional
//! update semantics as the PostgreSQL repositories. Used for tests and for
//! running the engine without a database.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;
use zapcast_common::types::{CampaignId, CampaignMessageId, InstanceId, TenantId, Timestamp};
use zapcast_common::{Error, Result};

use crate::models::{
    Campaign, CampaignMessage, CampaignStatus, CreateCampaign, Instance, MessageCounts,
    MessageStatus, NewCampaignMessage, ReclaimOutcome, DEFAULT_END_HOUR,
    DEFAULT_INTERVAL_MAX_SECS, DEFAULT_INTERVAL_MIN_SECS, DEFAULT_START_HOUR, DEFAULT_TIMEZONE,
    DEFAULT_WEEKDAYS,
};
use crate::repository::campaign_messages::RECLAIM_LIMIT_ERROR;
use crate::repository::{CampaignStore, InstanceRegistry, MessageStore};

#[derive(Default)]
struct State {
    campaigns: HashMap<CampaignId, Campaign>,
    messages: HashMap<CampaignMessageId, CampaignMessage>,
    instances: HashMap<InstanceId, Instance>,
    next_seq: i64,
}

impl State {
    fn campaign_in(&mut self, id: CampaignId, status: CampaignStatus) -> Option<&mut Campaign> {
        let status = status.to_string();
        self.campaigns.get_mut(&id).filter(|c| c.status == status)
    }

    fn message_in(
        &mut self,
        id: CampaignMessageId,
        status: MessageStatus,
    ) -> Option<&mut CampaignMessage> {
        let status = status.to_string();
        self.messages.get_mut(&id).filter(|m| m.status == status)
    }

    fn campaign_messages(&self, campaign_id: CampaignId) -> Vec<&CampaignMessage> {
        let mut rows: Vec<_> = self
            .messages
            .values()
            .filter(|m| m.campaign_id == campaign_id)
            .collect();
        rows.sort_by_key(|m| m.seq);
        rows
    }
}

/// Store keeping all campaign state in process memory
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a sending device
    pub async fn upsert_instance(&self, instance: Instance) {
        self.state
            .write()
            .await
            .instances
            .insert(instance.id, instance);
    }

    /// Change the connectivity status of a device
    pub async fn set_instance_status(&self, id: InstanceId, status: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let instance = state
            .instances
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("instance {}", id)))?;
        instance.status = status.to_string();
        Ok(())
    }

    /// Apply an arbitrary edit to a stored campaign
    pub async fn update_campaign<F>(&self, id: CampaignId, f: F) -> Result<()>
    where
        F: FnOnce(&mut Campaign),
    {
        let mut state = self.state.write().await;
        let campaign = state
            .campaigns
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("campaign {}", id)))?;
        f(campaign);
        Ok(())
    }
}

#[async_trait]
impl CampaignStore for MemoryStore {
    async fn create(&self, input: CreateCampaign, now: Timestamp) -> Result<Campaign> {
        let campaign = Campaign {
            id: Uuid::now_v7(),
            tenant_id: input.tenant_id,
            name: input.name,
            status: CampaignStatus::Draft.to_string(),
            scheduled_at: input.scheduled_at,
            retry_at: None,
            started_at: None,
            completed_at: None,
            instance_ids: input.instance_ids,
            sending_mode: input.sending_mode.to_string(),
            message_interval_min: input
                .message_interval_min
                .unwrap_or(DEFAULT_INTERVAL_MIN_SECS),
            message_interval_max: input
                .message_interval_max
                .unwrap_or(DEFAULT_INTERVAL_MAX_SECS),
            daily_limit: input.daily_limit,
            allowed_start_hour: input.allowed_start_hour.unwrap_or(DEFAULT_START_HOUR),
            allowed_end_hour: input.allowed_end_hour.unwrap_or(DEFAULT_END_HOUR),
            allowed_days: input
                .allowed_days
                .unwrap_or_else(|| DEFAULT_WEEKDAYS.to_vec()),
            timezone: input
                .timezone
                .unwrap_or_else(|| DEFAULT_TIMEZONE.to_string()),
            total_recipients: 0,
            sent_count: 0,
            failed_count: 0,
            sent_today: 0,
            sent_today_date: None,
            next_send_at: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };

        self.state
            .write()
            .await
            .campaigns
            .insert(campaign.id, campaign.clone());
        Ok(campaign)
    }

    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>> {
        Ok(self.state.read().await.campaigns.get(&id).cloned())
    }

    async fn get_by_tenant(
        &self,
        tenant_id: TenantId,
        id: CampaignId,
    ) -> Result<Option<Campaign>> {
        Ok(self
            .state
            .read()
            .await
            .campaigns
            .get(&id)
            .filter(|c| c.tenant_id == tenant_id)
            .cloned())
    }

    async fn transition(
        &self,
        id: CampaignId,
        from: CampaignStatus,
        to: CampaignStatus,
        now: Timestamp,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some(campaign) = state.campaign_in(id, from) else {
            return Ok(false);
        };

        campaign.status = to.to_string();
        if to == CampaignStatus::Sending && campaign.started_at.is_none() {
            campaign.started_at = Some(now);
        }
        if to.is_terminal() {
            campaign.completed_at = Some(now);
        }
        campaign.retry_at = None;
        campaign.updated_at = now;
        Ok(true)
    }

    async fn schedule(
        &self,
        id: CampaignId,
        scheduled_at: Timestamp,
        now: Timestamp,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some(campaign) = state.campaign_in(id, CampaignStatus::Draft) else {
            return Ok(false);
        };

        campaign.status = CampaignStatus::Scheduled.to_string();
        campaign.scheduled_at = Some(scheduled_at);
        campaign.updated_at = now;
        Ok(true)
    }

    async fn fail(
        &self,
        id: CampaignId,
        from: CampaignStatus,
        reason: &str,
        now: Timestamp,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some(campaign) = state.campaign_in(id, from) else {
            return Ok(false);
        };

        campaign.status = CampaignStatus::Failed.to_string();
        campaign.failure_reason = Some(reason.to_string());
        campaign.completed_at = Some(now);
        campaign.retry_at = None;
        campaign.updated_at = now;
        Ok(true)
    }

    async fn set_retry_at(
        &self,
        id: CampaignId,
        retry_at: Timestamp,
        now: Timestamp,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some(campaign) = state.campaign_in(id, CampaignStatus::Sending) else {
            return Ok(false);
        };

        campaign.retry_at = Some(retry_at);
        campaign.updated_at = now;
        Ok(true)
    }

    async fn clear_retry_at(
        &self,
        id: CampaignId,
        expected: Timestamp,
        now: Timestamp,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some(campaign) = state
            .campaign_in(id, CampaignStatus::Sending)
            .filter(|c| c.retry_at == Some(expected))
        else {
            return Ok(false);
        };

        campaign.retry_at = None;
        campaign.updated_at = now;
        Ok(true)
    }

    async fn set_next_send_at(
        &self,
        id: CampaignId,
        at: Timestamp,
        now: Timestamp,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some(campaign) = state.campaign_in(id, CampaignStatus::Sending) else {
            return Ok(false);
        };

        campaign.next_send_at = Some(at);
        campaign.updated_at = now;
        Ok(true)
    }

    async fn record_sent(
        &self,
        id: CampaignId,
        local_date: NaiveDate,
        now: Timestamp,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some(campaign) = state
            .campaigns
            .get_mut(&id)
            .filter(|c| c.sent_count < c.total_recipients)
        else {
            return Ok(false);
        };

        campaign.sent_today = campaign.sent_on(local_date) + 1;
        campaign.sent_today_date = Some(local_date);
        campaign.sent_count += 1;
        campaign.updated_at = now;
        Ok(true)
    }

    async fn add_failed(&self, id: CampaignId, count: i32, now: Timestamp) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some(campaign) = state.campaigns.get_mut(&id) else {
            return Ok(false);
        };

        campaign.failed_count += count;
        campaign.updated_at = now;
        Ok(true)
    }

    async fn touch(&self, id: CampaignId, now: Timestamp) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some(campaign) = state.campaign_in(id, CampaignStatus::Sending) else {
            return Ok(false);
        };

        campaign.updated_at = now;
        Ok(true)
    }

    async fn set_total_recipients(
        &self,
        id: CampaignId,
        total: i32,
        now: Timestamp,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some(campaign) = state.campaign_in(id, CampaignStatus::Draft) else {
            return Ok(false);
        };

        campaign.total_recipients = total;
        campaign.updated_at = now;
        Ok(true)
    }

    async fn list_due_scheduled(&self, now: Timestamp) -> Result<Vec<Campaign>> {
        let state = self.state.read().await;
        let mut due: Vec<Campaign> = state
            .campaigns
            .values()
            .filter(|c| c.status_enum() == Some(CampaignStatus::Scheduled))
            .filter(|c| c.scheduled_at.map(|at| at <= now).unwrap_or(false))
            .cloned()
            .collect();
        due.sort_by_key(|c| c.scheduled_at);
        Ok(due)
    }

    async fn list_due_retries(&self, now: Timestamp) -> Result<Vec<Campaign>> {
        let state = self.state.read().await;
        let mut due: Vec<Campaign> = state
            .campaigns
            .values()
            .filter(|c| c.status_enum() == Some(CampaignStatus::Sending))
            .filter(|c| c.retry_at.map(|at| at <= now).unwrap_or(false))
            .cloned()
            .collect();
        due.sort_by_key(|c| c.retry_at);
        Ok(due)
    }

    async fn list_stalled(&self, cutoff: Timestamp) -> Result<Vec<Campaign>> {
        let state = self.state.read().await;
        let mut stalled: Vec<Campaign> = state
            .campaigns
            .values()
            .filter(|c| c.status_enum() == Some(CampaignStatus::Sending))
            .filter(|c| c.retry_at.is_none() && c.updated_at < cutoff)
            .cloned()
            .collect();
        stalled.sort_by_key(|c| c.updated_at);
        Ok(stalled)
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn enqueue(
        &self,
        campaign_id: CampaignId,
        tenant_id: TenantId,
        messages: &[NewCampaignMessage],
        now: Timestamp,
    ) -> Result<u64> {
        let mut state = self.state.write().await;
        let mut count = 0u64;

        for input in messages {
            let duplicate = state
                .messages
                .values()
                .any(|m| m.campaign_id == campaign_id && m.contact_id == input.contact_id);
            if duplicate {
                continue;
            }

            state.next_seq += 1;
            let message = CampaignMessage {
                id: Uuid::now_v7(),
                seq: state.next_seq,
                campaign_id,
                tenant_id,
                contact_id: input.contact_id,
                recipient: input.recipient.clone(),
                content: input.content.clone(),
                media_url: input.media_url.clone(),
                status: MessageStatus::Queued.to_string(),
                instance_id: None,
                attempts: 0,
                last_error: None,
                provider_message_id: None,
                sent_at: None,
                created_at: now,
                updated_at: now,
            };
            state.messages.insert(message.id, message);
            count += 1;
        }

        Ok(count)
    }

    async fn get(&self, id: CampaignMessageId) -> Result<Option<CampaignMessage>> {
        Ok(self.state.read().await.messages.get(&id).cloned())
    }

    async fn list_by_campaign(&self, campaign_id: CampaignId) -> Result<Vec<CampaignMessage>> {
        let state = self.state.read().await;
        Ok(state
            .campaign_messages(campaign_id)
            .into_iter()
            .cloned()
            .collect())
    }

    async fn next_queued(&self, campaign_id: CampaignId) -> Result<Option<CampaignMessage>> {
        let state = self.state.read().await;
        let queued = MessageStatus::Queued.to_string();
        Ok(state
            .campaign_messages(campaign_id)
            .into_iter()
            .find(|m| m.status == queued)
            .cloned())
    }

    async fn claim(
        &self,
        id: CampaignMessageId,
        instance_id: InstanceId,
        now: Timestamp,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some(message) = state.message_in(id, MessageStatus::Queued) else {
            return Ok(false);
        };

        message.status = MessageStatus::Sending.to_string();
        message.instance_id = Some(instance_id);
        message.attempts += 1;
        message.updated_at = now;
        Ok(true)
    }

    async fn mark_sent(
        &self,
        id: CampaignMessageId,
        provider_message_id: Option<&str>,
        now: Timestamp,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some(message) = state.message_in(id, MessageStatus::Sending) else {
            return Ok(false);
        };

        message.status = MessageStatus::Sent.to_string();
        message.provider_message_id = provider_message_id.map(str::to_string);
        message.last_error = None;
        message.sent_at = Some(now);
        message.updated_at = now;
        Ok(true)
    }

    async fn mark_failed(
        &self,
        id: CampaignMessageId,
        error: &str,
        now: Timestamp,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some(message) = state.message_in(id, MessageStatus::Sending) else {
            return Ok(false);
        };

        message.status = MessageStatus::Failed.to_string();
        message.last_error = Some(error.to_string());
        message.updated_at = now;
        Ok(true)
    }

    async fn record_transient_error(
        &self,
        id: CampaignMessageId,
        error: &str,
        now: Timestamp,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(message) = state.message_in(id, MessageStatus::Sending) {
            message.last_error = Some(error.to_string());
            message.updated_at = now;
        }
        Ok(())
    }

    async fn counts(&self, campaign_id: CampaignId) -> Result<MessageCounts> {
        let state = self.state.read().await;
        let mut counts = MessageCounts::default();

        for message in state.campaign_messages(campaign_id) {
            match message.status_enum() {
                Some(MessageStatus::Queued) => counts.queued += 1,
                Some(MessageStatus::Sending) => counts.sending += 1,
                Some(MessageStatus::Sent) => counts.sent += 1,
                Some(MessageStatus::Failed) => counts.failed += 1,
                None => {}
            }
        }

        Ok(counts)
    }

    async fn reclaim_orphans(
        &self,
        campaign_id: CampaignId,
        max_attempts: i32,
        now: Timestamp,
    ) -> Result<ReclaimOutcome> {
        let mut state = self.state.write().await;
        let sending = MessageStatus::Sending.to_string();
        let mut outcome = ReclaimOutcome::default();

        for message in state
            .messages
            .values_mut()
            .filter(|m| m.campaign_id == campaign_id && m.status == sending)
        {
            if message.attempts >= max_attempts {
                message.status = MessageStatus::Failed.to_string();
                message.last_error = Some(RECLAIM_LIMIT_ERROR.to_string());
                outcome.exhausted += 1;
            } else {
                message.status = MessageStatus::Queued.to_string();
                message.instance_id = None;
                outcome.requeued += 1;
            }
            message.updated_at = now;
        }

        Ok(outcome)
    }
}

#[async_trait]
impl InstanceRegistry for MemoryStore {
    async fn get_many(&self, ids: &[InstanceId]) -> Result<Vec<Instance>> {
        let state = self.state.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.instances.get(id).cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn now() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap()
    }

    fn recipients(n: usize) -> Vec<NewCampaignMessage> {
        (0..n)
            .map(|i| NewCampaignMessage {
                contact_id: Uuid::new_v4(),
                recipient: format!("55119990000{:02}", i),
                content: "hello".to_string(),
                media_url: None,
            })
            .collect()
    }

    async fn sending_campaign(store: &MemoryStore, total: usize) -> Campaign {
        let campaign = store
            .create(CreateCampaign::new(Uuid::new_v4(), "promo"), now())
            .await
            .unwrap();
        store
            .enqueue(campaign.id, campaign.tenant_id, &recipients(total), now())
            .await
            .unwrap();
        store
            .set_total_recipients(campaign.id, total as i32, now())
            .await
            .unwrap();
        assert!(store
            .transition(campaign.id, CampaignStatus::Draft, CampaignStatus::Sending, now())
            .await
            .unwrap());
        CampaignStore::get(store, campaign.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let store = MemoryStore::new();
        let campaign = sending_campaign(&store, 1).await;
        assert!(campaign.started_at.is_some());

        let applied = store
            .transition(campaign.id, CampaignStatus::Draft, CampaignStatus::Scheduled, now())
            .await
            .unwrap();
        assert!(!applied);

        let applied = store
            .transition(campaign.id, CampaignStatus::Sending, CampaignStatus::Cancelled, now())
            .await
            .unwrap();
        assert!(applied);

        let campaign = CampaignStore::get(&store, campaign.id).await.unwrap().unwrap();
        assert_eq!(campaign.status, "cancelled");
        assert!(campaign.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_enqueue_skips_duplicate_contacts() {
        let store = MemoryStore::new();
        let campaign = store
            .create(CreateCampaign::new(Uuid::new_v4(), "promo"), now())
            .await
            .unwrap();
        let batch = recipients(3);

        let first = store
            .enqueue(campaign.id, campaign.tenant_id, &batch, now())
            .await
            .unwrap();
        let second = store
            .enqueue(campaign.id, campaign.tenant_id, &batch, now())
            .await
            .unwrap();

        assert_eq!(first, 3);
        assert_eq!(second, 0);
        assert_eq!(store.counts(campaign.id).await.unwrap().queued, 3);
    }

    #[tokio::test]
    async fn test_claim_only_once() {
        let store = MemoryStore::new();
        let campaign = sending_campaign(&store, 2).await;
        let message = store.next_queued(campaign.id).await.unwrap().unwrap();
        let device = Uuid::new_v4();

        assert!(store.claim(message.id, device, now()).await.unwrap());
        assert!(!store.claim(message.id, device, now()).await.unwrap());

        let next = store.next_queued(campaign.id).await.unwrap().unwrap();
        assert!(next.seq > message.seq);
    }

    #[tokio::test]
    async fn test_record_sent_never_exceeds_total() {
        let store = MemoryStore::new();
        let campaign = sending_campaign(&store, 1).await;
        let day = now().date_naive();

        assert!(store.record_sent(campaign.id, day, now()).await.unwrap());
        assert!(!store.record_sent(campaign.id, day, now()).await.unwrap());

        let campaign = CampaignStore::get(&store, campaign.id).await.unwrap().unwrap();
        assert_eq!(campaign.sent_count, 1);
        assert_eq!(campaign.sent_on(day), 1);
    }

    #[tokio::test]
    async fn test_sent_today_resets_on_new_local_day() {
        let store = MemoryStore::new();
        let campaign = sending_campaign(&store, 3).await;
        let day = now().date_naive();
        let next_day = day.succ_opt().unwrap();

        store.record_sent(campaign.id, day, now()).await.unwrap();
        store.record_sent(campaign.id, day, now()).await.unwrap();
        store.record_sent(campaign.id, next_day, now()).await.unwrap();

        let campaign = CampaignStore::get(&store, campaign.id).await.unwrap().unwrap();
        assert_eq!(campaign.sent_count, 3);
        assert_eq!(campaign.sent_on(next_day), 1);
        assert_eq!(campaign.sent_on(day), 0);
    }

    #[tokio::test]
    async fn test_reclaim_orphans_respects_attempt_limit() {
        let store = MemoryStore::new();
        let campaign = sending_campaign(&store, 3).await;
        let device = Uuid::new_v4();

        for _ in 0..2 {
            let message = store.next_queued(campaign.id).await.unwrap().unwrap();
            store.claim(message.id, device, now()).await.unwrap();
        }
        let first = store.list_by_campaign(campaign.id).await.unwrap()[0].clone();
        {
            let mut state = store.state.write().await;
            state.messages.get_mut(&first.id).unwrap().attempts = 3;
        }

        let outcome = store.reclaim_orphans(campaign.id, 3, now()).await.unwrap();
        assert_eq!(
            outcome,
            ReclaimOutcome {
                requeued: 1,
                exhausted: 1
            }
        );

        let first = MessageStore::get(&store, first.id).await.unwrap().unwrap();
        assert_eq!(first.status, "failed");
        assert_eq!(first.last_error.as_deref(), Some(RECLAIM_LIMIT_ERROR));

        let counts = store.counts(campaign.id).await.unwrap();
        assert_eq!(counts.queued, 2);
        assert_eq!(counts.sending, 0);
    }

    #[tokio::test]
    async fn test_clear_retry_at_requires_expected_value() {
        let store = MemoryStore::new();
        let campaign = sending_campaign(&store, 1).await;
        let retry_at = now() + chrono::Duration::hours(1);

        store.set_retry_at(campaign.id, retry_at, now()).await.unwrap();
        assert!(!store.clear_retry_at(campaign.id, now(), now()).await.unwrap());
        assert_eq!(store.list_due_retries(retry_at).await.unwrap().len(), 1);
        assert!(store.list_stalled(retry_at).await.unwrap().is_empty());

        assert!(store.clear_retry_at(campaign.id, retry_at, now()).await.unwrap());
        assert!(store.list_due_retries(retry_at).await.unwrap().is_empty());
    }
}
