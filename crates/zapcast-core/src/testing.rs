//! Shared test fixtures: a manual clock, a scripted transport, a recording
//! invoker and an in-memory store with one connected device.

use crate::campaign::{CampaignManager, CampaignRunner, DispatchInvoker};
use crate::clock::{Clock, ManualClock};
use crate::dispatch::DispatchEngine;
use crate::metrics::DispatchMetrics;
use crate::stores::Stores;
use crate::sweep::{SchedulerTrigger, StallDetector};
use crate::transport::{OutboundMessage, SendOutcome, Transport};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use uuid::Uuid;
use zapcast_common::config::{DispatchConfig, SchedulerConfig};
use zapcast_common::types::{CampaignId, SendingMode, TenantId, Timestamp};
use zapcast_common::{Error, Result};
use zapcast_storage::models::{
    Campaign, CampaignStatus, CreateCampaign, Instance, NewCampaignMessage,
};
use zapcast_storage::{CampaignStore, MemoryStore, MessageStore};

/// Device row, not stored
pub(crate) fn instance(level: i32, status: &str, now: Timestamp) -> Instance {
    Instance {
        id: Uuid::now_v7(),
        tenant_id: Uuid::nil(),
        name: format!("device-{}", level),
        status: status.to_string(),
        warmup_level: level,
        updated_at: now,
    }
}

/// Sending campaign row over `devices`, not stored
pub(crate) fn campaign_row(devices: &[Instance], now: Timestamp) -> Campaign {
    Campaign {
        id: Uuid::now_v7(),
        tenant_id: Uuid::nil(),
        name: "test".to_string(),
        status: CampaignStatus::Sending.to_string(),
        scheduled_at: None,
        retry_at: None,
        started_at: Some(now),
        completed_at: None,
        instance_ids: devices.iter().map(|d| d.id).collect(),
        sending_mode: SendingMode::Warming.to_string(),
        message_interval_min: 0,
        message_interval_max: 0,
        daily_limit: None,
        allowed_start_hour: 0,
        allowed_end_hour: 0,
        allowed_days: Vec::new(),
        timezone: "UTC".to_string(),
        total_recipients: 0,
        sent_count: 0,
        failed_count: 0,
        sent_today: 0,
        sent_today_date: None,
        next_send_at: None,
        failure_reason: None,
        created_at: now,
        updated_at: now,
    }
}

pub(crate) fn recipients(n: usize) -> Vec<NewCampaignMessage> {
    (0..n)
        .map(|i| NewCampaignMessage {
            contact_id: Uuid::now_v7(),
            recipient: format!("55119{:08}", i),
            content: format!("Hello #{}", i),
            media_url: None,
        })
        .collect()
}

/// Generous time box, no re-invoke pause, default warm-up gaps
pub(crate) fn dispatch_config() -> DispatchConfig {
    DispatchConfig {
        max_runtime_secs: 3600,
        max_messages_per_run: 500,
        reinvoke_delay_secs: 0,
        ..DispatchConfig::default()
    }
}

#[derive(Default)]
struct Script {
    outcomes: VecDeque<SendOutcome>,
    recipients: Vec<String>,
    cancel_after: Option<(usize, MemoryStore, CampaignId)>,
}

/// Transport returning scripted outcomes, then `Delivered`
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    script: Mutex<Script>,
}

impl ScriptedTransport {
    /// Outcomes for the next sends, in order
    pub(crate) fn script(&self, outcomes: Vec<SendOutcome>) {
        self.script.lock().unwrap().outcomes.extend(outcomes);
    }

    /// Cancel the campaign as the `n`th send happens
    pub(crate) fn cancel_after(&self, n: usize, store: MemoryStore, campaign_id: CampaignId) {
        self.script.lock().unwrap().cancel_after = Some((n, store, campaign_id));
    }

    pub(crate) fn sent_count(&self) -> usize {
        self.script.lock().unwrap().recipients.len()
    }

    pub(crate) fn recipients(&self) -> Vec<String> {
        self.script.lock().unwrap().recipients.clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, _instance: &Instance, message: &OutboundMessage) -> SendOutcome {
        let (outcome, cancel) = {
            let mut script = self.script.lock().unwrap();
            script.recipients.push(message.recipient.clone());
            let sends = script.recipients.len();

            let outcome = script
                .outcomes
                .pop_front()
                .unwrap_or_else(|| SendOutcome::Delivered {
                    provider_message_id: Some(format!("wamid-{}", sends)),
                });
            let cancel = match &script.cancel_after {
                Some((n, store, id)) if *n == sends => Some((store.clone(), *id)),
                _ => None,
            };
            (outcome, cancel)
        };

        if let Some((store, id)) = cancel {
            store
                .transition(id, CampaignStatus::Sending, CampaignStatus::Cancelled, Utc::now())
                .await
                .unwrap();
        }
        outcome
    }
}

/// Invoker that only records what it was asked to run
#[derive(Default)]
pub(crate) struct RecordingInvoker {
    invoked: Mutex<Vec<CampaignId>>,
    failing: Mutex<HashSet<CampaignId>>,
}

impl RecordingInvoker {
    pub(crate) fn invoked(&self) -> Vec<CampaignId> {
        self.invoked.lock().unwrap().clone()
    }

    /// Make invocations for `campaign_id` return an error
    pub(crate) fn fail_for(&self, campaign_id: CampaignId) {
        self.failing.lock().unwrap().insert(campaign_id);
    }
}

#[async_trait]
impl DispatchInvoker for RecordingInvoker {
    async fn invoke(&self, campaign_id: CampaignId) -> Result<()> {
        if self.failing.lock().unwrap().contains(&campaign_id) {
            return Err(Error::Internal("invoker unavailable".to_string()));
        }
        self.invoked.lock().unwrap().push(campaign_id);
        Ok(())
    }
}

/// In-memory world with one connected level-5 device
pub(crate) struct Fixture {
    pub store: MemoryStore,
    pub clock: Arc<ManualClock>,
    pub transport: Arc<ScriptedTransport>,
    pub invoker: Arc<RecordingInvoker>,
    pub metrics: Arc<DispatchMetrics>,
    pub dispatch: DispatchConfig,
    pub scheduler: SchedulerConfig,
    pub device: Instance,
    pub tenant: TenantId,
}

impl Fixture {
    pub(crate) async fn new() -> Self {
        Self::with_dispatch(dispatch_config()).await
    }

    pub(crate) async fn with_dispatch(dispatch: DispatchConfig) -> Self {
        // Tuesday noon
        let start = Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap();
        let store = MemoryStore::new();
        let device = instance(5, "connected", start);
        store.upsert_instance(device.clone()).await;

        Self {
            store,
            clock: Arc::new(ManualClock::new(start)),
            transport: Arc::new(ScriptedTransport::default()),
            invoker: Arc::new(RecordingInvoker::default()),
            metrics: Arc::new(DispatchMetrics::new().unwrap()),
            dispatch,
            scheduler: SchedulerConfig::default(),
            device,
            tenant: Uuid::now_v7(),
        }
    }

    pub(crate) fn stores(&self) -> Stores {
        Stores::memory(self.store.clone())
    }

    fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub(crate) fn engine(&self) -> DispatchEngine {
        DispatchEngine::new(
            self.stores(),
            self.transport.clone(),
            self.clock(),
            self.metrics.clone(),
            &self.dispatch,
        )
    }

    pub(crate) fn runner(&self) -> CampaignRunner {
        CampaignRunner::new(
            Arc::new(self.engine()),
            self.clock(),
            std::time::Duration::from_secs(self.dispatch.reinvoke_delay_secs),
        )
    }

    pub(crate) fn manager(&self) -> CampaignManager {
        CampaignManager::new(self.stores(), self.clock(), self.metrics.clone())
    }

    pub(crate) fn trigger(&self) -> SchedulerTrigger {
        SchedulerTrigger::new(
            self.stores(),
            self.invoker.clone(),
            self.clock(),
            self.metrics.clone(),
        )
    }

    pub(crate) fn stall_detector(&self) -> StallDetector {
        StallDetector::new(
            self.stores(),
            self.invoker.clone(),
            self.clock(),
            self.metrics.clone(),
            &self.scheduler,
        )
    }

    /// Draft campaign on the fixture device with `n` queued recipients and
    /// an always-open, unpaced direct policy
    pub(crate) async fn draft_campaign(&self, n: usize) -> Campaign {
        let now = self.clock.now();
        let input = CreateCampaign {
            instance_ids: vec![self.device.id],
            sending_mode: SendingMode::Direct,
            message_interval_min: Some(0),
            message_interval_max: Some(0),
            allowed_start_hour: Some(0),
            allowed_end_hour: Some(0),
            allowed_days: Some(Vec::new()),
            timezone: Some("UTC".to_string()),
            ..CreateCampaign::new(self.tenant, "test")
        };

        let campaign = self.store.create(input, now).await.unwrap();
        self.store
            .enqueue(campaign.id, self.tenant, &recipients(n), now)
            .await
            .unwrap();
        self.store
            .set_total_recipients(campaign.id, n as i32, now)
            .await
            .unwrap();
        self.campaign(campaign.id).await
    }

    /// Like `draft_campaign`, with `edit` applied, then moved to `sending`
    pub(crate) async fn sending_campaign<F>(&self, n: usize, edit: F) -> Campaign
    where
        F: FnOnce(&mut Campaign),
    {
        let campaign = self.draft_campaign(n).await;
        self.store.update_campaign(campaign.id, edit).await.unwrap();
        self.store
            .transition(
                campaign.id,
                CampaignStatus::Draft,
                CampaignStatus::Sending,
                self.clock.now(),
            )
            .await
            .unwrap();
        self.campaign(campaign.id).await
    }

    pub(crate) async fn campaign(&self, id: CampaignId) -> Campaign {
        CampaignStore::get(&self.store, id).await.unwrap().unwrap()
    }

    pub(crate) async fn disconnect_all(&self) {
        self.store
            .set_instance_status(self.device.id, "disconnected")
            .await
            .unwrap();
    }
}
