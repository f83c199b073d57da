//! Database models

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use zapcast_common::types::{
    CampaignId, CampaignMessageId, ContactId, InstanceId, SendingMode, TenantId,
};

/// Campaign status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Sending,
    Completed,
    Cancelled,
    Failed,
}

impl CampaignStatus {
    /// Terminal states are final
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CampaignStatus::Completed | CampaignStatus::Cancelled | CampaignStatus::Failed
        )
    }

    /// Whether moving from `self` to `next` follows
    /// `draft -> scheduled|sending -> sending -> completed|cancelled|failed`
    pub fn can_transition_to(&self, next: CampaignStatus) -> bool {
        use CampaignStatus::*;
        match (self, next) {
            (Draft, Scheduled) | (Draft, Sending) => true,
            (Scheduled, Sending) | (Scheduled, Cancelled) | (Scheduled, Failed) => true,
            (Sending, Completed) | (Sending, Cancelled) | (Sending, Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CampaignStatus::Draft => write!(f, "draft"),
            CampaignStatus::Scheduled => write!(f, "scheduled"),
            CampaignStatus::Sending => write!(f, "sending"),
            CampaignStatus::Completed => write!(f, "completed"),
            CampaignStatus::Cancelled => write!(f, "cancelled"),
            CampaignStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(CampaignStatus::Draft),
            "scheduled" => Ok(CampaignStatus::Scheduled),
            "sending" => Ok(CampaignStatus::Sending),
            "completed" => Ok(CampaignStatus::Completed),
            "cancelled" => Ok(CampaignStatus::Cancelled),
            "failed" => Ok(CampaignStatus::Failed),
            _ => Err(format!("Invalid campaign status: {}", s)),
        }
    }
}

/// Campaign model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub tenant_id: TenantId,
    pub name: String,
    pub status: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Set only while sending and paused by the sending policy
    pub retry_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub instance_ids: Vec<InstanceId>,
    pub sending_mode: String,
    pub message_interval_min: i32,
    pub message_interval_max: i32,
    pub daily_limit: Option<i32>,
    pub allowed_start_hour: i32,
    pub allowed_end_hour: i32,
    /// 0 = Sunday .. 6 = Saturday
    pub allowed_days: Vec<i32>,
    pub timezone: String,
    pub total_recipients: i32,
    pub sent_count: i32,
    pub failed_count: i32,
    pub sent_today: i32,
    /// Local date `sent_today` counts for
    pub sent_today_date: Option<NaiveDate>,
    /// Pacing cursor: earliest instant the next send may happen
    pub next_send_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Doubles as the last-progress timestamp watched by the stall detector
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    /// Get status enum
    pub fn status_enum(&self) -> Option<CampaignStatus> {
        self.status.parse().ok()
    }

    /// Get sending mode enum, defaulting to warming for unknown values
    pub fn mode(&self) -> SendingMode {
        self.sending_mode.parse().unwrap_or_default()
    }

    /// Sends already counted for `local_date`
    pub fn sent_on(&self, local_date: NaiveDate) -> i32 {
        match self.sent_today_date {
            Some(date) if date == local_date => self.sent_today,
            _ => 0,
        }
    }

    /// Calculate progress percentage
    pub fn progress_percentage(&self) -> f64 {
        if self.total_recipients == 0 {
            0.0
        } else {
            ((self.sent_count + self.failed_count) as f64 / self.total_recipients as f64) * 100.0
        }
    }
}

/// Create campaign input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCampaign {
    pub tenant_id: TenantId,
    pub name: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub instance_ids: Vec<InstanceId>,
    #[serde(default)]
    pub sending_mode: SendingMode,
    pub message_interval_min: Option<i32>,
    pub message_interval_max: Option<i32>,
    pub daily_limit: Option<i32>,
    pub allowed_start_hour: Option<i32>,
    pub allowed_end_hour: Option<i32>,
    pub allowed_days: Option<Vec<i32>>,
    pub timezone: Option<String>,
}

impl CreateCampaign {
    /// Minimal input with default sending policy
    pub fn new(tenant_id: TenantId, name: impl Into<String>) -> Self {
        Self {
            tenant_id,
            name: name.into(),
            scheduled_at: None,
            instance_ids: Vec::new(),
            sending_mode: SendingMode::default(),
            message_interval_min: None,
            message_interval_max: None,
            daily_limit: None,
            allowed_start_hour: None,
            allowed_end_hour: None,
            allowed_days: None,
            timezone: None,
        }
    }
}

pub const DEFAULT_INTERVAL_MIN_SECS: i32 = 30;
pub const DEFAULT_INTERVAL_MAX_SECS: i32 = 90;
pub const DEFAULT_START_HOUR: i32 = 8;
pub const DEFAULT_END_HOUR: i32 = 20;
pub const DEFAULT_TIMEZONE: &str = "America/Sao_Paulo";
/// Monday through Friday
pub const DEFAULT_WEEKDAYS: [i32; 5] = [1, 2, 3, 4, 5];

/// Campaign message status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Queued,
    Sending,
    Sent,
    Failed,
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageStatus::Queued => write!(f, "queued"),
            MessageStatus::Sending => write!(f, "sending"),
            MessageStatus::Sent => write!(f, "sent"),
            MessageStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(MessageStatus::Queued),
            "sending" => Ok(MessageStatus::Sending),
            "sent" => Ok(MessageStatus::Sent),
            "failed" => Ok(MessageStatus::Failed),
            _ => Err(format!("Invalid message status: {}", s)),
        }
    }
}

/// One planned delivery to one recipient within a campaign
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CampaignMessage {
    pub id: CampaignMessageId,
    /// Insertion order within the queue
    pub seq: i64,
    pub campaign_id: CampaignId,
    pub tenant_id: TenantId,
    pub contact_id: ContactId,
    /// Destination phone number
    pub recipient: String,
    /// Rendered message text
    pub content: String,
    pub media_url: Option<String>,
    pub status: String,
    pub instance_id: Option<InstanceId>,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub provider_message_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CampaignMessage {
    /// Get status enum
    pub fn status_enum(&self) -> Option<MessageStatus> {
        self.status.parse().ok()
    }
}

/// Input for queueing one recipient
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCampaignMessage {
    pub contact_id: ContactId,
    pub recipient: String,
    pub content: String,
    pub media_url: Option<String>,
}

/// Connectivity status of a sending device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Connected,
    Disconnected,
    Connecting,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceStatus::Connected => write!(f, "connected"),
            InstanceStatus::Disconnected => write!(f, "disconnected"),
            InstanceStatus::Connecting => write!(f, "connecting"),
        }
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connected" => Ok(InstanceStatus::Connected),
            "disconnected" => Ok(InstanceStatus::Disconnected),
            "connecting" => Ok(InstanceStatus::Connecting),
            _ => Err(format!("Invalid instance status: {}", s)),
        }
    }
}

/// Sending device ("instance")
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub tenant_id: TenantId,
    /// Name the gateway knows the device by
    pub name: String,
    pub status: String,
    pub warmup_level: i32,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    /// Only connected devices are eligible for dispatch
    pub fn is_connected(&self) -> bool {
        matches!(self.status.parse(), Ok(InstanceStatus::Connected))
    }
}

/// Campaign message counts by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCounts {
    pub queued: i64,
    pub sending: i64,
    pub sent: i64,
    pub failed: i64,
}

impl MessageCounts {
    pub fn total(&self) -> i64 {
        self.queued + self.sending + self.sent + self.failed
    }

    /// Nothing left to send or reclaim
    pub fn is_drained(&self) -> bool {
        self.queued == 0 && self.sending == 0
    }
}

/// Outcome of requeueing orphaned `sending` rows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclaimOutcome {
    /// Rows reset to `queued`
    pub requeued: u64,
    /// Rows that hit the attempt limit and were marked `failed`
    pub exhausted: u64,
}

/// Campaign statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignStats {
    pub campaign_id: CampaignId,
    pub status: String,
    pub total_recipients: i32,
    pub queued: i64,
    pub sending: i64,
    pub sent: i64,
    pub failed: i64,
    pub sent_today: i32,
    pub progress_percentage: f64,
    pub retry_at: Option<DateTime<Utc>>,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}
