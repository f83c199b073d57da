//! Campaign handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use zapcast_common::types::{InstanceId, SendingMode};
use zapcast_storage::models::{Campaign, CampaignStats, CreateCampaign, NewCampaignMessage};

use crate::auth::{AppState, Tenant};
use crate::error::{ApiError, ApiResult};

/// Campaign response
#[derive(Debug, Serialize, Deserialize)]
pub struct CampaignResponse {
    pub id: Uuid,
    pub name: String,
    pub status: String,
    pub instance_ids: Vec<InstanceId>,
    pub sending_mode: String,
    pub message_interval_min: i32,
    pub message_interval_max: i32,
    pub daily_limit: Option<i32>,
    pub allowed_start_hour: i32,
    pub allowed_end_hour: i32,
    pub allowed_days: Vec<i32>,
    pub timezone: String,
    pub total_recipients: i32,
    pub sent_count: i32,
    pub failed_count: i32,
    pub sent_today: i32,
    pub sent_today_date: Option<NaiveDate>,
    pub progress_percentage: f64,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub retry_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Campaign> for CampaignResponse {
    fn from(c: Campaign) -> Self {
        let progress = c.progress_percentage();
        Self {
            id: c.id,
            name: c.name,
            status: c.status,
            instance_ids: c.instance_ids,
            sending_mode: c.sending_mode,
            message_interval_min: c.message_interval_min,
            message_interval_max: c.message_interval_max,
            daily_limit: c.daily_limit,
            allowed_start_hour: c.allowed_start_hour,
            allowed_end_hour: c.allowed_end_hour,
            allowed_days: c.allowed_days,
            timezone: c.timezone,
            total_recipients: c.total_recipients,
            sent_count: c.sent_count,
            failed_count: c.failed_count,
            sent_today: c.sent_today,
            sent_today_date: c.sent_today_date,
            progress_percentage: progress,
            scheduled_at: c.scheduled_at,
            retry_at: c.retry_at,
            started_at: c.started_at,
            completed_at: c.completed_at,
            failure_reason: c.failure_reason,
            created_at: c.created_at,
            updated_at: c.updated_at,
        }
    }
}

/// Request body for creating a campaign
#[derive(Debug, Deserialize)]
pub struct CreateCampaignRequest {
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

/// Request body for queueing recipients
#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub recipients: Vec<NewCampaignMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub added: u64,
}

/// Request body for scheduling a campaign
#[derive(Debug, Deserialize)]
pub struct ScheduleCampaignRequest {
    pub scheduled_at: DateTime<Utc>,
}

/// Acknowledgement of an asynchronous dispatch run
#[derive(Debug, Serialize, Deserialize)]
pub struct RunAccepted {
    pub campaign_id: Uuid,
    pub status: String,
}

/// Create a new campaign
///
/// POST /api/v1/campaigns
pub async fn create_campaign(
    State(state): State<Arc<AppState>>,
    Tenant(tenant_id): Tenant,
    Json(input): Json<CreateCampaignRequest>,
) -> ApiResult<(StatusCode, Json<CampaignResponse>)> {
    if input.name.trim().is_empty() {
        return Err(ApiError::BadRequest("Campaign name is required".to_string()));
    }

    let campaign = state
        .manager
        .create_campaign(CreateCampaign {
            tenant_id,
            name: input.name,
            scheduled_at: input.scheduled_at,
            instance_ids: input.instance_ids,
            sending_mode: input.sending_mode,
            message_interval_min: input.message_interval_min,
            message_interval_max: input.message_interval_max,
            daily_limit: input.daily_limit,
            allowed_start_hour: input.allowed_start_hour,
            allowed_end_hour: input.allowed_end_hour,
            allowed_days: input.allowed_days,
            timezone: input.timezone,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(CampaignResponse::from(campaign))))
}

/// Get a campaign by ID
///
/// GET /api/v1/campaigns/:campaign_id
pub async fn get_campaign(
    State(state): State<Arc<AppState>>,
    Tenant(tenant_id): Tenant,
    Path(campaign_id): Path<Uuid>,
) -> ApiResult<Json<CampaignResponse>> {
    let campaign = state.manager.get_campaign(tenant_id, campaign_id).await?;
    Ok(Json(CampaignResponse::from(campaign)))
}

/// Get campaign statistics
///
/// GET /api/v1/campaigns/:campaign_id/stats
pub async fn get_campaign_stats(
    State(state): State<Arc<AppState>>,
    Tenant(tenant_id): Tenant,
    Path(campaign_id): Path<Uuid>,
) -> ApiResult<Json<CampaignStats>> {
    let stats = state
        .manager
        .get_campaign_stats(tenant_id, campaign_id)
        .await?;
    Ok(Json(stats))
}

/// Queue recipients on a draft campaign
///
/// POST /api/v1/campaigns/:campaign_id/messages
pub async fn enqueue_recipients(
    State(state): State<Arc<AppState>>,
    Tenant(tenant_id): Tenant,
    Path(campaign_id): Path<Uuid>,
    Json(input): Json<EnqueueRequest>,
) -> ApiResult<Json<EnqueueResponse>> {
    let added = state
        .manager
        .enqueue_recipients(tenant_id, campaign_id, &input.recipients)
        .await?;
    Ok(Json(EnqueueResponse { added }))
}

/// Schedule a campaign
///
/// POST /api/v1/campaigns/:campaign_id/schedule
pub async fn schedule_campaign(
    State(state): State<Arc<AppState>>,
    Tenant(tenant_id): Tenant,
    Path(campaign_id): Path<Uuid>,
    Json(input): Json<ScheduleCampaignRequest>,
) -> ApiResult<Json<CampaignResponse>> {
    let campaign = state
        .manager
        .schedule_campaign(tenant_id, campaign_id, input.scheduled_at)
        .await?;
    Ok(Json(CampaignResponse::from(campaign)))
}

/// Start sending a campaign now
///
/// POST /api/v1/campaigns/:campaign_id/start
pub async fn start_campaign(
    State(state): State<Arc<AppState>>,
    Tenant(tenant_id): Tenant,
    Path(campaign_id): Path<Uuid>,
) -> ApiResult<Json<CampaignResponse>> {
    let campaign = state.manager.start_campaign(tenant_id, campaign_id).await?;
    state.invoker.invoke(campaign_id).await?;
    Ok(Json(CampaignResponse::from(campaign)))
}

/// Cancel a campaign
///
/// POST /api/v1/campaigns/:campaign_id/cancel
pub async fn cancel_campaign(
    State(state): State<Arc<AppState>>,
    Tenant(tenant_id): Tenant,
    Path(campaign_id): Path<Uuid>,
) -> ApiResult<Json<CampaignResponse>> {
    let campaign = state
        .manager
        .cancel_campaign(tenant_id, campaign_id)
        .await?;
    Ok(Json(CampaignResponse::from(campaign)))
}

/// Run or resume the dispatch loop of a campaign
///
/// POST /api/v1/campaigns/:campaign_id/run
pub async fn run_campaign(
    State(state): State<Arc<AppState>>,
    Tenant(tenant_id): Tenant,
    Path(campaign_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<RunAccepted>)> {
    let campaign = state.manager.get_campaign(tenant_id, campaign_id).await?;
    state.invoker.invoke(campaign_id).await?;
    info!(campaign_id = %campaign_id, "Dispatch run requested");

    Ok((
        StatusCode::ACCEPTED,
        Json(RunAccepted {
            campaign_id,
            status: campaign.status,
        }),
    ))
}
