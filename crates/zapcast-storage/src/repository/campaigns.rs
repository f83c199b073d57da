//! Campaign repository

use async_trait::async_trait;
use chrono::NaiveDate;
use uuid::Uuid;
use zapcast_common::types::{CampaignId, TenantId, Timestamp};
use zapcast_common::Result;

use super::CampaignStore;
use crate::db::{db_err, DatabasePool};
use crate::models::{
    Campaign, CampaignStatus, CreateCampaign, DEFAULT_END_HOUR, DEFAULT_INTERVAL_MAX_SECS,
    DEFAULT_INTERVAL_MIN_SECS, DEFAULT_START_HOUR, DEFAULT_TIMEZONE, DEFAULT_WEEKDAYS,
};

/// Database campaign repository
#[derive(Clone)]
pub struct DbCampaignRepository {
    pool: DatabasePool,
}

impl DbCampaignRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CampaignStore for DbCampaignRepository {
    async fn create(&self, input: CreateCampaign, now: Timestamp) -> Result<Campaign> {
        let id = Uuid::now_v7();

        sqlx::query_as::<_, Campaign>(
            r#"
            INSERT INTO campaigns (
                id, tenant_id, name, status, scheduled_at, instance_ids, sending_mode,
                message_interval_min, message_interval_max, daily_limit,
                allowed_start_hour, allowed_end_hour, allowed_days, timezone,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, 'draft', $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $14)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(input.tenant_id)
        .bind(&input.name)
        .bind(input.scheduled_at)
        .bind(&input.instance_ids)
        .bind(input.sending_mode.to_string())
        .bind(input.message_interval_min.unwrap_or(DEFAULT_INTERVAL_MIN_SECS))
        .bind(input.message_interval_max.unwrap_or(DEFAULT_INTERVAL_MAX_SECS))
        .bind(input.daily_limit)
        .bind(input.allowed_start_hour.unwrap_or(DEFAULT_START_HOUR))
        .bind(input.allowed_end_hour.unwrap_or(DEFAULT_END_HOUR))
        .bind(
            input
                .allowed_days
                .clone()
                .unwrap_or_else(|| DEFAULT_WEEKDAYS.to_vec()),
        )
        .bind(input.timezone.as_deref().unwrap_or(DEFAULT_TIMEZONE))
        .bind(now)
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>> {
        sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn get_by_tenant(
        &self,
        tenant_id: TenantId,
        id: CampaignId,
    ) -> Result<Option<Campaign>> {
        sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE id = $1 AND tenant_id = $2")
            .bind(id)
            .bind(tenant_id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn transition(
        &self,
        id: CampaignId,
        from: CampaignStatus,
        to: CampaignStatus,
        now: Timestamp,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns SET
                status = $3,
                started_at = CASE WHEN $3 = 'sending' THEN COALESCE(started_at, $4) ELSE started_at END,
                completed_at = CASE WHEN $3 IN ('completed', 'cancelled', 'failed') THEN $4 ELSE completed_at END,
                retry_at = NULL,
                updated_at = $4
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(from.to_string())
        .bind(to.to_string())
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn schedule(
        &self,
        id: CampaignId,
        scheduled_at: Timestamp,
        now: Timestamp,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns SET status = 'scheduled', scheduled_at = $2, updated_at = $3
            WHERE id = $1 AND status = 'draft'
            "#,
        )
        .bind(id)
        .bind(scheduled_at)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn fail(
        &self,
        id: CampaignId,
        from: CampaignStatus,
        reason: &str,
        now: Timestamp,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns SET
                status = 'failed',
                failure_reason = $3,
                completed_at = $4,
                retry_at = NULL,
                updated_at = $4
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(from.to_string())
        .bind(reason)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_retry_at(
        &self,
        id: CampaignId,
        retry_at: Timestamp,
        now: Timestamp,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns SET retry_at = $2, updated_at = $3
            WHERE id = $1 AND status = 'sending'
            "#,
        )
        .bind(id)
        .bind(retry_at)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn clear_retry_at(
        &self,
        id: CampaignId,
        expected: Timestamp,
        now: Timestamp,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns SET retry_at = NULL, updated_at = $3
            WHERE id = $1 AND status = 'sending' AND retry_at = $2
            "#,
        )
        .bind(id)
        .bind(expected)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_next_send_at(
        &self,
        id: CampaignId,
        at: Timestamp,
        now: Timestamp,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns SET next_send_at = $2, updated_at = $3
            WHERE id = $1 AND status = 'sending'
            "#,
        )
        .bind(id)
        .bind(at)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_sent(
        &self,
        id: CampaignId,
        local_date: NaiveDate,
        now: Timestamp,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns SET
                sent_count = sent_count + 1,
                sent_today = CASE WHEN sent_today_date = $2 THEN sent_today + 1 ELSE 1 END,
                sent_today_date = $2,
                updated_at = $3
            WHERE id = $1 AND sent_count < total_recipients
            "#,
        )
        .bind(id)
        .bind(local_date)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn add_failed(&self, id: CampaignId, count: i32, now: Timestamp) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE campaigns SET failed_count = failed_count + $2, updated_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(count)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn touch(&self, id: CampaignId, now: Timestamp) -> Result<bool> {
        let result =
            sqlx::query("UPDATE campaigns SET updated_at = $2 WHERE id = $1 AND status = 'sending'")
                .bind(id)
                .bind(now)
                .execute(self.pool.pool())
                .await
                .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_total_recipients(
        &self,
        id: CampaignId,
        total: i32,
        now: Timestamp,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns SET total_recipients = $2, updated_at = $3
            WHERE id = $1 AND status = 'draft'
            "#,
        )
        .bind(id)
        .bind(total)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_due_scheduled(&self, now: Timestamp) -> Result<Vec<Campaign>> {
        sqlx::query_as::<_, Campaign>(
            r#"
            SELECT * FROM campaigns
            WHERE status = 'scheduled' AND scheduled_at IS NOT NULL AND scheduled_at <= $1
            ORDER BY scheduled_at ASC
            "#,
        )
        .bind(now)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn list_due_retries(&self, now: Timestamp) -> Result<Vec<Campaign>> {
        sqlx::query_as::<_, Campaign>(
            r#"
            SELECT * FROM campaigns
            WHERE status = 'sending' AND retry_at IS NOT NULL AND retry_at <= $1
            ORDER BY retry_at ASC
            "#,
        )
        .bind(now)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn list_stalled(&self, cutoff: Timestamp) -> Result<Vec<Campaign>> {
        sqlx::query_as::<_, Campaign>(
            r#"
            SELECT * FROM campaigns
            WHERE status = 'sending' AND retry_at IS NULL AND updated_at < $1
            ORDER BY updated_at ASC
            "#,
        )
        .bind(cutoff)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }
}
