//! Campaign message repository

use async_trait::async_trait;
use sqlx::Row;
use uuid::Uuid;
use zapcast_common::types::{CampaignId, CampaignMessageId, InstanceId, TenantId, Timestamp};
use zapcast_common::Result;

use super::MessageStore;
use crate::db::{db_err, DatabasePool};
use crate::models::{CampaignMessage, MessageCounts, NewCampaignMessage, ReclaimOutcome};

/// Reason stored on rows failed by the reclaim limit
pub const RECLAIM_LIMIT_ERROR: &str = "exceeded reclaim limit";

/// Database campaign message repository
#[derive(Clone)]
pub struct DbCampaignMessageRepository {
    pool: DatabasePool,
}

impl DbCampaignMessageRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageStore for DbCampaignMessageRepository {
    async fn enqueue(
        &self,
        campaign_id: CampaignId,
        tenant_id: TenantId,
        messages: &[NewCampaignMessage],
        now: Timestamp,
    ) -> Result<u64> {
        let mut count = 0u64;
        let mut tx = self.pool.pool().begin().await.map_err(db_err)?;

        for input in messages {
            let result = sqlx::query(
                r#"
                INSERT INTO campaign_messages (
                    id, campaign_id, tenant_id, contact_id, recipient, content, media_url,
                    status, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, 'queued', $8, $8)
                ON CONFLICT (campaign_id, contact_id) DO NOTHING
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(campaign_id)
            .bind(tenant_id)
            .bind(input.contact_id)
            .bind(&input.recipient)
            .bind(&input.content)
            .bind(&input.media_url)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            count += result.rows_affected();
        }

        tx.commit().await.map_err(db_err)?;
        Ok(count)
    }

    async fn get(&self, id: CampaignMessageId) -> Result<Option<CampaignMessage>> {
        sqlx::query_as::<_, CampaignMessage>("SELECT * FROM campaign_messages WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn list_by_campaign(&self, campaign_id: CampaignId) -> Result<Vec<CampaignMessage>> {
        sqlx::query_as::<_, CampaignMessage>(
            "SELECT * FROM campaign_messages WHERE campaign_id = $1 ORDER BY seq ASC",
        )
        .bind(campaign_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn next_queued(&self, campaign_id: CampaignId) -> Result<Option<CampaignMessage>> {
        sqlx::query_as::<_, CampaignMessage>(
            r#"
            SELECT * FROM campaign_messages
            WHERE campaign_id = $1 AND status = 'queued'
            ORDER BY seq ASC
            LIMIT 1
            "#,
        )
        .bind(campaign_id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn claim(
        &self,
        id: CampaignMessageId,
        instance_id: InstanceId,
        now: Timestamp,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaign_messages SET
                status = 'sending',
                instance_id = $2,
                attempts = attempts + 1,
                updated_at = $3
            WHERE id = $1 AND status = 'queued'
            "#,
        )
        .bind(id)
        .bind(instance_id)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_sent(
        &self,
        id: CampaignMessageId,
        provider_message_id: Option<&str>,
        now: Timestamp,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaign_messages SET
                status = 'sent',
                provider_message_id = $2,
                last_error = NULL,
                sent_at = $3,
                updated_at = $3
            WHERE id = $1 AND status = 'sending'
            "#,
        )
        .bind(id)
        .bind(provider_message_id)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_failed(
        &self,
        id: CampaignMessageId,
        error: &str,
        now: Timestamp,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaign_messages SET status = 'failed', last_error = $2, updated_at = $3
            WHERE id = $1 AND status = 'sending'
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_transient_error(
        &self,
        id: CampaignMessageId,
        error: &str,
        now: Timestamp,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE campaign_messages SET last_error = $2, updated_at = $3
            WHERE id = $1 AND status = 'sending'
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn counts(&self, campaign_id: CampaignId) -> Result<MessageCounts> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'queued') as queued,
                COUNT(*) FILTER (WHERE status = 'sending') as sending,
                COUNT(*) FILTER (WHERE status = 'sent') as sent,
                COUNT(*) FILTER (WHERE status = 'failed') as failed
            FROM campaign_messages
            WHERE campaign_id = $1
            "#,
        )
        .bind(campaign_id)
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(MessageCounts {
            queued: row.get::<Option<i64>, _>("queued").unwrap_or(0),
            sending: row.get::<Option<i64>, _>("sending").unwrap_or(0),
            sent: row.get::<Option<i64>, _>("sent").unwrap_or(0),
            failed: row.get::<Option<i64>, _>("failed").unwrap_or(0),
        })
    }

    async fn reclaim_orphans(
        &self,
        campaign_id: CampaignId,
        max_attempts: i32,
        now: Timestamp,
    ) -> Result<ReclaimOutcome> {
        let mut tx = self.pool.pool().begin().await.map_err(db_err)?;

        let exhausted = sqlx::query(
            r#"
            UPDATE campaign_messages SET status = 'failed', last_error = $3, updated_at = $4
            WHERE campaign_id = $1 AND status = 'sending' AND attempts >= $2
            "#,
        )
        .bind(campaign_id)
        .bind(max_attempts)
        .bind(RECLAIM_LIMIT_ERROR)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?
        .rows_affected();

        let requeued = sqlx::query(
            r#"
            UPDATE campaign_messages SET status = 'queued', instance_id = NULL, updated_at = $2
            WHERE campaign_id = $1 AND status = 'sending'
            "#,
        )
        .bind(campaign_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?
        .rows_affected();

        tx.commit().await.map_err(db_err)?;

        Ok(ReclaimOutcome {
            requeued,
            exhausted,
        })
    }
}
