//! Instance (sending device) repository

use async_trait::async_trait;
use zapcast_common::types::InstanceId;
use zapcast_common::Result;

use super::InstanceRegistry;
use crate::db::{db_err, DatabasePool};
use crate::models::Instance;

/// Database instance repository
#[derive(Clone)]
pub struct DbInstanceRepository {
    pool: DatabasePool,
}

impl DbInstanceRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InstanceRegistry for DbInstanceRepository {
    async fn get_many(&self, ids: &[InstanceId]) -> Result<Vec<Instance>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        sqlx::query_as::<_, Instance>("SELECT * FROM instances WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(self.pool.pool())
            .await
            .map_err(db_err)
    }
}
