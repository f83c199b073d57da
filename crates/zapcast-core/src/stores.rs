//! Store handles shared by the engine components

use std::sync::Arc;
use zapcast_storage::{
    CampaignStore, DatabasePool, DbCampaignMessageRepository, DbCampaignRepository,
    DbInstanceRepository, InstanceRegistry, MemoryStore, MessageStore,
};

/// The three stores every engine component reads and writes
#[derive(Clone)]
pub struct Stores {
    pub campaigns: Arc<dyn CampaignStore>,
    pub messages: Arc<dyn MessageStore>,
    pub instances: Arc<dyn InstanceRegistry>,
}

impl Stores {
    /// PostgreSQL-backed stores
    pub fn postgres(pool: DatabasePool) -> Self {
        Self {
            campaigns: Arc::new(DbCampaignRepository::new(pool.clone())),
            messages: Arc::new(DbCampaignMessageRepository::new(pool.clone())),
            instances: Arc::new(DbInstanceRepository::new(pool)),
        }
    }

    /// All three stores backed by one in-memory store
    pub fn memory(store: MemoryStore) -> Self {
        Self {
            campaigns: Arc::new(store.clone()),
            messages: Arc::new(store.clone()),
            instances: Arc::new(store),
        }
    }
}
