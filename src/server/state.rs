use axum::extract::FromRef;

use crate::batch::BatchJobManager;
use crate::cache::CacheService;
use crate::user::UserManager;
use std::sync::Arc;
use std::time::Instant;

use super::ServerConfig;

pub type GuardedUserManager = Arc<UserManager>;
pub type GuardedBatchJobManager = Arc<BatchJobManager>;
pub type GuardedCacheService = Arc<CacheService>;

#[derive(Clone)]
pub struct ServerState {
    pub config: ServerConfig,
    pub start_time: Instant,
    pub user_manager: GuardedUserManager,
    pub batch_manager: GuardedBatchJobManager,
    pub cache: GuardedCacheService,
    pub hash: String,
}

impl FromRef<ServerState> for ServerConfig {
    fn from_ref(input: &ServerState) -> Self {
        input.config.clone()
    }
}

impl FromRef<ServerState> for GuardedUserManager {
    fn from_ref(input: &ServerState) -> Self {
        input.user_manager.clone()
    }
}

impl FromRef<ServerState> for GuardedBatchJobManager {
    fn from_ref(input: &ServerState) -> Self {
        input.batch_manager.clone()
    }
}

impl FromRef<ServerState> for GuardedCacheService {
    fn from_ref(input: &ServerState) -> Self {
        input.cache.clone()
    }
}
