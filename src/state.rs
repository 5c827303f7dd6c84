// src/state.rs
// Application state shared across handlers.

use crate::chats::ChatManager;
use crate::config::AppConfig;
use crate::containers::ContainerSelector;
use crate::engine::Executor;
use crate::profiles::{ProfileLock, ProfileManager};
use crate::prompts::PromptRegistry;
use crate::storage::Store;
use crate::upstream::{ContainerIoLogger, UpstreamPool};
use anyhow::Result;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Store,
    pub pool: Arc<UpstreamPool>,
    pub selector: Arc<ContainerSelector>,
    pub profiles: Arc<ProfileManager>,
    pub prompts: Arc<PromptRegistry>,
    pub profile_lock: Arc<ProfileLock>,
    pub executor: Arc<Executor>,
}

impl AppState {
    /// Wire the whole service against an already-open store. Seeds socks and
    /// profiles from the config.
    pub async fn new(config: AppConfig, store: Store) -> Result<Self> {
        let io_log = Arc::new(ContainerIoLogger::from_config(&config.container_io_log));
        let pool = Arc::new(UpstreamPool::from_config(&config.containers, io_log)?);
        let selector = Arc::new(ContainerSelector::new(Arc::clone(&pool), store.clone()));
        let prompts = Arc::new(PromptRegistry::new(&config));
        let profile_lock = Arc::new(ProfileLock::new());

        let profiles = Arc::new(ProfileManager::new(store.clone()));
        profiles.seed_from_config(&config).await?;

        let chats = ChatManager::new(store.clone(), config.chat_root_url.clone());
        let executor = Arc::new(Executor::new(
            store.clone(),
            Arc::clone(&pool),
            Arc::clone(&selector),
            Arc::clone(&profiles),
            Arc::clone(&prompts),
            Arc::clone(&profile_lock),
            chats,
            config.allow_socks_override,
        ));

        Ok(Self {
            config: Arc::new(config),
            store,
            pool,
            selector,
            profiles,
            prompts,
            profile_lock,
            executor,
        })
    }
}
