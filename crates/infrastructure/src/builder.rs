use std::sync::Arc;
use std::time::Duration;

use config::{AppConfig, ConfigError};
use domain::{
    AuthGateway, ChangeFeed, DiscoveryGateway, GatewayError, ImageHost, ImageHostError,
    MessageGateway, PresenceGateway, ProfileGateway,
};
use thiserror::Error;
use tracing::info;

use crate::image_host::HttpImageHost;
use crate::memory::MemoryClient;
use crate::realtime::RealtimeChangeFeed;
use crate::rest::RestGateway;
use crate::tokens::SessionTokens;

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("backend client error: {0}")]
    Gateway(#[from] GatewayError),
    #[error("image host client error: {0}")]
    ImageHost(#[from] ImageHostError),
}

/// 应用层需要的全部外部协作方
#[derive(Clone)]
pub struct Infrastructure {
    pub auth: Arc<dyn AuthGateway>,
    pub profiles: Arc<dyn ProfileGateway>,
    pub presence: Arc<dyn PresenceGateway>,
    pub discovery: Arc<dyn DiscoveryGateway>,
    pub messages: Arc<dyn MessageGateway>,
    pub feed: Arc<dyn ChangeFeed>,
    pub image_host: Arc<dyn ImageHost>,
}

impl Infrastructure {
    /// 连接托管后端：REST 网关与实时订阅共享同一份会话令牌
    pub fn from_config(config: &AppConfig) -> Result<Self, InfrastructureError> {
        config.validate()?;

        let tokens = Arc::new(SessionTokens::new(
            config.backend.api_key.clone(),
            config.backend.access_token.clone(),
        ));
        let rest = Arc::new(RestGateway::new(&config.backend, Arc::clone(&tokens))?);
        let feed = Arc::new(RealtimeChangeFeed::new(
            &config.realtime_url(),
            Arc::clone(&tokens),
            Duration::from_secs(config.realtime.heartbeat_interval_secs),
        ));
        let image_host = Arc::new(HttpImageHost::new(
            config.image_host.clone(),
            Duration::from_secs(config.backend.request_timeout_secs),
        )?);

        info!(backend = %config.backend.url, "基础设施已初始化");
        Ok(Self {
            auth: rest.clone(),
            profiles: rest.clone(),
            presence: rest.clone(),
            discovery: rest.clone(),
            messages: rest,
            feed,
            image_host,
        })
    }

    /// 使用内存后端的客户端，图片托管由调用方提供
    pub fn in_memory(client: MemoryClient, image_host: Arc<dyn ImageHost>) -> Self {
        let client = Arc::new(client);
        Self {
            auth: client.clone(),
            profiles: client.clone(),
            presence: client.clone(),
            discovery: client.clone(),
            messages: client.clone(),
            feed: client,
            image_host,
        }
    }
}
