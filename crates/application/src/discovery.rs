//! 附近发现
//!
//! 对远端半径查询的薄封装。查询中心点每次都从远端重新读取，不使用本地乐观写入的位置。
//! 发现结果只是参考数据：任何失败都降级为空列表。

use std::sync::Arc;

use domain::{DiscoveryGateway, NearbyEntity, NearbyQuery, PresenceGateway};
use tracing::{debug, warn};

use crate::state_store::StateStore;

pub struct DiscoveryServiceDependencies {
    pub store: Arc<StateStore>,
    pub presence: Arc<dyn PresenceGateway>,
    pub discovery: Arc<dyn DiscoveryGateway>,
}

pub struct DiscoveryService {
    deps: DiscoveryServiceDependencies,
    radius_km: f64,
}

impl DiscoveryService {
    pub fn new(deps: DiscoveryServiceDependencies, radius_km: f64) -> Self {
        Self { deps, radius_km }
    }

    pub fn radius_km(&self) -> f64 {
        self.radius_km
    }

    /// 查询半径内在线的其他用户；不在线、未登录或位置未知时返回空列表且不调用远端
    pub async fn nearby_users(&self, search_term: &str) -> Vec<NearbyEntity> {
        if !self.deps.store.is_live() {
            return Vec::new();
        }
        let Some(user_id) = self.deps.store.user_id() else {
            return Vec::new();
        };

        let center = match self.deps.presence.get_location(user_id).await {
            Ok(Some(record)) => record.coordinates(),
            Ok(None) => {
                debug!(user_id = %user_id, "远端没有位置记录，跳过发现");
                return Vec::new();
            }
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "读取位置失败，跳过发现");
                return Vec::new();
            }
        };

        let query = NearbyQuery {
            center,
            radius_km: self.radius_km,
            search_term: search_term.trim().to_owned(),
        };
        match self.deps.discovery.nearby(query).await {
            Ok(rows) => {
                let entities: Vec<NearbyEntity> = rows
                    .into_iter()
                    .filter(|row| row.id != user_id)
                    .map(NearbyEntity::from)
                    .collect();
                debug!(
                    user_id = %user_id,
                    count = entities.len(),
                    radius_km = self.radius_km,
                    "附近发现完成"
                );
                entities
            }
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "附近发现失败，返回空结果");
                Vec::new()
            }
        }
    }
}
