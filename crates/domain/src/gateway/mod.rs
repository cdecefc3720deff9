//! 远端网关接口定义
//!
//! 后端是身份、在线状态与位置的最终数据源。这里只定义契约，
//! 具体实现（HTTP、内存）位于基础设施层。

use async_trait::async_trait;

use crate::entities::{
    Availability, AuthUser, ChatMessage, LocationRecord, NearbyQuery, NearbyRow, NewMessage,
    Profile, ProfileUpdate,
};
use crate::errors::GatewayResult;
use crate::value_objects::{Coordinates, Timestamp, UserId};

pub mod change_feed;
pub mod device;

pub use change_feed::{
    ChangeFeed, ChangeHandler, ChangeOp, FeedFilter, FeedNotification, FeedSpec, FeedSubscription,
    FeedTable,
};
pub use device::{ImageHost, ImageUpload, PositionSource, PositionStream};

#[cfg(feature = "testing")]
pub use change_feed::MockChangeFeed;
#[cfg(feature = "testing")]
pub use device::{MockImageHost, MockPositionSource};

/// 认证接口
#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait AuthGateway: Send + Sync {
    /// 注册账号，需要邮件验证，不建立会话
    async fn sign_up(&self, email: &str, password: &str, full_name: &str) -> GatewayResult<()>;

    /// 邮箱密码登录
    async fn login(&self, email: &str, password: &str) -> GatewayResult<AuthUser>;

    /// 注销当前会话
    async fn logout(&self) -> GatewayResult<()>;

    /// 获取已持久化的会话
    async fn get_session(&self) -> GatewayResult<Option<AuthUser>>;
}

/// 资料读写接口
#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait ProfileGateway: Send + Sync {
    async fn get_profile(&self, id: UserId) -> GatewayResult<Option<Profile>>;

    async fn update_profile(
        &self,
        id: UserId,
        fields: ProfileUpdate,
        updated_at: Timestamp,
    ) -> GatewayResult<()>;
}

/// 在线状态与位置读写接口
#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait PresenceGateway: Send + Sync {
    async fn get_availability(&self, id: UserId) -> GatewayResult<Option<Availability>>;

    async fn set_availability(
        &self,
        id: UserId,
        is_available: bool,
        at: Timestamp,
    ) -> GatewayResult<()>;

    /// 只刷新最后活跃时间，不修改在线标志
    async fn heartbeat(&self, id: UserId, at: Timestamp) -> GatewayResult<()>;

    async fn get_location(&self, id: UserId) -> GatewayResult<Option<LocationRecord>>;

    async fn set_location(
        &self,
        id: UserId,
        position: Coordinates,
        at: Timestamp,
    ) -> GatewayResult<()>;
}

/// 半径查询接口
#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait DiscoveryGateway: Send + Sync {
    /// 返回中心点半径内的在线用户（不含自己），距离由后端计算
    async fn nearby(&self, query: NearbyQuery) -> GatewayResult<Vec<NearbyRow>>;
}

/// 私信接口
#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait MessageGateway: Send + Sync {
    async fn send_message(&self, message: NewMessage) -> GatewayResult<ChatMessage>;

    /// 两人之间的全部私信，按创建时间升序
    async fn get_messages(&self, a: UserId, b: UserId) -> GatewayResult<Vec<ChatMessage>>;
}
