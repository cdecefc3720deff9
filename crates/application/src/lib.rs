//! 应用层实现。
//!
//! 在线状态与附近发现的同步引擎：本地状态中心、事件中继与节流、
//! 持续定位与心跳、地图标记对账，以及串联它们的会话编排。
//! 所有外部协作方（远端后端、图片托管、定位能力）都通过领域层的接口注入。

pub mod callbacks;
pub mod clock;
pub mod discovery;
pub mod error;
pub mod event_bridge;
pub mod location_tracker;
pub mod markers;
pub mod messaging;
pub mod session;
pub mod state_store;
pub mod throttle;

#[cfg(test)]
pub(crate) mod test_support;

pub use callbacks::CallbackRegistry;
pub use clock::{Clock, SystemClock};
pub use discovery::{DiscoveryService, DiscoveryServiceDependencies};
pub use error::ApplicationError;
pub use event_bridge::{
    BridgeEvent, EventBridge, EventKind, InvalidationSource, ListenerId, NetworkChange,
    LIVE_FEED_TABLES,
};
pub use location_tracker::{LocationTracker, TrackingStart, DEFAULT_HEARTBEAT_INTERVAL};
pub use markers::{
    MarkerId, MarkerReconciler, MarkerSurface, MarkerView, ReconcileReport, SELF_LABEL,
};
pub use messaging::{MessagingService, MessagingServiceDependencies};
pub use session::{PresenceSession, PresenceSessionDependencies};
pub use state_store::{StateListener, StateStore, StateStoreDependencies, Subscription};
pub use throttle::{should_emit, LeadingEdgeThrottle};
