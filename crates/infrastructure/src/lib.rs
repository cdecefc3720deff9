//! 基础设施层实现。
//!
//! 提供托管后端的 REST 网关与实时变更订阅、图片托管客户端、定位来源，
//! 以及用于演示和测试的内存后端，实现领域层定义的接口。

pub mod builder;
pub mod image_host;
pub mod memory;
pub mod position;
pub mod realtime;
pub mod rest;
pub mod retry;
pub mod tokens;

pub use builder::{Infrastructure, InfrastructureError};
pub use image_host::HttpImageHost;
pub use memory::{MemoryBackend, MemoryClient, MemorySubscription};
pub use position::{ChannelPositionSource, UnsupportedPositionSource};
pub use realtime::{RealtimeChangeFeed, RealtimeSubscription};
pub use rest::RestGateway;
pub use retry::{retry_async, Backoff, RetryConfig};
pub use tokens::{Session, SessionTokens};
