//! 领域实体定义
//!
//! 包含系统的核心实体：身份与资料、在线状态、位置、附近用户、私信。

pub mod message;
pub mod nearby;
pub mod presence;
pub mod user;

// 重新导出核心实体
pub use message::{ChatMessage, NewMessage};
pub use nearby::{NearbyEntity, NearbyQuery, NearbyRow};
pub use presence::{Availability, LocationRecord};
pub use user::{initials_of, AuthUser, CurrentUser, Profile, ProfileUpdate};
