//! 附近在线用户同步系统核心领域模型
//!
//! 包含身份、资料、在线状态、位置、附近用户等核心实体，
//! 以及远端网关、变更订阅、图片托管、定位能力等外部协作方的接口定义。

pub mod entities;
pub mod errors;
pub mod gateway;
pub mod value_objects;

// 重新导出常用类型
pub use entities::*;
pub use errors::*;
pub use gateway::*;
pub use value_objects::*;
