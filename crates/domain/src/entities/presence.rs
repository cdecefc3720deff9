//! 在线状态与位置实体定义

use serde::{Deserialize, Serialize};

use crate::value_objects::{Coordinates, Timestamp};

/// 在线状态（"Live" 标志 + 最后活跃时间）
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Availability {
    /// 是否对附近的人可见
    pub is_available: bool,
    /// 最后活跃时间
    #[serde(default)]
    pub last_active_at: Option<Timestamp>,
}

/// 位置记录，只保留最新值
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub updated_at: Option<Timestamp>,
}

impl LocationRecord {
    pub fn new(coordinates: Coordinates, updated_at: Timestamp) -> Self {
        Self {
            latitude: coordinates.latitude,
            longitude: coordinates.longitude,
            updated_at: Some(updated_at),
        }
    }

    pub fn coordinates(&self) -> Coordinates {
        Coordinates {
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }
}
