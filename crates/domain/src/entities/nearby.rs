//! 附近用户实体定义
//!
//! `NearbyRow` 是半径查询 RPC 的原始返回行，`NearbyEntity` 是补全默认值后的展示模型。
//! 两者都是临时数据，每次查询重新生成。

use serde::{Deserialize, Serialize};

use crate::entities::user::{initials_of, DEFAULT_BIO, DEFAULT_ICON};
use crate::value_objects::{Coordinates, UserId};

/// 附近用户未填写名称时的默认值
pub const ANONYMOUS_NAME: &str = "Anonymous";
/// 附近用户未填写角色时的默认值
pub const DEFAULT_NEARBY_ROLE: &str = "Professional";
/// 附近用户未填写兴趣时的默认标签
pub const DEFAULT_INTEREST: &str = "Networking";

/// 半径查询参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbyQuery {
    /// 查询中心点
    pub center: Coordinates,
    /// 查询半径（公里）
    pub radius_km: f64,
    /// 可选的自由文本过滤
    pub search_term: String,
}

/// 半径查询 RPC 返回的行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbyRow {
    pub id: UserId,
    #[serde(default, alias = "name")]
    pub full_name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default, alias = "avatar")]
    pub avatar_url: Option<String>,
    #[serde(alias = "lat")]
    pub latitude: f64,
    #[serde(alias = "lng")]
    pub longitude: f64,
    /// 由后端计算的距离
    pub distance_km: f64,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub interests: Option<Vec<String>>,
    #[serde(default)]
    pub phone: Option<String>,
}

/// 附近用户
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbyEntity {
    pub id: UserId,
    pub name: String,
    pub role: String,
    pub avatar_url: Option<String>,
    pub position: Coordinates,
    pub initials: String,
    pub icon: String,
    pub distance_km: f64,
    pub bio: String,
    pub interests: Vec<String>,
    pub phone: Option<String>,
}

impl NearbyEntity {
    /// 形如 `1.2km away` 的距离文本
    pub fn distance_label(&self) -> String {
        format!("{:.1}km away", self.distance_km)
    }
}

impl From<NearbyRow> for NearbyEntity {
    fn from(row: NearbyRow) -> Self {
        let name = row
            .full_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| ANONYMOUS_NAME.to_owned());
        let initials = initials_of(&name);

        Self {
            id: row.id,
            initials,
            name,
            role: row
                .role
                .unwrap_or_else(|| DEFAULT_NEARBY_ROLE.to_owned()),
            avatar_url: row.avatar_url,
            position: Coordinates {
                latitude: row.latitude,
                longitude: row.longitude,
            },
            icon: DEFAULT_ICON.to_owned(),
            distance_km: row.distance_km,
            bio: row.bio.unwrap_or_else(|| DEFAULT_BIO.to_owned()),
            interests: row
                .interests
                .unwrap_or_else(|| vec![DEFAULT_INTEREST.to_owned()]),
            phone: row.phone,
        }
    }
}
