//! 用户身份与资料实体定义
//!
//! `AuthUser` 来自认证服务，`Profile` 来自资料表，两者合并为对外展示的 `CurrentUser`。

use serde::{Deserialize, Serialize};

use crate::value_objects::{Coordinates, Timestamp, UserId};

/// 未填写角色时的默认值
pub const DEFAULT_ROLE: &str = "Member";
/// 未填写简介时的默认值
pub const DEFAULT_BIO: &str = "Open to meeting people nearby";
/// 地图与列表中使用的默认图标
pub const DEFAULT_ICON: &str = "👤";

/// 认证服务返回的身份
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    /// 用户唯一ID
    pub id: UserId,
    /// 登录邮箱
    pub email: String,
}

/// 资料表中的用户资料
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Profile {
    /// 用户唯一ID
    pub id: UserId,
    /// 全名
    #[serde(default)]
    pub full_name: Option<String>,
    /// 头像地址
    #[serde(default)]
    pub avatar_url: Option<String>,
    /// 职业角色
    #[serde(default)]
    pub role: Option<String>,
    /// 个人简介
    #[serde(default)]
    pub bio: Option<String>,
    /// 兴趣标签
    #[serde(default)]
    pub interests: Option<Vec<String>>,
    /// 联系电话
    #[serde(default)]
    pub phone: Option<String>,
    /// 最后更新时间
    #[serde(default)]
    pub updated_at: Option<Timestamp>,
}

/// 资料更新字段，未设置的字段不会写入远端
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interests: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl ProfileUpdate {
    /// 仅更新头像
    pub fn avatar(url: impl Into<String>) -> Self {
        Self {
            avatar_url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// 身份与资料合并后的当前用户视图
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentUser {
    pub id: UserId,
    pub email: String,
    /// 显示名称，缺省为邮箱前缀
    pub name: String,
    /// 名称前两个字符的大写形式
    pub initials: String,
    pub avatar_url: Option<String>,
    pub role: String,
    pub bio: String,
    pub interests: Vec<String>,
    pub phone: Option<String>,
    pub icon: String,
    /// 最后已知位置，未知时为 (0, 0)
    pub position: Coordinates,
}

impl CurrentUser {
    /// 合并认证身份、资料与最后已知位置
    pub fn compose(auth: &AuthUser, profile: Option<&Profile>, location: Option<Coordinates>) -> Self {
        let full_name = profile
            .and_then(|p| p.full_name.as_deref())
            .map(str::trim)
            .filter(|name| !name.is_empty());

        let name = full_name
            .map(str::to_owned)
            .unwrap_or_else(|| auth.email.split('@').next().unwrap_or_default().to_owned());
        let initials = initials_of(full_name.unwrap_or(&auth.email));

        Self {
            id: auth.id,
            email: auth.email.clone(),
            name,
            initials,
            avatar_url: profile.and_then(|p| p.avatar_url.clone()),
            role: profile
                .and_then(|p| p.role.clone())
                .unwrap_or_else(|| DEFAULT_ROLE.to_owned()),
            bio: profile
                .and_then(|p| p.bio.clone())
                .unwrap_or_else(|| DEFAULT_BIO.to_owned()),
            interests: profile
                .and_then(|p| p.interests.clone())
                .unwrap_or_default(),
            phone: profile.and_then(|p| p.phone.clone()),
            icon: DEFAULT_ICON.to_owned(),
            position: location.unwrap_or_default(),
        }
    }
}

/// 取文本前两个字符并转为大写
pub fn initials_of(text: &str) -> String {
    text.trim().chars().take(2).collect::<String>().to_uppercase()
}
