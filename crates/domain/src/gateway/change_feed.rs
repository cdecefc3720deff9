//! 变更订阅接口
//!
//! 后端在被监听的表发生变化时推送粗粒度通知，不保证携带可用的变更数据。

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::GatewayResult;

/// 可订阅的表
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedTable {
    Availability,
    Locations,
    Messages,
}

impl FeedTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedTable::Availability => "availability",
            FeedTable::Locations => "locations",
            FeedTable::Messages => "messages",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "availability" => Some(FeedTable::Availability),
            "locations" => Some(FeedTable::Locations),
            "messages" => Some(FeedTable::Messages),
            _ => None,
        }
    }
}

impl fmt::Display for FeedTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 行变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
    Unknown,
}

impl ChangeOp {
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_uppercase().as_str() {
            "INSERT" => ChangeOp::Insert,
            "UPDATE" => ChangeOp::Update,
            "DELETE" => ChangeOp::Delete,
            _ => ChangeOp::Unknown,
        }
    }
}

/// 等值过滤条件，例如 `receiver_id=eq.<id>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedFilter {
    pub column: String,
    pub value: String,
}

impl FeedFilter {
    pub fn equals(column: impl Into<String>, value: impl fmt::Display) -> Self {
        Self {
            column: column.into(),
            value: value.to_string(),
        }
    }

    pub fn matches(&self, record: &serde_json::Value) -> bool {
        match record.get(&self.column) {
            Some(serde_json::Value::String(s)) => s == &self.value,
            Some(other) => other.to_string() == self.value,
            None => false,
        }
    }
}

impl fmt::Display for FeedFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=eq.{}", self.column, self.value)
    }
}

/// 订阅说明
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSpec {
    pub table: FeedTable,
    pub filter: Option<FeedFilter>,
}

impl FeedSpec {
    /// 订阅整张表的任意变更
    pub fn table(table: FeedTable) -> Self {
        Self {
            table,
            filter: None,
        }
    }

    pub fn filtered(table: FeedTable, filter: FeedFilter) -> Self {
        Self {
            table,
            filter: Some(filter),
        }
    }
}

/// 一条变更通知
#[derive(Debug, Clone, PartialEq)]
pub struct FeedNotification {
    pub table: FeedTable,
    pub op: ChangeOp,
    /// 新行内容，部分后端或操作不会携带
    pub record: Option<serde_json::Value>,
}

/// 变更回调
pub type ChangeHandler = Arc<dyn Fn(FeedNotification) + Send + Sync>;

/// 一个已建立的订阅
pub trait FeedSubscription: Send {
    fn table(&self) -> FeedTable;

    /// 关闭订阅，之后不会再触发回调
    fn close(self: Box<Self>);
}

/// 变更订阅能力
#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(
        &self,
        spec: FeedSpec,
        on_change: ChangeHandler,
    ) -> GatewayResult<Box<dyn FeedSubscription>>;
}
