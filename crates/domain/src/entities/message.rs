//! 私信实体定义

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{DomainError, DomainResult};
use crate::value_objects::{Timestamp, UserId};

/// 私信内容最大长度
pub const MAX_MESSAGE_LENGTH: usize = 2000;

/// 已持久化的私信
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub created_at: Timestamp,
}

/// 待发送的私信
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
}

impl NewMessage {
    /// 创建经过校验的私信
    pub fn new(
        sender_id: UserId,
        receiver_id: UserId,
        content: impl Into<String>,
    ) -> DomainResult<Self> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(DomainError::validation_error("content", "不能为空"));
        }
        if content.chars().count() > MAX_MESSAGE_LENGTH {
            return Err(DomainError::validation_error("content", "内容过长"));
        }
        if sender_id == receiver_id {
            return Err(DomainError::validation_error("receiver_id", "不能给自己发送私信"));
        }
        Ok(Self {
            sender_id,
            receiver_id,
            content,
        })
    }
}

impl ChatMessage {
    /// 是否属于两人之间的对话
    pub fn is_between(&self, a: UserId, b: UserId) -> bool {
        (self.sender_id == a && self.receiver_id == b) || (self.sender_id == b && self.receiver_id == a)
    }
}
