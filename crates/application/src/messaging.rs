//! 私信服务

use std::sync::Arc;

use domain::{
    ChangeFeed, ChangeOp, ChatMessage, FeedFilter, FeedNotification, FeedSpec, FeedSubscription,
    FeedTable, MessageGateway, NewMessage, UserId,
};
use tracing::{debug, info, warn};

use crate::error::ApplicationError;
use crate::state_store::StateStore;

pub struct MessagingServiceDependencies {
    pub store: Arc<StateStore>,
    pub messages: Arc<dyn MessageGateway>,
    pub feed: Arc<dyn ChangeFeed>,
}

pub struct MessagingService {
    deps: MessagingServiceDependencies,
}

impl MessagingService {
    pub fn new(deps: MessagingServiceDependencies) -> Self {
        Self { deps }
    }

    fn me(&self) -> Result<UserId, ApplicationError> {
        self.deps
            .store
            .user_id()
            .ok_or(ApplicationError::NotAuthenticated)
    }

    pub async fn send_message(
        &self,
        receiver_id: UserId,
        content: &str,
    ) -> Result<ChatMessage, ApplicationError> {
        let sender_id = self.me()?;
        let message = NewMessage::new(sender_id, receiver_id, content)?;

        let sent = self
            .deps
            .messages
            .send_message(message)
            .await
            .map_err(|err| ApplicationError::persistence("message", err))?;
        debug!(
            sender_id = %sender_id,
            receiver_id = %receiver_id,
            message_id = %sent.id,
            "私信已发送"
        );
        Ok(sent)
    }

    /// 与对方之间的全部私信，按创建时间升序
    pub async fn get_messages(&self, other: UserId) -> Result<Vec<ChatMessage>, ApplicationError> {
        let me = self.me()?;
        let mut messages = self
            .deps
            .messages
            .get_messages(me, other)
            .await
            .map_err(|err| ApplicationError::persistence("message history", err))?;
        messages.sort_by_key(|message| message.created_at);
        Ok(messages)
    }

    /// 订阅发给自己的新私信；没有可解析内容的通知会被忽略
    pub async fn subscribe_to_messages<F>(
        &self,
        on_message: F,
    ) -> Result<Box<dyn FeedSubscription>, ApplicationError>
    where
        F: Fn(ChatMessage) + Send + Sync + 'static,
    {
        let me = self.me()?;
        let spec = FeedSpec::filtered(FeedTable::Messages, FeedFilter::equals("receiver_id", me));

        let handler = Arc::new(move |notification: FeedNotification| {
            if notification.op != ChangeOp::Insert {
                return;
            }
            let Some(record) = notification.record else {
                debug!("私信通知没有携带内容，忽略");
                return;
            };
            match serde_json::from_value::<ChatMessage>(record) {
                Ok(message) if message.receiver_id == me => on_message(message),
                Ok(_) => {}
                Err(err) => warn!(error = %err, "无法解析私信通知"),
            }
        });

        let subscription = self
            .deps
            .feed
            .subscribe(spec, handler)
            .await
            .map_err(ApplicationError::Feed)?;
        info!(user_id = %me, "已订阅私信");
        Ok(subscription)
    }
}
