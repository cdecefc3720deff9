//! 本地状态中心
//!
//! 当前身份、资料、在线标志与最后已知位置的唯一本地数据源。
//! 远端是最终权威：在线标志与资料在远端写入确认后通过重新拉取对齐，
//! 位置则保留乐观写入的本地值，不做回读。

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use domain::{
    AuthGateway, AuthUser, Availability, Coordinates, CurrentUser, ImageHost, ImageUpload,
    Profile, ProfileGateway, ProfileUpdate, PresenceGateway, UserEmail, UserId,
};
use tracing::{debug, info, warn};

use crate::callbacks::CallbackRegistry;
use crate::clock::Clock;
use crate::error::ApplicationError;

/// 状态订阅回调：(当前用户, 是否在线)
pub type StateListener = dyn Fn(Option<&CurrentUser>, bool) + Send + Sync;

pub struct StateStoreDependencies {
    pub auth: Arc<dyn AuthGateway>,
    pub profiles: Arc<dyn ProfileGateway>,
    pub presence: Arc<dyn PresenceGateway>,
    pub image_host: Arc<dyn ImageHost>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Default)]
struct SessionState {
    auth: Option<AuthUser>,
    profile: Option<Profile>,
    availability: Availability,
    location: Option<Coordinates>,
}

impl SessionState {
    fn user_id(&self) -> Option<UserId> {
        self.auth.as_ref().map(|auth| auth.id)
    }

    fn current_user(&self) -> Option<CurrentUser> {
        self.auth
            .as_ref()
            .map(|auth| CurrentUser::compose(auth, self.profile.as_ref(), self.location))
    }
}

/// 状态订阅句柄
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    registry: Weak<CallbackRegistry<StateListener>>,
}

impl Subscription {
    /// 注销订阅；可以在回调内部调用，登出后调用也是安全的
    pub fn unsubscribe(self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.remove(self.id),
            None => false,
        }
    }
}

pub struct StateStore {
    deps: StateStoreDependencies,
    state: Mutex<SessionState>,
    subscribers: Arc<CallbackRegistry<StateListener>>,
}

impl StateStore {
    pub fn new(deps: StateStoreDependencies) -> Self {
        Self {
            deps,
            state: Mutex::new(SessionState::default()),
            subscribers: Arc::new(CallbackRegistry::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.state().user_id()
    }

    /// 身份、资料与位置合并后的当前用户
    pub fn current_user(&self) -> Option<CurrentUser> {
        self.state().current_user()
    }

    pub fn profile(&self) -> Option<Profile> {
        self.state().profile.clone()
    }

    pub fn is_live(&self) -> bool {
        self.state().availability.is_available
    }

    pub fn availability(&self) -> Availability {
        self.state().availability
    }

    pub fn location(&self) -> Option<Coordinates> {
        self.state().location
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// 注册订阅，并立即以当前状态回调一次
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(Option<&CurrentUser>, bool) + Send + Sync + 'static,
    {
        let callback: Arc<StateListener> = Arc::new(callback);
        let id = self.subscribers.register(Arc::clone(&callback));

        let (user, is_live) = {
            let state = self.state();
            (state.current_user(), state.availability.is_available)
        };
        callback(user.as_ref(), is_live);

        Subscription {
            id,
            registry: Arc::downgrade(&self.subscribers),
        }
    }

    /// 以当前状态同步通知全部订阅者
    pub fn notify_subscribers(&self) {
        let (user, is_live) = {
            let state = self.state();
            (state.current_user(), state.availability.is_available)
        };
        let listeners = self.subscribers.snapshot();
        debug!(
            listeners = listeners.len(),
            is_live, "通知状态订阅者"
        );
        for listener in listeners {
            listener(user.as_ref(), is_live);
        }
    }

    /// 从已持久化的会话恢复身份
    pub async fn check_session(&self) -> Result<Option<CurrentUser>, ApplicationError> {
        let session = self
            .deps
            .auth
            .get_session()
            .await
            .map_err(ApplicationError::Auth)?;

        let Some(auth) = session else {
            self.state().auth = None;
            return Ok(None);
        };

        info!(user_id = %auth.id, "恢复已有会话");
        self.state().auth = Some(auth);
        self.fetch_profile().await;
        self.notify_subscribers();
        Ok(self.current_user())
    }

    /// 注册账号；需要邮件验证，不建立会话
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        full_name: &str,
    ) -> Result<(), ApplicationError> {
        let email = UserEmail::parse(email)?;
        self.deps
            .auth
            .sign_up(email.as_str(), password, full_name)
            .await
            .map_err(ApplicationError::Auth)?;
        info!(email = %email, "注册成功，等待邮件验证");
        Ok(())
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<CurrentUser, ApplicationError> {
        let auth = self
            .deps
            .auth
            .login(email, password)
            .await
            .map_err(ApplicationError::Auth)?;

        info!(user_id = %auth.id, "登录成功");
        let composed = CurrentUser::compose(&auth, None, None);
        self.state().auth = Some(auth);
        self.fetch_profile().await;
        Ok(self.current_user().unwrap_or(composed))
    }

    /// 登出：清空身份、资料、在线状态与全部订阅者
    pub async fn logout(&self) -> Result<(), ApplicationError> {
        self.deps
            .auth
            .logout()
            .await
            .map_err(ApplicationError::Auth)?;

        let user_id = {
            let mut state = self.state();
            let user_id = state.user_id();
            *state = SessionState::default();
            user_id
        };
        self.subscribers.clear();
        info!(user_id = ?user_id, "已登出并清空本地状态");
        Ok(())
    }

    /// 重新读取资料、在线状态与位置并覆盖本地值
    ///
    /// 这是乐观写入与远端之间唯一的对齐点。读取失败的字段保持原值。
    pub async fn fetch_profile(&self) -> Option<Profile> {
        let user_id = self.user_id()?;

        let (profile, availability, location) = tokio::join!(
            self.deps.profiles.get_profile(user_id),
            self.deps.presence.get_availability(user_id),
            self.deps.presence.get_location(user_id),
        );

        let mut state = self.state();
        if state.user_id() != Some(user_id) {
            debug!(user_id = %user_id, "身份已变更，丢弃过期的资料读取结果");
            return state.profile.clone();
        }

        match profile {
            Ok(Some(profile)) => state.profile = Some(profile),
            Ok(None) => debug!(user_id = %user_id, "资料不存在"),
            Err(err) => warn!(user_id = %user_id, error = %err, "读取资料失败"),
        }
        match availability {
            Ok(Some(availability)) => state.availability = availability,
            Ok(None) => debug!(user_id = %user_id, "在线状态记录不存在"),
            Err(err) => warn!(user_id = %user_id, error = %err, "读取在线状态失败"),
        }
        match location {
            Ok(record) => state.location = record.map(|record| record.coordinates()),
            Err(err) => warn!(user_id = %user_id, error = %err, "读取位置失败"),
        }

        state.profile.clone()
    }

    /// 写入资料后重新拉取并通知；失败时本地资料保持不变
    pub async fn update_profile(
        &self,
        fields: ProfileUpdate,
    ) -> Result<Option<Profile>, ApplicationError> {
        let user_id = self.user_id().ok_or(ApplicationError::NotAuthenticated)?;

        self.deps
            .profiles
            .update_profile(user_id, fields, self.deps.clock.now())
            .await
            .map_err(|err| ApplicationError::persistence("profile", err))?;

        let profile = self.fetch_profile().await;
        self.notify_subscribers();
        info!(user_id = %user_id, "资料已更新");
        Ok(profile)
    }

    /// 上传头像到图片托管服务，再写入资料
    pub async fn upload_avatar(&self, image: ImageUpload) -> Result<String, ApplicationError> {
        let user_id = self.user_id().ok_or(ApplicationError::NotAuthenticated)?;

        let url = self.deps.image_host.upload_image(image).await?;
        self.deps
            .profiles
            .update_profile(user_id, ProfileUpdate::avatar(url.clone()), self.deps.clock.now())
            .await
            .map_err(|err| ApplicationError::persistence("avatar", err))?;

        self.fetch_profile().await;
        self.notify_subscribers();
        info!(user_id = %user_id, avatar_url = %url, "头像已更新");
        Ok(url)
    }

    /// 乐观写入在线标志；返回调用结束后的实际状态
    ///
    /// 远端写入失败时恢复到调用前的值并返回它，调用方据此回滚开关。
    pub async fn set_availability(&self, is_available: bool) -> bool {
        let now = self.deps.clock.now();
        let (user_id, previous) = {
            let mut state = self.state();
            let Some(user_id) = state.user_id() else {
                return false;
            };
            let previous = state.availability;
            state.availability = Availability {
                is_available,
                last_active_at: Some(now),
            };
            (user_id, previous)
        };

        match self
            .deps
            .presence
            .set_availability(user_id, is_available, now)
            .await
        {
            Ok(()) => {
                info!(user_id = %user_id, is_available, "在线状态已更新");
                self.notify_subscribers();
                is_available
            }
            Err(err) => {
                warn!(user_id = %user_id, is_available, error = %err, "在线状态写入失败，已回滚");
                let mut state = self.state();
                if state.user_id() == Some(user_id) {
                    state.availability = previous;
                }
                previous.is_available
            }
        }
    }

    /// 立即更新本地位置，再写入远端且不回读
    pub async fn set_user_location(&self, position: Coordinates) -> Result<(), ApplicationError> {
        let user_id = {
            let mut state = self.state();
            let Some(user_id) = state.user_id() else {
                return Ok(());
            };
            state.location = Some(position);
            user_id
        };

        self.deps
            .presence
            .set_location(user_id, position, self.deps.clock.now())
            .await
            .map_err(|err| ApplicationError::persistence("location", err))
    }

    /// 刷新最后活跃时间；未登录或不在线时跳过，返回是否发送
    pub async fn send_heartbeat(&self) -> Result<bool, ApplicationError> {
        let user_id = {
            let state = self.state();
            match state.user_id() {
                Some(user_id) if state.availability.is_available => user_id,
                _ => return Ok(false),
            }
        };

        self.deps
            .presence
            .heartbeat(user_id, self.deps.clock.now())
            .await
            .map_err(|err| ApplicationError::persistence("heartbeat", err))?;
        debug!(user_id = %user_id, "心跳已发送");
        Ok(true)
    }

    /// 按ID查询其他用户的资料
    pub async fn get_user_by_id(&self, id: UserId) -> Result<Option<Profile>, ApplicationError> {
        self.deps
            .profiles
            .get_profile(id)
            .await
            .map_err(|err| ApplicationError::persistence("profile lookup", err))
    }
}
