//! 访问令牌
//!
//! REST 网关与实时订阅共享同一份令牌：登录后使用用户令牌，未登录时退回匿名密钥。

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use domain::AuthUser;

#[derive(Debug, Clone)]
pub struct Session {
    pub access_token: String,
    /// 已知的身份；从持久化令牌恢复时为空，需向认证服务查询
    pub user: Option<AuthUser>,
}

#[derive(Debug)]
pub struct SessionTokens {
    api_key: String,
    session: RwLock<Option<Session>>,
}

impl SessionTokens {
    pub fn new(api_key: impl Into<String>, access_token: Option<String>) -> Self {
        let session = access_token
            .filter(|token| !token.trim().is_empty())
            .map(|access_token| Session {
                access_token,
                user: None,
            });
        Self {
            api_key: api_key.into(),
            session: RwLock::new(session),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Option<Session>> {
        self.session
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<Session>> {
        self.session
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Authorization 头使用的令牌
    pub fn bearer(&self) -> String {
        self.access_token()
            .unwrap_or_else(|| self.api_key.clone())
    }

    pub fn access_token(&self) -> Option<String> {
        self.read().as_ref().map(|session| session.access_token.clone())
    }

    pub fn session(&self) -> Option<Session> {
        self.read().clone()
    }

    pub fn set(&self, session: Session) {
        *self.write() = Some(session);
    }

    pub fn remember_user(&self, user: AuthUser) {
        if let Some(session) = self.write().as_mut() {
            session.user = Some(user);
        }
    }

    pub fn clear(&self) {
        *self.write() = None;
    }
}
