//! REST 后端网关
//!
//! 通过 HTTP 访问托管后端：认证接口位于 `/auth/v1`，表读写与 RPC 位于 `/rest/v1`。
//! 每个请求都带 `apikey` 头以及 `Authorization: Bearer`（有会话时为用户令牌，否则为匿名密钥）。
//! 只读请求在传输错误时按配置重试，写请求只发送一次。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use config::BackendConfig;
use domain::{
    AuthGateway, AuthUser, Availability, ChatMessage, Coordinates, DiscoveryGateway, GatewayError,
    GatewayResult, LocationRecord, MessageGateway, NearbyQuery, NearbyRow, NewMessage,
    PresenceGateway, Profile, ProfileGateway, ProfileUpdate, Timestamp, UserId,
};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::retry::{retry_async, RetryConfig};
use crate::tokens::{Session, SessionTokens};

const PREFER_MINIMAL: &str = "return=minimal";
const PREFER_REPRESENTATION: &str = "return=representation";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    user: AuthUser,
}

pub struct RestGateway {
    client: reqwest::Client,
    base_url: String,
    tokens: Arc<SessionTokens>,
    retry: RetryConfig,
}

impl RestGateway {
    pub fn new(config: &BackendConfig, tokens: Arc<SessionTokens>) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| GatewayError::transport(format!("创建 HTTP 客户端失败: {e}")))?;
        Ok(Self::with_client(
            client,
            &config.url,
            tokens,
            RetryConfig::new(config.read_attempts),
        ))
    }

    pub fn with_client(
        client: reqwest::Client,
        base_url: &str,
        tokens: Arc<SessionTokens>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
            retry,
        }
    }

    pub fn tokens(&self) -> &Arc<SessionTokens> {
        &self.tokens
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .header("apikey", self.tokens.api_key())
            .bearer_auth(self.tokens.bearer())
    }

    async fn send(builder: RequestBuilder) -> GatewayResult<Response> {
        let response = builder.send().await.map_err(transport_error)?;
        check_status(response).await
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> GatewayResult<T> {
        response.json::<T>().await.map_err(transport_error)
    }

    /// 读取表中满足条件的行，传输错误时重试
    async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> GatewayResult<Vec<T>> {
        let path = format!("/rest/v1/{table}");
        retry_async(&self.retry, || async {
            let builder = self
                .request(Method::GET, &path)
                .query(&[("select", "*")])
                .query(query);
            let response = Self::send(builder).await?;
            Self::decode::<Vec<T>>(response).await
        })
        .await
    }

    async fn select_one<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> GatewayResult<Option<T>> {
        Ok(self.select(table, query).await?.into_iter().next())
    }

    async fn patch(&self, table: &str, query: &[(&str, String)], body: Value) -> GatewayResult<()> {
        let builder = self
            .request(Method::PATCH, &format!("/rest/v1/{table}"))
            .header("Prefer", PREFER_MINIMAL)
            .query(query)
            .json(&body);
        Self::send(builder).await?;
        Ok(())
    }
}

fn eq(value: impl std::fmt::Display) -> String {
    format!("eq.{value}")
}

fn transport_error(err: reqwest::Error) -> GatewayError {
    if err.is_decode() {
        GatewayError::decode(err.to_string())
    } else {
        GatewayError::transport(err.to_string())
    }
}

/// 从错误响应体中提取可读的信息
fn error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    ["msg", "message", "error_description", "error"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

async fn check_status(response: Response) -> GatewayResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = error_message(&body).unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_string()
    });
    debug!(status = status.as_u16(), message = %message, "后端返回错误");

    if status == StatusCode::NOT_FOUND {
        Err(GatewayError::not_found(message))
    } else {
        Err(GatewayError::rejected(status.as_u16(), message))
    }
}

#[async_trait]
impl AuthGateway for RestGateway {
    async fn sign_up(&self, email: &str, password: &str, full_name: &str) -> GatewayResult<()> {
        let builder = self.request(Method::POST, "/auth/v1/signup").json(&json!({
            "email": email,
            "password": password,
            "data": { "full_name": full_name },
        }));
        Self::send(builder).await?;
        info!(email, "注册请求已提交，等待邮件验证");
        Ok(())
    }

    async fn login(&self, email: &str, password: &str) -> GatewayResult<AuthUser> {
        let builder = self
            .request(Method::POST, "/auth/v1/token")
            .query(&[("grant_type", "password")])
            .json(&json!({ "email": email, "password": password }));

        let response = match Self::send(builder).await {
            Ok(response) => response,
            Err(GatewayError::Rejected {
                status: 400 | 401, ..
            }) => return Err(GatewayError::InvalidCredentials),
            Err(err) => return Err(err),
        };
        let token: TokenResponse = Self::decode(response).await?;

        self.tokens.set(Session {
            access_token: token.access_token,
            user: Some(token.user.clone()),
        });
        Ok(token.user)
    }

    async fn logout(&self) -> GatewayResult<()> {
        if self.tokens.session().is_none() {
            return Ok(());
        }
        let result = Self::send(self.request(Method::POST, "/auth/v1/logout")).await;
        // 远端注销失败时本地会话同样作废
        self.tokens.clear();
        result.map(|_| ())
    }

    async fn get_session(&self) -> GatewayResult<Option<AuthUser>> {
        let Some(session) = self.tokens.session() else {
            return Ok(None);
        };
        if let Some(user) = session.user {
            return Ok(Some(user));
        }

        let path = "/auth/v1/user";
        let result = retry_async(&self.retry, || async {
            let response = Self::send(self.request(Method::GET, path)).await?;
            Self::decode::<AuthUser>(response).await
        })
        .await;

        match result {
            Ok(user) => {
                self.tokens.remember_user(user.clone());
                Ok(Some(user))
            }
            Err(GatewayError::Rejected {
                status: 401 | 403, ..
            }) => {
                warn!("持久化的访问令牌已失效");
                self.tokens.clear();
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl ProfileGateway for RestGateway {
    async fn get_profile(&self, id: UserId) -> GatewayResult<Option<Profile>> {
        self.select_one("profiles", &[("id", eq(id))]).await
    }

    async fn update_profile(
        &self,
        id: UserId,
        fields: ProfileUpdate,
        updated_at: Timestamp,
    ) -> GatewayResult<()> {
        let mut body = serde_json::to_value(&fields)
            .map_err(|e| GatewayError::decode(e.to_string()))?;
        if let Value::Object(map) = &mut body {
            map.insert("updated_at".into(), json!(updated_at));
        }
        self.patch("profiles", &[("id", eq(id))], body).await
    }
}

#[async_trait]
impl PresenceGateway for RestGateway {
    async fn get_availability(&self, id: UserId) -> GatewayResult<Option<Availability>> {
        self.select_one("availability", &[("user_id", eq(id))]).await
    }

    async fn set_availability(
        &self,
        id: UserId,
        is_available: bool,
        at: Timestamp,
    ) -> GatewayResult<()> {
        self.patch(
            "availability",
            &[("user_id", eq(id))],
            json!({ "is_available": is_available, "last_active_at": at }),
        )
        .await
    }

    async fn heartbeat(&self, id: UserId, at: Timestamp) -> GatewayResult<()> {
        self.patch(
            "availability",
            &[("user_id", eq(id))],
            json!({ "last_active_at": at }),
        )
        .await
    }

    async fn get_location(&self, id: UserId) -> GatewayResult<Option<LocationRecord>> {
        self.select_one("locations", &[("user_id", eq(id))]).await
    }

    async fn set_location(
        &self,
        id: UserId,
        position: Coordinates,
        at: Timestamp,
    ) -> GatewayResult<()> {
        self.patch(
            "locations",
            &[("user_id", eq(id))],
            json!({
                "latitude": position.latitude,
                "longitude": position.longitude,
                "updated_at": at,
            }),
        )
        .await
    }
}

#[async_trait]
impl DiscoveryGateway for RestGateway {
    async fn nearby(&self, query: NearbyQuery) -> GatewayResult<Vec<NearbyRow>> {
        let body = json!({
            "my_lat": query.center.latitude,
            "my_lng": query.center.longitude,
            "radius_km": query.radius_km,
            "search_term": query.search_term,
        });
        retry_async(&self.retry, || async {
            let builder = self
                .request(Method::POST, "/rest/v1/rpc/get_nearby_users")
                .json(&body);
            let response = Self::send(builder).await?;
            Self::decode::<Vec<NearbyRow>>(response).await
        })
        .await
    }
}

#[async_trait]
impl MessageGateway for RestGateway {
    async fn send_message(&self, message: NewMessage) -> GatewayResult<ChatMessage> {
        let builder = self
            .request(Method::POST, "/rest/v1/messages")
            .header("Prefer", PREFER_REPRESENTATION)
            .json(&[&message]);
        let response = Self::send(builder).await?;
        let rows: Vec<ChatMessage> = Self::decode(response).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| GatewayError::decode("插入私信后没有返回记录"))
    }

    async fn get_messages(&self, a: UserId, b: UserId) -> GatewayResult<Vec<ChatMessage>> {
        let conversation = format!(
            "(and(sender_id.eq.{a},receiver_id.eq.{b}),and(sender_id.eq.{b},receiver_id.eq.{a}))"
        );
        self.select(
            "messages",
            &[("or", conversation), ("order", "created_at.asc".to_string())],
        )
        .await
    }
}
