//! 统一配置中心
//!
//! 提供应用的全局配置管理，包括：
//! - 远端后端（REST 与实时订阅）
//! - 图片托管
//! - 附近发现与在线心跳参数
//! - 日志
//!
//! 加载顺序：默认值 -> 可选配置文件（APP_CONFIG_FILE）-> 环境变量（APP_*，层级用 `__` 分隔）

use std::time::Duration;

use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// 全局应用配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// 后端配置
    pub backend: BackendConfig,
    /// 实时订阅配置
    #[serde(default)]
    pub realtime: RealtimeConfig,
    /// 图片托管配置
    #[serde(default)]
    pub image_host: ImageHostConfig,
    /// 在线与发现参数
    #[serde(default)]
    pub presence: PresenceConfig,
    /// 命令行登录凭据
    #[serde(default)]
    pub credentials: CredentialsConfig,
    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 后端配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// 后端根地址，例如 https://project.supabase.co
    pub url: String,
    /// 匿名访问密钥
    pub api_key: String,
    /// 已持久化的访问令牌，用于恢复会话
    #[serde(default)]
    pub access_token: Option<String>,
    pub request_timeout_secs: u64,
    /// 只读请求在网络错误时的最大尝试次数
    pub read_attempts: u32,
}

/// 实时订阅配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// WebSocket 地址，缺省时由后端地址推导
    #[serde(default)]
    pub url: Option<String>,
    pub heartbeat_interval_secs: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: None,
            heartbeat_interval_secs: 30,
        }
    }
}

/// 图片托管配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageHostConfig {
    pub upload_url: String,
    pub upload_preset: String,
    pub folder: String,
}

impl Default for ImageHostConfig {
    fn default() -> Self {
        Self {
            upload_url: "https://api.cloudinary.com/v1_1/demo/image/upload".into(),
            upload_preset: "ml_default".into(),
            folder: "nearby_avatars".into(),
        }
    }
}

/// 在线与发现参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// 附近发现半径（公里）
    pub discovery_radius_km: f64,
    /// 网络刷新信号的节流窗口（毫秒）
    pub refresh_throttle_ms: u64,
    /// 在线心跳间隔（秒）
    pub heartbeat_interval_secs: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            discovery_radius_km: 15.0,
            refresh_throttle_ms: 800,
            heartbeat_interval_secs: 60,
        }
    }
}

impl PresenceConfig {
    pub fn refresh_throttle(&self) -> Duration {
        Duration::from_millis(self.refresh_throttle_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// EnvFilter 语法，RUST_LOG 优先
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".into(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig {
                url: "http://127.0.0.1:54321".into(),
                api_key: String::new(),
                access_token: None,
                request_timeout_secs: 10,
                read_attempts: 2,
            },
            realtime: RealtimeConfig::default(),
            image_host: ImageHostConfig::default(),
            presence: PresenceConfig::default(),
            credentials: CredentialsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    /// 按默认值 -> 配置文件 -> 环境变量的顺序合并
    pub fn figment() -> Figment {
        let mut fig = Figment::new().merge(Serialized::defaults(AppConfig::default()));
        if let Ok(path) = std::env::var("APP_CONFIG_FILE") {
            if path.ends_with(".yml") || path.ends_with(".yaml") {
                fig = fig.merge(Yaml::file(path));
            } else if path.ends_with(".json") {
                fig = fig.merge(Json::file(path));
            } else {
                fig = fig.merge(Toml::file(path));
            }
        }
        fig.merge(Env::prefixed("APP_").split("__"))
    }

    /// 加载并校验配置
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment())
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let cfg: AppConfig = figment.extract().map_err(Box::new)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.backend.url.trim();
        if url.is_empty() {
            return Err(ConfigError::invalid("backend.url", "cannot be empty"));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::invalid(
                "backend.url",
                "must start with http:// or https://",
            ));
        }
        if self.backend.request_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "backend.request_timeout_secs",
                "must be greater than 0",
            ));
        }
        if self.backend.read_attempts == 0 {
            return Err(ConfigError::invalid(
                "backend.read_attempts",
                "must be at least 1",
            ));
        }
        if !self.presence.discovery_radius_km.is_finite() || self.presence.discovery_radius_km <= 0.0 {
            return Err(ConfigError::invalid(
                "presence.discovery_radius_km",
                "must be a positive number",
            ));
        }
        if self.presence.refresh_throttle_ms == 0 {
            return Err(ConfigError::invalid(
                "presence.refresh_throttle_ms",
                "must be greater than 0",
            ));
        }
        if self.presence.heartbeat_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "presence.heartbeat_interval_secs",
                "must be greater than 0",
            ));
        }
        if self.realtime.heartbeat_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "realtime.heartbeat_interval_secs",
                "must be greater than 0",
            ));
        }
        Ok(())
    }

    /// 实时订阅地址：显式配置优先，否则由后端地址推导
    pub fn realtime_url(&self) -> String {
        if let Some(url) = &self.realtime.url {
            return url.clone();
        }
        let base = self.backend.url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{ws_base}/realtime/v1/websocket")
    }

    /// 脱敏后的配置文本（用于日志）
    pub fn sanitize(&self) -> String {
        let mut redacted = self.clone();
        if !redacted.backend.api_key.is_empty() {
            redacted.backend.api_key = "[REDACTED]".into();
        }
        if redacted.backend.access_token.is_some() {
            redacted.backend.access_token = Some("[REDACTED]".into());
        }
        if redacted.credentials.password.is_some() {
            redacted.credentials.password = Some("[REDACTED]".into());
        }
        format!("{:?}", redacted)
    }
}

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("Invalid configuration `{field}`: {message}")]
    Invalid { field: String, message: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.presence.discovery_radius_km, 15.0);
        assert_eq!(config.presence.refresh_throttle(), Duration::from_millis(800));
        assert_eq!(config.presence.heartbeat_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_env_overrides_defaults() {
        Jail::expect_with(|jail| {
            jail.set_env("APP_BACKEND__URL", "https://project.example.co");
            jail.set_env("APP_PRESENCE__DISCOVERY_RADIUS_KM", "5");
            jail.set_env("APP_LOGGING__FILTER", "debug");

            let config = AppConfig::load().map_err(|e| e.to_string())?;
            assert_eq!(config.backend.url, "https://project.example.co");
            assert_eq!(config.presence.discovery_radius_km, 5.0);
            assert_eq!(config.presence.refresh_throttle_ms, 800);
            assert_eq!(config.logging.filter, "debug");
            Ok(())
        });
    }

    #[test]
    fn test_yaml_file_then_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "nearby.yaml",
                r#"
backend:
  url: "https://from-file.example.co"
  api_key: "file-key"
  request_timeout_secs: 3
presence:
  discovery_radius_km: 7.5
  refresh_throttle_ms: 500
  heartbeat_interval_secs: 30
"#,
            )?;
            jail.set_env("APP_CONFIG_FILE", "nearby.yaml");
            jail.set_env("APP_PRESENCE__HEARTBEAT_INTERVAL_SECS", "45");

            let config = AppConfig::load().map_err(|e| e.to_string())?;
            assert_eq!(config.backend.url, "https://from-file.example.co");
            assert_eq!(config.backend.api_key, "file-key");
            assert_eq!(config.presence.discovery_radius_km, 7.5);
            assert_eq!(config.presence.refresh_throttle_ms, 500);
            assert_eq!(config.presence.heartbeat_interval_secs, 45);
            Ok(())
        });
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.presence.discovery_radius_km = 0.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.presence.refresh_throttle_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.backend.read_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.backend.url = "ftp://nope".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("backend.url"));
    }

    #[test]
    fn test_realtime_url_derivation() {
        let mut config = AppConfig::default();
        config.backend.url = "https://project.example.co/".into();
        assert_eq!(
            config.realtime_url(),
            "wss://project.example.co/realtime/v1/websocket"
        );

        config.backend.url = "http://127.0.0.1:54321".into();
        assert_eq!(
            config.realtime_url(),
            "ws://127.0.0.1:54321/realtime/v1/websocket"
        );

        config.realtime.url = Some("wss://custom/socket".into());
        assert_eq!(config.realtime_url(), "wss://custom/socket");
    }

    #[test]
    fn test_sanitize_hides_secrets() {
        let mut config = AppConfig::default();
        config.backend.api_key = "super-secret-key".into();
        config.credentials.password = Some("hunter2".into());

        let text = config.sanitize();
        assert!(!text.contains("super-secret-key"));
        assert!(!text.contains("hunter2"));
        assert!(text.contains("[REDACTED]"));
    }
}
