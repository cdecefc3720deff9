//! 领域模型错误定义
//!
//! 定义校验错误以及各外部协作方（远端网关、图片托管、定位能力）的错误类型。

use thiserror::Error;

/// 领域模型错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// 验证错误
    #[error("验证失败: {field}: {message}")]
    ValidationError { field: String, message: String },
}

impl DomainError {
    /// 创建验证错误
    pub fn validation_error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// 领域模型结果类型
pub type DomainResult<T> = Result<T, DomainError>;

/// 远端网关错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    /// 凭据无效
    #[error("邮箱或密码错误")]
    InvalidCredentials,

    /// 当前没有有效会话
    #[error("没有有效的会话")]
    NoSession,

    /// 资源不存在
    #[error("资源不存在: {resource}")]
    NotFound { resource: String },

    /// 远端拒绝了请求
    #[error("远端拒绝请求 ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// 网络传输错误
    #[error("网络传输错误: {message}")]
    Transport { message: String },

    /// 响应解析失败
    #[error("响应解析失败: {message}")]
    Decode { message: String },
}

impl GatewayError {
    /// 创建资源不存在错误
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// 创建远端拒绝错误
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }

    /// 创建网络传输错误
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// 创建解析错误
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// 是否属于认证类错误
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            Self::InvalidCredentials | Self::NoSession | Self::Rejected { status: 401, .. }
        )
    }
}

/// 网关结果类型
pub type GatewayResult<T> = Result<T, GatewayError>;

/// 图片托管错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ImageHostError {
    /// 托管服务返回了错误
    #[error("图片上传失败: {message}")]
    UploadFailed { message: String },

    /// 网络传输错误
    #[error("图片上传网络错误: {message}")]
    Transport { message: String },
}

impl ImageHostError {
    pub fn upload_failed(message: impl Into<String>) -> Self {
        Self::UploadFailed {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }
}

/// 定位错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PositionError {
    /// 用户拒绝了定位授权
    #[error("定位权限被拒绝")]
    PermissionDenied,

    /// 设备不具备定位能力
    #[error("设备不支持定位")]
    Unavailable,

    /// 定位超时
    #[error("定位超时")]
    Timeout,

    /// 其他定位错误
    #[error("定位失败: {message}")]
    Other { message: String },
}
