//! 图片托管与设备定位接口

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::{ImageHostError, PositionError};
use crate::value_objects::Coordinates;

/// 待上传的图片
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageUpload {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// 外部图片托管服务
#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait ImageHost: Send + Sync {
    /// 上传图片并返回公开访问地址
    async fn upload_image(&self, image: ImageUpload) -> Result<String, ImageHostError>;
}

/// 持续定位推送的位置流
pub type PositionStream = mpsc::Receiver<Result<Coordinates, PositionError>>;

/// 设备定位能力
#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait PositionSource: Send + Sync {
    /// 设备是否具备定位能力
    fn is_supported(&self) -> bool;

    /// 读取一次当前位置
    async fn current_position(&self) -> Result<Coordinates, PositionError>;

    /// 开始持续定位；丢弃返回的接收端即停止
    fn watch(&self) -> Result<PositionStream, PositionError>;
}
