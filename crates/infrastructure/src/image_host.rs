//! 图片托管客户端
//!
//! 以 multipart 表单上传（文件、未签名预设、目标目录），成功时返回 `secure_url`。

use std::time::Duration;

use async_trait::async_trait;
use config::ImageHostConfig;
use domain::{ImageHost, ImageHostError, ImageUpload};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct UploadErrorBody {
    message: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    secure_url: Option<String>,
    #[serde(default)]
    error: Option<UploadErrorBody>,
}

pub struct HttpImageHost {
    client: reqwest::Client,
    config: ImageHostConfig,
}

impl HttpImageHost {
    pub fn new(config: ImageHostConfig, timeout: Duration) -> Result<Self, ImageHostError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ImageHostError::transport(e.to_string()))?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: reqwest::Client, config: ImageHostConfig) -> Self {
        Self { client, config }
    }

    fn form(&self, image: ImageUpload) -> Result<Form, ImageHostError> {
        let part = Part::bytes(image.bytes)
            .file_name(image.file_name)
            .mime_str(&image.content_type)
            .map_err(|e| ImageHostError::upload_failed(format!("无效的图片类型: {e}")))?;
        Ok(Form::new()
            .part("file", part)
            .text("upload_preset", self.config.upload_preset.clone())
            .text("folder", self.config.folder.clone()))
    }
}

#[async_trait]
impl ImageHost for HttpImageHost {
    async fn upload_image(&self, image: ImageUpload) -> Result<String, ImageHostError> {
        let file_name = image.file_name.clone();
        let form = self.form(image)?;

        let response = self
            .client
            .post(&self.config.upload_url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ImageHostError::transport(e.to_string()))?;
        let status = response.status();
        let body: UploadResponse = response
            .json()
            .await
            .map_err(|e| ImageHostError::upload_failed(format!("无法解析上传响应 ({status}): {e}")))?;

        match (body.secure_url, body.error) {
            (Some(url), _) if status.is_success() => {
                debug!(file_name = %file_name, url = %url, "图片上传成功");
                Ok(url)
            }
            (_, Some(error)) => {
                warn!(file_name = %file_name, status = status.as_u16(), message = %error.message, "图片托管拒绝上传");
                Err(ImageHostError::upload_failed(error.message))
            }
            _ => Err(ImageHostError::upload_failed(format!(
                "上传响应缺少地址 ({status})"
            ))),
        }
    }
}
