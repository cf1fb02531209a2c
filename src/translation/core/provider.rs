//! 翻译服务边界
//!
//! [`TranslationProvider`] 是核心与外部翻译服务之间唯一的接口：
//! 一次请求携带一组有序文本，成功时返回同样顺序的译文。
//!
//! 错误在这里就被分为临时性和永久性两类，重试策略只看这个分类。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::translation::config::TranslationConfig;
use crate::translation::error::{TranslationError, TranslationResult};

/// 错误消息中保留的响应正文长度
const MAX_ERROR_BODY_CHARS: usize = 200;

/// 翻译服务错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// 连接失败、连接被重置等网络问题
    #[error("网络错误: {0}")]
    Network(String),

    /// 单次请求超时
    #[error("请求超时 ({0:?})")]
    Timeout(Duration),

    /// 服务限流，可能附带建议的等待时间
    #[error("请求被限流")]
    RateLimited { retry_after: Option<Duration> },

    /// 服务端5xx错误
    #[error("服务端错误 {status}: {message}")]
    ServerError { status: u16, message: String },

    /// 认证失败
    #[error("认证失败: {0}")]
    Unauthorized(String),

    /// 请求格式错误或内容过大
    #[error("请求无效: {0}")]
    InvalidRequest(String),

    /// 服务明确拒绝或返回了无法使用的响应
    #[error("服务拒绝: {0}")]
    Rejected(String),

    /// 返回的译文数量与请求不一致
    #[error("译文数量不匹配: 期望 {expected}, 实际 {actual}")]
    ResponseMismatch { expected: usize, actual: usize },
}

impl ProviderError {
    /// 是否值得重试
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Network(_)
                | ProviderError::Timeout(_)
                | ProviderError::RateLimited { .. }
                | ProviderError::ServerError { .. }
        )
    }

    /// 服务建议的最短等待时间
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// 翻译请求
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderRequest {
    pub source_lang: String,
    pub target_lang: String,
    pub texts: Vec<String>,
}

/// 翻译服务
///
/// 实现必须为每个输入文本按顺序返回一个译文；数量不一致会被客户端当作永久性错误。
#[async_trait]
pub trait TranslationProvider: Send + Sync {
    /// 服务名称，用于日志
    fn name(&self) -> &str;

    async fn translate(&self, request: &ProviderRequest) -> Result<Vec<String>, ProviderError>;
}

#[derive(Debug, Deserialize)]
struct ProviderResponse {
    #[serde(default)]
    texts: Option<Vec<String>>,
    #[serde(default)]
    error: Option<String>,
}

/// 基于HTTP JSON接口的翻译服务
///
/// 请求：`POST {source_lang, target_lang, texts}`；
/// 响应：`{texts: [...]}` 或 `{error: "..."}`。
pub struct HttpProvider {
    client: reqwest::Client,
    endpoint: url::Url,
    api_key: Option<String>,
}

impl HttpProvider {
    pub fn new(endpoint: &str, api_key: Option<String>) -> TranslationResult<Self> {
        let endpoint = url::Url::parse(endpoint).map_err(|e| {
            TranslationError::ConfigError(format!("无效的API地址 '{}': {}", endpoint, e))
        })?;

        let client = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TranslationError::ConfigError(format!("创建HTTP客户端失败: {}", e)))?;

        Ok(Self {
            client,
            endpoint,
            api_key,
        })
    }

    pub fn from_config(config: &TranslationConfig) -> TranslationResult<Self> {
        Self::new(&config.api_url, config.api_key.clone())
    }

    pub fn endpoint(&self) -> &url::Url {
        &self.endpoint
    }

    fn classify_status(status: StatusCode, headers: &HeaderMap, body: &str) -> ProviderError {
        let message = error_message(body);
        match status.as_u16() {
            401 | 403 => ProviderError::Unauthorized(message),
            400 | 413 | 422 => ProviderError::InvalidRequest(message),
            429 => ProviderError::RateLimited {
                retry_after: parse_retry_after(headers),
            },
            code if status.is_server_error() => ProviderError::ServerError {
                status: code,
                message,
            },
            code => ProviderError::Rejected(format!("HTTP {}: {}", code, message)),
        }
    }
}

#[async_trait]
impl TranslationProvider for HttpProvider {
    fn name(&self) -> &str {
        "http"
    }

    async fn translate(&self, request: &ProviderRequest) -> Result<Vec<String>, ProviderError> {
        let mut builder = self.client.post(self.endpoint.clone()).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        // 单次尝试的超时由客户端统一控制
        let response = builder
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Network(format!("读取响应失败: {}", e)))?;

        if !status.is_success() {
            return Err(Self::classify_status(status, &headers, &body));
        }

        let parsed: ProviderResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::Rejected(format!("无法解析响应: {}", e)))?;

        match parsed {
            ProviderResponse {
                error: Some(error), ..
            } => Err(ProviderError::Rejected(error)),
            ProviderResponse {
                texts: Some(texts), ..
            } => Ok(texts),
            _ => Err(ProviderError::Rejected("响应缺少 texts 字段".to_string())),
        }
    }
}

/// 伪本地化服务
///
/// 不访问网络，给每个文本加上固定前缀，用于演练和测试写回流程。
#[derive(Debug, Clone)]
pub struct PseudoProvider {
    prefix: String,
}

impl PseudoProvider {
    pub const DEFAULT_PREFIX: &'static str = "[tl]";

    pub fn new() -> Self {
        Self::with_prefix(Self::DEFAULT_PREFIX)
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn pseudo_translate(&self, text: &str) -> String {
        format!("{} {}", self.prefix, text)
    }
}

impl Default for PseudoProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TranslationProvider for PseudoProvider {
    fn name(&self) -> &str {
        "pseudo"
    }

    async fn translate(&self, request: &ProviderRequest) -> Result<Vec<String>, ProviderError> {
        Ok(request
            .texts
            .iter()
            .map(|text| self.pseudo_translate(text))
            .collect())
    }
}

/// 解析 `Retry-After` 头（只支持秒数形式）
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// 从错误响应中取出可读消息
fn error_message(body: &str) -> String {
    if let Ok(ProviderResponse {
        error: Some(error), ..
    }) = serde_json::from_str::<ProviderResponse>(body)
    {
        return error;
    }
    body.chars().take(MAX_ERROR_BODY_CHARS).collect()
}
