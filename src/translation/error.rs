//! 翻译模块统一错误处理
//!
//! 提供结构化错误类型和错误处理机制。错误按对运行的影响分为三类：
//! 致命错误（终止整个运行）、可重试错误（在客户端内部重试）以及
//! 单元级错误（记录到最终结果中，运行继续）。

use std::fmt;

use thiserror::Error;

use crate::host::{ElementHandle, HostError};
use crate::translation::core::provider::ProviderError;

/// 翻译错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TranslationError {
    /// 配置错误
    #[error("配置错误: {0}")]
    ConfigError(String),

    /// 文本提取失败：文档会话无效，或选择范围中的类别/视图已被删除
    #[error("文本提取失败: {0}")]
    ExtractionFailure(String),

    /// 临时性服务错误（网络、限流），客户端会在重试预算内重试
    #[error("翻译服务暂时不可用: {0}")]
    TransientProvider(String),

    /// 永久性服务错误（认证、请求格式、服务拒绝），不重试
    #[error("翻译服务拒绝请求: {0}")]
    PermanentProvider(String),

    /// 目标元素在运行期间被删除
    #[error("元素已不存在: {0}")]
    StaleHandle(ElementHandle),

    /// 文档会话在运行期间失效
    #[error("文档会话已失效: {0}")]
    SessionLost(String),

    /// 宿主API线程不可用
    #[error("宿主API线程不可用: {0}")]
    HostUnavailable(String),

    /// 超时错误
    #[error("操作超时: {0}")]
    TimeoutError(String),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    SerializationError(String),

    /// 内部错误
    #[error("内部错误: {0}")]
    InternalError(String),
}

impl TranslationError {
    /// 检查错误是否可重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TranslationError::TransientProvider(_) | TranslationError::TimeoutError(_)
        )
    }

    /// 是否会终止整个运行
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TranslationError::ExtractionFailure(_)
                | TranslationError::SessionLost(_)
                | TranslationError::HostUnavailable(_)
                | TranslationError::ConfigError(_)
                | TranslationError::InternalError(_)
        )
    }

    /// 获取错误的严重程度
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            TranslationError::ConfigError(_) => ErrorSeverity::Critical,
            TranslationError::ExtractionFailure(_) => ErrorSeverity::Critical,
            TranslationError::TransientProvider(_) => ErrorSeverity::Warning,
            TranslationError::PermanentProvider(_) => ErrorSeverity::Error,
            TranslationError::StaleHandle(_) => ErrorSeverity::Warning,
            TranslationError::SessionLost(_) => ErrorSeverity::Critical,
            TranslationError::HostUnavailable(_) => ErrorSeverity::Critical,
            TranslationError::TimeoutError(_) => ErrorSeverity::Warning,
            TranslationError::SerializationError(_) => ErrorSeverity::Error,
            TranslationError::InternalError(_) => ErrorSeverity::Critical,
        }
    }

    /// 获取错误类别
    pub fn category(&self) -> ErrorCategory {
        match self {
            TranslationError::ConfigError(_) => ErrorCategory::Configuration,
            TranslationError::ExtractionFailure(_) => ErrorCategory::Extraction,
            TranslationError::TransientProvider(_) => ErrorCategory::Provider,
            TranslationError::PermanentProvider(_) => ErrorCategory::Provider,
            TranslationError::StaleHandle(_) => ErrorCategory::Document,
            TranslationError::SessionLost(_) => ErrorCategory::Document,
            TranslationError::HostUnavailable(_) => ErrorCategory::Document,
            TranslationError::TimeoutError(_) => ErrorCategory::Timeout,
            TranslationError::SerializationError(_) => ErrorCategory::Serialization,
            TranslationError::InternalError(_) => ErrorCategory::Internal,
        }
    }

    /// 创建带上下文的错误
    pub fn with_context<T: fmt::Display>(self, context: T) -> Self {
        let new_msg = |msg: String| format!("{} (上下文: {})", msg, context);

        match self {
            TranslationError::ConfigError(msg) => TranslationError::ConfigError(new_msg(msg)),
            TranslationError::ExtractionFailure(msg) => {
                TranslationError::ExtractionFailure(new_msg(msg))
            }
            TranslationError::TransientProvider(msg) => {
                TranslationError::TransientProvider(new_msg(msg))
            }
            TranslationError::PermanentProvider(msg) => {
                TranslationError::PermanentProvider(new_msg(msg))
            }
            TranslationError::SessionLost(msg) => TranslationError::SessionLost(new_msg(msg)),
            TranslationError::HostUnavailable(msg) => {
                TranslationError::HostUnavailable(new_msg(msg))
            }
            TranslationError::TimeoutError(msg) => TranslationError::TimeoutError(new_msg(msg)),
            TranslationError::SerializationError(msg) => {
                TranslationError::SerializationError(new_msg(msg))
            }
            TranslationError::InternalError(msg) => TranslationError::InternalError(new_msg(msg)),
            TranslationError::StaleHandle(handle) => TranslationError::StaleHandle(handle),
        }
    }
}

/// 错误严重程度
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Configuration,
    Extraction,
    Provider,
    Document,
    Timeout,
    Serialization,
    Internal,
}

/// 宿主错误转换
///
/// 会话失效和线程不可用是致命的；类别/视图缺失只会在提取阶段出现。
impl From<HostError> for TranslationError {
    fn from(error: HostError) -> Self {
        match error {
            HostError::SessionClosed => TranslationError::SessionLost(error.to_string()),
            HostError::ApiThreadUnavailable => {
                TranslationError::HostUnavailable(error.to_string())
            }
            HostError::StaleHandle(handle) => TranslationError::StaleHandle(handle),
            HostError::UnknownCategory(_) | HostError::UnknownView(_) => {
                TranslationError::ExtractionFailure(error.to_string())
            }
            HostError::UnknownField { .. }
            | HostError::ReadOnlyField { .. }
            | HostError::NoTransaction
            | HostError::TransactionOpen => TranslationError::InternalError(error.to_string()),
        }
    }
}

impl From<ProviderError> for TranslationError {
    fn from(error: ProviderError) -> Self {
        if error.is_transient() {
            TranslationError::TransientProvider(error.to_string())
        } else {
            TranslationError::PermanentProvider(error.to_string())
        }
    }
}

/// 标准错误转换
impl From<std::io::Error> for TranslationError {
    fn from(error: std::io::Error) -> Self {
        TranslationError::ConfigError(format!("IO错误: {}", error))
    }
}

impl From<serde_json::Error> for TranslationError {
    fn from(error: serde_json::Error) -> Self {
        TranslationError::SerializationError(format!("JSON序列化错误: {}", error))
    }
}

impl From<toml::de::Error> for TranslationError {
    fn from(error: toml::de::Error) -> Self {
        TranslationError::ConfigError(format!("TOML解析错误: {}", error))
    }
}

impl From<tokio::time::error::Elapsed> for TranslationError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        TranslationError::TimeoutError(format!("异步操作超时: {}", error))
    }
}

/// 错误结果类型别名
pub type TranslationResult<T> = Result<T, TranslationError>;

/// 错误处理助手函数
pub mod helpers {
    use super::*;

    /// 按严重程度记录错误
    pub fn log_error(error: &TranslationError) {
        match error.severity() {
            ErrorSeverity::Info => tracing::info!("翻译信息: {}", error),
            ErrorSeverity::Warning => tracing::warn!("翻译警告: {}", error),
            ErrorSeverity::Error => tracing::error!("翻译错误: {}", error),
            ErrorSeverity::Critical => tracing::error!("翻译严重错误: {}", error),
        }
    }

    /// 创建配置错误
    pub fn config_error<T: fmt::Display>(msg: T) -> TranslationError {
        TranslationError::ConfigError(msg.to_string())
    }

    /// 创建内部错误
    pub fn internal_error<T: fmt::Display>(msg: T) -> TranslationError {
        TranslationError::InternalError(msg.to_string())
    }
}
