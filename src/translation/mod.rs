//! 翻译模块
//!
//! 提供完整的翻译运行，采用清晰的模块化架构：
//! - **core**: 运行编排、翻译客户端、写回和进度
//! - **pipeline**: 文本处理管道（提取、过滤、批次）
//! - **storage**: 翻译记忆缓存
//! - **config**: 配置管理
//! - **error**: 错误处理
//!
//! # 基本用法
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cad_translator::host::{HostApiThread, InMemoryDocument};
//! use cad_translator::translation::{load_translation_config, HttpProvider, Orchestrator, SelectionScope};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_translation_config(Some("zh"));
//! let provider = HttpProvider::from_config(&config)?;
//! let orchestrator = Orchestrator::new(Arc::new(config), Arc::new(provider));
//!
//! let api = HostApiThread::spawn(InMemoryDocument::load("model.json")?)?;
//! let handle = orchestrator.start_run(SelectionScope::whole_model(["Rooms", "Doors"]), api.context());
//! let outcome = handle.wait().await?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// 子模块声明
// ============================================================================

/// 配置管理模块 - 处理翻译相关的所有配置
///
/// 提供服务地址、语言设置、限速、重试和缓存配置
pub mod config;

/// 核心模块 - 运行编排和翻译执行
pub mod core;

/// 错误处理模块 - 统一的错误类型和处理机制
pub mod error;

/// 文本处理管道模块 - 文本提取、过滤和批次调度
pub mod pipeline;

/// 存储管理模块 - 翻译记忆
pub mod storage;

// ============================================================================
// 核心API导出
// ============================================================================

pub use core::{
    HttpProvider, Orchestrator, ProgressEvent, ProgressReporter, ProgressSink, PseudoProvider,
    RunHandle, RunOutcome, RunPhase, RunStatus, TranslationClient, TranslationProvider, UnitResult,
};

/// 配置管理相关组件
pub use config::{constants, load_translation_config, ConfigManager, TranslationConfig};

/// 错误处理相关类型
pub use error::{ErrorCategory, ErrorSeverity, TranslationError, TranslationResult};

/// 文本处理管道组件
pub use pipeline::{Batch, BatchScheduler, SelectionScope, TextExtractor, TextFilter, TranslationUnit};

/// 存储和缓存组件
pub use storage::{CacheConfig, CacheStats, TranslationCache};

/// 检查文本是否应该翻译（便利函数）
///
/// # Examples
///
/// ```rust
/// use cad_translator::translation::should_translate;
///
/// assert!(should_translate("Lobby"));
/// assert!(!should_translate("   "));
/// ```
pub fn should_translate(text: &str) -> bool {
    pipeline::TextFilter::new().should_translate(text)
}

/// 检查翻译配置文件是否存在
pub fn config_file_exists() -> bool {
    config::config_file_exists()
}

/// 生成示例配置文件
pub fn generate_example_config(path: &str) -> TranslationResult<()> {
    ConfigManager::generate_example_config(path)?;
    tracing::info!("已生成示例配置文件: {}", path);
    Ok(())
}
