//! # CAD Translator Library
//!
//! 把CAD文档模型中的文本字段批量翻译成目标语言并写回文档。
//!
//! ## 模块组织
//!
//! - `host` - 宿主文档边界和API线程
//! - `translation` - 提取、调度、翻译、写回和进度
//! - `env` - 环境变量定义

pub mod env;
pub mod host;
pub mod translation;

pub use host::{ApiContext, HostApiThread, HostDocument, InMemoryDocument};
pub use translation::{Orchestrator, RunHandle, RunOutcome, TranslationConfig, TranslationError};
