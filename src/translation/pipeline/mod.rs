//! 翻译管道模块
//!
//! 提供文本处理管道，包括提取、过滤和批次调度

pub mod batch;
pub mod collector;
pub mod filters;

// 重新导出主要类型
pub use batch::{Batch, BatchScheduler, BatchSchedulerConfig, BatchStats};
pub use collector::{CollectionStats, SelectionScope, TextExtractor, TranslationUnit};
pub use filters::{FilterReason, TextFilter};
