//! 存储模块
//!
//! 提供翻译记忆缓存。

pub mod cache;

pub use cache::{CacheConfig, CacheEntry, CacheStats, TranslationCache};
