//! 翻译记忆模块
//!
//! 以 (源语言, 目标语言, 源文本) 为键缓存已翻译的文本。
//! 容量由 LRU 淘汰约束，条目超过 TTL 后视为未命中。

use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::translation::config::{constants, TranslationConfig};

/// 缓存条目
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub translated_text: String,
    pub created_at: Instant,
    pub access_count: u64,
}

impl CacheEntry {
    pub fn new(translated_text: String) -> Self {
        Self {
            translated_text,
            created_at: Instant::now(),
            access_count: 0,
        }
    }

    /// 检查条目是否过期
    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() > ttl
    }
}

/// 缓存配置
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub capacity: usize,
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: constants::DEFAULT_LOCAL_CACHE_SIZE,
            ttl: constants::DEFAULT_CACHE_TTL,
        }
    }
}

impl From<&TranslationConfig> for CacheConfig {
    fn from(config: &TranslationConfig) -> Self {
        Self {
            enabled: config.cache_enabled,
            capacity: config.local_cache_size,
            ttl: config.cache_ttl(),
        }
    }
}

/// 缓存统计信息
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub expired: u64,
    pub total_entries: usize,
}

impl CacheStats {
    /// 命中率
    pub fn hit_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.cache_hits as f64 / self.total_requests as f64
        }
    }
}

struct Inner {
    entries: LruCache<blake3::Hash, CacheEntry>,
    stats: CacheStats,
}

/// 翻译缓存
pub struct TranslationCache {
    inner: Mutex<Inner>,
    ttl: Duration,
}

impl TranslationCache {
    /// 使用指定配置创建缓存
    ///
    /// 未启用或容量为0时返回 `None`。
    pub fn from_config(config: &CacheConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        let capacity = NonZeroUsize::new(config.capacity)?;
        Some(Self::with_capacity(capacity, config.ttl))
    }

    pub fn with_capacity(capacity: NonZeroUsize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                stats: CacheStats::default(),
            }),
            ttl,
        }
    }

    /// 生成缓存键
    pub fn cache_key(source_lang: &str, target_lang: &str, text: &str) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(source_lang.as_bytes());
        hasher.update(&[0]);
        hasher.update(target_lang.as_bytes());
        hasher.update(&[0]);
        hasher.update(text.as_bytes());
        hasher.finalize()
    }

    /// 查找译文
    pub fn get(&self, source_lang: &str, target_lang: &str, text: &str) -> Option<String> {
        let key = Self::cache_key(source_lang, target_lang, text);
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.stats.total_requests += 1;

        let expired = match inner.entries.get_mut(&key) {
            Some(entry) if !entry.is_expired(self.ttl) => {
                entry.access_count += 1;
                let translated = entry.translated_text.clone();
                inner.stats.cache_hits += 1;
                return Some(translated);
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            inner.entries.pop(&key);
            inner.stats.expired += 1;
        }
        inner.stats.cache_misses += 1;
        None
    }

    /// 插入译文
    pub fn insert(&self, source_lang: &str, target_lang: &str, text: &str, translated: &str) {
        let key = Self::cache_key(source_lang, target_lang, text);
        self.lock()
            .entries
            .put(key, CacheEntry::new(translated.to_string()));
    }

    /// 获取统计信息
    pub fn get_stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            total_entries: inner.entries.len(),
            ..inner.stats.clone()
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 清空缓存
    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// 清理过期条目
    pub fn cleanup_expired(&self) -> usize {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let expired: Vec<blake3::Hash> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(self.ttl))
            .map(|(key, _)| *key)
            .collect();

        for key in &expired {
            inner.entries.pop(key);
        }
        inner.stats.expired += expired.len() as u64;
        expired.len()
    }

    // 缓存内容在任何时刻都是自洽的，锁中毒时继续使用
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: usize, ttl: Duration) -> TranslationCache {
        TranslationCache::with_capacity(NonZeroUsize::new(capacity).unwrap(), ttl)
    }

    #[test]
    fn test_hit_and_miss() {
        let cache = cache(10, Duration::from_secs(60));
        assert_eq!(cache.get("en", "de", "Wall"), None);

        cache.insert("en", "de", "Wall", "Wand");
        assert_eq!(cache.get("en", "de", "Wall").as_deref(), Some("Wand"));

        // 语言对是键的一部分
        assert_eq!(cache.get("en", "fr", "Wall"), None);

        let stats = cache.get_stats();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 2);
        assert_eq!(stats.total_entries, 1);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = cache(2, Duration::from_secs(60));
        cache.insert("en", "de", "Wall", "Wand");
        cache.insert("en", "de", "Door", "Tür");
        assert!(cache.get("en", "de", "Wall").is_some());

        cache.insert("en", "de", "Window", "Fenster");
        assert_eq!(cache.len(), 2);
        assert!(cache.get("en", "de", "Door").is_none());
        assert!(cache.get("en", "de", "Wall").is_some());
    }

    #[test]
    fn test_expired_entries_miss() {
        let cache = cache(10, Duration::ZERO);
        cache.insert("en", "de", "Wall", "Wand");
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(cache.get("en", "de", "Wall"), None);
        assert_eq!(cache.get_stats().expired, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_disabled_config_builds_no_cache() {
        let config = CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        };
        assert!(TranslationCache::from_config(&config).is_none());
        assert!(TranslationCache::from_config(&CacheConfig::default()).is_some());
    }

    #[test]
    fn test_key_separates_fields() {
        assert_ne!(
            TranslationCache::cache_key("en", "de", "x"),
            TranslationCache::cache_key("en", "dex", "")
        );
    }
}
