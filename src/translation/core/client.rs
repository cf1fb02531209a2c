//! 翻译客户端
//!
//! 把一个批次发送给翻译服务，并保证：
//! - 每个输入单元恰好产生一个结果，顺序与输入一致
//! - 临时性错误按指数退避重试，永久性错误立即使整批失败
//! - 每次尝试都有超时，不会无限期阻塞
//! - 运行取消后不再发起新的尝试，退避等待随取消立即结束

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::translation::config::{constants, TranslationConfig};
use crate::translation::core::provider::{ProviderError, ProviderRequest, TranslationProvider};
use crate::translation::error::TranslationError;
use crate::translation::pipeline::batch::Batch;
use crate::translation::pipeline::collector::TranslationUnit;
use crate::translation::storage::cache::{CacheConfig, TranslationCache};

const REASON_CANCELLED: &str = "运行已取消，未再重试";

/// 单元处理状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum UnitStatus {
    Success,
    Failed(String),
    Skipped(String),
}

/// 单个翻译单元的结果
///
/// 由客户端为每个单元创建，之后不再修改。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitResult {
    unit: TranslationUnit,
    translated_text: Option<String>,
    status: UnitStatus,
}

impl UnitResult {
    pub fn success(unit: TranslationUnit, translated_text: impl Into<String>) -> Self {
        Self {
            unit,
            translated_text: Some(translated_text.into()),
            status: UnitStatus::Success,
        }
    }

    pub fn failed(unit: TranslationUnit, reason: impl Into<String>) -> Self {
        Self {
            unit,
            translated_text: None,
            status: UnitStatus::Failed(reason.into()),
        }
    }

    pub fn skipped(unit: TranslationUnit, reason: impl Into<String>) -> Self {
        Self {
            unit,
            translated_text: None,
            status: UnitStatus::Skipped(reason.into()),
        }
    }

    pub fn unit(&self) -> &TranslationUnit {
        &self.unit
    }

    pub fn translated_text(&self) -> Option<&str> {
        self.translated_text.as_deref()
    }

    pub fn status(&self) -> &UnitStatus {
        &self.status
    }

    pub fn is_success(&self) -> bool {
        self.status == UnitStatus::Success
    }
}

/// 重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 总尝试次数（包括第一次）
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub multiplier: f64,
    /// 是否在延迟上叠加随机抖动
    pub jitter: bool,
    /// 单次等待的上限，服务提示也不能超过它
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// 第 `attempt` 次尝试失败后的等待时间（`attempt` 从1开始）
    ///
    /// 延迟 = base_delay * multiplier^(attempt-1)，可叠加不超过
    /// [`constants::RETRY_JITTER_RATIO`] 的抖动；服务给出更长的
    /// `retry_after` 时以服务为准。结果不超过 `max_delay`。
    pub fn backoff(&self, attempt: usize, retry_after: Option<Duration>) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let mut delay = self.base_delay.mul_f64(factor);

        if self.jitter && !delay.is_zero() {
            let extra = rand::thread_rng().gen_range(0.0..=constants::RETRY_JITTER_RATIO);
            delay += delay.mul_f64(extra);
        }

        let delay = match retry_after {
            Some(hint) if hint > delay => hint,
            _ => delay,
        };
        delay.min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: constants::DEFAULT_MAX_RETRY_ATTEMPTS,
            base_delay: constants::DEFAULT_RETRY_BASE_DELAY,
            multiplier: constants::DEFAULT_RETRY_MULTIPLIER,
            jitter: true,
            max_delay: constants::DEFAULT_RETRY_MAX_DELAY,
        }
    }
}

/// 客户端配置
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub source_lang: String,
    pub target_lang: String,
    /// 单次尝试的超时
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    /// 两次请求开始之间的最小间隔
    pub min_request_interval: Duration,
}

impl From<&TranslationConfig> for ClientConfig {
    fn from(config: &TranslationConfig) -> Self {
        Self {
            source_lang: config.source_lang.clone(),
            target_lang: config.target_lang.clone(),
            request_timeout: config.request_timeout(),
            retry: RetryPolicy {
                max_attempts: config.max_retry_attempts,
                base_delay: config.retry_base_delay(),
                multiplier: config.retry_multiplier,
                jitter: config.retry_jitter,
                max_delay: config.retry_max_delay(),
            },
            min_request_interval: config.min_request_interval(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from(&TranslationConfig::default())
    }
}

/// 请求速率限制器
///
/// 按固定间隔为每个请求分配开始时间，多个并发批次共享同一个限制器。
struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    async fn acquire(&self) {
        if self.interval.is_zero() {
            return;
        }

        let slot = {
            let mut next_slot = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = next_slot.map_or(now, |next| next.max(now));
            *next_slot = slot.checked_add(self.interval);
            slot
        };
        sleep_until(slot).await;
    }
}

/// 客户端统计信息
#[derive(Debug, Default)]
pub struct ClientStats {
    /// 发给服务的请求次数（包括重试）
    pub requests: AtomicUsize,
    pub retries: AtomicUsize,
    /// 最终失败的批次数
    pub failed_batches: AtomicUsize,
    pub characters_sent: AtomicUsize,
    pub characters_received: AtomicUsize,
    pub cache_hits: AtomicUsize,
}

impl ClientStats {
    pub fn get_requests(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn get_retries(&self) -> usize {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn get_failed_batches(&self) -> usize {
        self.failed_batches.load(Ordering::Relaxed)
    }

    pub fn get_characters_sent(&self) -> usize {
        self.characters_sent.load(Ordering::Relaxed)
    }

    pub fn get_characters_received(&self) -> usize {
        self.characters_received.load(Ordering::Relaxed)
    }

    pub fn get_cache_hits(&self) -> usize {
        self.cache_hits.load(Ordering::Relaxed)
    }
}

/// 翻译客户端
pub struct TranslationClient {
    provider: Arc<dyn TranslationProvider>,
    config: ClientConfig,
    cache: Option<Arc<TranslationCache>>,
    limiter: RateLimiter,
    stats: ClientStats,
}

impl TranslationClient {
    pub fn new(provider: Arc<dyn TranslationProvider>, config: ClientConfig) -> Self {
        let limiter = RateLimiter::new(config.min_request_interval);
        Self {
            provider,
            config,
            cache: None,
            limiter,
            stats: ClientStats::default(),
        }
    }

    /// 按完整配置创建客户端，启用缓存时同时创建翻译记忆
    pub fn from_config(provider: Arc<dyn TranslationProvider>, config: &TranslationConfig) -> Self {
        let client = Self::new(provider, ClientConfig::from(config));
        match TranslationCache::from_config(&CacheConfig::from(config)) {
            Some(cache) => client.with_cache(Arc::new(cache)),
            None => client,
        }
    }

    /// 使用共享的翻译记忆
    pub fn with_cache(mut self, cache: Arc<TranslationCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// 获取统计信息
    pub fn stats(&self) -> &ClientStats {
        &self.stats
    }

    /// 翻译一个批次
    ///
    /// # 返回值
    ///
    /// 与 `batch.units()` 等长、同序的结果列表。命中翻译记忆的单元不会发给服务；
    /// 批次失败时其余单元全部标记为 `Failed`；空白译文标记为 `Skipped`；
    /// `cancel` 触发后未完成的单元标记为 `Skipped`。
    pub async fn translate(&self, batch: &Batch, cancel: &CancellationToken) -> Vec<UnitResult> {
        let units = batch.units();
        let mut results: Vec<Option<UnitResult>> = vec![None; units.len()];
        let mut pending: Vec<usize> = Vec::with_capacity(units.len());

        for (index, unit) in units.iter().enumerate() {
            match self.lookup_cache(unit) {
                Some(text) => results[index] = Some(UnitResult::success(unit.clone(), text)),
                None => pending.push(index),
            }
        }

        if !pending.is_empty() {
            let request = ProviderRequest {
                source_lang: self.config.source_lang.clone(),
                target_lang: self.config.target_lang.clone(),
                texts: pending
                    .iter()
                    .map(|&index| units[index].source_text().to_string())
                    .collect(),
            };

            match self.send_with_retry(batch.id(), &request, cancel).await {
                Exchange::Translated(texts) => {
                    for (&index, text) in pending.iter().zip(texts) {
                        results[index] = Some(self.accept(&units[index], text));
                    }
                }
                Exchange::Cancelled => {
                    for &index in &pending {
                        results[index] =
                            Some(UnitResult::skipped(units[index].clone(), REASON_CANCELLED));
                    }
                }
                Exchange::Failed(error) => {
                    self.stats.failed_batches.fetch_add(1, Ordering::Relaxed);
                    let reason = error.to_string();
                    for &index in &pending {
                        results[index] = Some(UnitResult::failed(units[index].clone(), &reason));
                    }
                }
            }
        }

        let results: Vec<UnitResult> = results.into_iter().flatten().collect();
        debug_assert_eq!(results.len(), units.len());
        results
    }

    fn lookup_cache(&self, unit: &TranslationUnit) -> Option<String> {
        let text = self.cache.as_ref()?.get(
            unit.source_language(),
            &self.config.target_lang,
            unit.source_text(),
        )?;
        self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
        Some(text)
    }

    fn accept(&self, unit: &TranslationUnit, text: String) -> UnitResult {
        if text.trim().is_empty() {
            tracing::warn!("单元 {}/{} 的译文为空，跳过", unit.element(), unit.field());
            return UnitResult::skipped(unit.clone(), "翻译服务返回了空译文");
        }

        if let Some(cache) = &self.cache {
            cache.insert(
                unit.source_language(),
                &self.config.target_lang,
                unit.source_text(),
                &text,
            );
        }
        UnitResult::success(unit.clone(), text)
    }

    /// 发送请求，临时性错误在预算内重试
    ///
    /// 已发出的请求总会等到结果或超时；取消只阻止新的尝试。
    async fn send_with_retry(
        &self,
        batch_id: usize,
        request: &ProviderRequest,
        cancel: &CancellationToken,
    ) -> Exchange {
        let max_attempts = self.config.retry.max_attempts.max(1);
        let chars: usize = request.texts.iter().map(|t| t.chars().count()).sum();
        let mut attempt = 0;

        loop {
            attempt += 1;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!("批次 {} 在第 {} 次尝试前取消", batch_id, attempt);
                    return Exchange::Cancelled;
                }
                _ = self.limiter.acquire() => {}
            }
            self.stats.requests.fetch_add(1, Ordering::Relaxed);
            self.stats.characters_sent.fetch_add(chars, Ordering::Relaxed);

            let outcome = timeout(self.config.request_timeout, self.provider.translate(request))
                .await
                .unwrap_or(Err(ProviderError::Timeout(self.config.request_timeout)));

            let error = match outcome {
                Ok(texts) if texts.len() == request.texts.len() => {
                    let received: usize = texts.iter().map(|t| t.chars().count()).sum();
                    self.stats
                        .characters_received
                        .fetch_add(received, Ordering::Relaxed);
                    tracing::debug!("批次 {} 翻译完成 (尝试 {})", batch_id, attempt);
                    return Exchange::Translated(texts);
                }
                Ok(texts) => ProviderError::ResponseMismatch {
                    expected: request.texts.len(),
                    actual: texts.len(),
                },
                Err(error) => error,
            };

            if !error.is_transient() {
                tracing::warn!("批次 {} 翻译失败，不重试: {}", batch_id, error);
                return Exchange::Failed(error.into());
            }

            if attempt >= max_attempts {
                tracing::warn!("批次 {} 翻译失败，已尝试 {} 次: {}", batch_id, attempt, error);
                return Exchange::Failed(
                    TranslationError::from(error).with_context(format!("已尝试 {} 次", attempt)),
                );
            }

            let delay = self.config.retry.backoff(attempt, error.retry_after());
            self.stats.retries.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "批次 {} 翻译失败，{}ms后重试 (尝试 {}/{}): {}",
                batch_id,
                delay.as_millis(),
                attempt + 1,
                max_attempts,
                error
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!("批次 {} 在退避等待中取消", batch_id);
                    return Exchange::Cancelled;
                }
                _ = sleep(delay) => {}
            }
        }
    }
}

/// 一次带重试的请求的结局
enum Exchange {
    Translated(Vec<String>),
    Cancelled,
    Failed(TranslationError),
}
