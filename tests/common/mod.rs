// 集成测试公共模块
//
// 提供可编排的翻译服务、测试文档和配置构建器

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use cad_translator::host::{ElementHandle, HostApiThread, InMemoryDocument};
use cad_translator::translation::core::{
    ProgressEvent, ProviderError, ProviderRequest, RunOutcome, TranslationProvider,
};
use cad_translator::translation::{Orchestrator, SelectionScope, TranslationConfig};

/// 译文前缀
pub const TRANSLATED_PREFIX: &str = "zh:";

pub fn translated(text: &str) -> String {
    format!("{}{}", TRANSLATED_PREFIX, text)
}

/// 可编排的翻译服务
///
/// 记录调用次数、每次请求的大小和最大并发数。
#[derive(Default)]
pub struct ScriptedProvider {
    delay: Duration,
    transient_failures: AtomicUsize,
    reject_marker: Option<String>,
    rate_limited: Option<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    request_sizes: Mutex<Vec<usize>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每次请求的模拟耗时
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// 前 `count` 次请求返回可重试的服务端错误
    pub fn with_transient_failures(self, count: usize) -> Self {
        self.transient_failures.store(count, Ordering::SeqCst);
        self
    }

    /// 包含 `marker` 的请求被永久拒绝
    pub fn rejecting(mut self, marker: &str) -> Self {
        self.reject_marker = Some(marker.to_string());
        self
    }

    /// 每次请求都被限流，并要求等待 `retry_after`
    pub fn always_rate_limited(mut self, retry_after: Duration) -> Self {
        self.rate_limited = Some(retry_after);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn request_sizes(&self) -> Vec<usize> {
        self.request_sizes.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn take_transient_failure(&self) -> bool {
        self.transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TranslationProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn translate(&self, request: &ProviderRequest) -> Result<Vec<String>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut sizes) = self.request_sizes.lock() {
            sizes.push(request.texts.len());
        }

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if let Some(retry_after) = self.rate_limited {
            return Err(ProviderError::RateLimited {
                retry_after: Some(retry_after),
            });
        }

        if self.take_transient_failure() {
            return Err(ProviderError::ServerError {
                status: 503,
                message: "service unavailable".to_string(),
            });
        }

        if let Some(marker) = &self.reject_marker {
            if request.texts.iter().any(|t| t.contains(marker.as_str())) {
                return Err(ProviderError::InvalidRequest(format!("rejected: {}", marker)));
            }
        }

        Ok(request.texts.iter().map(|t| translated(t)).collect())
    }
}

/// 测试配置构建器
pub struct TestConfigBuilder {
    config: TranslationConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        let mut config = TranslationConfig::default();
        config.max_requests_per_second = 1000.0;
        config.retry_base_delay_ms = 1;
        config.retry_jitter = false;
        config.request_timeout_secs = 5;
        config.cache_enabled = false;
        Self { config }
    }

    pub fn batch_max_units(mut self, units: usize) -> Self {
        self.config.batch_max_units = units;
        self
    }

    pub fn max_concurrent_requests(mut self, count: usize) -> Self {
        self.config.max_concurrent_requests = count;
        self
    }

    pub fn writes_per_transaction(mut self, count: usize) -> Self {
        self.config.writes_per_transaction = count;
        self
    }

    pub fn max_retry_attempts(mut self, count: usize) -> Self {
        self.config.max_retry_attempts = count;
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = secs;
        self
    }

    pub fn with_cache(mut self) -> Self {
        self.config.cache_enabled = true;
        self
    }

    pub fn build(self) -> TranslationConfig {
        self.config
    }
}

/// 构建测试文档
pub struct DocumentBuilder;

impl DocumentBuilder {
    /// `count` 个房间，名称为 "Room 0" .. "Room N"
    pub fn rooms(count: usize) -> (InMemoryDocument, Vec<ElementHandle>) {
        let mut doc = InMemoryDocument::new();
        let handles = (0..count)
            .map(|i| doc.add_element("Rooms", [("Name", format!("Room {}", i))]))
            .collect();
        (doc, handles)
    }

    /// 同一组元素同时出现在两个视图中
    pub fn shared_views(count: usize) -> (InMemoryDocument, Vec<ElementHandle>) {
        let (mut doc, handles) = Self::rooms(count);
        doc.add_view("Level 1", handles.clone());
        doc.add_view("Level 2", handles.clone());
        (doc, handles)
    }
}

/// 在新的API线程上跑完一次运行
pub async fn run_to_end(
    doc: InMemoryDocument,
    config: TranslationConfig,
    provider: Arc<dyn TranslationProvider>,
    scope: SelectionScope,
) -> (RunOutcome, InMemoryDocument) {
    let api = HostApiThread::spawn(doc).expect("spawn api thread");
    let orchestrator = Orchestrator::new(Arc::new(config), provider);
    let outcome = orchestrator
        .start_run(scope, api.context())
        .wait()
        .await
        .expect("run task");

    let doc = take_document(&api).await;
    (outcome, doc)
}

/// 从API线程取回文档快照
pub async fn take_document(api: &HostApiThread<InMemoryDocument>) -> InMemoryDocument {
    let snapshot = api
        .context()
        .run(|doc: &mut InMemoryDocument| doc.to_snapshot())
        .await
        .expect("api thread alive");
    InMemoryDocument::from_snapshot(snapshot)
}

/// 收集事件直到通道关闭
pub async fn drain_events(
    mut events: tokio::sync::mpsc::UnboundedReceiver<ProgressEvent>,
) -> Vec<ProgressEvent> {
    let mut collected = Vec::new();
    while let Some(event) = events.recv().await {
        collected.push(event);
    }
    collected
}

/// 断言辅助工具
pub struct AssertionHelper;

impl AssertionHelper {
    /// 每个单元恰好计入一次
    pub fn assert_settled(outcome: &RunOutcome) {
        assert_eq!(
            outcome.completed_count + outcome.failed_count() + outcome.skipped_count,
            outcome.total,
            "Every unit should be counted exactly once: {:?}",
            outcome
        );
    }

    pub fn assert_all_translated(doc: &InMemoryDocument, handles: &[ElementHandle]) {
        for (i, handle) in handles.iter().enumerate() {
            assert_eq!(
                doc.field_text(*handle, "Name"),
                Some(translated(&format!("Room {}", i)).as_str()),
                "Element {} should be translated",
                handle
            );
        }
    }

    pub fn distinct_elements(outcome: &RunOutcome) -> HashSet<ElementHandle> {
        outcome.failed_units.iter().map(|u| u.element).collect()
    }
}
