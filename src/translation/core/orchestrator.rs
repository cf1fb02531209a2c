//! 运行编排器
//!
//! 驱动一次完整的翻译运行：
//!
//! ```text
//! Idle → Extracting → Translating ⇄ Applying → Completed | Cancelled | Failed
//! ```
//!
//! - 提取在宿主API线程上顺序执行
//! - 批次翻译作为独立任务并发执行，最多 C 个在途
//! - 每个完成的批次立即交给写回应用器，同时后续批次继续翻译
//! - 只有编排器任务修改运行状态，翻译任务通过通道回报结果
//!
//! 取消是协作式的：不再放行新批次，在途批次跑完但结果被丢弃，已提交的写入保留。
//! 单元和批次级的失败只会累积到结果摘要中，只有提取失败和会话失效会让运行失败。

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::host::{ApiContext, HostDocument};
use crate::translation::config::TranslationConfig;
use crate::translation::core::applicator::{ApplyReport, MutationApplicator, UnitOutcome};
use crate::translation::core::client::{TranslationClient, UnitResult};
use crate::translation::core::progress::{
    FailedUnit, ProgressEvent, ProgressSnapshot, RunOutcome, RunPhase, RunStatus,
};
use crate::translation::core::provider::TranslationProvider;
use crate::translation::error::{helpers, TranslationError, TranslationResult};
use crate::translation::pipeline::batch::{Batch, BatchScheduler, BatchSchedulerConfig};
use crate::translation::pipeline::collector::{SelectionScope, TextExtractor, TranslationUnit};
use crate::translation::pipeline::filters::TextFilter;
use crate::translation::storage::cache::{CacheConfig, TranslationCache};

const REASON_CANCELLED: &str = "运行已取消，结果已丢弃";
const REASON_CANCELLED_UNSENT: &str = "运行已取消，未发送";
const REASON_ABORTED: &str = "运行已终止，结果已丢弃";
const REASON_ABORTED_UNSENT: &str = "运行已终止，未发送";
const REASON_TASK_LOST: &str = "翻译任务异常终止";

/// 运行状态
///
/// 只由编排器任务修改，计数单调递增。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunState {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: bool,
}

impl RunState {
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            completed: self.completed,
            failed: self.failed,
            skipped: self.skipped,
            total: self.total,
        }
    }

    /// 每个单元是否都已恰好计入一次
    pub fn is_settled(&self) -> bool {
        self.completed + self.failed + self.skipped == self.total
    }
}

/// 翻译编排器
///
/// 配置在构造时确定，之后所有运行共享同一份只读配置和翻译记忆。
pub struct Orchestrator {
    config: Arc<TranslationConfig>,
    provider: Arc<dyn TranslationProvider>,
    cache: Option<Arc<TranslationCache>>,
}

impl Orchestrator {
    pub fn new(config: Arc<TranslationConfig>, provider: Arc<dyn TranslationProvider>) -> Self {
        let cache = TranslationCache::from_config(&CacheConfig::from(config.as_ref())).map(Arc::new);
        Self {
            config,
            provider,
            cache,
        }
    }

    /// 替换翻译记忆，传入 `None` 时关闭
    pub fn with_cache(mut self, cache: Option<Arc<TranslationCache>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn config(&self) -> &TranslationConfig {
        &self.config
    }

    pub fn cache(&self) -> Option<&Arc<TranslationCache>> {
        self.cache.as_ref()
    }

    /// 开始一次运行
    ///
    /// 必须在 tokio 运行时中调用。运行立即进入 `Extracting`，返回的句柄
    /// 用于取消、订阅进度和等待结果。
    ///
    /// # 参数
    ///
    /// * `scope` - 用户确认的选择范围
    /// * `api` - 宿主API线程的执行上下文，所有文档访问都经由它完成
    pub fn start_run<D>(&self, scope: SelectionScope, api: ApiContext<D>) -> RunHandle
    where
        D: HostDocument + 'static,
    {
        let run_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(RunPhase::Idle);

        let mut client = TranslationClient::new(
            Arc::clone(&self.provider),
            (&*self.config).into(),
        );
        if let Some(cache) = &self.cache {
            client = client.with_cache(Arc::clone(cache));
        }

        let task = RunTask::new(
            run_id,
            Arc::clone(&self.config),
            client,
            api,
            cancel.clone(),
            events_tx,
            phase_tx,
        );
        let span = tracing::info_span!("translation_run", run_id = %run_id);
        let handle = tokio::spawn(task.run(scope).instrument(span));

        RunHandle {
            run_id,
            cancel,
            events: Some(events_rx),
            phase: phase_rx,
            task: handle,
        }
    }
}

/// 运行句柄
pub struct RunHandle {
    run_id: Uuid,
    cancel: CancellationToken,
    events: Option<mpsc::UnboundedReceiver<ProgressEvent>>,
    phase: watch::Receiver<RunPhase>,
    task: JoinHandle<RunOutcome>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// 请求取消运行，可重复调用
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!(run_id = %self.run_id, "收到取消请求");
        }
        self.cancel.cancel();
    }

    /// 取消令牌的克隆，可交给信号处理等外部组件
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 取走进度事件接收端，只能取一次
    ///
    /// 取走之前产生的事件都会保留在通道中。
    pub fn subscribe(&mut self) -> Option<mpsc::UnboundedReceiver<ProgressEvent>> {
        self.events.take()
    }

    /// 当前运行阶段
    pub fn phase(&self) -> RunPhase {
        *self.phase.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// 等待运行结束
    ///
    /// # 错误
    ///
    /// 只有运行任务本身崩溃时返回 [`TranslationError::InternalError`]；
    /// 取消和失败都体现在 [`RunOutcome::status`] 中。
    pub async fn wait(self) -> TranslationResult<RunOutcome> {
        self.task
            .await
            .map_err(|e| helpers::internal_error(format!("运行任务异常终止: {}", e)))
    }
}

/// 翻译任务回报的批次结果
#[derive(Debug)]
struct BatchReport {
    batch_id: usize,
    results: Vec<UnitResult>,
}

/// 保证每个翻译任务都会回报
///
/// 任务在交付结果前被丢弃（崩溃或被中止）时，把整批单元作为失败回报。
struct ReportGuard {
    batch_id: usize,
    units: Option<Vec<TranslationUnit>>,
    reports: mpsc::UnboundedSender<BatchReport>,
}

impl ReportGuard {
    fn deliver(mut self, results: Vec<UnitResult>) {
        self.units = None;
        let _ = self.reports.send(BatchReport {
            batch_id: self.batch_id,
            results,
        });
    }
}

impl Drop for ReportGuard {
    fn drop(&mut self) {
        if let Some(units) = self.units.take() {
            let results = units
                .into_iter()
                .map(|unit| UnitResult::failed(unit, REASON_TASK_LOST))
                .collect();
            let _ = self.reports.send(BatchReport {
                batch_id: self.batch_id,
                results,
            });
        }
    }
}

/// 一次运行的全部状态，归编排器任务独占
struct RunTask<D> {
    run_id: Uuid,
    config: Arc<TranslationConfig>,
    client: Arc<TranslationClient>,
    scheduler: BatchScheduler,
    api: ApiContext<D>,
    /// 用户的取消信号
    cancel: CancellationToken,
    /// 停止放行新批次：取消或致命错误时触发
    stop: CancellationToken,
    events: mpsc::UnboundedSender<ProgressEvent>,
    phase: watch::Sender<RunPhase>,
    state: RunState,
    failed_units: Vec<FailedUnit>,
    fatal: Option<TranslationError>,
    applicator: Option<MutationApplicator>,
    seen_batches: HashSet<usize>,
    started_at: DateTime<Utc>,
}

impl<D: HostDocument + 'static> RunTask<D> {
    fn new(
        run_id: Uuid,
        config: Arc<TranslationConfig>,
        client: TranslationClient,
        api: ApiContext<D>,
        cancel: CancellationToken,
        events: mpsc::UnboundedSender<ProgressEvent>,
        phase: watch::Sender<RunPhase>,
    ) -> Self {
        let scheduler = BatchScheduler::new(BatchSchedulerConfig::from(config.as_ref()));
        let applicator = MutationApplicator::from_config(&config);
        let stop = cancel.child_token();

        Self {
            run_id,
            config,
            client: Arc::new(client),
            scheduler,
            api,
            cancel,
            stop,
            events,
            phase,
            state: RunState::default(),
            failed_units: Vec::new(),
            fatal: None,
            applicator: Some(applicator),
            seen_batches: HashSet::new(),
            started_at: Utc::now(),
        }
    }

    async fn run(mut self, scope: SelectionScope) -> RunOutcome {
        tracing::info!(
            "开始翻译运行: {} 个类别, {} 个视图, 目标语言 {}, 服务 {}",
            scope.categories().len(),
            scope.views().len(),
            self.config.target_lang,
            self.client.provider_name()
        );

        self.enter(RunPhase::Extracting);
        let units = match self.extract(scope).await {
            Ok(units) => units,
            Err(e) => {
                self.fail(e);
                return self.finish();
            }
        };

        self.state.total = units.len();
        self.emit_progress();

        if self.stop.is_cancelled() {
            self.skip(units.iter(), REASON_CANCELLED_UNSENT);
            return self.finish();
        }

        self.enter(RunPhase::Translating);
        let batches = self.scheduler.create_batches(units);
        self.dispatch(batches).await;
        self.finish()
    }

    /// 在API线程上提取全部翻译单元
    async fn extract(&mut self, scope: SelectionScope) -> TranslationResult<Vec<TranslationUnit>> {
        let filter = TextFilter::new().with_non_linguistic_filter(self.config.filter_non_linguistic);
        let source_lang = self.config.source_lang.clone();

        let (units, stats) = self
            .api
            .run(move |document: &mut D| {
                TextExtractor::new(&*document, &scope, filter, source_lang).collect_all()
            })
            .await??;

        tracing::info!(
            "提取到 {} 个翻译单元 (访问 {} 个元素, 去重 {} 个, 过滤 {} 个字段)",
            units.len(),
            stats.elements_visited,
            stats.duplicate_elements,
            stats.filtered_fields
        );
        Ok(units)
    }

    /// 放行批次、接收结果并写回，直到所有批次都有了结局
    async fn dispatch(&mut self, batches: Vec<Batch>) {
        let (reports_tx, mut reports_rx) = mpsc::unbounded_channel::<BatchReport>();
        let mut queue: VecDeque<Batch> = batches.into();
        let mut in_flight = 0usize;

        loop {
            let stopping = self.stop.is_cancelled();
            if in_flight == 0 && (queue.is_empty() || stopping) {
                break;
            }

            tokio::select! {
                biased;

                Some(report) = reports_rx.recv(), if in_flight > 0 => {
                    in_flight -= 1;
                    let more_work = in_flight > 0 || !queue.is_empty();
                    self.handle_report(report, more_work).await;
                }

                permit = self.scheduler.admit(&self.stop), if !queue.is_empty() && !stopping => {
                    // 取消时没有许可，批次留在队列里，循环结束后统一跳过
                    if let Some(permit) = permit {
                        if let Some(batch) = queue.pop_front() {
                            in_flight += 1;
                            self.spawn_translation(batch, permit, reports_tx.clone());
                        }
                    }
                }

                else => break,
            }
        }

        let reason = if self.fatal.is_some() {
            REASON_ABORTED_UNSENT
        } else {
            REASON_CANCELLED_UNSENT
        };
        for batch in queue {
            self.skip(batch.units().iter(), reason);
        }
        self.emit_progress();
    }

    fn spawn_translation(
        &self,
        batch: Batch,
        permit: OwnedSemaphorePermit,
        reports: mpsc::UnboundedSender<BatchReport>,
    ) {
        tracing::debug!("发送{}", batch.summary());
        let client = Arc::clone(&self.client);
        let stop = self.stop.clone();
        let guard = ReportGuard {
            batch_id: batch.id(),
            units: Some(batch.units().to_vec()),
            reports,
        };

        tokio::spawn(
            async move {
                let results = client.translate(&batch, &stop).await;
                drop(permit);
                guard.deliver(results);
            }
            .instrument(tracing::Span::current()),
        );
    }

    async fn handle_report(&mut self, report: BatchReport, more_work: bool) {
        if !self.seen_batches.insert(report.batch_id) {
            tracing::warn!("忽略重复的批次报告: 批次 {}", report.batch_id);
            return;
        }

        if self.stop.is_cancelled() {
            let reason = if self.fatal.is_some() {
                REASON_ABORTED
            } else {
                REASON_CANCELLED
            };
            self.skip(report.results.iter().map(UnitResult::unit), reason);
            self.emit_progress();
            return;
        }

        self.enter(RunPhase::Applying);

        let units: Vec<TranslationUnit> = report.results.iter().map(|r| r.unit().clone()).collect();
        let mut applicator = self
            .applicator
            .take()
            .unwrap_or_else(|| MutationApplicator::from_config(&self.config));
        let results = report.results;
        let stop = self.stop.clone();

        let applied = self
            .api
            .run(move |document: &mut D| {
                let report = applicator.apply_batch(document, &results, &stop);
                (applicator, report)
            })
            .await;

        match applied {
            Ok((applicator, apply_report)) => {
                self.applicator = Some(applicator);
                tracing::debug!(
                    "批次 {} 写回: {} 个写入, {} 个事务",
                    report.batch_id,
                    apply_report.applied_count(),
                    apply_report.transactions
                );
                self.record(apply_report);
            }
            Err(e) => {
                self.skip(units.iter(), REASON_ABORTED);
                self.fail(e.into());
            }
        }

        self.emit_progress();
        if more_work && !self.stop.is_cancelled() {
            self.enter(RunPhase::Translating);
        }
    }

    fn record(&mut self, report: ApplyReport) {
        if report.duplicates > 0 {
            tracing::warn!("{} 个结果已写入过，被忽略", report.duplicates);
        }

        for applied in report.units {
            match applied.outcome {
                UnitOutcome::Applied => self.state.completed += 1,
                UnitOutcome::Failed(reason) => {
                    self.state.failed += 1;
                    self.failed_units.push(FailedUnit {
                        element: applied.unit.element(),
                        field: applied.unit.field().clone(),
                        reason,
                    });
                }
                UnitOutcome::Skipped(reason) => {
                    tracing::debug!(
                        "单元 {}/{} 跳过: {}",
                        applied.unit.element(),
                        applied.unit.field(),
                        reason
                    );
                    self.state.skipped += 1;
                }
            }
        }

        if let Some(error) = report.fatal {
            self.fail(error.into());
        }
    }

    fn skip<'a>(&mut self, units: impl Iterator<Item = &'a TranslationUnit>, reason: &str) {
        let count = units.count();
        if count > 0 {
            tracing::debug!("{} 个单元跳过: {}", count, reason);
            self.state.skipped += count;
        }
    }

    fn fail(&mut self, error: TranslationError) {
        helpers::log_error(&error);
        if self.fatal.is_none() {
            self.fatal = Some(error);
        }
        self.stop.cancel();
    }

    fn enter(&mut self, phase: RunPhase) {
        if *self.phase.borrow() == phase {
            return;
        }
        tracing::debug!("运行阶段 -> {}", phase);
        self.phase.send_replace(phase);
        self.emit(ProgressEvent::Phase(phase));
    }

    fn emit_progress(&self) {
        self.emit(ProgressEvent::Progress(self.state.snapshot()));
    }

    fn emit(&self, event: ProgressEvent) {
        // 没有订阅者时丢弃事件
        let _ = self.events.send(event);
    }

    fn finish(mut self) -> RunOutcome {
        let status = if self.fatal.is_some() {
            RunStatus::Failed
        } else if self.cancel.is_cancelled() {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };
        self.state.cancelled = status == RunStatus::Cancelled;

        if !self.state.is_settled() {
            tracing::error!(
                "单元计数不一致: 完成 {} + 失败 {} + 跳过 {} != 共 {}",
                self.state.completed,
                self.state.failed,
                self.state.skipped,
                self.state.total
            );
        }

        let outcome = RunOutcome {
            run_id: self.run_id,
            status,
            completed_count: self.state.completed,
            skipped_count: self.state.skipped,
            total: self.state.total,
            failed_units: std::mem::take(&mut self.failed_units),
            error: self.fatal.as_ref().map(ToString::to_string),
            started_at: self.started_at,
            finished_at: Utc::now(),
        };

        let stats = self.client.stats();
        tracing::info!(
            "运行结束 ({:?}): 请求 {} 次, 重试 {} 次, 缓存命中 {} 次",
            status,
            stats.get_requests(),
            stats.get_retries(),
            stats.get_cache_hits()
        );

        self.enter(status.into());
        self.emit(ProgressEvent::Finished(outcome.clone()));
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{ElementHandle, HostApiThread, InMemoryDocument};
    use crate::translation::core::provider::PseudoProvider;

    fn task_for(
        api: ApiContext<InMemoryDocument>,
    ) -> (RunTask<InMemoryDocument>, mpsc::UnboundedReceiver<ProgressEvent>) {
        task_with_config(api, TranslationConfig::default())
    }

    fn task_with_config(
        api: ApiContext<InMemoryDocument>,
        config: TranslationConfig,
    ) -> (RunTask<InMemoryDocument>, mpsc::UnboundedReceiver<ProgressEvent>) {
        let config = Arc::new(config);
        let client = TranslationClient::new(Arc::new(PseudoProvider::new()), (&*config).into());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (phase_tx, _) = watch::channel(RunPhase::Idle);
        let task = RunTask::new(
            Uuid::new_v4(),
            config,
            client,
            api,
            CancellationToken::new(),
            events_tx,
            phase_tx,
        );
        (task, events_rx)
    }

    #[tokio::test]
    async fn test_duplicate_batch_report_is_ignored() {
        let mut doc = InMemoryDocument::new();
        let handle = doc.add_element("Rooms", [("Name", "Lobby")]);
        let api = HostApiThread::spawn(doc).unwrap();
        let (mut task, _events) = task_for(api.context());

        let unit = TranslationUnit::new(handle, "Name", "Lobby", "auto");
        task.state.total = 1;
        let report = || BatchReport {
            batch_id: 1,
            results: vec![UnitResult::success(unit.clone(), "大堂")],
        };

        task.handle_report(report(), false).await;
        task.handle_report(report(), false).await;

        assert_eq!(task.state.completed, 1);
        assert!(task.state.is_settled());

        let writes = api
            .context()
            .run(|doc: &mut InMemoryDocument| doc.committed_writes())
            .await
            .unwrap();
        assert_eq!(writes, 1);
    }

    #[tokio::test]
    async fn test_report_guard_fails_units_when_dropped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let unit = TranslationUnit::new(ElementHandle::new(1), "Name", "Lobby", "en");
        drop(ReportGuard {
            batch_id: 4,
            units: Some(vec![unit]),
            reports: tx,
        });

        let report = rx.recv().await.unwrap();
        assert_eq!(report.batch_id, 4);
        assert!(!report.results[0].is_success());
    }

    #[tokio::test]
    async fn test_phases_are_emitted_once_per_change() {
        let api = HostApiThread::spawn(InMemoryDocument::new()).unwrap();
        let (mut task, mut events) = task_for(api.context());

        task.enter(RunPhase::Extracting);
        task.enter(RunPhase::Extracting);
        task.enter(RunPhase::Translating);
        drop(task);

        let mut phases = Vec::new();
        while let Some(event) = events.recv().await {
            if let ProgressEvent::Phase(phase) = event {
                phases.push(phase);
            }
        }
        assert_eq!(phases, vec![RunPhase::Extracting, RunPhase::Translating]);
    }

    /// 等待放行时被取消的批次仍然计入跳过
    #[tokio::test]
    async fn test_batch_waiting_for_admission_is_skipped_on_cancel() {
        let api = HostApiThread::spawn(InMemoryDocument::new()).unwrap();
        let mut config = TranslationConfig::default();
        config.batch_max_units = 1;
        config.max_concurrent_requests = 1;
        let (mut task, _events) = task_with_config(api.context(), config);

        let units: Vec<TranslationUnit> = (1..=3)
            .map(|i| TranslationUnit::new(ElementHandle::new(i), "Name", format!("Room {}", i), "en"))
            .collect();
        task.state.total = units.len();
        let batches = task.scheduler.create_batches(units);
        assert_eq!(batches.len(), 3);

        // 占住唯一的并发位置，让第一个批次停在放行处
        let held = task.scheduler.admit(&CancellationToken::new()).await.unwrap();
        let stop = task.stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            stop.cancel();
        });

        task.dispatch(batches).await;
        drop(held);

        assert_eq!(task.state.skipped, 3);
        assert!(task.state.is_settled(), "{:?}", task.state);
    }
}
