//! 批次调度模块
//!
//! 把提取出的翻译单元按输入顺序分组为有界批次，并通过信号量控制
//! 同时在翻译服务处的批次数量。
//!
//! ## 分批规则
//!
//! - 每批最多 `max_units` 个单元（默认 50）
//! - 每批字符总数不超过 `max_chars`（默认 4000），字符按 Unicode 标量值计数
//! - 单个单元本身超过 `max_chars` 时独占一个批次，既不拆分也不丢弃
//! - 批次编号在每次运行中从 1 开始递增
//!
//! ## 并发窗口
//!
//! [`BatchScheduler::admit`] 在发送每个批次之前获取许可，最多 C 个批次
//! 同时在途（默认 4）。运行被取消后不再放行新的批次。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::translation::config::{constants, TranslationConfig};
use crate::translation::pipeline::collector::TranslationUnit;

/// 翻译批次
///
/// 由调度器创建、交给翻译客户端消费，生命周期不超过一次翻译尝试。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    id: usize,
    units: Vec<TranslationUnit>,
    total_chars: usize,
}

impl Batch {
    /// 创建批次
    ///
    /// # 参数
    ///
    /// * `id` - 本次运行内唯一的批次编号
    /// * `units` - 批次中的翻译单元，顺序即结果顺序
    pub fn new(id: usize, units: Vec<TranslationUnit>) -> Self {
        let total_chars = units.iter().map(TranslationUnit::char_count).sum();
        Self {
            id,
            units,
            total_chars,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn units(&self) -> &[TranslationUnit] {
        &self.units
    }

    pub fn into_units(self) -> Vec<TranslationUnit> {
        self.units
    }

    /// 批次字符总数
    pub fn total_chars(&self) -> usize {
        self.total_chars
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// 获取批次摘要信息
    pub fn summary(&self) -> String {
        format!(
            "批次 {}: {} 个单元, {} 字符",
            self.id,
            self.units.len(),
            self.total_chars
        )
    }
}

/// 批次调度器配置
#[derive(Debug, Clone)]
pub struct BatchSchedulerConfig {
    /// 单个批次的最大单元数
    pub max_units: usize,
    /// 单个批次的最大字符数
    pub max_chars: usize,
    /// 最大并发在途批次数量
    pub max_concurrent_batches: usize,
}

impl From<&TranslationConfig> for BatchSchedulerConfig {
    fn from(config: &TranslationConfig) -> Self {
        Self {
            max_units: config.batch_max_units,
            max_chars: config.batch_max_chars,
            max_concurrent_batches: config.max_concurrent_requests,
        }
    }
}

impl Default for BatchSchedulerConfig {
    fn default() -> Self {
        Self {
            max_units: constants::MAX_BATCH_UNITS,
            max_chars: constants::MAX_BATCH_CHARS,
            max_concurrent_batches: constants::DEFAULT_MAX_CONCURRENT_REQUESTS,
        }
    }
}

/// 批次调度器
///
/// 每次运行创建一个实例：批次编号和统计信息都是按运行计算的。
///
/// ## 内部组件
///
/// - `config`: 分批上限和并发窗口大小
/// - `stats`: 统计信息，使用Arc实现线程安全共享
/// - `next_batch_id`: 原子类型的ID生成器
/// - `semaphore`: 并发控制信号量
pub struct BatchScheduler {
    config: BatchSchedulerConfig,
    stats: Arc<BatchStats>,
    next_batch_id: AtomicUsize,
    semaphore: Arc<Semaphore>,
}

impl BatchScheduler {
    /// 创建新的批次调度器
    ///
    /// 上限为0的配置项按1处理，保证调度器总能前进。
    pub fn new(config: BatchSchedulerConfig) -> Self {
        let config = BatchSchedulerConfig {
            max_units: config.max_units.max(1),
            max_chars: config.max_chars.max(1),
            max_concurrent_batches: config.max_concurrent_batches.max(1),
        };
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_batches));

        Self {
            config,
            stats: Arc::new(BatchStats::default()),
            next_batch_id: AtomicUsize::new(1),
            semaphore,
        }
    }

    pub fn config(&self) -> &BatchSchedulerConfig {
        &self.config
    }

    /// 创建翻译批次
    ///
    /// # 参数
    ///
    /// * `units` - 按提取顺序排列的翻译单元
    ///
    /// # 返回值
    ///
    /// 按输入顺序分组的批次列表；所有批次的单元依次拼接恰好等于输入。
    /// 输入为空时返回空列表。
    pub fn create_batches(&self, units: Vec<TranslationUnit>) -> Vec<Batch> {
        self.stats.add_input_units(units.len());

        let mut batches = Vec::new();
        let mut current: Vec<TranslationUnit> = Vec::new();
        let mut current_chars = 0usize;

        for unit in units {
            let chars = unit.char_count();

            if chars > self.config.max_chars {
                // 超长单元独占一个批次
                if !current.is_empty() {
                    batches.push(self.seal(std::mem::take(&mut current)));
                    current_chars = 0;
                }
                tracing::debug!(
                    "单元 {}/{} 共 {} 字符，超过批次上限 {}，单独成批",
                    unit.element(),
                    unit.field(),
                    chars,
                    self.config.max_chars
                );
                self.stats.inc_oversized_batches();
                batches.push(self.seal(vec![unit]));
                continue;
            }

            let would_overflow = current.len() >= self.config.max_units
                || current_chars + chars > self.config.max_chars;
            if would_overflow && !current.is_empty() {
                batches.push(self.seal(std::mem::take(&mut current)));
                current_chars = 0;
            }

            current_chars += chars;
            current.push(unit);
        }

        if !current.is_empty() {
            batches.push(self.seal(current));
        }

        tracing::debug!(
            "分批完成: {} 个单元 -> {} 个批次",
            self.stats.get_input_units(),
            batches.len()
        );
        batches
    }

    /// 等待并发窗口中的一个位置
    ///
    /// # 返回值
    ///
    /// 获得许可时返回 `Some(permit)`，许可在翻译完成后随 `permit` 一起释放；
    /// 运行已被取消（包括等待期间被取消）时返回 `None`。
    pub async fn admit(&self, cancel: &CancellationToken) -> Option<OwnedSemaphorePermit> {
        if cancel.is_cancelled() {
            return None;
        }

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = self.semaphore.clone().acquire_owned() => permit.ok(),
        }?;

        if cancel.is_cancelled() {
            return None;
        }
        Some(permit)
    }

    /// 当前空闲的并发位置数
    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// 获取统计信息
    pub fn get_stats(&self) -> &BatchStats {
        &self.stats
    }

    fn seal(&self, units: Vec<TranslationUnit>) -> Batch {
        let id = self.next_batch_id.fetch_add(1, Ordering::Relaxed);
        self.stats.inc_output_batches();
        Batch::new(id, units)
    }
}

impl Default for BatchScheduler {
    fn default() -> Self {
        Self::new(BatchSchedulerConfig::default())
    }
}

/// 批次统计信息（线程安全版本）
///
/// 所有字段都使用原子类型，使用 `Relaxed` 内存序。
#[derive(Debug, Default)]
pub struct BatchStats {
    /// 输入的翻译单元总数
    pub input_units: AtomicUsize,
    /// 输出的批次总数
    pub output_batches: AtomicUsize,
    /// 因单元超长而单独成批的数量
    pub oversized_batches: AtomicUsize,
}

impl BatchStats {
    pub fn add_input_units(&self, count: usize) {
        self.input_units.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_output_batches(&self) {
        self.output_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_oversized_batches(&self) {
        self.oversized_batches.fetch_add(1, Ordering::Relaxed);
    }

    /// 计算平均批次大小
    pub fn calculate_average_size(&self) -> f32 {
        let input_units = self.get_input_units();
        let output_batches = self.get_output_batches();
        if output_batches == 0 {
            0.0
        } else {
            input_units as f32 / output_batches as f32
        }
    }

    pub fn get_input_units(&self) -> usize {
        self.input_units.load(Ordering::Relaxed)
    }

    pub fn get_output_batches(&self) -> usize {
        self.output_batches.load(Ordering::Relaxed)
    }

    pub fn get_oversized_batches(&self) -> usize {
        self.oversized_batches.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ElementHandle;
    use std::time::Duration;

    fn unit(id: u64, text: &str) -> TranslationUnit {
        TranslationUnit::new(ElementHandle::new(id), "Name", text, "en")
    }

    fn scheduler(max_units: usize, max_chars: usize) -> BatchScheduler {
        BatchScheduler::new(BatchSchedulerConfig {
            max_units,
            max_chars,
            max_concurrent_batches: 2,
        })
    }

    #[test]
    fn test_batches_respect_unit_limit() {
        let units: Vec<_> = (1..=7).map(|i| unit(i, "Door")).collect();
        let batches = scheduler(3, 4000).create_batches(units.clone());

        let sizes: Vec<_> = batches.iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
        assert_eq!(
            batches.iter().map(Batch::id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        let flattened: Vec<_> = batches.into_iter().flat_map(Batch::into_units).collect();
        assert_eq!(flattened, units);
    }

    #[test]
    fn test_batches_respect_char_limit() {
        let units = vec![unit(1, "aaaa"), unit(2, "bbbb"), unit(3, "cc"), unit(4, "d")];
        let batches = scheduler(50, 8).create_batches(units);

        let sizes: Vec<_> = batches.iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![2, 2]);
        assert!(batches.iter().all(|b| b.total_chars() <= 8));
    }

    #[test]
    fn test_chars_counted_as_scalar_values() {
        // 4 个汉字占 12 字节，但只算 4 个字符
        let units = vec![unit(1, "外墙饰面"), unit(2, "内墙饰面")];
        let batches = scheduler(50, 8).create_batches(units);

        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].total_chars(), 8);
    }

    #[test]
    fn test_oversized_unit_gets_own_batch() {
        let long = "x".repeat(20);
        let units = vec![unit(1, "a"), unit(2, &long), unit(3, "b")];
        let sched = scheduler(50, 10);
        let batches = sched.create_batches(units);

        let sizes: Vec<_> = batches.iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![1, 1, 1]);
        assert_eq!(batches[1].total_chars(), 20);
        assert_eq!(sched.get_stats().get_oversized_batches(), 1);
    }

    #[test]
    fn test_empty_input_yields_no_batches() {
        let sched = BatchScheduler::default();
        assert!(sched.create_batches(Vec::new()).is_empty());
        assert_eq!(sched.get_stats().get_output_batches(), 0);
    }

    #[tokio::test]
    async fn test_admission_window_and_cancellation() {
        let sched = scheduler(50, 4000);
        let cancel = CancellationToken::new();

        let first = sched.admit(&cancel).await;
        let second = sched.admit(&cancel).await;
        assert!(first.is_some() && second.is_some());
        assert_eq!(sched.available_slots(), 0);

        // 窗口已满，第三个批次必须等待
        let blocked = tokio::time::timeout(Duration::from_millis(50), sched.admit(&cancel)).await;
        assert!(blocked.is_err());

        drop(first);
        assert!(sched.admit(&cancel).await.is_some());

        cancel.cancel();
        assert!(sched.admit(&cancel).await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_wakes_waiting_admission() {
        let sched = Arc::new(BatchScheduler::new(BatchSchedulerConfig {
            max_concurrent_batches: 1,
            ..BatchSchedulerConfig::default()
        }));
        let cancel = CancellationToken::new();
        let _held = sched.admit(&cancel).await;

        let waiter = {
            let sched = sched.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { sched.admit(&cancel).await.is_some() })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        assert!(!waiter.await.unwrap());
    }
}
