//! 写回应用器
//!
//! 文档的唯一写入者。所有方法都接收 `&mut D`，只能在宿主API线程上通过
//! [`crate::host::ApiContext::run`] 调用。
//!
//! 写入按 `writes_per_transaction` 分组提交：每组开启一个宿主事务，提交前检查
//! 取消信号，取消时回滚整组。已提交的写入永远不会回滚。

use std::collections::HashSet;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::host::{ElementHandle, FieldId, HostDocument, HostError};
use crate::translation::config::{constants, TranslationConfig};
use crate::translation::core::client::{UnitResult, UnitStatus};
use crate::translation::error::TranslationError;
use crate::translation::pipeline::collector::TranslationUnit;

const REASON_DUPLICATE: &str = "已写入";

/// 写回错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApplyError {
    /// 元素在运行期间被删除
    #[error("元素已不存在: {0}")]
    StaleHandle(ElementHandle),

    /// 字段在提取之后被用户修改过
    #[error("元素 {element} 的字段 {field} 在提取后已被修改")]
    SourceChanged {
        element: ElementHandle,
        field: FieldId,
    },

    /// 文档会话失效，整个运行必须终止
    #[error("文档会话已失效")]
    SessionLost,

    #[error("宿主操作失败: {0}")]
    Host(HostError),
}

impl ApplyError {
    /// 是否需要终止整个运行
    pub fn is_fatal(&self) -> bool {
        matches!(self, ApplyError::SessionLost)
    }
}

impl From<HostError> for ApplyError {
    fn from(error: HostError) -> Self {
        match error {
            HostError::SessionClosed => ApplyError::SessionLost,
            HostError::StaleHandle(handle) => ApplyError::StaleHandle(handle),
            other => ApplyError::Host(other),
        }
    }
}

impl From<ApplyError> for TranslationError {
    fn from(error: ApplyError) -> Self {
        match error {
            ApplyError::StaleHandle(handle) => TranslationError::StaleHandle(handle),
            ApplyError::SessionLost => TranslationError::SessionLost(error.to_string()),
            ApplyError::SourceChanged { .. } | ApplyError::Host(_) => {
                TranslationError::InternalError(error.to_string())
            }
        }
    }
}

/// 单元的最终处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    /// 译文已提交到文档
    Applied,
    Failed(String),
    Skipped(String),
}

/// 单元及其处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedUnit {
    pub unit: TranslationUnit,
    pub outcome: UnitOutcome,
}

/// 一次 `apply_batch` 的报告
///
/// 每个输入结果在 `units` 中恰好出现一次，重复结果记为跳过。
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub units: Vec<AppliedUnit>,
    /// 已经写入过、因而记为跳过的重复结果数
    pub duplicates: usize,
    /// 成功提交的事务数
    pub transactions: usize,
    /// 致命错误，运行必须终止
    pub fatal: Option<ApplyError>,
}

impl ApplyReport {
    pub fn applied_count(&self) -> usize {
        self.count(|outcome| matches!(outcome, UnitOutcome::Applied))
    }

    pub fn failed_count(&self) -> usize {
        self.count(|outcome| matches!(outcome, UnitOutcome::Failed(_)))
    }

    pub fn skipped_count(&self) -> usize {
        self.count(|outcome| matches!(outcome, UnitOutcome::Skipped(_)))
    }

    fn count(&self, predicate: impl Fn(&UnitOutcome) -> bool) -> usize {
        self.units.iter().filter(|u| predicate(&u.outcome)).count()
    }

    fn push(&mut self, unit: &TranslationUnit, outcome: UnitOutcome) {
        self.units.push(AppliedUnit {
            unit: unit.clone(),
            outcome,
        });
    }

    fn skip_all<'a>(&mut self, units: impl IntoIterator<Item = &'a TranslationUnit>, reason: &str) {
        for unit in units {
            self.push(unit, UnitOutcome::Skipped(reason.to_string()));
        }
    }
}

/// 写回应用器
#[derive(Debug)]
pub struct MutationApplicator {
    writes_per_transaction: usize,
    transaction_name: String,
    /// 本次运行中已提交的 (元素, 字段)
    applied: HashSet<(ElementHandle, FieldId)>,
    /// 当前事务中已暂存的 (元素, 字段)
    staged: HashSet<(ElementHandle, FieldId)>,
}

impl MutationApplicator {
    pub fn new(writes_per_transaction: usize, transaction_name: impl Into<String>) -> Self {
        Self {
            writes_per_transaction: writes_per_transaction.max(1),
            transaction_name: transaction_name.into(),
            applied: HashSet::new(),
            staged: HashSet::new(),
        }
    }

    pub fn from_config(config: &TranslationConfig) -> Self {
        Self::new(config.writes_per_transaction, config.transaction_name.clone())
    }

    /// 该 (元素, 字段) 是否已经写入过
    pub fn is_applied(&self, element: ElementHandle, field: &FieldId) -> bool {
        let key = (element, field.clone());
        self.applied.contains(&key) || self.staged.contains(&key)
    }

    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }

    /// 在当前打开的事务中写入一个结果
    ///
    /// 每次都通过句柄重新解析元素；字段当前值与提取时的源文本不一致时拒绝写入。
    /// 已写入过的 (元素, 字段) 和没有译文的结果不会触碰文档。
    pub fn apply<D: HostDocument + ?Sized>(
        &mut self,
        document: &mut D,
        result: &UnitResult,
    ) -> Result<(), ApplyError> {
        let Some(text) = result.translated_text() else {
            return Ok(());
        };
        let unit = result.unit();

        if self.is_applied(unit.element(), unit.field()) {
            tracing::debug!("忽略重复写入 {}/{}", unit.element(), unit.field());
            return Ok(());
        }

        if !document.is_session_valid() {
            return Err(ApplyError::SessionLost);
        }

        let current = document.read_field(unit.element(), unit.field())?;
        if current != unit.source_text() {
            return Err(ApplyError::SourceChanged {
                element: unit.element(),
                field: unit.field().clone(),
            });
        }

        document.write_field(unit.element(), unit.field(), text)?;
        self.staged.insert((unit.element(), unit.field().clone()));
        Ok(())
    }

    /// 应用一个批次的结果
    ///
    /// # 参数
    ///
    /// * `document` - 宿主文档，只能在API线程上访问
    /// * `results` - 客户端产出的结果，非成功结果原样记为失败或跳过
    /// * `cancel` - 运行的取消信号，在每次提交前检查
    ///
    /// # 返回值
    ///
    /// 每个结果的最终处理情况。会话失效时回滚当前事务、其余结果记为跳过，
    /// 并在 `fatal` 中返回错误。
    pub fn apply_batch<D: HostDocument + ?Sized>(
        &mut self,
        document: &mut D,
        results: &[UnitResult],
        cancel: &CancellationToken,
    ) -> ApplyReport {
        let mut report = ApplyReport::default();
        let mut writes: Vec<&UnitResult> = Vec::new();
        let mut queued: HashSet<(ElementHandle, &FieldId)> = HashSet::new();

        for result in results {
            match result.status() {
                UnitStatus::Success => {
                    let unit = result.unit();
                    if self.is_applied(unit.element(), unit.field())
                        || !queued.insert((unit.element(), unit.field()))
                    {
                        report.duplicates += 1;
                        report.push(unit, UnitOutcome::Skipped(REASON_DUPLICATE.to_string()));
                    } else {
                        writes.push(result);
                    }
                }
                UnitStatus::Failed(reason) => {
                    report.push(result.unit(), UnitOutcome::Failed(reason.clone()))
                }
                UnitStatus::Skipped(reason) => {
                    report.push(result.unit(), UnitOutcome::Skipped(reason.clone()))
                }
            }
        }

        let groups: Vec<&[&UnitResult]> = writes.chunks(self.writes_per_transaction).collect();
        for (index, group) in groups.iter().enumerate() {
            if report.fatal.is_some() || cancel.is_cancelled() {
                let reason = if report.fatal.is_some() {
                    "文档会话已失效，未写入"
                } else {
                    "运行已取消，未写入"
                };
                for rest in &groups[index..] {
                    report.skip_all(rest.iter().map(|r| r.unit()), reason);
                }
                break;
            }
            self.apply_group(document, group, cancel, &mut report);
        }

        tracing::debug!(
            "写回完成: 写入 {} 个, 失败 {} 个, 跳过 {} 个, 重复 {} 个, 事务 {} 个",
            report.applied_count(),
            report.failed_count(),
            report.skipped_count(),
            report.duplicates,
            report.transactions
        );
        report
    }

    /// 在一个事务中写入一组结果
    fn apply_group<D: HostDocument + ?Sized>(
        &mut self,
        document: &mut D,
        group: &[&UnitResult],
        cancel: &CancellationToken,
        report: &mut ApplyReport,
    ) {
        let units = || group.iter().map(|r| r.unit());

        if let Err(e) = document.begin_transaction(&self.transaction_name) {
            tracing::error!("无法开启事务: {}", e);
            report.skip_all(units(), "无法开启事务，未写入");
            report.fatal = Some(e.into());
            return;
        }

        let mut staged: Vec<&TranslationUnit> = Vec::with_capacity(group.len());
        for (index, result) in group.iter().enumerate() {
            match self.apply(document, result) {
                Ok(()) => staged.push(result.unit()),
                Err(e) if e.is_fatal() => {
                    tracing::error!("写回时文档会话失效，回滚当前事务");
                    self.rollback(document);
                    report.skip_all(staged, "文档会话已失效，事务已回滚");
                    report.skip_all(
                        group[index..].iter().map(|r| r.unit()),
                        "文档会话已失效，未写入",
                    );
                    report.fatal = Some(e);
                    return;
                }
                Err(e) => {
                    tracing::warn!("单元 {}/{} 写回失败: {}", result.unit().element(), result.unit().field(), e);
                    report.push(result.unit(), UnitOutcome::Failed(e.to_string()));
                }
            }
        }

        if cancel.is_cancelled() {
            tracing::info!("提交前检测到取消，回滚 {} 个写入", staged.len());
            self.rollback(document);
            report.skip_all(staged, "运行已取消，事务已回滚");
            return;
        }

        match document.commit_transaction() {
            Ok(()) => {
                report.transactions += 1;
                self.applied.extend(self.staged.drain());
                for unit in staged {
                    report.push(unit, UnitOutcome::Applied);
                }
            }
            Err(e) => {
                let error = ApplyError::from(e);
                tracing::error!("提交事务失败: {}", error);
                self.rollback(document);
                if error.is_fatal() {
                    report.skip_all(staged, "文档会话已失效，事务已回滚");
                    report.fatal = Some(error);
                } else {
                    for unit in staged {
                        report.push(unit, UnitOutcome::Failed(error.to_string()));
                    }
                }
            }
        }
    }

    fn rollback<D: HostDocument + ?Sized>(&mut self, document: &mut D) {
        document.rollback_transaction();
        self.staged.clear();
    }
}

impl Default for MutationApplicator {
    fn default() -> Self {
        Self::new(
            constants::DEFAULT_WRITES_PER_TRANSACTION,
            constants::DEFAULT_TRANSACTION_NAME,
        )
    }
}
