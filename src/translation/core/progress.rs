//! 进度报告
//!
//! 编排器通过有序的事件流报告运行进度：阶段变化、计数快照，最后以
//! [`ProgressEvent::Finished`] 结束。[`ProgressReporter`] 把事件流转交给
//! 任意 [`ProgressSink`]（界面、日志或测试记录器）。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::host::{ElementHandle, FieldId};

/// 运行阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Extracting,
    Translating,
    Applying,
    Completed,
    Cancelled,
    Failed,
}

impl RunPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunPhase::Completed | RunPhase::Cancelled | RunPhase::Failed)
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Idle => "idle",
            RunPhase::Extracting => "extracting",
            RunPhase::Translating => "translating",
            RunPhase::Applying => "applying",
            RunPhase::Completed => "completed",
            RunPhase::Cancelled => "cancelled",
            RunPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// 运行的最终状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Cancelled,
    Failed,
}

impl From<RunStatus> for RunPhase {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Completed => RunPhase::Completed,
            RunStatus::Cancelled => RunPhase::Cancelled,
            RunStatus::Failed => RunPhase::Failed,
        }
    }
}

/// 计数快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total: usize,
}

impl ProgressSnapshot {
    /// 已处理的单元数
    pub fn processed(&self) -> usize {
        self.completed + self.failed + self.skipped
    }

    /// 完成比例，总数为0时视为已完成
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.processed() as f64 / self.total as f64
        }
    }
}

/// 失败单元
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedUnit {
    pub element: ElementHandle,
    pub field: FieldId,
    pub reason: String,
}

/// 运行结果摘要
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub completed_count: usize,
    pub skipped_count: usize,
    pub total: usize,
    pub failed_units: Vec<FailedUnit>,
    /// 致命错误的描述，仅在 `Failed` 时存在
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunOutcome {
    pub fn failed_count(&self) -> usize {
        self.failed_units.len()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            completed: self.completed_count,
            failed: self.failed_count(),
            skipped: self.skipped_count,
            total: self.total,
        }
    }
}

/// 进度事件
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Phase(RunPhase),
    Progress(ProgressSnapshot),
    Finished(RunOutcome),
}

/// 进度事件的接收端
pub trait ProgressSink {
    fn on_phase(&mut self, phase: RunPhase);

    fn on_progress(&mut self, snapshot: &ProgressSnapshot);

    fn on_finished(&mut self, outcome: &RunOutcome);
}

/// 把进度写入日志
#[derive(Debug, Default)]
pub struct LogProgressSink {
    last_percent: Option<u32>,
}

impl LogProgressSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressSink for LogProgressSink {
    fn on_phase(&mut self, phase: RunPhase) {
        tracing::info!("运行阶段: {}", phase);
    }

    fn on_progress(&mut self, snapshot: &ProgressSnapshot) {
        // 每推进10%记录一次
        let percent = (snapshot.fraction() * 100.0) as u32;
        let due = match self.last_percent {
            None => true,
            Some(last) => percent >= last + 10 || (percent == 100 && last < 100),
        };
        if !due {
            return;
        }

        self.last_percent = Some(percent);
        tracing::info!(
            "进度 {}%: 完成 {}, 失败 {}, 跳过 {}, 共 {}",
            percent,
            snapshot.completed,
            snapshot.failed,
            snapshot.skipped,
            snapshot.total
        );
    }

    fn on_finished(&mut self, outcome: &RunOutcome) {
        let elapsed = outcome.finished_at - outcome.started_at;
        match outcome.status {
            RunStatus::Completed => tracing::info!(
                "运行完成: 完成 {}, 失败 {}, 跳过 {}, 共 {}, 耗时 {}ms",
                outcome.completed_count,
                outcome.failed_count(),
                outcome.skipped_count,
                outcome.total,
                elapsed.num_milliseconds()
            ),
            RunStatus::Cancelled => tracing::warn!(
                "运行已取消: 已完成 {}, 跳过 {}, 共 {}",
                outcome.completed_count,
                outcome.skipped_count,
                outcome.total
            ),
            RunStatus::Failed => tracing::error!(
                "运行失败: {}",
                outcome.error.as_deref().unwrap_or("未知错误")
            ),
        }

        for unit in &outcome.failed_units {
            tracing::warn!("失败单元 {}/{}: {}", unit.element, unit.field, unit.reason);
        }
    }
}

/// 进度报告器
pub struct ProgressReporter {
    events: mpsc::UnboundedReceiver<ProgressEvent>,
}

impl ProgressReporter {
    pub fn new(events: mpsc::UnboundedReceiver<ProgressEvent>) -> Self {
        Self { events }
    }

    /// 把事件转交给接收端，直到运行结束
    ///
    /// # 返回值
    ///
    /// 收到 `Finished` 时返回运行摘要；事件流提前关闭时返回 `None`。
    pub async fn run<S: ProgressSink + ?Sized>(mut self, sink: &mut S) -> Option<RunOutcome> {
        while let Some(event) = self.events.recv().await {
            match event {
                ProgressEvent::Phase(phase) => sink.on_phase(phase),
                ProgressEvent::Progress(snapshot) => sink.on_progress(&snapshot),
                ProgressEvent::Finished(outcome) => {
                    sink.on_finished(&outcome);
                    return Some(outcome);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        phases: Vec<RunPhase>,
        snapshots: Vec<ProgressSnapshot>,
        finished: usize,
    }

    impl ProgressSink for Recorder {
        fn on_phase(&mut self, phase: RunPhase) {
            self.phases.push(phase);
        }

        fn on_progress(&mut self, snapshot: &ProgressSnapshot) {
            self.snapshots.push(*snapshot);
        }

        fn on_finished(&mut self, _outcome: &RunOutcome) {
            self.finished += 1;
        }
    }

    fn outcome() -> RunOutcome {
        let now = Utc::now();
        RunOutcome {
            run_id: Uuid::new_v4(),
            status: RunStatus::Completed,
            completed_count: 2,
            skipped_count: 0,
            total: 2,
            failed_units: Vec::new(),
            error: None,
            started_at: now,
            finished_at: now,
        }
    }

    #[tokio::test]
    async fn test_reporter_forwards_events_until_finished() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(ProgressEvent::Phase(RunPhase::Extracting)).unwrap();
        tx.send(ProgressEvent::Progress(ProgressSnapshot {
            completed: 1,
            total: 2,
            ..Default::default()
        }))
        .unwrap();
        tx.send(ProgressEvent::Finished(outcome())).unwrap();
        tx.send(ProgressEvent::Phase(RunPhase::Idle)).unwrap();

        let mut recorder = Recorder::default();
        let result = ProgressReporter::new(rx).run(&mut recorder).await;

        assert_eq!(result.map(|o| o.completed_count), Some(2));
        assert_eq!(recorder.phases, vec![RunPhase::Extracting]);
        assert_eq!(recorder.snapshots.len(), 1);
        assert_eq!(recorder.finished, 1);
    }

    #[tokio::test]
    async fn test_reporter_returns_none_when_stream_closes() {
        let (tx, rx) = mpsc::unbounded_channel::<ProgressEvent>();
        drop(tx);
        let mut sink = LogProgressSink::new();
        assert!(ProgressReporter::new(rx).run(&mut sink).await.is_none());
    }

    #[test]
    fn test_snapshot_fraction() {
        let snapshot = ProgressSnapshot {
            completed: 2,
            failed: 1,
            skipped: 1,
            total: 8,
        };
        assert_eq!(snapshot.processed(), 4);
        assert!((snapshot.fraction() - 0.5).abs() < f64::EPSILON);
        assert_eq!(ProgressSnapshot::default().fraction(), 1.0);
    }

    #[test]
    fn test_outcome_serializes_status() {
        let json = serde_json::to_value(outcome()).unwrap();
        assert_eq!(json["status"], "completed");
        assert!(json.get("error").is_none());
    }
}
