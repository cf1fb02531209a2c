//! 翻译系统核心模块
//!
//! 把文本提取、批次调度、远程翻译和写回串成一次可取消的运行。
//!
//! ## 架构设计
//!
//! - **服务层** (`provider.rs`): 翻译服务的抽象和HTTP实现
//! - **客户端** (`client.rs`): 限速、重试和翻译记忆
//! - **写回层** (`applicator.rs`): 在宿主API线程上分事务写回译文
//! - **编排层** (`orchestrator.rs`): 运行状态机，唯一修改运行状态的地方
//! - **进度** (`progress.rs`): 阶段和计数事件流
//!
//! ## 使用示例
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cad_translator::host::{HostApiThread, InMemoryDocument};
//! use cad_translator::translation::core::{Orchestrator, PseudoProvider};
//! use cad_translator::translation::pipeline::SelectionScope;
//! use cad_translator::translation::TranslationConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let api = HostApiThread::spawn(InMemoryDocument::load("model.json")?)?;
//! let orchestrator = Orchestrator::new(
//!     Arc::new(TranslationConfig::default()),
//!     Arc::new(PseudoProvider::new()),
//! );
//!
//! let handle = orchestrator.start_run(SelectionScope::whole_model(["Rooms"]), api.context());
//! let outcome = handle.wait().await?;
//! println!("完成 {} / {}", outcome.completed_count, outcome.total);
//! # Ok(())
//! # }
//! ```
//!
//! ## 模块依赖关系
//!
//! ```text
//! Orchestrator (orchestrator.rs)
//!     ├── TextExtractor (pipeline/collector.rs)
//!     ├── BatchScheduler (pipeline/batch.rs)
//!     ├── TranslationClient (client.rs)
//!     │       ├── TranslationProvider (provider.rs)
//!     │       └── TranslationCache (storage/cache.rs)
//!     ├── MutationApplicator (applicator.rs)
//!     └── ProgressEvent (progress.rs)
//! ```

pub mod applicator;
pub mod client;
pub mod orchestrator;
pub mod progress;
pub mod provider;

/// 运行编排器和运行句柄 - 主要的对外接口
pub use orchestrator::{Orchestrator, RunHandle, RunState};

/// 翻译客户端及其单元结果
pub use client::{ClientConfig, ClientStats, RetryPolicy, TranslationClient, UnitResult, UnitStatus};

/// 翻译服务抽象
///
/// 实现 [`TranslationProvider`] 即可接入新的翻译后端
pub use provider::{HttpProvider, ProviderError, ProviderRequest, PseudoProvider, TranslationProvider};

/// 写回应用器
pub use applicator::{AppliedUnit, ApplyError, ApplyReport, MutationApplicator, UnitOutcome};

/// 进度报告
pub use progress::{
    FailedUnit, LogProgressSink, ProgressEvent, ProgressReporter, ProgressSink, ProgressSnapshot,
    RunOutcome, RunPhase, RunStatus,
};
