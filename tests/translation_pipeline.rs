//! 翻译管道集成测试
//!
//! 测试从提取到写回的端到端运行

use std::sync::Arc;
use std::time::Duration;

use cad_translator::host::{HostApiThread, InMemoryDocument};
use cad_translator::translation::core::{ProgressEvent, RunPhase, RunStatus};
use cad_translator::translation::{Orchestrator, SelectionScope};

#[allow(dead_code)]
mod common {
    include!("common/mod.rs");
}

use common::{
    drain_events, run_to_end, translated, AssertionHelper, DocumentBuilder, ScriptedProvider,
    TestConfigBuilder,
};

fn rooms_scope() -> SelectionScope {
    SelectionScope::whole_model(["Rooms"])
}

/// 同一元素出现在两个视图中只翻译和写入一次
#[tokio::test]
async fn test_shared_elements_across_views_are_written_once() {
    let (doc, handles) = DocumentBuilder::shared_views(10);
    let provider = Arc::new(ScriptedProvider::new());
    let api = HostApiThread::spawn(doc).unwrap();

    let orchestrator = Orchestrator::new(Arc::new(TestConfigBuilder::new().build()), provider.clone());
    let scope = SelectionScope::new(["Rooms"], ["Level 1", "Level 2"]);
    let outcome = orchestrator.start_run(scope, api.context()).wait().await.unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.total, 10);
    assert_eq!(outcome.completed_count, 10);
    assert_eq!(provider.request_sizes().iter().sum::<usize>(), 10);

    let (writes, open) = api
        .context()
        .run(|doc: &mut InMemoryDocument| (doc.committed_writes(), doc.has_open_transaction()))
        .await
        .unwrap();
    assert_eq!(writes, 10, "Each unit should be written exactly once");
    assert!(!open, "No transaction should be left open");

    let doc = common::take_document(&api).await;
    AssertionHelper::assert_all_translated(&doc, &handles);
}

/// 批次按单元数上限切分，顺序与提取顺序一致
#[tokio::test]
async fn test_batches_respect_unit_limit() {
    let (doc, handles) = DocumentBuilder::rooms(7);
    let provider = Arc::new(ScriptedProvider::new());
    let config = TestConfigBuilder::new()
        .batch_max_units(3)
        .max_concurrent_requests(1)
        .build();

    let (outcome, doc) = run_to_end(doc, config, provider.clone(), rooms_scope()).await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(provider.request_sizes(), vec![3, 3, 1]);
    AssertionHelper::assert_all_translated(&doc, &handles);
}

/// 两次临时性失败后第三次成功
#[tokio::test]
async fn test_transient_failures_are_retried_within_budget() {
    let (doc, handles) = DocumentBuilder::rooms(3);
    let provider = Arc::new(ScriptedProvider::new().with_transient_failures(2));
    let config = TestConfigBuilder::new().max_retry_attempts(3).build();

    let (outcome, doc) = run_to_end(doc, config, provider.clone(), rooms_scope()).await;

    assert_eq!(provider.calls(), 3);
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.completed_count, 3);
    assert!(outcome.failed_units.is_empty());
    AssertionHelper::assert_all_translated(&doc, &handles);
}

/// 重试预算用尽后批次失败，运行仍然完成
#[tokio::test]
async fn test_exhausted_retries_fail_only_that_batch() {
    let (doc, handles) = DocumentBuilder::rooms(3);
    let provider = Arc::new(ScriptedProvider::new().with_transient_failures(10));
    let config = TestConfigBuilder::new().max_retry_attempts(3).build();

    let (outcome, doc) = run_to_end(doc, config, provider.clone(), rooms_scope()).await;

    assert_eq!(provider.calls(), 3);
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.failed_count(), 3);
    assert_eq!(doc.field_text(handles[0], "Name"), Some("Room 0"));
    AssertionHelper::assert_settled(&outcome);
}

/// 五个批次中一个被永久拒绝时只有该批次的单元失败
#[tokio::test]
async fn test_permanent_failure_is_isolated_to_its_batch() {
    let (doc, handles) = DocumentBuilder::rooms(25);
    let provider = Arc::new(ScriptedProvider::new().rejecting("Room 7"));
    let config = TestConfigBuilder::new().batch_max_units(5).build();

    let (outcome, doc) = run_to_end(doc, config, provider.clone(), rooms_scope()).await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(provider.calls(), 5, "Permanent errors should not be retried");
    assert_eq!(outcome.completed_count, 20);
    assert_eq!(outcome.failed_count(), 5);
    AssertionHelper::assert_settled(&outcome);

    let failed = AssertionHelper::distinct_elements(&outcome);
    let expected: std::collections::HashSet<_> = handles[5..10].iter().copied().collect();
    assert_eq!(failed, expected);

    for (i, handle) in handles.iter().enumerate() {
        let original = format!("Room {}", i);
        let expected = if (5..10).contains(&i) {
            original.clone()
        } else {
            translated(&original)
        };
        assert_eq!(doc.field_text(*handle, "Name"), Some(expected.as_str()));
    }
}

/// 在途批次数不超过并发上限
#[tokio::test]
async fn test_concurrency_limit_is_respected() {
    let (doc, handles) = DocumentBuilder::rooms(20);
    let provider = Arc::new(ScriptedProvider::new().with_delay(Duration::from_millis(20)));
    let config = TestConfigBuilder::new()
        .batch_max_units(2)
        .max_concurrent_requests(3)
        .build();

    let (outcome, doc) = run_to_end(doc, config, provider.clone(), rooms_scope()).await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(provider.calls(), 10);
    assert!(provider.max_in_flight() <= 3, "max in flight: {}", provider.max_in_flight());
    assert!(provider.max_in_flight() > 1, "Batches should overlap");
    AssertionHelper::assert_all_translated(&doc, &handles);
}

/// 取消后不再发送新批次，已提交的写入保留
#[tokio::test]
async fn test_cancellation_keeps_committed_writes() {
    let (doc, _handles) = DocumentBuilder::rooms(20);
    let provider = Arc::new(ScriptedProvider::new().with_delay(Duration::from_millis(30)));
    let config = TestConfigBuilder::new()
        .batch_max_units(2)
        .max_concurrent_requests(1)
        .build();
    let api = HostApiThread::spawn(doc).unwrap();

    let orchestrator = Orchestrator::new(Arc::new(config), provider.clone());
    let mut handle = orchestrator.start_run(rooms_scope(), api.context());
    let mut events = handle.subscribe().unwrap();

    while let Some(event) = events.recv().await {
        if let ProgressEvent::Progress(snapshot) = event {
            if snapshot.completed >= 2 {
                handle.cancel();
                break;
            }
        }
    }

    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.status, RunStatus::Cancelled);
    assert!(outcome.completed_count >= 2);
    assert!(outcome.completed_count < 20);
    assert!(provider.calls() < 10, "Cancelled run should stop dispatching");
    AssertionHelper::assert_settled(&outcome);

    let writes = api
        .context()
        .run(|doc: &mut InMemoryDocument| doc.committed_writes())
        .await
        .unwrap();
    assert_eq!(writes, outcome.completed_count);
}

/// 取消后在途批次不再重试，服务要求的长等待也会被打断
#[tokio::test]
async fn test_cancellation_stops_retries() {
    let (doc, handles) = DocumentBuilder::rooms(2);
    let provider =
        Arc::new(ScriptedProvider::new().always_rate_limited(Duration::from_secs(86_400)));
    let config = TestConfigBuilder::new().max_retry_attempts(5).build();
    let api = HostApiThread::spawn(doc).unwrap();

    let orchestrator = Orchestrator::new(Arc::new(config), provider.clone());
    let handle = orchestrator.start_run(rooms_scope(), api.context());

    while provider.calls() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    handle.cancel();

    let outcome = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("cancelled run should not wait out the retry hint")
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Cancelled);
    assert_eq!(provider.calls(), 1, "No request should be sent after cancel");
    assert_eq!(outcome.skipped_count, 2);
    AssertionHelper::assert_settled(&outcome);

    let doc = common::take_document(&api).await;
    assert_eq!(doc.field_text(handles[0], "Name"), Some("Room 0"));
}

/// 挂起的请求在单次超时后失败，运行照常完成
#[tokio::test]
async fn test_hung_request_times_out() {
    let (doc, handles) = DocumentBuilder::rooms(1);
    let provider = Arc::new(ScriptedProvider::new().with_delay(Duration::from_secs(60)));
    let config = TestConfigBuilder::new()
        .request_timeout_secs(1)
        .max_retry_attempts(1)
        .build();

    let start = std::time::Instant::now();
    let (outcome, _) = run_to_end(doc, config, provider.clone(), rooms_scope()).await;
    let elapsed = start.elapsed();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(provider.calls(), 1);
    assert_eq!(outcome.failed_units.len(), 1);
    assert_eq!(outcome.failed_units[0].element, handles[0]);
    assert!(elapsed >= Duration::from_secs(1), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(3), "{:?}", elapsed);
}

/// 会话中途失效时运行失败，之前的写入保留
#[tokio::test]
async fn test_session_loss_fails_run() {
    let (doc, _handles) = DocumentBuilder::rooms(20);
    let provider = Arc::new(ScriptedProvider::new().with_delay(Duration::from_millis(30)));
    let config = TestConfigBuilder::new()
        .batch_max_units(2)
        .max_concurrent_requests(1)
        .build();
    let api = HostApiThread::spawn(doc).unwrap();

    let orchestrator = Orchestrator::new(Arc::new(config), provider);
    let mut handle = orchestrator.start_run(rooms_scope(), api.context());
    let mut events = handle.subscribe().unwrap();

    while let Some(event) = events.recv().await {
        if let ProgressEvent::Progress(snapshot) = event {
            if snapshot.completed >= 2 {
                api.context()
                    .run(|doc: &mut InMemoryDocument| doc.close_session())
                    .await
                    .unwrap();
                break;
            }
        }
    }

    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(outcome.error.is_some());
    assert!(outcome.completed_count >= 2);
    AssertionHelper::assert_settled(&outcome);
}

/// 未知类别在提取阶段失败，不调用翻译服务
#[tokio::test]
async fn test_unknown_category_fails_before_translation() {
    let (doc, _) = DocumentBuilder::rooms(3);
    let provider = Arc::new(ScriptedProvider::new());

    let (outcome, _) = run_to_end(
        doc,
        TestConfigBuilder::new().build(),
        provider.clone(),
        SelectionScope::whole_model(["Doors"]),
    )
    .await;

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.total, 0);
    assert_eq!(provider.calls(), 0);
}

/// 没有可翻译文本时直接完成
#[tokio::test]
async fn test_blank_selection_completes_without_requests() {
    let mut doc = InMemoryDocument::new();
    doc.add_element("Rooms", [("Name", "   "), ("Comments", "")]);
    let provider = Arc::new(ScriptedProvider::new());

    let (outcome, _) = run_to_end(doc, TestConfigBuilder::new().build(), provider.clone(), rooms_scope()).await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.total, 0);
    assert_eq!(provider.calls(), 0);
}

/// 事件流以提取开始，以完成结束
#[tokio::test]
async fn test_progress_events_are_ordered() {
    let (doc, _) = DocumentBuilder::rooms(6);
    let config = TestConfigBuilder::new().batch_max_units(2).build();
    let api = HostApiThread::spawn(doc).unwrap();

    let orchestrator = Orchestrator::new(Arc::new(config), Arc::new(ScriptedProvider::new()));
    let mut handle = orchestrator.start_run(rooms_scope(), api.context());
    let events = handle.subscribe().unwrap();
    let outcome = handle.wait().await.unwrap();
    let events = drain_events(events).await;

    assert_eq!(events.first(), Some(&ProgressEvent::Phase(RunPhase::Extracting)));
    assert_eq!(events.last(), Some(&ProgressEvent::Finished(outcome.clone())));
    assert!(events.contains(&ProgressEvent::Phase(RunPhase::Completed)));

    let completed: Vec<usize> = events
        .iter()
        .filter_map(|event| match event {
            ProgressEvent::Progress(snapshot) => Some(snapshot.completed),
            _ => None,
        })
        .collect();
    assert!(completed.windows(2).all(|w| w[0] <= w[1]), "{:?}", completed);
    assert_eq!(completed.last(), Some(&6));
}

/// 翻译记忆在同一编排器的多次运行间共享
#[tokio::test]
async fn test_translation_memory_skips_repeated_requests() {
    let provider = Arc::new(ScriptedProvider::new());
    let config = TestConfigBuilder::new().with_cache().build();
    let orchestrator = Orchestrator::new(Arc::new(config), provider.clone());

    for _ in 0..2 {
        let (doc, handles) = DocumentBuilder::rooms(4);
        let api = HostApiThread::spawn(doc).unwrap();
        let outcome = orchestrator
            .start_run(rooms_scope(), api.context())
            .wait()
            .await
            .unwrap();
        assert_eq!(outcome.completed_count, 4);

        let doc = common::take_document(&api).await;
        AssertionHelper::assert_all_translated(&doc, &handles);
    }

    assert_eq!(provider.calls(), 1, "Second run should be served from memory");
}
