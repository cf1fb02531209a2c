//! 宿主API线程调度
//!
//! 宿主要求所有文档操作都发生在同一个线程上。[`HostApiThread`] 启动一个专用的
//! 操作系统线程，文档在该线程上创建并且永远不离开它；[`ApiContext`] 是投递任务
//! 的显式句柄，需要访问文档的组件必须拿到它。

use std::io;
use std::thread::{self, JoinHandle, ThreadId};

use tokio::sync::{mpsc, oneshot};

use super::document::HostError;

/// 默认的API线程名称
pub const DEFAULT_THREAD_NAME: &str = "host-api";

type Job<D> = Box<dyn FnOnce(&mut D) + Send>;

enum Message<D> {
    Run(Job<D>),
    Stop,
}

/// 宿主API执行上下文
///
/// 可以克隆并在任务间传递；每次 [`ApiContext::run`] 都会把闭包排队到API线程，
/// 按投递顺序依次执行。
pub struct ApiContext<D> {
    sender: mpsc::UnboundedSender<Message<D>>,
    thread_id: ThreadId,
}

impl<D> Clone for ApiContext<D> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            thread_id: self.thread_id,
        }
    }
}

impl<D: 'static> ApiContext<D> {
    /// 在API线程上执行闭包并等待其结果
    ///
    /// # 错误
    ///
    /// API线程已停止，或闭包在执行中崩溃时返回 [`HostError::ApiThreadUnavailable`]。
    pub async fn run<F, R>(&self, f: F) -> Result<R, HostError>
    where
        F: FnOnce(&mut D) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job<D> = Box::new(move |document: &mut D| {
            let _ = tx.send(f(document));
        });

        self.sender
            .send(Message::Run(job))
            .map_err(|_| HostError::ApiThreadUnavailable)?;

        rx.await.map_err(|_| HostError::ApiThreadUnavailable)
    }

    /// 当前线程是否就是API线程
    pub fn is_current_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

/// 持有宿主文档的专用线程
pub struct HostApiThread<D> {
    context: ApiContext<D>,
    handle: Option<JoinHandle<()>>,
}

impl<D: 'static> HostApiThread<D> {
    /// 在新线程上通过工厂函数创建文档
    ///
    /// 文档本身不需要实现 `Send`，宿主对象通常也不允许跨线程移动。
    pub fn spawn_with<F>(name: &str, factory: F) -> io::Result<Self>
    where
        F: FnOnce() -> D + Send + 'static,
    {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Message<D>>();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut document = factory();
                tracing::debug!("宿主API线程已启动");

                while let Some(message) = receiver.blocking_recv() {
                    match message {
                        Message::Run(job) => job(&mut document),
                        Message::Stop => break,
                    }
                }

                tracing::debug!("宿主API线程已退出");
            })?;

        let context = ApiContext {
            sender,
            thread_id: handle.thread().id(),
        };

        Ok(Self {
            context,
            handle: Some(handle),
        })
    }

    /// 把已有文档移交给新的API线程
    pub fn spawn(document: D) -> io::Result<Self>
    where
        D: Send,
    {
        Self::spawn_with(DEFAULT_THREAD_NAME, move || document)
    }

    pub fn context(&self) -> ApiContext<D> {
        self.context.clone()
    }

    /// 停止线程并等待其退出
    ///
    /// 已排队的任务会先执行完；之后通过任何上下文克隆投递的任务都会失败。
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        let _ = self.context.sender.send(Message::Stop);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("宿主API线程异常退出");
            }
        }
    }
}

impl<D> Drop for HostApiThread<D> {
    fn drop(&mut self) {
        let _ = self.context.sender.send(Message::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_jobs_run_on_api_thread_in_order() {
        let api = HostApiThread::spawn(Vec::<u32>::new()).unwrap();
        let context = api.context();

        for i in 0..5 {
            context.run(move |log: &mut Vec<u32>| log.push(i)).await.unwrap();
        }

        let (log, on_api_thread) = context
            .run({
                let context = context.clone();
                move |log: &mut Vec<u32>| (log.clone(), context.is_current_thread())
            })
            .await
            .unwrap();

        assert_eq!(log, vec![0, 1, 2, 3, 4]);
        assert!(on_api_thread, "Job should execute on the API thread");
        assert!(!context.is_current_thread());
    }

    #[tokio::test]
    async fn test_run_after_shutdown_fails() {
        let api = HostApiThread::spawn(0u8).unwrap();
        let context = api.context();
        api.shutdown();

        let result = context.run(|value: &mut u8| *value).await;
        assert_eq!(result, Err(HostError::ApiThreadUnavailable));
    }

    #[tokio::test]
    async fn test_document_built_on_api_thread() {
        let api = HostApiThread::spawn_with("factory-test", || {
            std::rc::Rc::new(thread::current().name().map(str::to_string))
        })
        .unwrap();

        let name = api
            .context()
            .run(|document: &mut std::rc::Rc<Option<String>>| (**document).clone())
            .await
            .unwrap();

        assert_eq!(name.as_deref(), Some("factory-test"));
    }
}
