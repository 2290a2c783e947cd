//! 有界并发任务池

use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::error;

/// 一次 join 的结果
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct JoinSummary {
    pub completed: usize,
    /// panic 或被取消的任务
    pub crashed: usize,
}

/// 最多同时运行 `max` 个任务的 worker 池
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            handles: Vec::new(),
        }
    }

    /// 提交任务，不阻塞调用方；任务在取得许可后才开始执行
    pub fn submit<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let semaphore = self.semaphore.clone();
        let handle = tokio::spawn(async move {
            // 信号量不会被关闭
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            task.await;
        });
        self.handles.push(handle);
    }

    /// 尚未 join 的任务数
    pub fn in_flight(&self) -> usize {
        self.handles.len()
    }

    /// 等待所有已提交的任务结束
    pub async fn join(&mut self) -> JoinSummary {
        let mut summary = JoinSummary::default();
        for result in join_all(self.handles.drain(..)).await {
            match result {
                Ok(()) => summary.completed += 1,
                Err(e) => {
                    error!("任务异常退出: {}", e);
                    summary.crashed += 1;
                }
            }
        }
        summary
    }
}
