/// 任务队列
///
/// 无界通道接收工作项，信号量限制并发，每个工作项在独立的 tokio 任务中执行，
/// 失败或 panic 只记录日志，不影响队列和其他工作项。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{Error, Result};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{TaskDispatch, WorkExecutor, WorkItem};

/// 队列发送端
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<WorkItem>,
}

impl TaskQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WorkItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TaskDispatch for TaskQueue {
    fn submit(&self, item: WorkItem) -> Result<()> {
        debug!("投递任务: {}", item.label());
        self.tx
            .send(item)
            .map_err(|e| Error::Internal(format!("任务队列已关闭: {}", e.0.label())))
    }
}

/// 消费队列直到取消或发送端全部关闭
pub async fn run_workers(
    mut rx: mpsc::UnboundedReceiver<WorkItem>,
    executor: Arc<dyn WorkExecutor>,
    workers: usize,
    cancel: CancellationToken,
) {
    let permits = Arc::new(Semaphore::new(workers.max(1)));
    info!("任务队列已启动，并发数 {}", workers.max(1));

    loop {
        let item = tokio::select! {
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        let permit = match permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let executor = executor.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let label = item.label();
            let handle = tokio::spawn(async move { executor.execute(item).await });

            match handle.await {
                Ok(Ok(())) => debug!("任务完成: {}", label),
                Ok(Err(e)) => error!("任务失败: {}: {}", label, e),
                Err(e) => error!("任务异常退出: {}: {}", label, e),
            }
        });
    }

    info!("任务队列已停止");
}

/// 按固定周期投递工作项，首次立即投递
pub fn schedule_periodic(
    dispatcher: Arc<dyn TaskDispatch>,
    interval: Duration,
    item: WorkItem,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Err(e) = dispatcher.submit(item.clone()) {
                        warn!("周期任务投递失败: {}", e);
                    }
                }
                _ = cancel.cancelled() => {
                    info!("周期任务 {} 已停止", item.label());
                    break;
                }
            }
        }
    })
}

/// 只记录不执行的投递器
#[derive(Default)]
pub struct RecordingDispatcher {
    items: Mutex<Vec<WorkItem>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> Vec<WorkItem> {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// 取出并清空已记录的工作项
    pub fn take(&self) -> Vec<WorkItem> {
        std::mem::take(&mut *self.items.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl TaskDispatch for RecordingDispatcher {
    fn submit(&self, item: WorkItem) -> Result<()> {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(item);
        Ok(())
    }
}
