/// 安全事件管道
///
/// `submit` 只做 `try_send`：队列满时直接丢弃并计数，绝不阻塞请求路径。
/// 固定数量的 worker 共享同一个接收端消费事件；关闭时先处理完队列中剩余的事件再退出。
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex as SyncMutex;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::SecurityEvent;

/// 事件消费者
#[async_trait]
pub trait EventProcessor: Send + Sync {
    /// 处理单个事件；内部失败自行记录，不向管道返回错误
    async fn process(&self, event: SecurityEvent);
}

/// 管道计数器，由提交方和 worker 共享
#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    dropped: AtomicU64,
    processed: AtomicU64,
    /// 已入队但尚未处理完的事件数
    pending: AtomicU64,
}

pub struct EventPipeline {
    sender: mpsc::Sender<SecurityEvent>,
    capacity: usize,
    counters: Arc<Counters>,
    idle: Arc<Notify>,
    shutdown_tx: watch::Sender<bool>,
    workers: SyncMutex<Vec<JoinHandle<()>>>,
}

impl EventPipeline {
    /// 创建管道并启动 `workers` 个消费任务（需在 tokio 运行时内调用）
    pub fn start(capacity: usize, workers: usize, processor: Arc<dyn EventProcessor>) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let counters = Arc::new(Counters::default());
        let idle = Arc::new(Notify::new());

        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let ctx = WorkerContext {
                    worker_id,
                    receiver: receiver.clone(),
                    shutdown: shutdown_rx.clone(),
                    processor: processor.clone(),
                    counters: counters.clone(),
                    idle: idle.clone(),
                };
                tokio::spawn(ctx.run())
            })
            .collect();

        info!(
            "🚀 安全事件管道已启动 (capacity={}, workers={})",
            capacity,
            workers.max(1)
        );

        Self {
            sender,
            capacity,
            counters,
            idle,
            shutdown_tx,
            workers: SyncMutex::new(handles),
        }
    }

    /// 非阻塞提交；返回事件是否入队
    pub fn submit(&self, event: SecurityEvent) -> bool {
        self.counters.pending.fetch_add(1, Ordering::SeqCst);
        match self.sender.try_send(event) {
            Ok(()) => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_event_accepted();
                crate::metrics::record_event_queue_depth(self.queue_depth());
                true
            }
            Err(err) => {
                self.finish_one();
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                crate::metrics::record_event_dropped();
                // 避免事件风暴时刷屏：只在 1, 2, 4, 8... 次时告警
                if dropped.is_power_of_two() {
                    let reason = match err {
                        mpsc::error::TrySendError::Full(_) => "queue full",
                        mpsc::error::TrySendError::Closed(_) => "pipeline closed",
                    };
                    warn!("⚠️ 安全事件被丢弃 ({}), 累计丢弃 {}", reason, dropped);
                }
                false
            }
        }
    }

    fn finish_one(&self) {
        if self.counters.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    pub fn accepted_count(&self) -> u64 {
        self.counters.accepted.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    pub fn processed_count(&self) -> u64 {
        self.counters.processed.load(Ordering::Relaxed)
    }

    /// 当前排队中的事件数
    pub fn queue_depth(&self) -> usize {
        self.capacity.saturating_sub(self.sender.capacity())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 等待所有已入队事件处理完成；超时返回 false
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.counters.pending.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.counters.pending.load(Ordering::SeqCst) == 0;
            }
        }
    }

    /// 停止接收新事件，处理完剩余事件后等待 worker 退出
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!("❌ 事件 worker 退出异常: {}", e);
            }
        }
        info!(
            "🛑 安全事件管道已关闭 (accepted={}, processed={}, dropped={})",
            self.accepted_count(),
            self.processed_count(),
            self.dropped_count()
        );
    }
}

impl Drop for EventPipeline {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

struct WorkerContext {
    worker_id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<SecurityEvent>>>,
    shutdown: watch::Receiver<bool>,
    processor: Arc<dyn EventProcessor>,
    counters: Arc<Counters>,
    idle: Arc<Notify>,
}

impl WorkerContext {
    async fn run(mut self) {
        debug!("事件 worker #{} 已启动", self.worker_id);
        loop {
            let next = {
                let mut rx = self.receiver.lock().await;
                let stopping = *self.shutdown.borrow();
                if stopping {
                    rx.try_recv().ok()
                } else {
                    let received = tokio::select! {
                        event = rx.recv() => Some(event),
                        _ = self.shutdown.changed() => None,
                    };
                    match received {
                        Some(event) => event,
                        None => rx.try_recv().ok(),
                    }
                }
            };

            // None：已关闭且队列为空，或发送端已全部释放
            let Some(event) = next else {
                break;
            };
            self.handle(event).await;
        }
        debug!("事件 worker #{} 已退出", self.worker_id);
    }

    async fn handle(&self, event: SecurityEvent) {
        let event_id = event.id.clone();
        let result = AssertUnwindSafe(self.processor.process(event))
            .catch_unwind()
            .await;
        if result.is_err() {
            error!("❌ 处理安全事件 {} 时发生 panic，已跳过", event_id);
        }
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        if self.counters.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}
