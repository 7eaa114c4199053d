//! 有界 worker 池
//!
//! 固定数量的 worker，每个 worker 独占一个有界 channel。投递按分片 key 取模路由，
//! 同一分片始终落在同一个 worker 上，因此分片内顺序得以保留，
//! 同时在途的事务数不超过 worker 数。channel 满时 `dispatch` 等待，
//! 背压沿着调用链传回消费循环。

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use coupon_shared::kafka::ConsumerMessage;

use crate::error::{IssuanceError, Result};

/// 消息在源 topic 中的位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePosition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// 一次待处理的投递
#[derive(Debug, Clone)]
pub struct Delivery {
    /// 路由用的分片 key
    pub shard_key: u64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    /// 进程内投递没有源位置
    pub source: Option<SourcePosition>,
}

impl Delivery {
    pub fn local(shard_key: u64, key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            shard_key,
            key: Some(key.into()),
            payload,
            source: None,
        }
    }
}

impl From<ConsumerMessage> for Delivery {
    /// Kafka 消息按分区路由：分区内有序，且同一 coupon_id 总在同一分区
    fn from(msg: ConsumerMessage) -> Self {
        Self {
            shard_key: msg.partition.max(0) as u64,
            key: msg.key,
            payload: msg.payload,
            source: Some(SourcePosition {
                topic: msg.topic,
                partition: msg.partition,
                offset: msg.offset,
            }),
        }
    }
}

/// 投递处理器
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery);
}

/// 投递入口，可 clone 给多个生产方
#[derive(Clone)]
pub struct Dispatcher {
    senders: Arc<Vec<mpsc::Sender<Delivery>>>,
}

impl Dispatcher {
    fn sender_for(&self, shard_key: u64) -> &mpsc::Sender<Delivery> {
        &self.senders[(shard_key % self.senders.len() as u64) as usize]
    }

    /// 路由到分片对应的 worker，channel 满时等待
    pub async fn dispatch(&self, delivery: Delivery) -> Result<()> {
        self.sender_for(delivery.shard_key)
            .send(delivery)
            .await
            .map_err(|_| pool_closed())
    }

    /// 非阻塞投递，channel 满时立即返回 `QueueFull`
    pub fn try_dispatch(&self, delivery: Delivery) -> Result<()> {
        self.sender_for(delivery.shard_key)
            .try_send(delivery)
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => IssuanceError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => pool_closed(),
            })
    }

    pub fn worker_count(&self) -> usize {
        self.senders.len()
    }
}

fn pool_closed() -> IssuanceError {
    IssuanceError::Internal("worker 池已关闭".to_string())
}

/// worker 池
pub struct WorkerPool {
    dispatcher: Dispatcher,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// 启动 `worker_count` 个 worker，每个 channel 容量为 `queue_capacity`
    pub fn spawn<H>(worker_count: usize, queue_capacity: usize, handler: Arc<H>) -> Self
    where
        H: DeliveryHandler + 'static,
    {
        let worker_count = worker_count.max(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut senders = Vec::with_capacity(worker_count);
        let mut handles = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            let (tx, rx) = mpsc::channel(queue_capacity.max(1));
            senders.push(tx);
            handles.push(tokio::spawn(run_worker(
                worker_id,
                rx,
                shutdown_rx.clone(),
                Arc::clone(&handler),
            )));
        }

        info!(worker_count, queue_capacity, "发放 worker 池已启动");

        Self {
            dispatcher: Dispatcher {
                senders: Arc::new(senders),
            },
            shutdown_tx,
            handles,
        }
    }

    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    /// 停止接收新投递，处理完已入队的投递后返回
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker 任务异常退出");
            }
        }
        info!("发放 worker 池已关闭");
    }
}

async fn run_worker<H>(
    worker_id: usize,
    mut rx: mpsc::Receiver<Delivery>,
    mut shutdown: watch::Receiver<bool>,
    handler: Arc<H>,
) where
    H: DeliveryHandler + 'static,
{
    loop {
        tokio::select! {
            biased;

            delivery = rx.recv() => {
                match delivery {
                    Some(delivery) => handler.handle(delivery).await,
                    None => break,
                }
            }

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    // 拒绝新投递，排空已入队的部分
                    rx.close();
                    while let Some(delivery) = rx.recv().await {
                        handler.handle(delivery).await;
                    }
                    break;
                }
            }
        }
    }
    debug!(worker_id, "worker 退出");
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use tokio::sync::Notify;

    /// 记录每个分片上的处理顺序
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<HashMap<u64, Vec<u8>>>,
    }

    #[async_trait]
    impl DeliveryHandler for Recorder {
        async fn handle(&self, delivery: Delivery) {
            tokio::task::yield_now().await;
            self.seen
                .lock()
                .entry(delivery.shard_key)
                .or_default()
                .push(delivery.payload[0]);
        }
    }

    #[tokio::test]
    async fn test_per_shard_order_preserved() {
        let recorder = Arc::new(Recorder::default());
        let pool = WorkerPool::spawn(3, 2, Arc::clone(&recorder));
        let dispatcher = pool.dispatcher();

        for seq in 0..20u8 {
            for shard in 0..5u64 {
                dispatcher
                    .dispatch(Delivery::local(shard, shard.to_string(), vec![seq]))
                    .await
                    .unwrap();
            }
        }
        pool.shutdown().await;

        let seen = recorder.seen.lock();
        assert_eq!(seen.len(), 5);
        for seq in seen.values() {
            assert_eq!(seq, &(0..20u8).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn test_dispatch_after_shutdown_fails() {
        let recorder = Arc::new(Recorder::default());
        let pool = WorkerPool::spawn(2, 1, Arc::clone(&recorder));
        let dispatcher = pool.dispatcher();
        assert_eq!(dispatcher.worker_count(), 2);

        pool.shutdown().await;

        let result = dispatcher
            .dispatch(Delivery::local(1, "1", vec![0]))
            .await;
        assert!(matches!(result, Err(IssuanceError::Internal(_))));
    }

    /// 第一条投递一直阻塞到被放行
    #[derive(Default)]
    struct HeldHandler {
        release: Notify,
        handled: Mutex<usize>,
    }

    #[async_trait]
    impl DeliveryHandler for HeldHandler {
        async fn handle(&self, _delivery: Delivery) {
            self.release.notified().await;
            *self.handled.lock() += 1;
        }
    }

    #[tokio::test]
    async fn test_try_dispatch_reports_full_queue_without_waiting() {
        let handler = Arc::new(HeldHandler::default());
        let pool = WorkerPool::spawn(1, 1, Arc::clone(&handler));
        let dispatcher = pool.dispatcher();

        // 第一条被 worker 取走并阻塞，第二条占满容量为 1 的 channel
        dispatcher
            .try_dispatch(Delivery::local(7, "7", vec![0]))
            .unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while dispatcher
                .try_dispatch(Delivery::local(7, "7", vec![1]))
                .is_err()
            {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("worker 未取走第一条投递");

        let result = dispatcher.try_dispatch(Delivery::local(7, "7", vec![2]));
        assert!(matches!(result, Err(IssuanceError::QueueFull)));

        handler.release.notify_one();
        handler.release.notify_one();
        pool.shutdown().await;
        assert_eq!(*handler.handled.lock(), 2);
    }

    #[test]
    fn test_delivery_from_consumer_message_routes_by_partition() {
        let msg = ConsumerMessage {
            topic: "coupon.issue".to_string(),
            partition: 4,
            offset: 99,
            key: Some("1001".to_string()),
            payload: b"{}".to_vec(),
        };
        let delivery = Delivery::from(msg);
        assert_eq!(delivery.shard_key, 4);
        assert_eq!(
            delivery.source,
            Some(SourcePosition {
                topic: "coupon.issue".to_string(),
                partition: 4,
                offset: 99,
            })
        );
    }
}
