//! 发放意图发布端

use async_trait::async_trait;
use tracing::debug;

use coupon_shared::kafka::KafkaProducer;

use super::event::IssueEvent;
use super::worker_pool::{Delivery, Dispatcher};
use crate::error::Result;

/// 发放意图发布接口
///
/// 返回即表示意图已持久进入队列，不等待下游处理。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IssuePublisher: Send + Sync {
    async fn publish(&self, event: &IssueEvent) -> Result<()>;
}

/// Kafka 发布端，以 coupon_id 作为消息 key
pub struct KafkaIssuePublisher {
    producer: KafkaProducer,
    topic: String,
}

impl KafkaIssuePublisher {
    pub fn new(producer: KafkaProducer, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl IssuePublisher for KafkaIssuePublisher {
    async fn publish(&self, event: &IssueEvent) -> Result<()> {
        let (partition, offset) = self
            .producer
            .send_json(&self.topic, &event.partition_key(), event)
            .await?;

        debug!(
            coupon_id = event.coupon_id,
            partition, offset, "发放意图已写入 Kafka"
        );
        Ok(())
    }
}

/// 进程内发布端
///
/// 直接把意图投递给本进程的 worker 池，按 coupon_id 分片，
/// 与 Kafka 路径共用同一套解码和处理逻辑。单机运行与集成测试使用。
///
/// 投递不等待 worker：分片队列已满时返回 `QueueFull`，闸门随即归还库存。
#[derive(Clone)]
pub struct LocalIssuePublisher {
    dispatcher: Dispatcher,
}

impl LocalIssuePublisher {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl IssuePublisher for LocalIssuePublisher {
    async fn publish(&self, event: &IssueEvent) -> Result<()> {
        let payload = serde_json::to_vec(event)?;
        self.dispatcher.try_dispatch(Delivery::local(
            event.coupon_id as u64,
            event.partition_key(),
            payload,
        ))
    }
}
