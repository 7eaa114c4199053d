//! 发放消息处理
//!
//! 单条投递的完整生命周期：解码 -> 处理（系统错误按退避重试）
//! -> 重试耗尽进入死信 -> 登记消费位点。
//!
//! 业务结果（已发放、售罄、重复、窗口关闭）直接确认；
//! 只有需要重投的失败才进入重试，耗尽后写入死信 topic 再确认，
//! 同一分区后续的消息不会被一条毒消息永久阻塞。

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, instrument, warn};

use coupon_shared::dlq::{DeadLetterMessage, DlqProducer};
use coupon_shared::kafka::OffsetStore;
use coupon_shared::observability::metrics;
use coupon_shared::retry::{retry_with_policy, RetryPolicy};

use super::event::IssueEvent;
use super::worker_pool::{Delivery, DeliveryHandler};
use crate::error::{IssuanceError, Result};
use crate::outcome::{Disposition, IssuanceOutcome};
use crate::repository::IssuanceStore;
use crate::service::IssuanceProcessor;

/// 进程内投递在死信中使用的来源标识
const LOCAL_SOURCE: &str = "local";

/// 死信出口
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(&self, key: &str, message: &DeadLetterMessage) -> Result<()>;
}

#[async_trait]
impl DeadLetterSink for DlqProducer {
    async fn send(&self, key: &str, message: &DeadLetterMessage) -> Result<()> {
        Ok(self.send_to_dlq(key, message).await?)
    }
}

/// 发放消息 worker
pub struct IssueWorker<S>
where
    S: IssuanceStore,
{
    processor: Arc<IssuanceProcessor<S>>,
    retry_policy: RetryPolicy,
    dead_letters: Arc<dyn DeadLetterSink>,
    offsets: Option<OffsetStore>,
    service_name: String,
}

impl<S> IssueWorker<S>
where
    S: IssuanceStore,
{
    pub fn new(
        processor: Arc<IssuanceProcessor<S>>,
        retry_policy: RetryPolicy,
        dead_letters: Arc<dyn DeadLetterSink>,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            processor,
            retry_policy,
            dead_letters,
            offsets: None,
            service_name: service_name.into(),
        }
    }

    /// 从 Kafka 消费时设置位点登记句柄
    pub fn with_offset_store(mut self, offsets: OffsetStore) -> Self {
        self.offsets = Some(offsets);
        self
    }

    /// 处理一条发放意图，系统错误按策略重试
    ///
    /// 返回最终结果；`Err` 表示重试耗尽仍需重投。
    async fn process_with_retry(&self, event: &IssueEvent) -> Result<IssuanceOutcome> {
        retry_with_policy(
            &self.retry_policy,
            "process_issue",
            |_: &IssuanceError| true,
            || async {
                match self
                    .processor
                    .process(event.coupon_id, &event.user_key)
                    .await
                {
                    IssuanceOutcome::Failed(e) if e.disposition() == Disposition::Redeliver => {
                        Err(e)
                    }
                    outcome => Ok(outcome),
                }
            },
        )
        .await
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        cause: &'static str,
        reason: &str,
        attempts: u32,
    ) {
        let (topic, partition, offset) = match &delivery.source {
            Some(source) => (source.topic.as_str(), source.partition, source.offset),
            None => (LOCAL_SOURCE, -1, -1),
        };
        let message = DeadLetterMessage::new(
            topic,
            partition,
            offset,
            String::from_utf8_lossy(&delivery.payload),
            reason,
            attempts,
            &self.service_name,
        );
        let key = delivery.key.as_deref().unwrap_or_default();

        let sent = retry_with_policy(
            &self.retry_policy,
            "send_dead_letter",
            IssuanceError::is_retryable,
            || self.dead_letters.send(key, &message),
        )
        .await;

        match sent {
            Ok(()) => metrics::record_issue_dead_lettered(cause),
            // 死信也写不出去时只能留下日志，位点照常登记，避免整个分区卡死
            Err(e) => error!(
                message_id = %message.message_id,
                error = %e,
                "写入死信队列失败，消息已丢弃"
            ),
        }
    }

    fn store_offset(&self, delivery: &Delivery) {
        if let (Some(offsets), Some(source)) = (&self.offsets, &delivery.source) {
            if let Err(e) = offsets.store(&source.topic, source.partition, source.offset) {
                warn!(
                    topic = %source.topic,
                    partition = source.partition,
                    offset = source.offset,
                    error = %e,
                    "登记消费位点失败"
                );
            }
        }
    }
}

#[async_trait]
impl<S> DeliveryHandler for IssueWorker<S>
where
    S: IssuanceStore + 'static,
{
    #[instrument(skip(self, delivery), fields(shard = delivery.shard_key))]
    async fn handle(&self, delivery: Delivery) {
        match serde_json::from_slice::<IssueEvent>(&delivery.payload) {
            Ok(event) => {
                metrics::record_issue_consumed();

                match self.process_with_retry(&event).await {
                    Ok(outcome) => debug!(
                        coupon_id = event.coupon_id,
                        outcome = outcome.label(),
                        "发放消息已确认"
                    ),
                    Err(e) => {
                        warn!(
                            coupon_id = event.coupon_id,
                            error = %e,
                            "发放重试耗尽，转入死信队列"
                        );
                        let attempts = self.retry_policy.max_retries + 1;
                        self.dead_letter(&delivery, "retries_exhausted", &e.to_string(), attempts)
                            .await;
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "发放消息无法解码，直接转入死信队列");
                self.dead_letter(
                    &delivery,
                    "undecodable",
                    &format!("decode error: {}", e),
                    1,
                )
                .await;
            }
        }

        self.store_offset(&delivery);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::CounterKey;
    use crate::models::UserKey;
    use crate::testing::{MemoryCounterStore, MemoryIssuanceStore, PolicySeed};
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        messages: Mutex<Vec<(String, DeadLetterMessage)>>,
    }

    #[async_trait]
    impl DeadLetterSink for RecordingSink {
        async fn send(&self, key: &str, message: &DeadLetterMessage) -> Result<()> {
            self.messages
                .lock()
                .push((key.to_string(), message.clone()));
            Ok(())
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 1.0,
        }
    }

    fn worker(
        store: Arc<MemoryIssuanceStore>,
        counters: Arc<MemoryCounterStore>,
        sink: Arc<RecordingSink>,
    ) -> IssueWorker<MemoryIssuanceStore> {
        let processor = Arc::new(IssuanceProcessor::new(store, counters));
        IssueWorker::new(processor, fast_policy(), sink, "coupon-issuance")
    }

    fn delivery(coupon_id: i64, user: &str) -> Delivery {
        let event = IssueEvent::new(coupon_id, UserKey::new(user));
        Delivery::local(
            coupon_id as u64,
            event.partition_key(),
            serde_json::to_vec(&event).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_business_outcome_is_acked_without_dead_letter() {
        let store = Arc::new(MemoryIssuanceStore::new());
        let counters = Arc::new(MemoryCounterStore::new());
        let coupon_id = store.seed_coupon(PolicySeed::open(1));
        store.seed_user("alice");
        let sink = Arc::new(RecordingSink::default());
        let worker = worker(store.clone(), counters.clone(), sink.clone());

        worker.handle(delivery(coupon_id, "alice")).await;
        // 重复投递
        worker.handle(delivery(coupon_id, "alice")).await;

        assert_eq!(store.issued_quantity(coupon_id), 1);
        assert_eq!(counters.value(&CounterKey::count(coupon_id)), Some(1));
        assert!(sink.messages.lock().is_empty());
    }

    #[tokio::test]
    async fn test_system_failure_exhausts_retries_then_dead_letters() {
        let store = Arc::new(MemoryIssuanceStore::new());
        let coupon_id = store.seed_coupon(PolicySeed::open(3));
        let sink = Arc::new(RecordingSink::default());
        let worker = worker(store.clone(), Arc::new(MemoryCounterStore::new()), sink.clone());

        // 用户不存在属于需要重投的失败
        worker.handle(delivery(coupon_id, "ghost")).await;

        let messages = sink.messages.lock();
        assert_eq!(messages.len(), 1);
        let (key, message) = &messages[0];
        assert_eq!(key, &coupon_id.to_string());
        assert_eq!(message.attempts, 3);
        assert_eq!(message.source_topic, LOCAL_SOURCE);
        assert!(message.payload.contains("ghost"));
        assert_eq!(store.issued_quantity(coupon_id), 0);
    }

    #[tokio::test]
    async fn test_undecodable_payload_goes_straight_to_dead_letter() {
        let store = Arc::new(MemoryIssuanceStore::new());
        let sink = Arc::new(RecordingSink::default());
        let worker = worker(store, Arc::new(MemoryCounterStore::new()), sink.clone());

        worker
            .handle(Delivery::local(0, "0", b"not json".to_vec()))
            .await;

        let messages = sink.messages.lock();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].1.attempts, 1);
        assert!(messages[0].1.error.starts_with("decode error"));
    }
}
