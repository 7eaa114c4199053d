//! 死信队列
//!
//! 消息处理失败且重试耗尽后，原始消息连同失败元数据一起写入死信 topic，
//! 由运维人工排查或离线重放，不会因瞬时故障而永久丢失。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::SharedError;
use crate::kafka::KafkaProducer;

/// 死信消息信封
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterMessage {
    /// 原始消息标识（topic/partition/offset）
    pub message_id: String,
    pub source_topic: String,
    pub source_partition: i32,
    pub source_offset: i64,
    /// 原始消息内容
    pub payload: String,
    /// 最后一次失败原因
    pub error: String,
    /// 进入死信前已执行的尝试次数
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
    pub source_service: String,
}

impl DeadLetterMessage {
    pub fn new(
        source_topic: impl Into<String>,
        source_partition: i32,
        source_offset: i64,
        payload: impl Into<String>,
        error: impl Into<String>,
        attempts: u32,
        source_service: impl Into<String>,
    ) -> Self {
        let source_topic = source_topic.into();
        Self {
            message_id: format!("{}/{}/{}", source_topic, source_partition, source_offset),
            source_topic,
            source_partition,
            source_offset,
            payload: payload.into(),
            error: error.into(),
            attempts,
            failed_at: Utc::now(),
            source_service: source_service.into(),
        }
    }
}

/// DLQ 生产者
#[derive(Clone)]
pub struct DlqProducer {
    producer: KafkaProducer,
    topic: String,
}

impl DlqProducer {
    pub fn new(producer: KafkaProducer, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }

    /// 将失败消息发送到死信队列，以原消息 key 保持同一分片有序
    pub async fn send_to_dlq(
        &self,
        key: &str,
        message: &DeadLetterMessage,
    ) -> Result<(), SharedError> {
        self.producer.send_json(&self.topic, key, message).await?;

        warn!(
            message_id = %message.message_id,
            attempts = message.attempts,
            error = %message.error,
            "消息已发送到死信队列"
        );
        Ok(())
    }
}
