//! 发放队列桥
//!
//! 闸门放行后把发放意图按 coupon_id 作 key 写入日志型队列，
//! 消费端用固定数量的 worker 处理，把无界的请求洪峰转换成有界的提交速率。
//!
//! - `event`: 发放意图消息
//! - `publisher`: 发布端（Kafka / 进程内）
//! - `worker_pool`: 按分片路由的有界 worker 池
//! - `worker`: 单条消息的处理、重试与死信
//! - `consumer`: Kafka 消费循环

pub mod consumer;
pub mod event;
pub mod publisher;
pub mod worker;
pub mod worker_pool;

pub use consumer::IssueConsumer;
pub use event::IssueEvent;
pub use publisher::{IssuePublisher, KafkaIssuePublisher, LocalIssuePublisher};
pub use worker::{DeadLetterSink, IssueWorker};
pub use worker_pool::{Delivery, DeliveryHandler, Dispatcher, SourcePosition, WorkerPool};
