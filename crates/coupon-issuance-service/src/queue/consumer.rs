//! Kafka 发放消息消费循环
//!
//! 只负责把消息搬进 worker 池。池内 channel 满时 dispatch 等待，
//! 消费循环随之停止拉取，位点由 worker 在处理完成后登记。

use tokio::sync::watch;
use tracing::info;

use coupon_shared::error::SharedError;
use coupon_shared::kafka::KafkaConsumer;

use super::worker_pool::{Delivery, Dispatcher};

pub struct IssueConsumer {
    consumer: KafkaConsumer,
    dispatcher: Dispatcher,
}

impl IssueConsumer {
    pub fn new(consumer: KafkaConsumer, dispatcher: Dispatcher) -> Self {
        Self {
            consumer,
            dispatcher,
        }
    }

    /// 运行到关闭信号为 `true`
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let dispatcher = self.dispatcher;
        info!(
            workers = dispatcher.worker_count(),
            "发放消息消费者已启动"
        );

        self.consumer
            .start(shutdown, move |msg| {
                let dispatcher = dispatcher.clone();
                async move {
                    dispatcher
                        .dispatch(Delivery::from(msg))
                        .await
                        .map_err(|e| SharedError::Internal(e.to_string()))
                }
            })
            .await;

        info!("发放消息消费者已停止");
    }
}
