//! 优惠券发放服务入口
//!
//! 同一进程内运行 HTTP 接口（闸门 + 取消）和发放队列消费端（处理器）。

use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

use coupon_shared::{
    cache::Cache,
    config::{AppConfig, AuthConfig},
    database::Database,
    dlq::DlqProducer,
    kafka::{KafkaConsumer, KafkaProducer},
    observability,
    retry::RetryPolicy,
};

use coupon_issuance::{
    api::{build_router, AppState, JwtVerifier},
    queue::{IssueConsumer, IssueWorker, KafkaIssuePublisher, WorkerPool},
    repository::PgIssuanceStore,
    service::{AdmissionGate, CancellationService, IssuanceProcessor},
};

const SERVICE_NAME: &str = "coupon-issuance-service";

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 加载配置并初始化可观测性
    let config = AppConfig::load(SERVICE_NAME).unwrap_or_else(|e| {
        warn!("Failed to load config, using defaults: {}", e);
        AppConfig::default()
    });
    let _guard = observability::init(&config.observability, &config.service_name).await?;

    info!(environment = %config.environment, "Starting {}...", config.service_name);

    if config.is_production() && config.auth.jwt_secret == AuthConfig::default().jwt_secret {
        bail!("生产环境必须配置 auth.jwt_secret");
    }

    // 2. 基础设施
    let db = Database::init(&config.database).await?;
    info!("Database connection established");

    let cache = Arc::new(Cache::connect(&config.redis).await?);
    cache.health_check().await?;
    info!("Redis connection established");

    let producer = KafkaProducer::new(&config.kafka)?;

    // 3. 服务
    let store = Arc::new(PgIssuanceStore::new(db.pool().clone()));

    let gate = Arc::new(AdmissionGate::new(
        cache.clone(),
        store.clone(),
        Arc::new(KafkaIssuePublisher::new(
            producer.clone(),
            config.issuance.topic.clone(),
        )),
    ));
    let processor = Arc::new(IssuanceProcessor::new(store.clone(), cache.clone()));
    let cancellation = Arc::new(CancellationService::new(store.clone(), cache.clone()));

    // 4. 发放队列消费端
    let consumer = KafkaConsumer::new(&config.kafka, None)?;
    consumer.subscribe(&[config.issuance.topic.as_str()])?;

    let worker = IssueWorker::new(
        processor,
        RetryPolicy::from(&config.issuance),
        Arc::new(DlqProducer::new(
            producer,
            config.issuance.dead_letter_topic.clone(),
        )),
        config.service_name.clone(),
    )
    .with_offset_store(consumer.offset_store());

    let pool = WorkerPool::spawn(
        config.issuance.worker_count,
        config.issuance.queue_capacity,
        Arc::new(worker),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer_handle = tokio::spawn(
        IssueConsumer::new(consumer, pool.dispatcher()).run(shutdown_rx),
    );

    // 5. HTTP 接口
    let state = AppState::new(
        gate,
        cancellation,
        Arc::new(JwtVerifier::new(&config.auth)),
    );
    let app = build_router(state);

    let addr = config.server_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 6. 停止拉取新消息，排空已入队的发放意图
    let _ = shutdown_tx.send(true);
    if let Err(e) = consumer_handle.await {
        warn!(error = %e, "消费任务异常退出");
    }
    pool.shutdown().await;
    db.close().await;

    info!("Service shutdown complete");
    Ok(())
}

/// 优雅关闭信号处理
///
/// 监听 Ctrl+C 和 SIGTERM 信号
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        }
    }
}
