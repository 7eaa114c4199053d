//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。
//!
//! 发放链路各阶段一一对应一个计数器，便于对照漏斗：
//! 请求 -> 闸门拒绝/投递 -> 消费 -> 提交/售罄/重复/窗口关闭/死信。
//!
//! 计数器不带 coupon_id 标签：券 ID 来自请求路径，任意值都会新建一条序列。
//! 单券维度的数字以 Redis 的 count 计数器和数据库为准。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::ObservabilityConfig;

/// Metrics 资源守卫
pub struct MetricsHandle {
    _server_handle: tokio::task::JoinHandle<()>,
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
pub async fn init(config: &ObservabilityConfig, service_name: &str) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    describe_metrics(service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle {
        _server_handle: server_handle,
    })
}

fn describe_metrics(service_name: &str) {
    metrics::describe_counter!("http_requests_total", "Total number of HTTP requests");
    metrics::describe_histogram!(
        "http_request_duration_seconds",
        "HTTP request duration in seconds"
    );

    metrics::describe_counter!(
        "coupon_issue_requests_total",
        "Issuance requests received by the admission gate"
    );
    metrics::describe_counter!(
        "coupon_issue_gate_sold_out_total",
        "Requests rejected by the admission gate because stock was exhausted"
    );
    metrics::describe_counter!(
        "coupon_issue_published_total",
        "Issuance intents published to the queue"
    );
    metrics::describe_counter!(
        "coupon_issue_consumed_total",
        "Issuance intents consumed by the worker pool"
    );
    metrics::describe_counter!(
        "coupon_issue_committed_total",
        "Issuances committed by the processor"
    );
    metrics::describe_counter!(
        "coupon_issue_db_sold_out_total",
        "Issuances rejected by the authoritative quantity check"
    );
    metrics::describe_counter!(
        "coupon_issue_duplicate_total",
        "Issuances rejected because the user already holds the coupon"
    );
    metrics::describe_counter!(
        "coupon_issue_window_closed_total",
        "Issuances dropped because the policy window was closed"
    );
    metrics::describe_counter!(
        "coupon_issue_failed_total",
        "Issuance attempts that failed with an error"
    );
    metrics::describe_counter!(
        "coupon_issue_dead_lettered_total",
        "Issuance intents parked on the dead-letter topic"
    );
    metrics::describe_histogram!(
        "coupon_issue_process_duration_seconds",
        "Processor transaction duration in seconds"
    );
    metrics::describe_counter!("coupon_cancel_total", "Cancellation attempts by result");

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

// ============================================================================
// 指标记录函数
// ============================================================================

/// 记录 HTTP 请求
#[inline]
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!(
        "http_requests_total",
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status" => status_str.clone()
    )
    .increment(1);

    metrics::histogram!(
        "http_request_duration_seconds",
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status" => status_str
    )
    .record(duration_secs);
}

/// 记录进入闸门的发放请求
#[inline]
pub fn record_issue_request() {
    metrics::counter!("coupon_issue_requests_total").increment(1);
}

/// 记录闸门售罄拒绝
#[inline]
pub fn record_gate_sold_out() {
    metrics::counter!("coupon_issue_gate_sold_out_total").increment(1);
}

/// 记录发放意图已投递
#[inline]
pub fn record_issue_published() {
    metrics::counter!("coupon_issue_published_total").increment(1);
}

/// 记录发放意图已被消费
#[inline]
pub fn record_issue_consumed() {
    metrics::counter!("coupon_issue_consumed_total").increment(1);
}

/// 记录处理器的一次处理结果
///
/// `result` 取值：committed / sold_out / duplicate / window_closed / failed
#[inline]
pub fn record_issue_processed(result: &str, duration_secs: f64) {
    let (name, result) = match result {
        "committed" => ("coupon_issue_committed_total", "committed"),
        "sold_out" => ("coupon_issue_db_sold_out_total", "sold_out"),
        "duplicate" => ("coupon_issue_duplicate_total", "duplicate"),
        "window_closed" => ("coupon_issue_window_closed_total", "window_closed"),
        _ => ("coupon_issue_failed_total", "failed"),
    };
    metrics::counter!(name).increment(1);

    metrics::histogram!("coupon_issue_process_duration_seconds", "result" => result)
        .record(duration_secs);
}

/// 记录进入死信队列的发放意图
///
/// `reason` 取值：retries_exhausted / undecodable
#[inline]
pub fn record_issue_dead_lettered(reason: &'static str) {
    metrics::counter!("coupon_issue_dead_lettered_total", "reason" => reason).increment(1);
}

/// 记录取消结果，`status` 为 success 或错误码
#[inline]
pub fn record_cancel(status: &'static str) {
    metrics::counter!("coupon_cancel_total", "status" => status).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_functions_do_not_panic() {
        // 即使没有初始化 recorder，这些函数也不应该 panic
        record_http_request("POST", "/api/coupons/{coupon_id}/issue", 202, 0.01);
        record_issue_request();
        record_gate_sold_out();
        record_issue_published();
        record_issue_consumed();
        for result in ["committed", "sold_out", "duplicate", "window_closed", "failed"] {
            record_issue_processed(result, 0.02);
        }
        record_issue_dead_lettered("retries_exhausted");
        record_cancel("success");
    }

    #[test]
    fn test_issue_counters_keep_one_series_per_name() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            for _ in 0..50 {
                record_issue_request();
                record_gate_sold_out();
                record_cancel("COUPON_NOT_FOUND");
            }
            record_issue_processed("committed", 0.01);
            record_issue_processed("not-a-result", 0.01);
        });

        let rendered = handle.render();
        assert!(!rendered.contains("coupon_id"));
        let series = |name: &str| {
            rendered
                .lines()
                .filter(|l| !l.starts_with('#') && l.starts_with(name))
                .count()
        };
        assert_eq!(series("coupon_issue_requests_total"), 1);
        assert_eq!(series("coupon_issue_gate_sold_out_total"), 1);
        assert_eq!(series("coupon_cancel_total"), 1);
        assert!(rendered.contains("coupon_issue_requests_total 50"));
        // 未知结果归入 failed，不会生成新的 result 标签值
        assert!(!rendered.contains("not-a-result"));
    }
}
