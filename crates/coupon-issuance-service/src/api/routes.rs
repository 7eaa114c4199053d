//! 路由配置

use std::time::Duration;

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};

use tower_http::timeout::TimeoutLayer;

use coupon_shared::observability::middleware::{http_tracing, request_id};

use super::{auth, handlers, state::AppState};
use crate::repository::IssuanceStore;

/// 闸门只访问 Redis 和队列，超过该时长视为依赖故障
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// 需要认证的业务路由
fn coupon_routes<S>(state: AppState<S>) -> Router<AppState<S>>
where
    S: IssuanceStore + 'static,
{
    Router::new()
        .route(
            "/coupons/{coupon_id}/issue",
            post(handlers::issue_coupon::<S>),
        )
        .route(
            "/coupons/{coupon_id}/cancel",
            delete(handlers::cancel_issue::<S>),
        )
        .route_layer(middleware::from_fn_with_state(
            state,
            auth::require_user::<S>,
        ))
}

/// 构建完整路由
pub fn build_router<S>(state: AppState<S>) -> Router
where
    S: IssuanceStore + 'static,
{
    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api", coupon_routes(state.clone()))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(middleware::from_fn(http_tracing))
        .layer(middleware::from_fn(request_id))
        .with_state(state)
}
