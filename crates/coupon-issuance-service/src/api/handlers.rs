//! 请求处理器

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use chrono::Utc;
use serde_json::{json, Value};

use super::error::{ApiError, ApiResult};
use super::response::{ApiResponse, IssueAccepted};
use super::state::AppState;
use crate::error::IssuanceError;
use crate::models::UserKey;
use crate::outcome::{CancelReceipt, IssuanceOutcome, Rejection};
use crate::repository::IssuanceStore;

/// 申请发放
///
/// 闸门放行即返回 202，实际发放由队列消费端异步完成；
/// 闸门售罄返回 409。
pub async fn issue_coupon<S>(
    State(state): State<AppState<S>>,
    Extension(user_key): Extension<UserKey>,
    Path(coupon_id): Path<i64>,
) -> ApiResult<(StatusCode, Json<ApiResponse<IssueAccepted>>)>
where
    S: IssuanceStore + 'static,
{
    match state.gate.try_admit(coupon_id, &user_key).await {
        IssuanceOutcome::Admitted => Ok((
            StatusCode::ACCEPTED,
            Json(ApiResponse::with_code(
                "ACCEPTED",
                "发放请求已受理",
                IssueAccepted {
                    coupon_id,
                    user_key: user_key.to_string(),
                    accepted_at: Utc::now(),
                },
            )),
        )),
        IssuanceOutcome::Rejected(Rejection::SoldOut) => {
            Err(IssuanceError::SoldOut(coupon_id).into())
        }
        IssuanceOutcome::Failed(e) => Err(e.into()),
        other => Err(ApiError::from(IssuanceError::Internal(format!(
            "闸门返回了非预期结果: {}",
            other.label()
        )))),
    }
}

/// 取消发放
pub async fn cancel_issue<S>(
    State(state): State<AppState<S>>,
    Extension(user_key): Extension<UserKey>,
    Path(coupon_id): Path<i64>,
) -> ApiResult<Json<ApiResponse<CancelReceipt>>>
where
    S: IssuanceStore + 'static,
{
    let receipt = state.cancellation.cancel(coupon_id, &user_key).await?;
    Ok(Json(ApiResponse::success(receipt)))
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}
