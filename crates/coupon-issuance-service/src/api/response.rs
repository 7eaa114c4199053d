//! 统一响应结构

use chrono::{DateTime, Utc};
use serde::Serialize;

/// API 统一响应
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub success: bool,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self::with_code("SUCCESS", "操作成功", data)
    }

    pub fn with_code(code: &str, message: &str, data: T) -> Self {
        Self {
            success: true,
            code: code.to_string(),
            message: message.to_string(),
            data: Some(data),
        }
    }
}

/// 发放请求已受理
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueAccepted {
    pub coupon_id: i64,
    pub user_key: String,
    pub accepted_at: DateTime<Utc>,
}
