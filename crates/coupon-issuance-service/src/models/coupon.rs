//! 优惠券实体

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 优惠券
///
/// 绑定且仅绑定一个发放策略，一个策略可以支撑多个优惠券
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Coupon {
    pub id: i64,
    pub name: String,
    /// 优惠金额（分）
    pub discount_amount: i64,
    pub policy_id: i64,
    pub created_at: DateTime<Utc>,
}
