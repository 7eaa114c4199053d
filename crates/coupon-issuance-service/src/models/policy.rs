//! 发放策略
//!
//! 一个优惠券活动的数量上限和发放时间窗口

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{IssuanceError, Result};

/// 优惠券发放策略
///
/// 在行锁保护下始终满足 `0 <= issued_quantity <= total_quantity`。
/// `issued_quantity` 只由处理器提交递增、由取消提交递减。
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct CouponPolicy {
    pub id: i64,
    /// 总发放上限，创建后不可变
    pub total_quantity: i32,
    /// 当前已发放数量
    pub issued_quantity: i32,
    /// 发放窗口开始时间（含）
    pub start_at: DateTime<Utc>,
    /// 发放窗口结束时间（含）
    pub end_at: DateTime<Utc>,
    /// 独立于时间窗口的启停开关
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CouponPolicy {
    /// 当前时刻是否可发放
    pub fn is_issuable(&self, now: DateTime<Utc>) -> bool {
        self.active && self.start_at <= now && now <= self.end_at
    }

    /// 是否还有剩余数量
    pub fn can_issue(&self) -> bool {
        self.issued_quantity < self.total_quantity
    }

    /// 已发放数量加一，达到上限时返回售罄
    pub fn increment_issued(&mut self, coupon_id: i64) -> Result<()> {
        if !self.can_issue() {
            return Err(IssuanceError::SoldOut(coupon_id));
        }
        self.issued_quantity += 1;
        Ok(())
    }

    /// 已发放数量减一，最低为 0
    pub fn decrement_issued(&mut self) {
        if self.issued_quantity > 0 {
            self.issued_quantity -= 1;
        }
    }
}
