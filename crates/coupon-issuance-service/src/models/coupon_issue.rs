//! 发放记录
//!
//! 一个用户对一张优惠券的领取记录。取消只打标记，不物理删除，
//! 同一 (user_id, coupon_id) 至多存在一条未取消记录。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{IssuanceError, Result};

/// 优惠券发放记录
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct CouponIssue {
    pub id: i64,
    pub user_id: i64,
    pub coupon_id: i64,
    pub issued_at: DateTime<Utc>,
    /// 是否已核销（由核销流程设置）
    pub used: bool,
    pub canceled: bool,
    #[sqlx(default)]
    pub canceled_at: Option<DateTime<Utc>>,
}

impl CouponIssue {
    /// 未取消的记录占用该用户对该券的唯一名额
    pub fn is_active(&self) -> bool {
        !self.canceled
    }

    /// 校验能否取消，已核销的记录永远不可取消
    pub fn ensure_cancelable(&self) -> Result<()> {
        if self.used {
            return Err(IssuanceError::CannotCancelUsed(self.id));
        }
        Ok(())
    }

    pub fn mark_canceled(&mut self, now: DateTime<Utc>) {
        self.canceled = true;
        self.canceled_at = Some(now);
    }
}

/// 待写入的发放记录
#[derive(Debug, Clone)]
pub struct NewCouponIssue {
    pub user_id: i64,
    pub coupon_id: i64,
    pub issued_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(used: bool) -> CouponIssue {
        CouponIssue {
            id: 11,
            user_id: 1,
            coupon_id: 2,
            issued_at: Utc::now(),
            used,
            canceled: false,
            canceled_at: None,
        }
    }

    #[test]
    fn test_used_issue_cannot_be_canceled() {
        assert!(matches!(
            issue(true).ensure_cancelable(),
            Err(IssuanceError::CannotCancelUsed(11))
        ));
        assert!(issue(false).ensure_cancelable().is_ok());
    }

    #[test]
    fn test_mark_canceled_keeps_record() {
        let mut record = issue(false);
        assert!(record.is_active());
        let now = Utc::now();
        record.mark_canceled(now);
        assert!(!record.is_active());
        assert_eq!(record.canceled_at, Some(now));
        assert_eq!(record.id, 11);
    }
}
