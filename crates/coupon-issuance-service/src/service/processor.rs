//! 发放处理器
//!
//! 每条投递的发放意图在单个事务内做权威校验与提交。
//!
//! ## 处理流程
//!
//! 1. 读取优惠券 -> 2. 排他锁读取策略 -> 3. 校验发放窗口（关闭则静默丢弃）
//!    -> 4. 校验剩余数量 -> 5. 解析用户 -> 6. 重复检查
//!    -> 7. 已发放数量加一 -> 8. 写入发放记录 -> 9. 提交后更新外部计数器
//!
//! 锁在其他所有校验之前获取，数量上限和重复检查都基于一致的快照，
//! 两个 worker 在同一策略上的竞争在加锁处串行化。

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{info, instrument, warn};

use coupon_shared::observability::metrics;

use crate::counter::{CounterKey, CounterStore};
use crate::error::{IssuanceError, Result};
use crate::models::{NewCouponIssue, UserKey};
use crate::outcome::{DropReason, IssuanceOutcome};
use crate::repository::{IssuanceStore, IssuanceTx};

/// 发放处理器
pub struct IssuanceProcessor<S>
where
    S: IssuanceStore,
{
    store: Arc<S>,
    counters: Arc<dyn CounterStore>,
}

impl<S> IssuanceProcessor<S>
where
    S: IssuanceStore,
{
    pub fn new(store: Arc<S>, counters: Arc<dyn CounterStore>) -> Self {
        Self { store, counters }
    }

    /// 处理一条发放意图
    ///
    /// 重复投递同一意图得到 `Rejected(Duplicate)`，不会二次发放。
    #[instrument(skip(self, user_key), fields(user_key = %user_key))]
    pub async fn process(&self, coupon_id: i64, user_key: &UserKey) -> IssuanceOutcome {
        let start = Instant::now();

        let outcome = match self.execute(coupon_id, user_key).await {
            Ok(outcome) => outcome,
            Err(e) => IssuanceOutcome::from_error(e),
        };

        match &outcome {
            IssuanceOutcome::Committed { issue_id } => {
                self.record_commit(coupon_id).await;
                info!(issue_id, "优惠券发放成功");
            }
            IssuanceOutcome::Rejected(rejection) => {
                info!(?rejection, "发放被拒绝");
            }
            IssuanceOutcome::Dropped(reason) => {
                info!(?reason, "策略当前不可发放，丢弃发放意图");
            }
            IssuanceOutcome::Failed(e) => {
                warn!(error = %e, code = e.error_code(), "发放处理失败");
            }
            IssuanceOutcome::Admitted => {}
        }

        metrics::record_issue_processed(outcome.label(), start.elapsed().as_secs_f64());
        outcome
    }

    async fn execute(&self, coupon_id: i64, user_key: &UserKey) -> Result<IssuanceOutcome> {
        // 提前返回的错误分支 drop 事务即回滚
        let mut tx = self.store.begin().await?;

        let coupon = tx
            .find_coupon(coupon_id)
            .await?
            .ok_or(IssuanceError::CouponNotFound(coupon_id))?;

        let mut policy = tx
            .lock_policy(coupon.policy_id)
            .await?
            .ok_or(IssuanceError::PolicyNotFound(coupon.policy_id))?;

        if !policy.is_issuable(Utc::now()) {
            tx.rollback().await?;
            return Ok(IssuanceOutcome::Dropped(DropReason::WindowClosed));
        }

        if !policy.can_issue() {
            return Err(IssuanceError::SoldOut(coupon_id));
        }

        let user = tx
            .find_user(user_key)
            .await?
            .ok_or_else(|| IssuanceError::UserNotFound(user_key.to_string()))?;

        if tx.find_active_issue(user.id, coupon.id).await?.is_some() {
            return Err(IssuanceError::DuplicateIssue {
                user_id: user.id,
                coupon_id: coupon.id,
            });
        }

        policy.increment_issued(coupon_id)?;
        tx.update_issued_quantity(policy.id, policy.issued_quantity)
            .await?;

        let issue = tx
            .insert_issue(&NewCouponIssue {
                user_id: user.id,
                coupon_id: coupon.id,
                issued_at: Utc::now(),
            })
            .await?;

        tx.commit().await?;

        Ok(IssuanceOutcome::Committed { issue_id: issue.id })
    }

    /// 提交后更新计数器，失败只记录告警，不影响已提交的事务
    async fn record_commit(&self, coupon_id: i64) {
        for key in [
            CounterKey::count(coupon_id),
            CounterKey::issued_total(coupon_id),
        ] {
            if let Err(e) = self.counters.increment(&key).await {
                warn!(key = %key, error = %e, "提交后更新计数器失败");
            }
        }
    }
}
