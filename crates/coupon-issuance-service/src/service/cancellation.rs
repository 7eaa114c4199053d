//! 取消与补偿
//!
//! 同步、事务性地撤销一次发放对数量和库存的影响，发放记录只打取消标记。
//!
//! ## 取消流程
//!
//! 1. 读取优惠券 -> 2. 排他锁读取策略 -> 3. 解析用户 -> 4. 查找活跃发放记录
//!    -> 5. 已核销则拒绝 -> 6. 标记取消 -> 7. 已发放数量减一（不低于 0）
//!    -> 8. 提交 -> 9. 计数器减一、库存加一
//!
//! 策略锁先于发放记录获取，与处理器的加锁顺序一致；
//! 库存在事务提交之后才归还，闸门不会在数量回退落盘前看到多出的库存。

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use coupon_shared::observability::metrics;

use crate::counter::{CounterKey, CounterStore};
use crate::error::{IssuanceError, Result};
use crate::models::UserKey;
use crate::outcome::CancelReceipt;
use crate::repository::{IssuanceStore, IssuanceTx};

/// 取消服务
pub struct CancellationService<S>
where
    S: IssuanceStore,
{
    store: Arc<S>,
    counters: Arc<dyn CounterStore>,
}

impl<S> CancellationService<S>
where
    S: IssuanceStore,
{
    pub fn new(store: Arc<S>, counters: Arc<dyn CounterStore>) -> Self {
        Self { store, counters }
    }

    /// 取消用户对某优惠券的有效发放
    #[instrument(skip(self, user_key), fields(user_key = %user_key))]
    pub async fn cancel(&self, coupon_id: i64, user_key: &UserKey) -> Result<CancelReceipt> {
        let result = self.execute(coupon_id, user_key).await;

        match &result {
            Ok(receipt) => {
                self.restore_counters(coupon_id).await;
                metrics::record_cancel("success");
                info!(
                    issue_id = receipt.issue_id,
                    issued_quantity = receipt.issued_quantity,
                    "优惠券发放已取消"
                );
            }
            Err(e) => {
                metrics::record_cancel(e.error_code());
                warn!(error = %e, code = e.error_code(), "取消失败");
            }
        }

        result
    }

    async fn execute(&self, coupon_id: i64, user_key: &UserKey) -> Result<CancelReceipt> {
        let mut tx = self.store.begin().await?;

        let coupon = tx
            .find_coupon(coupon_id)
            .await?
            .ok_or(IssuanceError::CouponNotFound(coupon_id))?;

        let mut policy = tx
            .lock_policy(coupon.policy_id)
            .await?
            .ok_or(IssuanceError::PolicyNotFound(coupon.policy_id))?;

        let user = tx
            .find_user(user_key)
            .await?
            .ok_or_else(|| IssuanceError::UserNotFound(user_key.to_string()))?;

        let issue = tx
            .find_active_issue(user.id, coupon.id)
            .await?
            .ok_or(IssuanceError::IssueNotFound {
                user_id: user.id,
                coupon_id: coupon.id,
            })?;

        issue.ensure_cancelable()?;

        let canceled_at = Utc::now();
        tx.mark_canceled(issue.id, canceled_at).await?;

        policy.decrement_issued();
        tx.update_issued_quantity(policy.id, policy.issued_quantity)
            .await?;

        tx.commit().await?;

        Ok(CancelReceipt {
            issue_id: issue.id,
            coupon_id: coupon.id,
            issued_quantity: policy.issued_quantity,
            canceled_at,
        })
    }

    /// 提交后的计数器补偿
    ///
    /// 库存键不存在时不做加一：闸门下次会用 SET NX 以完整上限初始化它，
    /// 此时凭空创建值为 1 的键反而会锁死容量。
    async fn restore_counters(&self, coupon_id: i64) {
        let count_key = CounterKey::count(coupon_id);
        if let Err(e) = self.counters.decrement(&count_key).await {
            warn!(key = %count_key, error = %e, "取消后扣减发放计数失败");
        }

        let stock_key = CounterKey::stock(coupon_id);
        match self.counters.exists(&stock_key).await {
            Ok(true) => {
                if let Err(e) = self.counters.increment(&stock_key).await {
                    warn!(key = %stock_key, error = %e, "取消后归还库存失败");
                }
            }
            Ok(false) => debug!(key = %stock_key, "库存计数器未初始化，跳过归还"),
            Err(e) => warn!(key = %stock_key, error = %e, "检查库存计数器失败"),
        }
    }
}
