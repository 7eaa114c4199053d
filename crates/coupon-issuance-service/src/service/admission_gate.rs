//! 准入闸门
//!
//! 请求线程上的同步预检，只访问计数器存储，不触碰数据库热路径：
//!
//! 1. 读取缓存的发放上限，未命中或缓存值损坏时从数据库读取一次并回填
//! 2. 用 SET NX 惰性初始化剩余库存，并发初始化者不会覆盖进行中的倒数
//! 3. 原子扣减库存
//! 4. 扣减后为负则加回并返回售罄，否则发布发放意图
//!
//! 1~3 步不是一个原子单元：初始化与扣减之间崩溃是自愈的，
//! 损失的库存单位只会让容量保守地减少，不会超发。

use std::sync::Arc;

use tracing::{info, instrument, warn};

use coupon_shared::observability::metrics;

use crate::counter::{CounterKey, CounterStore};
use crate::error::{IssuanceError, Result};
use crate::models::UserKey;
use crate::outcome::{IssuanceOutcome, Rejection};
use crate::queue::{IssueEvent, IssuePublisher};
use crate::repository::CouponCatalog;

/// 准入闸门
pub struct AdmissionGate {
    counters: Arc<dyn CounterStore>,
    catalog: Arc<dyn CouponCatalog>,
    publisher: Arc<dyn IssuePublisher>,
}

impl AdmissionGate {
    pub fn new(
        counters: Arc<dyn CounterStore>,
        catalog: Arc<dyn CouponCatalog>,
        publisher: Arc<dyn IssuePublisher>,
    ) -> Self {
        Self {
            counters,
            catalog,
            publisher,
        }
    }

    /// 尝试放行一次发放请求
    ///
    /// 返回 `Admitted`、`Rejected(SoldOut)` 或 `Failed`。
    /// 闸门的售罄是最终结果，不会自动重试。
    #[instrument(skip(self, user_key), fields(user_key = %user_key))]
    pub async fn try_admit(&self, coupon_id: i64, user_key: &UserKey) -> IssuanceOutcome {
        metrics::record_issue_request();

        match self.admit(coupon_id, user_key).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, code = e.error_code(), "闸门处理失败");
                IssuanceOutcome::Failed(e)
            }
        }
    }

    async fn admit(&self, coupon_id: i64, user_key: &UserKey) -> Result<IssuanceOutcome> {
        let limit = self.resolve_limit(coupon_id).await?;
        self.ensure_stock(coupon_id, limit).await?;

        let stock_key = CounterKey::stock(coupon_id);
        let remaining = self.counters.decrement(&stock_key).await?;

        if remaining < 0 {
            // 撤销超扣，计数器最多只偏离一个在途冲突
            if let Err(e) = self.counters.increment(&stock_key).await {
                warn!(error = %e, "售罄后回补库存计数失败");
            }
            metrics::record_gate_sold_out();
            info!(remaining, "库存已耗尽，拒绝请求");
            return Ok(IssuanceOutcome::Rejected(Rejection::SoldOut));
        }

        let event = IssueEvent::new(coupon_id, user_key.clone());
        if let Err(e) = self.publisher.publish(&event).await {
            // 意图未入队，归还本次扣减的库存单位
            if let Err(restore_err) = self.counters.increment(&stock_key).await {
                warn!(error = %restore_err, "发布失败后归还库存失败");
            }
            return Err(e);
        }

        metrics::record_issue_published();
        info!(remaining, "请求已放行，发放意图已入队");
        Ok(IssuanceOutcome::Admitted)
    }

    /// 解析发放上限
    ///
    /// 上限在策略生命周期内不可变，缓存不设过期；无法解析的缓存值触发回源，
    /// 不向下游传播。
    async fn resolve_limit(&self, coupon_id: i64) -> Result<i64> {
        let key = CounterKey::limit(coupon_id);

        if let Some(raw) = self.counters.get_value(&key).await? {
            match raw.trim().parse::<i64>() {
                Ok(limit) => return Ok(limit),
                Err(_) => warn!(raw = %raw, "缓存的发放上限无法解析，回源读取"),
            }
        }

        let limit = self
            .catalog
            .coupon_limit(coupon_id)
            .await?
            .ok_or(IssuanceError::CouponNotFound(coupon_id))?;

        self.counters.set_value(&key, &limit.to_string()).await?;
        Ok(i64::from(limit))
    }

    async fn ensure_stock(&self, coupon_id: i64, limit: i64) -> Result<()> {
        let key = CounterKey::stock(coupon_id);
        if !self.counters.exists(&key).await?
            && self.counters.set_if_absent(&key, limit).await?
        {
            info!(coupon_id, limit, "库存计数器已初始化");
        }
        Ok(())
    }
}
