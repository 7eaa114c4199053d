//! 仓储 Trait 定义
//!
//! 服务层依赖这些抽象而非具体数据库实现

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{Coupon, CouponIssue, CouponPolicy, NewCouponIssue, User, UserKey};

/// 优惠券目录（只读，不加锁）
///
/// 闸门在缓存未命中时通过它读取发放上限，不参与事务。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CouponCatalog: Send + Sync {
    /// 返回优惠券所属策略的 total_quantity，优惠券不存在时返回 None
    async fn coupon_limit(&self, coupon_id: i64) -> Result<Option<i32>>;
}

/// 事务型存储
///
/// 每次 `begin` 开启一个独立事务，未提交就被 drop 的事务自动回滚。
#[async_trait]
pub trait IssuanceStore: Send + Sync {
    type Tx: IssuanceTx;

    async fn begin(&self) -> Result<Self::Tx>;
}

/// 发放事务内可用的操作
#[async_trait]
pub trait IssuanceTx: Send + Sized {
    async fn find_coupon(&mut self, coupon_id: i64) -> Result<Option<Coupon>>;

    /// 以排他行锁读取策略，锁持有到事务结束
    ///
    /// 这是同一策略上所有数量变更（发放与取消）的唯一串行化点。
    async fn lock_policy(&mut self, policy_id: i64) -> Result<Option<CouponPolicy>>;

    async fn find_user(&mut self, user_key: &UserKey) -> Result<Option<User>>;

    /// 查找 (user, coupon) 上未取消的发放记录
    async fn find_active_issue(
        &mut self,
        user_id: i64,
        coupon_id: i64,
    ) -> Result<Option<CouponIssue>>;

    async fn update_issued_quantity(&mut self, policy_id: i64, issued_quantity: i32)
    -> Result<()>;

    /// 写入发放记录
    ///
    /// 违反活跃记录唯一约束时返回 `DuplicateIssue`。
    async fn insert_issue(&mut self, issue: &NewCouponIssue) -> Result<CouponIssue>;

    async fn mark_canceled(&mut self, issue_id: i64, canceled_at: DateTime<Utc>) -> Result<()>;

    async fn commit(self) -> Result<()>;

    async fn rollback(self) -> Result<()>;
}
