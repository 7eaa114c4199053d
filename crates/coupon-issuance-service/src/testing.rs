//! 内存实现的存储与发布端
//!
//! 与 PostgreSQL / Redis 实现遵守相同的约束（活跃发放唯一、已发放数量 CHECK、
//! 计数器原子自增），供单元测试、集成测试和本地演示使用。
//! 事务通过一把异步互斥锁整体串行化，提交时把暂存副本写回。
//! 因此不同策略上的事务也不会并发，基于它的并发测试发现不了缺失的策略行锁。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

use crate::counter::CounterStore;
use crate::error::{IssuanceError, Result};
use crate::models::{Coupon, CouponIssue, CouponPolicy, NewCouponIssue, User, UserKey};
use crate::queue::{IssueEvent, IssuePublisher};
use crate::repository::{CouponCatalog, IssuanceStore, IssuanceTx};

// ==================== 计数器 ====================

/// 内存计数器，语义与 Redis 字符串计数一致：不存在的键按 0 自增
#[derive(Default)]
pub struct MemoryCounterStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: i64) {
        self.values.lock().insert(key.to_string(), value.to_string());
    }

    pub fn set_raw(&self, key: &str, value: &str) {
        self.values.lock().insert(key.to_string(), value.to_string());
    }

    pub fn value(&self, key: &str) -> Option<i64> {
        self.values.lock().get(key).and_then(|v| v.parse().ok())
    }

    fn add(&self, key: &str, delta: i64) -> Result<i64> {
        let mut values = self.values.lock();
        let current = match values.get(key) {
            Some(raw) => raw.parse::<i64>().map_err(|_| {
                IssuanceError::Redis(format!("value is not an integer: {}", key))
            })?,
            None => 0,
        };
        let next = current + delta;
        values.insert(key.to_string(), next.to_string());
        Ok(next)
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().get(key).cloned())
    }

    async fn set_value(&self, key: &str, value: &str) -> Result<()> {
        self.set_raw(key, value);
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: i64) -> Result<bool> {
        let mut values = self.values.lock();
        if values.contains_key(key) {
            return Ok(false);
        }
        values.insert(key.to_string(), value.to_string());
        Ok(true)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.values.lock().contains_key(key))
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        self.add(key, 1)
    }

    async fn decrement(&self, key: &str) -> Result<i64> {
        self.add(key, -1)
    }
}

// ==================== 发放存储 ====================

/// 策略种子
#[derive(Debug, Clone)]
pub struct PolicySeed {
    pub total_quantity: i32,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub active: bool,
}

impl PolicySeed {
    /// 当前正处于发放窗口内的策略
    pub fn open(total_quantity: i32) -> Self {
        let now = Utc::now();
        Self {
            total_quantity,
            start_at: now - Duration::hours(1),
            end_at: now + Duration::days(1),
            active: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    users: Vec<User>,
    policies: HashMap<i64, CouponPolicy>,
    coupons: HashMap<i64, Coupon>,
    issues: Vec<CouponIssue>,
    next_id: i64,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// 内存发放存储
#[derive(Clone, Default)]
pub struct MemoryIssuanceStore {
    data: Arc<Mutex<MemoryState>>,
    tx_lock: Arc<tokio::sync::Mutex<()>>,
}

impl MemoryIssuanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建策略和对应优惠券，返回 coupon_id
    pub fn seed_coupon(&self, seed: PolicySeed) -> i64 {
        let mut state = self.data.lock();
        let now = Utc::now();

        let policy_id = state.next_id();
        state.policies.insert(
            policy_id,
            CouponPolicy {
                id: policy_id,
                total_quantity: seed.total_quantity,
                issued_quantity: 0,
                start_at: seed.start_at,
                end_at: seed.end_at,
                active: seed.active,
                created_at: now,
                updated_at: now,
            },
        );

        let coupon_id = state.next_id();
        state.coupons.insert(
            coupon_id,
            Coupon {
                id: coupon_id,
                name: format!("coupon-{}", coupon_id),
                discount_amount: 1000,
                policy_id,
                created_at: now,
            },
        );
        coupon_id
    }

    pub fn seed_user(&self, user_key: &str) -> i64 {
        let mut state = self.data.lock();
        let id = state.next_id();
        state.users.push(User {
            id,
            user_key: user_key.to_string(),
            display_name: user_key.to_string(),
        });
        id
    }

    /// 模拟核销
    pub fn mark_used(&self, issue_id: i64) {
        if let Some(issue) = self
            .data
            .lock()
            .issues
            .iter_mut()
            .find(|i| i.id == issue_id)
        {
            issue.used = true;
        }
    }

    pub fn issued_quantity(&self, coupon_id: i64) -> i32 {
        let state = self.data.lock();
        state
            .coupons
            .get(&coupon_id)
            .and_then(|c| state.policies.get(&c.policy_id))
            .map(|p| p.issued_quantity)
            .unwrap_or_default()
    }

    pub fn active_issue_count(&self, coupon_id: i64) -> usize {
        self.data
            .lock()
            .issues
            .iter()
            .filter(|i| i.coupon_id == coupon_id && i.is_active())
            .count()
    }

    /// 某优惠券的全部发放记录（含已取消）
    pub fn issues_for(&self, coupon_id: i64) -> Vec<CouponIssue> {
        self.data
            .lock()
            .issues
            .iter()
            .filter(|i| i.coupon_id == coupon_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CouponCatalog for MemoryIssuanceStore {
    async fn coupon_limit(&self, coupon_id: i64) -> Result<Option<i32>> {
        let state = self.data.lock();
        Ok(state
            .coupons
            .get(&coupon_id)
            .and_then(|c| state.policies.get(&c.policy_id))
            .map(|p| p.total_quantity))
    }
}

#[async_trait]
impl IssuanceStore for MemoryIssuanceStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx> {
        let guard = Arc::clone(&self.tx_lock).lock_owned().await;
        let staged = self.data.lock().clone();
        Ok(MemoryTx {
            _guard: guard,
            staged,
            data: Arc::clone(&self.data),
        })
    }
}

/// 内存事务，drop 未提交即丢弃暂存副本
pub struct MemoryTx {
    _guard: OwnedMutexGuard<()>,
    staged: MemoryState,
    data: Arc<Mutex<MemoryState>>,
}

#[async_trait]
impl IssuanceTx for MemoryTx {
    async fn find_coupon(&mut self, coupon_id: i64) -> Result<Option<Coupon>> {
        Ok(self.staged.coupons.get(&coupon_id).cloned())
    }

    async fn lock_policy(&mut self, policy_id: i64) -> Result<Option<CouponPolicy>> {
        Ok(self.staged.policies.get(&policy_id).cloned())
    }

    async fn find_user(&mut self, user_key: &UserKey) -> Result<Option<User>> {
        Ok(self
            .staged
            .users
            .iter()
            .find(|u| u.user_key == user_key.as_str())
            .cloned())
    }

    async fn find_active_issue(
        &mut self,
        user_id: i64,
        coupon_id: i64,
    ) -> Result<Option<CouponIssue>> {
        Ok(self
            .staged
            .issues
            .iter()
            .find(|i| i.user_id == user_id && i.coupon_id == coupon_id && i.is_active())
            .cloned())
    }

    async fn update_issued_quantity(
        &mut self,
        policy_id: i64,
        issued_quantity: i32,
    ) -> Result<()> {
        let policy = self
            .staged
            .policies
            .get_mut(&policy_id)
            .ok_or(IssuanceError::PolicyNotFound(policy_id))?;

        if issued_quantity < 0 || issued_quantity > policy.total_quantity {
            return Err(IssuanceError::Internal(format!(
                "已发放数量越界: policy_id={}, issued_quantity={}",
                policy_id, issued_quantity
            )));
        }
        policy.issued_quantity = issued_quantity;
        policy.updated_at = Utc::now();
        Ok(())
    }

    async fn insert_issue(&mut self, issue: &NewCouponIssue) -> Result<CouponIssue> {
        let duplicate = self.staged.issues.iter().any(|i| {
            i.user_id == issue.user_id && i.coupon_id == issue.coupon_id && i.is_active()
        });
        if duplicate {
            return Err(IssuanceError::DuplicateIssue {
                user_id: issue.user_id,
                coupon_id: issue.coupon_id,
            });
        }

        let record = CouponIssue {
            id: self.staged.next_id(),
            user_id: issue.user_id,
            coupon_id: issue.coupon_id,
            issued_at: issue.issued_at,
            used: false,
            canceled: false,
            canceled_at: None,
        };
        self.staged.issues.push(record.clone());
        Ok(record)
    }

    async fn mark_canceled(&mut self, issue_id: i64, canceled_at: DateTime<Utc>) -> Result<()> {
        if let Some(issue) = self
            .staged
            .issues
            .iter_mut()
            .find(|i| i.id == issue_id && i.is_active())
        {
            issue.mark_canceled(canceled_at);
        }
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        *self.data.lock() = self.staged;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        Ok(())
    }
}

// ==================== 发布端 ====================

/// 只记录不投递的发布端
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<IssueEvent>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<IssueEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl IssuePublisher for RecordingPublisher {
    async fn publish(&self, event: &IssueEvent) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counter_increments_missing_key_from_zero() {
        let counters = MemoryCounterStore::new();
        assert_eq!(counters.increment("k").await.unwrap(), 1);
        assert_eq!(counters.decrement("k").await.unwrap(), 0);
        assert!(!counters.set_if_absent("k", 10).await.unwrap());
        assert!(counters.set_if_absent("other", 10).await.unwrap());
        assert_eq!(counters.value("other"), Some(10));
    }

    #[tokio::test]
    async fn test_uncommitted_tx_is_discarded() {
        let store = MemoryIssuanceStore::new();
        let coupon_id = store.seed_coupon(PolicySeed::open(5));
        let user_id = store.seed_user("alice");

        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_issue(&NewCouponIssue {
                user_id,
                coupon_id,
                issued_at: Utc::now(),
            })
            .await
            .unwrap();
        }

        assert!(store.issues_for(coupon_id).is_empty());
    }

    #[tokio::test]
    async fn test_active_issue_uniqueness() {
        let store = MemoryIssuanceStore::new();
        let coupon_id = store.seed_coupon(PolicySeed::open(5));
        let user_id = store.seed_user("alice");
        let new_issue = NewCouponIssue {
            user_id,
            coupon_id,
            issued_at: Utc::now(),
        };

        let mut tx = store.begin().await.unwrap();
        let first = tx.insert_issue(&new_issue).await.unwrap();
        assert!(matches!(
            tx.insert_issue(&new_issue).await,
            Err(IssuanceError::DuplicateIssue { .. })
        ));

        tx.mark_canceled(first.id, Utc::now()).await.unwrap();
        assert!(tx.insert_issue(&new_issue).await.is_ok());
        tx.commit().await.unwrap();

        assert_eq!(store.issues_for(coupon_id).len(), 2);
        assert_eq!(store.active_issue_count(coupon_id), 1);
    }

    #[tokio::test]
    async fn test_issued_quantity_check() {
        let store = MemoryIssuanceStore::new();
        let coupon_id = store.seed_coupon(PolicySeed::open(1));
        let mut tx = store.begin().await.unwrap();
        let coupon = tx.find_coupon(coupon_id).await.unwrap().unwrap();

        assert!(tx.update_issued_quantity(coupon.policy_id, 2).await.is_err());
        assert!(tx.update_issued_quantity(coupon.policy_id, -1).await.is_err());
        assert!(tx.update_issued_quantity(coupon.policy_id, 1).await.is_ok());
    }
}
