//! 外部计数器
//!
//! 剩余库存、已发放计数等跨进程共享的原子状态只通过本模块的原语访问，
//! 不在进程内缓存，也不做客户端侧的读改写。

use async_trait::async_trait;

use coupon_shared::cache::Cache;

use crate::error::Result;

/// 计数器存储接口
///
/// 每个 key 上的操作须满足线性一致：原子增减、仅在不存在时设置、存在性检查。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn get_value(&self, key: &str) -> Result<Option<String>>;
    async fn set_value(&self, key: &str, value: &str) -> Result<()>;
    /// 返回 true 表示本次调用完成了初始化
    async fn set_if_absent(&self, key: &str, value: i64) -> Result<bool>;
    async fn exists(&self, key: &str) -> Result<bool>;
    /// 原子加一，返回新值
    async fn increment(&self, key: &str) -> Result<i64>;
    /// 原子减一，返回新值
    async fn decrement(&self, key: &str) -> Result<i64>;
}

#[async_trait]
impl CounterStore for Cache {
    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get_string(key).await?)
    }

    async fn set_value(&self, key: &str, value: &str) -> Result<()> {
        Ok(self.set_string(key, value).await?)
    }

    async fn set_if_absent(&self, key: &str, value: i64) -> Result<bool> {
        Ok(self.set_nx(key, &value.to_string()).await?)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(Cache::exists(self, key).await?)
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        Ok(self.incr(key, 1).await?)
    }

    async fn decrement(&self, key: &str) -> Result<i64> {
        Ok(self.decr(key, 1).await?)
    }
}

/// 计数器键生成器
pub struct CounterKey;

impl CounterKey {
    /// 缓存的发放上限（= 策略 total_quantity）
    pub fn limit(coupon_id: i64) -> String {
        format!("coupon:{}:limit", coupon_id)
    }

    /// 闸门使用的剩余库存
    pub fn stock(coupon_id: i64) -> String {
        format!("coupon:{}:stock", coupon_id)
    }

    /// 当前有效发放数，提交后加一、取消后减一
    pub fn count(coupon_id: i64) -> String {
        format!("coupon:{}:count", coupon_id)
    }

    /// 累计成功发放总数，取消不回退
    pub fn issued_total(coupon_id: i64) -> String {
        format!("coupon:{}:issued_total", coupon_id)
    }
}
