//! PostgreSQL 发放仓储
//!
//! 策略行通过 `SELECT ... FOR UPDATE` 加排他锁；
//! `coupon_issues` 上的部分唯一索引 `(user_id, coupon_id) WHERE NOT canceled`
//! 是重复发放的最终防线，应用层的预检查只是快速拒绝。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use super::traits::{CouponCatalog, IssuanceStore, IssuanceTx};
use crate::error::{IssuanceError, Result};
use crate::models::{Coupon, CouponIssue, CouponPolicy, NewCouponIssue, User, UserKey};

/// 基于 PgPool 的发放存储
#[derive(Clone)]
pub struct PgIssuanceStore {
    pool: PgPool,
}

impl PgIssuanceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CouponCatalog for PgIssuanceStore {
    async fn coupon_limit(&self, coupon_id: i64) -> Result<Option<i32>> {
        let limit = sqlx::query_scalar::<_, i32>(
            r#"
            SELECT p.total_quantity
            FROM coupons c
            JOIN coupon_policies p ON p.id = c.policy_id
            WHERE c.id = $1
            "#,
        )
        .bind(coupon_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(limit)
    }
}

#[async_trait]
impl IssuanceStore for PgIssuanceStore {
    type Tx = PgIssuanceTx;

    async fn begin(&self) -> Result<PgIssuanceTx> {
        let tx = self.pool.begin().await?;
        Ok(PgIssuanceTx { tx })
    }
}

/// PostgreSQL 事务句柄
///
/// 内部 `Transaction` 在 drop 时自动回滚。
pub struct PgIssuanceTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl IssuanceTx for PgIssuanceTx {
    async fn find_coupon(&mut self, coupon_id: i64) -> Result<Option<Coupon>> {
        let coupon = sqlx::query_as::<_, Coupon>(
            r#"
            SELECT id, name, discount_amount, policy_id, created_at
            FROM coupons
            WHERE id = $1
            "#,
        )
        .bind(coupon_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(coupon)
    }

    async fn lock_policy(&mut self, policy_id: i64) -> Result<Option<CouponPolicy>> {
        let policy = sqlx::query_as::<_, CouponPolicy>(
            r#"
            SELECT id, total_quantity, issued_quantity, start_at, end_at, active,
                   created_at, updated_at
            FROM coupon_policies
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(policy_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(policy)
    }

    async fn find_user(&mut self, user_key: &UserKey) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, user_key, display_name
            FROM users
            WHERE user_key = $1
            "#,
        )
        .bind(user_key.as_str())
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(user)
    }

    async fn find_active_issue(
        &mut self,
        user_id: i64,
        coupon_id: i64,
    ) -> Result<Option<CouponIssue>> {
        let issue = sqlx::query_as::<_, CouponIssue>(
            r#"
            SELECT id, user_id, coupon_id, issued_at, used, canceled, canceled_at
            FROM coupon_issues
            WHERE user_id = $1 AND coupon_id = $2 AND NOT canceled
            "#,
        )
        .bind(user_id)
        .bind(coupon_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(issue)
    }

    async fn update_issued_quantity(
        &mut self,
        policy_id: i64,
        issued_quantity: i32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE coupon_policies
            SET issued_quantity = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(policy_id)
        .bind(issued_quantity)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| match &e {
            // CHECK (issued_quantity <= total_quantity) 兜底
            sqlx::Error::Database(db) if db.is_check_violation() => {
                IssuanceError::Internal(format!(
                    "策略数量约束被违反: policy_id={policy_id}, issued_quantity={issued_quantity}"
                ))
            }
            _ => IssuanceError::Database(e),
        })?;

        Ok(())
    }

    async fn insert_issue(&mut self, issue: &NewCouponIssue) -> Result<CouponIssue> {
        let created = sqlx::query_as::<_, CouponIssue>(
            r#"
            INSERT INTO coupon_issues (user_id, coupon_id, issued_at, used, canceled)
            VALUES ($1, $2, $3, FALSE, FALSE)
            RETURNING id, user_id, coupon_id, issued_at, used, canceled, canceled_at
            "#,
        )
        .bind(issue.user_id)
        .bind(issue.coupon_id)
        .bind(issue.issued_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                IssuanceError::DuplicateIssue {
                    user_id: issue.user_id,
                    coupon_id: issue.coupon_id,
                }
            }
            _ => IssuanceError::Database(e),
        })?;

        Ok(created)
    }

    async fn mark_canceled(&mut self, issue_id: i64, canceled_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE coupon_issues
            SET canceled = TRUE, canceled_at = $2
            WHERE id = $1 AND NOT canceled
            "#,
        )
        .bind(issue_id)
        .bind(canceled_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
