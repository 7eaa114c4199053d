//! 优惠券发放服务错误类型
//!
//! 定义服务层的业务错误和系统错误

use coupon_shared::error::SharedError;
use thiserror::Error;

use crate::outcome::Disposition;

/// 发放服务错误类型
#[derive(Debug, Error)]
pub enum IssuanceError {
    // === 引用不存在 ===
    #[error("优惠券不存在: {0}")]
    CouponNotFound(i64),

    #[error("发放策略不存在: {0}")]
    PolicyNotFound(i64),

    #[error("用户不存在: {0}")]
    UserNotFound(String),

    #[error("发放记录不存在: user_id={user_id}, coupon_id={coupon_id}")]
    IssueNotFound { user_id: i64, coupon_id: i64 },

    // === 业务拒绝 ===
    #[error("优惠券已售罄: coupon_id={0}")]
    SoldOut(i64),

    #[error("用户已领取该优惠券: user_id={user_id}, coupon_id={coupon_id}")]
    DuplicateIssue { user_id: i64, coupon_id: i64 },

    #[error("已使用的优惠券不可取消: issue_id={0}")]
    CannotCancelUsed(i64),

    // === 系统错误 ===
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis 错误: {0}")]
    Redis(String),

    #[error("Kafka 错误: {0}")]
    Kafka(String),

    #[error("JSON 序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("发放队列已满，请稍后重试")]
    QueueFull,

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 发放服务 Result 类型别名
pub type Result<T> = std::result::Result<T, IssuanceError>;

impl From<SharedError> for IssuanceError {
    fn from(err: SharedError) -> Self {
        match err {
            SharedError::Database(e) => Self::Database(e),
            SharedError::Redis(e) => Self::Redis(e.to_string()),
            SharedError::Kafka(msg) => Self::Kafka(msg),
            SharedError::Serialization(e) => Self::Serialization(e),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IssuanceError {
    /// 检查是否为可重试的错误
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Redis(_) | Self::Kafka(_))
    }

    /// 检查是否为业务错误（非系统错误）
    pub fn is_business_error(&self) -> bool {
        !matches!(
            self,
            Self::Database(_)
                | Self::Redis(_)
                | Self::Kafka(_)
                | Self::Serialization(_)
                | Self::QueueFull
                | Self::Internal(_)
        )
    }

    /// 是否为引用缺失类错误
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::CouponNotFound(_)
                | Self::PolicyNotFound(_)
                | Self::UserNotFound(_)
                | Self::IssueNotFound { .. }
        )
    }

    /// 消息投递层对该错误的处置方式
    ///
    /// 售罄、重复、已使用是终态，重试不会改变结果，直接确认；
    /// 引用缺失和系统错误交给重投递与死信机制。
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::SoldOut(_) | Self::DuplicateIssue { .. } | Self::CannotCancelUsed(_) => {
                Disposition::Ack
            }
            _ => Disposition::Redeliver,
        }
    }

    /// 获取错误码（用于 API 响应）
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::CouponNotFound(_) => "COUPON_NOT_FOUND",
            Self::PolicyNotFound(_) => "POLICY_NOT_FOUND",
            Self::UserNotFound(_) => "USER_NOT_FOUND",
            Self::IssueNotFound { .. } => "ISSUE_NOT_FOUND",
            Self::SoldOut(_) => "SOLD_OUT",
            Self::DuplicateIssue { .. } => "DUPLICATE",
            Self::CannotCancelUsed(_) => "CANNOT_CANCEL_USED",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Redis(_) => "REDIS_ERROR",
            Self::Kafka(_) => "KAFKA_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::QueueFull => "QUEUE_FULL",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}
