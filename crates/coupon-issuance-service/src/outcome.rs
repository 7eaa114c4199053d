//! 发放结果
//!
//! 闸门与处理器都以数据形式返回结果，调用方按变体分支，
//! 业务拒绝（售罄、重复、窗口关闭）不再混入错误通道。

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::IssuanceError;

/// 业务拒绝原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    SoldOut,
    Duplicate,
}

/// 静默丢弃原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// 策略未激活或不在发放时间窗口内
    WindowClosed,
}

/// 消息投递层的处置方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// 确认消息，不再投递
    Ack,
    /// 交给重试与死信机制
    Redeliver,
}

/// 一次发放尝试的结果
#[derive(Debug)]
pub enum IssuanceOutcome {
    /// 闸门放行，发放意图已入队
    Admitted,
    /// 处理器已提交发放记录
    Committed { issue_id: i64 },
    Rejected(Rejection),
    Dropped(DropReason),
    Failed(IssuanceError),
}

impl IssuanceOutcome {
    /// 将业务错误折叠为对应的拒绝变体，其余错误保留为 `Failed`
    pub fn from_error(err: IssuanceError) -> Self {
        match err {
            IssuanceError::SoldOut(_) => Self::Rejected(Rejection::SoldOut),
            IssuanceError::DuplicateIssue { .. } => Self::Rejected(Rejection::Duplicate),
            other => Self::Failed(other),
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            Self::Failed(err) => err.disposition(),
            _ => Disposition::Ack,
        }
    }

    /// 指标与日志使用的短标签
    pub fn label(&self) -> &'static str {
        match self {
            Self::Admitted => "admitted",
            Self::Committed { .. } => "committed",
            Self::Rejected(Rejection::SoldOut) => "sold_out",
            Self::Rejected(Rejection::Duplicate) => "duplicate",
            Self::Dropped(DropReason::WindowClosed) => "window_closed",
            Self::Failed(_) => "failed",
        }
    }
}

/// 取消回执
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelReceipt {
    pub issue_id: i64,
    pub coupon_id: i64,
    /// 补偿后策略的已发放数量
    pub issued_quantity: i32,
    pub canceled_at: DateTime<Utc>,
}
