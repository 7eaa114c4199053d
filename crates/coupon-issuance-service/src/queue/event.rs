//! 发放意图消息

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::UserKey;

/// 发放意图
///
/// 以 coupon_id 作为分区 key，同一优惠券的意图按发布顺序投递。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueEvent {
    pub coupon_id: i64,
    pub user_key: UserKey,
    pub requested_at: DateTime<Utc>,
}

impl IssueEvent {
    pub fn new(coupon_id: i64, user_key: UserKey) -> Self {
        Self {
            coupon_id,
            user_key,
            requested_at: Utc::now(),
        }
    }

    /// 分区 key
    pub fn partition_key(&self) -> String {
        self.coupon_id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let event = IssueEvent::new(42, UserKey::new("u-9"));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["coupon_id"], 42);
        assert_eq!(json["user_key"], "u-9");
        assert!(json.get("requested_at").is_some());
        assert_eq!(event.partition_key(), "42");
    }
}
