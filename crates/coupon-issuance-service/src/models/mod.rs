//! 优惠券发放领域模型
//!
//! 包含发放策略、优惠券、发放记录和用户实体定义

pub mod coupon;
pub mod coupon_issue;
pub mod policy;
pub mod user;

pub use coupon::Coupon;
pub use coupon_issue::{CouponIssue, NewCouponIssue};
pub use policy::CouponPolicy;
pub use user::{User, UserKey};
