//! 优惠券发放服务
//!
//! 在高并发下发放限量优惠券：任何时刻有效发放数不超过策略上限，
//! 同一用户对同一优惠券至多持有一张有效发放，取消后释放名额。
//!
//! ## 两段式准入
//!
//! - **闸门**：请求线程上基于 Redis 原子计数的近似库存预检，挡掉绝大部分超额请求
//! - **处理器**：队列消费端在数据库事务内锁定策略行，做权威的数量和重复校验
//!
//! 闸门只决定"是否值得排队"，正确性由处理器的行锁和部分唯一索引保证。
//!
//! ## 模块结构
//!
//! - `models`: 领域模型
//! - `error`: 错误类型及其投递处置
//! - `outcome`: 一次发放尝试的结果
//! - `counter`: 计数器存储抽象与键格式
//! - `repository`: 数据库访问
//! - `queue`: 发放意图的发布、消费与 worker 池
//! - `service`: 闸门、处理器、取消
//! - `api`: HTTP 接口
//! - `testing`: 内存实现，供测试和本地运行使用

pub mod api;
pub mod counter;
pub mod error;
pub mod models;
pub mod outcome;
pub mod queue;
pub mod repository;
pub mod service;
pub mod testing;

pub use error::{IssuanceError, Result};
pub use outcome::{CancelReceipt, Disposition, DropReason, IssuanceOutcome, Rejection};
