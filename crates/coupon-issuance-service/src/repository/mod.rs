//! 数据库仓储层
//!
//! ## 设计原则
//!
//! - 仓储只负责数据持久化，不包含业务逻辑
//! - 事务边界由服务层通过 `IssuanceStore::begin` 控制
//! - 定义 trait 接口，服务层可以在内存实现上测试

mod issuance_repo;
mod traits;

pub use issuance_repo::{PgIssuanceStore, PgIssuanceTx};
pub use traits::*;
