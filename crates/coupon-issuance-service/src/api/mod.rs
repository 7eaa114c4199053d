//! HTTP 接口层
//!
//! - `routes`: 路由与中间件装配
//! - `handlers`: 发放 / 取消 / 健康检查处理器
//! - `auth`: Bearer Token 校验，解析出调用方的用户标识
//! - `error`: 错误到 HTTP 响应的映射
//! - `response`: 统一响应结构
//! - `state`: 处理器共享状态

pub mod auth;
pub mod error;
pub mod handlers;
pub mod response;
pub mod routes;
pub mod state;

pub use auth::{Claims, JwtVerifier};
pub use error::ApiError;
pub use response::ApiResponse;
pub use routes::build_router;
pub use state::AppState;
