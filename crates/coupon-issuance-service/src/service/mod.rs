//! 服务层
//!
//! ## 模块结构
//!
//! - `admission_gate`: 请求时的近似库存预检（只访问计数器）
//! - `processor`: 行锁串行化的权威校验与提交
//! - `cancellation`: 取消发放与补偿

pub mod admission_gate;
pub mod cancellation;
pub mod processor;

pub use admission_gate::AdmissionGate;
pub use cancellation::CancellationService;
pub use processor::IssuanceProcessor;
