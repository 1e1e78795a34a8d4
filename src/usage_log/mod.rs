//! 用量日志模块
//!
//! 提供用量记录的异步持久化、聚合查询和报表 API

pub mod model;
pub mod store;
mod handlers;
mod router;

pub use model::Timeframe;
pub use router::create_usage_router;
pub use store::UsageLog;
