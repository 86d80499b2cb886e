//! 事件模块
//!
//! - `types.rs`: 队列树变更事件与活动分片表事件
//! - `throttle.rs`: 事件节流和合并工具，控制 UI 事件的发布频率

mod throttle;
mod types;

pub use throttle::*;
pub use types::*;
