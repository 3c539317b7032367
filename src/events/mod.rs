//! 事件模块
//!
//! 定义上传会话对外推送的事件类型和相关工具
//! - `types.rs`: 上传事件类型
//! - `throttle.rs`: 进度事件节流器，控制每个文件进度事件的发布频率

mod throttle;
mod types;

pub use throttle::*;
pub use types::*;
