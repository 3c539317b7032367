// 分片数据内存管理
//
// 已读取的分片数据计入内存占用；超出上限时由会话回收
// 不在传输中且读取时间超过 max_age 的分片数据，下次发送时重新读取

use std::time::Duration;
use tokio::time::Instant;

/// 内存占用统计
#[derive(Debug, Clone)]
pub struct MemoryTracker {
    usage: u64,
    max_usage: u64,
    max_age: Duration,
}

impl MemoryTracker {
    pub fn new(max_usage: u64, max_age: Duration) -> Self {
        Self {
            usage: 0,
            max_usage,
            max_age,
        }
    }

    pub fn usage(&self) -> u64 {
        self.usage
    }

    pub fn max_usage(&self) -> u64 {
        self.max_usage
    }

    /// 记录新读取的数据
    pub fn add(&mut self, bytes: u64) {
        self.usage += bytes;
    }

    /// 记录释放的数据
    pub fn release(&mut self, bytes: u64) {
        self.usage = self.usage.saturating_sub(bytes);
    }

    pub fn over_budget(&self) -> bool {
        self.usage > self.max_usage
    }

    /// 读取时间早于 max_age 的数据可以回收
    pub fn is_expired(&self, read_at: Instant, now: Instant) -> bool {
        now.saturating_duration_since(read_at) > self.max_age
    }
}
