//! 进度事件节流器
//!
//! 用于控制单个文件进度事件的发布频率，避免事件风暴
//! 节流器由会话 actor 独占，不需要原子操作

use std::time::Duration;
use tokio::time::Instant;

/// 进度事件节流器
///
/// 除了时间间隔判断，还记录一次"延迟发布"：间隔内到达的分片成功事件
/// 不直接丢弃，而是在间隔结束时补发一次进度
#[derive(Debug, Clone)]
pub struct ProgressThrottler {
    /// 上次发布事件的时间
    last_emit: Instant,
    /// 节流间隔
    interval: Duration,
    /// 当前有效的延迟发布序号，None 表示没有待发布的延迟事件
    deferred: Option<u64>,
    /// 延迟发布序号生成器
    deferred_seq: u64,
}

impl ProgressThrottler {
    /// 创建新的节流器，以当前时间作为上次发布时间
    pub fn new(interval: Duration) -> Self {
        Self {
            last_emit: Instant::now(),
            interval,
            deferred: None,
            deferred_seq: 0,
        }
    }

    pub fn last_emit(&self) -> Instant {
        self.last_emit
    }

    /// 距离上次发布已超过节流间隔
    pub fn should_emit(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_emit) >= self.interval
    }

    /// 间隔内还需等待的时间，已到达间隔返回 None
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        let elapsed = now.saturating_duration_since(self.last_emit);
        if elapsed < self.interval {
            Some(self.interval - elapsed)
        } else {
            None
        }
    }

    /// 记录一次发布
    pub fn mark_emitted(&mut self, now: Instant) {
        self.last_emit = now;
    }

    /// 登记一次延迟发布，旧的延迟发布随之失效，返回新序号
    pub fn defer(&mut self) -> u64 {
        self.deferred_seq += 1;
        self.deferred = Some(self.deferred_seq);
        self.deferred_seq
    }

    /// 取消待发布的延迟事件
    pub fn cancel_deferred(&mut self) {
        self.deferred = None;
    }

    /// 延迟时间到达，序号仍然有效时消费它并返回 true
    pub fn take_deferred(&mut self, seq: u64) -> bool {
        if self.deferred == Some(seq) {
            self.deferred = None;
            true
        } else {
            false
        }
    }
}
