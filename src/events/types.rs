//! 上传事件类型定义
//!
//! 所有事件通过会话的事件通道推送，序列化后可直接输出为 JSON

use crate::error::UploadErrorKind;
use serde::{Deserialize, Serialize};

/// 上传事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// 文件加入上传队列
    FileAdded {
        file_id: u64,
        identifier: String,
        name: String,
        relative_path: String,
        total_size: u64,
        total_chunks: usize,
        paused: bool,
    },
    /// 进度更新
    FileProgress {
        file_id: u64,
        progress: f64,
        uploaded_size: u64,
        total_size: u64,
        /// 当前速度（字节/秒）
        current_speed: f64,
        /// 平滑后的平均速度（字节/秒）
        average_speed: f64,
    },
    /// 文件上传完成
    FileSuccess {
        file_id: u64,
        /// 触发完成的分片的服务器响应
        message: String,
        chunk: usize,
    },
    /// 文件上传失败
    FileError {
        file_id: u64,
        chunk: usize,
        kind: UploadErrorKind,
        /// HTTP 状态码，没有响应时为 0
        status: u16,
        message: String,
    },
    /// 分片重试
    FileRetry {
        file_id: u64,
        chunk: usize,
        retries: u32,
    },
    /// 文件被移出上传队列
    FileRemoved { file_id: u64 },
    /// 开始调度文件的分片
    UploadStart { file_id: u64 },
}

impl UploadEvent {
    /// 获取文件 ID
    pub fn file_id(&self) -> u64 {
        match self {
            UploadEvent::FileAdded { file_id, .. }
            | UploadEvent::FileProgress { file_id, .. }
            | UploadEvent::FileSuccess { file_id, .. }
            | UploadEvent::FileError { file_id, .. }
            | UploadEvent::FileRetry { file_id, .. }
            | UploadEvent::FileRemoved { file_id }
            | UploadEvent::UploadStart { file_id } => *file_id,
        }
    }

    /// 是否为文件的终态事件
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadEvent::FileSuccess { .. } | UploadEvent::FileError { .. }
        )
    }
}
