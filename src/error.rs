// 上传错误定义
//
// - UploadError: 库对外暴露的错误类型
// - UploadErrorKind: HTTP 状态码 / 传输层失败的分类和提示文案

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 上传错误
#[derive(Debug, Clone, Error)]
pub enum UploadError {
    /// 网络层失败（连接、超时、DNS 等），状态码记为 0
    #[error("传输失败: {0}")]
    Transport(String),
    /// 永久错误（命中 permanentErrors 或重试次数耗尽），不再重试
    #[error("分片 #{chunk} 上传失败 (HTTP {status}): {message}")]
    Permanent {
        chunk: usize,
        status: u16,
        message: String,
    },
    /// 响应处理钩子失败，等同于分片错误
    #[error("处理响应失败: {0}")]
    Processing(String),
    /// 预处理钩子失败
    #[error("分片预处理失败: {0}")]
    Preprocess(String),
    /// 文件级初始化任务失败，会中止整个文件
    #[error("初始化上传任务失败: {0}")]
    InitTask(String),
    /// 读取分片数据失败
    #[error("读取分片数据失败: {0}")]
    Read(String),
    /// 配置不合法
    #[error("配置错误: {0}")]
    Config(String),
    /// 文件不存在（已取消或 id 错误）
    #[error("文件不存在: {0}")]
    FileNotFound(u64),
    /// 上传会话已关闭
    #[error("上传会话已关闭")]
    SessionClosed,
}

impl From<std::io::Error> for UploadError {
    fn from(e: std::io::Error) -> Self {
        UploadError::Read(e.to_string())
    }
}

pub type UploadResult<T> = std::result::Result<T, UploadError>;

/// 上传错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadErrorKind {
    /// 网络错误
    Network,
    /// 超时
    Timeout,
    /// 服务器错误 5xx
    ServerError,
    /// 限流
    RateLimited,
    /// 客户端错误 4xx
    ClientError,
    /// 钩子或本地处理失败
    Processing,
    /// 未知错误
    Unknown,
}

impl UploadErrorKind {
    /// 根据 HTTP 状态码分类，0 表示请求没有拿到响应
    pub fn from_status(status: u16) -> Self {
        match status {
            0 => UploadErrorKind::Network,
            408 | 504 => UploadErrorKind::Timeout,
            429 => UploadErrorKind::RateLimited,
            400..=499 => UploadErrorKind::ClientError,
            500..=599 => UploadErrorKind::ServerError,
            _ => UploadErrorKind::Unknown,
        }
    }

    /// 根据错误分类
    pub fn from_error(error: &UploadError) -> Self {
        match error {
            UploadError::Transport(msg) => {
                let msg = msg.to_lowercase();
                if msg.contains("timeout") || msg.contains("timed out") {
                    UploadErrorKind::Timeout
                } else {
                    UploadErrorKind::Network
                }
            }
            UploadError::Permanent { status, .. } => Self::from_status(*status),
            UploadError::Processing(_)
            | UploadError::Preprocess(_)
            | UploadError::InitTask(_)
            | UploadError::Read(_) => UploadErrorKind::Processing,
            _ => UploadErrorKind::Unknown,
        }
    }

    /// 面向用户的错误提示
    pub fn describe(&self, status: u16) -> &'static str {
        match (self, status) {
            (UploadErrorKind::Network, _) => "网络连接错误",
            (UploadErrorKind::Timeout, _) => "上传超时",
            (UploadErrorKind::RateLimited, _) => "请求过于频繁",
            (UploadErrorKind::ServerError, 500) => "服务器内部错误",
            (UploadErrorKind::ServerError, 502) => "网关错误",
            (UploadErrorKind::ServerError, 503) => "服务不可用",
            (UploadErrorKind::ServerError, _) => "服务器错误",
            (UploadErrorKind::ClientError, 400) => "请求参数错误",
            (UploadErrorKind::ClientError, 401) => "未授权访问",
            (UploadErrorKind::ClientError, 403) => "禁止访问",
            (UploadErrorKind::ClientError, 404) => "资源不存在",
            (UploadErrorKind::ClientError, _) => "客户端错误",
            (UploadErrorKind::Processing, _) => "分片处理失败",
            (UploadErrorKind::Unknown, _) => "未知错误",
        }
    }
}
