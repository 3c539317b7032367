// X Uploader
// 可断点续传的分片文件上传客户端核心库

// 配置管理模块
pub mod config;

// 错误定义
pub mod error;

// 上传事件模块
pub mod events;

// 日志系统
pub mod logging;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use config::{AppConfig, HttpMethod, LogConfig, SuccessApiStatuses, UploaderConfig};
pub use error::{UploadError, UploadErrorKind, UploadResult};
pub use events::{ProgressThrottler, UploadEvent};
pub use uploader::{
    ChunkContext, ChunkPreprocessor, ChunkStatus, FileContext, FileDescriptor, FileSnapshot,
    FileSource, FolderScanner, HttpTransport, InitTask, ProcessedResponse, ResponseProcessor,
    ScanOptions, Transport, TransportRequest, UploadHooks, Uploader,
};
