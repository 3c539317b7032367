// 上传模块
//
// - 文件切分为分片，按文件并发上传
// - 分片支持预处理、检测（服务器已有则跳过）、重试
// - 断点续传：根据首个响应对账已上传的分片
// - 所有状态由会话 actor 串行修改，网络和 IO 在独立任务中执行

pub mod chunk;
pub mod file;
pub mod folder;
pub mod hooks;
mod machine;
pub mod memory;
mod resume;
mod scheduler;
pub mod session;
pub mod size;
pub mod source;
pub mod transport;

pub use chunk::{ChunkResponse, ChunkStatus, ProcessedResponse, RequestKind, UploadChunk};
pub use file::{generate_identifier, ChunkSnapshot, FileSnapshot, UploadFile};
pub use folder::{to_descriptors, FolderScanner, ScanOptions, ScannedFile};
pub use hooks::{
    ChunkContext, ChunkPreprocessor, FileContext, InitTask, Params, ResponseProcessor, UploadHooks,
};
pub use memory::MemoryTracker;
pub use session::Uploader;
pub use size::{format_size, optimal_chunk_size, optimal_concurrency};
pub use source::{FileDescriptor, FileSource, LocalFileSource, MemoryFileSource};
pub use transport::{ChunkBody, HttpTransport, ProgressFn, Transport, TransportRequest};
