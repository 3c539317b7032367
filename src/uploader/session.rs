// 上传会话
//
// 会话核心是一个 actor：所有文件 / 分片状态只在 actor 任务内修改。
// 读取分片、钩子、网络请求、重试延迟、延迟进度等挂起点都在独立任务中执行，
// 完成后把结果投递回邮箱。
//
// 每个请求带会话内唯一的请求 ID，每条完成消息带文件的分片序列版本（epoch），
// 已中止的请求或已丢弃的分片序列的完成消息会被直接丢弃。

use crate::config::UploaderConfig;
use crate::error::{UploadError, UploadResult};
use crate::events::UploadEvent;
use crate::uploader::chunk::{ChunkResponse, ProcessedResponse};
use crate::uploader::file::{FileSnapshot, UploadFile};
use crate::uploader::hooks::UploadHooks;
use crate::uploader::memory::MemoryTracker;
use crate::uploader::source::FileDescriptor;
use crate::uploader::transport::Transport;
use bytes::Bytes;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// 分片地址：文件 + 分片序列版本 + 分片序号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChunkAddr {
    pub file_id: u64,
    pub epoch: u64,
    pub offset: usize,
}

/// 挂起任务的完成消息
#[derive(Debug)]
pub(crate) enum ChunkMessage {
    PreprocessDone {
        addr: ChunkAddr,
        result: Result<(), String>,
    },
    ReadDone {
        addr: ChunkAddr,
        result: UploadResult<Bytes>,
    },
    Progress {
        addr: ChunkAddr,
        request_id: u64,
        loaded: u64,
        total: u64,
    },
    RequestDone {
        addr: ChunkAddr,
        request_id: u64,
        response: ChunkResponse,
    },
    ResponseProcessed {
        addr: ChunkAddr,
        request_id: u64,
        result: Result<ProcessedResponse, String>,
    },
    InitTaskDone {
        addr: ChunkAddr,
        request_id: u64,
        result: Result<(), String>,
    },
    RetryDue {
        addr: ChunkAddr,
        retries: u32,
    },
}

type Reply<T> = oneshot::Sender<UploadResult<T>>;

/// 会话邮箱消息
#[derive(Debug)]
pub(crate) enum SessionMessage {
    AddFiles {
        files: Vec<FileDescriptor>,
        reply: Reply<Vec<u64>>,
    },
    Upload {
        file_id: Option<u64>,
    },
    Pause {
        file_id: u64,
        reply: Reply<()>,
    },
    Resume {
        file_id: u64,
        reply: Reply<()>,
    },
    Retry {
        file_id: u64,
        reply: Reply<()>,
    },
    Cancel {
        file_id: u64,
        reply: Reply<()>,
    },
    SetSimultaneousUploads {
        limit: usize,
        reply: Reply<()>,
    },
    Snapshot {
        file_id: u64,
        reply: Reply<FileSnapshot>,
    },
    SnapshotAll {
        reply: Reply<Vec<FileSnapshot>>,
    },
    MemoryUsage {
        reply: Reply<u64>,
    },
    ProgressDue {
        file_id: u64,
        seq: u64,
    },
    Chunk(ChunkMessage),
    Shutdown,
}

/// 会话核心（actor 状态）
pub(crate) struct SessionCore {
    pub(super) config: UploaderConfig,
    pub(super) hooks: UploadHooks,
    pub(super) transport: Arc<dyn Transport>,
    pub(super) files: Vec<UploadFile>,
    pub(super) memory: MemoryTracker,
    events: mpsc::UnboundedSender<UploadEvent>,
    /// 弱引用，所有句柄释放后邮箱关闭，actor 退出
    mailbox: mpsc::WeakUnboundedSender<SessionMessage>,
    next_file_id: u64,
    next_request_id: u64,
}

impl SessionCore {
    pub(super) fn new(
        config: UploaderConfig,
        hooks: UploadHooks,
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedSender<UploadEvent>,
        mailbox: mpsc::WeakUnboundedSender<SessionMessage>,
    ) -> Self {
        let memory = MemoryTracker::new(config.max_memory_usage, config.memory_max_age());
        Self {
            config,
            hooks,
            transport,
            files: Vec::new(),
            memory,
            events,
            mailbox,
            next_file_id: 0,
            next_request_id: 0,
        }
    }

    pub(super) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionMessage>) {
        info!(
            "上传会话已启动: 分片大小={}, 并发分片数={}",
            self.config.chunk_size, self.config.simultaneous_uploads
        );

        while let Some(message) = rx.recv().await {
            if !self.handle(message) {
                break;
            }
        }

        for file in self.files.iter_mut() {
            let released = file.cancel(&self.config);
            self.memory.release(released);
        }
        info!("上传会话已结束");
    }

    /// 处理一条消息，返回 false 时 actor 退出
    fn handle(&mut self, message: SessionMessage) -> bool {
        match message {
            SessionMessage::AddFiles { files, reply } => {
                let _ = reply.send(Ok(self.add_files(files)));
            }
            SessionMessage::Upload { file_id } => match file_id {
                Some(id) => match self.file_index(id) {
                    Some(fi) => self.upload_file(fi),
                    None => warn!("上传失败: 文件 {} 不存在", id),
                },
                None => self.upload_all(),
            },
            SessionMessage::Pause { file_id, reply } => {
                let _ = reply.send(self.pause(file_id));
            }
            SessionMessage::Resume { file_id, reply } => {
                let _ = reply.send(self.resume(file_id));
            }
            SessionMessage::Retry { file_id, reply } => {
                let _ = reply.send(self.retry(file_id));
            }
            SessionMessage::Cancel { file_id, reply } => {
                let _ = reply.send(self.cancel(file_id));
            }
            SessionMessage::SetSimultaneousUploads { limit, reply } => {
                let _ = reply.send(self.set_simultaneous_uploads(limit));
            }
            SessionMessage::Snapshot { file_id, reply } => {
                let result = match self.file_index(file_id) {
                    Some(fi) => Ok(self.files[fi].snapshot(&self.config)),
                    None => Err(UploadError::FileNotFound(file_id)),
                };
                let _ = reply.send(result);
            }
            SessionMessage::SnapshotAll { reply } => {
                let config = &self.config;
                let snapshots = self.files.iter_mut().map(|f| f.snapshot(config)).collect();
                let _ = reply.send(Ok(snapshots));
            }
            SessionMessage::MemoryUsage { reply } => {
                let _ = reply.send(Ok(self.memory.usage()));
            }
            SessionMessage::ProgressDue { file_id, seq } => self.on_progress_due(file_id, seq),
            SessionMessage::Chunk(message) => self.on_chunk_message(message),
            SessionMessage::Shutdown => return false,
        }
        true
    }

    // =====================================================
    // 基础设施
    // =====================================================

    pub(super) fn emit(&self, event: UploadEvent) {
        // 接收端已关闭时丢弃事件
        let _ = self.events.send(event);
    }

    pub(super) fn next_request_id(&mut self) -> u64 {
        self.next_request_id += 1;
        self.next_request_id
    }

    pub(super) fn file_index(&self, file_id: u64) -> Option<usize> {
        self.files.iter().position(|f| f.id() == file_id)
    }

    /// 定位完成消息对应的文件，分片序列已更换时返回 None
    pub(super) fn locate(&self, addr: &ChunkAddr) -> Option<usize> {
        let fi = self.file_index(addr.file_id)?;
        let file = &self.files[fi];
        if file.epoch() != addr.epoch || addr.offset >= file.chunks.len() {
            debug!(
                "丢弃过期消息: 文件 {} 分片 #{} (epoch {} != {})",
                addr.file_id,
                addr.offset,
                addr.epoch,
                file.epoch()
            );
            return None;
        }
        Some(fi)
    }

    pub(super) fn mailbox(&self) -> Option<mpsc::UnboundedSender<SessionMessage>> {
        self.mailbox.upgrade()
    }

    /// 在独立任务中执行挂起操作，结果投递回邮箱
    pub(super) fn spawn_task<F>(&self, task: F)
    where
        F: Future<Output = Option<SessionMessage>> + Send + 'static,
    {
        let Some(tx) = self.mailbox() else {
            debug!("会话正在关闭，忽略挂起任务");
            return;
        };
        tokio::spawn(async move {
            if let Some(message) = task.await {
                let _ = tx.send(message);
            }
        });
    }

    /// 执行调用方提供的异步代码（钩子、数据源读取）
    ///
    /// 任务 panic 时由 `on_panic` 构造失败消息，分片不会卡在进行中
    pub(super) fn spawn_hook<F, P>(&self, task: F, on_panic: P)
    where
        F: Future<Output = SessionMessage> + Send + 'static,
        P: FnOnce(String) -> SessionMessage + Send + 'static,
    {
        let Some(tx) = self.mailbox() else {
            debug!("会话正在关闭，忽略挂起任务");
            return;
        };
        tokio::spawn(async move {
            let message = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(message) => message,
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    error!("钩子任务 panic: {}", reason);
                    on_panic(reason)
                }
            };
            let _ = tx.send(message);
        });
    }

    // =====================================================
    // 文件命令
    // =====================================================

    fn add_files(&mut self, descriptors: Vec<FileDescriptor>) -> Vec<u64> {
        let mut ids = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            if descriptor.is_directory_placeholder() {
                debug!("忽略目录占位条目: {}", descriptor.name);
                continue;
            }

            self.next_file_id += 1;
            let file = UploadFile::new(self.next_file_id, descriptor, &self.config);
            info!(
                "添加上传文件: id={}, name={}, size={}, chunks={}",
                file.id(),
                file.name(),
                file.size(),
                file.chunks().len()
            );

            self.emit(UploadEvent::FileAdded {
                file_id: file.id(),
                identifier: file.identifier().to_string(),
                name: file.name().to_string(),
                relative_path: file.relative_path().to_string(),
                total_size: file.size(),
                total_chunks: file.chunks().len(),
                paused: file.is_paused(),
            });
            ids.push(file.id());
            self.files.push(file);
        }
        ids
    }

    fn require(&self, file_id: u64) -> UploadResult<usize> {
        self.file_index(file_id)
            .ok_or(UploadError::FileNotFound(file_id))
    }

    fn pause(&mut self, file_id: u64) -> UploadResult<()> {
        let fi = self.require(file_id)?;
        let file = &mut self.files[fi];
        file.paused = true;
        let aborted = file.abort(false, &self.config);
        info!("暂停上传: 文件 {}, 中止 {} 个分片", file_id, aborted);
        Ok(())
    }

    fn resume(&mut self, file_id: u64) -> UploadResult<()> {
        let fi = self.require(file_id)?;
        let file = &mut self.files[fi];
        file.paused = false;
        file.aborted = false;
        info!("恢复上传: 文件 {}", file_id);
        self.upload_file(fi);
        Ok(())
    }

    fn retry(&mut self, file_id: u64) -> UploadResult<()> {
        let fi = self.require(file_id)?;
        let file = &mut self.files[fi];
        if file.error {
            let released = file.reset_for_retry();
            self.memory.release(released);
            info!("重试上传: 文件 {} 已重新切分", file_id);
        }
        self.upload_file(fi);
        Ok(())
    }

    fn cancel(&mut self, file_id: u64) -> UploadResult<()> {
        let fi = self.require(file_id)?;
        let mut file = self.files.remove(fi);
        let released = file.cancel(&self.config);
        self.memory.release(released);
        info!("取消上传: 文件 {} ({})", file_id, file.name());
        self.emit(UploadEvent::FileRemoved { file_id });
        Ok(())
    }

    fn set_simultaneous_uploads(&mut self, limit: usize) -> UploadResult<()> {
        if limit == 0 {
            return Err(UploadError::Config(
                "simultaneous_uploads 必须大于 0".to_string(),
            ));
        }

        if limit != self.config.simultaneous_uploads {
            info!(
                "动态调整并发数: {} -> {}",
                self.config.simultaneous_uploads, limit
            );
            self.config.simultaneous_uploads = limit;
            self.reschedule();
        }
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "未知 panic".to_string()
    }
}

/// 上传会话句柄
///
/// 可以克隆；所有句柄释放后会话结束
#[derive(Debug, Clone)]
pub struct Uploader {
    tx: mpsc::UnboundedSender<SessionMessage>,
}

impl Uploader {
    /// 启动上传会话，返回句柄和事件接收端
    ///
    /// 必须在 tokio 运行时中调用
    pub fn start(
        config: UploaderConfig,
        hooks: UploadHooks,
        transport: Arc<dyn Transport>,
    ) -> UploadResult<(Self, mpsc::UnboundedReceiver<UploadEvent>)> {
        config.validate()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let session_id = Uuid::new_v4();
        let core = SessionCore::new(config, hooks, transport, event_tx, tx.downgrade());
        tokio::spawn(
            core.run(rx)
                .instrument(info_span!("upload_session", id = %session_id)),
        );

        Ok((Self { tx }, event_rx))
    }

    fn post(&self, message: SessionMessage) -> UploadResult<()> {
        self.tx
            .send(message)
            .map_err(|_| UploadError::SessionClosed)
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> SessionMessage) -> UploadResult<T> {
        let (reply, rx) = oneshot::channel();
        self.post(build(reply))?;
        rx.await.map_err(|_| UploadError::SessionClosed)?
    }

    /// 添加文件，返回新文件的 ID（目录占位条目会被忽略）
    pub async fn add_files(&self, files: Vec<FileDescriptor>) -> UploadResult<Vec<u64>> {
        self.request(|reply| SessionMessage::AddFiles { files, reply })
            .await
    }

    pub async fn add_file(&self, file: FileDescriptor) -> UploadResult<Option<u64>> {
        Ok(self.add_files(vec![file]).await?.into_iter().next())
    }

    /// 开始上传单个文件
    pub fn upload(&self, file_id: u64) -> UploadResult<()> {
        self.post(SessionMessage::Upload {
            file_id: Some(file_id),
        })
    }

    /// 开始上传所有文件
    pub fn upload_all(&self) -> UploadResult<()> {
        self.post(SessionMessage::Upload { file_id: None })
    }

    pub async fn pause(&self, file_id: u64) -> UploadResult<()> {
        self.request(|reply| SessionMessage::Pause { file_id, reply })
            .await
    }

    pub async fn resume(&self, file_id: u64) -> UploadResult<()> {
        self.request(|reply| SessionMessage::Resume { file_id, reply })
            .await
    }

    /// 出错的文件重新切分后上传，其它文件直接继续上传
    pub async fn retry(&self, file_id: u64) -> UploadResult<()> {
        self.request(|reply| SessionMessage::Retry { file_id, reply })
            .await
    }

    pub async fn cancel(&self, file_id: u64) -> UploadResult<()> {
        self.request(|reply| SessionMessage::Cancel { file_id, reply })
            .await
    }

    /// 运行时调整每个文件的并发分片数
    pub async fn set_simultaneous_uploads(&self, limit: usize) -> UploadResult<()> {
        self.request(|reply| SessionMessage::SetSimultaneousUploads { limit, reply })
            .await
    }

    pub async fn file_snapshot(&self, file_id: u64) -> UploadResult<FileSnapshot> {
        self.request(|reply| SessionMessage::Snapshot { file_id, reply })
            .await
    }

    pub async fn snapshots(&self) -> UploadResult<Vec<FileSnapshot>> {
        self.request(|reply| SessionMessage::SnapshotAll { reply })
            .await
    }

    /// 当前缓存的分片数据字节数
    pub async fn memory_usage(&self) -> UploadResult<u64> {
        self.request(|reply| SessionMessage::MemoryUsage { reply })
            .await
    }

    /// 结束会话，中止所有进行中的请求
    pub fn shutdown(&self) {
        let _ = self.tx.send(SessionMessage::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let literal: Box<dyn Any + Send> = Box::new("hook exploded");
        assert_eq!(panic_message(literal.as_ref()), "hook exploded");

        let formatted: Box<dyn Any + Send> = Box::new(format!("chunk #{}", 3));
        assert_eq!(panic_message(formatted.as_ref()), "chunk #3");

        let other: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(other.as_ref()), "未知 panic");
    }
}
