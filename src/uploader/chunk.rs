// 上传分片
//
// 分片本身只保存原始字段，状态由 `status()` 从字段推导，不单独存储：
//
//   pending → reading → (preprocessing) → (testing) → uploading → success / error
//                                                          └── retry → pending
//
// 所有状态转换都由 machine.rs 中的状态机驱动，这里只提供有明确含义的转换方法。

use crate::config::UploaderConfig;
use crate::uploader::size;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// 分片状态（推导值）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    /// 等待调度
    Pending,
    /// 正在读取分片数据
    Reading,
    /// 预处理 / 检测 / 上传 / 等待重试中
    Uploading,
    /// 上传成功
    Success,
    /// 上传失败（不再重试）
    Error,
}

impl ChunkStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChunkStatus::Success | ChunkStatus::Error)
    }
}

/// 读取状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    NotStarted,
    Reading,
    Done,
}

/// 预处理状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreprocessState {
    NotStarted,
    Running,
    Done,
}

/// 请求类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    /// 分片存在性检测
    Test,
    /// 分片数据上传
    Upload,
}

/// 服务器响应
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkResponse {
    /// HTTP 状态码，0 表示没有拿到响应（网络错误）
    pub status: u16,
    pub body: String,
}

impl ChunkResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// 响应处理钩子的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedResponse {
    /// 钩子判定的业务错误
    pub error: Option<String>,
    /// 钩子返回的结果
    pub body: String,
}

impl ProcessedResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            error: None,
            body: body.into(),
        }
    }

    pub fn failed(error: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            body: body.into(),
        }
    }
}

/// 分片持有的请求
#[derive(Debug)]
struct ChunkRequest {
    id: u64,
    kind: RequestKind,
    cancel: CancellationToken,
    /// None 表示请求仍在进行中
    response: Option<Arc<ChunkResponse>>,
}

/// 根据响应判定的结果
enum Verdict {
    Success,
    Error,
    Stale,
}

/// 上传分片
#[derive(Debug)]
pub struct UploadChunk {
    offset: usize,
    chunk_size: u64,
    start_byte: u64,
    end_byte: u64,
    retries: u32,
    tested: bool,
    init_task_done: bool,
    read_state: ReadState,
    preprocess_state: PreprocessState,
    loaded: u64,
    total: u64,
    pending_retry: bool,
    request: Option<ChunkRequest>,
    processing_response: bool,
    processed: Option<ProcessedResponse>,
    /// 响应处理钩子本身失败
    processing_failed: bool,
    bytes: Option<Bytes>,
    read_at: Option<Instant>,
}

impl UploadChunk {
    pub fn new(offset: usize, chunk_size: u64, file_size: u64, force_chunk_size: bool) -> Self {
        Self {
            offset,
            chunk_size,
            start_byte: offset as u64 * chunk_size,
            end_byte: size::compute_end_byte(offset, chunk_size, file_size, force_chunk_size),
            retries: 0,
            tested: false,
            init_task_done: false,
            read_state: ReadState::NotStarted,
            preprocess_state: PreprocessState::NotStarted,
            loaded: 0,
            total: 0,
            pending_retry: false,
            request: None,
            processing_response: false,
            processed: None,
            processing_failed: false,
            bytes: None,
            read_at: None,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn start_byte(&self) -> u64 {
        self.start_byte
    }

    pub fn end_byte(&self) -> u64 {
        self.end_byte
    }

    /// 分片实际字节数
    pub fn byte_len(&self) -> u64 {
        self.end_byte - self.start_byte
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn is_tested(&self) -> bool {
        self.tested
    }

    pub fn is_init_task_done(&self) -> bool {
        self.init_task_done
    }

    pub fn read_state(&self) -> ReadState {
        self.read_state
    }

    pub fn preprocess_state(&self) -> PreprocessState {
        self.preprocess_state
    }

    pub fn is_pending_retry(&self) -> bool {
        self.pending_retry
    }

    pub fn bytes(&self) -> Option<&Bytes> {
        self.bytes.as_ref()
    }

    pub fn read_at(&self) -> Option<Instant> {
        self.read_at
    }

    pub fn request_id(&self) -> Option<u64> {
        self.request.as_ref().map(|r| r.id)
    }

    pub fn request_kind(&self) -> Option<RequestKind> {
        self.request.as_ref().map(|r| r.kind)
    }

    pub fn response(&self) -> Option<&Arc<ChunkResponse>> {
        self.request.as_ref().and_then(|r| r.response.as_ref())
    }

    pub fn processed(&self) -> Option<&ProcessedResponse> {
        self.processed.as_ref()
    }

    /// 最近一次响应的响应体
    pub fn message(&self) -> &str {
        self.response().map(|r| r.body.as_str()).unwrap_or("")
    }

    /// 当前状态（普通上传语义）
    pub fn status(&self, config: &UploaderConfig) -> ChunkStatus {
        self.status_for(config, false)
    }

    /// 推导分片状态，不修改任何字段
    ///
    /// 已完成但既不成功也不是永久错误的响应视为过期，返回 Pending；
    /// 需要真正丢弃过期请求时调用 `settle()`
    pub fn status_for(&self, config: &UploaderConfig, is_test: bool) -> ChunkStatus {
        if self.read_state == ReadState::Reading {
            return ChunkStatus::Reading;
        }

        if self.pending_retry || self.preprocess_state == PreprocessState::Running {
            return ChunkStatus::Uploading;
        }

        let request = match &self.request {
            Some(request) => request,
            None => return ChunkStatus::Pending,
        };

        let response = match &request.response {
            Some(response) if !self.processing_response => response,
            _ => return ChunkStatus::Uploading,
        };

        if self.processing_failed {
            return ChunkStatus::Error;
        }

        match self.judge(response, config, is_test) {
            Verdict::Stale => ChunkStatus::Pending,
            verdict => {
                if self.processed.as_ref().is_some_and(|p| p.error.is_some()) {
                    return ChunkStatus::Error;
                }
                match verdict {
                    Verdict::Success => ChunkStatus::Success,
                    _ => ChunkStatus::Error,
                }
            }
        }
    }

    /// 推导状态，并丢弃过期的请求（隐式重试）
    pub(crate) fn settle(&mut self, config: &UploaderConfig, is_test: bool) -> ChunkStatus {
        let status = self.status_for(config, is_test);
        if status == ChunkStatus::Pending && self.request.is_some() {
            self.abort();
        }
        status
    }

    fn judge(&self, response: &ChunkResponse, config: &UploaderConfig, is_test: bool) -> Verdict {
        let body = response.body.as_str();
        let api = &config.success_api_statuses;

        let success_status = config.success_statuses.contains(&response.status);
        let has_code = api.code.as_deref().map_or(true, |code| body.contains(code));
        let has_state = api.state.as_deref().map_or(true, |state| body.contains(state));

        if success_status && has_code && has_state {
            return Verdict::Success;
        }

        let permanent = config.permanent_errors.contains(&response.status)
            || (!is_test && self.retries >= config.max_chunk_retries);

        if permanent {
            Verdict::Error
        } else {
            Verdict::Stale
        }
    }

    /// 分片上传进度 (0-1)
    pub fn chunk_progress(&self, config: &UploaderConfig) -> f64 {
        if self.pending_retry {
            return 0.0;
        }

        match self.status(config) {
            ChunkStatus::Success | ChunkStatus::Error => 1.0,
            ChunkStatus::Pending => 0.0,
            _ => {
                if self.total > 0 {
                    self.loaded as f64 / self.total as f64
                } else {
                    0.0
                }
            }
        }
    }

    /// 已上传字节数
    pub fn size_uploaded(&self, config: &UploaderConfig) -> u64 {
        let len = self.byte_len();
        if self.status(config) == ChunkStatus::Success {
            len
        } else {
            (self.chunk_progress(config) * len as f64) as u64
        }
    }

    // =====================================================
    // 状态转换
    // =====================================================

    /// 单分片文件直接上传，跳过检测和初始化
    pub(crate) fn mark_pretested(&mut self) {
        self.tested = true;
        self.init_task_done = true;
    }

    pub(crate) fn mark_tested(&mut self) {
        self.tested = true;
    }

    pub(crate) fn mark_init_task_done(&mut self) {
        self.init_task_done = true;
    }

    pub(crate) fn begin_preprocess(&mut self) {
        self.preprocess_state = PreprocessState::Running;
    }

    pub(crate) fn finish_preprocess(&mut self) {
        self.preprocess_state = PreprocessState::Done;
    }

    pub(crate) fn begin_read(&mut self) {
        self.read_state = ReadState::Reading;
    }

    pub(crate) fn finish_read(&mut self, bytes: Bytes, now: Instant) {
        self.read_state = ReadState::Done;
        self.bytes = Some(bytes);
        self.read_at = Some(now);
    }

    /// 读取失败，回到未读取状态
    pub(crate) fn fail_read(&mut self) {
        self.read_state = ReadState::NotStarted;
    }

    /// 释放分片数据，返回释放的字节数
    ///
    /// 未完成的分片下次发送时会重新读取
    pub(crate) fn release_bytes(&mut self) -> u64 {
        let released = self.bytes.take().map(|b| b.len() as u64).unwrap_or(0);
        self.read_at = None;
        if self.read_state == ReadState::Done {
            self.read_state = ReadState::NotStarted;
        }
        released
    }

    /// 发起新请求，替换旧请求
    pub(crate) fn begin_request(&mut self, id: u64, kind: RequestKind) -> CancellationToken {
        if let Some(old) = self.request.take() {
            old.cancel.cancel();
        }
        let cancel = CancellationToken::new();
        self.request = Some(ChunkRequest {
            id,
            kind,
            cancel: cancel.clone(),
            response: None,
        });
        self.processing_response = false;
        self.processed = None;
        self.processing_failed = false;
        cancel
    }

    /// 记录请求的响应，请求已被替换或中止时返回 false
    pub(crate) fn complete_request(&mut self, id: u64, response: ChunkResponse) -> bool {
        match &mut self.request {
            Some(request) if request.id == id && request.response.is_none() => {
                request.response = Some(Arc::new(response));
                true
            }
            _ => false,
        }
    }

    pub(crate) fn set_processing_response(&mut self, processing: bool) {
        self.processing_response = processing;
    }

    pub(crate) fn set_processed(&mut self, processed: ProcessedResponse) {
        self.processed = Some(processed);
    }

    /// 响应处理钩子失败：无论响应状态码如何，分片都读作 error
    pub(crate) fn fail_processing(&mut self, error: &str) {
        let body = self.message().to_string();
        self.processing_response = false;
        self.processed = Some(ProcessedResponse::failed(error, body));
        self.processing_failed = true;
    }

    /// 服务器确认分片已存在：直接沿用触发对账的响应
    pub(crate) fn adopt_response(&mut self, id: u64, kind: RequestKind, response: Arc<ChunkResponse>) {
        if let Some(old) = self.request.take() {
            if old.id != id {
                old.cancel.cancel();
            }
        }
        self.request = Some(ChunkRequest {
            id,
            kind,
            cancel: CancellationToken::new(),
            response: Some(response),
        });
    }

    /// 丢弃已完成的请求，让分片回到 pending
    pub(crate) fn clear_request(&mut self) {
        self.request = None;
        self.processed = None;
        self.processing_response = false;
        self.processing_failed = false;
    }

    /// 中止分片：取消进行中的请求，清除处理中标记和缓存的响应
    ///
    /// 没有请求时为空操作，返回是否真的中止了请求
    pub(crate) fn abort(&mut self) -> bool {
        self.processing_response = false;
        self.processed = None;
        self.processing_failed = false;
        self.pending_retry = false;
        match self.request.take() {
            Some(request) => {
                request.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn mark_pending_retry(&mut self) {
        self.pending_retry = true;
        self.retries += 1;
    }

    pub(crate) fn update_progress(&mut self, loaded: u64, total: u64) {
        self.loaded = loaded;
        self.total = total;
    }

    /// 发送上传请求前重置进度
    pub(crate) fn reset_for_upload(&mut self) {
        self.loaded = 0;
        self.total = 0;
        self.pending_retry = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> UploaderConfig {
        UploaderConfig {
            max_chunk_retries: 3,
            ..UploaderConfig::default()
        }
    }

    fn completed(chunk: &mut UploadChunk, id: u64, status: u16, body: &str) {
        chunk.begin_request(id, RequestKind::Upload);
        assert!(chunk.complete_request(id, ChunkResponse::new(status, body)));
    }

    #[test]
    fn test_chunk_boundaries() {
        let chunk = UploadChunk::new(2, 5_000_000, 12_000_000, true);
        assert_eq!(chunk.start_byte(), 10_000_000);
        assert_eq!(chunk.end_byte(), 12_000_000);
        assert_eq!(chunk.byte_len(), 2_000_000);
    }

    #[test]
    fn test_status_lifecycle() {
        let config = config();
        let mut chunk = UploadChunk::new(0, 1024, 4096, true);
        assert_eq!(chunk.status(&config), ChunkStatus::Pending);

        chunk.begin_read();
        assert_eq!(chunk.status(&config), ChunkStatus::Reading);
        chunk.finish_read(Bytes::from(vec![0u8; 1024]), Instant::now());
        assert_eq!(chunk.status(&config), ChunkStatus::Pending);

        chunk.begin_request(1, RequestKind::Upload);
        assert_eq!(chunk.status(&config), ChunkStatus::Uploading);

        assert!(chunk.complete_request(1, ChunkResponse::new(200, "ok")));
        chunk.set_processing_response(true);
        assert_eq!(chunk.status(&config), ChunkStatus::Uploading);

        chunk.set_processing_response(false);
        assert_eq!(chunk.status(&config), ChunkStatus::Success);
        assert_eq!(chunk.chunk_progress(&config), 1.0);
        assert_eq!(chunk.size_uploaded(&config), 1024);
    }

    #[test]
    fn test_preprocess_counts_as_uploading() {
        let config = config();
        let mut chunk = UploadChunk::new(0, 1024, 4096, true);
        chunk.begin_preprocess();
        assert_eq!(chunk.status(&config), ChunkStatus::Uploading);
        chunk.finish_preprocess();
        assert_eq!(chunk.status(&config), ChunkStatus::Pending);
    }

    #[test]
    fn test_success_api_markers() {
        let mut config = config();
        config.success_api_statuses.code = Some("\"code\":0".to_string());
        config.success_api_statuses.state = Some("done".to_string());

        let mut chunk = UploadChunk::new(0, 1024, 4096, true);
        completed(&mut chunk, 1, 200, r#"{"code":0,"state":"done"}"#);
        assert_eq!(chunk.status(&config), ChunkStatus::Success);

        // 缺少业务成功标记：非永久错误，视为过期，等待重试
        completed(&mut chunk, 2, 200, r#"{"code":0,"state":"pending"}"#);
        assert_eq!(chunk.status(&config), ChunkStatus::Pending);
    }

    #[test]
    fn test_permanent_error_status() {
        let config = config();
        let mut chunk = UploadChunk::new(0, 1024, 4096, true);
        completed(&mut chunk, 1, 415, "unsupported");
        assert_eq!(chunk.status(&config), ChunkStatus::Error);
        assert_eq!(chunk.message(), "unsupported");
    }

    #[test]
    fn test_retry_budget_exhausted() {
        let config = config();
        let mut chunk = UploadChunk::new(0, 1024, 4096, true);

        for retry in 0..3 {
            completed(&mut chunk, retry + 1, 503, "busy");
            assert_eq!(chunk.settle(&config, false), ChunkStatus::Pending);
            assert!(chunk.request_id().is_none());
            chunk.mark_pending_retry();
        }
        assert_eq!(chunk.retries(), 3);

        completed(&mut chunk, 10, 503, "busy");
        assert_eq!(chunk.status(&config), ChunkStatus::Error);
        // 检测请求不受重试次数限制
        assert_eq!(chunk.status_for(&config, true), ChunkStatus::Pending);
    }

    #[test]
    fn test_processed_error_forces_error() {
        let config = config();
        let mut chunk = UploadChunk::new(0, 1024, 4096, true);
        completed(&mut chunk, 1, 200, "ok");
        chunk.set_processed(ProcessedResponse::failed("bad md5", "ok"));
        assert_eq!(chunk.status(&config), ChunkStatus::Error);

        // 过期响应不受处理结果影响
        completed(&mut chunk, 2, 503, "busy");
        chunk.set_processed(ProcessedResponse::failed("busy", "busy"));
        assert_eq!(chunk.settle(&config, false), ChunkStatus::Pending);
        assert!(chunk.processed().is_none());
    }

    #[test]
    fn test_processing_failure_overrides_status() {
        let config = config();
        let mut chunk = UploadChunk::new(0, 1024, 4096, true);
        completed(&mut chunk, 1, 503, "busy");
        chunk.set_processing_response(true);
        assert_eq!(chunk.status(&config), ChunkStatus::Uploading);

        chunk.fail_processing("hook crashed");
        assert_eq!(chunk.settle(&config, false), ChunkStatus::Error);
        assert_eq!(chunk.processed().and_then(|p| p.error.as_deref()), Some("hook crashed"));

        // 新请求清除失败标记
        completed(&mut chunk, 2, 200, "ok");
        assert_eq!(chunk.status(&config), ChunkStatus::Success);
    }

    #[test]
    fn test_stale_completion_is_ignored() {
        let mut chunk = UploadChunk::new(0, 1024, 4096, true);
        let first = chunk.begin_request(1, RequestKind::Upload);
        chunk.begin_request(2, RequestKind::Upload);

        assert!(first.is_cancelled());
        assert!(!chunk.complete_request(1, ChunkResponse::new(200, "late")));
        assert!(chunk.complete_request(2, ChunkResponse::new(200, "ok")));
        assert!(!chunk.complete_request(2, ChunkResponse::new(200, "twice")));
    }

    #[test]
    fn test_abort() {
        let config = config();
        let mut chunk = UploadChunk::new(0, 1024, 4096, true);
        assert!(!chunk.abort());

        let token = chunk.begin_request(1, RequestKind::Upload);
        chunk.mark_pending_retry();
        assert!(chunk.abort());
        assert!(token.is_cancelled());
        assert!(!chunk.is_pending_retry());
        assert_eq!(chunk.status(&config), ChunkStatus::Pending);
    }

    #[test]
    fn test_progress() {
        let config = config();
        let mut chunk = UploadChunk::new(0, 1000, 4000, true);
        chunk.begin_request(1, RequestKind::Upload);
        assert_eq!(chunk.chunk_progress(&config), 0.0);

        chunk.update_progress(250, 1000);
        assert_eq!(chunk.chunk_progress(&config), 0.25);
        assert_eq!(chunk.size_uploaded(&config), 250);

        chunk.mark_pending_retry();
        assert_eq!(chunk.chunk_progress(&config), 0.0);
    }

    #[test]
    fn test_release_bytes_forces_reread() {
        let mut chunk = UploadChunk::new(0, 1024, 4096, true);
        chunk.begin_read();
        chunk.finish_read(Bytes::from(vec![1u8; 1024]), Instant::now());

        assert_eq!(chunk.release_bytes(), 1024);
        assert!(chunk.bytes().is_none());
        assert_eq!(chunk.read_state(), ReadState::NotStarted);
        assert_eq!(chunk.release_bytes(), 0);
    }
}
