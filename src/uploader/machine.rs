// 分片状态机
//
// send() 的推进顺序：
//   预处理（配置了钩子且未执行） → 读取分片数据 → 检测（test_chunks 且未检测） → 上传
//
// 响应处理：
//   检测响应: error → 文件失败; success → 初始化任务（一次） → 成功事件; 其它 → 标记已检测并上传
//   上传响应: 响应处理钩子 → settle() → success / error / 重试

use super::session::{ChunkAddr, ChunkMessage, SessionCore, SessionMessage};
use crate::error::{UploadError, UploadErrorKind};
use crate::events::UploadEvent;
use crate::uploader::chunk::{
    ChunkResponse, ChunkStatus, PreprocessState, ProcessedResponse, ReadState, RequestKind,
};
use crate::uploader::hooks::Params;
use crate::uploader::transport::{ChunkBody, ProgressFn, TransportRequest};
use bytes::Bytes;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

impl SessionCore {
    fn chunk_addr(&self, fi: usize, offset: usize) -> ChunkAddr {
        let file = &self.files[fi];
        ChunkAddr {
            file_id: file.id(),
            epoch: file.epoch(),
            offset,
        }
    }

    /// 推进分片：预处理 → 读取 → 检测 → 上传
    pub(super) fn send_chunk(&mut self, fi: usize, offset: usize) {
        let addr = self.chunk_addr(fi, offset);
        let has_preprocess = self.hooks.preprocess.is_some();
        let test_chunks = self.config.test_chunks;
        let chunk = &mut self.files[fi].chunks[offset];

        // 对账期间已确认的分片
        if chunk.status(&self.config) == ChunkStatus::Success {
            return;
        }

        if has_preprocess {
            match chunk.preprocess_state() {
                PreprocessState::NotStarted => {
                    chunk.begin_preprocess();
                    self.spawn_preprocess(fi, addr);
                    return;
                }
                PreprocessState::Running => return,
                PreprocessState::Done => {}
            }
        }

        match chunk.read_state() {
            ReadState::NotStarted => {
                chunk.begin_read();
                self.spawn_read(fi, addr);
                return;
            }
            ReadState::Reading => return,
            ReadState::Done => {}
        }

        if test_chunks && !chunk.is_tested() {
            self.test_chunk(fi, offset);
        } else {
            self.upload_chunk(fi, offset);
        }
    }

    fn spawn_preprocess(&self, fi: usize, addr: ChunkAddr) {
        let file = &self.files[fi];
        let (Some(preprocess), Some(chunk_ctx)) = (
            self.hooks.preprocess.clone(),
            file.chunk_context(addr.offset),
        ) else {
            return;
        };
        let file_ctx = file.context();

        debug!("分片预处理: 文件 {} 分片 #{}", addr.file_id, addr.offset);
        self.spawn_hook(
            async move {
                let result = preprocess
                    .preprocess(&file_ctx, &chunk_ctx)
                    .await
                    .map_err(|e| format!("{:#}", e));
                SessionMessage::Chunk(ChunkMessage::PreprocessDone { addr, result })
            },
            move |reason| {
                SessionMessage::Chunk(ChunkMessage::PreprocessDone {
                    addr,
                    result: Err(format!("预处理钩子 panic: {}", reason)),
                })
            },
        );
    }

    fn spawn_read(&self, fi: usize, addr: ChunkAddr) {
        let file = &self.files[fi];
        let chunk = &file.chunks[addr.offset];
        let range = chunk.start_byte()..chunk.end_byte();

        let Some(source) = file.source().cloned() else {
            warn!("文件 {} 的数据源已释放，跳过读取", addr.file_id);
            return;
        };

        self.spawn_hook(
            async move {
                let result = source.read_range(range).await;
                SessionMessage::Chunk(ChunkMessage::ReadDone { addr, result })
            },
            move |reason| {
                SessionMessage::Chunk(ChunkMessage::ReadDone {
                    addr,
                    result: Err(UploadError::Read(format!("读取分片 panic: {}", reason))),
                })
            },
        );
    }

    /// 内置请求参数
    fn builtin_params(&self, fi: usize, offset: usize) -> Params {
        let file = &self.files[fi];
        let chunk = &file.chunks[offset];

        let mut params = Params::new();
        params.insert("chunkNumber".to_string(), (offset + 1).to_string());
        params.insert("chunkSize".to_string(), file.chunk_size().to_string());
        params.insert("currentChunkSize".to_string(), chunk.byte_len().to_string());
        params.insert("totalSize".to_string(), file.size().to_string());
        params.insert("identifier".to_string(), file.identifier().to_string());
        params.insert("filename".to_string(), file.name().to_string());
        params.insert("relativePath".to_string(), file.relative_path().to_string());
        params.insert("totalChunks".to_string(), file.chunks.len().to_string());
        params
    }

    fn build_request(&self, fi: usize, offset: usize, kind: RequestKind) -> Option<TransportRequest> {
        let file = &self.files[fi];
        let file_ctx = file.context();
        let chunk_ctx = file.chunk_context(offset)?;
        let is_test = kind == RequestKind::Test;

        let params = self.hooks.build_params(
            self.builtin_params(fi, offset),
            &self.config.query,
            &file_ctx,
            &chunk_ctx,
            is_test,
        );
        let target = self
            .hooks
            .resolve_target(&self.config.target, &file_ctx, &chunk_ctx, is_test);

        let (method, body) = match kind {
            RequestKind::Test => (self.config.test_method, None),
            RequestKind::Upload => (
                self.config.upload_method,
                Some(ChunkBody {
                    field: self.config.file_parameter_name.clone(),
                    file_name: file.name().to_string(),
                    bytes: file.chunks[offset].bytes().cloned().unwrap_or_default(),
                }),
            ),
        };

        Some(TransportRequest {
            kind,
            method,
            target,
            headers: self.config.headers.clone(),
            params,
            body,
        })
    }

    /// 发送检测请求
    fn test_chunk(&mut self, fi: usize, offset: usize) {
        let Some(request) = self.build_request(fi, offset, RequestKind::Test) else {
            return;
        };
        let request_id = self.next_request_id();
        let token = self.files[fi].chunks[offset].begin_request(request_id, RequestKind::Test);

        debug!(
            "检测分片: 文件 {} 分片 #{} (request {})",
            self.files[fi].id(),
            offset,
            request_id
        );
        let addr = self.chunk_addr(fi, offset);
        self.spawn_request(addr, request_id, token, request);
    }

    /// 发送上传请求
    fn upload_chunk(&mut self, fi: usize, offset: usize) {
        self.files[fi].chunks[offset].reset_for_upload();
        let Some(request) = self.build_request(fi, offset, RequestKind::Upload) else {
            return;
        };
        let request_id = self.next_request_id();
        let token = self.files[fi].chunks[offset].begin_request(request_id, RequestKind::Upload);

        debug!(
            "上传分片: 文件 {} 分片 #{} (request {}, {} bytes)",
            self.files[fi].id(),
            offset,
            request_id,
            self.files[fi].chunks[offset].byte_len()
        );
        let addr = self.chunk_addr(fi, offset);
        self.spawn_request(addr, request_id, token, request);
    }

    /// 发送请求；取消令牌触发时直接丢弃请求 future，不投递任何消息
    fn spawn_request(
        &self,
        addr: ChunkAddr,
        request_id: u64,
        token: CancellationToken,
        request: TransportRequest,
    ) {
        let Some(tx) = self.mailbox() else {
            return;
        };
        let transport = self.transport.clone();

        let progress_tx = tx.clone();
        let progress: ProgressFn = Arc::new(move |loaded, total| {
            let _ = progress_tx.send(SessionMessage::Chunk(ChunkMessage::Progress {
                addr,
                request_id,
                loaded,
                total,
            }));
        });

        tokio::spawn(async move {
            let response = tokio::select! {
                _ = token.cancelled() => {
                    debug!("请求已中止: 文件 {} 分片 #{} (request {})", addr.file_id, addr.offset, request_id);
                    return;
                }
                result = transport.send(request, progress) => match result {
                    Ok(response) => response,
                    Err(e) => {
                        warn!("分片请求失败: 文件 {} 分片 #{}: {}", addr.file_id, addr.offset, e);
                        // 拿不到响应按状态码 0 处理，交给重试策略
                        ChunkResponse::new(0, e.to_string())
                    }
                },
            };
            let _ = tx.send(SessionMessage::Chunk(ChunkMessage::RequestDone {
                addr,
                request_id,
                response,
            }));
        });
    }

    // =====================================================
    // 完成消息
    // =====================================================

    pub(super) fn on_chunk_message(&mut self, message: ChunkMessage) {
        match message {
            ChunkMessage::PreprocessDone { addr, result } => self.on_preprocess_done(addr, result),
            ChunkMessage::ReadDone { addr, result } => self.on_read_done(addr, result),
            ChunkMessage::Progress {
                addr,
                request_id,
                loaded,
                total,
            } => self.on_progress(addr, request_id, loaded, total),
            ChunkMessage::RequestDone {
                addr,
                request_id,
                response,
            } => self.on_request_done(addr, request_id, response),
            ChunkMessage::ResponseProcessed {
                addr,
                request_id,
                result,
            } => {
                if let Some(fi) = self.locate(&addr) {
                    self.on_response_processed(fi, addr.offset, request_id, result);
                }
            }
            ChunkMessage::InitTaskDone {
                addr,
                request_id,
                result,
            } => self.on_init_task_done(addr, request_id, result),
            ChunkMessage::RetryDue { addr, retries } => self.on_retry_due(addr, retries),
        }
    }

    /// 文件已暂停或失败时，挂起任务完成后不再继续推进
    fn can_continue(&self, fi: usize) -> bool {
        let file = &self.files[fi];
        !file.paused && !file.error
    }

    fn on_preprocess_done(&mut self, addr: ChunkAddr, result: Result<(), String>) {
        let Some(fi) = self.locate(&addr) else {
            return;
        };
        self.files[fi].chunks[addr.offset].finish_preprocess();

        match result {
            Ok(()) => {
                if self.can_continue(fi) {
                    self.send_chunk(fi, addr.offset);
                }
            }
            Err(e) => self.fail_chunk(fi, addr.offset, UploadError::Preprocess(e)),
        }
    }

    fn on_read_done(&mut self, addr: ChunkAddr, result: Result<Bytes, UploadError>) {
        let Some(fi) = self.locate(&addr) else {
            return;
        };
        let chunk = &mut self.files[fi].chunks[addr.offset];
        if chunk.read_state() != ReadState::Reading {
            return;
        }

        match result {
            Ok(bytes) => {
                let len = bytes.len() as u64;
                chunk.finish_read(bytes, Instant::now());
                self.memory.add(len);
                self.enforce_memory_budget();

                if self.can_continue(fi) {
                    self.send_chunk(fi, addr.offset);
                }
            }
            Err(e) => {
                chunk.fail_read();
                self.fail_chunk(fi, addr.offset, e);
            }
        }
    }

    fn on_progress(&mut self, addr: ChunkAddr, request_id: u64, loaded: u64, total: u64) {
        let Some(fi) = self.locate(&addr) else {
            return;
        };
        let file = &mut self.files[fi];
        let chunk = &mut file.chunks[addr.offset];
        if chunk.request_id() != Some(request_id) || chunk.response().is_some() {
            return;
        }
        chunk.update_progress(loaded, total);

        if file.throttler.should_emit(Instant::now()) {
            self.trigger_progress(fi);
        }
    }

    fn on_request_done(&mut self, addr: ChunkAddr, request_id: u64, response: ChunkResponse) {
        let Some(fi) = self.locate(&addr) else {
            return;
        };
        let chunk = &mut self.files[fi].chunks[addr.offset];
        if !chunk.complete_request(request_id, response) {
            debug!(
                "丢弃已中止请求的响应: 文件 {} 分片 #{} (request {})",
                addr.file_id, addr.offset, request_id
            );
            return;
        }

        match chunk.request_kind() {
            Some(RequestKind::Test) => self.on_test_response(fi, addr.offset, request_id),
            _ => self.on_upload_response(fi, addr.offset, request_id),
        }
    }

    fn on_test_response(&mut self, fi: usize, offset: usize, request_id: u64) {
        let has_init_task = self.hooks.init_task.is_some();
        let status = self.files[fi].chunks[offset].settle(&self.config, true);

        match status {
            ChunkStatus::Error => {
                let error = self.permanent_error(fi, offset);
                self.fail_chunk(fi, offset, error);
            }
            ChunkStatus::Success => {
                let chunk = &mut self.files[fi].chunks[offset];
                if has_init_task && !chunk.is_init_task_done() {
                    chunk.set_processing_response(true);
                    self.spawn_init_task(fi, offset, request_id);
                } else {
                    self.on_test_success(fi, offset);
                }
            }
            _ => {
                if self.can_continue(fi) {
                    self.files[fi].chunks[offset].mark_tested();
                    self.send_chunk(fi, offset);
                }
            }
        }
    }

    fn spawn_init_task(&self, fi: usize, offset: usize, request_id: u64) {
        let Some(init_task) = self.hooks.init_task.clone() else {
            return;
        };
        let file = &self.files[fi];
        let file_ctx = file.context();
        let message = file.chunks[offset].message().to_string();
        let addr = self.chunk_addr(fi, offset);

        info!("执行上传初始化任务: 文件 {}", addr.file_id);
        self.spawn_hook(
            async move {
                let result = init_task
                    .init(&file_ctx, &message)
                    .await
                    .map_err(|e| format!("{:#}", e));
                SessionMessage::Chunk(ChunkMessage::InitTaskDone {
                    addr,
                    request_id,
                    result,
                })
            },
            move |reason| {
                SessionMessage::Chunk(ChunkMessage::InitTaskDone {
                    addr,
                    request_id,
                    result: Err(format!("初始化任务 panic: {}", reason)),
                })
            },
        );
    }

    fn on_init_task_done(&mut self, addr: ChunkAddr, request_id: u64, result: Result<(), String>) {
        let Some(fi) = self.locate(&addr) else {
            return;
        };
        let chunk = &mut self.files[fi].chunks[addr.offset];
        if chunk.request_id() != Some(request_id) {
            return;
        }
        chunk.set_processing_response(false);

        match result {
            Ok(()) => {
                for chunk in self.files[fi].chunks.iter_mut() {
                    chunk.mark_init_task_done();
                }
                self.on_test_success(fi, addr.offset);
            }
            Err(e) => self.fail_chunk(fi, addr.offset, UploadError::InitTask(e)),
        }
    }

    /// 检测成功：服务器已有该分片
    fn on_test_success(&mut self, fi: usize, offset: usize) {
        self.on_chunk_success(fi, offset);
        if let Some(chunk) = self.files[fi].chunks.get_mut(offset) {
            chunk.mark_tested();
        }
    }

    fn on_upload_response(&mut self, fi: usize, offset: usize, request_id: u64) {
        let chunk = &mut self.files[fi].chunks[offset];
        chunk.set_processing_response(true);

        match self.hooks.process_response.clone() {
            Some(processor) => {
                let file = &self.files[fi];
                let file_ctx = file.context();
                let Some(chunk_ctx) = file.chunk_context(offset) else {
                    return;
                };
                let message = file.chunks[offset].message().to_string();
                let addr = self.chunk_addr(fi, offset);

                self.spawn_hook(
                    async move {
                        let result = processor
                            .process(&message, &file_ctx, &chunk_ctx)
                            .await
                            .map_err(|e| format!("{:#}", e));
                        SessionMessage::Chunk(ChunkMessage::ResponseProcessed {
                            addr,
                            request_id,
                            result,
                        })
                    },
                    move |reason| {
                        SessionMessage::Chunk(ChunkMessage::ResponseProcessed {
                            addr,
                            request_id,
                            result: Err(format!("响应处理钩子 panic: {}", reason)),
                        })
                    },
                );
            }
            None => {
                let processed = ProcessedResponse::ok(chunk.message());
                self.on_response_processed(fi, offset, request_id, Ok(processed));
            }
        }
    }

    fn on_response_processed(
        &mut self,
        fi: usize,
        offset: usize,
        request_id: u64,
        result: Result<ProcessedResponse, String>,
    ) {
        let chunk = &mut self.files[fi].chunks[offset];
        if chunk.request_id() != Some(request_id) {
            // 处理期间分片已被中止
            return;
        }

        let processed = match result {
            Ok(processed) => processed,
            Err(e) => {
                chunk.fail_processing(&e);
                self.fail_chunk(fi, offset, UploadError::Processing(e));
                return;
            }
        };
        chunk.set_processing_response(false);
        let processing_error = processed.error.clone();
        chunk.set_processed(processed);

        match chunk.settle(&self.config, false) {
            ChunkStatus::Success => self.on_chunk_success(fi, offset),
            ChunkStatus::Error => {
                let error = match processing_error {
                    Some(e) => UploadError::Processing(e),
                    None => self.permanent_error(fi, offset),
                };
                self.fail_chunk(fi, offset, error);
            }
            _ => self.retry_chunk(fi, offset),
        }
    }

    fn permanent_error(&self, fi: usize, offset: usize) -> UploadError {
        let chunk = &self.files[fi].chunks[offset];
        UploadError::Permanent {
            chunk: offset,
            status: chunk.response().map(|r| r.status).unwrap_or(0),
            message: chunk.message().to_string(),
        }
    }

    // =====================================================
    // 重试 / 成功 / 失败
    // =====================================================

    /// 非终态响应：重试事件 → 中止 → 标记等待重试 → 立即或延迟重新发送
    fn retry_chunk(&mut self, fi: usize, offset: usize) {
        let addr = self.chunk_addr(fi, offset);
        let chunk = &mut self.files[fi].chunks[offset];
        chunk.abort();
        chunk.mark_pending_retry();
        let retries = chunk.retries();

        warn!(
            "分片重试: 文件 {} 分片 #{} 第 {}/{} 次",
            addr.file_id, offset, retries, self.config.max_chunk_retries
        );
        self.emit(UploadEvent::FileRetry {
            file_id: addr.file_id,
            chunk: offset,
            retries,
        });

        match self.config.retry_interval() {
            None => self.send_chunk(fi, offset),
            Some(delay) => self.spawn_task(async move {
                tokio::time::sleep(delay).await;
                Some(SessionMessage::Chunk(ChunkMessage::RetryDue { addr, retries }))
            }),
        }
    }

    fn on_retry_due(&mut self, addr: ChunkAddr, retries: u32) {
        let Some(fi) = self.locate(&addr) else {
            return;
        };
        let chunk = &self.files[fi].chunks[addr.offset];
        // 等待期间被中止（暂停）或已开始新一轮重试
        if !chunk.is_pending_retry() || chunk.retries() != retries {
            return;
        }
        if self.can_continue(fi) {
            self.send_chunk(fi, addr.offset);
        }
    }

    /// 分片成功：释放数据 → 断点续传对账 / 调度下一个分片 → 进度 → 完成判定
    pub(super) fn on_chunk_success(&mut self, fi: usize, offset: usize) {
        let released = self.files[fi].chunks[offset].release_bytes();
        self.memory.release(released);
        debug!("分片上传成功: 文件 {} 分片 #{}", self.files[fi].id(), offset);

        self.reconcile(fi, offset);

        // 对账可能已经完成整个文件
        let file = &mut self.files[fi];
        if file.error || file.success_emitted {
            return;
        }

        let now = Instant::now();
        file.throttler.cancel_deferred();
        let deferred = match file.throttler.remaining(now) {
            Some(wait) => {
                let seq = file.throttler.defer();
                let file_id = file.id();
                self.spawn_task(async move {
                    tokio::time::sleep(wait).await;
                    Some(SessionMessage::ProgressDue { file_id, seq })
                });
                true
            }
            None => false,
        };

        if self.files[fi].is_complete(&self.config) {
            self.complete_file(fi, Some(offset));
        } else if !deferred {
            self.trigger_progress(fi);
        }
    }

    pub(super) fn on_progress_due(&mut self, file_id: u64, seq: u64) {
        let Some(fi) = self.file_index(file_id) else {
            return;
        };
        if self.files[fi].throttler.take_deferred(seq) {
            self.trigger_progress(fi);
        }
    }

    /// 测速并推送进度事件
    pub(super) fn trigger_progress(&mut self, fi: usize) {
        let now = Instant::now();
        let file = &mut self.files[fi];
        file.measure_speed(&self.config, now);
        let event = UploadEvent::FileProgress {
            file_id: file.id(),
            progress: file.progress(&self.config),
            uploaded_size: file.size_uploaded(&self.config),
            total_size: file.size(),
            current_speed: file.current_speed,
            average_speed: file.average_speed,
        };
        file.throttler.mark_emitted(now);
        self.emit(event);
    }

    /// 文件完成：最后一次进度 → 速度清零 → 完成事件（只推送一次）
    pub(super) fn complete_file(&mut self, fi: usize, trigger: Option<usize>) {
        let file = &mut self.files[fi];
        if file.success_emitted || !file.is_complete(&self.config) {
            return;
        }
        file.throttler.cancel_deferred();
        self.trigger_progress(fi);

        let file = &mut self.files[fi];
        file.current_speed = 0.0;
        file.average_speed = 0.0;
        file.success_emitted = true;

        let chunk = trigger.unwrap_or(file.chunks.len().saturating_sub(1));
        let message = file
            .chunks
            .get(chunk)
            .map(|c| c.message().to_string())
            .unwrap_or_default();
        let released = file.release_all_bytes();
        let file_id = file.id();
        info!("文件上传完成: {} ({})", file.name(), file_id);

        self.memory.release(released);
        self.emit(UploadEvent::FileSuccess {
            file_id,
            message,
            chunk,
        });
    }

    /// 分片失败：标记文件错误并中止进行中的分片（每个文件只处理一次）
    pub(super) fn fail_chunk(&mut self, fi: usize, offset: usize, error: UploadError) {
        let file = &mut self.files[fi];
        if file.error {
            debug!("文件 {} 已失败，忽略分片 #{} 的错误: {}", file.id(), offset, error);
            return;
        }

        file.error = true;
        file.all_error = true;
        file.throttler.cancel_deferred();
        let aborted = file.abort(false, &self.config);

        let status = match &error {
            UploadError::Permanent { status, .. } => *status,
            _ => 0,
        };
        let kind = UploadErrorKind::from_error(&error);
        let file_id = file.id();
        error!(
            "文件上传失败: {} 分片 #{} ({}), 中止 {} 个分片: {}",
            file.name(),
            offset,
            kind.describe(status),
            aborted,
            error
        );

        self.emit(UploadEvent::FileError {
            file_id,
            chunk: offset,
            kind,
            status,
            message: error.to_string(),
        });
    }

    /// 超出内存上限时回收不在传输中的过期分片数据
    fn enforce_memory_budget(&mut self) {
        if !self.memory.over_budget() {
            return;
        }

        let now = Instant::now();
        let mut released = 0;
        for file in self.files.iter_mut() {
            for chunk in file.chunks.iter_mut() {
                let in_flight = matches!(
                    chunk.status(&self.config),
                    ChunkStatus::Uploading | ChunkStatus::Reading
                );
                let expired = chunk
                    .read_at()
                    .is_some_and(|read_at| self.memory.is_expired(read_at, now));
                if !in_flight && expired {
                    released += chunk.release_bytes();
                }
            }
        }
        self.memory.release(released);

        if released > 0 {
            info!(
                "回收分片数据 {} 字节，当前占用 {} 字节",
                released,
                self.memory.usage()
            );
        } else {
            warn!(
                "分片数据占用 {} 字节超出上限 {} 字节，暂无可回收数据",
                self.memory.usage(),
                self.memory.max_usage()
            );
        }
    }
}
