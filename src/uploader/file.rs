// 上传文件
//
// 一个文件持有自己的分片序列，负责：
// - 按分片规则切分（bootstrap）
// - 汇总进度 / 已上传字节 / 速度
// - 完成判定（一旦完成不再回退）

use crate::config::UploaderConfig;
use crate::events::ProgressThrottler;
use crate::uploader::chunk::{ChunkStatus, PreprocessState, ReadState, UploadChunk};
use crate::uploader::hooks::{ChunkContext, FileContext};
use crate::uploader::size;
use crate::uploader::source::{FileDescriptor, FileSource};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info};

/// 生成文件唯一标识: `{size}-{相对路径中的 [0-9A-Za-z_-]}`
pub fn generate_identifier(size: u64, relative_path: &str) -> String {
    let cleaned: String = relative_path
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    format!("{}-{}", size, cleaned)
}

/// 分片快照
#[derive(Debug, Clone, Serialize)]
pub struct ChunkSnapshot {
    pub offset: usize,
    pub start_byte: u64,
    pub end_byte: u64,
    pub status: ChunkStatus,
    pub retries: u32,
    pub tested: bool,
    pub progress: f64,
}

/// 文件快照
#[derive(Debug, Clone, Serialize)]
pub struct FileSnapshot {
    pub id: u64,
    pub identifier: String,
    pub name: String,
    pub relative_path: String,
    pub size: u64,
    pub chunk_size: u64,
    pub paused: bool,
    pub error: bool,
    pub all_error: bool,
    pub aborted: bool,
    pub completed: bool,
    /// 是否有分片正在上传
    pub uploading: bool,
    pub progress: f64,
    pub size_uploaded: u64,
    pub current_speed: f64,
    pub average_speed: f64,
    pub chunks: Vec<ChunkSnapshot>,
}

/// 上传文件
#[derive(Debug)]
pub struct UploadFile {
    id: u64,
    identifier: String,
    name: String,
    size: u64,
    relative_path: String,
    last_modified: Option<DateTime<Utc>>,
    file_type: Option<String>,
    source: Option<Arc<dyn FileSource>>,
    chunk_size: u64,
    force_chunk_size: bool,

    pub(crate) chunks: Vec<UploadChunk>,

    pub(crate) paused: bool,
    pub(crate) error: bool,
    pub(crate) all_error: bool,
    pub(crate) aborted: bool,
    completed: bool,

    pub(crate) current_speed: f64,
    pub(crate) average_speed: f64,
    /// 进度高水位
    prev_progress: f64,
    /// 上次测速时的已上传字节数
    prev_uploaded_size: u64,
    pub(crate) throttler: ProgressThrottler,

    /// 已收到首个响应（断点续传对账用）
    pub(crate) first_response: bool,
    /// 分片序列版本，每次 bootstrap 加一
    epoch: u64,
    /// 已推送过完成事件
    pub(crate) success_emitted: bool,
}

impl UploadFile {
    pub fn new(id: u64, descriptor: FileDescriptor, config: &UploaderConfig) -> Self {
        let relative_path = descriptor
            .relative_path
            .clone()
            .unwrap_or_else(|| descriptor.name.clone());

        let chunk_size = if config.adaptive_chunk_size {
            size::optimal_chunk_size(descriptor.size)
        } else {
            config.chunk_size
        };

        let mut file = Self {
            id,
            identifier: generate_identifier(descriptor.size, &relative_path),
            name: descriptor.name,
            size: descriptor.size,
            relative_path,
            last_modified: descriptor.last_modified,
            file_type: descriptor.file_type,
            source: Some(descriptor.source),
            chunk_size,
            force_chunk_size: config.force_chunk_size,
            chunks: Vec::new(),
            paused: config.initial_paused,
            error: false,
            all_error: false,
            aborted: false,
            completed: false,
            current_speed: 0.0,
            average_speed: 0.0,
            prev_progress: 0.0,
            prev_uploaded_size: 0,
            throttler: ProgressThrottler::new(config.progress_interval()),
            first_response: false,
            epoch: 0,
            success_emitted: false,
        };
        file.bootstrap();
        file
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.last_modified
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn chunks(&self) -> &[UploadChunk] {
        &self.chunks
    }

    pub fn source(&self) -> Option<&Arc<dyn FileSource>> {
        self.source.as_ref()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    /// 重新切分分片
    ///
    /// 旧分片上的请求全部取消，返回旧分片释放的数据字节数
    pub(crate) fn bootstrap(&mut self) -> u64 {
        self.prev_progress = 0.0;
        self.epoch += 1;

        let released = self.release_all_bytes();
        for chunk in self.chunks.iter_mut() {
            chunk.abort();
        }

        let count = size::chunk_count(self.size, self.chunk_size, self.force_chunk_size);
        self.chunks = (0..count)
            .map(|offset| UploadChunk::new(offset, self.chunk_size, self.size, self.force_chunk_size))
            .collect();

        if let [only] = self.chunks.as_mut_slice() {
            only.mark_pretested();
        }

        info!(
            "文件 {} 分片配置: 总大小={}, 分片大小={}, 分片数={}",
            self.name,
            size::format_size(self.size),
            size::format_size(self.chunk_size),
            count
        );

        released
    }

    /// 出错后重试：重新切分并清除错误 / 中止 / 完成标记
    pub(crate) fn reset_for_retry(&mut self) -> u64 {
        let released = self.bootstrap();
        self.error = false;
        self.all_error = false;
        self.aborted = false;
        self.completed = false;
        self.first_response = false;
        self.success_emitted = false;
        released
    }

    pub fn context(&self) -> FileContext {
        FileContext {
            file_id: self.id,
            identifier: self.identifier.clone(),
            name: self.name.clone(),
            size: self.size,
            relative_path: self.relative_path.clone(),
            file_type: self.file_type.clone(),
            chunk_size: self.chunk_size,
            total_chunks: self.chunks.len(),
        }
    }

    pub fn chunk_context(&self, offset: usize) -> Option<ChunkContext> {
        self.chunks.get(offset).map(|chunk| ChunkContext {
            file_id: self.id,
            offset: chunk.offset(),
            start_byte: chunk.start_byte(),
            end_byte: chunk.end_byte(),
            retries: chunk.retries(),
            tested: chunk.is_tested(),
        })
    }

    /// 是否有分片处于 uploading
    pub fn is_uploading(&self, config: &UploaderConfig) -> bool {
        self.chunks
            .iter()
            .any(|c| c.status(config) == ChunkStatus::Uploading)
    }

    /// 占用并发预算的分片数（uploading + reading）
    pub fn in_flight_count(&self, config: &UploaderConfig) -> usize {
        self.chunks
            .iter()
            .filter(|c| {
                matches!(
                    c.status(config),
                    ChunkStatus::Uploading | ChunkStatus::Reading
                )
            })
            .count()
    }

    pub fn all_tested(&self) -> bool {
        self.chunks.iter().all(|c| c.is_tested())
    }

    /// 中止文件上传，返回中止的分片数
    ///
    /// - 已中止时为空操作
    /// - reset 为 true 时清空分片序列
    /// - 只中止 uploading 状态的分片
    pub(crate) fn abort(&mut self, reset: bool, config: &UploaderConfig) -> usize {
        if self.aborted {
            return 0;
        }

        self.current_speed = 0.0;
        self.average_speed = 0.0;
        self.aborted = !reset;

        let mut chunks = if reset {
            std::mem::take(&mut self.chunks)
        } else {
            Vec::new()
        };
        let targets = if reset {
            &mut chunks
        } else {
            &mut self.chunks
        };

        let mut aborted = 0;
        for chunk in targets.iter_mut() {
            // 等待重试的分片没有请求，abort 只清除重试标记
            if chunk.status(config) == ChunkStatus::Uploading && chunk.abort() {
                aborted += 1;
            }
        }

        debug!("文件 {} 已中止 {} 个分片, reset={}", self.id, aborted, reset);
        aborted
    }

    /// 取消文件：中止所有分片并释放数据源，返回释放的数据字节数
    pub(crate) fn cancel(&mut self, config: &UploaderConfig) -> u64 {
        let released = self.release_all_bytes();
        self.abort(true, config);
        for mut chunk in self.chunks.drain(..) {
            chunk.abort();
        }
        self.source = None;
        released
    }

    /// 上传进度 (0-1)，不会回退
    pub fn progress(&mut self, config: &UploaderConfig) -> f64 {
        if self.error {
            return 1.0;
        }

        if let [only] = self.chunks.as_slice() {
            self.prev_progress = self.prev_progress.max(only.chunk_progress(config));
            return self.prev_progress;
        }

        if self.size == 0 {
            return self.prev_progress;
        }

        let loaded: f64 = self
            .chunks
            .iter()
            .map(|c| c.chunk_progress(config) * c.byte_len() as f64)
            .sum();
        let percent = loaded / self.size as f64;

        self.prev_progress = self
            .prev_progress
            .max(if percent > 0.9999 { 1.0 } else { percent });
        self.prev_progress
    }

    /// 已上传字节数
    pub fn size_uploaded(&self, config: &UploaderConfig) -> u64 {
        self.chunks.iter().map(|c| c.size_uploaded(config)).sum()
    }

    /// 是否上传完成，一旦为 true 不再重新计算
    pub fn is_complete(&mut self, config: &UploaderConfig) -> bool {
        if self.completed {
            return true;
        }

        let outstanding = self.error
            || self.chunks.iter().any(|c| {
                matches!(
                    c.status(config),
                    ChunkStatus::Error
                        | ChunkStatus::Pending
                        | ChunkStatus::Uploading
                        | ChunkStatus::Reading
                ) || c.preprocess_state() == PreprocessState::Running
                    || c.read_state() == ReadState::Reading
            });

        self.completed = !outstanding;
        self.completed
    }

    /// 测速：当前速度 + 指数平滑平均速度，距上次进度回调 0ms 时跳过
    pub(crate) fn measure_speed(&mut self, config: &UploaderConfig, now: Instant) {
        let elapsed = now
            .saturating_duration_since(self.throttler.last_emit())
            .as_millis();
        if elapsed == 0 {
            return;
        }

        let uploaded = self.size_uploaded(config);
        let delta = uploaded as f64 - self.prev_uploaded_size as f64;
        let current = (delta / elapsed as f64 * 1000.0).max(0.0);
        let factor = config.speed_smoothing_factor;

        self.current_speed = current;
        self.average_speed = factor * current + (1.0 - factor) * self.average_speed;
        self.prev_uploaded_size = uploaded;
    }

    /// 释放所有分片数据，返回释放的字节数
    pub(crate) fn release_all_bytes(&mut self) -> u64 {
        self.chunks.iter_mut().map(|c| c.release_bytes()).sum()
    }

    pub fn snapshot(&mut self, config: &UploaderConfig) -> FileSnapshot {
        let progress = self.progress(config);
        FileSnapshot {
            id: self.id,
            identifier: self.identifier.clone(),
            name: self.name.clone(),
            relative_path: self.relative_path.clone(),
            size: self.size,
            chunk_size: self.chunk_size,
            paused: self.paused,
            error: self.error,
            all_error: self.all_error,
            aborted: self.aborted,
            completed: self.completed,
            uploading: self.is_uploading(config),
            progress,
            size_uploaded: self.size_uploaded(config),
            current_speed: self.current_speed,
            average_speed: self.average_speed,
            chunks: self
                .chunks
                .iter()
                .map(|c| ChunkSnapshot {
                    offset: c.offset(),
                    start_byte: c.start_byte(),
                    end_byte: c.end_byte(),
                    status: c.status(config),
                    retries: c.retries(),
                    tested: c.is_tested(),
                    progress: c.chunk_progress(config),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::chunk::{ChunkResponse, RequestKind};
    use bytes::Bytes;

    fn config(chunk_size: u64) -> UploaderConfig {
        UploaderConfig {
            chunk_size,
            ..UploaderConfig::default()
        }
    }

    fn file_of(size: usize, config: &UploaderConfig) -> UploadFile {
        let descriptor = FileDescriptor::from_bytes("video.mp4", vec![0u8; size])
            .with_relative_path("media/video (1).mp4");
        UploadFile::new(1, descriptor, config)
    }

    fn succeed(chunk: &mut UploadChunk, id: u64) {
        chunk.begin_request(id, RequestKind::Upload);
        assert!(chunk.complete_request(id, ChunkResponse::new(200, "ok")));
    }

    #[test]
    fn test_identifier() {
        assert_eq!(generate_identifier(42, "media/video (1).mp4"), "42-mediavideo1mp4");
        assert_eq!(generate_identifier(0, "a_b-c.txt"), "0-a_b-ctxt");

        let config = config(100);
        let file = file_of(250, &config);
        assert_eq!(file.identifier(), "250-mediavideo1mp4");
        assert_eq!(file.relative_path(), "media/video (1).mp4");
    }

    #[test]
    fn test_bootstrap_partitions_file() {
        let config = config(100);
        let file = file_of(250, &config);

        assert_eq!(file.chunks().len(), 3);
        assert_eq!(file.chunks()[2].start_byte(), 200);
        assert_eq!(file.chunks()[2].end_byte(), 250);
        assert!(!file.chunks()[0].is_tested());
        assert_eq!(file.epoch(), 1);
    }

    #[test]
    fn test_single_chunk_is_pretested() {
        let config = config(100);
        let file = file_of(80, &config);

        assert_eq!(file.chunks().len(), 1);
        assert!(file.chunks()[0].is_tested());
        assert!(file.chunks()[0].is_init_task_done());
    }

    #[test]
    fn test_adaptive_chunk_size() {
        let config = UploaderConfig {
            adaptive_chunk_size: true,
            ..UploaderConfig::default()
        };
        let file = file_of(3 * 1024 * 1024, &config);
        assert_eq!(file.chunk_size(), size::SMALL_FILE_CHUNK_SIZE);
        assert_eq!(file.chunks().len(), 2);
    }

    #[test]
    fn test_progress_is_monotone() {
        let config = config(100);
        let mut file = file_of(200, &config);

        file.chunks[0].begin_request(1, RequestKind::Upload);
        file.chunks[0].update_progress(50, 100);
        assert_eq!(file.progress(&config), 0.25);
        assert_eq!(file.size_uploaded(&config), 50);

        // 暂停：中止进行中的分片后进度不回退
        assert_eq!(file.abort(false, &config), 1);
        assert_eq!(file.size_uploaded(&config), 0);
        assert_eq!(file.progress(&config), 0.25);

        succeed(&mut file.chunks[0], 2);
        succeed(&mut file.chunks[1], 3);
        assert_eq!(file.progress(&config), 1.0);
    }

    #[test]
    fn test_single_chunk_progress_high_water_mark() {
        let config = config(100);
        let mut file = file_of(100, &config);

        file.chunks[0].begin_request(1, RequestKind::Upload);
        file.chunks[0].update_progress(60, 100);
        assert_eq!(file.progress(&config), 0.6);

        file.chunks[0].abort();
        assert_eq!(file.progress(&config), 0.6);
    }

    #[test]
    fn test_error_progress_is_full() {
        let config = config(100);
        let mut file = file_of(300, &config);
        file.error = true;
        assert_eq!(file.progress(&config), 1.0);
    }

    #[test]
    fn test_abort_is_idempotent() {
        let config = config(100);
        let mut file = file_of(300, &config);
        let token = file.chunks[1].begin_request(1, RequestKind::Upload);
        file.current_speed = 10.0;
        assert!(file.is_uploading(&config));

        assert_eq!(file.abort(false, &config), 1);
        assert!(!file.is_uploading(&config));
        assert!(token.is_cancelled());
        assert!(file.aborted);
        assert_eq!(file.current_speed, 0.0);
        assert_eq!(file.chunks().len(), 3);

        file.chunks[2].begin_request(2, RequestKind::Upload);
        assert_eq!(file.abort(false, &config), 0);
    }

    #[test]
    fn test_abort_with_reset_clears_chunks() {
        let config = config(100);
        let mut file = file_of(300, &config);
        let token = file.chunks[0].begin_request(1, RequestKind::Upload);

        assert_eq!(file.abort(true, &config), 1);
        assert!(token.is_cancelled());
        assert!(!file.aborted);
        assert!(file.chunks().is_empty());
    }

    #[test]
    fn test_is_complete_is_sticky() {
        let config = config(100);
        let mut file = file_of(200, &config);
        assert!(!file.is_complete(&config));

        succeed(&mut file.chunks[0], 1);
        assert!(!file.is_complete(&config));

        succeed(&mut file.chunks[1], 2);
        assert!(file.is_complete(&config));

        file.chunks[1].abort();
        assert!(file.is_complete(&config));
    }

    #[test]
    fn test_reset_for_retry() {
        let config = config(100);
        let mut file = file_of(200, &config);
        file.error = true;
        file.all_error = true;
        file.aborted = true;
        file.first_response = true;
        file.chunks[0].begin_read();
        file.chunks[0].finish_read(Bytes::from(vec![0u8; 100]), Instant::now());
        let token = file.chunks[1].begin_request(1, RequestKind::Upload);

        assert_eq!(file.reset_for_retry(), 100);
        assert!(token.is_cancelled());
        assert!(!file.error && !file.all_error && !file.aborted && !file.first_response);
        assert_eq!(file.epoch(), 2);
        assert!(file.chunks().iter().all(|c| c.bytes().is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_measure_speed() {
        let config = UploaderConfig {
            chunk_size: 100,
            speed_smoothing_factor: 0.5,
            ..UploaderConfig::default()
        };
        let mut file = file_of(200, &config);

        // 同一时刻：跳过
        file.measure_speed(&config, file.throttler.last_emit());
        assert_eq!(file.current_speed, 0.0);

        tokio::time::advance(std::time::Duration::from_millis(500)).await;
        succeed(&mut file.chunks[0], 1);
        file.measure_speed(&config, Instant::now());
        assert_eq!(file.current_speed, 200.0);
        assert_eq!(file.average_speed, 100.0);
    }

    #[test]
    fn test_cancel_releases_everything() {
        let config = config(100);
        let mut file = file_of(200, &config);
        file.chunks[0].begin_read();
        file.chunks[0].finish_read(Bytes::from(vec![0u8; 100]), Instant::now());
        file.paused = true;
        file.aborted = true;
        let token = file.chunks[1].begin_request(1, RequestKind::Upload);

        assert_eq!(file.cancel(&config), 100);
        assert!(token.is_cancelled());
        assert!(file.chunks().is_empty());
        assert!(file.source().is_none());
    }
}
