// 上传文件数据源
//
// 状态机只通过 FileSource 按字节范围读取分片数据：
// - LocalFileSource: 本地磁盘文件
// - MemoryFileSource: 内存中的数据（测试或调用方自带数据）

use crate::error::{UploadError, UploadResult};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt::Debug;
use std::io::SeekFrom;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// 分片数据源
#[async_trait]
pub trait FileSource: Send + Sync + Debug {
    /// 读取 `[start, end)` 范围内的字节
    async fn read_range(&self, range: Range<u64>) -> UploadResult<Bytes>;
}

/// 本地文件数据源
#[derive(Debug, Clone)]
pub struct LocalFileSource {
    path: PathBuf,
}

impl LocalFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl FileSource for LocalFileSource {
    async fn read_range(&self, range: Range<u64>) -> UploadResult<Bytes> {
        let len = range.end.saturating_sub(range.start) as usize;
        if len == 0 {
            return Ok(Bytes::new());
        }

        let mut file = File::open(&self.path).await.map_err(|e| {
            UploadError::Read(format!("打开文件失败 {}: {}", self.path.display(), e))
        })?;
        file.seek(SeekFrom::Start(range.start)).await?;

        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer).await.map_err(|e| {
            UploadError::Read(format!(
                "读取 {} 的 [{}, {}) 失败: {}",
                self.path.display(),
                range.start,
                range.end,
                e
            ))
        })?;

        Ok(Bytes::from(buffer))
    }
}

/// 内存数据源
#[derive(Debug, Clone)]
pub struct MemoryFileSource {
    data: Bytes,
}

impl MemoryFileSource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
impl FileSource for MemoryFileSource {
    async fn read_range(&self, range: Range<u64>) -> UploadResult<Bytes> {
        if range.end > self.len() || range.start > range.end {
            return Err(UploadError::Read(format!(
                "读取范围 [{}, {}) 超出数据长度 {}",
                range.start,
                range.end,
                self.len()
            )));
        }
        Ok(self.data.slice(range.start as usize..range.end as usize))
    }
}

/// 待上传文件的描述
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    /// 文件名
    pub name: String,
    /// 文件大小（字节）
    pub size: u64,
    /// 相对路径，为空时使用文件名
    pub relative_path: Option<String>,
    /// 最后修改时间
    pub last_modified: Option<DateTime<Utc>>,
    /// 文件类型（扩展名）
    pub file_type: Option<String>,
    /// 数据源
    pub source: Arc<dyn FileSource>,
}

impl FileDescriptor {
    /// 从本地路径创建描述
    pub async fn from_path(path: impl AsRef<Path>) -> UploadResult<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| UploadError::Read(format!("读取文件元数据失败 {}: {}", path.display(), e)))?;

        if !metadata.is_file() {
            return Err(UploadError::Read(format!("不是文件: {}", path.display())));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        Ok(Self {
            file_type: file_type_of(&name),
            name,
            size: metadata.len(),
            relative_path: None,
            last_modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            source: Arc::new(LocalFileSource::new(path)),
        })
    }

    /// 从内存数据创建描述
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let name = name.into();
        let source = MemoryFileSource::new(data);
        Self {
            file_type: file_type_of(&name),
            size: source.len(),
            name,
            relative_path: None,
            last_modified: None,
            source: Arc::new(source),
        }
    }

    /// 设置相对路径（文件夹上传时保留目录结构）
    pub fn with_relative_path(mut self, relative_path: impl Into<String>) -> Self {
        self.relative_path = Some(relative_path.into());
        self
    }

    /// 形如目录占位符的条目（名称为 "." 且大小是 4096 的倍数）
    pub fn is_directory_placeholder(&self) -> bool {
        self.size % 4096 == 0 && self.name == "."
    }
}

fn file_type_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
}
