//! 文件夹扫描
//!
//! 负责:
//! - 递归扫描本地文件夹
//! - 保留目录结构（相对路径以扫描根目录名开头，分隔符统一为 `/`）
//! - 生成待上传的文件描述

use crate::uploader::size::format_size;
use crate::uploader::source::FileDescriptor;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

/// 文件扫描结果
#[derive(Debug, Clone)]
pub struct ScannedFile {
    /// 本地文件路径
    pub local_path: PathBuf,
    /// 上传用的相对路径，如 `photos/2024/a.jpg`
    pub relative_path: String,
    /// 文件大小（字节）
    pub size: u64,
}

/// 文件夹扫描配置
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// 是否跟随符号链接
    pub follow_symlinks: bool,
    /// 最大文件大小（字节），超过此大小的文件将被跳过
    pub max_file_size: Option<u64>,
    /// 最大文件数量，超过此数量将停止扫描
    pub max_files: Option<usize>,
    /// 跳过隐藏文件（以.开头的文件和文件夹）
    pub skip_hidden: bool,
}

/// 文件夹扫描器
#[derive(Debug, Default)]
pub struct FolderScanner {
    options: ScanOptions,
}

impl FolderScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ScanOptions) -> Self {
        Self { options }
    }

    /// 递归扫描文件夹，结果按相对路径排序
    pub fn scan<P: AsRef<Path>>(&self, root_path: P) -> Result<Vec<ScannedFile>> {
        let root_path = root_path.as_ref();

        if !root_path.exists() {
            anyhow::bail!("扫描路径不存在: {}", root_path.display());
        }

        if !root_path.is_dir() {
            anyhow::bail!("扫描路径不是文件夹: {}", root_path.display());
        }

        info!("开始扫描文件夹: {}", root_path.display());

        let root_name = root_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let skip_hidden = self.options.skip_hidden;
        let walker = WalkDir::new(root_path)
            .follow_links(self.options.follow_symlinks)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !(skip_hidden && entry.depth() > 0 && is_hidden(entry)));

        let mut files = Vec::new();
        for entry in walker {
            let entry = entry.with_context(|| format!("读取目录失败: {}", root_path.display()))?;

            if !entry.file_type().is_file() {
                if !entry.file_type().is_dir() {
                    debug!("跳过非常规文件: {}", entry.path().display());
                }
                continue;
            }

            let size = entry
                .metadata()
                .with_context(|| format!("读取文件元数据失败: {}", entry.path().display()))?
                .len();

            if let Some(max_size) = self.options.max_file_size {
                if size > max_size {
                    warn!("跳过超大文件: {} ({})", entry.path().display(), format_size(size));
                    continue;
                }
            }

            let relative = entry.path().strip_prefix(root_path).with_context(|| {
                format!(
                    "计算相对路径失败: {} (root: {})",
                    entry.path().display(),
                    root_path.display()
                )
            })?;
            let relative_path = join_relative(&root_name, relative);

            debug!("扫描到文件: {} ({})", relative_path, format_size(size));
            files.push(ScannedFile {
                local_path: entry.into_path(),
                relative_path,
                size,
            });

            if let Some(max_files) = self.options.max_files {
                if files.len() >= max_files {
                    warn!("已达到最大文件数量限制 ({}), 停止扫描", max_files);
                    break;
                }
            }
        }

        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

        info!(
            "文件夹扫描完成: {} 个文件，总大小 {}",
            files.len(),
            format_size(files.iter().map(|f| f.size).sum())
        );

        Ok(files)
    }

    /// 扫描并生成文件描述
    pub async fn scan_descriptors<P: AsRef<Path>>(&self, root_path: P) -> Result<Vec<FileDescriptor>> {
        let files = self.scan(root_path)?;
        to_descriptors(files).await
    }
}

/// 扫描结果转换为文件描述
pub async fn to_descriptors(files: Vec<ScannedFile>) -> Result<Vec<FileDescriptor>> {
    let mut descriptors = Vec::with_capacity(files.len());
    for file in files {
        let descriptor = FileDescriptor::from_path(&file.local_path)
            .await
            .with_context(|| format!("打开文件失败: {}", file.local_path.display()))?
            .with_relative_path(file.relative_path);
        descriptors.push(descriptor);
    }
    Ok(descriptors)
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .is_some_and(|name| name.starts_with('.'))
}

fn join_relative(root_name: &str, relative: &Path) -> String {
    let mut parts: Vec<String> = Vec::new();
    if !root_name.is_empty() {
        parts.push(root_name.to_string());
    }
    parts.extend(
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string()),
    );
    parts.join("/")
}
