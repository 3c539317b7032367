// 配置管理模块

use crate::error::UploadError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 上传配置
    #[serde(default)]
    pub uploader: UploaderConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 20MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    false
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    20 * 1024 * 1024
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 请求方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
        }
    }
}

/// 业务层成功标记：响应体中需要包含的子串
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessApiStatuses {
    /// 例如 `"code":200`
    #[serde(default)]
    pub code: Option<String>,
    /// 例如 `"state":"success"`
    #[serde(default)]
    pub state: Option<String>,
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploaderConfig {
    /// 分片大小（字节）
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// 是否强制所有分片（除最后一片）都严格等于 chunk_size
    #[serde(default = "default_true")]
    pub force_chunk_size: bool,
    /// 每个文件同时上传的分片数
    #[serde(default = "default_simultaneous_uploads")]
    pub simultaneous_uploads: usize,
    /// 分片最大重试次数
    #[serde(default = "default_max_chunk_retries")]
    pub max_chunk_retries: u32,
    /// 重试间隔（毫秒），不配置则立即重试
    #[serde(default)]
    pub chunk_retry_interval_ms: Option<u64>,
    /// 进度回调最小间隔（毫秒）
    #[serde(default = "default_progress_callbacks_interval_ms")]
    pub progress_callbacks_interval_ms: u64,
    /// 平均速度平滑系数 (0-1)
    #[serde(default = "default_speed_smoothing_factor")]
    pub speed_smoothing_factor: f64,
    /// 视为成功的 HTTP 状态码
    #[serde(default = "default_success_statuses")]
    pub success_statuses: Vec<u16>,
    /// 响应体成功标记
    #[serde(default)]
    pub success_api_statuses: SuccessApiStatuses,
    /// 永久错误状态码（不再重试）
    #[serde(default = "default_permanent_errors")]
    pub permanent_errors: Vec<u16>,
    /// 上传前是否先检测分片是否已存在
    #[serde(default = "default_true")]
    pub test_chunks: bool,
    /// 检测请求方法
    #[serde(default = "default_test_method")]
    pub test_method: HttpMethod,
    /// 上传请求方法
    #[serde(default = "default_upload_method")]
    pub upload_method: HttpMethod,
    /// 上传地址（可被 UploadHooks::target 覆盖）
    #[serde(default = "default_target")]
    pub target: String,
    /// 附加的静态请求参数
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    /// 附加请求头
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// 分片数据的表单字段名
    #[serde(default = "default_file_parameter_name")]
    pub file_parameter_name: String,
    /// 新加入的文件是否默认暂停
    #[serde(default)]
    pub initial_paused: bool,
    /// 是否根据文件大小自动选择分片大小
    #[serde(default)]
    pub adaptive_chunk_size: bool,
    /// 分片数据内存占用上限（字节）
    #[serde(default = "default_max_memory_usage")]
    pub max_memory_usage: u64,
    /// 超出内存上限时，可回收的分片数据最小存活时间（秒）
    #[serde(default = "default_memory_max_age_secs")]
    pub memory_max_age_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_chunk_size() -> u64 {
    5 * 1024 * 1024
}

fn default_simultaneous_uploads() -> usize {
    4
}

fn default_max_chunk_retries() -> u32 {
    3
}

fn default_progress_callbacks_interval_ms() -> u64 {
    200
}

fn default_speed_smoothing_factor() -> f64 {
    0.1
}

fn default_success_statuses() -> Vec<u16> {
    vec![200, 201, 202]
}

fn default_permanent_errors() -> Vec<u16> {
    vec![404, 415, 500, 501]
}

fn default_test_method() -> HttpMethod {
    HttpMethod::Get
}

fn default_upload_method() -> HttpMethod {
    HttpMethod::Post
}

fn default_target() -> String {
    "/".to_string()
}

fn default_file_parameter_name() -> String {
    "file".to_string()
}

fn default_max_memory_usage() -> u64 {
    100 * 1024 * 1024
}

fn default_memory_max_age_secs() -> u64 {
    5 * 60
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            force_chunk_size: true,
            simultaneous_uploads: default_simultaneous_uploads(),
            max_chunk_retries: default_max_chunk_retries(),
            chunk_retry_interval_ms: None,
            progress_callbacks_interval_ms: default_progress_callbacks_interval_ms(),
            speed_smoothing_factor: default_speed_smoothing_factor(),
            success_statuses: default_success_statuses(),
            success_api_statuses: SuccessApiStatuses::default(),
            permanent_errors: default_permanent_errors(),
            test_chunks: true,
            test_method: default_test_method(),
            upload_method: default_upload_method(),
            target: default_target(),
            query: BTreeMap::new(),
            headers: BTreeMap::new(),
            file_parameter_name: default_file_parameter_name(),
            initial_paused: false,
            adaptive_chunk_size: false,
            max_memory_usage: default_max_memory_usage(),
            memory_max_age_secs: default_memory_max_age_secs(),
        }
    }
}

impl UploaderConfig {
    /// 校验配置，返回第一个不合法的字段
    pub fn validate(&self) -> std::result::Result<(), UploadError> {
        let mut errors = Vec::new();

        if self.chunk_size == 0 {
            errors.push("chunk_size 必须大于 0");
        }
        if self.simultaneous_uploads == 0 {
            errors.push("simultaneous_uploads 必须大于 0");
        }
        if !(0.0..=1.0).contains(&self.speed_smoothing_factor) {
            errors.push("speed_smoothing_factor 必须在 0 到 1 之间");
        }
        if self.success_statuses.is_empty() {
            errors.push("success_statuses 不能为空");
        }
        if self.max_memory_usage == 0 {
            errors.push("max_memory_usage 必须大于 0");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(UploadError::Config(errors.join("; ")))
        }
    }

    pub fn retry_interval(&self) -> Option<Duration> {
        self.chunk_retry_interval_ms.map(Duration::from_millis)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_callbacks_interval_ms)
    }

    pub fn memory_max_age(&self) -> Duration {
        Duration::from_secs(self.memory_max_age_secs)
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .uploader
            .validate()
            .context("配置文件中的上传配置验证失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.uploader
            .validate()
            .context("保存配置失败：上传配置不合法")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载或使用默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                Self::default()
            }
        }
    }
}
