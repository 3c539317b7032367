use anyhow::{Context, Result};
use clap::Parser;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use x_uploader::{
    config::LogConfig, logging, uploader::format_size, AppConfig, FileDescriptor, FolderScanner,
    HttpTransport, ScanOptions, UploadEvent, UploadHooks, Uploader, UploaderConfig,
};

/// 分片上传命令行工具
#[derive(Debug, Parser)]
#[command(name = "x-uploader", version, about = "可断点续传的分片文件上传工具")]
struct Cli {
    /// 要上传的文件或文件夹
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// 配置文件路径
    #[arg(short, long, default_value = "config/app.toml")]
    config: String,

    /// 上传地址，覆盖配置文件
    #[arg(short, long)]
    target: Option<String>,

    /// 每个文件的并发分片数
    #[arg(short, long)]
    simultaneous: Option<usize>,

    /// 分片大小（字节）
    #[arg(long)]
    chunk_size: Option<u64>,

    /// 不发送检测请求，直接上传所有分片
    #[arg(long)]
    no_test_chunks: bool,

    /// 扫描文件夹时跳过隐藏文件
    #[arg(long)]
    skip_hidden: bool,

    /// 单个请求超时（秒）
    #[arg(long, default_value_t = 300)]
    timeout: u64,

    /// 以 JSON 行输出事件
    #[arg(long)]
    json: bool,
}

/// 加载日志配置
///
/// 尝试从配置文件读取 [log] 段，失败时返回默认配置
async fn load_log_config(path: &str) -> LogConfig {
    if let Ok(content) = tokio::fs::read_to_string(path).await {
        if let Ok(config) = toml::from_str::<toml::Value>(&content) {
            if let Some(log_table) = config.get("log") {
                if let Ok(log_config) = log_table.clone().try_into::<LogConfig>() {
                    return log_config;
                }
            }
        }
    }
    LogConfig::default()
}

/// 命令行参数覆盖配置文件
///
/// 命令行模式没有恢复入口，initial_paused 总是关闭
fn apply_overrides(cli: &Cli, mut config: UploaderConfig) -> UploaderConfig {
    if let Some(target) = &cli.target {
        config.target = target.clone();
    }
    if let Some(simultaneous) = cli.simultaneous {
        config.simultaneous_uploads = simultaneous;
    }
    if let Some(chunk_size) = cli.chunk_size {
        config.chunk_size = chunk_size;
        config.adaptive_chunk_size = false;
    }
    if cli.no_test_chunks {
        config.test_chunks = false;
    }
    if config.initial_paused {
        warn!("命令行模式忽略 initial_paused 配置");
        config.initial_paused = false;
    }
    config
}

async fn collect_files(cli: &Cli) -> Result<Vec<FileDescriptor>> {
    let scanner = FolderScanner::with_options(ScanOptions {
        skip_hidden: cli.skip_hidden,
        ..Default::default()
    });

    let mut files = Vec::new();
    for path in &cli.paths {
        if path.is_dir() {
            files.extend(scanner.scan_descriptors(path).await?);
        } else {
            let file = FileDescriptor::from_path(path)
                .await
                .with_context(|| format!("无法上传: {}", path.display()))?;
            files.push(file);
        }
    }
    Ok(files)
}

fn print_event(event: &UploadEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!("序列化事件失败: {}", e),
        }
        return;
    }

    match event {
        UploadEvent::FileAdded {
            file_id,
            relative_path,
            total_size,
            total_chunks,
            ..
        } => println!(
            "[{}] 添加 {} ({}, {} 个分片)",
            file_id,
            relative_path,
            format_size(*total_size),
            total_chunks
        ),
        UploadEvent::FileProgress {
            file_id,
            progress,
            average_speed,
            ..
        } => println!(
            "[{}] {:.1}% {}/s",
            file_id,
            progress * 100.0,
            format_size(*average_speed as u64)
        ),
        UploadEvent::FileSuccess { file_id, .. } => println!("[{}] 上传完成", file_id),
        UploadEvent::FileError {
            file_id,
            chunk,
            message,
            ..
        } => println!("[{}] 上传失败 (分片 #{}): {}", file_id, chunk, message),
        UploadEvent::FileRetry {
            file_id,
            chunk,
            retries,
        } => println!("[{}] 分片 #{} 第 {} 次重试", file_id, chunk, retries),
        _ => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = load_log_config(&cli.config).await;
    let _log_guard = logging::init_logging(&log_config);

    info!("X Uploader v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let config = apply_overrides(&cli, AppConfig::load_or_default(&cli.config).await.uploader);

    let files = collect_files(&cli).await?;
    if files.is_empty() {
        info!("没有需要上传的文件");
        return Ok(());
    }

    let transport = Arc::new(HttpTransport::new(Duration::from_secs(cli.timeout))?);
    let (uploader, mut events) = Uploader::start(config, UploadHooks::new(), transport)?;

    let ids = uploader.add_files(files).await?;
    let total = ids.len();
    uploader.upload_all()?;

    let mut finished = HashSet::new();
    let mut failed = HashSet::new();

    while finished.len() < total {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                print_event(&event, cli.json);
                if event.is_terminal() {
                    finished.insert(event.file_id());
                }
                if let UploadEvent::FileError { file_id, .. } = event {
                    failed.insert(file_id);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("收到中断信号，停止上传");
                uploader.shutdown();
                anyhow::bail!("上传被中断: {}/{} 个文件已结束", finished.len(), total);
            }
        }
    }

    uploader.shutdown();

    if failed.is_empty() {
        info!("全部 {} 个文件上传完成", total);
        Ok(())
    } else {
        error!("{}/{} 个文件上传失败", failed.len(), total);
        anyhow::bail!("{} 个文件上传失败", failed.len())
    }
}
