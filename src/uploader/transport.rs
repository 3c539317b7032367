// 分片请求传输层
//
// 状态机只依赖 Transport trait：发送请求、上报上传进度、返回状态码和响应体。
// 中止通过分片持有的 CancellationToken 完成（actor 丢弃进行中的 send future）。

use crate::config::HttpMethod;
use crate::error::{UploadError, UploadResult};
use crate::uploader::chunk::{ChunkResponse, RequestKind};
use crate::uploader::hooks::Params;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart;
use reqwest::Client;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// 上传进度回调 (loaded, total)
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// 进度上报粒度: 64KB
const PROGRESS_PIECE_SIZE: usize = 64 * 1024;

/// 分片数据
#[derive(Debug, Clone)]
pub struct ChunkBody {
    /// 表单字段名
    pub field: String,
    /// 表单中的文件名
    pub file_name: String,
    pub bytes: Bytes,
}

/// 一次分片请求
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub kind: RequestKind,
    pub method: HttpMethod,
    pub target: String,
    pub headers: BTreeMap<String, String>,
    /// 元数据参数：GET 编码为查询字符串，其它方法作为表单字段
    pub params: Params,
    /// 上传请求携带的分片数据
    pub body: Option<ChunkBody>,
}

impl TransportRequest {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// 分片序号（从 1 开始）
    pub fn chunk_number(&self) -> Option<usize> {
        self.param("chunkNumber").and_then(|n| n.parse().ok())
    }
}

/// 传输层
#[async_trait]
pub trait Transport: Send + Sync {
    /// 发送请求；拿不到响应时返回 Err，由状态机折算为状态码 0
    async fn send(&self, request: TransportRequest, progress: ProgressFn)
        -> UploadResult<ChunkResponse>;
}

/// 把参数拼接到目标地址上
pub fn append_query(target: &str, params: &Params) -> String {
    if params.is_empty() {
        return target.to_string();
    }

    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    let separator = if target.contains('?') { '&' } else { '?' };
    format!("{}{}{}", target, separator, query)
}

/// 基于 reqwest 的 HTTP 传输
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> UploadResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| UploadError::Transport(format!("创建 HTTP 客户端失败: {}", e)))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// 分块包装分片数据，reqwest 每拉取一块上报一次进度
    fn progress_body(bytes: Bytes, progress: ProgressFn) -> reqwest::Body {
        reqwest::Body::wrap_stream(progress_stream(bytes, progress))
    }
}

/// 把分片数据切成小块的流，每产出一块上报一次累计进度
fn progress_stream(
    bytes: Bytes,
    progress: ProgressFn,
) -> impl futures::Stream<Item = Result<Bytes, std::io::Error>> + Send + Sync + 'static {
    let total = bytes.len() as u64;
    let mut pieces = Vec::with_capacity(bytes.len() / PROGRESS_PIECE_SIZE + 1);
    let mut offset = 0;
    while offset < bytes.len() {
        let end = (offset + PROGRESS_PIECE_SIZE).min(bytes.len());
        pieces.push(bytes.slice(offset..end));
        offset = end;
    }

    let mut sent = 0u64;
    futures::stream::iter(pieces.into_iter().map(move |piece| {
        sent += piece.len() as u64;
        progress(sent, total);
        Ok(piece)
    }))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        request: TransportRequest,
        progress: ProgressFn,
    ) -> UploadResult<ChunkResponse> {
        let builder = match request.method {
            HttpMethod::Get => {
                let url = append_query(&request.target, &request.params);
                self.client.get(url)
            }
            HttpMethod::Post | HttpMethod::Put => {
                let mut form = multipart::Form::new();
                for (k, v) in &request.params {
                    form = form.text(k.clone(), v.clone());
                }
                if let Some(body) = request.body {
                    let len = body.bytes.len() as u64;
                    let part = multipart::Part::stream_with_length(
                        Self::progress_body(body.bytes, progress),
                        len,
                    )
                    .file_name(body.file_name)
                    .mime_str("application/octet-stream")
                    .map_err(|e| UploadError::Transport(e.to_string()))?;
                    form = form.part(body.field, part);
                }

                let builder = if request.method == HttpMethod::Put {
                    self.client.put(&request.target)
                } else {
                    self.client.post(&request.target)
                };
                builder.multipart(form)
            }
        };

        let builder = request
            .headers
            .iter()
            .fold(builder, |b, (k, v)| b.header(k.as_str(), v.as_str()));

        let response = builder
            .send()
            .await
            .map_err(|e| UploadError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| UploadError::Transport(format!("读取响应失败: {}", e)))?;

        debug!(
            "分片请求响应: kind={:?}, chunk={:?}, status={}, body_len={}",
            request.kind,
            request.params.get("chunkNumber"),
            status,
            body.len()
        );

        Ok(ChunkResponse::new(status, body))
    }
}

/// 测试用传输层：请求挂起，直到测试代码给出响应
#[cfg(test)]
pub mod testing {
    use super::*;
    use std::time::Duration;
    use tokio::sync::{mpsc, oneshot};

    /// 挂起的请求
    pub struct PendingRequest {
        pub request: TransportRequest,
        progress: ProgressFn,
        reply: oneshot::Sender<UploadResult<ChunkResponse>>,
    }

    impl PendingRequest {
        pub fn kind(&self) -> RequestKind {
            self.request.kind
        }

        /// 分片序号（从 1 开始）
        pub fn chunk_number(&self) -> usize {
            self.request.chunk_number().expect("request without chunkNumber")
        }

        /// 请求已被中止（send future 被丢弃）
        pub fn is_aborted(&self) -> bool {
            self.reply.is_closed()
        }

        pub fn report_progress(&self, loaded: u64, total: u64) {
            (self.progress)(loaded, total);
        }

        pub fn respond(self, status: u16, body: &str) {
            let _ = self.reply.send(Ok(ChunkResponse::new(status, body)));
        }

        pub fn fail(self, message: &str) {
            let _ = self.reply.send(Err(UploadError::Transport(message.to_string())));
        }
    }

    #[derive(Clone)]
    pub struct MockTransport {
        tx: mpsc::UnboundedSender<PendingRequest>,
    }

    pub struct MockServer {
        rx: mpsc::UnboundedReceiver<PendingRequest>,
    }

    impl MockTransport {
        pub fn new() -> (Arc<MockTransport>, MockServer) {
            let (tx, rx) = mpsc::unbounded_channel();
            (Arc::new(MockTransport { tx }), MockServer { rx })
        }
    }

    impl MockServer {
        /// 等待下一个请求
        pub async fn next(&mut self) -> PendingRequest {
            tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
                .await
                .expect("timed out waiting for request")
                .expect("transport dropped")
        }

        /// 让出调度，确认没有新的请求
        pub async fn assert_idle(&mut self) {
            for _ in 0..50 {
                tokio::task::yield_now().await;
            }
            if let Ok(pending) = self.rx.try_recv() {
                panic!(
                    "unexpected request: kind={:?} chunk={:?}",
                    pending.request.kind,
                    pending.request.chunk_number()
                );
            }
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(
            &self,
            request: TransportRequest,
            progress: ProgressFn,
        ) -> UploadResult<ChunkResponse> {
            let (reply, rx) = oneshot::channel();
            self.tx
                .send(PendingRequest {
                    request,
                    progress,
                    reply,
                })
                .map_err(|_| UploadError::Transport("mock server closed".to_string()))?;
            rx.await
                .map_err(|_| UploadError::Transport("mock request dropped".to_string()))?
        }
    }
}
