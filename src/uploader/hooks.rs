// 上传行为钩子
//
// 同步钩子（target / query / process_params / 已上传判定）在 actor 内直接调用；
// 异步钩子（预处理 / 初始化任务 / 响应处理）在独立任务中执行，结果投递回 actor

use crate::uploader::chunk::ProcessedResponse;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// 请求参数
pub type Params = BTreeMap<String, String>;

/// 钩子可见的文件信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContext {
    pub file_id: u64,
    pub identifier: String,
    pub name: String,
    pub size: u64,
    pub relative_path: String,
    pub file_type: Option<String>,
    pub chunk_size: u64,
    pub total_chunks: usize,
}

/// 钩子可见的分片信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkContext {
    pub file_id: u64,
    /// 分片序号（从 0 开始）
    pub offset: usize,
    pub start_byte: u64,
    pub end_byte: u64,
    pub retries: u32,
    pub tested: bool,
}

/// 分片预处理（如计算校验值），失败视为分片错误
#[async_trait]
pub trait ChunkPreprocessor: Send + Sync {
    async fn preprocess(&self, file: &FileContext, chunk: &ChunkContext) -> anyhow::Result<()>;
}

/// 文件级初始化任务，首个检测成功的分片触发，失败会中止整个文件
#[async_trait]
pub trait InitTask: Send + Sync {
    async fn init(&self, file: &FileContext, message: &str) -> anyhow::Result<()>;
}

/// 响应处理
///
/// `ProcessedResponse::failed` 表示业务错误（过期响应仍按重试策略处理）；
/// 返回 `Err` 表示钩子本身失败，分片和文件直接失败
#[async_trait]
pub trait ResponseProcessor: Send + Sync {
    async fn process(
        &self,
        message: &str,
        file: &FileContext,
        chunk: &ChunkContext,
    ) -> anyhow::Result<ProcessedResponse>;
}

type TargetFn = dyn Fn(&FileContext, &ChunkContext, bool) -> String + Send + Sync;
type QueryFn = dyn Fn(&FileContext, &ChunkContext, bool) -> Params + Send + Sync;
type ProcessParamsFn = dyn Fn(Params, &FileContext, &ChunkContext, bool) -> Params + Send + Sync;
type UploadedCheckFn = dyn Fn(&ChunkContext, &str) -> bool + Send + Sync;

/// 上传钩子集合，全部可选
#[derive(Clone, Default)]
pub struct UploadHooks {
    pub target: Option<Arc<TargetFn>>,
    pub query: Option<Arc<QueryFn>>,
    pub process_params: Option<Arc<ProcessParamsFn>>,
    /// 根据首个响应判断分片是否已上传（断点续传）
    pub check_chunk_uploaded: Option<Arc<UploadedCheckFn>>,
    pub preprocess: Option<Arc<dyn ChunkPreprocessor>>,
    pub init_task: Option<Arc<dyn InitTask>>,
    pub process_response: Option<Arc<dyn ResponseProcessor>>,
}

impl UploadHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 动态上传地址，第三个参数表示是否为检测请求
    pub fn with_target<F>(mut self, f: F) -> Self
    where
        F: Fn(&FileContext, &ChunkContext, bool) -> String + Send + Sync + 'static,
    {
        self.target = Some(Arc::new(f));
        self
    }

    /// 动态请求参数，与配置中的静态参数合并
    pub fn with_query<F>(mut self, f: F) -> Self
    where
        F: Fn(&FileContext, &ChunkContext, bool) -> Params + Send + Sync + 'static,
    {
        self.query = Some(Arc::new(f));
        self
    }

    /// 发送前最后一次改写请求参数
    pub fn with_process_params<F>(mut self, f: F) -> Self
    where
        F: Fn(Params, &FileContext, &ChunkContext, bool) -> Params + Send + Sync + 'static,
    {
        self.process_params = Some(Arc::new(f));
        self
    }

    pub fn with_uploaded_check<F>(mut self, f: F) -> Self
    where
        F: Fn(&ChunkContext, &str) -> bool + Send + Sync + 'static,
    {
        self.check_chunk_uploaded = Some(Arc::new(f));
        self
    }

    pub fn with_preprocess(mut self, preprocessor: impl ChunkPreprocessor + 'static) -> Self {
        self.preprocess = Some(Arc::new(preprocessor));
        self
    }

    pub fn with_init_task(mut self, task: impl InitTask + 'static) -> Self {
        self.init_task = Some(Arc::new(task));
        self
    }

    pub fn with_response_processor(mut self, processor: impl ResponseProcessor + 'static) -> Self {
        self.process_response = Some(Arc::new(processor));
        self
    }

    /// 计算请求参数：内置参数 + 调用方参数（调用方优先），再经过 process_params
    pub(crate) fn build_params(
        &self,
        builtin: Params,
        static_query: &Params,
        file: &FileContext,
        chunk: &ChunkContext,
        is_test: bool,
    ) -> Params {
        let mut params = builtin;
        params.extend(static_query.iter().map(|(k, v)| (k.clone(), v.clone())));
        if let Some(query) = &self.query {
            params.extend(query(file, chunk, is_test));
        }

        match &self.process_params {
            Some(process) => process(params, file, chunk, is_test),
            None => params,
        }
    }

    pub(crate) fn resolve_target(
        &self,
        default_target: &str,
        file: &FileContext,
        chunk: &ChunkContext,
        is_test: bool,
    ) -> String {
        match &self.target {
            Some(target) => target(file, chunk, is_test),
            None => default_target.to_string(),
        }
    }
}

impl fmt::Debug for UploadHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadHooks")
            .field("target", &self.target.is_some())
            .field("query", &self.query.is_some())
            .field("process_params", &self.process_params.is_some())
            .field("check_chunk_uploaded", &self.check_chunk_uploaded.is_some())
            .field("preprocess", &self.preprocess.is_some())
            .field("init_task", &self.init_task.is_some())
            .field("process_response", &self.process_response.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contexts() -> (FileContext, ChunkContext) {
        let file = FileContext {
            file_id: 1,
            identifier: "10-a.txt".to_string(),
            name: "a.txt".to_string(),
            size: 10,
            relative_path: "a.txt".to_string(),
            file_type: Some("txt".to_string()),
            chunk_size: 5,
            total_chunks: 2,
        };
        let chunk = ChunkContext {
            file_id: 1,
            offset: 1,
            start_byte: 5,
            end_byte: 10,
            retries: 0,
            tested: false,
        };
        (file, chunk)
    }

    #[test]
    fn test_caller_query_wins() {
        let (file, chunk) = contexts();
        let hooks = UploadHooks::new().with_query(|_, chunk, is_test| {
            let mut params = Params::new();
            params.insert("chunkNumber".to_string(), "override".to_string());
            params.insert("probe".to_string(), is_test.to_string());
            params.insert("offset".to_string(), chunk.offset.to_string());
            params
        });

        let mut builtin = Params::new();
        builtin.insert("chunkNumber".to_string(), "2".to_string());
        builtin.insert("filename".to_string(), "a.txt".to_string());

        let mut static_query = Params::new();
        static_query.insert("bucket".to_string(), "media".to_string());

        let params = hooks.build_params(builtin, &static_query, &file, &chunk, true);
        assert_eq!(params["chunkNumber"], "override");
        assert_eq!(params["filename"], "a.txt");
        assert_eq!(params["bucket"], "media");
        assert_eq!(params["probe"], "true");
        assert_eq!(params["offset"], "1");
    }

    #[test]
    fn test_process_params_and_target() {
        let (file, chunk) = contexts();
        let hooks = UploadHooks::new()
            .with_process_params(|mut params, file, _, _| {
                params.insert("name".to_string(), file.name.to_uppercase());
                params
            })
            .with_target(|file, _, is_test| {
                if is_test {
                    format!("/check/{}", file.identifier)
                } else {
                    "/upload".to_string()
                }
            });

        let params = hooks.build_params(Params::new(), &Params::new(), &file, &chunk, false);
        assert_eq!(params["name"], "A.TXT");
        assert_eq!(hooks.resolve_target("/", &file, &chunk, true), "/check/10-a.txt");
        assert_eq!(hooks.resolve_target("/", &file, &chunk, false), "/upload");
        assert_eq!(UploadHooks::new().resolve_target("/default", &file, &chunk, false), "/default");
    }
}
