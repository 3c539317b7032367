// 断点续传对账
//
// 配置了已上传判定时，用一个分片的响应推断同文件其它分片是否已在服务器上：
// - 确认存在的分片直接沿用该响应，状态读作 success，不再发请求
// - 触发对账的分片未被确认时丢弃其请求，回到 pending 重新上传
// - 访问过的分片都标记为已检测，因此每个分片只参与一次对账

use super::session::SessionCore;
use crate::uploader::chunk::ReadState;
use tracing::{debug, info};

impl SessionCore {
    /// 分片成功后对账并调度下一个分片
    pub(super) fn reconcile(&mut self, fi: usize, offset: usize) {
        let Some(check) = self.hooks.check_chunk_uploaded.clone() else {
            self.upload_next_chunk(fi);
            return;
        };

        let file = &mut self.files[fi];
        let trigger = &file.chunks[offset];
        let (Some(request_id), Some(kind), Some(response)) = (
            trigger.request_id(),
            trigger.request_kind(),
            trigger.response().cloned(),
        ) else {
            self.upload_next_chunk(fi);
            return;
        };

        let mut confirmed = 0;
        let mut released = 0;
        for index in 0..file.chunks.len() {
            if file.chunks[index].is_tested() {
                continue;
            }
            let Some(ctx) = file.chunk_context(index) else {
                continue;
            };
            let uploaded = check(&ctx, response.body.as_str());

            let chunk = &mut file.chunks[index];
            if index == offset {
                if !uploaded {
                    chunk.clear_request();
                }
            } else if uploaded {
                chunk.abort();
                if chunk.read_state() == ReadState::Reading {
                    chunk.fail_read();
                }
                chunk.adopt_response(request_id, kind, response.clone());
                released += chunk.release_bytes();
                confirmed += 1;
            }
            chunk.mark_tested();
        }

        let first_response = !file.first_response;
        file.first_response = true;
        let file_id = file.id();
        self.memory.release(released);

        if confirmed > 0 {
            info!("文件 {} 对账: {} 个分片已在服务器上", file_id, confirmed);
        }

        if first_response {
            debug!("文件 {} 收到首个响应，重新调度", file_id);
            self.refill_file(fi, offset);
        } else {
            self.upload_next_chunk(fi);
        }
    }
}
