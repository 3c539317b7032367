// 分片调度
//
// 每个文件独立计算并发预算：正在读取或上传的分片数不超过 simultaneous_uploads。
// 每个分片完成后由状态机调度同一文件的下一个 pending 分片。
//
// 启用已上传判定时，首个响应到达前同一文件只允许一个分片在途，
// 保证对账只基于一个确定的响应进行。

use super::session::SessionCore;
use crate::events::UploadEvent;
use crate::uploader::chunk::ChunkStatus;
use tracing::{debug, info};

impl SessionCore {
    /// 开始（或继续）上传文件
    pub(super) fn upload_file(&mut self, fi: usize) {
        if !self.has_free_slot(fi) {
            return;
        }

        let file_id = self.files[fi].id();
        self.emit(UploadEvent::UploadStart { file_id });

        let admitted = self.fill_file(fi, None);
        debug!("文件 {} 开始上传: 新增 {} 个分片", file_id, admitted);
    }

    /// 首个响应对账后重新调度，开始事件已推送过
    pub(super) fn refill_file(&mut self, fi: usize, trigger: usize) {
        if !self.has_free_slot(fi) {
            return;
        }

        let admitted = self.fill_file(fi, Some(trigger));
        debug!("文件 {} 对账后新增 {} 个分片", self.files[fi].id(), admitted);
    }

    fn has_free_slot(&self, fi: usize) -> bool {
        let file = &self.files[fi];
        if file.paused {
            debug!("文件 {} 已暂停，跳过调度", file.id());
            return false;
        }
        file.in_flight_count(&self.config) < self.config.simultaneous_uploads
    }

    /// 补齐并发预算；没有可发送的分片且全部检测过时进入完成判定
    fn fill_file(&mut self, fi: usize, trigger: Option<usize>) -> usize {
        let in_flight = self.files[fi].in_flight_count(&self.config);
        let admitted = self.fill_slots(fi, in_flight);
        if admitted == 0 && self.files[fi].all_tested() {
            self.complete_file(fi, trigger);
        }
        admitted
    }

    /// 在并发预算内依次发送 pending 分片，返回发送的分片数
    fn fill_slots(&mut self, fi: usize, in_flight: usize) -> usize {
        let budget = self.config.simultaneous_uploads.saturating_sub(in_flight);
        let mut admitted = 0;
        while admitted < budget && self.upload_next_chunk(fi) {
            admitted += 1;
        }
        admitted
    }

    /// 发送文件中第一个 pending 分片，返回是否发送
    pub(super) fn upload_next_chunk(&mut self, fi: usize) -> bool {
        let file = &self.files[fi];
        if file.paused || file.error {
            return false;
        }

        // 首个响应到达前串行
        if self.hooks.check_chunk_uploaded.is_some()
            && !file.first_response
            && file.in_flight_count(&self.config) > 0
        {
            return false;
        }

        let config = &self.config;
        let next = self.files[fi]
            .chunks
            .iter_mut()
            .position(|chunk| chunk.settle(config, false) == ChunkStatus::Pending);

        match next {
            Some(offset) => {
                self.send_chunk(fi, offset);
                true
            }
            None => false,
        }
    }

    /// 上传所有文件
    pub(super) fn upload_all(&mut self) {
        for fi in 0..self.files.len() {
            self.upload_file(fi);
        }
    }

    /// 并发数变化后，为正在上传的文件补齐预算
    pub(super) fn reschedule(&mut self) {
        for fi in 0..self.files.len() {
            let file = &self.files[fi];
            if file.paused || file.error || file.success_emitted {
                continue;
            }

            let in_flight = file.in_flight_count(&self.config);
            if in_flight == 0 {
                continue;
            }

            let admitted = self.fill_slots(fi, in_flight);
            if admitted > 0 {
                info!("文件 {} 按新并发数追加 {} 个分片", self.files[fi].id(), admitted);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::UploaderConfig;
    use crate::error::UploadError;
    use crate::events::UploadEvent;
    use crate::uploader::chunk::ChunkStatus;
    use crate::uploader::hooks::UploadHooks;
    use crate::uploader::session::Uploader;
    use crate::uploader::source::FileDescriptor;
    use crate::uploader::testing::{next_event, wait_for, wait_until};
    use crate::uploader::transport::testing::MockTransport;

    fn config(simultaneous_uploads: usize) -> UploaderConfig {
        UploaderConfig {
            chunk_size: 100,
            simultaneous_uploads,
            test_chunks: false,
            progress_callbacks_interval_ms: 0,
            ..UploaderConfig::default()
        }
    }

    #[tokio::test]
    async fn test_concurrency_limit_per_file() {
        let (transport, mut server) = MockTransport::new();
        let (uploader, mut events) =
            Uploader::start(config(2), UploadHooks::new(), transport).unwrap();
        let id = uploader
            .add_file(FileDescriptor::from_bytes("a.bin", vec![0u8; 500]))
            .await
            .unwrap()
            .unwrap();
        uploader.upload(id).unwrap();

        let first = server.next().await;
        let second = server.next().await;
        server.assert_idle().await;

        let snapshot = uploader.file_snapshot(id).await.unwrap();
        let uploading = snapshot
            .chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Uploading)
            .count();
        assert_eq!(uploading, 2);
        assert!(snapshot.uploading);

        first.respond(200, "ok");
        let third = server.next().await;
        server.assert_idle().await;

        second.respond(200, "ok");
        third.respond(200, "ok");
        server.next().await.respond(200, "ok");
        server.next().await.respond(200, "ok");

        wait_for(&mut events, |e| matches!(e, UploadEvent::FileSuccess { .. })).await;
        server.assert_idle().await;
    }

    #[tokio::test]
    async fn test_pause_resume_keeps_progress() {
        let (transport, mut server) = MockTransport::new();
        let (uploader, mut events) =
            Uploader::start(config(1), UploadHooks::new(), transport).unwrap();
        let id = uploader
            .add_file(FileDescriptor::from_bytes("a.bin", vec![0u8; 300]))
            .await
            .unwrap()
            .unwrap();
        uploader.upload(id).unwrap();

        server.next().await.respond(200, "ok");
        let second = server.next().await;
        assert_eq!(second.chunk_number(), 2);
        second.report_progress(50, 100);
        wait_for(&mut events, |e| match e {
            UploadEvent::FileProgress { progress, .. } => *progress >= 0.5,
            _ => false,
        })
        .await;

        uploader.pause(id).await.unwrap();
        wait_until(|| second.is_aborted()).await;

        let snapshot = uploader.file_snapshot(id).await.unwrap();
        assert!(snapshot.paused);
        assert!(snapshot.aborted);
        assert!(!snapshot.uploading);
        assert_eq!(snapshot.chunks[1].status, ChunkStatus::Pending);
        assert_eq!(snapshot.progress, 0.5);
        assert_eq!(snapshot.current_speed, 0.0);
        server.assert_idle().await;

        uploader.resume(id).await.unwrap();
        let resent = server.next().await;
        assert_eq!(resent.chunk_number(), 2);
        resent.respond(200, "ok");
        server.next().await.respond(200, "ok");

        let mut last = 0.0;
        loop {
            match next_event(&mut events).await {
                UploadEvent::FileProgress { progress, .. } => {
                    assert!(progress >= last, "progress went back: {} -> {}", last, progress);
                    last = progress;
                }
                UploadEvent::FileSuccess { .. } => break,
                _ => {}
            }
        }
        assert_eq!(last, 1.0);
    }

    #[tokio::test]
    async fn test_paused_file_is_not_scheduled() {
        let (transport, mut server) = MockTransport::new();
        let config = UploaderConfig {
            initial_paused: true,
            ..config(1)
        };
        let (uploader, _events) = Uploader::start(config, UploadHooks::new(), transport).unwrap();
        let id = uploader
            .add_file(FileDescriptor::from_bytes("a.bin", vec![0u8; 150]))
            .await
            .unwrap()
            .unwrap();

        uploader.upload_all().unwrap();
        server.assert_idle().await;
        assert!(uploader.file_snapshot(id).await.unwrap().paused);

        uploader.resume(id).await.unwrap();
        assert_eq!(server.next().await.chunk_number(), 1);
    }

    #[tokio::test]
    async fn test_cancel_removes_file() {
        let (transport, mut server) = MockTransport::new();
        let (uploader, mut events) =
            Uploader::start(config(2), UploadHooks::new(), transport).unwrap();
        let id = uploader
            .add_file(FileDescriptor::from_bytes("a.bin", vec![0u8; 300]))
            .await
            .unwrap()
            .unwrap();
        uploader.upload(id).unwrap();

        let first = server.next().await;
        let second = server.next().await;
        uploader.cancel(id).await.unwrap();

        wait_for(&mut events, |e| *e == UploadEvent::FileRemoved { file_id: id }).await;
        wait_until(|| first.is_aborted() && second.is_aborted()).await;
        server.assert_idle().await;

        assert!(matches!(
            uploader.file_snapshot(id).await,
            Err(UploadError::FileNotFound(_))
        ));
        assert!(matches!(
            uploader.cancel(id).await,
            Err(UploadError::FileNotFound(_))
        ));
        assert_eq!(uploader.memory_usage().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_raise_simultaneous_uploads() {
        let (transport, mut server) = MockTransport::new();
        let (uploader, mut events) =
            Uploader::start(config(1), UploadHooks::new(), transport).unwrap();
        let id = uploader
            .add_file(FileDescriptor::from_bytes("a.bin", vec![0u8; 400]))
            .await
            .unwrap()
            .unwrap();
        uploader.upload(id).unwrap();

        let first = server.next().await;
        server.assert_idle().await;

        uploader.set_simultaneous_uploads(3).await.unwrap();
        let second = server.next().await;
        let third = server.next().await;
        server.assert_idle().await;

        let mut numbers = vec![first.chunk_number(), second.chunk_number(), third.chunk_number()];
        numbers.sort();
        assert_eq!(numbers, vec![1, 2, 3]);

        assert!(matches!(
            uploader.set_simultaneous_uploads(0).await,
            Err(UploadError::Config(_))
        ));

        first.respond(200, "ok");
        second.respond(200, "ok");
        third.respond(200, "ok");
        server.next().await.respond(200, "ok");
        wait_for(&mut events, |e| matches!(e, UploadEvent::FileSuccess { .. })).await;
    }

    #[tokio::test]
    async fn test_upload_all_files_and_empty_file() {
        let (transport, mut server) = MockTransport::new();
        let (uploader, mut events) =
            Uploader::start(config(1), UploadHooks::new(), transport).unwrap();
        let ids = uploader
            .add_files(vec![
                FileDescriptor::from_bytes("a.bin", vec![0u8; 50]),
                FileDescriptor::from_bytes("empty.txt", Vec::new()),
            ])
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);
        uploader.upload_all().unwrap();

        let first = server.next().await;
        let second = server.next().await;
        let mut names = vec![
            first.request.param("filename").unwrap().to_string(),
            second.request.param("filename").unwrap().to_string(),
        ];
        names.sort();
        assert_eq!(names, vec!["a.bin", "empty.txt"]);

        first.respond(200, "ok");
        second.respond(200, "ok");

        let mut done = Vec::new();
        while done.len() < 2 {
            if let UploadEvent::FileSuccess { file_id, .. } = next_event(&mut events).await {
                done.push(file_id);
            }
        }
        done.sort();
        assert_eq!(done, ids);
    }
}
