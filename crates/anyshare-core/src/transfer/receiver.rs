//! 接收端
//!
//! 收到 `FILE_METADATA` 时重置缓冲并开始计时；二进制帧按到达顺序追加；
//! `FILE_COMPLETE` 时标记完成。`materialize()` 拼接所有块并释放缓冲。

use bytes::{Bytes, BytesMut};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

use super::protocol::ControlFrame;
use super::{Direction, TransferState, TransferStatus};
use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::transport::DataFrame;

/// 接收完成后取出的文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub name: String,
    pub mime_type: String,
    pub data: Bytes,
}

impl ReceivedFile {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// 去掉路径部分后的文件名，防止写出目标目录
    pub fn safe_name(&self) -> String {
        let name = self
            .name
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or_default()
            .trim();
        if name.is_empty() || name == "." || name == ".." {
            "received.bin".to_string()
        } else {
            name.to_string()
        }
    }

    /// 写入目录，返回实际路径
    pub async fn save_to(&self, dir: &Path) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(self.safe_name());
        tokio::fs::write(&path, &self.data).await?;
        info!("Saved {} ({} bytes) to {:?}", self.name, self.data.len(), path);
        Ok(path)
    }
}

pub struct FileReceiver {
    config: TransferConfig,
    state: Arc<watch::Sender<TransferState>>,
    chunks: Vec<Bytes>,
    received: u64,
    started: Option<Instant>,
}

impl FileReceiver {
    pub fn new(config: TransferConfig, state: Arc<watch::Sender<TransferState>>) -> Self {
        Self {
            config,
            state,
            chunks: Vec::new(),
            received: 0,
            started: None,
        }
    }

    pub fn on_frame(&mut self, frame: DataFrame) {
        match frame {
            DataFrame::Text(text) => match ControlFrame::parse(&text) {
                Some(control) => self.on_control(control),
                None => debug!("Ignoring unrecognized text frame: {}", text),
            },
            DataFrame::Binary(chunk) => self.on_chunk(chunk),
        }
    }

    fn on_control(&mut self, control: ControlFrame) {
        match control {
            ControlFrame::FileMetadata {
                name,
                size,
                mime_type,
                total_chunks,
            } => {
                info!(
                    "Receiving {} ({} bytes, {} chunks)",
                    name, size, total_chunks
                );
                self.chunks.clear();
                self.received = 0;
                self.started = Some(Instant::now());
                self.state.send_replace(TransferState::started(
                    Direction::Receive,
                    &name,
                    size,
                    &mime_type,
                    total_chunks,
                    self.config.chunk_size,
                ));
            }
            ControlFrame::FileComplete => self.on_complete(),
        }
    }

    fn on_chunk(&mut self, chunk: Bytes) {
        let Some(started) = self.started else {
            warn!("Dropping {} byte chunk: no transfer in progress", chunk.len());
            return;
        };
        if !self.state.borrow().is_active() {
            warn!("Dropping {} byte chunk: transfer already finished", chunk.len());
            return;
        }

        self.received += chunk.len() as u64;
        self.chunks.push(chunk);

        let received = self.received;
        self.state
            .send_modify(|s| s.record(received, started.elapsed()));

        let n = self.chunks.len() as u64;
        if self.config.log_every_chunks > 0 && n % self.config.log_every_chunks == 0 {
            debug!("Received chunk {} ({} bytes)", n, received);
        }
    }

    fn on_complete(&mut self) {
        if !self.state.borrow().is_active() {
            warn!("FILE_COMPLETE without a transfer in progress");
            return;
        }

        let expected = self.state.borrow().file_size;
        let received = self.received;
        if received != expected {
            if self.config.strict_size_check {
                self.fail(TransferError::Truncated { expected, received });
                return;
            }
            warn!(
                "Size mismatch on completion: expected {} bytes, received {}",
                expected, received
            );
        }

        // 速度在完成时冻结
        self.state.send_modify(TransferState::complete);
        info!("Received file complete ({} bytes)", received);
    }

    /// 以错误结束当前接收
    pub fn fail(&mut self, error: TransferError) {
        warn!("Receive failed: {}", error);
        self.started = None;
        self.state.send_modify(|s| s.fail(error));
    }

    pub fn materialize(&mut self) -> Result<ReceivedFile, TransferError> {
        let state = self.state.borrow().clone();
        if state.status != TransferStatus::Complete
            || state.direction != Some(Direction::Receive)
            || self.chunks.is_empty()
        {
            return Err(TransferError::NothingToMaterialize);
        }

        let chunks = std::mem::take(&mut self.chunks);
        let total: usize = chunks.iter().map(Bytes::len).sum();
        let mut data = BytesMut::with_capacity(total);
        for chunk in chunks {
            data.extend_from_slice(&chunk);
        }
        self.started = None;

        Ok(ReceivedFile {
            name: state.file_name,
            mime_type: state.mime_type,
            data: data.freeze(),
        })
    }

    pub fn reset(&mut self) {
        self.chunks.clear();
        self.received = 0;
        self.started = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receiver(config: TransferConfig) -> (FileReceiver, watch::Receiver<TransferState>) {
        let (tx, rx) = watch::channel(TransferState::default());
        (FileReceiver::new(config, Arc::new(tx)), rx)
    }

    fn metadata(name: &str, size: u64) -> DataFrame {
        DataFrame::Text(ControlFrame::metadata(name, size, "text/plain", 4).to_json())
    }

    fn complete() -> DataFrame {
        DataFrame::Text(ControlFrame::FileComplete.to_json())
    }

    #[test]
    fn test_reassembles_in_arrival_order() {
        let (mut rx, state) = receiver(TransferConfig::default());
        rx.on_frame(metadata("hello.txt", 10));
        assert_eq!(state.borrow().status, TransferStatus::InProgress);

        rx.on_frame(DataFrame::Binary(Bytes::from_static(b"hell")));
        rx.on_frame(DataFrame::Binary(Bytes::from_static(b"o wo")));
        assert_eq!(state.borrow().bytes_transferred, 8);
        assert_eq!(state.borrow().progress, 80);

        rx.on_frame(DataFrame::Binary(Bytes::from_static(b"rl")));
        rx.on_frame(complete());
        assert_eq!(state.borrow().status, TransferStatus::Complete);
        assert_eq!(state.borrow().progress, 100);

        let file = rx.materialize().unwrap();
        assert_eq!(file.name, "hello.txt");
        assert_eq!(file.mime_type, "text/plain");
        assert_eq!(&file.data[..], b"hello worl");

        // 缓冲已释放
        assert_eq!(rx.materialize(), Err(TransferError::NothingToMaterialize));
    }

    #[test]
    fn test_materialize_before_complete_fails() {
        let (mut rx, _state) = receiver(TransferConfig::default());
        assert_eq!(rx.materialize(), Err(TransferError::NothingToMaterialize));

        rx.on_frame(metadata("a.txt", 4));
        rx.on_frame(DataFrame::Binary(Bytes::from_static(b"ab")));
        assert_eq!(rx.materialize(), Err(TransferError::NothingToMaterialize));
    }

    #[test]
    fn test_empty_file_completes_but_has_nothing_to_materialize() {
        let (mut rx, state) = receiver(TransferConfig::default());
        rx.on_frame(metadata("empty.txt", 0));
        rx.on_frame(complete());
        assert_eq!(state.borrow().status, TransferStatus::Complete);
        assert_eq!(rx.materialize(), Err(TransferError::NothingToMaterialize));
    }

    #[test]
    fn test_new_metadata_resets_buffer() {
        let (mut rx, state) = receiver(TransferConfig::default());
        rx.on_frame(metadata("first.txt", 4));
        rx.on_frame(DataFrame::Binary(Bytes::from_static(b"xx")));

        rx.on_frame(metadata("second.txt", 2));
        rx.on_frame(DataFrame::Binary(Bytes::from_static(b"ok")));
        rx.on_frame(complete());

        assert_eq!(state.borrow().file_name, "second.txt");
        assert_eq!(&rx.materialize().unwrap().data[..], b"ok");
    }

    #[test]
    fn test_garbage_and_stray_chunks_are_ignored() {
        let (mut rx, state) = receiver(TransferConfig::default());
        rx.on_frame(DataFrame::Text("not json".to_string()));
        rx.on_frame(DataFrame::Text(r#"{"type":"PING"}"#.to_string()));
        rx.on_frame(DataFrame::Binary(Bytes::from_static(b"stray")));
        assert_eq!(*state.borrow(), TransferState::default());
    }

    #[test]
    fn test_size_mismatch_is_tolerated_by_default() {
        let (mut rx, state) = receiver(TransferConfig::default());
        rx.on_frame(metadata("a.txt", 10));
        rx.on_frame(DataFrame::Binary(Bytes::from_static(b"abc")));
        rx.on_frame(complete());
        assert_eq!(state.borrow().status, TransferStatus::Complete);
        assert_eq!(rx.materialize().unwrap().size(), 3);
    }

    #[test]
    fn test_strict_size_check_reports_truncation() {
        let config = TransferConfig {
            strict_size_check: true,
            ..Default::default()
        };
        let (mut rx, state) = receiver(config);
        rx.on_frame(metadata("a.txt", 10));
        rx.on_frame(DataFrame::Binary(Bytes::from_static(b"abc")));
        rx.on_frame(complete());

        let state = state.borrow().clone();
        assert_eq!(state.status, TransferStatus::Error);
        assert_eq!(
            state.error,
            Some(TransferError::Truncated {
                expected: 10,
                received: 3
            })
        );
        assert_eq!(rx.materialize(), Err(TransferError::NothingToMaterialize));
    }

    #[tokio::test]
    async fn test_save_strips_directories_from_name() {
        let dir = tempfile::tempdir().unwrap();
        let file = ReceivedFile {
            name: "../../etc/passwd".to_string(),
            mime_type: "text/plain".to_string(),
            data: Bytes::from_static(b"root"),
        };
        assert_eq!(file.safe_name(), "passwd");

        let path = file.save_to(dir.path()).await.unwrap();
        assert_eq!(path, dir.path().join("passwd"));
        assert_eq!(std::fs::read(&path).unwrap(), b"root");

        let odd = ReceivedFile {
            name: "..".to_string(),
            ..file
        };
        assert_eq!(odd.safe_name(), "received.bin");
    }
}
