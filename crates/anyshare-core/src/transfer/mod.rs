//! 文件传输模块
//!
//! 包含:
//! - 数据通道上的帧协议 (`FILE_METADATA` / 二进制块 / `FILE_COMPLETE`)
//! - 带背压的发送端
//! - 按到达顺序重组的接收端
//!
//! 传输状态通过 `watch` 通道发布给观察者。同一时刻只有一个方向的传输。

pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod utils;

pub use protocol::ControlFrame;
pub use receiver::{FileReceiver, ReceivedFile};
pub use sender::{FileSender, FileSource};

use log::warn;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::transport::{ConnectionState, DataChannel, DataFrame};

/// 传输方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

/// 传输状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferStatus {
    #[default]
    Idle,
    InProgress,
    Complete,
    Error,
}

/// 对外发布的传输状态快照
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TransferState {
    pub direction: Option<Direction>,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub total_chunks: u64,
    pub bytes_transferred: u64,
    pub chunk_size: usize,
    pub status: TransferStatus,
    /// 0..=100
    pub progress: u8,
    /// 字节/秒，从开始到现在的平均值
    pub speed: f64,
    pub error: Option<TransferError>,
}

impl TransferState {
    /// 新传输开始时的状态
    pub fn started(
        direction: Direction,
        file_name: &str,
        file_size: u64,
        mime_type: &str,
        total_chunks: u64,
        chunk_size: usize,
    ) -> Self {
        Self {
            direction: Some(direction),
            file_name: file_name.to_string(),
            file_size,
            mime_type: mime_type.to_string(),
            total_chunks,
            chunk_size,
            status: TransferStatus::InProgress,
            ..Default::default()
        }
    }

    /// 更新字节数，并重新计算进度和速度
    pub fn record(&mut self, bytes_transferred: u64, elapsed: Duration) {
        self.bytes_transferred = bytes_transferred;
        self.progress = progress_percent(bytes_transferred, self.file_size);
        self.speed = average_speed(bytes_transferred, elapsed);
    }

    pub fn complete(&mut self) {
        self.status = TransferStatus::Complete;
        self.progress = 100;
    }

    pub fn fail(&mut self, error: TransferError) {
        self.status = TransferStatus::Error;
        self.error = Some(error);
    }

    pub fn is_active(&self) -> bool {
        self.status == TransferStatus::InProgress
    }

    /// 按当前速度估计的剩余秒数
    pub fn remaining_secs(&self) -> f64 {
        if self.speed <= 0.0 {
            return f64::INFINITY;
        }
        self.file_size.saturating_sub(self.bytes_transferred) as f64 / self.speed
    }
}

/// round(bytes / size * 100)，空文件视为 100
pub fn progress_percent(bytes: u64, size: u64) -> u8 {
    if size == 0 {
        return 100;
    }
    let percent = (bytes as f64 / size as f64 * 100.0).round();
    percent.clamp(0.0, 100.0) as u8
}

pub fn average_speed(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    bytes as f64 / secs
}

/// 传输引擎: 拥有传输状态、接收端和正在运行的发送任务
pub struct TransferEngine {
    config: TransferConfig,
    state: Arc<watch::Sender<TransferState>>,
    receiver: FileReceiver,
    sending: Option<JoinHandle<()>>,
}

impl TransferEngine {
    pub fn new(config: TransferConfig) -> Self {
        let (tx, _) = watch::channel(TransferState::default());
        let state = Arc::new(tx);
        let receiver = FileReceiver::new(config.clone(), state.clone());
        Self {
            config,
            state,
            receiver,
            sending: None,
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn state(&self) -> TransferState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TransferState> {
        self.state.subscribe()
    }

    pub fn is_sending(&self) -> bool {
        self.sending.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// 在独立任务中发送文件，结束后通过 `reply` 返回结果
    ///
    /// 前置条件不满足时立即返回错误（并写入状态），不会启动任务。
    pub fn start_send(
        &mut self,
        source: FileSource,
        channel: Option<Arc<dyn DataChannel>>,
        connection: watch::Receiver<ConnectionState>,
        reply: oneshot::Sender<Result<(), TransferError>>,
    ) {
        if self.is_sending() || self.state.borrow().is_active() {
            let _ = reply.send(Err(TransferError::AlreadyInProgress));
            return;
        }

        let sender = FileSender::new(self.config.clone(), self.state.clone());
        let Some(channel) = channel else {
            let _ = reply.send(Err(sender.reject(&source, &connection)));
            return;
        };

        self.sending = Some(tokio::spawn(async move {
            let result = sender.send(source, channel, connection).await;
            let _ = reply.send(result);
        }));
    }

    /// 处理数据通道收到的一帧
    pub fn on_frame(&mut self, frame: DataFrame) {
        if self.is_sending() {
            warn!("Inbound frame ({} bytes) dropped while sending", frame.len());
            return;
        }
        self.receiver.on_frame(frame);
    }

    /// 连接丢失: 正在进行的接收以错误结束（发送任务自己感知断线）
    pub fn on_connection_lost(&mut self) {
        if !self.is_sending() && self.state.borrow().is_active() {
            self.receiver.fail(TransferError::PeerDisconnected);
        }
    }

    /// 取出已完成的接收文件并释放缓冲
    pub fn materialize(&mut self) -> Result<ReceivedFile, TransferError> {
        self.receiver.materialize()
    }

    /// 中止发送任务，清空接收缓冲和状态
    pub fn reset(&mut self) {
        if let Some(handle) = self.sending.take() {
            handle.abort();
        }
        self.receiver.reset();
        self.state.send_replace(TransferState::default());
    }
}

impl Drop for TransferEngine {
    fn drop(&mut self) {
        if let Some(handle) = self.sending.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NotReadyCause;
    use crate::testing::ScriptedChannel;
    use bytes::Bytes;

    #[test]
    fn test_progress_percent_rounds() {
        assert_eq!(progress_percent(0, 200), 0);
        assert_eq!(progress_percent(1, 200), 1);
        assert_eq!(progress_percent(199, 200), 100);
        assert_eq!(progress_percent(65_536, 204_800), 32);
        assert_eq!(progress_percent(0, 0), 100);
    }

    #[test]
    fn test_speed_is_cumulative_average() {
        assert!((average_speed(1000, Duration::from_secs(2)) - 500.0).abs() < f64::EPSILON);
        assert!(average_speed(1000, Duration::ZERO).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_send_without_channel_reports_never_opened() {
        let mut engine = TransferEngine::new(TransferConfig::default());
        let (_conn_tx, conn_rx) = watch::channel(ConnectionState::New);
        let (reply_tx, reply_rx) = oneshot::channel();

        let source = FileSource::from_bytes("a.txt", "text/plain", Bytes::from_static(b"abc"));
        engine.start_send(source, None, conn_rx, reply_tx);

        assert_eq!(
            reply_rx.await.unwrap(),
            Err(TransferError::ChannelNotReady(NotReadyCause::NeverOpened))
        );
        let state = engine.state();
        assert_eq!(state.status, TransferStatus::Error);
        assert_eq!(state.file_name, "a.txt");
    }

    #[tokio::test]
    async fn test_second_send_is_rejected_while_running() {
        let mut engine = TransferEngine::new(TransferConfig {
            high_water_mark: 100,
            low_water_mark: 50,
            backpressure_poll_interval_ms: 1,
            ..Default::default()
        });
        // 缓冲一直高于高水位，第一次发送会停在背压等待里
        let channel = ScriptedChannel::new("fileTransfer");
        channel.set_fallback(1_000);
        let dc: Arc<dyn DataChannel> = channel;
        let (conn_tx, conn_rx) = watch::channel(ConnectionState::Connected);

        let (first_tx, first_rx) = oneshot::channel();
        let source = FileSource::from_bytes("big.bin", "", Bytes::from(vec![0u8; 10]));
        engine.start_send(source, Some(dc.clone()), conn_rx.clone(), first_tx);

        let (second_tx, second_rx) = oneshot::channel();
        let source = FileSource::from_bytes("other.bin", "", Bytes::from(vec![0u8; 10]));
        engine.start_send(source, Some(dc), conn_rx, second_tx);
        assert_eq!(second_rx.await.unwrap(), Err(TransferError::AlreadyInProgress));

        conn_tx.send_replace(ConnectionState::Disconnected);
        assert_eq!(first_rx.await.unwrap(), Err(TransferError::PeerDisconnected));
    }

    #[tokio::test]
    async fn test_reset_clears_state() {
        let mut engine = TransferEngine::new(TransferConfig::default());
        engine.on_frame(DataFrame::Text(
            ControlFrame::metadata("a.bin", 3, "application/octet-stream", 64 * 1024).to_json(),
        ));
        assert!(engine.state().is_active());

        engine.reset();
        assert_eq!(engine.state(), TransferState::default());
        assert_eq!(engine.materialize(), Err(TransferError::NothingToMaterialize));
    }
}
