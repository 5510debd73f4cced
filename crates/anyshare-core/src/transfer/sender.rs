//! 发送端
//!
//! 读取源文件，按块大小切分后通过数据通道发出。每发一块之前检查
//! `buffered_amount`，达到高水位时暂停，直到降到低水位以下再继续；
//! 暂停期间连接离开 `Connected` 会立即中止。

use bytes::{Bytes, BytesMut};
use log::{debug, info, warn};
use std::fmt;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;

use super::protocol::{self, ControlFrame, DEFAULT_MIME_TYPE};
use super::{Direction, TransferState};
use crate::config::TransferConfig;
use crate::error::{NotReadyCause, TransferError};
use crate::transport::{ConnectionState, DataChannel, DataFrame};

/// 待发送的文件
pub struct FileSource {
    name: String,
    size: u64,
    mime_type: String,
    reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl fmt::Debug for FileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSource")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("mime_type", &self.mime_type)
            .finish_non_exhaustive()
    }
}

impl FileSource {
    /// 打开本地文件，MIME 类型按扩展名推断
    pub async fn open(path: &Path) -> Result<Self, TransferError> {
        let file = tokio::fs::File::open(path).await?;
        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Err(TransferError::SourceReadFailed(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        let name = path
            .file_name()
            .map_or_else(|| "file".to_string(), |n| n.to_string_lossy().to_string());

        Ok(Self {
            mime_type: guess_mime(&name),
            name,
            size: metadata.len(),
            reader: Box::new(file),
        })
    }

    /// 内存中的数据；`mime_type` 为空时按文件名推断
    pub fn from_bytes(name: &str, mime_type: &str, data: Bytes) -> Self {
        let mime_type = if mime_type.is_empty() {
            guess_mime(name)
        } else {
            mime_type.to_string()
        };
        Self {
            name: name.to_string(),
            size: data.len() as u64,
            mime_type,
            reader: Box::new(Cursor::new(data)),
        }
    }

    /// 任意异步读取源，`size` 为将要读取的字节数
    pub fn from_reader(
        name: &str,
        size: u64,
        mime_type: &str,
        reader: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            size,
            mime_type: mime_type.to_string(),
            reader: Box::new(reader),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    async fn read_chunk(&mut self, len: usize) -> Result<Bytes, TransferError> {
        let mut buf = BytesMut::zeroed(len);
        self.reader.read_exact(&mut buf).await?;
        Ok(buf.freeze())
    }
}

fn guess_mime(name: &str) -> String {
    mime_guess::from_path(name)
        .first()
        .map_or_else(|| DEFAULT_MIME_TYPE.to_string(), |m| m.to_string())
}

/// 连接和通道状态对应的未就绪原因；就绪时为 `None`
fn not_ready_cause(channel_open: Option<bool>, connection: ConnectionState) -> Option<NotReadyCause> {
    if connection.is_lost() {
        return Some(NotReadyCause::PeerDisconnected);
    }
    match channel_open {
        None => Some(NotReadyCause::NeverOpened),
        Some(false) if connection == ConnectionState::Connected => {
            Some(NotReadyCause::ChannelClosed)
        }
        Some(false) => Some(NotReadyCause::NeverOpened),
        Some(true) if connection == ConnectionState::Connected => None,
        Some(true) => Some(NotReadyCause::NeverOpened),
    }
}

pub struct FileSender {
    config: TransferConfig,
    state: Arc<watch::Sender<TransferState>>,
}

impl FileSender {
    pub fn new(config: TransferConfig, state: Arc<watch::Sender<TransferState>>) -> Self {
        Self { config, state }
    }

    fn begin(&self, source: &FileSource) {
        self.state.send_replace(TransferState::started(
            Direction::Send,
            &source.name,
            source.size,
            &source.mime_type,
            protocol::total_chunks(source.size, self.config.chunk_size),
            self.config.chunk_size,
        ));
    }

    fn fail(&self, error: TransferError) -> TransferError {
        warn!("Send failed: {}", error);
        self.state.send_modify(|s| s.fail(error.clone()));
        error
    }

    /// 没有数据通道时直接拒绝，状态记为错误
    pub fn reject(
        &self,
        source: &FileSource,
        connection: &watch::Receiver<ConnectionState>,
    ) -> TransferError {
        let cause = not_ready_cause(None, *connection.borrow())
            .unwrap_or(NotReadyCause::NeverOpened);
        self.begin(source);
        self.fail(TransferError::ChannelNotReady(cause))
    }

    /// 发送整个文件；失败时状态为 `Error` 并返回原因，不重试
    pub async fn send(
        &self,
        mut source: FileSource,
        channel: Arc<dyn DataChannel>,
        mut connection: watch::Receiver<ConnectionState>,
    ) -> Result<(), TransferError> {
        self.begin(&source);

        // 块大小为零会在不发送任何数据的情况下报告完成
        if let Err(e) = self.config.validate() {
            return Err(self.fail(TransferError::InvalidConfig(e)));
        }

        let cause = not_ready_cause(Some(channel.is_open()), *connection.borrow_and_update());
        if let Some(cause) = cause {
            return Err(self.fail(TransferError::ChannelNotReady(cause)));
        }

        match self.stream(&mut source, &*channel, &mut connection).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn stream(
        &self,
        source: &mut FileSource,
        channel: &dyn DataChannel,
        connection: &mut watch::Receiver<ConnectionState>,
    ) -> Result<(), TransferError> {
        let chunk_size = self.config.chunk_size;
        let size = source.size;
        let total = protocol::total_chunks(size, chunk_size);

        info!(
            "Sending {} ({} bytes, {} chunks of {})",
            source.name, size, total, chunk_size
        );
        let metadata = ControlFrame::metadata(&source.name, size, &source.mime_type, chunk_size);
        self.send_frame(channel, connection, DataFrame::Text(metadata.to_json()))
            .await?;

        let started = Instant::now();
        let mut last_publish = started;
        let mut sent: u64 = 0;

        for index in 0..total {
            self.wait_for_drain(channel, connection).await?;

            let len = protocol::chunk_len(size, chunk_size, index);
            let chunk = source.read_chunk(len).await?;
            self.send_frame(channel, connection, DataFrame::Binary(chunk))
                .await?;
            sent += len as u64;

            if last_publish.elapsed() >= self.config.progress_interval() {
                last_publish = Instant::now();
                self.state
                    .send_modify(|s| s.record(sent, started.elapsed()));
            }

            let n = index + 1;
            if self.config.log_every_chunks > 0 && n % self.config.log_every_chunks == 0 {
                debug!("Sent chunk {}/{} ({} bytes)", n, total, sent);
            }
            if self.config.yield_every_chunks > 0 && n % self.config.yield_every_chunks == 0 {
                tokio::task::yield_now().await;
            }
        }

        self.send_frame(channel, connection, DataFrame::Text(ControlFrame::FileComplete.to_json()))
            .await?;

        self.state.send_modify(|s| {
            s.record(sent, started.elapsed());
            s.complete();
        });
        info!(
            "Sent {} in {:.2}s",
            source.name,
            started.elapsed().as_secs_f64()
        );
        Ok(())
    }

    async fn send_frame(
        &self,
        channel: &dyn DataChannel,
        connection: &watch::Receiver<ConnectionState>,
        frame: DataFrame,
    ) -> Result<(), TransferError> {
        if *connection.borrow() != ConnectionState::Connected {
            return Err(TransferError::PeerDisconnected);
        }
        channel.send(frame).await.map_err(|e| {
            debug!("Channel send failed: {}", e);
            if connection.borrow().is_lost() {
                TransferError::PeerDisconnected
            } else {
                TransferError::ChannelNotReady(NotReadyCause::ChannelClosed)
            }
        })
    }

    /// 背压: 缓冲达到高水位时暂停，降到低水位以下再返回
    async fn wait_for_drain(
        &self,
        channel: &dyn DataChannel,
        connection: &mut watch::Receiver<ConnectionState>,
    ) -> Result<(), TransferError> {
        let buffered = channel.buffered_amount().await;
        if buffered < self.config.high_water_mark {
            return Ok(());
        }

        debug!(
            "Backpressure: {} bytes buffered, pausing until below {}",
            buffered, self.config.low_water_mark
        );
        let poll = self.config.poll_interval();
        loop {
            if *connection.borrow_and_update() != ConnectionState::Connected {
                return Err(TransferError::PeerDisconnected);
            }
            if !channel.is_open() {
                return Err(TransferError::ChannelNotReady(NotReadyCause::ChannelClosed));
            }

            tokio::select! {
                () = tokio::time::sleep(poll) => {}
                changed = connection.changed() => {
                    if changed.is_err() {
                        return Err(TransferError::PeerDisconnected);
                    }
                    continue;
                }
            }

            if channel.buffered_amount().await < self.config.low_water_mark {
                debug!("Backpressure released");
                return Ok(());
            }
        }
    }
}
