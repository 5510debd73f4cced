//! WebSocket 信令链路
//!
//! 连接 `{ws_url}?token={token}`，每个信封是一条 JSON 文本消息。
//! 写方向由独立任务从无界队列取出发送，`send()` 因此是同步的；
//! 读方向解析后送入 [`SignalReceiver`]，无法解析的消息记录后跳过。

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use super::{SignalMessage, SignalReceiver, SignalingLink};
use crate::error::SignalingError;

pub struct WsSignalingLink {
    outbound: mpsc::UnboundedSender<Message>,
    open: Arc<AtomicBool>,
}

impl WsSignalingLink {
    /// 拼接带 token 的连接地址
    pub fn url_with_token(ws_url: &str, token: &str) -> String {
        let separator = if ws_url.contains('?') { '&' } else { '?' };
        format!("{ws_url}{separator}token={token}")
    }

    /// 建立连接，返回链路和入站信封流
    pub async fn connect(
        ws_url: &str,
        token: &str,
    ) -> Result<(Self, SignalReceiver), SignalingError> {
        let url = Self::url_with_token(ws_url, token);
        info!("Connecting to signaling server: {}", ws_url);

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| SignalingError::Connect(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let open = Arc::new(AtomicBool::new(true));
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        // 写任务
        let writer_open = open.clone();
        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let is_close = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    warn!("Signaling write failed: {}", e);
                    break;
                }
                if is_close {
                    break;
                }
            }
            writer_open.store(false, Ordering::SeqCst);
            let _ = write.close().await;
            debug!("Signaling writer stopped");
        });

        // 读任务
        let reader_open = open.clone();
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(frame)) => {
                        info!("Signaling server closed the connection: {:?}", frame);
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        error!("Signaling read error: {}", e);
                        break;
                    }
                };

                match SignalMessage::from_json(&text) {
                    Ok(message) => {
                        debug!("Signal received: {:?}", message.kind);
                        if inbound_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Skipping invalid signaling message: {} ({})", text, e),
                }
            }
            reader_open.store(false, Ordering::SeqCst);
            debug!("Signaling reader stopped");
        });

        Ok((
            Self {
                outbound: outbound_tx,
                open,
            },
            inbound_rx,
        ))
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }

    /// 发送关闭帧，入站流随后结束
    pub fn close(&self) {
        let _ = self.outbound.send(Message::Close(None));
    }
}

impl SignalingLink for WsSignalingLink {
    fn send(&self, message: SignalMessage) -> bool {
        if !self.is_open() {
            return false;
        }
        match message.to_json() {
            Ok(json) => self.outbound.send(Message::Text(json)).is_ok(),
            Err(e) => {
                error!("Failed to encode signaling message: {}", e);
                false
            }
        }
    }
}

impl Drop for WsSignalingLink {
    fn drop(&mut self) {
        self.close();
    }
}
